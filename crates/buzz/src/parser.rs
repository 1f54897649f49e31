//! Parser and type checker.
//!
//! Statements parse by recursive descent; expressions use a Pratt climber
//! over the token stream. The parser does the whole front-end job in one
//! pass: it resolves names to slots (locals, Lua-style threaded upvalues, or
//! module globals), assigns every expression a [`TypeId`], creates
//! placeholders for forward-referenced type names and links them when the
//! declaration arrives, and folds default-value fragments into call sites so
//! the code generator can evaluate them freshly per call.
//!
//! Errors accumulate; the parser synchronizes at statement boundaries and
//! keeps going, and a module with any reported error is never executed.

use std::mem;
use std::path::{Path, PathBuf};

use ahash::AHashMap;

use crate::{
    ast::{
        BinaryOp, Block, DotKind, EndedLocal, EnumDeclAst, ExportedGlobal, Expr, ExprKind,
        FieldDecl, FunctionAst, ModuleAst, ObjectDeclAst, Param, Slot, Stmt, StmtKind, UnaryOp,
        UpvalDesc,
    },
    error::{CompileError, CompileErrorKind, Span},
    intern::NameId,
    lexer::{self, StrSegment, Token, TokenKind},
    run::Shared,
    typedef::{FunctionKind, FunctionType, ObjectId, TypeDesc, TypeId},
};

/// Upper bound on locals and upvalues per function; slots are one byte.
const MAX_LOCALS: usize = 255;
const MAX_UPVALUES: usize = 255;

/// A symbol in a module's global namespace.
#[derive(Debug, Clone)]
pub(crate) struct GlobalSym {
    pub name: NameId,
    pub ty: TypeId,
    pub slot: u32,
    pub constant: bool,
    pub kind: SymbolKind,
}

/// What a global binds, with the compile-time extras each kind carries.
#[derive(Debug, Clone)]
pub(crate) enum SymbolKind {
    Var,
    /// Declared or native function; fragments for defaulted parameters.
    Function { defaults: Vec<Option<Expr>> },
    Object(ObjectId),
    Enum(crate::typedef::EnumId),
}

// Binding powers, low to high.
const P_NONE: u8 = 0;
const P_OR: u8 = 2;
const P_AND: u8 = 3;
const P_BIT_OR: u8 = 4;
const P_BIT_XOR: u8 = 5;
const P_BIT_AND: u8 = 6;
const P_EQUAL: u8 = 7;
const P_CMP: u8 = 8;
const P_SHIFT: u8 = 9;
const P_RANGE: u8 = 10;
const P_TERM: u8 = 11;
const P_FACTOR: u8 = 12;
const P_UNARY: u8 = 13;
const P_CALL: u8 = 14;

/// One local variable in a function frame.
#[derive(Debug, Clone)]
struct LocalVar {
    name: NameId,
    depth: u32,
    ty: TypeId,
    constant: bool,
    captured: bool,
    initialized: bool,
}

/// One captured-variable record of a function frame.
#[derive(Debug, Clone)]
struct UpvalInfo {
    desc: UpvalDesc,
    name: NameId,
    ty: TypeId,
    constant: bool,
}

/// Per-function parser state: locals, upvalues, and the enclosing-frame link
/// implied by position in the parser's frame stack.
#[derive(Debug)]
struct FunFrame {
    locals: Vec<LocalVar>,
    upvalues: Vec<UpvalInfo>,
    scope_depth: u32,
    kind: FunctionKind,
    return_type: TypeId,
}

/// Loop context for `break`/`continue` bookkeeping.
#[derive(Debug, Clone, Copy)]
struct LoopCtx {
    /// Number of frame locals live at the top of the loop body; break and
    /// continue discard anything deeper.
    local_floor: usize,
    /// Frame index the loop belongs to, so a `break` inside a nested
    /// function does not target an outer loop.
    frame: usize,
}

/// Parses one module to a typed AST.
///
/// Returns the module (when structurally parseable) and every accumulated
/// error; callers must treat a non-empty error list as fatal regardless of
/// whether an AST came back.
pub(crate) fn parse_module(
    source: &str,
    path: Option<&Path>,
    kind: FunctionKind,
    shared: &mut Shared,
) -> (Option<ModuleAst>, Vec<CompileError>) {
    let (tokens, mut errors) = lexer::lex(source);
    let mut parser = Parser::new(tokens, path, kind, shared);
    let module = parser.run();
    errors.extend(parser.errors);
    (module, errors)
}

struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    shared: &'a mut Shared,
    path: Option<PathBuf>,
    kind: FunctionKind,
    errors: Vec<CompileError>,
    panic_mode: bool,
    frames: Vec<FunFrame>,
    globals: Vec<GlobalSym>,
    namespaces: AHashMap<NameId, Vec<GlobalSym>>,
    exports: Vec<ExportedGlobal>,
    tests: Vec<(u32, Box<str>)>,
    main_slot: Option<u32>,
    /// Forward type references by name, all sharing one placeholder.
    pending_types: AHashMap<NameId, TypeId>,
    /// Object whose methods are currently being parsed.
    current_object: Option<ObjectId>,
    loops: Vec<LoopCtx>,
    test_counter: u32,
}

impl<'a> Parser<'a> {
    fn new(
        tokens: Vec<Token>,
        path: Option<&Path>,
        kind: FunctionKind,
        shared: &'a mut Shared,
    ) -> Self {
        let void = shared.registry.prim().void;
        let globals = shared.prelude.clone();
        Self {
            tokens,
            pos: 0,
            shared,
            path: path.map(Path::to_path_buf),
            kind,
            errors: Vec::new(),
            panic_mode: false,
            frames: vec![FunFrame {
                locals: vec![LocalVar {
                    name: NameId::default(),
                    depth: 0,
                    ty: void,
                    constant: true,
                    captured: false,
                    initialized: true,
                }],
                upvalues: Vec::new(),
                scope_depth: 0,
                kind,
                return_type: void,
            }],
            globals,
            namespaces: AHashMap::new(),
            exports: Vec::new(),
            tests: Vec::new(),
            main_slot: None,
            pending_types: AHashMap::new(),
            current_object: None,
            loops: Vec::new(),
            test_counter: 0,
        }
    }

    fn run(&mut self) -> Option<ModuleAst> {
        let mut statements = Vec::new();
        while !self.check(&TokenKind::Eof) {
            if let Some(stmt) = self.declaration() {
                statements.push(stmt);
            }
            if self.panic_mode {
                self.synchronize();
            }
        }
        self.check_unresolved_types();

        let void = self.shared.registry.prim().void;
        let name = self.shared.interns.well_known().script;
        let type_id = self.shared.registry.intern(
            TypeDesc::Function(FunctionType {
                name: Some(name),
                params: Vec::new(),
                defaults: Vec::new(),
                ret: void,
                kind: self.kind,
            }),
            false,
        );
        let frame = self.frames.pop().expect("script frame missing");
        let function = FunctionAst {
            name,
            kind: self.kind,
            type_id,
            return_type: void,
            params: Vec::new(),
            body: Block {
                statements,
                ended: Vec::new(),
            },
            upvalues: Vec::new(),
            test_name: None,
            span: Span::new(1, 1),
        };
        debug_assert!(frame.upvalues.is_empty(), "script frame captured upvalues");

        Some(ModuleAst {
            function,
            exports: mem::take(&mut self.exports),
            tests: mem::take(&mut self.tests),
            main_slot: self.main_slot,
        })
    }

    // ----- token plumbing -------------------------------------------------

    fn peek(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn peek_kind(&self) -> &TokenKind {
        &self.peek().kind
    }

    fn peek_at(&self, offset: usize) -> &TokenKind {
        let idx = (self.pos + offset).min(self.tokens.len() - 1);
        &self.tokens[idx].kind
    }

    fn previous_span(&self) -> Span {
        self.tokens[self.pos.saturating_sub(1)].span
    }

    fn current_span(&self) -> Span {
        self.peek().span
    }

    fn advance(&mut self) -> Token {
        let token = self.tokens[self.pos.min(self.tokens.len() - 1)].clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn check(&self, kind: &TokenKind) -> bool {
        mem::discriminant(self.peek_kind()) == mem::discriminant(kind)
    }

    fn matches(&mut self, kind: &TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn consume(&mut self, kind: &TokenKind, message: &str) -> bool {
        if self.matches(kind) {
            true
        } else {
            self.error_here(CompileErrorKind::ParseError, message);
            false
        }
    }

    fn identifier(&mut self, message: &str) -> Option<NameId> {
        if let TokenKind::Identifier(name) = self.peek_kind() {
            let name = name.clone();
            self.advance();
            Some(self.shared.interns.intern(&name))
        } else {
            self.error_here(CompileErrorKind::ParseError, message);
            None
        }
    }

    // ----- error reporting ------------------------------------------------

    fn error_at(&mut self, kind: CompileErrorKind, message: impl Into<String>, span: Span) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.errors.push(CompileError::new(kind, message, span));
    }

    fn error_here(&mut self, kind: CompileErrorKind, message: impl Into<String>) {
        self.error_at(kind, message, self.current_span());
    }

    fn synchronize(&mut self) {
        self.panic_mode = false;
        while !self.check(&TokenKind::Eof) {
            if matches!(self.peek_at(0), TokenKind::Semicolon) {
                self.advance();
                return;
            }
            if matches!(
                self.peek_kind(),
                TokenKind::Fun
                    | TokenKind::Object
                    | TokenKind::Enum
                    | TokenKind::Test
                    | TokenKind::Import
                    | TokenKind::Export
                    | TokenKind::If
                    | TokenKind::While
                    | TokenKind::For
                    | TokenKind::Foreach
                    | TokenKind::Return
                    | TokenKind::Const
                    | TokenKind::BoolType
                    | TokenKind::IntType
                    | TokenKind::FloatType
                    | TokenKind::StrType
            ) {
                return;
            }
            self.advance();
        }
    }

    fn error_expr(&self, span: Span) -> Expr {
        Expr {
            kind: ExprKind::Null,
            ty: self.null_type(),
            span,
        }
    }

    fn null_type(&self) -> TypeId {
        // `null` types as optional void; assignment checking special-cases it.
        self.shared.registry.prim().void
    }

    fn type_name(&self, ty: TypeId) -> String {
        self.shared.registry.type_name(ty, &self.shared.interns)
    }

    // ----- scopes and resolution ------------------------------------------

    fn frame(&self) -> &FunFrame {
        self.frames.last().expect("parser frame stack empty")
    }

    fn frame_mut(&mut self) -> &mut FunFrame {
        self.frames.last_mut().expect("parser frame stack empty")
    }

    fn at_top_level(&self) -> bool {
        self.frames.len() == 1 && self.frame().scope_depth == 0
    }

    fn begin_scope(&mut self) {
        self.frame_mut().scope_depth += 1;
    }

    /// Closes the innermost scope, returning pop records for the locals that
    /// end with it, last-declared first.
    fn end_scope(&mut self) -> Vec<EndedLocal> {
        let frame = self.frame_mut();
        frame.scope_depth -= 1;
        let depth = frame.scope_depth;
        let mut ended = Vec::new();
        while let Some(local) = frame.locals.last() {
            if local.depth <= depth {
                break;
            }
            ended.push(EndedLocal {
                captured: local.captured,
            });
            frame.locals.pop();
        }
        ended
    }

    fn declare_local(&mut self, name: NameId, ty: TypeId, constant: bool) -> Option<u8> {
        let span = self.previous_span();
        if self.frame().locals.len() >= MAX_LOCALS {
            self.error_at(
                CompileErrorKind::CompileError,
                "too many local variables in function",
                span,
            );
            return None;
        }
        let depth = self.frame().scope_depth;
        let duplicate = self
            .frame()
            .locals
            .iter()
            .rev()
            .take_while(|l| l.depth == depth)
            .any(|l| l.name == name);
        if duplicate {
            let text = self.shared.interns.get(name).to_string();
            self.error_at(
                CompileErrorKind::ParseError,
                format!("variable `{text}` already declared in this scope"),
                span,
            );
            return None;
        }
        let slot = u8::try_from(self.frame().locals.len()).expect("local count checked above");
        self.frame_mut().locals.push(LocalVar {
            name,
            depth,
            ty,
            constant,
            captured: false,
            initialized: false,
        });
        Some(slot)
    }

    fn mark_initialized(&mut self, slot: u8) {
        self.frame_mut().locals[slot as usize].initialized = true;
    }

    fn resolve_local_in(&self, frame_index: usize, name: NameId) -> Option<u8> {
        let frame = &self.frames[frame_index];
        frame
            .locals
            .iter()
            .rposition(|l| l.name == name)
            .map(|idx| u8::try_from(idx).expect("local index fits in u8"))
    }

    /// Lua-style upvalue resolution: walks enclosing frames, inserting an
    /// upvalue record into every frame between the capture site and the
    /// captured local.
    fn resolve_upvalue(&mut self, frame_index: usize, name: NameId) -> Option<u8> {
        if frame_index == 0 {
            return None;
        }
        if let Some(local_slot) = self.resolve_local_in(frame_index - 1, name) {
            let local = &mut self.frames[frame_index - 1].locals[local_slot as usize];
            local.captured = true;
            let (ty, constant) = (local.ty, local.constant);
            return self.add_upvalue(
                frame_index,
                UpvalDesc {
                    is_local: true,
                    index: local_slot,
                },
                name,
                ty,
                constant,
            );
        }
        if let Some(upvalue_slot) = self.resolve_upvalue(frame_index - 1, name) {
            let info = self.frames[frame_index - 1].upvalues[upvalue_slot as usize].clone();
            return self.add_upvalue(
                frame_index,
                UpvalDesc {
                    is_local: false,
                    index: upvalue_slot,
                },
                name,
                info.ty,
                info.constant,
            );
        }
        None
    }

    fn add_upvalue(
        &mut self,
        frame_index: usize,
        desc: UpvalDesc,
        name: NameId,
        ty: TypeId,
        constant: bool,
    ) -> Option<u8> {
        if let Some(existing) = self.frames[frame_index]
            .upvalues
            .iter()
            .position(|u| u.desc == desc)
        {
            return Some(u8::try_from(existing).expect("upvalue index fits in u8"));
        }
        if self.frames[frame_index].upvalues.len() >= MAX_UPVALUES {
            self.error_here(
                CompileErrorKind::CompileError,
                "too many captured variables in function",
            );
            return None;
        }
        let frame = &mut self.frames[frame_index];
        let index = u8::try_from(frame.upvalues.len()).expect("upvalue count checked above");
        frame.upvalues.push(UpvalInfo {
            desc,
            name,
            ty,
            constant,
        });
        Some(index)
    }

    fn find_global(&self, name: NameId) -> Option<&GlobalSym> {
        self.globals.iter().rev().find(|g| g.name == name)
    }

    /// Resolves a name to a slot with its type and constness.
    fn resolve_name(&mut self, name: NameId) -> Option<(Slot, TypeId, bool)> {
        let top = self.frames.len() - 1;
        if let Some(slot) = self.resolve_local_in(top, name) {
            let local = &self.frames[top].locals[slot as usize];
            let (ty, constant, initialized) = (local.ty, local.constant, local.initialized);
            if !initialized {
                let text = self.shared.interns.get(name).to_string();
                self.error_here(
                    CompileErrorKind::ParseError,
                    format!("can't read `{text}` in its own initializer"),
                );
            }
            return Some((Slot::Local(slot), ty, constant));
        }
        if let Some(index) = self.resolve_upvalue(top, name) {
            let info = &self.frames[top].upvalues[index as usize];
            return Some((Slot::UpValue(index), info.ty, info.constant));
        }
        self.find_global(name)
            .map(|g| (Slot::Global(g.slot), g.ty, g.constant))
    }

    // ----- types ----------------------------------------------------------

    /// Parses a type annotation, creating a placeholder for unknown names.
    fn parse_type(&mut self) -> TypeId {
        let prim = self.shared.registry.prim();
        let base = match self.peek_kind().clone() {
            TokenKind::BoolType => {
                self.advance();
                prim.boolean
            }
            TokenKind::IntType => {
                self.advance();
                prim.integer
            }
            TokenKind::FloatType => {
                self.advance();
                prim.float
            }
            TokenKind::StrType => {
                self.advance();
                prim.string
            }
            TokenKind::VoidType => {
                self.advance();
                prim.void
            }
            TokenKind::LeftBracket => {
                self.advance();
                let item = self.parse_type();
                self.consume(&TokenKind::RightBracket, "expected `]` after list item type");
                self.shared.registry.intern(TypeDesc::List { item }, false)
            }
            TokenKind::LeftBrace => {
                self.advance();
                let key = self.parse_type();
                self.consume(&TokenKind::Comma, "expected `,` between map key and value types");
                let value = self.parse_type();
                self.consume(&TokenKind::RightBrace, "expected `}` after map value type");
                self.shared.registry.intern(TypeDesc::Map { key, value }, false)
            }
            TokenKind::Fun => {
                self.advance();
                self.parse_function_type()
            }
            TokenKind::Identifier(text) => {
                self.advance();
                let name = self.shared.interns.intern(&text);
                self.named_type(name)
            }
            _ => {
                self.error_here(CompileErrorKind::ParseError, "expected a type");
                prim.void
            }
        };
        if self.matches(&TokenKind::Question) {
            self.shared.registry.with_optional(base, true)
        } else {
            base
        }
    }

    fn parse_function_type(&mut self) -> TypeId {
        let name = if let TokenKind::Identifier(text) = self.peek_kind().clone() {
            self.advance();
            Some(self.shared.interns.intern(&text))
        } else {
            None
        };
        self.consume(&TokenKind::LeftParen, "expected `(` in function type");
        let mut params = Vec::new();
        if !self.check(&TokenKind::RightParen) {
            loop {
                let ty = self.parse_type();
                let param_name = if let TokenKind::Identifier(text) = self.peek_kind().clone() {
                    self.advance();
                    self.shared.interns.intern(&text)
                } else {
                    self.shared.interns.well_known().empty
                };
                params.push((param_name, ty));
                if !self.matches(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(&TokenKind::RightParen, "expected `)` in function type");
        let ret = if self.matches(&TokenKind::Greater) {
            self.parse_type()
        } else {
            self.shared.registry.prim().void
        };
        let defaults = vec![false; params.len()];
        self.shared.registry.intern(
            TypeDesc::Function(FunctionType {
                name,
                params,
                defaults,
                ret,
                kind: FunctionKind::Function,
            }),
            false,
        )
    }

    /// Resolves a type name: a declared object or enum, or a shared
    /// placeholder for a name not declared yet.
    fn named_type(&mut self, name: NameId) -> TypeId {
        if let Some(sym) = self.find_global(name) {
            match sym.kind {
                SymbolKind::Object(object) => {
                    return self.shared.registry.object(object).instance_type;
                }
                SymbolKind::Enum(enum_) => {
                    return self.shared.registry.enum_info(enum_).instance_type;
                }
                _ => {
                    let text = self.shared.interns.get(name).to_string();
                    self.error_here(
                        CompileErrorKind::TypeError,
                        format!("`{text}` is not a type"),
                    );
                    return self.shared.registry.prim().void;
                }
            }
        }
        if let Some(&placeholder) = self.pending_types.get(&name) {
            return placeholder;
        }
        let placeholder = self.shared.registry.placeholder(name, false);
        self.pending_types.insert(name, placeholder);
        placeholder
    }

    /// Reports every forward type reference that never got a declaration.
    fn check_unresolved_types(&mut self) {
        let pending: Vec<(NameId, TypeId)> =
            self.pending_types.iter().map(|(&n, &t)| (n, t)).collect();
        for (name, placeholder) in pending {
            if self.shared.registry.resolve(placeholder) == placeholder {
                let text = self.shared.interns.get(name).to_string();
                self.panic_mode = false;
                self.error_at(
                    CompileErrorKind::ResolutionError,
                    format!("Unknown type `{text}`"),
                    Span::new(1, 1),
                );
            }
        }
    }

    fn check_assignable(&mut self, value: &Expr, expected: TypeId, context: &str) {
        if matches!(value.kind, ExprKind::Null) {
            if self.shared.registry.is_optional(expected) {
                return;
            }
            let expected_name = self.type_name(expected);
            self.error_at(
                CompileErrorKind::TypeError,
                format!("{context}: `null` is not a `{expected_name}`"),
                value.span,
            );
            return;
        }
        if !self.shared.registry.assignable(value.ty, expected) {
            let got = self.type_name(value.ty);
            let expected_name = self.type_name(expected);
            self.error_at(
                CompileErrorKind::TypeError,
                format!("{context}: expected `{expected_name}`, got `{got}`"),
                value.span,
            );
        }
    }

    /// Gives contextless literals (`null`, `[]`, `{}`) the expected type.
    fn adapt_literal(&mut self, expr: &mut Expr, expected: TypeId) {
        let resolved = self.shared.registry.resolve(expected);
        match (&mut expr.kind, self.shared.registry.desc(resolved).clone()) {
            (ExprKind::List { item_type, items }, TypeDesc::List { item })
                if items.is_empty() =>
            {
                *item_type = item;
                expr.ty = resolved;
            }
            (
                ExprKind::Map {
                    key_type,
                    value_type,
                    entries,
                },
                TypeDesc::Map { key, value },
            ) if entries.is_empty() => {
                *key_type = key;
                *value_type = value;
                expr.ty = resolved;
            }
            _ => {}
        }
    }

    // ----- declarations ---------------------------------------------------

    fn declaration(&mut self) -> Option<Stmt> {
        match self.peek_kind() {
            TokenKind::Import => self.import_statement(),
            TokenKind::Export => self.export_declaration(),
            TokenKind::Fun => self.fun_declaration(),
            TokenKind::Object => self.object_declaration(),
            TokenKind::Enum => self.enum_declaration(),
            TokenKind::Test => self.test_declaration(),
            TokenKind::Const => {
                self.advance();
                self.var_declaration(None, true)
            }
            _ if self.starts_var_declaration() => {
                let ty = self.parse_type();
                self.var_declaration(Some(ty), false)
            }
            _ => self.statement(),
        }
    }

    /// Lookahead: does the statement start with `<type> IDENT`? Needed to
    /// tell `{int, str} m = ...` from a block and `Foo x = ...` from an
    /// expression statement.
    fn starts_var_declaration(&self) -> bool {
        match self.peek_kind() {
            TokenKind::BoolType
            | TokenKind::IntType
            | TokenKind::FloatType
            | TokenKind::StrType => true,
            TokenKind::Identifier(_) => {
                // `Foo x`, `Foo? x`: identifier type followed by identifier.
                matches!(self.peek_at(1), TokenKind::Identifier(_))
                    || (matches!(self.peek_at(1), TokenKind::Question)
                        && matches!(self.peek_at(2), TokenKind::Identifier(_)))
            }
            TokenKind::LeftBracket | TokenKind::LeftBrace => {
                self.delimited_type_then_identifier()
            }
            _ => false,
        }
    }

    /// Scans past a balanced `[...]`/`{...}` prefix and checks whether an
    /// identifier follows, which makes it a list/map type annotation.
    fn delimited_type_then_identifier(&self) -> bool {
        let (open, close) = match self.peek_kind() {
            TokenKind::LeftBracket => (TokenKind::LeftBracket, TokenKind::RightBracket),
            _ => (TokenKind::LeftBrace, TokenKind::RightBrace),
        };
        let mut depth = 0usize;
        let mut offset = 0usize;
        loop {
            let kind = self.peek_at(offset);
            if matches!(kind, TokenKind::Eof) {
                return false;
            }
            if mem::discriminant(kind) == mem::discriminant(&open) {
                depth += 1;
            } else if mem::discriminant(kind) == mem::discriminant(&close) {
                depth -= 1;
                if depth == 0 {
                    break;
                }
            }
            offset += 1;
        }
        let mut after = offset + 1;
        if matches!(self.peek_at(after), TokenKind::Question) {
            after += 1;
        }
        matches!(self.peek_at(after), TokenKind::Identifier(_))
    }

    fn var_declaration(&mut self, declared: Option<TypeId>, constant: bool) -> Option<Stmt> {
        let span = self.current_span();
        let declared = if constant && declared.is_none() && self.looks_like_const_type() {
            Some(self.parse_type())
        } else {
            declared
        };
        let name = self.identifier("expected variable name")?;

        let mut initializer = None;
        if self.matches(&TokenKind::Equal) {
            let mut value = self.expression();
            if let Some(expected) = declared {
                self.adapt_literal(&mut value, expected);
                self.check_assignable(&value, expected, "initializer");
            }
            initializer = Some(value);
        } else if constant {
            self.error_here(CompileErrorKind::ParseError, "`const` requires an initializer");
        }
        self.consume(&TokenKind::Semicolon, "expected `;` after variable declaration");

        let ty = match (declared, &initializer) {
            (Some(ty), _) => ty,
            (None, Some(value)) => value.ty,
            (None, None) => self.shared.registry.prim().void,
        };
        if initializer.is_none() && !self.shared.registry.is_optional(ty) {
            let text = self.shared.interns.get(name).to_string();
            self.error_at(
                CompileErrorKind::TypeError,
                format!("non-optional variable `{text}` must be initialized"),
                span,
            );
        }

        let slot = if self.at_top_level() {
            let slot = self.shared.alloc_global();
            self.globals.push(GlobalSym {
                name,
                ty,
                slot,
                constant,
                kind: SymbolKind::Var,
            });
            Slot::Global(slot)
        } else {
            let slot = self.declare_local(name, ty, constant)?;
            self.mark_initialized(slot);
            Slot::Local(slot)
        };
        Some(Stmt {
            kind: StmtKind::VarDeclaration {
                name,
                ty,
                slot,
                constant,
                initializer,
            },
            span,
        })
    }

    /// `const int x = ...` spells the type; `const x = ...` infers it.
    fn looks_like_const_type(&self) -> bool {
        self.starts_var_declaration()
    }

    fn import_statement(&mut self) -> Option<Stmt> {
        let span = self.current_span();
        self.advance();
        if !self.at_top_level() {
            self.error_at(
                CompileErrorKind::ParseError,
                "`import` is only allowed at top level",
                span,
            );
        }
        let spec = self.string_literal("expected module path string after `import`")?;
        let namespace = if self.matches(&TokenKind::As) {
            Some(self.identifier("expected namespace name after `as`")?)
        } else {
            None
        };
        self.consume(&TokenKind::Semicolon, "expected `;` after import");

        let importer_dir = self
            .path
            .as_ref()
            .and_then(|p| p.parent().map(Path::to_path_buf));
        match self.shared.import_module(&spec, importer_dir.as_deref()) {
            Ok((closure, exports)) => {
                let count = u32::try_from(exports.len()).expect("export count fits in u32");
                let global_base = self.shared.alloc_globals(count);
                let mut imported = Vec::with_capacity(exports.len());
                for (offset, sym) in exports.into_iter().enumerate() {
                    imported.push(GlobalSym {
                        slot: global_base + u32::try_from(offset).expect("offset fits in u32"),
                        ..sym
                    });
                }
                match namespace {
                    Some(ns) => {
                        self.namespaces.insert(ns, imported);
                    }
                    None => self.globals.extend(imported),
                }
                Some(Stmt {
                    kind: StmtKind::Import {
                        closure,
                        global_base,
                        count,
                    },
                    span,
                })
            }
            Err(message) => {
                self.error_at(CompileErrorKind::CompileError, message, span);
                None
            }
        }
    }

    fn string_literal(&mut self, message: &str) -> Option<Box<str>> {
        if let TokenKind::Str(segments) = self.peek_kind().clone() {
            self.advance();
            if let [StrSegment::Literal(text)] = segments.as_slice() {
                return Some(text.clone());
            }
            self.error_at(
                CompileErrorKind::ParseError,
                "interpolation is not allowed here",
                self.previous_span(),
            );
            return None;
        }
        self.error_here(CompileErrorKind::ParseError, message);
        None
    }

    fn export_declaration(&mut self) -> Option<Stmt> {
        let span = self.current_span();
        self.advance();
        if !self.at_top_level() {
            self.error_at(
                CompileErrorKind::ParseError,
                "`export` is only allowed at top level",
                span,
            );
        }
        let before = self.globals.len();
        let stmt = self.declaration();
        for sym in &self.globals[before..] {
            self.exports.push(ExportedGlobal { slot: sym.slot });
            self.shared.record_export(sym.clone());
        }
        stmt
    }

    fn fun_declaration(&mut self) -> Option<Stmt> {
        let span = self.current_span();
        self.advance();
        let name = self.identifier("expected function name")?;
        let top_level = self.at_top_level();

        let params = self.parse_params()?;
        let return_type = if self.matches(&TokenKind::Greater) {
            self.parse_type()
        } else {
            self.shared.registry.prim().void
        };

        let kind = if top_level && name == self.shared.interns.well_known().main {
            FunctionKind::EntryPoint
        } else {
            FunctionKind::Function
        };
        let type_id = self.function_type_of(Some(name), &params, return_type, kind);

        // Declare before the body parses so the function can recurse.
        let slot = if top_level {
            let slot = self.shared.alloc_global();
            self.globals.push(GlobalSym {
                name,
                ty: type_id,
                slot,
                constant: true,
                kind: SymbolKind::Function {
                    defaults: params.iter().map(|p| p.default.clone()).collect(),
                },
            });
            if kind == FunctionKind::EntryPoint {
                self.main_slot = Some(slot);
            }
            Slot::Global(slot)
        } else {
            let local = self.declare_local(name, type_id, true)?;
            self.mark_initialized(local);
            Slot::Local(local)
        };

        let function = self.parse_function_body(name, kind, type_id, return_type, params, span)?;
        match slot {
            Slot::Global(slot) => Some(Stmt {
                kind: StmtKind::FunDeclaration { slot, function },
                span,
            }),
            Slot::Local(local) => Some(Stmt {
                kind: StmtKind::VarDeclaration {
                    name,
                    ty: type_id,
                    slot: Slot::Local(local),
                    constant: true,
                    initializer: Some(Expr {
                        ty: type_id,
                        span,
                        kind: ExprKind::Function(Box::new(function)),
                    }),
                },
                span,
            }),
            Slot::UpValue(_) => unreachable!("declarations never bind upvalues"),
        }
    }

    fn parse_params(&mut self) -> Option<Vec<Param>> {
        self.consume(&TokenKind::LeftParen, "expected `(` after function name");
        let mut params = Vec::new();
        if !self.check(&TokenKind::RightParen) {
            loop {
                let ty = self.parse_type();
                let name = self.identifier("expected parameter name")?;
                let default = if self.matches(&TokenKind::Equal) {
                    let value = self.parse_default_fragment(ty);
                    Some(value)
                } else {
                    None
                };
                params.push(Param { name, ty, default });
                if params.len() > MAX_LOCALS - 1 {
                    self.error_here(CompileErrorKind::CompileError, "too many parameters");
                    return None;
                }
                if !self.matches(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(&TokenKind::RightParen, "expected `)` after parameters");
        Some(params)
    }

    /// Parses a default-value fragment and rejects captures of surrounding
    /// locals: the fragment is re-evaluated at call sites, where those slots
    /// do not exist.
    fn parse_default_fragment(&mut self, expected: TypeId) -> Expr {
        let mut value = self.expression();
        self.adapt_literal(&mut value, expected);
        self.check_assignable(&value, expected, "default value");
        if expr_uses_locals(&value) {
            self.error_at(
                CompileErrorKind::TypeError,
                "default values may only use literals and globals",
                value.span,
            );
        }
        value
    }

    fn function_type_of(
        &mut self,
        name: Option<NameId>,
        params: &[Param],
        ret: TypeId,
        kind: FunctionKind,
    ) -> TypeId {
        self.shared.registry.intern(
            TypeDesc::Function(FunctionType {
                name,
                params: params.iter().map(|p| (p.name, p.ty)).collect(),
                defaults: params.iter().map(|p| p.default.is_some()).collect(),
                ret,
                kind,
            }),
            false,
        )
    }

    /// Parses a function body in a fresh frame; `this_type` reserves slot 0
    /// for the receiver of methods.
    fn parse_function_frame(
        &mut self,
        kind: FunctionKind,
        return_type: TypeId,
        params: &[Param],
        this_type: Option<TypeId>,
    ) -> Option<(Block, Vec<UpvalDesc>)> {
        let well_known_this = self.shared.interns.well_known().this;
        let void = self.shared.registry.prim().void;
        let mut frame = FunFrame {
            locals: Vec::new(),
            upvalues: Vec::new(),
            scope_depth: 1,
            kind,
            return_type,
        };
        frame.locals.push(LocalVar {
            name: if this_type.is_some() {
                well_known_this
            } else {
                NameId::default()
            },
            depth: 0,
            ty: this_type.unwrap_or(void),
            constant: true,
            captured: false,
            initialized: true,
        });
        for param in params {
            frame.locals.push(LocalVar {
                name: param.name,
                depth: 1,
                ty: param.ty,
                constant: false,
                captured: false,
                initialized: true,
            });
        }
        self.frames.push(frame);

        self.consume(&TokenKind::LeftBrace, "expected `{` before function body");
        let body = self.block_body();

        let frame = self.frames.pop().expect("function frame missing");
        let upvalues = frame.upvalues.iter().map(|u| u.desc).collect();
        Some((body, upvalues))
    }

    fn parse_function_body(
        &mut self,
        name: NameId,
        kind: FunctionKind,
        type_id: TypeId,
        return_type: TypeId,
        params: Vec<Param>,
        span: Span,
    ) -> Option<FunctionAst> {
        let this_type = if kind == FunctionKind::Method {
            self.current_object
                .map(|obj| self.shared.registry.object(obj).instance_type)
        } else {
            None
        };
        let (body, upvalues) = self.parse_function_frame(kind, return_type, &params, this_type)?;
        Some(FunctionAst {
            name,
            kind,
            type_id,
            return_type,
            params,
            body,
            upvalues,
            test_name: None,
            span,
        })
    }

    fn test_declaration(&mut self) -> Option<Stmt> {
        let span = self.current_span();
        self.advance();
        if !self.at_top_level() {
            self.error_at(
                CompileErrorKind::ParseError,
                "`test` is only allowed at top level",
                span,
            );
        }
        let display = self.string_literal("expected test name string")?;
        let id = self.test_counter;
        self.test_counter += 1;
        let name = self
            .shared
            .interns
            .intern(&format!("$test#{id} {display}"));
        let void = self.shared.registry.prim().void;
        let type_id = self.function_type_of(Some(name), &[], void, FunctionKind::Test);

        let slot = self.shared.alloc_global();
        self.globals.push(GlobalSym {
            name,
            ty: type_id,
            slot,
            constant: true,
            kind: SymbolKind::Function { defaults: Vec::new() },
        });
        self.tests.push((slot, display.clone()));

        let mut function =
            self.parse_function_body(name, FunctionKind::Test, type_id, void, Vec::new(), span)?;
        function.test_name = Some(display);
        Some(Stmt {
            kind: StmtKind::FunDeclaration { slot, function },
            span,
        })
    }

    fn object_declaration(&mut self) -> Option<Stmt> {
        let span = self.current_span();
        self.advance();
        if !self.at_top_level() {
            self.error_at(
                CompileErrorKind::ParseError,
                "`object` is only allowed at top level",
                span,
            );
        }
        let name = self.identifier("expected object name")?;

        let mut parent = None;
        let mut parent_slot = None;
        if self.matches(&TokenKind::Less) {
            if let Some(parent_name) = self.identifier("expected parent object name") {
                match self.find_global(parent_name) {
                    Some(GlobalSym {
                        kind: SymbolKind::Object(parent_id),
                        slot,
                        ..
                    }) => {
                        parent = Some(*parent_id);
                        parent_slot = Some(*slot);
                    }
                    _ => {
                        let text = self.shared.interns.get(parent_name).to_string();
                        self.error_here(
                            CompileErrorKind::TypeError,
                            format!("unknown parent object `{text}`"),
                        );
                    }
                }
            }
        }

        let object = self.shared.registry.declare_object(name, parent);
        let instance_type = self.shared.registry.object(object).instance_type;
        if let Some(placeholder) = self.pending_types.remove(&name) {
            self.shared.registry.link_placeholder(placeholder, instance_type);
        }
        let slot = self.shared.alloc_global();
        self.globals.push(GlobalSym {
            name,
            ty: self.shared.registry.object(object).type_id,
            slot,
            constant: true,
            kind: SymbolKind::Object(object),
        });

        self.consume(&TokenKind::LeftBrace, "expected `{` after object name");

        // Phase A: collect fields and method signatures, skipping method
        // bodies, so members may reference each other regardless of order.
        let mut fields = Vec::new();
        let mut method_bodies: Vec<(NameId, TypeId, TypeId, Vec<Param>, usize, Span)> = Vec::new();
        while !self.check(&TokenKind::RightBrace) && !self.check(&TokenKind::Eof) {
            if self.matches(&TokenKind::Fun) {
                let method_span = self.previous_span();
                let Some(method_name) = self.identifier("expected method name") else {
                    self.synchronize();
                    continue;
                };
                let Some(params) = self.parse_params() else {
                    self.synchronize();
                    continue;
                };
                let ret = if self.matches(&TokenKind::Greater) {
                    self.parse_type()
                } else {
                    self.shared.registry.prim().void
                };
                let type_id =
                    self.function_type_of(Some(method_name), &params, ret, FunctionKind::Method);
                self.shared.registry.object_mut(object).methods.push(
                    crate::typedef::MethodInfo {
                        name: method_name,
                        ty: type_id,
                    },
                );
                self.shared.method_defaults.insert(
                    (object, method_name),
                    params.iter().map(|p| p.default.clone()).collect(),
                );
                let body_start = self.pos;
                if self.skip_block() {
                    method_bodies.push((method_name, type_id, ret, params, body_start, method_span));
                }
            } else {
                let ty = self.parse_type();
                let Some(field_name) = self.identifier("expected field name") else {
                    self.synchronize();
                    continue;
                };
                let default = if self.matches(&TokenKind::Equal) {
                    Some(self.parse_default_fragment(ty))
                } else {
                    None
                };
                self.matches(&TokenKind::Comma);
                self.shared.registry.object_mut(object).fields.push(
                    crate::typedef::FieldInfo {
                        name: field_name,
                        ty,
                        has_default: default.is_some(),
                    },
                );
                if let Some(default) = &default {
                    self.shared
                        .field_defaults
                        .insert((object, field_name), default.clone());
                }
                fields.push(FieldDecl {
                    name: field_name,
                    ty,
                    default,
                });
            }
        }
        self.consume(&TokenKind::RightBrace, "expected `}` after object body");
        let after_object = self.pos;

        // Phase B: parse the deferred method bodies with the full member set
        // registered.
        let enclosing_object = self.current_object.replace(object);
        let mut methods = Vec::new();
        for (method_name, type_id, ret, params, body_start, method_span) in method_bodies {
            self.pos = body_start;
            if let Some(function) = self.parse_function_body(
                method_name,
                FunctionKind::Method,
                type_id,
                ret,
                params,
                method_span,
            ) {
                methods.push(function);
            }
            if self.panic_mode {
                self.panic_mode = false;
            }
        }
        self.current_object = enclosing_object;
        self.pos = after_object;

        Some(Stmt {
            kind: StmtKind::ObjectDeclaration(ObjectDeclAst {
                name,
                object,
                slot,
                parent_slot,
                fields,
                methods,
            }),
            span,
        })
    }

    /// Skips a balanced `{ ... }` block, leaving the parser after it.
    /// Returns false when the block never opened.
    fn skip_block(&mut self) -> bool {
        if !self.check(&TokenKind::LeftBrace) {
            self.error_here(CompileErrorKind::ParseError, "expected `{` before method body");
            return false;
        }
        let mut depth = 0usize;
        loop {
            match self.peek_kind() {
                TokenKind::Eof => {
                    self.error_here(CompileErrorKind::ParseError, "unterminated block");
                    return false;
                }
                TokenKind::LeftBrace => depth += 1,
                TokenKind::RightBrace => {
                    depth -= 1;
                    if depth == 0 {
                        self.advance();
                        return true;
                    }
                }
                _ => {}
            }
            self.advance();
        }
    }

    fn enum_declaration(&mut self) -> Option<Stmt> {
        let span = self.current_span();
        self.advance();
        if !self.at_top_level() {
            self.error_at(
                CompileErrorKind::ParseError,
                "`enum` is only allowed at top level",
                span,
            );
        }
        let prim = self.shared.registry.prim();
        let underlying = if self.matches(&TokenKind::LeftParen) {
            let ty = self.parse_type();
            self.consume(&TokenKind::RightParen, "expected `)` after enum value type");
            if ty != prim.integer && ty != prim.string {
                self.error_here(
                    CompileErrorKind::TypeError,
                    "enum value type must be `int` or `str`",
                );
            }
            ty
        } else {
            prim.integer
        };
        let name = self.identifier("expected enum name")?;
        self.consume(&TokenKind::LeftBrace, "expected `{` after enum name");
        let mut cases = Vec::new();
        while !self.check(&TokenKind::RightBrace) && !self.check(&TokenKind::Eof) {
            let Some(case) = self.identifier("expected enum case name") else {
                break;
            };
            if cases.contains(&case) {
                let text = self.shared.interns.get(case).to_string();
                self.error_here(
                    CompileErrorKind::ParseError,
                    format!("duplicate enum case `{text}`"),
                );
            }
            cases.push(case);
            if !self.matches(&TokenKind::Comma) {
                break;
            }
        }
        self.consume(&TokenKind::RightBrace, "expected `}` after enum cases");
        if cases.len() > u16::MAX as usize {
            self.error_here(CompileErrorKind::CompileError, "too many enum cases");
        }

        let enum_ = self.shared.registry.declare_enum(name, underlying, cases.clone());
        let instance_type = self.shared.registry.enum_info(enum_).instance_type;
        if let Some(placeholder) = self.pending_types.remove(&name) {
            self.shared.registry.link_placeholder(placeholder, instance_type);
        }
        let slot = self.shared.alloc_global();
        self.globals.push(GlobalSym {
            name,
            ty: self.shared.registry.enum_info(enum_).type_id,
            slot,
            constant: true,
            kind: SymbolKind::Enum(enum_),
        });

        Some(Stmt {
            kind: StmtKind::EnumDeclaration(EnumDeclAst {
                name,
                enum_,
                slot,
                underlying,
                cases,
            }),
            span,
        })
    }

    // ----- statements -----------------------------------------------------

    fn statement(&mut self) -> Option<Stmt> {
        match self.peek_kind() {
            TokenKind::If => self.if_statement(),
            TokenKind::While => self.while_statement(),
            TokenKind::Do => self.do_until_statement(),
            TokenKind::For => self.for_statement(),
            TokenKind::Foreach => self.foreach_statement(),
            TokenKind::Return => self.return_statement(),
            TokenKind::Break => self.break_statement(),
            TokenKind::Continue => self.continue_statement(),
            TokenKind::Throw => self.throw_statement(),
            TokenKind::LeftBrace => {
                let span = self.current_span();
                self.advance();
                self.begin_scope();
                let block = self.block_statements();
                Some(Stmt {
                    kind: StmtKind::Block(block),
                    span,
                })
            }
            _ => self.expression_statement(),
        }
    }

    fn expression_statement(&mut self) -> Option<Stmt> {
        let span = self.current_span();
        let expr = self.expression();
        self.consume(&TokenKind::Semicolon, "expected `;` after expression");
        Some(Stmt {
            kind: StmtKind::Expression(expr),
            span,
        })
    }

    /// Parses statements until `}`; assumes the scope has been opened and
    /// the `{` consumed. Closes the scope.
    fn block_statements(&mut self) -> Block {
        let mut statements = Vec::new();
        while !self.check(&TokenKind::RightBrace) && !self.check(&TokenKind::Eof) {
            if let Some(stmt) = self.declaration() {
                statements.push(stmt);
            }
            if self.panic_mode {
                self.synchronize();
            }
        }
        self.consume(&TokenKind::RightBrace, "expected `}` after block");
        let ended = self.end_scope();
        Block { statements, ended }
    }

    /// A function body: `{` already consumed by the caller's consume, scope
    /// is the frame's base scope.
    fn block_body(&mut self) -> Block {
        let mut statements = Vec::new();
        while !self.check(&TokenKind::RightBrace) && !self.check(&TokenKind::Eof) {
            if let Some(stmt) = self.declaration() {
                statements.push(stmt);
            }
            if self.panic_mode {
                self.synchronize();
            }
        }
        self.consume(&TokenKind::RightBrace, "expected `}` after function body");
        Block {
            statements,
            ended: Vec::new(),
        }
    }

    fn braced_block(&mut self) -> Block {
        self.consume(&TokenKind::LeftBrace, "expected `{`");
        self.begin_scope();
        self.block_statements()
    }

    fn condition(&mut self, context: &str) -> Expr {
        self.consume(&TokenKind::LeftParen, "expected `(` after keyword");
        let expr = self.expression();
        self.consume(&TokenKind::RightParen, "expected `)` after condition");
        let boolean = self.shared.registry.prim().boolean;
        if self.shared.registry.resolve(expr.ty) != boolean {
            let got = self.type_name(expr.ty);
            self.error_at(
                CompileErrorKind::TypeError,
                format!("{context} condition must be `bool`, got `{got}`"),
                expr.span,
            );
        }
        expr
    }

    fn if_statement(&mut self) -> Option<Stmt> {
        let span = self.current_span();
        self.advance();
        let condition = self.condition("`if`");
        let then_branch = self.braced_block();
        let else_branch = if self.matches(&TokenKind::Else) {
            if self.check(&TokenKind::If) {
                self.if_statement().map(Box::new)
            } else {
                let block_span = self.current_span();
                let block = self.braced_block();
                Some(Box::new(Stmt {
                    kind: StmtKind::Block(block),
                    span: block_span,
                }))
            }
        } else {
            None
        };
        Some(Stmt {
            kind: StmtKind::If {
                condition,
                then_branch,
                else_branch,
            },
            span,
        })
    }

    fn push_loop(&mut self) {
        let ctx = LoopCtx {
            local_floor: self.frame().locals.len(),
            frame: self.frames.len() - 1,
        };
        self.loops.push(ctx);
    }

    fn while_statement(&mut self) -> Option<Stmt> {
        let span = self.current_span();
        self.advance();
        let condition = self.condition("`while`");
        self.push_loop();
        let body = self.braced_block();
        self.loops.pop();
        Some(Stmt {
            kind: StmtKind::While { condition, body },
            span,
        })
    }

    fn do_until_statement(&mut self) -> Option<Stmt> {
        let span = self.current_span();
        self.advance();
        self.push_loop();
        let body = self.braced_block();
        self.loops.pop();
        self.consume(&TokenKind::Until, "expected `until` after `do` block");
        let condition = self.condition("`until`");
        self.consume(&TokenKind::Semicolon, "expected `;` after `until` condition");
        Some(Stmt {
            kind: StmtKind::DoUntil { body, condition },
            span,
        })
    }

    fn for_statement(&mut self) -> Option<Stmt> {
        let span = self.current_span();
        self.advance();
        self.consume(&TokenKind::LeftParen, "expected `(` after `for`");
        self.begin_scope();

        let initializer = if self.matches(&TokenKind::Semicolon) {
            None
        } else if self.starts_var_declaration() {
            let ty = self.parse_type();
            self.var_declaration(Some(ty), false).map(Box::new)
        } else {
            let init_span = self.current_span();
            let expr = self.expression();
            self.consume(&TokenKind::Semicolon, "expected `;` after loop initializer");
            Some(Box::new(Stmt {
                kind: StmtKind::Expression(expr),
                span: init_span,
            }))
        };

        let condition = if self.check(&TokenKind::Semicolon) {
            Expr {
                kind: ExprKind::Boolean(true),
                ty: self.shared.registry.prim().boolean,
                span: self.current_span(),
            }
        } else {
            let expr = self.expression();
            let boolean = self.shared.registry.prim().boolean;
            if self.shared.registry.resolve(expr.ty) != boolean {
                let got = self.type_name(expr.ty);
                self.error_at(
                    CompileErrorKind::TypeError,
                    format!("`for` condition must be `bool`, got `{got}`"),
                    expr.span,
                );
            }
            expr
        };
        self.consume(&TokenKind::Semicolon, "expected `;` after loop condition");

        let increment = if self.check(&TokenKind::RightParen) {
            None
        } else {
            Some(self.expression())
        };
        self.consume(&TokenKind::RightParen, "expected `)` after `for` clauses");

        self.push_loop();
        let body = self.braced_block();
        self.loops.pop();
        let ended = self.end_scope();
        Some(Stmt {
            kind: StmtKind::For {
                initializer,
                condition,
                increment,
                body,
                ended,
            },
            span,
        })
    }

    fn foreach_statement(&mut self) -> Option<Stmt> {
        let span = self.current_span();
        self.advance();
        self.consume(&TokenKind::LeftParen, "expected `(` after `foreach`");
        self.begin_scope();

        let first_ty = self.parse_type();
        let first_name = self.identifier("expected loop variable name")?;
        let second = if self.matches(&TokenKind::Comma) {
            let ty = self.parse_type();
            let name = self.identifier("expected loop value name")?;
            Some((ty, name))
        } else {
            None
        };
        self.consume(&TokenKind::In, "expected `in` before foreach iterable");
        let iterable = self.expression();
        self.consume(&TokenKind::RightParen, "expected `)` after foreach iterable");

        // The expected key/value types follow the iterable's shape.
        let prim = self.shared.registry.prim();
        let iterable_ty = self.shared.registry.resolve(iterable.ty);
        let pair = match self.shared.registry.desc(iterable_ty).clone() {
            TypeDesc::List { item } => Some((prim.integer, item)),
            TypeDesc::Map { key, value } => Some((key, value)),
            TypeDesc::Str => Some((prim.integer, prim.string)),
            TypeDesc::Range => Some((prim.integer, prim.integer)),
            TypeDesc::Enum { enum_ } => Some((
                prim.integer,
                self.shared.registry.enum_info(enum_).instance_type,
            )),
            _ => {
                let got = self.type_name(iterable.ty);
                self.error_at(
                    CompileErrorKind::TypeError,
                    format!("`{got}` is not iterable"),
                    iterable.span,
                );
                None
            }
        };

        let (key_ty, value_ty) = match (&second, pair) {
            (Some((second_ty, _)), Some((want_key, want_value))) => {
                if !self.shared.registry.assignable(want_key, first_ty) {
                    let want = self.type_name(want_key);
                    self.error_at(
                        CompileErrorKind::TypeError,
                        format!("foreach key must be `{want}`"),
                        span,
                    );
                }
                if !self.shared.registry.assignable(want_value, *second_ty) {
                    let want = self.type_name(want_value);
                    self.error_at(
                        CompileErrorKind::TypeError,
                        format!("foreach value must be `{want}`"),
                        span,
                    );
                }
                (first_ty, *second_ty)
            }
            (None, Some((want_key, want_value))) => {
                if !self.shared.registry.assignable(want_value, first_ty) {
                    let want = self.type_name(want_value);
                    self.error_at(
                        CompileErrorKind::TypeError,
                        format!("foreach value must be `{want}`"),
                        span,
                    );
                }
                (want_key, first_ty)
            }
            (_, None) => (prim.integer, first_ty),
        };

        // Three consecutive loop-scope locals: key, value, hidden iterable.
        let (key_ident, value_ident) = match &second {
            Some((_, second_name)) => (first_name, *second_name),
            None => (self.shared.interns.intern("$key"), first_name),
        };
        let key_slot = self.declare_local(key_ident, key_ty, false)?;
        self.mark_initialized(key_slot);
        let value_slot = self.declare_local(value_ident, value_ty, false)?;
        self.mark_initialized(value_slot);
        let iter_ident = self.shared.interns.intern("$iter");
        let iter_slot = self.declare_local(iter_ident, iterable.ty, true)?;
        self.mark_initialized(iter_slot);
        debug_assert_eq!(value_slot, key_slot + 1);
        debug_assert_eq!(iter_slot, key_slot + 2);

        self.push_loop();
        let body = self.braced_block();
        self.loops.pop();
        let ended = self.end_scope();

        Some(Stmt {
            kind: StmtKind::ForEach {
                key_slot,
                value_slot,
                iterable,
                body,
                ended,
            },
            span,
        })
    }

    fn return_statement(&mut self) -> Option<Stmt> {
        let span = self.current_span();
        self.advance();
        if matches!(
            self.frame().kind,
            FunctionKind::Script | FunctionKind::ScriptEntryPoint
        ) {
            self.error_at(
                CompileErrorKind::ParseError,
                "can't return from top-level code",
                span,
            );
        }
        let value = if self.check(&TokenKind::Semicolon) {
            None
        } else {
            let mut expr = self.expression();
            let expected = self.frame().return_type;
            self.adapt_literal(&mut expr, expected);
            self.check_assignable(&expr, expected, "return value");
            Some(expr)
        };
        if value.is_none() {
            let expected = self.frame().return_type;
            let void = self.shared.registry.prim().void;
            if self.shared.registry.resolve(expected) != void
                && !self.shared.registry.is_optional(expected)
            {
                self.error_at(
                    CompileErrorKind::TypeError,
                    "non-void function must return a value",
                    span,
                );
            }
        }
        self.consume(&TokenKind::Semicolon, "expected `;` after return");
        Some(Stmt {
            kind: StmtKind::Return { value },
            span,
        })
    }

    fn loop_pops(&mut self) -> Vec<EndedLocal> {
        let Some(ctx) = self.loops.last().copied() else {
            return Vec::new();
        };
        if ctx.frame != self.frames.len() - 1 {
            return Vec::new();
        }
        self.frame().locals[ctx.local_floor..]
            .iter()
            .rev()
            .map(|l| EndedLocal {
                captured: l.captured,
            })
            .collect()
    }

    fn break_statement(&mut self) -> Option<Stmt> {
        let span = self.current_span();
        self.advance();
        self.consume(&TokenKind::Semicolon, "expected `;` after `break`");
        if self
            .loops
            .last()
            .is_none_or(|ctx| ctx.frame != self.frames.len() - 1)
        {
            self.error_at(
                CompileErrorKind::ParseError,
                "`break` outside of a loop",
                span,
            );
            return None;
        }
        let pops = self.loop_pops();
        Some(Stmt {
            kind: StmtKind::Break { pops },
            span,
        })
    }

    fn continue_statement(&mut self) -> Option<Stmt> {
        let span = self.current_span();
        self.advance();
        self.consume(&TokenKind::Semicolon, "expected `;` after `continue`");
        if self
            .loops
            .last()
            .is_none_or(|ctx| ctx.frame != self.frames.len() - 1)
        {
            self.error_at(
                CompileErrorKind::ParseError,
                "`continue` outside of a loop",
                span,
            );
            return None;
        }
        let pops = self.loop_pops();
        Some(Stmt {
            kind: StmtKind::Continue { pops },
            span,
        })
    }

    fn throw_statement(&mut self) -> Option<Stmt> {
        let span = self.current_span();
        self.advance();
        let value = self.expression();
        self.consume(&TokenKind::Semicolon, "expected `;` after `throw`");
        Some(Stmt {
            kind: StmtKind::Throw { value },
            span,
        })
    }

    // ----- expressions ----------------------------------------------------

    fn expression(&mut self) -> Expr {
        let lhs = self.parse_precedence(P_OR);
        if self.matches(&TokenKind::Equal) {
            let rhs = self.expression();
            self.make_assignment(lhs, rhs)
        } else {
            lhs
        }
    }

    fn make_assignment(&mut self, mut lhs: Expr, mut rhs: Expr) -> Expr {
        let span = lhs.span;
        match &mut lhs.kind {
            ExprKind::NamedVariable { name, assign, .. } => {
                if assign.is_some() {
                    self.error_at(CompileErrorKind::ParseError, "invalid assignment target", span);
                    return lhs;
                }
                let name = *name;
                let constant = match self.resolve_slot_constness(&lhs.kind) {
                    Some(c) => c,
                    None => false,
                };
                if constant {
                    let text = self.shared.interns.get(name).to_string();
                    self.error_at(
                        CompileErrorKind::TypeError,
                        format!("can't assign to constant `{text}`"),
                        span,
                    );
                }
                self.adapt_literal(&mut rhs, lhs.ty);
                self.check_assignable(&rhs, lhs.ty, "assignment");
                if let ExprKind::NamedVariable { assign, .. } = &mut lhs.kind {
                    *assign = Some(Box::new(rhs));
                }
                lhs
            }
            ExprKind::Subscript { target, assign, .. } => {
                if assign.is_some() {
                    self.error_at(CompileErrorKind::ParseError, "invalid assignment target", span);
                    return lhs;
                }
                // Element type was computed for the read; the write checks
                // the incoming value against it. Map reads are optional, the
                // stored value is not.
                let target_ty = self.shared.registry.resolve(target.ty);
                let expected = match self.shared.registry.desc(target_ty).clone() {
                    TypeDesc::List { item } => item,
                    TypeDesc::Map { value, .. } => value,
                    _ => lhs.ty,
                };
                self.adapt_literal(&mut rhs, expected);
                self.check_assignable(&rhs, expected, "assignment");
                if let ExprKind::Subscript { assign, .. } = &mut lhs.kind {
                    *assign = Some(Box::new(rhs));
                }
                lhs.ty = expected;
                lhs
            }
            ExprKind::Dot { kind, assign, .. } => {
                if *kind != DotKind::Field || assign.is_some() {
                    self.error_at(CompileErrorKind::ParseError, "invalid assignment target", span);
                    return lhs;
                }
                self.adapt_literal(&mut rhs, lhs.ty);
                self.check_assignable(&rhs, lhs.ty, "assignment");
                if let ExprKind::Dot { assign, .. } = &mut lhs.kind {
                    *assign = Some(Box::new(rhs));
                }
                lhs
            }
            _ => {
                self.error_at(CompileErrorKind::ParseError, "invalid assignment target", span);
                lhs
            }
        }
    }

    fn resolve_slot_constness(&self, kind: &ExprKind) -> Option<bool> {
        let ExprKind::NamedVariable { slot, .. } = kind else {
            return None;
        };
        match slot {
            Slot::Local(idx) => Some(self.frame().locals[*idx as usize].constant),
            Slot::UpValue(idx) => Some(self.frame().upvalues[*idx as usize].constant),
            Slot::Global(g) => self
                .globals
                .iter()
                .chain(self.namespaces.values().flatten())
                .find(|sym| sym.slot == *g)
                .map(|sym| sym.constant),
        }
    }

    fn infix_precedence(kind: &TokenKind) -> u8 {
        match kind {
            TokenKind::Or | TokenKind::QuestionQuestion => P_OR,
            TokenKind::And => P_AND,
            TokenKind::Pipe => P_BIT_OR,
            TokenKind::Caret => P_BIT_XOR,
            TokenKind::Amp => P_BIT_AND,
            TokenKind::EqualEqual | TokenKind::BangEqual => P_EQUAL,
            TokenKind::Less
            | TokenKind::LessEqual
            | TokenKind::Greater
            | TokenKind::GreaterEqual
            | TokenKind::Is => P_CMP,
            TokenKind::ShiftLeft | TokenKind::ShiftRight => P_SHIFT,
            TokenKind::DotDot => P_RANGE,
            TokenKind::Plus | TokenKind::Minus => P_TERM,
            TokenKind::Star | TokenKind::Slash | TokenKind::Percent => P_FACTOR,
            TokenKind::LeftParen
            | TokenKind::LeftBracket
            | TokenKind::Dot
            | TokenKind::Question
            | TokenKind::Bang => P_CALL,
            _ => P_NONE,
        }
    }

    fn parse_precedence(&mut self, min: u8) -> Expr {
        let mut expr = self.prefix();
        loop {
            let prec = Self::infix_precedence(self.peek_kind());
            if prec == P_NONE || prec < min {
                break;
            }
            expr = self.infix(expr, prec);
        }
        expr
    }

    fn prefix(&mut self) -> Expr {
        let span = self.current_span();
        let prim = self.shared.registry.prim();
        match self.peek_kind().clone() {
            TokenKind::Integer(value) => {
                self.advance();
                Expr {
                    kind: ExprKind::Integer(value),
                    ty: prim.integer,
                    span,
                }
            }
            TokenKind::Float(value) => {
                self.advance();
                Expr {
                    kind: ExprKind::Float(value),
                    ty: prim.float,
                    span,
                }
            }
            TokenKind::True => {
                self.advance();
                Expr {
                    kind: ExprKind::Boolean(true),
                    ty: prim.boolean,
                    span,
                }
            }
            TokenKind::False => {
                self.advance();
                Expr {
                    kind: ExprKind::Boolean(false),
                    ty: prim.boolean,
                    span,
                }
            }
            TokenKind::Null => {
                self.advance();
                Expr {
                    kind: ExprKind::Null,
                    ty: self.null_type(),
                    span,
                }
            }
            TokenKind::Str(segments) => {
                self.advance();
                self.string_expression(segments, span)
            }
            TokenKind::Identifier(text) => {
                self.advance();
                let name = self.shared.interns.intern(&text);
                self.named_variable(name, span)
            }
            TokenKind::This => {
                self.advance();
                self.this_expression(span)
            }
            TokenKind::Super => {
                self.advance();
                self.super_expression(span)
            }
            TokenKind::LeftParen => {
                self.advance();
                let expr = self.expression();
                self.consume(&TokenKind::RightParen, "expected `)` after expression");
                expr
            }
            TokenKind::LeftBracket => {
                self.advance();
                self.list_literal(span)
            }
            TokenKind::LeftBrace => {
                self.advance();
                self.map_literal(span)
            }
            TokenKind::Minus => {
                self.advance();
                let operand = self.parse_precedence(P_UNARY);
                let ty = self.shared.registry.resolve(operand.ty);
                if ty != prim.integer && ty != prim.float {
                    let got = self.type_name(operand.ty);
                    self.error_at(
                        CompileErrorKind::TypeError,
                        format!("can't negate `{got}`"),
                        span,
                    );
                }
                Expr {
                    ty,
                    span,
                    kind: ExprKind::Unary {
                        op: UnaryOp::Negate,
                        operand: Box::new(operand),
                    },
                }
            }
            TokenKind::Bang => {
                self.advance();
                let operand = self.parse_precedence(P_UNARY);
                if self.shared.registry.resolve(operand.ty) != prim.boolean {
                    let got = self.type_name(operand.ty);
                    self.error_at(
                        CompileErrorKind::TypeError,
                        format!("`!` needs a `bool`, got `{got}`"),
                        span,
                    );
                }
                Expr {
                    ty: prim.boolean,
                    span,
                    kind: ExprKind::Unary {
                        op: UnaryOp::Not,
                        operand: Box::new(operand),
                    },
                }
            }
            TokenKind::Fun => {
                self.advance();
                self.anonymous_function(span)
            }
            other => {
                self.advance();
                self.error_at(
                    CompileErrorKind::ParseError,
                    format!("unexpected token {other:?} in expression"),
                    span,
                );
                self.error_expr(span)
            }
        }
    }

    fn string_expression(&mut self, segments: Vec<StrSegment>, span: Span) -> Expr {
        let prim = self.shared.registry.prim();
        if let [StrSegment::Literal(text)] = segments.as_slice() {
            return Expr {
                kind: ExprKind::StringLiteral(text.clone()),
                ty: prim.string,
                span,
            };
        }
        let mut parts = Vec::new();
        for segment in segments {
            match segment {
                StrSegment::Literal(text) => parts.push(Expr {
                    kind: ExprKind::StringLiteral(text),
                    ty: prim.string,
                    span,
                }),
                StrSegment::Expr(tokens) => {
                    let part = self.parse_token_run(tokens);
                    parts.push(part);
                }
            }
        }
        Expr {
            kind: ExprKind::String(parts),
            ty: prim.string,
            span,
        }
    }

    /// Re-enters the parser on an interpolation token run, in the current
    /// scope so segment expressions see enclosing locals.
    fn parse_token_run(&mut self, mut tokens: Vec<Token>) -> Expr {
        let eof_span = tokens.last().map_or(Span::default(), |t| t.span);
        tokens.push(Token {
            kind: TokenKind::Eof,
            span: eof_span,
        });
        let saved_tokens = mem::replace(&mut self.tokens, tokens);
        let saved_pos = mem::replace(&mut self.pos, 0);
        let expr = self.expression();
        if !self.check(&TokenKind::Eof) {
            self.error_here(
                CompileErrorKind::ParseError,
                "unexpected tokens after interpolated expression",
            );
        }
        self.tokens = saved_tokens;
        self.pos = saved_pos;
        expr
    }

    fn named_variable(&mut self, name: NameId, span: Span) -> Expr {
        // Namespace access: `ns.symbol`.
        if self.namespaces.contains_key(&name) && self.check(&TokenKind::Dot) {
            self.advance();
            if let Some(member) = self.identifier("expected symbol name after namespace") {
                let sym = self.namespaces[&name].iter().find(|s| s.name == member);
                if let Some(sym) = sym {
                    let (slot, ty) = (Slot::Global(sym.slot), sym.ty);
                    return self.named_symbol_expr(member, slot, ty, span);
                }
                let ns = self.shared.interns.get(name).to_string();
                let text = self.shared.interns.get(member).to_string();
                self.error_at(
                    CompileErrorKind::ParseError,
                    format!("module `{ns}` does not export `{text}`"),
                    span,
                );
            }
            return self.error_expr(span);
        }

        match self.resolve_name(name) {
            Some((slot, ty, _)) => self.named_symbol_expr(name, slot, ty, span),
            None => {
                let text = self.shared.interns.get(name).to_string();
                self.error_at(
                    CompileErrorKind::ParseError,
                    format!("undefined variable `{text}`"),
                    span,
                );
                self.error_expr(span)
            }
        }
    }

    /// Wraps a resolved symbol reference, expanding `Type{...}` object
    /// initializers when the symbol is an object type.
    fn named_symbol_expr(&mut self, name: NameId, slot: Slot, ty: TypeId, span: Span) -> Expr {
        let is_object = matches!(self.shared.registry.desc(ty), TypeDesc::Object { .. });
        if is_object && self.check(&TokenKind::LeftBrace) {
            let reference = Expr {
                kind: ExprKind::NamedVariable {
                    name,
                    slot,
                    assign: None,
                },
                ty,
                span,
            };
            return self.object_init(reference, span);
        }
        Expr {
            kind: ExprKind::NamedVariable {
                name,
                slot,
                assign: None,
            },
            ty,
            span,
        }
    }

    fn object_init(&mut self, object_expr: Expr, span: Span) -> Expr {
        let TypeDesc::Object { object } = self.shared.registry.desc(object_expr.ty).clone() else {
            self.error_at(CompileErrorKind::TypeError, "not an object type", span);
            return self.error_expr(span);
        };
        self.consume(&TokenKind::LeftBrace, "expected `{` in object initializer");
        let mut provided: Vec<(NameId, Expr)> = Vec::new();
        while !self.check(&TokenKind::RightBrace) && !self.check(&TokenKind::Eof) {
            let Some(field) = self.identifier("expected field name in object initializer") else {
                break;
            };
            self.consume(&TokenKind::Equal, "expected `=` after field name");
            let mut value = self.expression();
            match self.shared.registry.field_of(object, field) {
                Some(info) => {
                    self.adapt_literal(&mut value, info.ty);
                    self.check_assignable(&value, info.ty, "field value");
                }
                None => {
                    let text = self.shared.interns.get(field).to_string();
                    self.error_at(
                        CompileErrorKind::TypeError,
                        format!("no field `{text}` on this object"),
                        value.span,
                    );
                }
            }
            if provided.iter().any(|(n, _)| *n == field) {
                let text = self.shared.interns.get(field).to_string();
                self.error_at(
                    CompileErrorKind::ParseError,
                    format!("field `{text}` initialized twice"),
                    span,
                );
            }
            provided.push((field, value));
            if !self.matches(&TokenKind::Comma) {
                break;
            }
        }
        self.consume(&TokenKind::RightBrace, "expected `}` after object initializer");

        // Omitted fields fall back to declaration defaults; a missing field
        // with no default is a compile error.
        let mut defaults = Vec::new();
        for info in self.shared.registry.all_fields(object) {
            if provided.iter().any(|(n, _)| *n == info.name) {
                continue;
            }
            let fragment = if info.has_default {
                self.find_field_default(object, info.name)
            } else {
                None
            };
            match fragment {
                Some(expr) => defaults.push((info.name, expr)),
                None => {
                    let text = self.shared.interns.get(info.name).to_string();
                    self.error_at(
                        CompileErrorKind::TypeError,
                        format!("field `{text}` is not initialized"),
                        span,
                    );
                }
            }
        }

        let ty = self.shared.registry.object(object).instance_type;
        Expr {
            kind: ExprKind::ObjectInit {
                object_expr: Box::new(object_expr),
                fields: provided,
                defaults,
            },
            ty,
            span,
        }
    }

    fn find_field_default(&self, object: ObjectId, field: NameId) -> Option<Expr> {
        let mut current = Some(object);
        while let Some(obj) = current {
            if let Some(fragment) = self.shared.field_defaults.get(&(obj, field)) {
                return Some(fragment.clone());
            }
            current = self.shared.registry.object(obj).parent;
        }
        None
    }

    fn this_expression(&mut self, span: Span) -> Expr {
        let Some(object) = self.current_object else {
            self.error_at(
                CompileErrorKind::ParseError,
                "`this` is only valid inside methods",
                span,
            );
            return self.error_expr(span);
        };
        // Inside a method frame, the receiver is local slot 0 or reachable
        // as an upvalue from a nested anonymous function.
        let this = self.shared.interns.well_known().this;
        match self.resolve_name(this) {
            Some((slot, ty, _)) => Expr {
                kind: ExprKind::NamedVariable {
                    name: this,
                    slot,
                    assign: None,
                },
                ty,
                span,
            },
            None => {
                let _ = object;
                self.error_at(
                    CompileErrorKind::ParseError,
                    "`this` is only valid inside methods",
                    span,
                );
                self.error_expr(span)
            }
        }
    }

    fn super_expression(&mut self, span: Span) -> Expr {
        let Some(object) = self.current_object else {
            self.error_at(
                CompileErrorKind::ParseError,
                "`super` is only valid inside methods",
                span,
            );
            return self.error_expr(span);
        };
        let Some(parent) = self.shared.registry.object(object).parent else {
            self.error_at(
                CompileErrorKind::TypeError,
                "`super` needs a parent object",
                span,
            );
            return self.error_expr(span);
        };
        self.consume(&TokenKind::Dot, "expected `.` after `super`");
        let Some(method) = self.identifier("expected method name after `super.`") else {
            return self.error_expr(span);
        };
        let Some(info) = self.shared.registry.method_of(parent, method) else {
            let text = self.shared.interns.get(method).to_string();
            self.error_at(
                CompileErrorKind::TypeError,
                format!("parent object has no method `{text}`"),
                span,
            );
            return self.error_expr(span);
        };
        if !self.check(&TokenKind::LeftParen) {
            self.error_at(
                CompileErrorKind::ParseError,
                "`super` methods must be called",
                span,
            );
        }
        Expr {
            kind: ExprKind::Super { method },
            ty: info.ty,
            span,
        }
    }

    fn list_literal(&mut self, span: Span) -> Expr {
        let mut items = Vec::new();
        while !self.check(&TokenKind::RightBracket) && !self.check(&TokenKind::Eof) {
            items.push(self.expression());
            if !self.matches(&TokenKind::Comma) {
                break;
            }
        }
        self.consume(&TokenKind::RightBracket, "expected `]` after list items");
        let item_type = items
            .first()
            .map_or(self.shared.registry.prim().void, |item| item.ty);
        for item in items.iter().skip(1) {
            if !self.shared.registry.assignable(item.ty, item_type) {
                let want = self.type_name(item_type);
                let got = self.type_name(item.ty);
                self.error_at(
                    CompileErrorKind::TypeError,
                    format!("list item: expected `{want}`, got `{got}`"),
                    item.span,
                );
            }
        }
        let ty = self
            .shared
            .registry
            .intern(TypeDesc::List { item: item_type }, false);
        Expr {
            kind: ExprKind::List { item_type, items },
            ty,
            span,
        }
    }

    fn map_literal(&mut self, span: Span) -> Expr {
        let mut entries = Vec::new();
        while !self.check(&TokenKind::RightBrace) && !self.check(&TokenKind::Eof) {
            let key = self.expression();
            self.consume(&TokenKind::Colon, "expected `:` between map key and value");
            let value = self.expression();
            entries.push((key, value));
            if !self.matches(&TokenKind::Comma) {
                break;
            }
        }
        self.consume(&TokenKind::RightBrace, "expected `}` after map entries");
        let void = self.shared.registry.prim().void;
        let key_type = entries.first().map_or(void, |(k, _)| k.ty);
        let value_type = entries.first().map_or(void, |(_, v)| v.ty);
        for (key, value) in entries.iter().skip(1) {
            if !self.shared.registry.assignable(key.ty, key_type) {
                let want = self.type_name(key_type);
                self.error_at(
                    CompileErrorKind::TypeError,
                    format!("map key: expected `{want}`"),
                    key.span,
                );
            }
            if !self.shared.registry.assignable(value.ty, value_type) {
                let want = self.type_name(value_type);
                self.error_at(
                    CompileErrorKind::TypeError,
                    format!("map value: expected `{want}`"),
                    value.span,
                );
            }
        }
        let ty = self.shared.registry.intern(
            TypeDesc::Map {
                key: key_type,
                value: value_type,
            },
            false,
        );
        Expr {
            kind: ExprKind::Map {
                key_type,
                value_type,
                entries,
            },
            ty,
            span,
        }
    }

    fn anonymous_function(&mut self, span: Span) -> Expr {
        let params = match self.parse_params() {
            Some(params) => params,
            None => return self.error_expr(span),
        };
        let return_type = if self.matches(&TokenKind::Greater) {
            self.parse_type()
        } else {
            self.shared.registry.prim().void
        };
        let name = self.shared.interns.intern("$anonymous");
        let type_id =
            self.function_type_of(None, &params, return_type, FunctionKind::Anonymous);
        match self.parse_function_body(
            name,
            FunctionKind::Anonymous,
            type_id,
            return_type,
            params,
            span,
        ) {
            Some(function) => Expr {
                kind: ExprKind::Function(Box::new(function)),
                ty: type_id,
                span,
            },
            None => self.error_expr(span),
        }
    }

    fn infix(&mut self, lhs: Expr, prec: u8) -> Expr {
        let span = self.current_span();
        match self.peek_kind().clone() {
            TokenKind::LeftParen => {
                self.advance();
                self.finish_call(lhs, span)
            }
            TokenKind::LeftBracket => {
                self.advance();
                self.subscript(lhs, span)
            }
            TokenKind::Dot => {
                self.advance();
                self.dot(lhs, span)
            }
            TokenKind::Question => {
                self.advance();
                self.unwrap_expr(lhs, span, false)
            }
            TokenKind::Bang => {
                self.advance();
                self.unwrap_expr(lhs, span, true)
            }
            TokenKind::Is => {
                self.advance();
                let target = self.parse_type();
                Expr {
                    ty: self.shared.registry.prim().boolean,
                    span,
                    kind: ExprKind::Is {
                        value: Box::new(lhs),
                        target,
                    },
                }
            }
            TokenKind::DotDot => {
                self.advance();
                let rhs = self.parse_precedence(P_RANGE + 1);
                let int = self.shared.registry.prim().integer;
                if self.shared.registry.resolve(lhs.ty) != int
                    || self.shared.registry.resolve(rhs.ty) != int
                {
                    self.error_at(
                        CompileErrorKind::TypeError,
                        "range bounds must be `int`",
                        span,
                    );
                }
                Expr {
                    ty: self.shared.registry.prim().range,
                    span,
                    kind: ExprKind::Range {
                        low: Box::new(lhs),
                        high: Box::new(rhs),
                    },
                }
            }
            TokenKind::QuestionQuestion => {
                self.advance();
                let rhs = self.parse_precedence(prec + 1);
                self.null_coalesce(lhs, rhs, span)
            }
            op => {
                self.advance();
                let rhs = self.parse_precedence(prec + 1);
                self.binary(op, lhs, rhs, span)
            }
        }
    }

    fn unwrap_expr(&mut self, lhs: Expr, span: Span, force: bool) -> Expr {
        if !self.shared.registry.is_optional(lhs.ty) {
            let got = self.type_name(lhs.ty);
            let op = if force { "!" } else { "?" };
            self.error_at(
                CompileErrorKind::TypeError,
                format!("`{op}` needs an optional value, got `{got}`"),
                span,
            );
        }
        let ty = self.shared.registry.with_optional(lhs.ty, false);
        let kind = if force {
            ExprKind::ForceUnwrap {
                value: Box::new(lhs),
            }
        } else {
            ExprKind::Unwrap {
                value: Box::new(lhs),
            }
        };
        Expr { kind, ty, span }
    }

    fn null_coalesce(&mut self, lhs: Expr, mut rhs: Expr, span: Span) -> Expr {
        if !self.shared.registry.is_optional(lhs.ty) {
            let got = self.type_name(lhs.ty);
            self.error_at(
                CompileErrorKind::TypeError,
                format!("`??` needs an optional left operand, got `{got}`"),
                span,
            );
        }
        let peer = self.shared.registry.with_optional(lhs.ty, false);
        self.adapt_literal(&mut rhs, peer);
        self.check_assignable(&rhs, peer, "`??` fallback");
        Expr {
            ty: peer,
            span,
            kind: ExprKind::Binary {
                op: BinaryOp::NullCoalesce,
                left: Box::new(lhs),
                right: Box::new(rhs),
            },
        }
    }

    fn binary(&mut self, op_token: TokenKind, lhs: Expr, rhs: Expr, span: Span) -> Expr {
        let prim = self.shared.registry.prim();
        let lt = self.shared.registry.resolve(lhs.ty);
        let rt = self.shared.registry.resolve(rhs.ty);
        let (op, ty) = match op_token {
            TokenKind::Plus => {
                // `+` is polymorphic: numbers, strings, lists, maps.
                let ok = lt == rt
                    && (lt == prim.integer
                        || lt == prim.float
                        || lt == prim.string
                        || matches!(
                            self.shared.registry.desc(lt),
                            TypeDesc::List { .. } | TypeDesc::Map { .. }
                        ));
                if !ok {
                    self.binary_type_error("+", &lhs, &rhs, span);
                }
                (BinaryOp::Add, lt)
            }
            TokenKind::Minus | TokenKind::Star | TokenKind::Slash | TokenKind::Percent => {
                let ok = lt == rt && (lt == prim.integer || lt == prim.float);
                if !ok {
                    self.binary_type_error(op_name(&op_token), &lhs, &rhs, span);
                }
                let op = match op_token {
                    TokenKind::Minus => BinaryOp::Subtract,
                    TokenKind::Star => BinaryOp::Multiply,
                    TokenKind::Slash => BinaryOp::Divide,
                    _ => BinaryOp::Modulo,
                };
                (op, lt)
            }
            TokenKind::EqualEqual | TokenKind::BangEqual => {
                if lt != rt
                    && !self.shared.registry.assignable(lhs.ty, rhs.ty)
                    && !self.shared.registry.assignable(rhs.ty, lhs.ty)
                    && !matches!(lhs.kind, ExprKind::Null)
                    && !matches!(rhs.kind, ExprKind::Null)
                {
                    self.binary_type_error(op_name(&op_token), &lhs, &rhs, span);
                }
                let op = if matches!(op_token, TokenKind::EqualEqual) {
                    BinaryOp::Equal
                } else {
                    BinaryOp::NotEqual
                };
                (op, prim.boolean)
            }
            TokenKind::Less
            | TokenKind::LessEqual
            | TokenKind::Greater
            | TokenKind::GreaterEqual => {
                let ok = lt == rt && (lt == prim.integer || lt == prim.float);
                if !ok {
                    self.binary_type_error(op_name(&op_token), &lhs, &rhs, span);
                }
                let op = match op_token {
                    TokenKind::Less => BinaryOp::Less,
                    TokenKind::LessEqual => BinaryOp::LessEqual,
                    TokenKind::Greater => BinaryOp::Greater,
                    _ => BinaryOp::GreaterEqual,
                };
                (op, prim.boolean)
            }
            TokenKind::And | TokenKind::Or => {
                let ok = lt == prim.boolean && rt == prim.boolean;
                if !ok {
                    self.binary_type_error(op_name(&op_token), &lhs, &rhs, span);
                }
                let op = if matches!(op_token, TokenKind::And) {
                    BinaryOp::And
                } else {
                    BinaryOp::Or
                };
                (op, prim.boolean)
            }
            TokenKind::Amp | TokenKind::Pipe | TokenKind::Caret | TokenKind::ShiftLeft
            | TokenKind::ShiftRight => {
                let ok = lt == prim.integer && rt == prim.integer;
                if !ok {
                    self.binary_type_error(op_name(&op_token), &lhs, &rhs, span);
                }
                let op = match op_token {
                    TokenKind::Amp => BinaryOp::BitAnd,
                    TokenKind::Pipe => BinaryOp::BitOr,
                    TokenKind::Caret => BinaryOp::BitXor,
                    TokenKind::ShiftLeft => BinaryOp::ShiftLeft,
                    _ => BinaryOp::ShiftRight,
                };
                (op, prim.integer)
            }
            other => {
                self.error_at(
                    CompileErrorKind::ParseError,
                    format!("unexpected operator {other:?}"),
                    span,
                );
                (BinaryOp::Add, lt)
            }
        };
        Expr {
            ty,
            span,
            kind: ExprKind::Binary {
                op,
                left: Box::new(lhs),
                right: Box::new(rhs),
            },
        }
    }

    fn binary_type_error(&mut self, op: &str, lhs: &Expr, rhs: &Expr, span: Span) {
        let left = self.type_name(lhs.ty);
        let right = self.type_name(rhs.ty);
        self.error_at(
            CompileErrorKind::TypeError,
            format!("`{op}` can't combine `{left}` and `{right}`"),
            span,
        );
    }

    fn subscript(&mut self, target: Expr, span: Span) -> Expr {
        let index = self.expression();
        self.consume(&TokenKind::RightBracket, "expected `]` after subscript index");
        let prim = self.shared.registry.prim();
        let target_ty = self.shared.registry.resolve(target.ty);
        let ty = match self.shared.registry.desc(target_ty).clone() {
            TypeDesc::List { item } => {
                if self.shared.registry.resolve(index.ty) != prim.integer {
                    self.error_at(
                        CompileErrorKind::TypeError,
                        "list index must be `int`",
                        index.span,
                    );
                }
                item
            }
            TypeDesc::Map { key, value } => {
                if !self.shared.registry.assignable(index.ty, key) {
                    let want = self.type_name(key);
                    self.error_at(
                        CompileErrorKind::TypeError,
                        format!("map key must be `{want}`"),
                        index.span,
                    );
                }
                // Reads are optional: the key may be absent.
                self.shared.registry.with_optional(value, true)
            }
            _ => {
                let got = self.type_name(target.ty);
                self.error_at(
                    CompileErrorKind::TypeError,
                    format!("`{got}` is not subscriptable"),
                    span,
                );
                prim.void
            }
        };
        Expr {
            ty,
            span,
            kind: ExprKind::Subscript {
                target: Box::new(target),
                index: Box::new(index),
                assign: None,
            },
        }
    }

    fn dot(&mut self, target: Expr, span: Span) -> Expr {
        let Some(name) = self.identifier("expected property name after `.`") else {
            return self.error_expr(span);
        };
        if self.shared.registry.is_optional(target.ty)
            && !matches!(target.kind, ExprKind::Unwrap { .. } | ExprKind::ForceUnwrap { .. })
        {
            let got = self.type_name(target.ty);
            self.error_at(
                CompileErrorKind::TypeError,
                format!("`{got}` might be null; unwrap with `?` or `!` first"),
                span,
            );
        }
        let target_ty = self.shared.registry.resolve(target.ty);
        match self.shared.registry.desc(target_ty).clone() {
            TypeDesc::Instance { object } => {
                let TypeDesc::Object { object } = self.shared.registry.desc(object).clone()
                else {
                    return self.error_expr(span);
                };
                if let Some(field) = self.shared.registry.field_of(object, name) {
                    return Expr {
                        ty: field.ty,
                        span,
                        kind: ExprKind::Dot {
                            target: Box::new(target),
                            name,
                            kind: DotKind::Field,
                            assign: None,
                        },
                    };
                }
                if let Some(method) = self.shared.registry.method_of(object, name) {
                    if !self.check(&TokenKind::LeftParen) {
                        self.error_at(
                            CompileErrorKind::TypeError,
                            "methods must be called",
                            span,
                        );
                    }
                    return Expr {
                        ty: method.ty,
                        span,
                        kind: ExprKind::Dot {
                            target: Box::new(target),
                            name,
                            kind: DotKind::Method,
                            assign: None,
                        },
                    };
                }
                let text = self.shared.interns.get(name).to_string();
                self.error_at(
                    CompileErrorKind::TypeError,
                    format!("no field or method `{text}`"),
                    span,
                );
                self.error_expr(span)
            }
            TypeDesc::Enum { enum_ } => {
                let info = self.shared.registry.enum_info(enum_);
                match info.cases.iter().position(|&c| c == name) {
                    Some(index) => Expr {
                        ty: info.instance_type,
                        span,
                        kind: ExprKind::Dot {
                            target: Box::new(target),
                            name,
                            kind: DotKind::EnumCase(
                                u16::try_from(index).expect("case count checked at declaration"),
                            ),
                            assign: None,
                        },
                    },
                    None => {
                        let text = self.shared.interns.get(name).to_string();
                        self.error_at(
                            CompileErrorKind::TypeError,
                            format!("enum has no case `{text}`"),
                            span,
                        );
                        self.error_expr(span)
                    }
                }
            }
            TypeDesc::EnumInstance { enum_ } => {
                if name != self.shared.interns.well_known().value {
                    let text = self.shared.interns.get(name).to_string();
                    self.error_at(
                        CompileErrorKind::TypeError,
                        format!("enum cases only expose `value`, not `{text}`"),
                        span,
                    );
                    return self.error_expr(span);
                }
                let TypeDesc::Enum { enum_ } = self.shared.registry.desc(enum_).clone() else {
                    return self.error_expr(span);
                };
                let underlying = self.shared.registry.enum_info(enum_).underlying;
                Expr {
                    ty: underlying,
                    span,
                    kind: ExprKind::Dot {
                        target: Box::new(target),
                        name,
                        kind: DotKind::EnumValue,
                        assign: None,
                    },
                }
            }
            TypeDesc::List { item } => self.builtin_method(target, name, span, |wk, shared| {
                if name == wk.append {
                    let ret = shared.registry.prim().void;
                    Some(builtin_fn(shared, &[("item", item)], ret))
                } else if name == wk.len {
                    let ret = shared.registry.prim().integer;
                    Some(builtin_fn(shared, &[], ret))
                } else {
                    None
                }
            }),
            TypeDesc::Map { key, value } => {
                self.builtin_method(target, name, span, |wk, shared| {
                    if name == wk.size {
                        let ret = shared.registry.prim().integer;
                        Some(builtin_fn(shared, &[], ret))
                    } else if name == wk.remove {
                        let opt_value = shared.registry.with_optional(value, true);
                        Some(builtin_fn(shared, &[("key", key)], opt_value))
                    } else {
                        None
                    }
                })
            }
            TypeDesc::Str => self.builtin_method(target, name, span, |wk, shared| {
                if name == wk.len {
                    let ret = shared.registry.prim().integer;
                    Some(builtin_fn(shared, &[], ret))
                } else {
                    None
                }
            }),
            TypeDesc::Range => self.builtin_method(target, name, span, |wk, shared| {
                if name == wk.to_list {
                    let int = shared.registry.prim().integer;
                    let list = shared.registry.intern(TypeDesc::List { item: int }, false);
                    Some(builtin_fn(shared, &[], list))
                } else if name == wk.len {
                    let ret = shared.registry.prim().integer;
                    Some(builtin_fn(shared, &[], ret))
                } else {
                    None
                }
            }),
            _ => {
                let got = self.type_name(target.ty);
                self.error_at(
                    CompileErrorKind::TypeError,
                    format!("`{got}` has no properties"),
                    span,
                );
                self.error_expr(span)
            }
        }
    }

    fn builtin_method(
        &mut self,
        target: Expr,
        name: NameId,
        span: Span,
        resolve: impl FnOnce(&crate::intern::WellKnown, &mut Shared) -> Option<TypeId>,
    ) -> Expr {
        let well_known = *self.shared.interns.well_known();
        match resolve(&well_known, self.shared) {
            Some(ty) => {
                if !self.check(&TokenKind::LeftParen) {
                    self.error_at(CompileErrorKind::TypeError, "methods must be called", span);
                }
                Expr {
                    ty,
                    span,
                    kind: ExprKind::Dot {
                        target: Box::new(target),
                        name,
                        kind: DotKind::BuiltinMethod,
                        assign: None,
                    },
                }
            }
            None => {
                let text = self.shared.interns.get(name).to_string();
                let got = self.type_name(target.ty);
                self.error_at(
                    CompileErrorKind::TypeError,
                    format!("`{got}` has no method `{text}`"),
                    span,
                );
                self.error_expr(span)
            }
        }
    }

    /// Parses a call's arguments, binds positional and named arguments to
    /// the callee's parameters, and fills omitted parameters from their
    /// default fragments so each call re-evaluates them.
    fn finish_call(&mut self, callee: Expr, span: Span) -> Expr {
        let callee_ty = self.shared.registry.resolve(callee.ty);
        let TypeDesc::Function(ft) = self.shared.registry.desc(callee_ty).clone() else {
            let got = self.type_name(callee.ty);
            self.error_at(
                CompileErrorKind::TypeError,
                format!("`{got}` is not callable"),
                span,
            );
            // Consume the argument list to recover.
            let mut depth = 1usize;
            while depth > 0 && !self.check(&TokenKind::Eof) {
                match self.peek_kind() {
                    TokenKind::LeftParen => depth += 1,
                    TokenKind::RightParen => depth -= 1,
                    _ => {}
                }
                self.advance();
            }
            return self.error_expr(span);
        };

        let mut bound: Vec<Option<Expr>> = vec![None; ft.params.len()];
        let mut next_positional = 0usize;
        let mut seen_named = false;
        if !self.check(&TokenKind::RightParen) {
            loop {
                // `name: expr` is a named argument; `$` names the first
                // parameter regardless of its declared name.
                let named = if let TokenKind::Identifier(text) = self.peek_kind()
                    && matches!(self.peek_at(1), TokenKind::Colon)
                {
                    let text = text.clone();
                    self.advance();
                    self.advance();
                    Some(self.shared.interns.intern(&text))
                } else {
                    None
                };
                let mut value = self.expression();
                match named {
                    Some(arg_name) => {
                        seen_named = true;
                        let index = if self.shared.interns.get(arg_name) == "$" {
                            Some(0)
                        } else {
                            ft.param_index(arg_name)
                        };
                        match index {
                            Some(index) => {
                                if bound[index].is_some() {
                                    self.error_at(
                                        CompileErrorKind::TypeError,
                                        "argument bound twice",
                                        value.span,
                                    );
                                }
                                let expected = ft.params[index].1;
                                self.adapt_literal(&mut value, expected);
                                self.check_assignable(&value, expected, "argument");
                                bound[index] = Some(value);
                            }
                            None => {
                                let text = self.shared.interns.get(arg_name).to_string();
                                self.error_at(
                                    CompileErrorKind::TypeError,
                                    format!("no parameter named `{text}`"),
                                    value.span,
                                );
                            }
                        }
                    }
                    None => {
                        if seen_named {
                            self.error_at(
                                CompileErrorKind::ParseError,
                                "positional arguments must precede named arguments",
                                value.span,
                            );
                        }
                        if next_positional >= ft.params.len() {
                            self.error_at(
                                CompileErrorKind::TypeError,
                                format!("expected at most {} arguments", ft.params.len()),
                                value.span,
                            );
                        } else {
                            let expected = ft.params[next_positional].1;
                            self.adapt_literal(&mut value, expected);
                            self.check_assignable(&value, expected, "argument");
                            bound[next_positional] = Some(value);
                            next_positional += 1;
                        }
                    }
                }
                if !self.matches(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(&TokenKind::RightParen, "expected `)` after arguments");

        // Fill omitted parameters from declaration defaults.
        let fragments = self.call_default_fragments(&callee);
        let mut args = Vec::with_capacity(ft.params.len());
        for (index, slot_value) in bound.into_iter().enumerate() {
            match slot_value {
                Some(value) => args.push(value),
                None => {
                    let fragment = fragments.as_ref().and_then(|f| f.get(index).cloned().flatten());
                    match fragment {
                        Some(fragment) => args.push(fragment),
                        None => {
                            let (param_name, _) = ft.params[index];
                            let text = self.shared.interns.get(param_name).to_string();
                            // A defaulted parameter is only reachable through
                            // a direct reference to the declaration.
                            let message = if ft.defaults.get(index).copied().unwrap_or(false) {
                                format!(
                                    "missing argument `{text}`; defaults need a direct call"
                                )
                            } else {
                                format!("missing argument `{text}`")
                            };
                            self.error_at(CompileErrorKind::TypeError, message, span);
                            args.push(self.error_expr(span));
                        }
                    }
                }
            }
        }

        // Catch clauses attach to the call site.
        let mut catches = Vec::new();
        while self.check(&TokenKind::Catch) {
            if let Some(clause) = self.catch_clause(ft.ret) {
                catches.push(clause);
            } else {
                break;
            }
        }

        Expr {
            ty: ft.ret,
            span,
            kind: ExprKind::Call {
                callee: Box::new(callee),
                args,
                catches,
            },
        }
    }

    /// Default fragments are only reachable through direct references to a
    /// declaration: a global function, a method, or `super`.
    fn call_default_fragments(&self, callee: &Expr) -> Option<Vec<Option<Expr>>> {
        match &callee.kind {
            ExprKind::NamedVariable {
                slot: Slot::Global(slot),
                ..
            } => self
                .globals
                .iter()
                .chain(self.namespaces.values().flatten())
                .find(|sym| sym.slot == *slot)
                .and_then(|sym| match &sym.kind {
                    SymbolKind::Function { defaults } => Some(defaults.clone()),
                    _ => None,
                }),
            ExprKind::Dot {
                target,
                name,
                kind: DotKind::Method,
                ..
            } => {
                let target_ty = self.shared.registry.resolve(target.ty);
                let TypeDesc::Instance { object } = self.shared.registry.desc(target_ty) else {
                    return None;
                };
                let TypeDesc::Object { object } = self.shared.registry.desc(*object) else {
                    return None;
                };
                let mut current = Some(*object);
                while let Some(obj) = current {
                    if let Some(defaults) = self.shared.method_defaults.get(&(obj, *name)) {
                        return Some(defaults.clone());
                    }
                    current = self.shared.registry.object(obj).parent;
                }
                None
            }
            ExprKind::Super { method } => {
                let object = self.current_object?;
                let mut current = self.shared.registry.object(object).parent;
                while let Some(obj) = current {
                    if let Some(defaults) = self.shared.method_defaults.get(&(obj, *method)) {
                        return Some(defaults.clone());
                    }
                    current = self.shared.registry.object(obj).parent;
                }
                None
            }
            _ => None,
        }
    }

    /// `catch (type name) { ... }` — an anonymous function receiving the
    /// thrown value; its result replaces the call's result.
    fn catch_clause(&mut self, call_result: TypeId) -> Option<Expr> {
        let span = self.current_span();
        self.advance();
        self.consume(&TokenKind::LeftParen, "expected `(` after `catch`");
        let param_ty = self.parse_type();
        let param_name = self.identifier("expected catch parameter name")?;
        self.consume(&TokenKind::RightParen, "expected `)` after catch parameter");
        let params = vec![Param {
            name: param_name,
            ty: param_ty,
            default: None,
        }];
        let name = self.shared.interns.intern("$catch");
        let type_id = self.function_type_of(None, &params, call_result, FunctionKind::Catch);
        let function = self.parse_function_body(
            name,
            FunctionKind::Catch,
            type_id,
            call_result,
            params,
            span,
        )?;
        Some(Expr {
            kind: ExprKind::Function(Box::new(function)),
            ty: type_id,
            span,
        })
    }
}

fn op_name(token: &TokenKind) -> &'static str {
    match token {
        TokenKind::Plus => "+",
        TokenKind::Minus => "-",
        TokenKind::Star => "*",
        TokenKind::Slash => "/",
        TokenKind::Percent => "%",
        TokenKind::EqualEqual => "==",
        TokenKind::BangEqual => "!=",
        TokenKind::Less => "<",
        TokenKind::LessEqual => "<=",
        TokenKind::Greater => ">",
        TokenKind::GreaterEqual => ">=",
        TokenKind::And => "and",
        TokenKind::Or => "or",
        TokenKind::Amp => "&",
        TokenKind::Pipe => "|",
        TokenKind::Caret => "^",
        TokenKind::ShiftLeft => "<<",
        TokenKind::ShiftRight => ">>",
        _ => "?",
    }
}

fn builtin_fn(shared: &mut Shared, params: &[(&str, TypeId)], ret: TypeId) -> TypeId {
    let params: Vec<(NameId, TypeId)> = params
        .iter()
        .map(|&(name, ty)| (shared.interns.intern(name), ty))
        .collect();
    let defaults = vec![false; params.len()];
    shared.registry.intern(
        TypeDesc::Function(FunctionType {
            name: None,
            params,
            defaults,
            ret,
            kind: FunctionKind::Extern,
        }),
        false,
    )
}

/// Whether an expression references frame-relative slots; default fragments
/// must not, because they are re-emitted at call sites in other frames.
fn expr_uses_locals(expr: &Expr) -> bool {
    match &expr.kind {
        ExprKind::Null
        | ExprKind::Boolean(_)
        | ExprKind::Integer(_)
        | ExprKind::Float(_)
        | ExprKind::StringLiteral(_) => false,
        ExprKind::NamedVariable { slot, assign, .. } => {
            !matches!(slot, Slot::Global(_))
                || assign.as_ref().is_some_and(|a| expr_uses_locals(a))
        }
        ExprKind::String(parts) | ExprKind::List { items: parts, .. } => {
            parts.iter().any(expr_uses_locals)
        }
        ExprKind::Map { entries, .. } => entries
            .iter()
            .any(|(k, v)| expr_uses_locals(k) || expr_uses_locals(v)),
        ExprKind::Range { low, high } => expr_uses_locals(low) || expr_uses_locals(high),
        ExprKind::Unary { operand, .. } => expr_uses_locals(operand),
        ExprKind::Binary { left, right, .. } => {
            expr_uses_locals(left) || expr_uses_locals(right)
        }
        ExprKind::Is { value, .. }
        | ExprKind::Unwrap { value }
        | ExprKind::ForceUnwrap { value } => expr_uses_locals(value),
        ExprKind::Subscript {
            target,
            index,
            assign,
        } => {
            expr_uses_locals(target)
                || expr_uses_locals(index)
                || assign.as_ref().is_some_and(|a| expr_uses_locals(a))
        }
        ExprKind::Dot { target, assign, .. } => {
            expr_uses_locals(target) || assign.as_ref().is_some_and(|a| expr_uses_locals(a))
        }
        ExprKind::Super { .. } => true,
        ExprKind::ObjectInit {
            object_expr,
            fields,
            defaults,
        } => {
            expr_uses_locals(object_expr)
                || fields.iter().any(|(_, v)| expr_uses_locals(v))
                || defaults.iter().any(|(_, v)| expr_uses_locals(v))
        }
        ExprKind::Call {
            callee,
            args,
            catches,
        } => {
            expr_uses_locals(callee)
                || args.iter().any(expr_uses_locals)
                || catches.iter().any(expr_uses_locals)
        }
        // A nested function value captures through upvalues, which are
        // frame-relative.
        ExprKind::Function(function) => !function.upvalues.is_empty(),
    }
}
