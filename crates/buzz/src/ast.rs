//! The typed abstract syntax tree.
//!
//! Nodes are tagged variants; per-node state lives in the variant payload and
//! the code generator dispatches on the tag. Every expression carries the
//! `TypeId` the checker assigned it — by the time a tree reaches the code
//! generator, no node is left with an unresolved placeholder type.
//!
//! Name resolution happens during parsing: variable references carry their
//! resolved [`Slot`], blocks record which locals end with them (and whether
//! those locals were captured), and functions carry their upvalue capture
//! descriptors. The code generator never re-walks scopes.

use crate::{
    error::Span,
    heap::HeapId,
    intern::NameId,
    typedef::{EnumId, FunctionKind, ObjectId, TypeId},
};

/// Where a resolved name lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    /// Stack slot relative to the enclosing frame's base.
    Local(u8),
    /// Index into the enclosing closure's upvalues.
    UpValue(u8),
    /// Index into the module-wide globals array.
    Global(u32),
}

/// Unary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Negate,
    Not,
}

/// Binary operators after desugaring (`!=`, `<=`, `>=` lower to the negated
/// primitive during code generation).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
    Equal,
    NotEqual,
    Greater,
    GreaterEqual,
    Less,
    LessEqual,
    And,
    Or,
    /// `??`.
    NullCoalesce,
    BitAnd,
    BitOr,
    BitXor,
    ShiftLeft,
    ShiftRight,
}

/// How a `Dot` access resolves on its receiver type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DotKind {
    /// Instance field read or write.
    Field,
    /// Instance method; must be called.
    Method,
    /// `SomeEnum.case`.
    EnumCase(u16),
    /// `someCase.value`.
    EnumValue,
    /// A method the VM implements directly on lists, maps, strings, ranges.
    BuiltinMethod,
}

/// A captured-variable descriptor emitted after `CLOSURE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpvalDesc {
    /// Captures a local of the directly enclosing function when true,
    /// otherwise an upvalue of the enclosing closure.
    pub is_local: bool,
    pub index: u8,
}

/// A local going out of scope at the end of a block.
#[derive(Debug, Clone, Copy)]
pub struct EndedLocal {
    /// Captured locals are closed into their upvalue instead of popped.
    pub captured: bool,
}

/// A brace-delimited scope.
#[derive(Debug, Clone, Default)]
pub struct Block {
    pub statements: Vec<Stmt>,
    /// Locals ending with this block, innermost-last declaration first.
    pub ended: Vec<EndedLocal>,
}

/// A declared parameter with its optional default-value fragment.
///
/// Defaults stay as AST so every call site evaluates them freshly; a mutable
/// default (list, map) therefore produces a new object per call.
#[derive(Debug, Clone)]
pub struct Param {
    pub name: NameId,
    pub ty: TypeId,
    pub default: Option<Expr>,
}

/// A fully parsed and resolved function body.
#[derive(Debug, Clone)]
pub struct FunctionAst {
    pub name: NameId,
    pub kind: FunctionKind,
    pub type_id: TypeId,
    pub return_type: TypeId,
    pub params: Vec<Param>,
    pub body: Block,
    pub upvalues: Vec<UpvalDesc>,
    /// Display name of a `test "..."` block.
    pub test_name: Option<Box<str>>,
    pub span: Span,
}

/// A field declared in an `object` body.
#[derive(Debug, Clone)]
pub struct FieldDecl {
    pub name: NameId,
    pub ty: TypeId,
    pub default: Option<Expr>,
}

/// An `object` declaration.
#[derive(Debug, Clone)]
pub struct ObjectDeclAst {
    pub name: NameId,
    pub object: ObjectId,
    /// Global slot the object value is defined into.
    pub slot: u32,
    /// Global slot of the parent object, when inheriting.
    pub parent_slot: Option<u32>,
    pub fields: Vec<FieldDecl>,
    pub methods: Vec<FunctionAst>,
}

/// An `enum` declaration.
#[derive(Debug, Clone)]
pub struct EnumDeclAst {
    pub name: NameId,
    pub enum_: EnumId,
    pub slot: u32,
    pub underlying: TypeId,
    pub cases: Vec<NameId>,
}

/// An expression with its checked type.
#[derive(Debug, Clone)]
pub struct Expr {
    pub kind: ExprKind,
    pub ty: TypeId,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub enum ExprKind {
    Null,
    Boolean(bool),
    Integer(i32),
    Float(f64),
    StringLiteral(Box<str>),
    /// Interpolated string: literal and expression segments in order.
    String(Vec<Expr>),
    List {
        item_type: TypeId,
        items: Vec<Expr>,
    },
    Map {
        key_type: TypeId,
        value_type: TypeId,
        entries: Vec<(Expr, Expr)>,
    },
    Range {
        low: Box<Expr>,
        high: Box<Expr>,
    },
    NamedVariable {
        name: NameId,
        slot: Slot,
        /// Present for `name = value`.
        assign: Option<Box<Expr>>,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Is {
        value: Box<Expr>,
        target: TypeId,
    },
    /// Null-safe postfix `?`: skips the rest of the enclosing expression
    /// when the value is null.
    Unwrap {
        value: Box<Expr>,
    },
    /// Postfix `!`: throws when the value is null.
    ForceUnwrap {
        value: Box<Expr>,
    },
    Subscript {
        target: Box<Expr>,
        index: Box<Expr>,
        /// Present for `target[index] = value`.
        assign: Option<Box<Expr>>,
    },
    Dot {
        target: Box<Expr>,
        name: NameId,
        kind: DotKind,
        /// Present for `target.name = value`.
        assign: Option<Box<Expr>>,
    },
    /// `super.method(...)`; only valid as a call callee inside methods.
    Super {
        method: NameId,
    },
    /// `Type{ field = value, ... }` with the omitted-field defaults the
    /// checker resolved from the declaration chain.
    ObjectInit {
        object_expr: Box<Expr>,
        fields: Vec<(NameId, Expr)>,
        defaults: Vec<(NameId, Expr)>,
    },
    Call {
        callee: Box<Expr>,
        /// Arguments normalized to declaration order, defaults included.
        args: Vec<Expr>,
        /// Catch clauses attached to this call site.
        catches: Vec<Expr>,
    },
    /// Anonymous function or catch clause body.
    Function(Box<FunctionAst>),
}

/// A statement.
#[derive(Debug, Clone)]
pub struct Stmt {
    pub kind: StmtKind,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub enum StmtKind {
    Expression(Expr),
    VarDeclaration {
        name: NameId,
        ty: TypeId,
        slot: Slot,
        constant: bool,
        initializer: Option<Expr>,
    },
    /// Named function declaration bound to a global slot.
    FunDeclaration {
        slot: u32,
        function: FunctionAst,
    },
    ObjectDeclaration(ObjectDeclAst),
    EnumDeclaration(EnumDeclAst),
    /// A compiled import: run the module closure once, then receive its
    /// exports into this module's global slots.
    Import {
        closure: HeapId,
        global_base: u32,
        count: u32,
    },
    If {
        condition: Expr,
        then_branch: Block,
        else_branch: Option<Box<Stmt>>,
    },
    While {
        condition: Expr,
        body: Block,
    },
    DoUntil {
        body: Block,
        condition: Expr,
    },
    For {
        initializer: Option<Box<Stmt>>,
        condition: Expr,
        increment: Option<Expr>,
        body: Block,
        /// Loop-scope locals (the induction variable) ended after the loop.
        ended: Vec<EndedLocal>,
    },
    ForEach {
        key_slot: u8,
        value_slot: u8,
        iterable: Expr,
        body: Block,
        /// Loop-scope locals (key, value, hidden iterable) ended after.
        ended: Vec<EndedLocal>,
    },
    Return {
        value: Option<Expr>,
    },
    /// `break`, with the body-scope locals it must discard before jumping.
    Break {
        pops: Vec<EndedLocal>,
    },
    /// `continue`, with the body-scope locals it must discard before jumping.
    Continue {
        pops: Vec<EndedLocal>,
    },
    Throw {
        value: Expr,
    },
    Block(Block),
}

/// One exported symbol: which global slot it occupies in the exporting
/// module, in export order.
#[derive(Debug, Clone, Copy)]
pub struct ExportedGlobal {
    pub slot: u32,
}

/// A compiled-to-AST module, ready for code generation.
#[derive(Debug, Clone)]
pub struct ModuleAst {
    pub function: FunctionAst,
    pub exports: Vec<ExportedGlobal>,
    /// Global slots and display names of `test` blocks, in source order.
    pub tests: Vec<(u32, Box<str>)>,
    /// Global slot of `main`, when declared.
    pub main_slot: Option<u32>,
}
