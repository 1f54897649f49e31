//! Lowers the typed AST to bytecode.
//!
//! The parser already resolved names, types, and scopes, so lowering is a
//! single traversal per function: emit words, patch forward jumps, collect
//! per-loop break/continue lists, and maintain the pending-jump stack that
//! short-circuits null-safe chains (`?.`) to the end of their enclosing
//! chain expression.

use crate::{
    ast::{
        BinaryOp, Block, DotKind, EndedLocal, EnumDeclAst, ExportedGlobal, Expr, ExprKind,
        FunctionAst, ModuleAst, ObjectDeclAst, Slot, Stmt, StmtKind, UnaryOp,
    },
    heap::{Heap, HeapId},
    intern::Interns,
    typedef::{TypeDesc, TypeRegistry},
    value::{Obj, ObjClosure, ObjFunction, Value},
};

use super::{
    builder::{ChunkBuilder, JumpLabel},
    op::Op,
};

/// What the module body does after its top-level statements.
pub(crate) enum CompileMode {
    /// Imported module: stage its exported globals.
    Script,
    /// Entry script: invoke `main` when declared, passing script arguments.
    Entry { args: Vec<String> },
    /// Test entry: invoke every `test` block and report it.
    TestEntry { print_slot: u32 },
}

/// Compiles a parsed module into a closure ready to call.
pub(crate) fn compile_module(
    heap: &mut Heap,
    interns: &Interns,
    registry: &TypeRegistry,
    module: &ModuleAst,
    mode: &CompileMode,
) -> HeapId {
    let mut compiler = Compiler {
        heap,
        interns,
        registry,
    };
    let tail = match mode {
        CompileMode::Script => Tail::Exports(&module.exports),
        CompileMode::Entry { args } => match module.main_slot {
            Some(slot) => Tail::Main {
                slot,
                arity: main_arity(module, slot),
                args,
            },
            None => Tail::None,
        },
        CompileMode::TestEntry { print_slot } => Tail::Tests {
            tests: &module.tests,
            print_slot: *print_slot,
        },
    };
    let function = compiler.compile_function(&module.function, None, tail);
    compiler.heap.alloc(Obj::Closure(ObjClosure {
        function,
        upvalues: Vec::new(),
    }))
}

fn main_arity(module: &ModuleAst, main_slot: u32) -> u8 {
    for stmt in &module.function.body.statements {
        if let StmtKind::FunDeclaration { slot, function } = &stmt.kind
            && *slot == main_slot
        {
            return u8::try_from(function.params.len()).expect("arity checked by parser");
        }
    }
    0
}

enum Tail<'m> {
    None,
    Exports(&'m [ExportedGlobal]),
    Main {
        slot: u32,
        arity: u8,
        args: &'m [String],
    },
    Tests {
        tests: &'m [(u32, Box<str>)],
        print_slot: u32,
    },
}

/// Per-loop patch lists.
struct LoopCtx {
    /// Backward continue target when known at loop entry; `for` and
    /// `do-until` patch their forward continue jumps later instead.
    continue_target: Option<usize>,
    breaks: Vec<JumpLabel>,
    continues: Vec<JumpLabel>,
}

/// Per-function emission state.
struct FnCtx {
    builder: ChunkBuilder,
    loops: Vec<LoopCtx>,
    /// Pending null-chain exits, one list per open chain expression.
    optional_jumps: Vec<Vec<JumpLabel>>,
    /// Global slot of the enclosing object's parent, for `super` dispatch.
    parent_slot: Option<u32>,
}

struct Compiler<'a> {
    heap: &'a mut Heap,
    interns: &'a Interns,
    registry: &'a TypeRegistry,
}

impl Compiler<'_> {
    fn compile_function(
        &mut self,
        fun: &FunctionAst,
        parent_slot: Option<u32>,
        tail: Tail<'_>,
    ) -> HeapId {
        let empty = Value::Obj(self.heap.intern_string(""));
        let mut ctx = FnCtx {
            builder: ChunkBuilder::new(empty),
            loops: Vec::new(),
            optional_jumps: Vec::new(),
            parent_slot,
        };
        ctx.builder.set_line(fun.span.line);

        for stmt in &fun.body.statements {
            self.emit_stmt(&mut ctx, stmt);
        }
        debug_assert!(fun.body.ended.is_empty(), "function bodies end at RETURN");
        self.emit_tail(&mut ctx, &tail);

        // Falling off the end returns void; unreachable after an explicit
        // return, but harmless.
        ctx.builder.emit(Op::Void, 0);
        ctx.builder.emit(Op::Return, 0);

        let chunk = ctx.builder.build();
        self.heap.alloc(Obj::Function(ObjFunction {
            name: fun.name,
            kind: fun.kind,
            arity: u8::try_from(fun.params.len()).expect("arity checked by parser"),
            upvalue_count: u8::try_from(fun.upvalues.len()).expect("upvalues checked by parser"),
            chunk,
            type_id: fun.type_id,
        }))
    }

    fn emit_tail(&mut self, ctx: &mut FnCtx, tail: &Tail<'_>) {
        match tail {
            Tail::None => {}
            Tail::Exports(exports) => {
                for export in *exports {
                    ctx.builder.emit(Op::GetGlobal, export.slot);
                }
                let count = u32::try_from(exports.len()).expect("export count fits in u32");
                ctx.builder.emit(Op::Export, count);
            }
            Tail::Main { slot, arity, args } => {
                ctx.builder.emit(Op::GetGlobal, *slot);
                if *arity == 1 {
                    let item = self.registry.prim().string;
                    ctx.builder
                        .emit(Op::List, u32::try_from(item.index()).expect("type id fits"));
                    for arg in *args {
                        let value = Value::Obj(self.heap.intern_string(arg));
                        ctx.builder.emit_constant(value);
                        ctx.builder.emit(Op::AppendList, 0);
                    }
                    ctx.builder.emit(Op::Call, 0);
                    ctx.builder.emit_word(pack_call(1, 0));
                } else {
                    ctx.builder.emit(Op::Call, 0);
                    ctx.builder.emit_word(pack_call(0, 0));
                }
                ctx.builder.emit(Op::Pop, 0);
            }
            Tail::Tests { tests, print_slot } => {
                for (slot, name) in *tests {
                    ctx.builder.emit(Op::GetGlobal, *slot);
                    ctx.builder.emit(Op::Call, 0);
                    ctx.builder.emit_word(pack_call(0, 0));
                    ctx.builder.emit(Op::Pop, 0);

                    ctx.builder.emit(Op::GetGlobal, *print_slot);
                    let line = Value::Obj(self.heap.intern_string(&format!("\u{2713} {name}")));
                    ctx.builder.emit_constant(line);
                    ctx.builder.emit(Op::Call, 0);
                    ctx.builder.emit_word(pack_call(1, 0));
                    ctx.builder.emit(Op::Pop, 0);
                }
            }
        }
    }

    // ----- statements -----------------------------------------------------

    fn emit_stmt(&mut self, ctx: &mut FnCtx, stmt: &Stmt) {
        ctx.builder.set_line(stmt.span.line);
        match &stmt.kind {
            StmtKind::Expression(expr) => {
                self.emit_root(ctx, expr);
                ctx.builder.emit(Op::Pop, 0);
            }
            StmtKind::VarDeclaration {
                slot, initializer, ..
            } => {
                match initializer {
                    Some(value) => self.emit_root(ctx, value),
                    None => ctx.builder.emit(Op::Null, 0),
                }
                match slot {
                    // The initialized value simply becomes the local's slot.
                    Slot::Local(_) => {}
                    Slot::Global(slot) => ctx.builder.emit(Op::DefineGlobal, *slot),
                    Slot::UpValue(_) => unreachable!("declarations never bind upvalues"),
                }
            }
            StmtKind::FunDeclaration { slot, function } => {
                self.emit_closure(ctx, function);
                ctx.builder.emit(Op::DefineGlobal, *slot);
            }
            StmtKind::ObjectDeclaration(decl) => self.emit_object_decl(ctx, decl),
            StmtKind::EnumDeclaration(decl) => self.emit_enum_decl(ctx, decl),
            StmtKind::Import {
                closure,
                global_base,
                count,
            } => {
                ctx.builder.emit_constant(Value::Obj(*closure));
                ctx.builder.emit(Op::Import, *count);
                ctx.builder.emit_word(*global_base);
            }
            StmtKind::If {
                condition,
                then_branch,
                else_branch,
            } => {
                self.emit_root(ctx, condition);
                let else_jump = ctx.builder.emit_jump(Op::JumpIfFalse);
                self.emit_block(ctx, then_branch);
                match else_branch {
                    Some(else_stmt) => {
                        let end_jump = ctx.builder.emit_jump(Op::Jump);
                        ctx.builder.patch_jump(else_jump);
                        self.emit_stmt(ctx, else_stmt);
                        ctx.builder.patch_jump(end_jump);
                    }
                    None => ctx.builder.patch_jump(else_jump),
                }
            }
            StmtKind::While { condition, body } => {
                let head = ctx.builder.offset();
                self.emit_root(ctx, condition);
                let exit = ctx.builder.emit_jump(Op::JumpIfFalse);
                ctx.loops.push(LoopCtx {
                    continue_target: Some(head),
                    breaks: Vec::new(),
                    continues: Vec::new(),
                });
                self.emit_block(ctx, body);
                ctx.builder.emit_loop(head);
                ctx.builder.patch_jump(exit);
                self.finish_loop(ctx, None);
            }
            StmtKind::DoUntil { body, condition } => {
                let head = ctx.builder.offset();
                ctx.loops.push(LoopCtx {
                    continue_target: None,
                    breaks: Vec::new(),
                    continues: Vec::new(),
                });
                self.emit_block(ctx, body);
                let condition_at = ctx.builder.offset();
                self.patch_continues(ctx, condition_at);
                self.emit_root(ctx, condition);
                ctx.builder.emit(Op::Not, 0);
                let exit = ctx.builder.emit_jump(Op::JumpIfFalse);
                ctx.builder.emit_loop(head);
                ctx.builder.patch_jump(exit);
                self.finish_loop(ctx, None);
            }
            StmtKind::For {
                initializer,
                condition,
                increment,
                body,
                ended,
            } => {
                if let Some(init) = initializer {
                    self.emit_stmt(ctx, init);
                }
                let head = ctx.builder.offset();
                self.emit_root(ctx, condition);
                let exit = ctx.builder.emit_jump(Op::JumpIfFalse);
                ctx.loops.push(LoopCtx {
                    continue_target: None,
                    breaks: Vec::new(),
                    continues: Vec::new(),
                });
                self.emit_block(ctx, body);
                let increment_at = ctx.builder.offset();
                self.patch_continues(ctx, increment_at);
                if let Some(incr) = increment {
                    self.emit_root(ctx, incr);
                    ctx.builder.emit(Op::Pop, 0);
                }
                ctx.builder.emit_loop(head);
                ctx.builder.patch_jump(exit);
                self.finish_loop(ctx, Some(ended));
            }
            StmtKind::ForEach {
                key_slot,
                value_slot,
                iterable,
                body,
                ended,
            } => {
                // Key, value, and the hidden iterable occupy three
                // consecutive loop-scope slots.
                ctx.builder.emit(Op::Null, 0);
                ctx.builder.emit(Op::Null, 0);
                self.emit_root(ctx, iterable);
                let head = ctx.builder.offset();
                ctx.builder.emit(Op::Foreach, u32::from(*key_slot));
                ctx.builder.emit_word(u32::from(*value_slot));
                let exit = ctx.builder.emit_jump(Op::JumpIfFalse);
                ctx.loops.push(LoopCtx {
                    continue_target: Some(head),
                    breaks: Vec::new(),
                    continues: Vec::new(),
                });
                self.emit_block(ctx, body);
                ctx.builder.emit_loop(head);
                ctx.builder.patch_jump(exit);
                self.finish_loop(ctx, Some(ended));
            }
            StmtKind::Return { value } => {
                match value {
                    Some(expr) => self.emit_root(ctx, expr),
                    None => ctx.builder.emit(Op::Void, 0),
                }
                ctx.builder.emit(Op::Return, 0);
            }
            StmtKind::Break { pops } => {
                self.emit_ended(ctx, pops);
                let label = ctx.builder.emit_jump(Op::Jump);
                ctx.loops
                    .last_mut()
                    .expect("break outside loop rejected by parser")
                    .breaks
                    .push(label);
            }
            StmtKind::Continue { pops } => {
                self.emit_ended(ctx, pops);
                let target = ctx
                    .loops
                    .last()
                    .expect("continue outside loop rejected by parser")
                    .continue_target;
                match target {
                    Some(target) => ctx.builder.emit_loop(target),
                    None => {
                        let label = ctx.builder.emit_jump(Op::Jump);
                        ctx.loops
                            .last_mut()
                            .expect("loop context present")
                            .continues
                            .push(label);
                    }
                }
            }
            StmtKind::Throw { value } => {
                self.emit_root(ctx, value);
                ctx.builder.emit(Op::Throw, 0);
            }
            StmtKind::Block(block) => self.emit_block(ctx, block),
        }
    }

    /// Pops a loop's patch lists: breaks land here; `for`/`do-until`
    /// continues were patched earlier via [`Self::patch_continues`].
    fn finish_loop(&mut self, ctx: &mut FnCtx, ended: Option<&[EndedLocal]>) {
        let loop_ctx = ctx.loops.pop().expect("loop context present");
        debug_assert!(loop_ctx.continues.is_empty(), "continues must be patched");
        for label in loop_ctx.breaks {
            ctx.builder.patch_jump(label);
        }
        if let Some(ended) = ended {
            self.emit_ended(ctx, ended);
        }
    }

    fn patch_continues(&mut self, ctx: &mut FnCtx, _target: usize) {
        let continues = mem_take_continues(ctx);
        for label in continues {
            ctx.builder.patch_jump(label);
        }
    }

    fn emit_block(&mut self, ctx: &mut FnCtx, block: &Block) {
        for stmt in &block.statements {
            self.emit_stmt(ctx, stmt);
        }
        self.emit_ended(ctx, &block.ended);
    }

    fn emit_ended(&mut self, ctx: &mut FnCtx, ended: &[EndedLocal]) {
        for local in ended {
            if local.captured {
                ctx.builder.emit(Op::CloseUpvalue, 0);
            } else {
                ctx.builder.emit(Op::Pop, 0);
            }
        }
    }

    fn emit_object_decl(&mut self, ctx: &mut FnCtx, decl: &ObjectDeclAst) {
        let info = self.registry.object(decl.object);
        ctx.builder
            .emit(Op::Object, u32::try_from(decl.name.index()).expect("name id fits"));
        ctx.builder
            .emit_word(u32::try_from(info.type_id.index()).expect("type id fits"));
        if let Some(parent_slot) = decl.parent_slot {
            ctx.builder.emit(Op::GetGlobal, parent_slot);
            ctx.builder.emit(Op::Inherit, 0);
        }
        for field in &decl.fields {
            ctx.builder
                .emit(Op::Property, u32::try_from(field.name.index()).expect("name id fits"));
            ctx.builder
                .emit_word(u32::try_from(field.ty.index()).expect("type id fits"));
        }
        for method in &decl.methods {
            self.emit_function_value(ctx, method, decl.parent_slot);
            ctx.builder
                .emit(Op::Method, u32::try_from(method.name.index()).expect("name id fits"));
        }
        ctx.builder.emit(Op::DefineGlobal, decl.slot);
    }

    fn emit_enum_decl(&mut self, ctx: &mut FnCtx, decl: &EnumDeclAst) {
        let info = self.registry.enum_info(decl.enum_);
        ctx.builder
            .emit(Op::Enum, u32::try_from(decl.name.index()).expect("name id fits"));
        ctx.builder
            .emit_word(u32::try_from(info.type_id.index()).expect("type id fits"));
        let string_underlying = self.registry.resolve(decl.underlying)
            == self.registry.prim().string;
        for (index, case) in decl.cases.iter().enumerate() {
            let value = if string_underlying {
                Value::Obj(self.heap.intern_string(self.interns.get(*case)))
            } else {
                Value::Integer(i32::try_from(index).expect("case count checked by parser"))
            };
            ctx.builder.emit_constant(value);
            ctx.builder
                .emit(Op::EnumCase, u32::try_from(case.index()).expect("name id fits"));
        }
        ctx.builder.emit(Op::DefineGlobal, decl.slot);
    }

    // ----- expressions ----------------------------------------------------

    /// Emits a complete chain expression: any null-safe unwrap inside it
    /// short-circuits to the end of this emission.
    fn emit_root(&mut self, ctx: &mut FnCtx, expr: &Expr) {
        ctx.optional_jumps.push(Vec::new());
        self.emit_expr(ctx, expr);
        let pending = ctx.optional_jumps.pop().expect("optional jump list present");
        for label in pending {
            ctx.builder.patch_jump(label);
        }
    }

    fn emit_expr(&mut self, ctx: &mut FnCtx, expr: &Expr) {
        ctx.builder.set_line(expr.span.line);
        match &expr.kind {
            ExprKind::Null => ctx.builder.emit(Op::Null, 0),
            ExprKind::Boolean(value) => ctx.builder.emit_constant(Value::Bool(*value)),
            ExprKind::Integer(value) => ctx.builder.emit_constant(Value::Integer(*value)),
            ExprKind::Float(value) => ctx.builder.emit_constant(Value::Float(*value)),
            ExprKind::StringLiteral(text) => {
                let value = Value::Obj(self.heap.intern_string(text));
                ctx.builder.emit_constant(value);
            }
            ExprKind::String(parts) => self.emit_interpolation(ctx, parts),
            ExprKind::List { item_type, items } => {
                ctx.builder
                    .emit(Op::List, u32::try_from(item_type.index()).expect("type id fits"));
                for item in items {
                    self.emit_root(ctx, item);
                    ctx.builder.emit(Op::AppendList, 0);
                }
            }
            ExprKind::Map {
                key_type,
                value_type,
                entries,
            } => {
                ctx.builder
                    .emit(Op::Map, u32::try_from(key_type.index()).expect("type id fits"));
                ctx.builder
                    .emit_word(u32::try_from(value_type.index()).expect("type id fits"));
                for (key, value) in entries {
                    self.emit_root(ctx, key);
                    self.emit_root(ctx, value);
                    ctx.builder.emit(Op::SetMap, 0);
                }
            }
            ExprKind::Range { low, high } => {
                self.emit_root(ctx, low);
                self.emit_root(ctx, high);
                ctx.builder.emit(Op::Range, 0);
            }
            ExprKind::NamedVariable { slot, assign, .. } => match assign {
                Some(value) => {
                    self.emit_root(ctx, value);
                    match slot {
                        Slot::Local(idx) => ctx.builder.emit(Op::SetLocal, u32::from(*idx)),
                        Slot::UpValue(idx) => ctx.builder.emit(Op::SetUpvalue, u32::from(*idx)),
                        Slot::Global(idx) => ctx.builder.emit(Op::SetGlobal, *idx),
                    }
                }
                None => match slot {
                    Slot::Local(idx) => ctx.builder.emit(Op::GetLocal, u32::from(*idx)),
                    Slot::UpValue(idx) => ctx.builder.emit(Op::GetUpvalue, u32::from(*idx)),
                    Slot::Global(idx) => ctx.builder.emit(Op::GetGlobal, *idx),
                },
            },
            ExprKind::Unary { op, operand } => {
                self.emit_root(ctx, operand);
                match op {
                    UnaryOp::Negate => ctx.builder.emit(Op::Negate, 0),
                    UnaryOp::Not => ctx.builder.emit(Op::Not, 0),
                }
            }
            ExprKind::Binary { op, left, right } => self.emit_binary(ctx, *op, left, right),
            ExprKind::Is { value, target } => {
                self.emit_root(ctx, value);
                let type_obj = self.heap.alloc(Obj::TypeObject(*target));
                ctx.builder.emit_constant(Value::Obj(type_obj));
                ctx.builder.emit(Op::Is, 0);
            }
            ExprKind::Unwrap { value } => {
                self.emit_expr(ctx, value);
                let label = ctx.builder.emit_jump(Op::Unwrap);
                ctx.optional_jumps
                    .last_mut()
                    .expect("unwrap outside a chain expression")
                    .push(label);
            }
            ExprKind::ForceUnwrap { value } => {
                self.emit_expr(ctx, value);
                ctx.builder.emit(Op::ForceUnwrap, 0);
            }
            ExprKind::Subscript {
                target,
                index,
                assign,
            } => {
                self.emit_expr(ctx, target);
                self.emit_root(ctx, index);
                match assign {
                    Some(value) => {
                        self.emit_root(ctx, value);
                        ctx.builder.emit(Op::SetSubscript, 0);
                    }
                    None => ctx.builder.emit(Op::GetSubscript, 0),
                }
            }
            ExprKind::Dot {
                target,
                name,
                kind,
                assign,
            } => {
                self.emit_expr(ctx, target);
                let name_arg = u32::try_from(name.index()).expect("name id fits");
                match (kind, assign) {
                    (DotKind::Field, Some(value)) => {
                        self.emit_root(ctx, value);
                        ctx.builder.emit(Op::SetProperty, name_arg);
                    }
                    (DotKind::Field, None) => ctx.builder.emit(Op::GetProperty, name_arg),
                    (DotKind::EnumCase(index), _) => {
                        ctx.builder.emit(Op::GetEnumCase, u32::from(*index));
                    }
                    (DotKind::EnumValue, _) => ctx.builder.emit(Op::GetEnumCaseValue, 0),
                    // Methods only appear as call callees; the Call arm
                    // emits INVOKE and never recurses here.
                    (DotKind::Method | DotKind::BuiltinMethod, _) => {
                        ctx.builder.emit(Op::GetProperty, name_arg);
                    }
                }
            }
            ExprKind::Super { .. } => {
                // Only reachable as a call callee; handled in the Call arm.
                ctx.builder.emit(Op::Null, 0);
            }
            ExprKind::ObjectInit {
                object_expr,
                fields,
                defaults,
            } => {
                self.emit_expr(ctx, object_expr);
                ctx.builder.emit(Op::Instance, 0);
                for (name, value) in fields.iter().chain(defaults) {
                    ctx.builder.emit(Op::Copy, 0);
                    self.emit_root(ctx, value);
                    ctx.builder
                        .emit(Op::SetProperty, u32::try_from(name.index()).expect("name id fits"));
                    ctx.builder.emit(Op::Pop, 0);
                }
            }
            ExprKind::Call {
                callee,
                args,
                catches,
            } => self.emit_call(ctx, callee, args, catches),
            ExprKind::Function(function) => self.emit_closure(ctx, function),
        }
    }

    fn emit_interpolation(&mut self, ctx: &mut FnCtx, parts: &[Expr]) {
        let string = self.registry.prim().string;
        for (index, part) in parts.iter().enumerate() {
            self.emit_root(ctx, part);
            if self.registry.resolve(part.ty) != string {
                ctx.builder.emit(Op::ToString, 0);
            }
            if index > 0 {
                ctx.builder.emit(Op::StringConcat, 0);
            }
        }
    }

    fn emit_binary(&mut self, ctx: &mut FnCtx, op: BinaryOp, left: &Expr, right: &Expr) {
        match op {
            BinaryOp::And => {
                self.emit_root(ctx, left);
                ctx.builder.emit(Op::Copy, 0);
                let short = ctx.builder.emit_jump(Op::JumpIfFalse);
                ctx.builder.emit(Op::Pop, 0);
                self.emit_root(ctx, right);
                ctx.builder.patch_jump(short);
                return;
            }
            BinaryOp::Or => {
                self.emit_root(ctx, left);
                ctx.builder.emit(Op::Copy, 0);
                let try_right = ctx.builder.emit_jump(Op::JumpIfFalse);
                let done = ctx.builder.emit_jump(Op::Jump);
                ctx.builder.patch_jump(try_right);
                ctx.builder.emit(Op::Pop, 0);
                self.emit_root(ctx, right);
                ctx.builder.patch_jump(done);
                return;
            }
            BinaryOp::NullCoalesce => {
                self.emit_root(ctx, left);
                let done = ctx.builder.emit_jump(Op::NullOr);
                self.emit_root(ctx, right);
                ctx.builder.patch_jump(done);
                return;
            }
            _ => {}
        }
        self.emit_root(ctx, left);
        self.emit_root(ctx, right);
        match op {
            BinaryOp::Add => ctx.builder.emit(Op::Add, 0),
            BinaryOp::Subtract => ctx.builder.emit(Op::Subtract, 0),
            BinaryOp::Multiply => ctx.builder.emit(Op::Multiply, 0),
            BinaryOp::Divide => ctx.builder.emit(Op::Divide, 0),
            BinaryOp::Modulo => ctx.builder.emit(Op::Mod, 0),
            BinaryOp::Equal => ctx.builder.emit(Op::Equal, 0),
            BinaryOp::NotEqual => {
                ctx.builder.emit(Op::Equal, 0);
                ctx.builder.emit(Op::Not, 0);
            }
            BinaryOp::Greater => ctx.builder.emit(Op::Greater, 0),
            BinaryOp::GreaterEqual => {
                ctx.builder.emit(Op::Less, 0);
                ctx.builder.emit(Op::Not, 0);
            }
            BinaryOp::Less => ctx.builder.emit(Op::Less, 0),
            BinaryOp::LessEqual => {
                ctx.builder.emit(Op::Greater, 0);
                ctx.builder.emit(Op::Not, 0);
            }
            BinaryOp::BitAnd => ctx.builder.emit(Op::BitAnd, 0),
            BinaryOp::BitOr => ctx.builder.emit(Op::BitOr, 0),
            BinaryOp::BitXor => ctx.builder.emit(Op::BitXor, 0),
            BinaryOp::ShiftLeft => ctx.builder.emit(Op::ShiftLeft, 0),
            BinaryOp::ShiftRight => ctx.builder.emit(Op::ShiftRight, 0),
            BinaryOp::And | BinaryOp::Or | BinaryOp::NullCoalesce => {
                unreachable!("short-circuit operators emitted above")
            }
        }
    }

    fn emit_call(&mut self, ctx: &mut FnCtx, callee: &Expr, args: &[Expr], catches: &[Expr]) {
        let arg_count = u32::try_from(args.len()).expect("arity checked by parser");
        let catch_count = u32::try_from(catches.len()).expect("catch count fits");
        match &callee.kind {
            ExprKind::Dot {
                target,
                name,
                kind: DotKind::Method | DotKind::BuiltinMethod,
                ..
            } => {
                self.emit_expr(ctx, target);
                for arg in args {
                    self.emit_root(ctx, arg);
                }
                for catch in catches {
                    self.emit_root(ctx, catch);
                }
                ctx.builder
                    .emit(Op::Invoke, u32::try_from(name.index()).expect("name id fits"));
                ctx.builder.emit_word(pack_call(arg_count, catch_count));
            }
            ExprKind::Super { method } => {
                // Receiver, arguments, then the parent object for dispatch.
                ctx.builder.emit(Op::GetLocal, 0);
                for arg in args {
                    self.emit_root(ctx, arg);
                }
                for catch in catches {
                    self.emit_root(ctx, catch);
                }
                let parent_slot = ctx
                    .parent_slot
                    .expect("super call outside an inheriting object rejected by parser");
                ctx.builder.emit(Op::GetGlobal, parent_slot);
                ctx.builder
                    .emit(Op::SuperInvoke, u32::try_from(method.index()).expect("name id fits"));
                ctx.builder.emit_word(pack_call(arg_count, catch_count));
            }
            _ => {
                self.emit_expr(ctx, callee);
                for arg in args {
                    self.emit_root(ctx, arg);
                }
                for catch in catches {
                    self.emit_root(ctx, catch);
                }
                ctx.builder.emit(Op::Call, 0);
                ctx.builder.emit_word(pack_call(arg_count, catch_count));
            }
        }
    }

    /// Emits `CLOSURE` for a nested function, followed by one capture word
    /// per upvalue. Nested functions inherit the emitting context's `super`
    /// target.
    fn emit_closure(&mut self, ctx: &mut FnCtx, function: &FunctionAst) {
        let parent_slot = ctx.parent_slot;
        self.emit_function_value(ctx, function, parent_slot);
    }

    fn emit_function_value(
        &mut self,
        ctx: &mut FnCtx,
        function: &FunctionAst,
        parent_slot: Option<u32>,
    ) {
        let compiled = self.compile_function(function, parent_slot, Tail::None);
        let constant = ctx.builder.add_constant(Value::Obj(compiled));
        ctx.builder.emit(Op::Closure, constant);
        for upvalue in &function.upvalues {
            let word = (u32::from(upvalue.is_local) << 8) | u32::from(upvalue.index);
            ctx.builder.emit_word(word);
        }
    }
}

/// Packs a call's operand word: argument count high, catch count low.
#[inline]
fn pack_call(arg_count: u32, catch_count: u32) -> u32 {
    (arg_count << 16) | catch_count
}

fn mem_take_continues(ctx: &mut FnCtx) -> Vec<JumpLabel> {
    std::mem::take(
        &mut ctx
            .loops
            .last_mut()
            .expect("loop context present")
            .continues,
    )
}
