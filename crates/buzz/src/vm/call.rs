//! Call machinery: `CALL`, `INVOKE`, `SUPER_INVOKE`, `CLOSURE`, `RETURN`,
//! `IMPORT`, and native dispatch.

use smallvec::SmallVec;

use crate::{
    error::{RuntimeError, RuntimeErrorKind, VmError, VmResult},
    heap::HeapId,
    intern::NameId,
    io::PrintWriter,
    native::NativeCtx,
    value::{Obj, ObjClosure, Value},
};

use super::{CallFrame, FrameAction, MAX_FRAMES, Vm};

/// Splits a packed call operand word into argument and catch counts.
#[inline]
fn unpack_call(word: u32) -> (usize, usize) {
    ((word >> 16) as usize, (word & 0xffff) as usize)
}

impl<W: PrintWriter> Vm<'_, W> {
    pub(super) fn op_call(&mut self, packed: u32) -> VmResult<()> {
        let (arg_count, catch_count) = unpack_call(packed);
        let catches = self.pop_catches(catch_count)?;
        let callee = self.peek(arg_count);
        let Some(id) = callee.as_obj() else {
            return Err(VmError::internal("CALL on a non-callable value"));
        };
        let is_closure = matches!(self.heap.get(id), Obj::Closure(_));
        let is_native = matches!(self.heap.get(id), Obj::Native(_));
        if is_closure {
            self.call_closure(id, arg_count, catches, FrameAction::None)
        } else if is_native {
            self.call_native(id, arg_count, &catches)
        } else {
            Err(VmError::internal("CALL on a non-callable value"))
        }
    }

    /// `INVOKE`: property lookup fused with the call. Instances dispatch
    /// through their object's method table (walking the parent chain);
    /// lists, maps, strings, and ranges dispatch to VM-implemented methods.
    pub(super) fn op_invoke(&mut self, name: NameId, packed: u32) -> VmResult<()> {
        let (arg_count, catch_count) = unpack_call(packed);
        let catches = self.pop_catches(catch_count)?;
        let receiver = self.peek(arg_count);
        let Some(id) = receiver.as_obj() else {
            return Err(VmError::internal("INVOKE on a non-object receiver"));
        };
        enum Receiver {
            Instance(HeapId),
            Builtin,
        }
        let kind = match self.heap.get(id) {
            Obj::Instance(instance) => Receiver::Instance(instance.object),
            Obj::List(_) | Obj::Map(_) | Obj::Str(_) | Obj::Range(_) => Receiver::Builtin,
            _ => return Err(VmError::internal("INVOKE on a non-object receiver")),
        };
        match kind {
            Receiver::Instance(object) => {
                let method = self.find_method(object, name)?;
                self.call_closure(method, arg_count, catches, FrameAction::None)
            }
            Receiver::Builtin => self.builtin_invoke(id, name, arg_count),
        }
    }

    /// `SUPER_INVOKE`: the parent object rides on top of the arguments; the
    /// receiver stays in the frame's base slot.
    pub(super) fn op_super_invoke(&mut self, name: NameId, packed: u32) -> VmResult<()> {
        let (arg_count, catch_count) = unpack_call(packed);
        let parent = self.pop();
        let catches = self.pop_catches(catch_count)?;
        let Some(parent) = parent.as_obj() else {
            return Err(VmError::internal("SUPER_INVOKE without a parent object"));
        };
        let method = self.find_method(parent, name)?;
        self.call_closure(method, arg_count, catches, FrameAction::None)
    }

    /// Walks an object's method table and parent chain.
    pub(super) fn find_method(&self, object: HeapId, name: NameId) -> VmResult<HeapId> {
        let mut current = Some(object);
        while let Some(id) = current {
            let Obj::Object(object) = self.heap.get(id) else {
                return Err(VmError::internal("method lookup on a non-object"));
            };
            if let Some(&method) = object.methods.get(&name) {
                return Ok(method);
            }
            current = object.parent;
        }
        Err(VmError::internal("method not found at runtime"))
    }

    pub(super) fn call_closure(
        &mut self,
        closure: HeapId,
        arg_count: usize,
        catches: SmallVec<[HeapId; 2]>,
        action: FrameAction,
    ) -> VmResult<()> {
        if self.frames.len() >= MAX_FRAMES {
            return Err(VmError::Fatal(RuntimeError::new(
                RuntimeErrorKind::StackOverflow,
                format!("call stack overflow (max {MAX_FRAMES} frames)"),
            )));
        }
        let Obj::Closure(ObjClosure { function, .. }) = self.heap.get(closure) else {
            return Err(VmError::internal("CALL target is not a closure"));
        };
        let function = *function;
        let Obj::Function(fun) = self.heap.get(function) else {
            return Err(VmError::internal("closure wraps a non-function"));
        };
        if usize::from(fun.arity) != arg_count {
            return Err(VmError::internal("arity mismatch survived type checking"));
        }
        let base = self.stack.len() - arg_count - 1;
        self.frames.push(CallFrame {
            closure,
            function,
            ip: 0,
            base,
            catches,
            action,
        });
        Ok(())
    }

    /// Native ABI: the function reads arguments through `peek`, pushes at
    /// most one result, and reports how many values it pushed. A thrown
    /// value first tries the call site's own catch clauses.
    fn call_native(
        &mut self,
        native: HeapId,
        arg_count: usize,
        catches: &[HeapId],
    ) -> VmResult<()> {
        let Obj::Native(obj) = self.heap.get(native) else {
            return Err(VmError::internal("CALL target is not a native"));
        };
        let function = obj.function;
        if usize::from(obj.arity) != arg_count {
            return Err(VmError::internal("native arity mismatch survived type checking"));
        }
        let base = self.stack.len() - arg_count - 1;
        let mut ctx = NativeCtx::new(
            &mut self.stack,
            self.heap,
            self.interns,
            self.writer,
            arg_count,
        );
        match function(&mut ctx) {
            Ok(pushed) => {
                let result = if pushed == 1 { self.pop() } else { Value::Null };
                self.stack.truncate(base);
                self.push(result);
                Ok(())
            }
            Err(thrown) => {
                self.stack.truncate(base);
                if let Some(handler) = self.matching_catch(catches, thrown) {
                    self.push(Value::Obj(handler));
                    self.push(thrown);
                    return self.call_closure(handler, 1, SmallVec::new(), FrameAction::None);
                }
                Err(VmError::Throw(thrown))
            }
        }
    }

    /// Pops catch closures pushed after the arguments, restoring source
    /// order.
    fn pop_catches(&mut self, count: usize) -> VmResult<SmallVec<[HeapId; 2]>> {
        let mut catches: SmallVec<[HeapId; 2]> = SmallVec::with_capacity(count);
        for _ in 0..count {
            let value = self.pop();
            let Some(id) = value.as_obj() else {
                return Err(VmError::internal("catch clause is not a closure"));
            };
            catches.push(id);
        }
        catches.reverse();
        Ok(catches)
    }

    /// `CLOSURE`: reads one capture word per upvalue and links each to a
    /// fresh or shared upvalue object.
    pub(super) fn op_closure(&mut self, constant: usize) -> VmResult<()> {
        let function_value = self.constant(constant);
        let Some(function) = function_value.as_obj() else {
            return Err(VmError::internal("CLOSURE constant is not a function"));
        };
        let Obj::Function(fun) = self.heap.get(function) else {
            return Err(VmError::internal("CLOSURE constant is not a function"));
        };
        let upvalue_count = usize::from(fun.upvalue_count);
        let base = self.frame().base;

        let mut upvalues = Vec::with_capacity(upvalue_count);
        for _ in 0..upvalue_count {
            let word = self.fetch_word();
            let is_local = (word >> 8) & 1 == 1;
            let index = (word & 0xff) as usize;
            if is_local {
                upvalues.push(self.capture_upvalue(base + index));
            } else {
                let frame = self.frame();
                let Obj::Closure(closure) = self.heap.get(frame.closure) else {
                    return Err(VmError::internal("enclosing frame has no closure"));
                };
                upvalues.push(closure.upvalues[index]);
            }
        }
        let closure = self.heap.alloc(Obj::Closure(ObjClosure { function, upvalues }));
        self.push(Value::Obj(closure));
        Ok(())
    }

    /// `RETURN`: closes upvalues over the departing slots, truncates the
    /// frame, and pushes the result into the caller — or finishes an
    /// `IMPORT` by publishing the staged exports.
    pub(super) fn op_return(&mut self) -> VmResult<Option<Value>> {
        let result = self.pop();
        let frame = self.frames.pop().expect("RETURN without a frame");
        self.close_upvalues(frame.base);
        self.stack.truncate(frame.base);
        match frame.action {
            FrameAction::None => {
                if self.frames.is_empty() {
                    return Ok(Some(result));
                }
                self.push(result);
            }
            FrameAction::Import { base, count } => {
                let staged = std::mem::take(&mut self.staged_exports);
                if staged.len() != count as usize {
                    return Err(VmError::internal("module staged wrong export count"));
                }
                let end = (base + count) as usize;
                if self.globals.len() < end {
                    self.globals.resize(end, Value::Null);
                }
                for (offset, &value) in staged.iter().enumerate() {
                    self.globals[base as usize + offset] = value;
                }
                self.module_exports.insert(frame.function, staged);
                if self.frames.is_empty() {
                    return Ok(Some(Value::Null));
                }
            }
        }
        Ok(None)
    }

    /// `IMPORT`: runs the module closure once per process; later imports
    /// copy the cached exports.
    pub(super) fn op_import(&mut self, count: u32, base: u32) -> VmResult<()> {
        let closure_value = self.peek(0);
        let Some(closure) = closure_value.as_obj() else {
            return Err(VmError::internal("IMPORT without a module closure"));
        };
        let Obj::Closure(ObjClosure { function, .. }) = self.heap.get(closure) else {
            return Err(VmError::internal("IMPORT without a module closure"));
        };
        let function = *function;
        if let Some(exports) = self.module_exports.get(&function) {
            let exports = exports.clone();
            self.pop();
            let end = (base + count) as usize;
            if self.globals.len() < end {
                self.globals.resize(end, Value::Null);
            }
            for (offset, value) in exports.into_iter().enumerate() {
                self.globals[base as usize + offset] = value;
            }
            tracing::debug!(module = ?function, "import served from cache");
            return Ok(());
        }
        tracing::debug!(module = ?function, "running module body for import");
        self.call_closure(
            closure,
            0,
            SmallVec::new(),
            FrameAction::Import { base, count },
        )
    }

    /// Methods the VM implements directly on lists, maps, strings, and
    /// ranges: `append`, `len`, `size`, `remove`, `toList`.
    fn builtin_invoke(&mut self, receiver: HeapId, name: NameId, arg_count: usize) -> VmResult<()> {
        let wk = *self.interns.well_known();
        let base = self.stack.len() - arg_count - 1;

        // Probe with a shared borrow first; the mutating methods re-borrow
        // below, once nothing else holds the heap.
        enum Action {
            Done(Value),
            NewIntList(Vec<Value>),
            ListAppend,
            MapRemove,
        }
        let action = match self.heap.get(receiver) {
            Obj::Str(s) if name == wk.len => {
                let count = i32::try_from(s.chars().count())
                    .map_err(|_| VmError::internal("string length exceeds i32"))?;
                Action::Done(Value::Integer(count))
            }
            Obj::Range(range) if name == wk.len => {
                let count = (i64::from(range.high) - i64::from(range.low))
                    .unsigned_abs()
                    .try_into()
                    .map_err(|_| VmError::internal("range length exceeds i32"))?;
                Action::Done(Value::Integer(count))
            }
            Obj::Range(range) if name == wk.to_list => {
                let (low, high) = (range.low, range.high);
                let mut items = Vec::new();
                if high >= low {
                    items.extend((low..high).map(Value::Integer));
                } else {
                    let mut current = low;
                    while current > high {
                        items.push(Value::Integer(current));
                        current -= 1;
                    }
                }
                Action::NewIntList(items)
            }
            Obj::List(list) if name == wk.len => {
                let count = i32::try_from(list.items.len())
                    .map_err(|_| VmError::internal("list length exceeds i32"))?;
                Action::Done(Value::Integer(count))
            }
            Obj::List(_) if name == wk.append => Action::ListAppend,
            Obj::Map(map) if name == wk.size => {
                let count = i32::try_from(map.entries.len())
                    .map_err(|_| VmError::internal("map size exceeds i32"))?;
                Action::Done(Value::Integer(count))
            }
            Obj::Map(_) if name == wk.remove => Action::MapRemove,
            _ => return Err(VmError::internal("unknown builtin method survived checking")),
        };

        let result = match action {
            Action::Done(value) => value,
            Action::NewIntList(items) => {
                let item_type = self.registry.prim().integer;
                Value::Obj(self.heap.alloc(Obj::List(crate::value::ObjList {
                    item_type,
                    items,
                })))
            }
            Action::ListAppend => {
                let value = self.stack[base + 1];
                let Obj::List(list) = self.heap.get_mut(receiver) else {
                    return Err(VmError::internal("receiver changed kind mid-invoke"));
                };
                list.items.push(value);
                Value::Null
            }
            Action::MapRemove => {
                let key = self.stack[base + 1];
                let Obj::Map(map) = self.heap.get_mut(receiver) else {
                    return Err(VmError::internal("receiver changed kind mid-invoke"));
                };
                map.entries
                    .shift_remove(&crate::value::ValueKey(key))
                    .unwrap_or(Value::Null)
            }
        };
        self.stack.truncate(base);
        self.push(result);
        Ok(())
    }
}
