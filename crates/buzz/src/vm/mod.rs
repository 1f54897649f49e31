//! The stack virtual machine.
//!
//! Single-threaded fetch/decode/dispatch loop over 32-bit instruction words,
//! with an explicit call-frame stack (64 frames max) above a heap-allocated
//! value stack. Garbage collection and the embedder cycle limit are checked
//! between instruction dispatches, never inside one.

mod binary;
mod call;
mod exceptions;
mod foreach;

use ahash::AHashMap;
use smallvec::SmallVec;

use crate::{
    bytecode::{Op, arg_of},
    error::{RuntimeError, RuntimeErrorKind, VmError, VmResult},
    heap::{Heap, HeapId},
    intern::{Interns, NameId},
    io::PrintWriter,
    typedef::{TypeId, TypeRegistry},
    value::{
        Obj, ObjEnumInstance, ObjInstance, ObjList, ObjMap, ObjObject, ObjRange, Upvalue, Value,
        ValueKey, values_equal,
    },
};

/// Maximum call depth.
pub(crate) const MAX_FRAMES: usize = 64;

/// Value-stack ceiling: full frame depth at full locals plus workspace. The
/// stack buffer lives on the heap so deep scripts cannot blow the host
/// thread's stack.
const STACK_LIMIT: usize = MAX_FRAMES * 256 + 1024;

/// What happens when a frame returns, beyond pushing its result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FrameAction {
    None,
    /// The frame is a module body run by `IMPORT`: on return, move the
    /// staged exports into the importer's globals and cache them.
    Import { base: u32, count: u32 },
}

/// One activation record.
#[derive(Debug)]
pub(crate) struct CallFrame {
    pub closure: HeapId,
    /// The closure's function, cached to avoid a hop per fetch.
    pub function: HeapId,
    pub ip: usize,
    /// First stack slot owned by this frame: the callee or receiver.
    pub base: usize,
    /// Catch clauses attached to the call that opened this frame.
    pub catches: SmallVec<[HeapId; 2]>,
    pub action: FrameAction,
}

/// The virtual machine. Borrows the session state owned by the
/// [`Runner`](crate::run::Runner); the value and frame stacks are its own.
pub(crate) struct Vm<'r, W: PrintWriter> {
    pub(crate) heap: &'r mut Heap,
    pub(crate) interns: &'r Interns,
    pub(crate) registry: &'r TypeRegistry,
    pub(crate) globals: &'r mut Vec<Value>,
    /// Exported values of modules already run, keyed by module function.
    pub(crate) module_exports: &'r mut AHashMap<HeapId, Vec<Value>>,
    pub(crate) writer: &'r mut W,
    /// Session objects that must survive every collection: cached module
    /// closures live here, because a later compilation may reference them
    /// even when nothing in this run does.
    persistent_roots: &'r [HeapId],
    pub(crate) stack: Vec<Value>,
    pub(crate) frames: Vec<CallFrame>,
    /// Open upvalues, ascending by stack slot.
    open_upvalues: Vec<HeapId>,
    staged_exports: Vec<Value>,
    cycle_limit: Option<u64>,
    cycles: u64,
}

impl<'r, W: PrintWriter> Vm<'r, W> {
    pub(crate) fn new(
        heap: &'r mut Heap,
        interns: &'r Interns,
        registry: &'r TypeRegistry,
        globals: &'r mut Vec<Value>,
        module_exports: &'r mut AHashMap<HeapId, Vec<Value>>,
        writer: &'r mut W,
        persistent_roots: &'r [HeapId],
        cycle_limit: Option<u64>,
    ) -> Self {
        Self {
            heap,
            interns,
            registry,
            globals,
            module_exports,
            writer,
            persistent_roots,
            stack: Vec::with_capacity(STACK_LIMIT),
            frames: Vec::with_capacity(MAX_FRAMES),
            open_upvalues: Vec::new(),
            staged_exports: Vec::new(),
            cycle_limit,
            cycles: 0,
        }
    }

    /// Runs a closure to completion.
    pub(crate) fn run(&mut self, closure: HeapId) -> Result<Value, RuntimeError> {
        self.push(Value::Obj(closure));
        if let Err(err) = self.call_closure(closure, 0, SmallVec::new(), FrameAction::None) {
            return Err(self.into_runtime_error(err));
        }
        loop {
            // Safe suspension point: every live value is rooted here.
            if self.heap.wants_collect() {
                self.collect_garbage();
            }
            if let Some(limit) = self.cycle_limit {
                self.cycles += 1;
                if self.cycles > limit {
                    let err = VmError::Fatal(RuntimeError::new(
                        RuntimeErrorKind::CycleLimit,
                        format!("cycle limit of {limit} instructions reached"),
                    ));
                    return Err(self.into_runtime_error(err));
                }
            }
            if self.stack.len() > STACK_LIMIT {
                let err = VmError::Fatal(RuntimeError::new(
                    RuntimeErrorKind::StackOverflow,
                    "value stack overflow",
                ));
                return Err(self.into_runtime_error(err));
            }
            match self.step() {
                Ok(Some(result)) => return Ok(result),
                Ok(None) => {}
                Err(err) => self.unwind(err)?,
            }
        }
    }

    // ----- stack primitives -----------------------------------------------

    #[inline]
    pub(crate) fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    #[inline]
    pub(crate) fn pop(&mut self) -> Value {
        self.stack.pop().expect("value stack underflow")
    }

    #[inline]
    pub(crate) fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    #[inline]
    fn frame(&self) -> &CallFrame {
        self.frames.last().expect("no active frame")
    }

    fn fetch_word(&mut self) -> u32 {
        let frame = self.frames.last_mut().expect("no active frame");
        let Obj::Function(function) = self.heap.get(frame.function) else {
            unreachable!("frame function is not a function object");
        };
        let word = function.chunk.code()[frame.ip];
        frame.ip += 1;
        word
    }

    fn constant(&self, index: usize) -> Value {
        let frame = self.frame();
        let Obj::Function(function) = self.heap.get(frame.function) else {
            unreachable!("frame function is not a function object");
        };
        function.chunk.constant(index)
    }

    /// Throws an interned string value.
    pub(crate) fn throw_str(&mut self, message: &str) -> VmError {
        VmError::Throw(Value::Obj(self.heap.intern_string(message)))
    }

    // ----- dispatch -------------------------------------------------------

    #[expect(clippy::too_many_lines, reason = "one arm per opcode keeps dispatch flat")]
    fn step(&mut self) -> VmResult<Option<Value>> {
        let word = self.fetch_word();
        let op = Op::decode(word);
        let arg = arg_of(word);
        match op {
            Op::Constant => {
                let value = self.constant(arg as usize);
                self.push(value);
            }
            Op::Pop => {
                self.pop();
            }
            Op::Copy => self.push(self.peek(0)),
            Op::Swap => {
                let len = self.stack.len();
                self.stack.swap(len - 1, len - 2);
            }
            Op::DefineGlobal => {
                let value = self.pop();
                let slot = arg as usize;
                if self.globals.len() <= slot {
                    self.globals.resize(slot + 1, Value::Null);
                }
                self.globals[slot] = value;
            }
            Op::GetGlobal => self.push(self.globals[arg as usize]),
            Op::SetGlobal => self.globals[arg as usize] = self.peek(0),
            Op::GetLocal => {
                let base = self.frame().base;
                self.push(self.stack[base + arg as usize]);
            }
            Op::SetLocal => {
                let base = self.frame().base;
                self.stack[base + arg as usize] = self.peek(0);
            }
            Op::GetUpvalue => {
                let value = self.read_upvalue(arg as usize);
                self.push(value);
            }
            Op::SetUpvalue => {
                let value = self.peek(0);
                self.write_upvalue(arg as usize, value);
            }
            Op::CloseUpvalue => {
                let top = self.stack.len() - 1;
                self.close_upvalues(top);
                self.pop();
            }
            Op::GetProperty => {
                let name = NameId::from_index(arg);
                let receiver = self.pop();
                let value = self.read_field(receiver, name)?;
                self.push(value);
            }
            Op::SetProperty => {
                let name = NameId::from_index(arg);
                let value = self.pop();
                let receiver = self.pop();
                self.write_field(receiver, name, value)?;
                self.push(value);
            }
            Op::GetSubscript => {
                let index = self.pop();
                let target = self.pop();
                let value = self.subscript_get(target, index)?;
                self.push(value);
            }
            Op::SetSubscript => {
                let value = self.pop();
                let index = self.pop();
                let target = self.pop();
                self.subscript_set(target, index, value)?;
                self.push(value);
            }
            Op::List => {
                let list = self.heap.alloc(Obj::List(ObjList {
                    item_type: TypeId::from_index(arg),
                    items: Vec::new(),
                }));
                self.push(Value::Obj(list));
            }
            Op::AppendList => {
                let value = self.pop();
                let Some(list) = self.peek(0).as_obj() else {
                    return Err(VmError::internal("APPEND_LIST on a non-list"));
                };
                let Obj::List(list) = self.heap.get_mut(list) else {
                    return Err(VmError::internal("APPEND_LIST on a non-list"));
                };
                list.items.push(value);
            }
            Op::Map => {
                let value_type = self.fetch_word();
                let map = self.heap.alloc(Obj::Map(ObjMap {
                    key_type: TypeId::from_index(arg),
                    value_type: TypeId::from_index(value_type),
                    entries: indexmap::IndexMap::new(),
                }));
                self.push(Value::Obj(map));
            }
            Op::SetMap => {
                let value = self.pop();
                let key = self.pop();
                let Some(map) = self.peek(0).as_obj() else {
                    return Err(VmError::internal("SET_MAP on a non-map"));
                };
                let Obj::Map(map) = self.heap.get_mut(map) else {
                    return Err(VmError::internal("SET_MAP on a non-map"));
                };
                map.entries.insert(ValueKey(key), value);
            }
            Op::Add
            | Op::Subtract
            | Op::Multiply
            | Op::Divide
            | Op::Mod
            | Op::BitAnd
            | Op::BitOr
            | Op::BitXor
            | Op::ShiftLeft
            | Op::ShiftRight
            | Op::Greater
            | Op::Less => self.binary_op(op)?,
            Op::Negate => self.negate()?,
            Op::Not => {
                let value = self.pop();
                let Some(b) = value.as_bool() else {
                    return Err(VmError::internal("NOT on a non-bool"));
                };
                self.push(Value::Bool(!b));
            }
            Op::Equal => {
                let b = self.pop();
                let a = self.pop();
                let equal = values_equal(a, b, self.heap);
                self.push(Value::Bool(equal));
            }
            Op::Is => {
                let type_value = self.pop();
                let value = self.pop();
                let Some(Obj::TypeObject(ty)) = type_value.as_obj().map(|id| self.heap.get(id))
                else {
                    return Err(VmError::internal("IS without a type operand"));
                };
                let matches = self.value_matches_type(value, *ty);
                self.push(Value::Bool(matches));
            }
            Op::Jump => self.frames.last_mut().expect("no active frame").ip += arg as usize,
            Op::JumpIfFalse => {
                let value = self.pop();
                let Some(condition) = value.as_bool() else {
                    return Err(VmError::internal("JUMP_IF_FALSE on a non-bool"));
                };
                if !condition {
                    self.frames.last_mut().expect("no active frame").ip += arg as usize;
                }
            }
            Op::Loop => self.frames.last_mut().expect("no active frame").ip -= arg as usize,
            Op::Null => self.push(Value::Null),
            Op::Unwrap => {
                if self.peek(0).is_null() {
                    self.frames.last_mut().expect("no active frame").ip += arg as usize;
                }
            }
            Op::ForceUnwrap => {
                if self.peek(0).is_null() {
                    return Err(self.throw_str("force unwrapped a null value"));
                }
            }
            Op::NullOr => {
                if self.peek(0).is_null() {
                    self.pop();
                } else {
                    self.frames.last_mut().expect("no active frame").ip += arg as usize;
                }
            }
            Op::Call => {
                let packed = self.fetch_word();
                self.op_call(packed)?;
            }
            Op::Invoke => {
                let packed = self.fetch_word();
                self.op_invoke(NameId::from_index(arg), packed)?;
            }
            Op::SuperInvoke => {
                let packed = self.fetch_word();
                self.op_super_invoke(NameId::from_index(arg), packed)?;
            }
            Op::Closure => self.op_closure(arg as usize)?,
            Op::Return => {
                if let Some(result) = self.op_return()? {
                    return Ok(Some(result));
                }
            }
            Op::Void => self.push(Value::Null),
            Op::Object => {
                let type_id = self.fetch_word();
                let object = self.heap.alloc(Obj::Object(ObjObject {
                    name: NameId::from_index(arg),
                    type_id: TypeId::from_index(type_id),
                    methods: AHashMap::new(),
                    fields: Vec::new(),
                    parent: None,
                }));
                self.push(Value::Obj(object));
            }
            Op::Inherit => {
                let parent = self.pop();
                let Some(parent) = parent.as_obj() else {
                    return Err(VmError::internal("INHERIT without a parent object"));
                };
                let Some(object) = self.peek(0).as_obj() else {
                    return Err(VmError::internal("INHERIT on a non-object"));
                };
                let Obj::Object(object) = self.heap.get_mut(object) else {
                    return Err(VmError::internal("INHERIT on a non-object"));
                };
                object.parent = Some(parent);
            }
            Op::Method => {
                let name = NameId::from_index(arg);
                let closure = self.pop();
                let Some(closure) = closure.as_obj() else {
                    return Err(VmError::internal("METHOD without a closure"));
                };
                let Some(object) = self.peek(0).as_obj() else {
                    return Err(VmError::internal("METHOD on a non-object"));
                };
                let Obj::Object(object) = self.heap.get_mut(object) else {
                    return Err(VmError::internal("METHOD on a non-object"));
                };
                object.methods.insert(name, closure);
            }
            Op::Property => {
                let ty = self.fetch_word();
                let name = NameId::from_index(arg);
                let Some(object) = self.peek(0).as_obj() else {
                    return Err(VmError::internal("PROPERTY on a non-object"));
                };
                let Obj::Object(object) = self.heap.get_mut(object) else {
                    return Err(VmError::internal("PROPERTY on a non-object"));
                };
                object.fields.push((name, TypeId::from_index(ty)));
            }
            Op::Instance => {
                let object = self.pop();
                let Some(object) = object.as_obj() else {
                    return Err(VmError::internal("INSTANCE without an object"));
                };
                let instance = self.heap.alloc(Obj::Instance(ObjInstance {
                    object,
                    fields: AHashMap::new(),
                }));
                self.push(Value::Obj(instance));
            }
            Op::Enum => {
                let type_id = self.fetch_word();
                let en = self.heap.alloc(Obj::Enum(crate::value::ObjEnum {
                    name: NameId::from_index(arg),
                    type_id: TypeId::from_index(type_id),
                    cases: Vec::new(),
                    values: Vec::new(),
                }));
                self.push(Value::Obj(en));
            }
            Op::EnumCase => {
                let name = NameId::from_index(arg);
                let value = self.pop();
                let Some(en) = self.peek(0).as_obj() else {
                    return Err(VmError::internal("ENUM_CASE on a non-enum"));
                };
                let Obj::Enum(en) = self.heap.get_mut(en) else {
                    return Err(VmError::internal("ENUM_CASE on a non-enum"));
                };
                en.cases.push(name);
                en.values.push(value);
            }
            Op::GetEnumCase => {
                let en = self.pop();
                let Some(en) = en.as_obj() else {
                    return Err(VmError::internal("GET_ENUM_CASE on a non-enum"));
                };
                let case = u16::try_from(arg).expect("case index fits in u16");
                let instance = self
                    .heap
                    .alloc(Obj::EnumInstance(ObjEnumInstance { enum_: en, case }));
                self.push(Value::Obj(instance));
            }
            Op::GetEnumCaseValue => {
                let instance = self.pop();
                let Some(id) = instance.as_obj() else {
                    return Err(VmError::internal("GET_ENUM_CASE_VALUE on a non-case"));
                };
                let Obj::EnumInstance(case) = self.heap.get(id) else {
                    return Err(VmError::internal("GET_ENUM_CASE_VALUE on a non-case"));
                };
                let Obj::Enum(en) = self.heap.get(case.enum_) else {
                    return Err(VmError::internal("enum case without its enum"));
                };
                let value = en.values[case.case as usize];
                self.push(value);
            }
            Op::ToString => {
                let value = self.pop();
                let text = crate::value::stringify(value, self.heap, self.interns);
                let id = self.heap.intern_string(&text);
                self.push(Value::Obj(id));
            }
            Op::StringConcat => {
                let b = self.pop();
                let a = self.pop();
                let (Some(a), Some(b)) = (a.as_obj(), b.as_obj()) else {
                    return Err(VmError::internal("STRING_CONCAT on non-strings"));
                };
                let (Obj::Str(a), Obj::Str(b)) = (self.heap.get(a), self.heap.get(b)) else {
                    return Err(VmError::internal("STRING_CONCAT on non-strings"));
                };
                let joined = format!("{a}{b}");
                let id = self.heap.intern_string(&joined);
                self.push(Value::Obj(id));
            }
            Op::Foreach => {
                let value_slot = self.fetch_word();
                self.op_foreach(arg as usize, value_slot as usize)?;
            }
            Op::Import => {
                let base = self.fetch_word();
                self.op_import(arg, base)?;
            }
            Op::Export => {
                let count = arg as usize;
                let split = self.stack.len() - count;
                self.staged_exports = self.stack.split_off(split);
            }
            Op::Throw => {
                let value = self.pop();
                return Err(VmError::Throw(value));
            }
            Op::Range => {
                let high = self.pop();
                let low = self.pop();
                let (Value::Integer(low), Value::Integer(high)) = (low, high) else {
                    return Err(VmError::internal("RANGE bounds are not integers"));
                };
                let range = self.heap.alloc(Obj::Range(ObjRange { low, high }));
                self.push(Value::Obj(range));
            }
        }
        Ok(None)
    }

    // ----- upvalues -------------------------------------------------------

    fn read_upvalue(&self, index: usize) -> Value {
        let frame = self.frame();
        let Obj::Closure(closure) = self.heap.get(frame.closure) else {
            unreachable!("frame closure is not a closure");
        };
        let upvalue = closure.upvalues[index];
        match self.heap.get(upvalue) {
            Obj::Upvalue(Upvalue::Open(slot)) => self.stack[*slot],
            Obj::Upvalue(Upvalue::Closed(value)) => *value,
            _ => unreachable!("closure upvalue is not an upvalue"),
        }
    }

    fn write_upvalue(&mut self, index: usize, value: Value) {
        let frame = self.frames.last().expect("no active frame");
        let Obj::Closure(closure) = self.heap.get(frame.closure) else {
            unreachable!("frame closure is not a closure");
        };
        let upvalue = closure.upvalues[index];
        match self.heap.get(upvalue) {
            Obj::Upvalue(Upvalue::Open(slot)) => {
                let slot = *slot;
                self.stack[slot] = value;
            }
            Obj::Upvalue(Upvalue::Closed(_)) => {
                *self.heap.get_mut(upvalue) = Obj::Upvalue(Upvalue::Closed(value));
            }
            _ => unreachable!("closure upvalue is not an upvalue"),
        }
    }

    /// Finds or creates the open upvalue for a stack slot, keeping the open
    /// list sorted by slot.
    pub(crate) fn capture_upvalue(&mut self, slot: usize) -> HeapId {
        let mut insert_at = self.open_upvalues.len();
        for (index, &id) in self.open_upvalues.iter().enumerate() {
            let Obj::Upvalue(Upvalue::Open(existing)) = self.heap.get(id) else {
                unreachable!("open upvalue list holds a closed upvalue");
            };
            if *existing == slot {
                return id;
            }
            if *existing > slot {
                insert_at = index;
                break;
            }
        }
        let id = self.heap.alloc(Obj::Upvalue(Upvalue::Open(slot)));
        self.open_upvalues.insert(insert_at, id);
        id
    }

    /// Closes every open upvalue at or above `from_slot`: the value moves
    /// from the stack into the upvalue itself. Linear in the closed count
    /// because the list is slot-sorted.
    pub(crate) fn close_upvalues(&mut self, from_slot: usize) {
        while let Some(&id) = self.open_upvalues.last() {
            let Obj::Upvalue(Upvalue::Open(slot)) = self.heap.get(id) else {
                unreachable!("open upvalue list holds a closed upvalue");
            };
            let slot = *slot;
            if slot < from_slot {
                break;
            }
            let value = self.stack[slot];
            *self.heap.get_mut(id) = Obj::Upvalue(Upvalue::Closed(value));
            self.open_upvalues.pop();
        }
    }

    // ----- fields and subscripts ------------------------------------------

    fn read_field(&mut self, receiver: Value, name: NameId) -> VmResult<Value> {
        let Some(id) = receiver.as_obj() else {
            return Err(VmError::internal("GET_PROPERTY on a non-instance"));
        };
        let Obj::Instance(instance) = self.heap.get(id) else {
            return Err(VmError::internal("GET_PROPERTY on a non-instance"));
        };
        instance
            .fields
            .get(&name)
            .copied()
            .ok_or_else(|| VmError::internal("field read before initialization"))
    }

    fn write_field(&mut self, receiver: Value, name: NameId, value: Value) -> VmResult<()> {
        let Some(id) = receiver.as_obj() else {
            return Err(VmError::internal("SET_PROPERTY on a non-instance"));
        };
        let Obj::Instance(instance) = self.heap.get_mut(id) else {
            return Err(VmError::internal("SET_PROPERTY on a non-instance"));
        };
        instance.fields.insert(name, value);
        Ok(())
    }

    fn subscript_get(&mut self, target: Value, index: Value) -> VmResult<Value> {
        let Some(id) = target.as_obj() else {
            return Err(VmError::internal("GET_SUBSCRIPT on a non-container"));
        };
        let found = match self.heap.get(id) {
            Obj::List(list) => {
                let Value::Integer(i) = index else {
                    return Err(VmError::internal("list index is not an integer"));
                };
                usize::try_from(i).ok().and_then(|i| list.items.get(i).copied())
            }
            // A missing map key reads as null; the subscript's static type
            // is optional.
            Obj::Map(map) => Some(
                map.entries
                    .get(&ValueKey(index))
                    .copied()
                    .unwrap_or(Value::Null),
            ),
            _ => return Err(VmError::internal("GET_SUBSCRIPT on a non-container")),
        };
        match found {
            Some(value) => Ok(value),
            None => Err(self.throw_str("list index out of range")),
        }
    }

    fn subscript_set(&mut self, target: Value, index: Value, value: Value) -> VmResult<()> {
        let Some(id) = target.as_obj() else {
            return Err(VmError::internal("SET_SUBSCRIPT on a non-container"));
        };
        let out_of_range = match self.heap.get_mut(id) {
            Obj::List(list) => {
                let Value::Integer(i) = index else {
                    return Err(VmError::internal("list index is not an integer"));
                };
                match usize::try_from(i).ok().and_then(|i| list.items.get_mut(i)) {
                    Some(slot) => {
                        *slot = value;
                        false
                    }
                    None => true,
                }
            }
            Obj::Map(map) => {
                map.entries.insert(ValueKey(index), value);
                false
            }
            _ => return Err(VmError::internal("SET_SUBSCRIPT on a non-container")),
        };
        if out_of_range {
            return Err(self.throw_str("list index out of range"));
        }
        Ok(())
    }

    // ----- garbage collection ---------------------------------------------

    /// Collects with every VM-visible root: the value stack, frame closures,
    /// globals, open upvalues, staged and cached module exports.
    fn collect_garbage(&mut self) {
        let mut roots: Vec<HeapId> = Vec::with_capacity(self.stack.len() + 64);
        roots.extend(self.stack.iter().filter_map(|v| v.as_obj()));
        for frame in &self.frames {
            roots.push(frame.closure);
            roots.push(frame.function);
            roots.extend(frame.catches.iter().copied());
        }
        roots.extend(self.globals.iter().filter_map(|v| v.as_obj()));
        roots.extend(self.open_upvalues.iter().copied());
        roots.extend(self.persistent_roots.iter().copied());
        roots.extend(self.staged_exports.iter().filter_map(|v| v.as_obj()));
        for (&function, exports) in self.module_exports.iter() {
            roots.push(function);
            roots.extend(exports.iter().filter_map(|v| v.as_obj()));
        }
        self.heap.collect(roots);
    }
}
