//! Runtime values and heap object payloads.
//!
//! [`Value`] is a small `Copy` tagged union: immediates are stored inline and
//! everything else lives in the arena behind an [`Obj`](crate::heap::Heap)
//! slot referenced by [`HeapId`]. Runtime strings are interned by content, so
//! two equal strings always share a `HeapId`; that is what lets map keys and
//! equality work on ids alone.

use std::hash::{Hash, Hasher};

use ahash::AHashMap;
use indexmap::IndexMap;

use crate::{
    bytecode::Chunk,
    heap::{Heap, HeapId},
    intern::{Interns, NameId},
    native::NativeFn,
    typedef::{FunctionKind, TypeId},
};

/// Primary runtime value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Integer(i32),
    Float(f64),
    /// Heap-allocated payload; the only variant the collector traces.
    Obj(HeapId),
}

impl Value {
    #[inline]
    #[must_use]
    pub fn is_null(self) -> bool {
        matches!(self, Self::Null)
    }

    /// Truthiness is only ever asked of `Bool` values; the type checker
    /// guarantees conditions are boolean.
    #[inline]
    #[must_use]
    pub(crate) fn as_bool(self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(b),
            _ => None,
        }
    }

    #[inline]
    #[must_use]
    pub(crate) fn as_obj(self) -> Option<HeapId> {
        match self {
            Self::Obj(id) => Some(id),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Integer(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

/// Hashable wrapper for map keys.
///
/// Strings hash by `HeapId` (safe because they are interned by content);
/// floats hash by bit pattern; other heap values hash by identity.
#[derive(Debug, Clone, Copy)]
pub struct ValueKey(pub Value);

impl PartialEq for ValueKey {
    fn eq(&self, other: &Self) -> bool {
        match (self.0, other.0) {
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (a, b) => a == b,
        }
    }
}

impl Eq for ValueKey {}

impl Hash for ValueKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self.0 {
            Value::Null => 0u8.hash(state),
            Value::Bool(b) => {
                1u8.hash(state);
                b.hash(state);
            }
            Value::Integer(i) => {
                2u8.hash(state);
                i.hash(state);
            }
            Value::Float(f) => {
                3u8.hash(state);
                f.to_bits().hash(state);
            }
            Value::Obj(id) => {
                4u8.hash(state);
                id.hash(state);
            }
        }
    }
}

/// A list with its element type.
#[derive(Debug, Clone)]
pub struct ObjList {
    pub item_type: TypeId,
    pub items: Vec<Value>,
}

/// An insertion-ordered mapping with its key and value types.
#[derive(Debug, Clone)]
pub struct ObjMap {
    pub key_type: TypeId,
    pub value_type: TypeId,
    pub entries: IndexMap<ValueKey, Value>,
}

/// Inclusive-low, exclusive-high integer range. Iteration direction follows
/// the sign of `high - low`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjRange {
    pub low: i32,
    pub high: i32,
}

/// A compiled function: bytecode plus calling metadata.
#[derive(Debug)]
pub struct ObjFunction {
    pub name: NameId,
    pub kind: FunctionKind,
    pub arity: u8,
    pub upvalue_count: u8,
    pub chunk: Chunk,
    pub type_id: TypeId,
}

/// A function paired with its captured upvalues.
///
/// Invariant: `upvalues.len() == function.upvalue_count`.
#[derive(Debug, Clone)]
pub struct ObjClosure {
    pub function: HeapId,
    pub upvalues: Vec<HeapId>,
}

/// A captured variable: open while its stack slot is live, closed afterward.
#[derive(Debug, Clone, Copy)]
pub enum Upvalue {
    /// Absolute index into the VM value stack.
    Open(usize),
    Closed(Value),
}

/// A class-like object type at runtime.
#[derive(Debug)]
pub struct ObjObject {
    pub name: NameId,
    pub type_id: TypeId,
    pub methods: AHashMap<NameId, HeapId>,
    /// Fields declared directly on this object, in declaration order.
    pub fields: Vec<(NameId, TypeId)>,
    pub parent: Option<HeapId>,
}

/// An instance of an [`ObjObject`].
#[derive(Debug)]
pub struct ObjInstance {
    pub object: HeapId,
    pub fields: AHashMap<NameId, Value>,
}

/// An enum type: ordered case names with their values.
#[derive(Debug)]
pub struct ObjEnum {
    pub name: NameId,
    pub type_id: TypeId,
    pub cases: Vec<NameId>,
    pub values: Vec<Value>,
}

/// One case of an enum.
#[derive(Debug, Clone, Copy)]
pub struct ObjEnumInstance {
    pub enum_: HeapId,
    pub case: u16,
}

/// A host-implemented function reachable through the native ABI.
pub struct ObjNative {
    pub name: NameId,
    pub arity: u8,
    pub function: NativeFn,
}

impl std::fmt::Debug for ObjNative {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjNative")
            .field("name", &self.name)
            .field("arity", &self.arity)
            .finish_non_exhaustive()
    }
}

/// Heap object payload.
#[derive(Debug)]
pub enum Obj {
    Str(Box<str>),
    List(ObjList),
    Map(ObjMap),
    Range(ObjRange),
    Function(ObjFunction),
    Closure(ObjClosure),
    Upvalue(Upvalue),
    Object(ObjObject),
    Instance(ObjInstance),
    Enum(ObjEnum),
    EnumInstance(ObjEnumInstance),
    Native(ObjNative),
    /// A reified type descriptor; the operand of `is`.
    TypeObject(TypeId),
}

impl Obj {
    /// Rough byte footprint, used for collection watermarks.
    #[must_use]
    pub(crate) fn size_hint(&self) -> usize {
        let base = std::mem::size_of::<Self>();
        base + match self {
            Self::Str(s) => s.len(),
            Self::List(list) => list.items.len() * std::mem::size_of::<Value>(),
            Self::Map(map) => map.entries.len() * 2 * std::mem::size_of::<Value>(),
            Self::Function(fun) => fun.chunk.size_hint(),
            Self::Closure(closure) => closure.upvalues.len() * std::mem::size_of::<HeapId>(),
            Self::Object(object) => {
                (object.methods.len() + object.fields.len()) * 2 * std::mem::size_of::<usize>()
            }
            Self::Instance(instance) => instance.fields.len() * 2 * std::mem::size_of::<Value>(),
            Self::Enum(en) => en.values.len() * std::mem::size_of::<Value>(),
            _ => 0,
        }
    }

    /// Static name of the variant, for heap statistics.
    #[must_use]
    pub(crate) fn kind_name(&self) -> &'static str {
        match self {
            Self::Str(_) => "Str",
            Self::List(_) => "List",
            Self::Map(_) => "Map",
            Self::Range(_) => "Range",
            Self::Function(_) => "Function",
            Self::Closure(_) => "Closure",
            Self::Upvalue(_) => "Upvalue",
            Self::Object(_) => "Object",
            Self::Instance(_) => "Instance",
            Self::Enum(_) => "Enum",
            Self::EnumInstance(_) => "EnumInstance",
            Self::Native(_) => "Native",
            Self::TypeObject(_) => "TypeObject",
        }
    }
}

/// Equality as the `EQUAL` instruction sees it.
///
/// Ranges and enum cases compare structurally; strings compare by id, which
/// is content equality thanks to interning; lists, maps, and instances
/// compare by identity.
#[must_use]
pub(crate) fn values_equal(a: Value, b: Value, heap: &Heap) -> bool {
    match (a, b) {
        (Value::Obj(ia), Value::Obj(ib)) => {
            if ia == ib {
                return true;
            }
            match (heap.get(ia), heap.get(ib)) {
                (Obj::Range(ra), Obj::Range(rb)) => ra == rb,
                (Obj::EnumInstance(ea), Obj::EnumInstance(eb)) => {
                    ea.enum_ == eb.enum_ && ea.case == eb.case
                }
                _ => false,
            }
        }
        _ => a == b,
    }
}

/// Renders a value the way `toString` and string interpolation do.
#[must_use]
pub(crate) fn stringify(value: Value, heap: &Heap, interns: &Interns) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Integer(i) => i.to_string(),
        Value::Float(f) => {
            let mut buffer = ryu::Buffer::new();
            buffer.format(f).to_string()
        }
        Value::Obj(id) => match heap.get(id) {
            Obj::Str(s) => s.to_string(),
            Obj::List(list) => {
                let items = list
                    .items
                    .iter()
                    .map(|&item| stringify(item, heap, interns))
                    .collect::<Vec<_>>()
                    .join(", ");
                format!("[{items}]")
            }
            Obj::Map(map) => {
                let entries = map
                    .entries
                    .iter()
                    .map(|(&key, &val)| {
                        format!(
                            "{}: {}",
                            stringify(key.0, heap, interns),
                            stringify(val, heap, interns)
                        )
                    })
                    .collect::<Vec<_>>()
                    .join(", ");
                format!("{{{entries}}}")
            }
            Obj::Range(range) => format!("{}..{}", range.low, range.high),
            Obj::Function(fun) => format!("<fun {}>", interns.get(fun.name)),
            Obj::Closure(closure) => match heap.get(closure.function) {
                Obj::Function(fun) => format!("<fun {}>", interns.get(fun.name)),
                _ => "<fun>".to_string(),
            },
            Obj::Upvalue(_) => "<upvalue>".to_string(),
            Obj::Object(object) => format!("<object {}>", interns.get(object.name)),
            Obj::Instance(instance) => match heap.get(instance.object) {
                Obj::Object(object) => format!("<{} instance>", interns.get(object.name)),
                _ => "<instance>".to_string(),
            },
            Obj::Enum(en) => format!("<enum {}>", interns.get(en.name)),
            Obj::EnumInstance(case) => match heap.get(case.enum_) {
                Obj::Enum(en) => format!(
                    "{}.{}",
                    interns.get(en.name),
                    interns.get(en.cases[case.case as usize])
                ),
                _ => "<enum case>".to_string(),
            },
            Obj::Native(native) => format!("<native {}>", interns.get(native.name)),
            Obj::TypeObject(_) => "<type>".to_string(),
        },
    }
}
