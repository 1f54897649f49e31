//! Arena heap and the garbage collector.
//!
//! Objects live in recycled slots addressed by [`HeapId`]. Collection is a
//! precise tri-color mark-and-sweep: roots are grayed, a gray worklist is
//! drained blackening objects and graying their children, and the sweep frees
//! everything still white while resetting survivors to white for the next
//! cycle. The VM only triggers a collection between instruction dispatches,
//! so a collection never interleaves with a single instruction.
//!
//! The string intern table is a weak root: it never keeps a string alive, and
//! sweeping a string removes its entry so the content can be re-interned
//! later.

use std::collections::BTreeMap;

use ahash::AHashMap;
use smallvec::SmallVec;

use crate::value::{Obj, Value};

/// Collection trigger: first collection happens after this many live bytes.
const INITIAL_GC_BYTES: usize = 1024 * 1024;

/// Watermark multiplier applied to surviving bytes after each collection.
const GC_GROWTH_FACTOR: usize = 2;

/// Surviving-byte level above which the next collection also compacts the
/// slot arena and free list.
const FULL_GC_BYTES: usize = 8 * 1024 * 1024;

/// Index of a heap slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HeapId(u32);

impl HeapId {
    #[inline]
    #[must_use]
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// Mark state of one object within a collection cycle.
///
/// Outside a collection every live object is white; a cycle moves reachable
/// objects white -> gray -> black and the sweep resets them to white.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

#[derive(Debug)]
struct Slot {
    data: Obj,
    color: Color,
    size: usize,
}

/// Snapshot of heap state, for logging and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeapStats {
    pub live_objects: usize,
    pub free_slots: usize,
    pub total_slots: usize,
    /// Breakdown of live objects by payload variant name.
    pub objects_by_type: BTreeMap<&'static str, usize>,
    pub interned_strings: usize,
    pub bytes_allocated: usize,
    pub collections: u64,
}

/// The object heap.
#[derive(Debug)]
pub struct Heap {
    slots: Vec<Option<Slot>>,
    free: Vec<u32>,
    /// Weak content-interning table for strings.
    strings: AHashMap<Box<str>, HeapId>,
    bytes_allocated: usize,
    next_gc: usize,
    gray: Vec<HeapId>,
    collections: u64,
    pending: bool,
}

impl Heap {
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            strings: AHashMap::new(),
            bytes_allocated: 0,
            next_gc: INITIAL_GC_BYTES,
            gray: Vec::new(),
            collections: 0,
            pending: false,
        }
    }

    /// Allocates an object, recycling a free slot when one exists.
    ///
    /// Crossing the collection watermark only *requests* a collection; the VM
    /// honors the request at its next instruction boundary, when every live
    /// value is reachable from a root.
    pub fn alloc(&mut self, data: Obj) -> HeapId {
        let size = data.size_hint();
        self.bytes_allocated += size;
        if self.bytes_allocated > self.next_gc {
            self.pending = true;
        }
        let slot = Slot {
            data,
            color: Color::White,
            size,
        };
        if let Some(index) = self.free.pop() {
            self.slots[index as usize] = Some(slot);
            HeapId(index)
        } else {
            let index = u32::try_from(self.slots.len()).expect("heap exceeds u32 slots");
            self.slots.push(Some(slot));
            HeapId(index)
        }
    }

    /// Interns a string by content: equal content always yields the same id.
    pub fn intern_string(&mut self, content: &str) -> HeapId {
        if let Some(&id) = self.strings.get(content) {
            return id;
        }
        let id = self.alloc(Obj::Str(Box::from(content)));
        self.strings.insert(Box::from(content), id);
        id
    }

    /// Borrows an object.
    ///
    /// # Panics
    /// Panics on a dangling id; the collector only frees unreachable objects,
    /// so a dangling id is always a rooting bug.
    #[must_use]
    pub fn get(&self, id: HeapId) -> &Obj {
        &self
            .slots[id.index()]
            .as_ref()
            .expect("heap id points at a freed slot")
            .data
    }

    /// Mutably borrows an object, informing the write barrier.
    pub fn get_mut(&mut self, id: HeapId) -> &mut Obj {
        self.mark_dirty(id);
        &mut self
            .slots[id.index()]
            .as_mut()
            .expect("heap id points at a freed slot")
            .data
    }

    /// Write barrier: a mutated black container is re-grayed so a collection
    /// in progress revisits it. Outside a collection all objects are white
    /// and this is a no-op.
    fn mark_dirty(&mut self, id: HeapId) {
        let slot = self.slots[id.index()].as_mut().expect("heap id points at a freed slot");
        if slot.color == Color::Black {
            slot.color = Color::Gray;
            self.gray.push(id);
        }
    }

    /// Whether the allocation watermark has been crossed since the last
    /// collection.
    #[inline]
    #[must_use]
    pub fn wants_collect(&self) -> bool {
        self.pending
    }

    #[must_use]
    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    /// Runs a full mark-and-sweep from the given roots.
    pub fn collect<I>(&mut self, roots: I)
    where
        I: IntoIterator<Item = HeapId>,
    {
        let before = self.bytes_allocated;
        self.gray.clear();
        for root in roots {
            self.gray_object(root);
        }
        while let Some(id) = self.gray.pop() {
            self.blacken(id);
        }
        let full = self.bytes_allocated > FULL_GC_BYTES;
        self.sweep();
        if full {
            self.compact();
        }
        self.next_gc = (self.bytes_allocated * GC_GROWTH_FACTOR).max(INITIAL_GC_BYTES);
        self.pending = false;
        self.collections += 1;
        tracing::debug!(
            collected = before - self.bytes_allocated,
            live = self.bytes_allocated,
            next_watermark = self.next_gc,
            full,
            "gc cycle complete"
        );
    }

    fn gray_object(&mut self, id: HeapId) {
        let Some(slot) = self.slots[id.index()].as_mut() else {
            return;
        };
        if slot.color == Color::White {
            slot.color = Color::Gray;
            self.gray.push(id);
        }
    }

    fn blacken(&mut self, id: HeapId) {
        let children: SmallVec<[HeapId; 8]> = {
            let slot = self.slots[id.index()].as_mut().expect("gray id points at a freed slot");
            slot.color = Color::Black;
            collect_children(&slot.data)
        };
        for child in children {
            self.gray_object(child);
        }
    }

    fn sweep(&mut self) {
        for index in 0..self.slots.len() {
            let Some(slot) = self.slots[index].as_mut() else {
                continue;
            };
            match slot.color {
                Color::White => {
                    let freed = self.slots[index].take().expect("slot vanished during sweep");
                    self.bytes_allocated -= freed.size;
                    if let Obj::Str(content) = &freed.data
                        && self.strings.get(&**content) == Some(&HeapId(index as u32))
                    {
                        self.strings.remove(&**content);
                    }
                    self.free.push(index as u32);
                }
                Color::Black | Color::Gray => slot.color = Color::White,
            }
        }
    }

    /// Trims trailing free slots and the free list after a large collection.
    fn compact(&mut self) {
        let mut new_len = self.slots.len();
        while new_len > 0 && self.slots[new_len - 1].is_none() {
            new_len -= 1;
        }
        self.slots.truncate(new_len);
        self.slots.shrink_to_fit();
        let limit = u32::try_from(new_len).expect("heap exceeds u32 slots");
        self.free.retain(|&index| index < limit);
        self.free.shrink_to_fit();
    }

    #[must_use]
    pub fn stats(&self) -> HeapStats {
        let mut objects_by_type = BTreeMap::new();
        let mut live_objects = 0;
        for slot in self.slots.iter().flatten() {
            live_objects += 1;
            *objects_by_type.entry(slot.data.kind_name()).or_insert(0) += 1;
        }
        HeapStats {
            live_objects,
            free_slots: self.free.len(),
            total_slots: self.slots.len(),
            objects_by_type,
            interned_strings: self.strings.len(),
            bytes_allocated: self.bytes_allocated,
            collections: self.collections,
        }
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

/// Child heap references of one object, for the mark phase.
fn collect_children(obj: &Obj) -> SmallVec<[HeapId; 8]> {
    let mut children = SmallVec::new();
    let mut push_value = |children: &mut SmallVec<[HeapId; 8]>, value: Value| {
        if let Value::Obj(id) = value {
            children.push(id);
        }
    };
    match obj {
        Obj::Str(_) | Obj::Range(_) | Obj::Native(_) | Obj::TypeObject(_) => {}
        Obj::List(list) => {
            for &item in &list.items {
                push_value(&mut children, item);
            }
        }
        Obj::Map(map) => {
            for (&key, &value) in &map.entries {
                push_value(&mut children, key.0);
                push_value(&mut children, value);
            }
        }
        Obj::Function(fun) => {
            for &constant in fun.chunk.constants() {
                push_value(&mut children, constant);
            }
        }
        Obj::Closure(closure) => {
            children.push(closure.function);
            children.extend(closure.upvalues.iter().copied());
        }
        Obj::Upvalue(upvalue) => {
            if let crate::value::Upvalue::Closed(value) = upvalue {
                push_value(&mut children, *value);
            }
        }
        Obj::Object(object) => {
            children.extend(object.methods.values().copied());
            if let Some(parent) = object.parent {
                children.push(parent);
            }
        }
        Obj::Instance(instance) => {
            children.push(instance.object);
            for &value in instance.fields.values() {
                push_value(&mut children, value);
            }
        }
        Obj::Enum(en) => {
            for &value in &en.values {
                push_value(&mut children, value);
            }
        }
        Obj::EnumInstance(case) => children.push(case.enum_),
    }
    children
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{ObjList, ObjRange};

    #[test]
    fn interning_deduplicates_strings() {
        let mut heap = Heap::new();
        let a = heap.intern_string("hello");
        let b = heap.intern_string("hello");
        let c = heap.intern_string("world");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn collect_frees_unrooted_objects_and_reuses_slots() {
        let mut heap = Heap::new();
        let dead = heap.alloc(Obj::Range(ObjRange { low: 0, high: 3 }));
        let live = heap.alloc(Obj::Range(ObjRange { low: 3, high: 9 }));
        heap.collect([live]);

        let stats = heap.stats();
        assert_eq!(stats.live_objects, 1);
        assert_eq!(stats.free_slots, 1);

        // The freed slot is recycled by the next allocation.
        let recycled = heap.alloc(Obj::Range(ObjRange { low: 0, high: 0 }));
        assert_eq!(recycled, dead);
    }

    #[test]
    fn mark_traces_through_containers() {
        let mut heap = Heap::new();
        let inner = heap.intern_string("kept alive through the list");
        let list = heap.alloc(Obj::List(ObjList {
            item_type: crate::typedef::TypeId::from_index(0),
            items: vec![Value::Obj(inner)],
        }));
        heap.collect([list]);
        assert_eq!(heap.stats().live_objects, 2);
        assert!(matches!(heap.get(inner), Obj::Str(_)));
    }

    #[test]
    fn sweeping_a_string_clears_its_intern_entry() {
        let mut heap = Heap::new();
        let first = heap.intern_string("transient");
        heap.collect([]);
        assert_eq!(heap.stats().interned_strings, 0);
        // Re-interning the same content allocates a fresh object.
        let second = heap.intern_string("transient");
        assert!(matches!(heap.get(second), Obj::Str(s) if &**s == "transient"));
        // The first id was freed and may be recycled; the intern table no
        // longer maps the content to the stale id.
        let _ = first;
    }
}
