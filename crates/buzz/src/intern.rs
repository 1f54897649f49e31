//! Identifier interning.
//!
//! The compiler interns every identifier once and refers to it by [`NameId`],
//! a compact index that is cheap to copy, compare, and embed into bytecode
//! operands. Runtime *string values* are interned separately, by content, on
//! the heap (see [`Heap::intern_string`](crate::heap::Heap::intern_string));
//! this table is only for names the compiler and the VM agree on: variables,
//! fields, methods, enum cases.

use ahash::AHashMap;

/// Index into the identifier interner.
///
/// `u32` keeps the id small enough to embed in a 24-bit bytecode operand;
/// the parser rejects programs that would overflow that range long before
/// four billion distinct identifiers exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct NameId(u32);

impl NameId {
    /// Reconstructs a `NameId` from a bytecode operand.
    #[inline]
    #[must_use]
    pub fn from_index(index: u32) -> Self {
        Self(index)
    }

    /// Returns the raw index value.
    #[inline]
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Names the compiler itself consults, interned up front so they can be
/// compared without lookups.
#[derive(Debug, Clone, Copy)]
pub struct WellKnown {
    pub empty: NameId,
    pub main: NameId,
    pub script: NameId,
    pub this: NameId,
    pub append: NameId,
    pub len: NameId,
    pub size: NameId,
    pub remove: NameId,
    pub to_list: NameId,
    pub value: NameId,
}

/// Identifier interner: `&str` to [`NameId`] and back.
#[derive(Debug)]
pub struct Interns {
    names: Vec<Box<str>>,
    lookup: AHashMap<Box<str>, NameId>,
    well_known: WellKnown,
}

impl Interns {
    #[must_use]
    pub fn new() -> Self {
        let mut interns = Self {
            names: Vec::new(),
            lookup: AHashMap::new(),
            well_known: WellKnown {
                empty: NameId(0),
                main: NameId(0),
                script: NameId(0),
                this: NameId(0),
                append: NameId(0),
                len: NameId(0),
                size: NameId(0),
                remove: NameId(0),
                to_list: NameId(0),
                value: NameId(0),
            },
        };
        interns.well_known = WellKnown {
            empty: interns.intern(""),
            main: interns.intern("main"),
            script: interns.intern("<script>"),
            this: interns.intern("this"),
            append: interns.intern("append"),
            len: interns.intern("len"),
            size: interns.intern("size"),
            remove: interns.intern("remove"),
            to_list: interns.intern("toList"),
            value: interns.intern("value"),
        };
        interns
    }

    /// Interns `name`, returning the existing id when it was seen before.
    pub fn intern(&mut self, name: &str) -> NameId {
        if let Some(&id) = self.lookup.get(name) {
            return id;
        }
        let id = NameId(
            u32::try_from(self.names.len()).expect("identifier interner exceeds u32 range"),
        );
        self.names.push(Box::from(name));
        self.lookup.insert(Box::from(name), id);
        id
    }

    /// Returns the text of an interned name.
    ///
    /// # Panics
    /// Panics when `id` did not come from this interner.
    #[must_use]
    pub fn get(&self, id: NameId) -> &str {
        &self.names[id.index()]
    }

    /// Names the compiler consults directly.
    #[must_use]
    pub fn well_known(&self) -> &WellKnown {
        &self.well_known
    }
}

impl Default for Interns {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intern_is_idempotent() {
        let mut interns = Interns::new();
        let a = interns.intern("counter");
        let b = interns.intern("counter");
        assert_eq!(a, b);
        assert_eq!(interns.get(a), "counter");
    }

    #[test]
    fn distinct_names_get_distinct_ids() {
        let mut interns = Interns::new();
        let a = interns.intern("x");
        let b = interns.intern("y");
        assert_ne!(a, b);
    }

    #[test]
    fn well_known_names_resolve() {
        let interns = Interns::new();
        assert_eq!(interns.get(interns.well_known().main), "main");
        assert_eq!(interns.get(interns.well_known().empty), "");
    }
}
