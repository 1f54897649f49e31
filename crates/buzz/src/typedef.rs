//! Structural type descriptors and the interning registry.
//!
//! Every type the checker reasons about is registered once and addressed by
//! [`TypeId`]; after placeholder resolution, `TypeId` equality *is* type
//! equality. Object and enum types are nominal: their descriptors carry an
//! index into registry-owned metadata ([`ObjectInfo`], [`EnumInfo`]) instead
//! of embedding their structure, so recursive types (an object whose method
//! takes its own instance) never form cycles in the descriptor table.
//!
//! Forward references intern a `Placeholder` descriptor; a later declaration
//! links it to the concrete type through a side table, and `resolve` follows
//! that link. Placeholders still unlinked when compilation ends are reported
//! as "Unknown type".

use ahash::AHashMap;

use crate::intern::{Interns, NameId};

/// Index into the type registry. Equality after [`TypeRegistry::resolve`]
/// implies type equality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeId(u32);

impl TypeId {
    /// Reconstructs a `TypeId` from a bytecode operand.
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

/// Index of a nominal object type's metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectId(u32);

impl ObjectId {
    #[inline]
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Index of a nominal enum type's metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EnumId(u32);

impl EnumId {
    #[inline]
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// What a function is, from the compiler's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FunctionKind {
    /// Imported module body.
    Script,
    /// Top-level module body of the entry compilation.
    ScriptEntryPoint,
    Function,
    Method,
    /// `main`.
    EntryPoint,
    /// Implemented by the host through the native ABI.
    Extern,
    Anonymous,
    /// Catch clause attached to a call site.
    Catch,
    /// `test "..." { ... }` block.
    Test,
}

/// Signature of a function type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FunctionType {
    pub name: Option<NameId>,
    /// Parameters in declaration order.
    pub params: Vec<(NameId, TypeId)>,
    /// Parallel to `params`: whether the parameter has a default value.
    pub defaults: Vec<bool>,
    pub ret: TypeId,
    pub kind: FunctionKind,
}

impl FunctionType {
    /// Position of a named parameter, if declared.
    #[must_use]
    pub fn param_index(&self, name: NameId) -> Option<usize> {
        self.params.iter().position(|&(n, _)| n == name)
    }
}

/// Structural shape of a type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TypeDesc {
    Void,
    Bool,
    Integer,
    Float,
    Str,
    Range,
    List { item: TypeId },
    Map { key: TypeId, value: TypeId },
    /// The object type itself (the value bound to an `object` declaration).
    Object { object: ObjectId },
    /// An instance of an object type.
    Instance { object: TypeId },
    /// The enum type itself.
    Enum { enum_: EnumId },
    /// A case of an enum.
    EnumInstance { enum_: TypeId },
    Function(FunctionType),
    /// Stand-in for a name not yet declared.
    Placeholder { id: u32, name: NameId },
}

/// A registered type: shape plus optional flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeEntry {
    pub desc: TypeDesc,
    pub optional: bool,
}

/// A field declared on an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldInfo {
    pub name: NameId,
    pub ty: TypeId,
    pub has_default: bool,
}

/// A method declared on an object. `ty` is the method's function type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodInfo {
    pub name: NameId,
    pub ty: TypeId,
}

/// Metadata of a nominal object type: own fields and methods only; lookups
/// walk the parent chain.
#[derive(Debug, Clone)]
pub struct ObjectInfo {
    pub name: NameId,
    /// TypeId of the `Object` descriptor.
    pub type_id: TypeId,
    /// TypeId of the `Instance` descriptor.
    pub instance_type: TypeId,
    pub parent: Option<ObjectId>,
    pub fields: Vec<FieldInfo>,
    pub methods: Vec<MethodInfo>,
}

/// Metadata of a nominal enum type.
#[derive(Debug, Clone)]
pub struct EnumInfo {
    pub name: NameId,
    pub type_id: TypeId,
    pub instance_type: TypeId,
    /// Type of the per-case value (`int` or `str` in the surface grammar).
    pub underlying: TypeId,
    pub cases: Vec<NameId>,
}

/// Pre-interned primitive type ids.
#[derive(Debug, Clone, Copy)]
pub struct Primitives {
    pub void: TypeId,
    pub boolean: TypeId,
    pub integer: TypeId,
    pub float: TypeId,
    pub string: TypeId,
    pub range: TypeId,
}

/// Interning registry for type descriptors.
///
/// Descriptors live for the lifetime of the registry and are never freed.
#[derive(Debug)]
pub struct TypeRegistry {
    defs: Vec<TypeEntry>,
    lookup: AHashMap<(TypeDesc, bool), TypeId>,
    /// Placeholder id -> resolved target, non-optional flavor.
    links: AHashMap<u32, TypeId>,
    /// Placeholder id -> resolved target, optional flavor.
    links_optional: AHashMap<u32, TypeId>,
    /// All placeholder TypeIds ever created, for end-of-compilation checks.
    placeholders: Vec<TypeId>,
    objects: Vec<ObjectInfo>,
    enums: Vec<EnumInfo>,
    next_placeholder: u32,
    prim: Primitives,
}

impl TypeRegistry {
    #[must_use]
    pub fn new() -> Self {
        let mut registry = Self {
            defs: Vec::new(),
            lookup: AHashMap::new(),
            links: AHashMap::new(),
            links_optional: AHashMap::new(),
            placeholders: Vec::new(),
            objects: Vec::new(),
            enums: Vec::new(),
            next_placeholder: 0,
            prim: Primitives {
                void: TypeId(0),
                boolean: TypeId(0),
                integer: TypeId(0),
                float: TypeId(0),
                string: TypeId(0),
                range: TypeId(0),
            },
        };
        registry.prim = Primitives {
            void: registry.intern(TypeDesc::Void, false),
            boolean: registry.intern(TypeDesc::Bool, false),
            integer: registry.intern(TypeDesc::Integer, false),
            float: registry.intern(TypeDesc::Float, false),
            string: registry.intern(TypeDesc::Str, false),
            range: registry.intern(TypeDesc::Range, false),
        };
        registry
    }

    /// Pre-interned primitive ids.
    #[must_use]
    pub fn prim(&self) -> Primitives {
        self.prim
    }

    /// Interns a descriptor, returning the existing id for an identical
    /// (shape, optional) pair.
    ///
    /// # Panics
    /// Panics when handed a `Placeholder`; placeholders are created through
    /// [`TypeRegistry::placeholder`] and are intentionally never deduplicated.
    pub fn intern(&mut self, desc: TypeDesc, optional: bool) -> TypeId {
        assert!(
            !matches!(desc, TypeDesc::Placeholder { .. }),
            "placeholders are created via TypeRegistry::placeholder"
        );
        if let Some(&id) = self.lookup.get(&(desc.clone(), optional)) {
            return id;
        }
        let id = self.push_entry(TypeEntry { desc: desc.clone(), optional });
        self.lookup.insert((desc, optional), id);
        id
    }

    /// Creates a fresh, unresolved placeholder for `name`.
    pub fn placeholder(&mut self, name: NameId, optional: bool) -> TypeId {
        let id = self.next_placeholder;
        self.next_placeholder += 1;
        let type_id = self.push_entry(TypeEntry {
            desc: TypeDesc::Placeholder { id, name },
            optional,
        });
        self.placeholders.push(type_id);
        type_id
    }

    /// Links every flavor of a placeholder to a concrete type.
    ///
    /// Both the plain and the optional spelling of the placeholder resolve
    /// after this call, so `Foo?` written before `object Foo` lands on the
    /// optional concrete type.
    pub fn link_placeholder(&mut self, placeholder: TypeId, target: TypeId) {
        let TypeDesc::Placeholder { id, .. } = self.defs[placeholder.index()].desc else {
            return;
        };
        let target = self.resolve(target);
        let optional_target = self.with_optional(target, true);
        self.links.insert(id, target);
        self.links_optional.insert(id, optional_target);
    }

    /// Follows placeholder links to the concrete type; identity for anything
    /// already concrete or still unresolved.
    #[must_use]
    pub fn resolve(&self, id: TypeId) -> TypeId {
        let mut current = id;
        // Links always point at concrete types, so one hop suffices; the loop
        // guards against a placeholder linked to another placeholder.
        for _ in 0..self.defs.len() {
            let entry = &self.defs[current.index()];
            let TypeDesc::Placeholder { id: ph, .. } = entry.desc else {
                return current;
            };
            let table = if entry.optional { &self.links_optional } else { &self.links };
            match table.get(&ph) {
                Some(&next) => current = next,
                None => return current,
            }
        }
        current
    }

    /// Placeholders that never resolved, with their names.
    #[must_use]
    pub fn unresolved_placeholders(&self) -> Vec<NameId> {
        let mut names = Vec::new();
        for &ph in &self.placeholders {
            let entry = &self.defs[ph.index()];
            if let TypeDesc::Placeholder { id, name } = entry.desc
                && !self.links.contains_key(&id)
            {
                names.push(name);
            }
        }
        names
    }

    /// The resolved shape of a type.
    #[must_use]
    pub fn desc(&self, id: TypeId) -> &TypeDesc {
        &self.defs[self.resolve(id).index()].desc
    }

    /// Whether the resolved type is optional.
    #[must_use]
    pub fn is_optional(&self, id: TypeId) -> bool {
        self.defs[self.resolve(id).index()].optional
    }

    /// Re-interns the resolved shape of `id` with the given optional flag.
    pub fn with_optional(&mut self, id: TypeId, optional: bool) -> TypeId {
        let resolved = self.resolve(id);
        let entry = self.defs[resolved.index()].clone();
        if entry.optional == optional {
            return resolved;
        }
        if matches!(entry.desc, TypeDesc::Placeholder { .. }) {
            // Unresolved forward reference: give the flipped flavor its own
            // entry sharing the placeholder id, so linking resolves both.
            let type_id = self.push_entry(TypeEntry { desc: entry.desc, optional });
            self.placeholders.push(type_id);
            return type_id;
        }
        self.intern(entry.desc, optional)
    }

    /// Structural equivalence: like resolved-id equality, except function
    /// types compare by parameter and return types alone — the declared
    /// name, parameter names, kinds, and defaults do not distinguish them.
    /// Containers compare their element types by the same relation.
    #[must_use]
    pub fn equivalent(&self, a: TypeId, b: TypeId) -> bool {
        let a = self.resolve(a);
        let b = self.resolve(b);
        self.defs[a.index()].optional == self.defs[b.index()].optional
            && self.shape_equivalent(a, b)
    }

    /// Equivalence of the resolved shapes, ignoring the top-level optional
    /// flag. Nested types compare with their flags via [`Self::equivalent`].
    fn shape_equivalent(&self, a: TypeId, b: TypeId) -> bool {
        if a == b {
            return true;
        }
        let a_desc = &self.defs[a.index()].desc;
        let b_desc = &self.defs[b.index()].desc;
        match (a_desc, b_desc) {
            (TypeDesc::List { item: a_item }, TypeDesc::List { item: b_item }) => {
                self.equivalent(*a_item, *b_item)
            }
            (
                TypeDesc::Map {
                    key: a_key,
                    value: a_value,
                },
                TypeDesc::Map {
                    key: b_key,
                    value: b_value,
                },
            ) => self.equivalent(*a_key, *b_key) && self.equivalent(*a_value, *b_value),
            (TypeDesc::Function(a_fn), TypeDesc::Function(b_fn)) => {
                a_fn.params.len() == b_fn.params.len()
                    && a_fn
                        .params
                        .iter()
                        .zip(&b_fn.params)
                        .all(|(&(_, pa), &(_, pb))| self.equivalent(pa, pb))
                    && self.equivalent(a_fn.ret, b_fn.ret)
            }
            _ => a_desc == b_desc,
        }
    }

    /// Whether a value of type `from` may be bound where `to` is expected.
    #[must_use]
    pub fn assignable(&self, from: TypeId, to: TypeId) -> bool {
        let from = self.resolve(from);
        let to = self.resolve(to);
        if self.equivalent(from, to) {
            return true;
        }
        let from_entry = &self.defs[from.index()];
        let to_entry = &self.defs[to.index()];
        // A non-optional value flows into its optional peer.
        if to_entry.optional && !from_entry.optional && self.shape_equivalent(from, to) {
            return true;
        }
        // Instance covariance along the parent chain.
        if let (TypeDesc::Instance { object: from_obj }, TypeDesc::Instance { object: to_obj }) =
            (&from_entry.desc, &to_entry.desc)
        {
            if from_entry.optional && !to_entry.optional {
                return false;
            }
            let (Some(from_id), Some(to_id)) =
                (self.object_id_of(*from_obj), self.object_id_of(*to_obj))
            else {
                return false;
            };
            let mut current = Some(from_id);
            while let Some(obj) = current {
                if obj == to_id {
                    return true;
                }
                current = self.objects[obj.index()].parent;
            }
        }
        false
    }

    fn object_id_of(&self, object_type: TypeId) -> Option<ObjectId> {
        match self.desc(object_type) {
            TypeDesc::Object { object } => Some(*object),
            _ => None,
        }
    }

    /// Registers a new object type, returning its metadata handle and the
    /// ids of its `Object` and `Instance` descriptors.
    pub fn declare_object(&mut self, name: NameId, parent: Option<ObjectId>) -> ObjectId {
        let object = ObjectId(
            u32::try_from(self.objects.len()).expect("object count exceeds u32 range"),
        );
        let type_id = self.intern(TypeDesc::Object { object }, false);
        let instance_type = self.intern(TypeDesc::Instance { object: type_id }, false);
        self.objects.push(ObjectInfo {
            name,
            type_id,
            instance_type,
            parent,
            fields: Vec::new(),
            methods: Vec::new(),
        });
        object
    }

    #[must_use]
    pub fn object(&self, id: ObjectId) -> &ObjectInfo {
        &self.objects[id.index()]
    }

    pub fn object_mut(&mut self, id: ObjectId) -> &mut ObjectInfo {
        &mut self.objects[id.index()]
    }

    /// Looks up a field on an object, walking the parent chain.
    #[must_use]
    pub fn field_of(&self, object: ObjectId, name: NameId) -> Option<FieldInfo> {
        let mut current = Some(object);
        while let Some(obj) = current {
            let info = &self.objects[obj.index()];
            if let Some(field) = info.fields.iter().find(|f| f.name == name) {
                return Some(*field);
            }
            current = info.parent;
        }
        None
    }

    /// Looks up a method on an object, walking the parent chain.
    #[must_use]
    pub fn method_of(&self, object: ObjectId, name: NameId) -> Option<MethodInfo> {
        let mut current = Some(object);
        while let Some(obj) = current {
            let info = &self.objects[obj.index()];
            if let Some(method) = info.methods.iter().find(|m| m.name == name) {
                return Some(*method);
            }
            current = info.parent;
        }
        None
    }

    /// Every field an instance of `object` carries, parents first.
    #[must_use]
    pub fn all_fields(&self, object: ObjectId) -> Vec<FieldInfo> {
        let mut chain = Vec::new();
        let mut current = Some(object);
        while let Some(obj) = current {
            chain.push(obj);
            current = self.objects[obj.index()].parent;
        }
        let mut fields = Vec::new();
        for obj in chain.into_iter().rev() {
            fields.extend(self.objects[obj.index()].fields.iter().copied());
        }
        fields
    }

    /// Registers a new enum type.
    pub fn declare_enum(&mut self, name: NameId, underlying: TypeId, cases: Vec<NameId>) -> EnumId {
        let enum_ = EnumId(u32::try_from(self.enums.len()).expect("enum count exceeds u32 range"));
        let type_id = self.intern(TypeDesc::Enum { enum_ }, false);
        let instance_type = self.intern(TypeDesc::EnumInstance { enum_: type_id }, false);
        self.enums.push(EnumInfo {
            name,
            type_id,
            instance_type,
            underlying,
            cases,
        });
        enum_
    }

    #[must_use]
    pub fn enum_info(&self, id: EnumId) -> &EnumInfo {
        &self.enums[id.index()]
    }

    /// Human-readable spelling of a type, for diagnostics.
    #[must_use]
    pub fn type_name(&self, id: TypeId, interns: &Interns) -> String {
        let resolved = self.resolve(id);
        let entry = &self.defs[resolved.index()];
        let mut name = match &entry.desc {
            TypeDesc::Void => "void".to_string(),
            TypeDesc::Bool => "bool".to_string(),
            TypeDesc::Integer => "int".to_string(),
            TypeDesc::Float => "float".to_string(),
            TypeDesc::Str => "str".to_string(),
            TypeDesc::Range => "range".to_string(),
            TypeDesc::List { item } => format!("[{}]", self.type_name(*item, interns)),
            TypeDesc::Map { key, value } => format!(
                "{{{}, {}}}",
                self.type_name(*key, interns),
                self.type_name(*value, interns)
            ),
            TypeDesc::Object { object } => {
                format!("object {}", interns.get(self.objects[object.index()].name))
            }
            TypeDesc::Instance { object } => match self.desc(*object) {
                TypeDesc::Object { object } => {
                    interns.get(self.objects[object.index()].name).to_string()
                }
                _ => "instance".to_string(),
            },
            TypeDesc::Enum { enum_ } => {
                format!("enum {}", interns.get(self.enums[enum_.index()].name))
            }
            TypeDesc::EnumInstance { enum_ } => match self.desc(*enum_) {
                TypeDesc::Enum { enum_ } => {
                    interns.get(self.enums[enum_.index()].name).to_string()
                }
                _ => "enum case".to_string(),
            },
            TypeDesc::Function(fun) => {
                let params = fun
                    .params
                    .iter()
                    .map(|&(_, ty)| self.type_name(ty, interns))
                    .collect::<Vec<_>>()
                    .join(", ");
                format!("fun ({params}) > {}", self.type_name(fun.ret, interns))
            }
            TypeDesc::Placeholder { name, .. } => interns.get(*name).to_string(),
        };
        if entry.optional {
            name.push('?');
        }
        name
    }

    fn push_entry(&mut self, entry: TypeEntry) -> TypeId {
        let id = TypeId(u32::try_from(self.defs.len()).expect("type registry exceeds u32 range"));
        self.defs.push(entry);
        id
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn structural_interning_deduplicates() {
        let mut registry = TypeRegistry::new();
        let int = registry.prim().integer;
        let a = registry.intern(TypeDesc::List { item: int }, false);
        let b = registry.intern(TypeDesc::List { item: int }, false);
        assert_eq!(a, b);
        let opt = registry.intern(TypeDesc::List { item: int }, true);
        assert_ne!(a, opt);
    }

    #[test]
    fn placeholder_links_both_flavors() {
        let mut interns = Interns::new();
        let mut registry = TypeRegistry::new();
        let name = interns.intern("Tree");
        let ph = registry.placeholder(name, false);
        let ph_opt = registry.with_optional(ph, true);

        let object = registry.declare_object(name, None);
        let instance = registry.object(object).instance_type;
        registry.link_placeholder(ph, instance);

        assert_eq!(registry.resolve(ph), instance);
        let resolved_opt = registry.resolve(ph_opt);
        assert!(registry.is_optional(resolved_opt));
        assert_eq!(registry.with_optional(resolved_opt, false), instance);
        assert!(registry.unresolved_placeholders().is_empty());
    }

    #[test]
    fn unresolved_placeholder_is_reported() {
        let mut interns = Interns::new();
        let mut registry = TypeRegistry::new();
        let name = interns.intern("Ghost");
        let _ph = registry.placeholder(name, false);
        assert_eq!(registry.unresolved_placeholders(), vec![name]);
    }

    #[test]
    fn instance_assignability_walks_parent_chain() {
        let mut interns = Interns::new();
        let mut registry = TypeRegistry::new();
        let animal = registry.declare_object(interns.intern("Animal"), None);
        let dog = registry.declare_object(interns.intern("Dog"), Some(animal));
        let animal_instance = registry.object(animal).instance_type;
        let dog_instance = registry.object(dog).instance_type;
        assert!(registry.assignable(dog_instance, animal_instance));
        assert!(!registry.assignable(animal_instance, dog_instance));
    }

    #[test]
    fn optional_accepts_non_optional_peer() {
        let mut registry = TypeRegistry::new();
        let int = registry.prim().integer;
        let opt_int = registry.with_optional(int, true);
        assert!(registry.assignable(int, opt_int));
        assert!(!registry.assignable(opt_int, int));
    }
}
