//! Component type descriptors.
//!
//! The component schema is declared by the host at world-build time rather
//! than baked into Rust types, so `ComponentType` is a plain data value
//! registered once at `World::create` and never mutated afterwards.

use std::fmt;

/// Dense id assigned at registration; also the bit position in every
/// presence/trigger `Bitset`.
pub type ComponentTypeId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageFlavor {
    /// index = entity index; presence bitset is authoritative.
    Packed,
    /// presence bitset + entity-index -> dense-slot map.
    Sparse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarKind {
    Bool,
    U8,
    U16,
    U32,
    I8,
    I16,
    I32,
    F32,
    F64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VectorShape {
    pub components: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldKind {
    Bool,
    U8,
    U16,
    U32,
    I8,
    I16,
    I32,
    F32,
    F64,
    /// Index into a fixed enumeration of strings declared on the field.
    StaticString { variants: Vec<String> },
    /// Byte-heap backed string capped at `max_bytes`.
    DynamicString { max_bytes: usize },
    Ref,
    Object,
    WeakObject,
    Vector {
        scalar: ScalarKind,
        shape: VectorShape,
        wrapper_class: Option<String>,
    },
    /// Computed field: not stored in the component's own columns, served by
    /// the `RefIndex`.
    Backrefs {
        source_type: Option<String>,
        field_name: Option<String>,
        include_stale: bool,
    },
}

impl FieldKind {
    pub fn is_ref(&self) -> bool {
        matches!(self, FieldKind::Ref)
    }

    pub fn is_backrefs(&self) -> bool {
        matches!(self, FieldKind::Backrefs { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDef {
    pub name: String,
    pub kind: FieldKind,
}

impl FieldDef {
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        FieldDef {
            name: name.into(),
            kind,
        }
    }
}

/// A registered component type: a name, a storage flavor, and an ordered
/// field list. `id` is assigned densely by the registry at registration
/// time and never changes afterward.
#[derive(Debug, Clone)]
pub struct ComponentType {
    pub id: ComponentTypeId,
    pub name: String,
    pub storage: StorageFlavor,
    pub fields: Vec<FieldDef>,
}

impl ComponentType {
    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }
}

impl fmt::Display for ComponentType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Host-supplied schema used at `World::create` time.
#[derive(Debug, Clone)]
pub struct ComponentTypeDef {
    pub name: String,
    pub storage: Option<StorageFlavor>,
    pub fields: Vec<FieldDef>,
}

impl ComponentTypeDef {
    pub fn new(name: impl Into<String>) -> Self {
        ComponentTypeDef {
            name: name.into(),
            storage: None,
            fields: Vec::new(),
        }
    }

    pub fn storage(mut self, flavor: StorageFlavor) -> Self {
        self.storage = Some(flavor);
        self
    }

    pub fn field(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.fields.push(FieldDef::new(name, kind));
        self
    }
}
