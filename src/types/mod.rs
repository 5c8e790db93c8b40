//! Type descriptors and the per-session type registry.
//!
//! Each class is described once, on first export, by a [`TypeDescriptor`]
//! carrying its full member list (inherited members included) and the
//! transitive ancestor set. The peer caches descriptors under their type id
//! and afterwards refers to the class by id alone. Type ids are stable for
//! the life of a session; descriptors are immutable once published.

mod specificity;

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, RwLock},
};

use bitflags::bitflags;
use bytes::{BufMut, BytesMut};
use thiserror::Error;

pub use specificity::{OverloadSet, numeric_ladder_pos};

use crate::codec::{CodecError, Cursor, put_str};

/// Session-stable identifier for a class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeId(pub u32);

impl TypeId {
    /// `void`, the return type of methods that produce nothing.
    pub const VOID: Self = Self(0);
    /// Primitive boolean.
    pub const BOOL: Self = Self(1);
    /// Primitive signed 8-bit integer.
    pub const I8: Self = Self(2);
    /// Primitive signed 16-bit integer.
    pub const I16: Self = Self(3);
    /// Primitive signed 32-bit integer.
    pub const I32: Self = Self(4);
    /// Primitive signed 64-bit integer.
    pub const I64: Self = Self(5);
    /// Primitive IEEE-754 single.
    pub const F32: Self = Self(6);
    /// Primitive IEEE-754 double.
    pub const F64: Self = Self(7);
    /// Immutable string value type.
    pub const STRING: Self = Self(8);
    /// Raw byte-array value type.
    pub const BYTES: Self = Self(9);
    /// Root of every reference type.
    pub const OBJECT: Self = Self(10);
    /// Boxed boolean.
    pub const BOOL_BOX: Self = Self(11);
    /// Boxed signed 8-bit integer.
    pub const I8_BOX: Self = Self(12);
    /// Boxed signed 16-bit integer.
    pub const I16_BOX: Self = Self(13);
    /// Boxed signed 32-bit integer.
    pub const I32_BOX: Self = Self(14);
    /// Boxed signed 64-bit integer.
    pub const I64_BOX: Self = Self(15);
    /// Boxed IEEE-754 single.
    pub const F32_BOX: Self = Self(16);
    /// Boxed IEEE-754 double.
    pub const F64_BOX: Self = Self(17);
    /// Generic sequence interface; by-value container conversions target it.
    pub const SEQUENCE: Self = Self(18);
    /// Generic mapping interface; by-value container conversions target it.
    pub const MAPPING: Self = Self(19);
    /// First id available to user-defined classes.
    pub const FIRST_USER: u32 = 32;

    /// The boxed counterpart of a primitive id, if any.
    #[must_use]
    pub const fn boxed(self) -> Option<Self> {
        Some(match self {
            Self::BOOL => Self::BOOL_BOX,
            Self::I8 => Self::I8_BOX,
            Self::I16 => Self::I16_BOX,
            Self::I32 => Self::I32_BOX,
            Self::I64 => Self::I64_BOX,
            Self::F32 => Self::F32_BOX,
            Self::F64 => Self::F64_BOX,
            _ => return None,
        })
    }

    /// The primitive counterpart of a boxed id, if any.
    #[must_use]
    pub const fn unboxed(self) -> Option<Self> {
        Some(match self {
            Self::BOOL_BOX => Self::BOOL,
            Self::I8_BOX => Self::I8,
            Self::I16_BOX => Self::I16,
            Self::I32_BOX => Self::I32,
            Self::I64_BOX => Self::I64,
            Self::F32_BOX => Self::F32,
            Self::F64_BOX => Self::F64,
            _ => return None,
        })
    }
}

impl fmt::Display for TypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "#{}", self.0) }
}

bitflags! {
    /// Structural classification bits on a descriptor.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TypeFlags: u8 {
        /// Array class; `element` names the element type.
        const ARRAY = 1 << 0;
        /// Primitive class.
        const PRIMITIVE = 1 << 1;
        /// Interface (no state, implementable by proxies).
        const INTERFACE = 1 << 2;
        /// Immutable value type (numbers, strings).
        const VALUE = 1 << 3;
        /// Sequence-shaped: accepts by-value list conversion.
        const SEQUENCE = 1 << 4;
        /// Mapping-shaped: accepts by-value map conversion.
        const MAPPING = 1 << 5;
    }
}

/// One method (or constructor) signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodDescriptor {
    /// Member name; constructors use the class name.
    pub name: String,
    /// Declared parameter types, in order.
    pub params: Vec<TypeId>,
    /// Declared return type.
    pub ret: TypeId,
    /// Static methods accept a class target instead of an instance.
    pub is_static: bool,
    /// Variadic: the last parameter absorbs any trailing arguments of its
    /// element type.
    pub variadic: bool,
    /// Invocation slot within the owning class.
    pub slot: u32,
    /// Position in the topological enumeration of the overload set.
    pub rank: u32,
}

impl MethodDescriptor {
    /// Whether an argument tuple of length `n` fits this arity.
    #[must_use]
    pub fn accepts_arity(&self, n: usize) -> bool {
        if self.variadic {
            n + 1 >= self.params.len()
        } else {
            n == self.params.len()
        }
    }

    /// Render `name(paramId, ...)` for diagnostics.
    #[must_use]
    pub fn signature(&self, registry: &TypeRegistry) -> String {
        let params: Vec<String> = self
            .params
            .iter()
            .map(|p| registry.name_of(*p).unwrap_or_else(|| p.to_string()))
            .collect();
        format!("{}({})", self.name, params.join(","))
    }
}

/// One public field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescriptor {
    /// Field name.
    pub name: String,
    /// Declared type.
    pub type_id: TypeId,
    /// Access slot within the owning class.
    pub slot: u32,
}

/// Everything the peer needs to know about a class, shipped in one batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeDescriptor {
    /// Session-stable id.
    pub id: TypeId,
    /// Canonical dotted name.
    pub name: String,
    /// Direct supertypes (base class plus declared interfaces).
    pub supers: Vec<TypeId>,
    /// Transitive closure of `supers`.
    pub ancestors: Vec<TypeId>,
    /// Classification bits.
    pub flags: TypeFlags,
    /// Element type for array classes.
    pub element: Option<TypeId>,
    /// Constructor signatures.
    pub constructors: Vec<MethodDescriptor>,
    /// Method signatures, inherited members included.
    pub methods: Vec<MethodDescriptor>,
    /// Public fields.
    pub fields: Vec<FieldDescriptor>,
}

impl TypeDescriptor {
    /// Whether `ancestor` appears in this class's transitive ancestor set.
    #[must_use]
    pub fn has_ancestor(&self, ancestor: TypeId) -> bool {
        self.ancestors.contains(&ancestor)
    }

    /// All methods named `name`.
    #[must_use]
    pub fn methods_named(&self, name: &str) -> Vec<&MethodDescriptor> {
        self.methods.iter().filter(|m| m.name == name).collect()
    }

    /// The field named `name`.
    #[must_use]
    pub fn field_named(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|f| f.name == name)
    }

    fn encode_method(buf: &mut BytesMut, m: &MethodDescriptor) {
        put_str(buf, &m.name);
        buf.put_u32(u32::try_from(m.params.len()).unwrap_or(u32::MAX));
        for p in &m.params {
            buf.put_u32(p.0);
        }
        buf.put_u32(m.ret.0);
        buf.put_u8(u8::from(m.is_static) | (u8::from(m.variadic) << 1));
        buf.put_u32(m.slot);
        buf.put_u32(m.rank);
    }

    fn decode_method(cur: &mut Cursor<'_>) -> Result<MethodDescriptor, CodecError> {
        let name = cur.get_str()?;
        let n_params = cur.get_u32()? as usize;
        let mut params = Vec::with_capacity(n_params.min(255));
        for _ in 0..n_params {
            params.push(TypeId(cur.get_u32()?));
        }
        let ret = TypeId(cur.get_u32()?);
        let bits = cur.get_u8()?;
        let slot = cur.get_u32()?;
        let rank = cur.get_u32()?;
        Ok(MethodDescriptor {
            name,
            params,
            ret,
            is_static: bits & 1 != 0,
            variadic: bits & 2 != 0,
            slot,
            rank,
        })
    }

    /// Serialise the descriptor for a GET_TYPE_DESCRIPTOR reply.
    #[must_use]
    pub fn to_bytes(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_u32(self.id.0);
        put_str(&mut buf, &self.name);
        buf.put_u32(u32::try_from(self.supers.len()).unwrap_or(u32::MAX));
        for s in &self.supers {
            buf.put_u32(s.0);
        }
        buf.put_u32(u32::try_from(self.ancestors.len()).unwrap_or(u32::MAX));
        for a in &self.ancestors {
            buf.put_u32(a.0);
        }
        buf.put_u8(self.flags.bits());
        match self.element {
            Some(e) => {
                buf.put_u8(1);
                buf.put_u32(e.0);
            }
            None => buf.put_u8(0),
        }
        buf.put_u32(u32::try_from(self.constructors.len()).unwrap_or(u32::MAX));
        for c in &self.constructors {
            Self::encode_method(&mut buf, c);
        }
        buf.put_u32(u32::try_from(self.methods.len()).unwrap_or(u32::MAX));
        for m in &self.methods {
            Self::encode_method(&mut buf, m);
        }
        buf.put_u32(u32::try_from(self.fields.len()).unwrap_or(u32::MAX));
        for f in &self.fields {
            put_str(&mut buf, &f.name);
            buf.put_u32(f.type_id.0);
            buf.put_u32(f.slot);
        }
        buf
    }

    /// Parse a descriptor from a GET_TYPE_DESCRIPTOR reply.
    ///
    /// # Errors
    /// Returns a [`CodecError`] for truncated or malformed payloads.
    pub fn decode(cur: &mut Cursor<'_>) -> Result<Self, CodecError> {
        let id = TypeId(cur.get_u32()?);
        let name = cur.get_str()?;
        let n_supers = cur.get_u32()? as usize;
        let mut supers = Vec::with_capacity(n_supers.min(64));
        for _ in 0..n_supers {
            supers.push(TypeId(cur.get_u32()?));
        }
        let n_ancestors = cur.get_u32()? as usize;
        let mut ancestors = Vec::with_capacity(n_ancestors.min(256));
        for _ in 0..n_ancestors {
            ancestors.push(TypeId(cur.get_u32()?));
        }
        let flags = TypeFlags::from_bits_truncate(cur.get_u8()?);
        let element = if cur.get_u8()? == 1 {
            Some(TypeId(cur.get_u32()?))
        } else {
            None
        };
        let n_ctors = cur.get_u32()? as usize;
        let mut constructors = Vec::with_capacity(n_ctors.min(64));
        for _ in 0..n_ctors {
            constructors.push(Self::decode_method(cur)?);
        }
        let n_methods = cur.get_u32()? as usize;
        let mut methods = Vec::with_capacity(n_methods.min(1024));
        for _ in 0..n_methods {
            methods.push(Self::decode_method(cur)?);
        }
        let n_fields = cur.get_u32()? as usize;
        let mut fields = Vec::with_capacity(n_fields.min(1024));
        for _ in 0..n_fields {
            fields.push(FieldDescriptor {
                name: cur.get_str()?,
                type_id: TypeId(cur.get_u32()?),
                slot: cur.get_u32()?,
            });
        }
        Ok(Self {
            id,
            name,
            supers,
            ancestors,
            flags,
            element,
            constructors,
            methods,
            fields,
        })
    }
}

/// Errors raised by registry operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TypeError {
    /// A descriptor for this id is already interned with different content.
    #[error("type id {0} already interned")]
    DuplicateId(TypeId),
    /// The id has no interned descriptor.
    #[error("unknown type id {0}")]
    UnknownId(TypeId),
}

/// Per-session cache of interned descriptors, keyed by id and by name.
///
/// Entries are immutable once inserted; lookups clone the `Arc`.
#[derive(Debug, Default)]
pub struct TypeRegistry {
    inner: RwLock<RegistryInner>,
}

#[derive(Debug, Default)]
struct RegistryInner {
    by_id: HashMap<TypeId, Arc<TypeDescriptor>>,
    by_name: HashMap<String, TypeId>,
}

impl TypeRegistry {
    /// Create a registry pre-seeded with the well-known built-in types.
    #[must_use]
    pub fn with_builtins() -> Self {
        let reg = Self::default();
        for desc in builtin_descriptors() {
            let _ = reg.intern(Arc::new(desc));
        }
        reg
    }

    /// Intern a descriptor.
    ///
    /// # Errors
    /// Returns [`TypeError::DuplicateId`] when a different descriptor is
    /// already interned under the same id; re-interning an identical
    /// descriptor is a no-op.
    pub fn intern(&self, desc: Arc<TypeDescriptor>) -> Result<(), TypeError> {
        let mut inner = self.inner.write().unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(existing) = inner.by_id.get(&desc.id) {
            if **existing == *desc {
                return Ok(());
            }
            return Err(TypeError::DuplicateId(desc.id));
        }
        inner.by_name.insert(desc.name.clone(), desc.id);
        inner.by_id.insert(desc.id, desc);
        Ok(())
    }

    /// Look up a descriptor by id.
    #[must_use]
    pub fn get(&self, id: TypeId) -> Option<Arc<TypeDescriptor>> {
        self.inner
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .by_id
            .get(&id)
            .cloned()
    }

    /// Look up a type id by canonical name.
    #[must_use]
    pub fn id_of(&self, name: &str) -> Option<TypeId> {
        self.inner
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .by_name
            .get(name)
            .copied()
    }

    /// Canonical name of an interned id.
    #[must_use]
    pub fn name_of(&self, id: TypeId) -> Option<String> {
        self.get(id).map(|d| d.name.clone())
    }

    /// Whether `a` is `b` or lists `b` among its transitive ancestors.
    #[must_use]
    pub fn is_subtype(&self, a: TypeId, b: TypeId) -> bool {
        if a == b || b == TypeId::OBJECT && self.get(a).is_some_and(|d| !d.flags.contains(TypeFlags::PRIMITIVE)) {
            return true;
        }
        self.get(a).is_some_and(|d| d.has_ancestor(b))
    }

    /// Length of the shortest ancestor chain from `a` up to `b`, if any.
    #[must_use]
    pub fn ancestor_distance(&self, a: TypeId, b: TypeId) -> Option<u32> {
        if a == b {
            return Some(0);
        }
        // Breadth-first over direct supers; ancestor sets are small.
        let mut frontier = vec![a];
        let mut seen = vec![a];
        let mut depth = 0u32;
        while !frontier.is_empty() {
            depth += 1;
            let mut next = Vec::new();
            for id in frontier {
                let Some(desc) = self.get(id) else { continue };
                for s in &desc.supers {
                    if *s == b {
                        return Some(depth);
                    }
                    if !seen.contains(s) {
                        seen.push(*s);
                        next.push(*s);
                    }
                }
            }
            frontier = next;
        }
        // Everything non-primitive roots at OBJECT even if no chain is
        // recorded explicitly.
        if b == TypeId::OBJECT && self.is_subtype(a, b) {
            return Some(depth.max(1));
        }
        None
    }
}

fn value_type(id: TypeId, name: &str, flags: TypeFlags) -> TypeDescriptor {
    TypeDescriptor {
        id,
        name: name.to_owned(),
        supers: if flags.contains(TypeFlags::PRIMITIVE) || id == TypeId::OBJECT {
            Vec::new()
        } else {
            vec![TypeId::OBJECT]
        },
        ancestors: if flags.contains(TypeFlags::PRIMITIVE) || id == TypeId::OBJECT {
            Vec::new()
        } else {
            vec![TypeId::OBJECT]
        },
        flags,
        element: None,
        constructors: Vec::new(),
        methods: Vec::new(),
        fields: Vec::new(),
    }
}

fn builtin_descriptors() -> Vec<TypeDescriptor> {
    let prim = TypeFlags::PRIMITIVE | TypeFlags::VALUE;
    let boxed = TypeFlags::VALUE;
    vec![
        value_type(TypeId::VOID, "void", TypeFlags::PRIMITIVE),
        value_type(TypeId::BOOL, "boolean", prim),
        value_type(TypeId::I8, "byte", prim),
        value_type(TypeId::I16, "short", prim),
        value_type(TypeId::I32, "int", prim),
        value_type(TypeId::I64, "long", prim),
        value_type(TypeId::F32, "float", prim),
        value_type(TypeId::F64, "double", prim),
        value_type(TypeId::STRING, "String", TypeFlags::VALUE),
        value_type(TypeId::BYTES, "byte[]", TypeFlags::VALUE | TypeFlags::ARRAY),
        value_type(TypeId::OBJECT, "Object", TypeFlags::empty()),
        value_type(TypeId::BOOL_BOX, "Boolean", boxed),
        value_type(TypeId::I8_BOX, "Byte", boxed),
        value_type(TypeId::I16_BOX, "Short", boxed),
        value_type(TypeId::I32_BOX, "Integer", boxed),
        value_type(TypeId::I64_BOX, "Long", boxed),
        value_type(TypeId::F32_BOX, "Float", boxed),
        value_type(TypeId::F64_BOX, "Double", boxed),
        value_type(
            TypeId::SEQUENCE,
            "Sequence",
            TypeFlags::INTERFACE | TypeFlags::SEQUENCE,
        ),
        value_type(
            TypeId::MAPPING,
            "Mapping",
            TypeFlags::INTERFACE | TypeFlags::MAPPING,
        ),
    ]
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn sample_descriptor() -> TypeDescriptor {
        TypeDescriptor {
            id: TypeId(40),
            name: "demo.Widget".to_owned(),
            supers: vec![TypeId::OBJECT],
            ancestors: vec![TypeId::OBJECT],
            flags: TypeFlags::empty(),
            element: None,
            constructors: vec![MethodDescriptor {
                name: "demo.Widget".to_owned(),
                params: vec![TypeId::I32],
                ret: TypeId(40),
                is_static: false,
                variadic: false,
                slot: 0,
                rank: 0,
            }],
            methods: vec![MethodDescriptor {
                name: "resize".to_owned(),
                params: vec![TypeId::I32, TypeId::I32],
                ret: TypeId::VOID,
                is_static: false,
                variadic: false,
                slot: 0,
                rank: 0,
            }],
            fields: vec![FieldDescriptor {
                name: "label".to_owned(),
                type_id: TypeId::STRING,
                slot: 0,
            }],
        }
    }

    #[rstest]
    fn descriptor_round_trips() {
        let desc = sample_descriptor();
        let bytes = desc.to_bytes();
        let mut cur = Cursor::new(&bytes);
        let decoded = TypeDescriptor::decode(&mut cur).unwrap();
        assert_eq!(decoded, desc);
        assert_eq!(cur.remaining(), 0);
    }

    #[rstest]
    fn interning_is_idempotent_but_conflicts_fail() {
        let reg = TypeRegistry::with_builtins();
        let desc = Arc::new(sample_descriptor());
        reg.intern(Arc::clone(&desc)).unwrap();
        reg.intern(Arc::clone(&desc)).unwrap();
        let mut other = sample_descriptor();
        other.name = "demo.Other".to_owned();
        assert_eq!(
            reg.intern(Arc::new(other)),
            Err(TypeError::DuplicateId(TypeId(40)))
        );
    }

    #[rstest]
    fn subtype_and_distance() {
        let reg = TypeRegistry::with_builtins();
        let base = TypeDescriptor {
            id: TypeId(50),
            name: "demo.Base".to_owned(),
            supers: vec![TypeId::OBJECT],
            ancestors: vec![TypeId::OBJECT],
            ..sample_descriptor()
        };
        let derived = TypeDescriptor {
            id: TypeId(51),
            name: "demo.Derived".to_owned(),
            supers: vec![TypeId(50)],
            ancestors: vec![TypeId(50), TypeId::OBJECT],
            ..sample_descriptor()
        };
        reg.intern(Arc::new(base)).unwrap();
        reg.intern(Arc::new(derived)).unwrap();
        assert!(reg.is_subtype(TypeId(51), TypeId(50)));
        assert!(reg.is_subtype(TypeId(51), TypeId::OBJECT));
        assert!(!reg.is_subtype(TypeId(50), TypeId(51)));
        assert_eq!(reg.ancestor_distance(TypeId(51), TypeId(50)), Some(1));
        assert_eq!(reg.ancestor_distance(TypeId(51), TypeId::OBJECT), Some(2));
        assert_eq!(reg.ancestor_distance(TypeId(50), TypeId(51)), None);
    }

    #[rstest]
    #[case(0, true)]
    #[case(1, true)]
    #[case(3, true)]
    #[case(10, true)]
    fn variadic_arity(#[case] n: usize, #[case] ok: bool) {
        let m = MethodDescriptor {
            name: "log".to_owned(),
            params: vec![TypeId::STRING, TypeId::OBJECT],
            ret: TypeId::VOID,
            is_static: false,
            variadic: true,
            slot: 0,
            rank: 0,
        };
        assert_eq!(m.accepts_arity(n.max(1)), ok);
    }
}
