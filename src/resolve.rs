//! Runtime overload resolution.
//!
//! Given a member name, a receiver class, and the inferred shapes of the
//! argument tuple, the resolver narrows the overload set to the candidates
//! every argument is compatible with, then restricts the precomputed
//! specificity order to those candidates and demands a unique minimum.
//! Numeric arguments of unspecified precision have already been fitted to
//! their smallest representable type by the coercer, so their shape is an
//! exact primitive and widening distances fall out of the ladder.

use thiserror::Error;

use crate::{
    codec::{ElementKind, Value},
    error::{ErrorKind, ErrorPayload},
    types::{
        MethodDescriptor, OverloadSet, TypeFlags, TypeId, TypeRegistry, numeric_ladder_pos,
    },
};

/// Rank charged for a by-value container conversion; high so any
/// non-converting overload wins outright.
pub const COLLECTION_CONVERSION_PENALTY: u32 = 1000;

/// Arity marker for a callback that is an object exposing named methods
/// rather than a bare callable.
pub const MULTI_METHOD_ARITY: u8 = u8::MAX;

/// The inferred shape of one argument, as seen by the resolver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgShape {
    /// The null value.
    Null,
    /// A primitive scalar of the given type.
    Prim(TypeId),
    /// A reference to an exported object of the given type.
    Ref(TypeId),
    /// A string value.
    Str,
    /// A raw byte blob.
    Bytes,
    /// A homogeneous numeric array (inline or shared-memory).
    Array(ElementKind),
    /// A by-value sequence.
    List,
    /// A by-value mapping.
    Map,
    /// An exported callable; `MULTI_METHOD_ARITY` marks an object-shaped
    /// callback.
    Callable {
        /// Positional parameter count of the callable.
        arity: u8,
    },
    /// An argument the session cannot accept (callbacks in
    /// single-worker mode); matches no parameter.
    Unsupported,
}

impl ArgShape {
    /// Infer the shape of a wire value.
    #[must_use]
    pub fn of(value: &Value) -> Self {
        match value {
            Value::Null | Value::Exception(_) => Self::Null,
            Value::Bool(_) => Self::Prim(TypeId::BOOL),
            Value::I8(_) => Self::Prim(TypeId::I8),
            Value::I16(_) => Self::Prim(TypeId::I16),
            Value::I32(_) => Self::Prim(TypeId::I32),
            Value::I64(_) => Self::Prim(TypeId::I64),
            Value::F32(_) => Self::Prim(TypeId::F32),
            Value::F64(_) => Self::Prim(TypeId::F64),
            Value::Str(_) => Self::Str,
            Value::Bytes(_) => Self::Bytes,
            Value::Handle { type_id, .. } => Self::Ref(*type_id),
            Value::Array { kind, .. } | Value::ShmArray { kind, .. } => Self::Array(*kind),
            Value::List(_) => Self::List,
            Value::Map(_) => Self::Map,
            Value::Lambda { arity, .. } => Self::Callable { arity: *arity },
        }
    }
}

/// Resolution failures, before they are flattened onto the wire.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResolveError {
    /// No overload both matched the arity and accepted every argument.
    #[error("no overload of {name} accepts the supplied arguments")]
    NoMethod {
        /// Member name that failed to resolve.
        name: String,
    },
    /// More than one minimal candidate remained.
    #[error("ambiguous call to {name}; candidates: {}", candidates.join(", "))]
    Ambiguous {
        /// Member name that failed to resolve.
        name: String,
        /// Rendered signatures of every tied candidate.
        candidates: Vec<String>,
    },
}

impl ResolveError {
    /// Map onto the wire error payload.
    #[must_use]
    pub fn into_payload(self) -> ErrorPayload {
        let kind = match self {
            Self::NoMethod { .. } => ErrorKind::NoSuchMethod,
            Self::Ambiguous { .. } => ErrorKind::AmbiguousCall,
        };
        ErrorPayload::new(kind, self.to_string())
    }
}

fn element_kind_type(kind: ElementKind) -> TypeId {
    match kind {
        ElementKind::Bool => TypeId::BOOL,
        ElementKind::I8 => TypeId::I8,
        ElementKind::I16 => TypeId::I16,
        ElementKind::I32 => TypeId::I32,
        ElementKind::I64 => TypeId::I64,
        ElementKind::F32 => TypeId::F32,
        ElementKind::F64 => TypeId::F64,
    }
}

fn is_primitive(param: TypeId, registry: &TypeRegistry) -> bool {
    registry
        .get(param)
        .is_some_and(|d| d.flags.contains(TypeFlags::PRIMITIVE))
}

/// Compatibility of one argument shape against one declared parameter,
/// as a widening rank; `None` means incompatible.
#[must_use]
pub fn compatibility(shape: ArgShape, param: TypeId, registry: &TypeRegistry) -> Option<u32> {
    match shape {
        ArgShape::Null => (!is_primitive(param, registry)).then_some(0),
        ArgShape::Prim(t) => prim_compat(t, param, registry),
        ArgShape::Ref(t) => ref_compat(t, param, registry),
        ArgShape::Str => ref_compat(TypeId::STRING, param, registry),
        ArgShape::Bytes => ref_compat(TypeId::BYTES, param, registry),
        ArgShape::Array(kind) => array_compat(kind, param, registry),
        ArgShape::List => container_compat(param, TypeFlags::SEQUENCE, registry),
        ArgShape::Map => container_compat(param, TypeFlags::MAPPING, registry),
        ArgShape::Callable { arity } => callable_compat(arity, param, registry),
        ArgShape::Unsupported => None,
    }
}

fn prim_compat(t: TypeId, param: TypeId, registry: &TypeRegistry) -> Option<u32> {
    if t == param {
        return Some(0);
    }
    if let (Some(pa), Some(pb)) = (numeric_ladder_pos(t), numeric_ladder_pos(param)) {
        if pa < pb {
            return Some(u32::from(pb - pa));
        }
        return None;
    }
    // Boxing: the exact boxed pair costs 1; a wider boxed target is not
    // admitted. Reference targets above the box go through the ancestor
    // set (Object costs the box plus the distance).
    let boxed = t.boxed()?;
    if boxed == param {
        return Some(1);
    }
    registry
        .ancestor_distance(boxed, param)
        .map(|d| 1 + d)
}

fn ref_compat(t: TypeId, param: TypeId, registry: &TypeRegistry) -> Option<u32> {
    if t == param {
        return Some(0);
    }
    if let Some(prim) = t.unboxed() {
        // Unboxing an exact pair costs 1.
        if prim == param {
            return Some(1);
        }
    }
    registry.ancestor_distance(t, param)
}

fn array_compat(kind: ElementKind, param: TypeId, registry: &TypeRegistry) -> Option<u32> {
    if kind == ElementKind::I8 && param == TypeId::BYTES {
        return Some(0);
    }
    let desc = registry.get(param)?;
    if desc.flags.contains(TypeFlags::ARRAY) {
        let elem = desc.element?;
        return (elem == element_kind_type(kind)).then_some(0);
    }
    if desc.flags.contains(TypeFlags::SEQUENCE) {
        return Some(COLLECTION_CONVERSION_PENALTY);
    }
    (param == TypeId::OBJECT).then_some(1)
}

fn container_compat(param: TypeId, shape: TypeFlags, registry: &TypeRegistry) -> Option<u32> {
    if param == TypeId::OBJECT {
        return Some(COLLECTION_CONVERSION_PENALTY);
    }
    let desc = registry.get(param)?;
    (desc.flags.contains(shape) || shape == TypeFlags::SEQUENCE && desc.flags.contains(TypeFlags::ARRAY))
        .then_some(COLLECTION_CONVERSION_PENALTY)
}

fn callable_compat(arity: u8, param: TypeId, registry: &TypeRegistry) -> Option<u32> {
    let desc = registry.get(param)?;
    if !desc.flags.contains(TypeFlags::INTERFACE) {
        return None;
    }
    if arity == MULTI_METHOD_ARITY {
        return Some(1);
    }
    // A bare callable satisfies a single-method interface of matching
    // arity only.
    let mut names: Vec<&str> = desc.methods.iter().map(|m| m.name.as_str()).collect();
    names.sort_unstable();
    names.dedup();
    if names.len() != 1 {
        return None;
    }
    desc.methods
        .iter()
        .any(|m| m.accepts_arity(usize::from(arity)))
        .then_some(1)
}

fn candidate_compatible(
    method: &MethodDescriptor,
    shapes: &[ArgShape],
    registry: &TypeRegistry,
) -> bool {
    if !method.accepts_arity(shapes.len()) {
        return false;
    }
    let fixed = if method.variadic {
        method.params.len().saturating_sub(1)
    } else {
        method.params.len()
    };
    for (pos, shape) in shapes.iter().enumerate() {
        let param = if pos < fixed {
            method.params[pos]
        } else {
            // Trailing variadic arguments compare against the element type
            // of the final array parameter.
            let last = *method.params.last().unwrap_or(&TypeId::OBJECT);
            registry
                .get(last)
                .and_then(|d| d.element)
                .unwrap_or(TypeId::OBJECT)
        };
        if compatibility(*shape, param, registry).is_none() {
            return false;
        }
    }
    true
}

/// Select the unique most-specific overload for the argument shapes.
///
/// `class_receiver` restricts the candidate set to static members, as when
/// the receiver is the class object itself. Constructor resolution passes
/// the constructor overload set and `class_receiver = false`.
///
/// # Errors
/// Returns [`ResolveError::NoMethod`] when no candidate survives and
/// [`ResolveError::Ambiguous`] when several minimal candidates remain
/// mutually incomparable.
pub fn resolve<'a>(
    set: &'a OverloadSet,
    shapes: &[ArgShape],
    class_receiver: bool,
    registry: &TypeRegistry,
) -> Result<&'a MethodDescriptor, ResolveError> {
    let candidates: Vec<usize> = set
        .members
        .iter()
        .enumerate()
        .filter(|(_, m)| !class_receiver || m.is_static)
        .filter(|(_, m)| candidate_compatible(m, shapes, registry))
        .map(|(i, _)| i)
        .collect();
    let minimal = set.minimal_among(&candidates);
    match minimal.as_slice() {
        [] => Err(ResolveError::NoMethod {
            name: set.name.clone(),
        }),
        [one] => Ok(&set.members[*one]),
        many => Err(ResolveError::Ambiguous {
            name: set.name.clone(),
            candidates: many
                .iter()
                .map(|&i| set.members[i].signature(registry))
                .collect(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::types::OverloadSet;

    fn m(params: &[TypeId]) -> MethodDescriptor {
        MethodDescriptor {
            name: "f".to_owned(),
            params: params.to_vec(),
            ret: TypeId::VOID,
            is_static: false,
            variadic: false,
            slot: 0,
            rank: 0,
        }
    }

    fn int_double_set(registry: &TypeRegistry) -> OverloadSet {
        OverloadSet::build(
            "f",
            vec![
                m(&[TypeId::I32, TypeId::F64]),
                m(&[TypeId::F64, TypeId::I32]),
            ],
            registry,
        )
    }

    #[rstest]
    fn untyped_small_ints_are_ambiguous() {
        let reg = TypeRegistry::with_builtins();
        let set = int_double_set(&reg);
        // Untyped 1 fits to i8; both overloads widen it, neither is more
        // specific than the other.
        let shapes = [ArgShape::Prim(TypeId::I8), ArgShape::Prim(TypeId::I8)];
        let err = resolve(&set, &shapes, false, &reg).unwrap_err();
        match err {
            ResolveError::Ambiguous { candidates, .. } => {
                assert_eq!(candidates.len(), 2);
                assert!(candidates.iter().any(|c| c.contains("int,double")));
                assert!(candidates.iter().any(|c| c.contains("double,int")));
            }
            other => panic!("expected ambiguity, got {other:?}"),
        }
    }

    #[rstest]
    fn typed_arguments_disambiguate() {
        let reg = TypeRegistry::with_builtins();
        let set = int_double_set(&reg);
        let shapes = [ArgShape::Prim(TypeId::I32), ArgShape::Prim(TypeId::F64)];
        let chosen = resolve(&set, &shapes, false, &reg).unwrap();
        assert_eq!(chosen.params, vec![TypeId::I32, TypeId::F64]);
    }

    #[rstest]
    fn no_candidate_is_no_method() {
        let reg = TypeRegistry::with_builtins();
        let set = int_double_set(&reg);
        let shapes = [ArgShape::Str, ArgShape::Str];
        assert_eq!(
            resolve(&set, &shapes, false, &reg).unwrap_err(),
            ResolveError::NoMethod {
                name: "f".to_owned()
            }
        );
    }

    #[rstest]
    fn narrower_overload_wins_for_exact_match() {
        let reg = TypeRegistry::with_builtins();
        let set = OverloadSet::build(
            "f",
            vec![m(&[TypeId::I64]), m(&[TypeId::I16])],
            &reg,
        );
        let chosen = resolve(&set, &[ArgShape::Prim(TypeId::I8)], false, &reg).unwrap();
        assert_eq!(chosen.params, vec![TypeId::I16]);
    }

    #[rstest]
    fn null_matches_references_not_primitives() {
        let reg = TypeRegistry::with_builtins();
        assert_eq!(compatibility(ArgShape::Null, TypeId::STRING, &reg), Some(0));
        assert_eq!(compatibility(ArgShape::Null, TypeId::I32, &reg), None);
    }

    #[rstest]
    fn boxing_costs_one() {
        let reg = TypeRegistry::with_builtins();
        assert_eq!(
            compatibility(ArgShape::Prim(TypeId::I32), TypeId::I32_BOX, &reg),
            Some(1)
        );
        assert_eq!(
            compatibility(ArgShape::Ref(TypeId::I32_BOX), TypeId::I32, &reg),
            Some(1)
        );
    }

    #[rstest]
    fn widening_rank_is_ladder_gap() {
        let reg = TypeRegistry::with_builtins();
        assert_eq!(
            compatibility(ArgShape::Prim(TypeId::I8), TypeId::I64, &reg),
            Some(3)
        );
        assert_eq!(
            compatibility(ArgShape::Prim(TypeId::I64), TypeId::I8, &reg),
            None,
            "narrowing is never implicit"
        );
    }

    #[rstest]
    fn static_filter_applies_for_class_receivers() {
        let reg = TypeRegistry::with_builtins();
        let mut stat = m(&[TypeId::I32]);
        stat.is_static = true;
        let inst = m(&[TypeId::I32]);
        let set = OverloadSet::build("f", vec![inst, stat], &reg);
        let chosen = resolve(&set, &[ArgShape::Prim(TypeId::I32)], true, &reg).unwrap();
        assert!(chosen.is_static);
    }
}
