//! Relative-specificity ordering over overload sets.
//!
//! For each overloaded name, a partial order is computed once, at descriptor
//! construction, over the static declared signatures: `M1` precedes `M2`
//! when every parameter of `M1` is at least as specific as the matching
//! parameter of `M2` and at least one is strictly stricter. The resolver
//! later restricts this order to the argument-compatible candidates and
//! demands a unique minimum.

use std::collections::HashMap;

use super::{MethodDescriptor, TypeId, TypeRegistry};

/// Position of a primitive numeric id on the widening ladder
/// byte → short → int → long → float → double.
#[must_use]
pub const fn numeric_ladder_pos(id: TypeId) -> Option<u8> {
    Some(match id {
        TypeId::I8 => 0,
        TypeId::I16 => 1,
        TypeId::I32 => 2,
        TypeId::I64 => 3,
        TypeId::F32 => 4,
        TypeId::F64 => 5,
        _ => return None,
    })
}

/// Whether declared parameter type `a` is at least as specific as `b`.
///
/// Exact match, a narrower primitive on the numeric ladder, and a subtype
/// via the ancestor set all qualify.
fn param_at_least_as_specific(a: TypeId, b: TypeId, registry: &TypeRegistry) -> bool {
    if a == b {
        return true;
    }
    if let (Some(pa), Some(pb)) = (numeric_ladder_pos(a), numeric_ladder_pos(b)) {
        return pa <= pb;
    }
    registry.is_subtype(a, b)
}

/// Whether `a`'s signature is strictly more specific than `b`'s.
#[must_use]
pub fn more_specific(
    a: &MethodDescriptor,
    b: &MethodDescriptor,
    registry: &TypeRegistry,
) -> bool {
    if a.params.len() != b.params.len() || a.variadic != b.variadic {
        return false;
    }
    let mut strict = false;
    for (pa, pb) in a.params.iter().zip(&b.params) {
        if !param_at_least_as_specific(*pa, *pb, registry) {
            return false;
        }
        if !param_at_least_as_specific(*pb, *pa, registry) {
            strict = true;
        }
    }
    strict
}

/// All overloads of one name on one class, with the precomputed order.
#[derive(Debug, Clone)]
pub struct OverloadSet {
    /// Shared member name.
    pub name: String,
    /// The member signatures, indexed as the order edges reference them.
    pub members: Vec<MethodDescriptor>,
    /// Edges `(i, j)` meaning member `i` is strictly more specific than
    /// member `j`.
    pub edges: Vec<(usize, usize)>,
}

impl OverloadSet {
    /// Build the set and compute the partial order and topological ranks.
    ///
    /// The `rank` field of each returned member is its position in a
    /// topological enumeration (more specific first); members tied in the
    /// partial order keep their declaration order.
    #[must_use]
    pub fn build(name: &str, mut members: Vec<MethodDescriptor>, registry: &TypeRegistry) -> Self {
        let mut edges = Vec::new();
        for i in 0..members.len() {
            for j in 0..members.len() {
                if i != j && more_specific(&members[i], &members[j], registry) {
                    edges.push((i, j));
                }
            }
        }
        // Kahn enumeration: repeatedly emit members with no more-specific
        // predecessor left.
        let mut remaining: Vec<usize> = (0..members.len()).collect();
        let mut rank = 0u32;
        let mut ranks: HashMap<usize, u32> = HashMap::new();
        while !remaining.is_empty() {
            let next = remaining
                .iter()
                .position(|&m| !edges.iter().any(|&(i, j)| j == m && remaining.contains(&i)))
                .unwrap_or(0);
            let member = remaining.remove(next);
            ranks.insert(member, rank);
            rank += 1;
        }
        for (idx, member) in members.iter_mut().enumerate() {
            member.rank = ranks.get(&idx).copied().unwrap_or(0);
        }
        Self {
            name: name.to_owned(),
            members,
            edges,
        }
    }

    /// Whether member `i` is strictly more specific than member `j`.
    #[must_use]
    pub fn precedes(&self, i: usize, j: usize) -> bool {
        self.edges.contains(&(i, j))
    }

    /// Restrict to `candidates` and return the minimal ones: candidates
    /// with no strictly-more-specific candidate present.
    #[must_use]
    pub fn minimal_among(&self, candidates: &[usize]) -> Vec<usize> {
        candidates
            .iter()
            .copied()
            .filter(|&j| !candidates.iter().any(|&i| i != j && self.precedes(i, j)))
            .collect()
    }
}
