//! Declarative construction of the native class registry.
//!
//! Classes are declared up front (which fixes their type ids, so mutually
//! referential signatures can be written naturally), then fleshed out with
//! constructors, methods, and fields. `build` derives the transitive
//! ancestor sets, merges inherited members into each descriptor, computes
//! the specificity order of every overload set, and interns the finished
//! descriptors into the session type registry.

use std::{collections::HashMap, sync::Arc};

use thiserror::Error;

use super::{
    ClassDef, FieldGet, FieldSet, MethodFn, Registry, SnapshotFn, invocation_error, sync_method,
};
use crate::types::{
    FieldDescriptor, MethodDescriptor, OverloadSet, TypeDescriptor, TypeFlags, TypeId,
    TypeRegistry,
};

/// Errors raised while finishing a registry.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BuildError {
    /// A class lists a supertype that was never declared.
    #[error("unknown supertype {0} on {1}")]
    UnknownSuper(TypeId, String),
    /// A class was declared but never defined.
    #[error("class {0} declared but not defined")]
    Undefined(String),
    /// The supertype graph contains a cycle.
    #[error("inheritance cycle involving {0}")]
    InheritanceCycle(String),
}

/// One method signature under construction.
#[derive(Debug, Clone)]
pub struct MethodSpec {
    name: String,
    params: Vec<TypeId>,
    ret: TypeId,
    is_static: bool,
    variadic: bool,
}

impl MethodSpec {
    /// Instance method signature.
    #[must_use]
    pub fn new(name: &str, params: &[TypeId], ret: TypeId) -> Self {
        Self {
            name: name.to_owned(),
            params: params.to_vec(),
            ret,
            is_static: false,
            variadic: false,
        }
    }

    /// Mark the method static.
    #[must_use]
    pub const fn static_method(mut self) -> Self {
        self.is_static = true;
        self
    }

    /// Mark the final parameter variadic.
    #[must_use]
    pub const fn variadic(mut self) -> Self {
        self.variadic = true;
        self
    }
}

struct MethodEntry {
    spec: MethodSpec,
    body: MethodFn,
}

struct FieldEntry {
    name: String,
    type_id: TypeId,
    get: FieldGet,
    set: Option<FieldSet>,
}

/// A class under construction.
pub struct ClassBuilder {
    id: TypeId,
    name: String,
    flags: TypeFlags,
    supers: Vec<TypeId>,
    element: Option<TypeId>,
    constructors: Vec<MethodEntry>,
    methods: Vec<MethodEntry>,
    fields: Vec<FieldEntry>,
    snapshot: Option<SnapshotFn>,
}

impl ClassBuilder {
    /// The id fixed at declaration time.
    #[must_use]
    pub const fn id(&self) -> TypeId { self.id }

    /// Add a direct supertype (base class or implemented interface).
    pub fn extends(&mut self, super_id: TypeId) -> &mut Self {
        self.supers.push(super_id);
        self
    }

    /// Add classification flags.
    pub fn flag(&mut self, flags: TypeFlags) -> &mut Self {
        self.flags |= flags;
        self
    }

    /// Add a constructor overload.
    pub fn ctor(&mut self, params: &[TypeId], body: MethodFn) -> &mut Self {
        let spec = MethodSpec::new(&self.name.clone(), params, self.id);
        self.constructors.push(MethodEntry { spec, body });
        self
    }

    /// Add a method overload.
    pub fn method(&mut self, spec: MethodSpec, body: MethodFn) -> &mut Self {
        self.methods.push(MethodEntry { spec, body });
        self
    }

    /// Add a signature with no native body (interface members).
    pub fn abstract_method(&mut self, spec: MethodSpec) -> &mut Self {
        let name = spec.name.clone();
        self.method(
            spec,
            sync_method(move |_, _| {
                Err(invocation_error(format!("abstract method {name} invoked")))
            }),
        )
    }

    /// Add a public field with the given accessors; pass `None` to make
    /// the field read-only.
    pub fn field(
        &mut self,
        name: &str,
        type_id: TypeId,
        get: FieldGet,
        set: Option<FieldSet>,
    ) -> &mut Self {
        self.fields.push(FieldEntry {
            name: name.to_owned(),
            type_id,
            get,
            set,
        });
        self
    }

    /// Install the GET_VALUE snapshot hook.
    pub fn snapshot(&mut self, f: SnapshotFn) -> &mut Self {
        self.snapshot = Some(f);
        self
    }
}

/// Builder for the whole registry.
pub struct RegistryBuilder {
    next_id: u32,
    classes: Vec<ClassBuilder>,
    index: HashMap<TypeId, usize>,
}

impl Default for RegistryBuilder {
    fn default() -> Self { Self::new() }
}

impl RegistryBuilder {
    /// Empty builder; ids start at [`TypeId::FIRST_USER`].
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_id: TypeId::FIRST_USER,
            classes: Vec::new(),
            index: HashMap::new(),
        }
    }

    fn declare_with(&mut self, name: &str, flags: TypeFlags) -> TypeId {
        let id = TypeId(self.next_id);
        self.next_id += 1;
        self.index.insert(id, self.classes.len());
        self.classes.push(ClassBuilder {
            id,
            name: name.to_owned(),
            flags,
            supers: Vec::new(),
            element: None,
            constructors: Vec::new(),
            methods: Vec::new(),
            fields: Vec::new(),
            snapshot: None,
        });
        id
    }

    /// Declare a concrete class and fix its id.
    pub fn declare(&mut self, name: &str) -> TypeId {
        self.declare_with(name, TypeFlags::empty())
    }

    /// Declare an interface and fix its id.
    pub fn declare_interface(&mut self, name: &str) -> TypeId {
        self.declare_with(name, TypeFlags::INTERFACE)
    }

    /// Declare an array class over `element`.
    pub fn declare_array(&mut self, name: &str, element: TypeId) -> TypeId {
        let id = self.declare_with(name, TypeFlags::ARRAY);
        if let Some(&idx) = self.index.get(&id) {
            self.classes[idx].element = Some(element);
        }
        id
    }

    /// The builder for a declared class.
    ///
    /// # Panics
    /// Panics when `id` was not produced by this builder; that is a
    /// programming error at registry construction time, not a runtime
    /// condition.
    #[must_use]
    pub fn class(&mut self, id: TypeId) -> &mut ClassBuilder {
        let idx = *self
            .index
            .get(&id)
            .unwrap_or_else(|| panic!("type {id} was not declared on this builder"));
        &mut self.classes[idx]
    }

    fn ancestors_of(
        &self,
        id: TypeId,
        cache: &mut HashMap<TypeId, Vec<TypeId>>,
        in_progress: &mut Vec<TypeId>,
    ) -> Result<Vec<TypeId>, BuildError> {
        if let Some(found) = cache.get(&id) {
            return Ok(found.clone());
        }
        let Some(&idx) = self.index.get(&id) else {
            // Builtins terminate the walk; Object roots everything.
            return Ok(Vec::new());
        };
        if in_progress.contains(&id) {
            return Err(BuildError::InheritanceCycle(self.classes[idx].name.clone()));
        }
        in_progress.push(id);
        let mut out: Vec<TypeId> = Vec::new();
        for &s in &self.classes[idx].supers {
            if !out.contains(&s) {
                out.push(s);
            }
            for a in self.ancestors_of(s, cache, in_progress)? {
                if !out.contains(&a) {
                    out.push(a);
                }
            }
        }
        if !out.contains(&TypeId::OBJECT) {
            out.push(TypeId::OBJECT);
        }
        in_progress.pop();
        cache.insert(id, out.clone());
        Ok(out)
    }

    fn inherited_members(
        &self,
        id: TypeId,
        cache: &HashMap<TypeId, Vec<TypeId>>,
    ) -> (Vec<(MethodSpec, MethodFn)>, Vec<(String, TypeId, FieldGet, Option<FieldSet>)>) {
        let mut methods = Vec::new();
        let mut fields = Vec::new();
        let Some(ancestors) = cache.get(&id) else {
            return (methods, fields);
        };
        for ancestor in ancestors {
            let Some(&idx) = self.index.get(ancestor) else {
                continue;
            };
            for entry in &self.classes[idx].methods {
                methods.push((entry.spec.clone(), Arc::clone(&entry.body)));
            }
            for field in &self.classes[idx].fields {
                fields.push((
                    field.name.clone(),
                    field.type_id,
                    Arc::clone(&field.get),
                    field.set.clone(),
                ));
            }
        }
        (methods, fields)
    }

    /// Finish: derive descriptors, compute specificity orders, intern
    /// everything, and produce the registry.
    ///
    /// # Errors
    /// Returns a [`BuildError`] for unknown supertypes or inheritance
    /// cycles.
    pub fn build(self) -> Result<Registry, BuildError> {
        // Pass 1: ancestor sets over the declaration graph.
        let mut ancestor_cache = HashMap::new();
        for class in &self.classes {
            for &s in &class.supers {
                if self.index.get(&s).is_none() && s.0 >= TypeId::FIRST_USER {
                    return Err(BuildError::UnknownSuper(s, class.name.clone()));
                }
            }
            let mut in_progress = Vec::new();
            self.ancestors_of(class.id, &mut ancestor_cache, &mut in_progress)?;
        }

        // Pass 2: shell descriptors so specificity can see the type graph.
        let shell = TypeRegistry::with_builtins();
        for class in &self.classes {
            let ancestors = ancestor_cache.get(&class.id).cloned().unwrap_or_default();
            let _ = shell.intern(Arc::new(TypeDescriptor {
                id: class.id,
                name: class.name.clone(),
                supers: class.supers.clone(),
                ancestors,
                flags: class.flags,
                element: class.element,
                constructors: Vec::new(),
                methods: Vec::new(),
                fields: Vec::new(),
            }));
        }

        // Pass 3: merge inherited members, compute overload sets, and
        // assemble the finished classes.
        let types = Arc::new(TypeRegistry::with_builtins());
        let mut classes = HashMap::new();
        for class in &self.classes {
            let (inherited_methods, inherited_fields) =
                self.inherited_members(class.id, &ancestor_cache);

            let mut bodies: Vec<MethodFn> = Vec::new();
            let mut descriptors: Vec<MethodDescriptor> = Vec::new();
            let push_method = |spec: &MethodSpec, body: MethodFn,
                                   descriptors: &mut Vec<MethodDescriptor>,
                                   bodies: &mut Vec<MethodFn>| {
                let slot = u32::try_from(bodies.len()).unwrap_or(u32::MAX);
                descriptors.push(MethodDescriptor {
                    name: spec.name.clone(),
                    params: spec.params.clone(),
                    ret: spec.ret,
                    is_static: spec.is_static,
                    variadic: spec.variadic,
                    slot,
                    rank: 0,
                });
                bodies.push(body);
            };
            for entry in &class.methods {
                push_method(&entry.spec, Arc::clone(&entry.body), &mut descriptors, &mut bodies);
            }
            for (spec, body) in &inherited_methods {
                let shadowed = class.methods.iter().any(|own| {
                    own.spec.name == spec.name && own.spec.params == spec.params
                });
                if !shadowed {
                    push_method(spec, Arc::clone(body), &mut descriptors, &mut bodies);
                }
            }

            // Specificity ranks, per overloaded name.
            let mut method_sets: HashMap<String, Arc<OverloadSet>> = HashMap::new();
            let mut names: Vec<String> = descriptors.iter().map(|m| m.name.clone()).collect();
            names.sort_unstable();
            names.dedup();
            for name in &names {
                let members: Vec<MethodDescriptor> = descriptors
                    .iter()
                    .filter(|m| &m.name == name)
                    .cloned()
                    .collect();
                let set = OverloadSet::build(name, members, &shell);
                for member in &set.members {
                    if let Some(target) =
                        descriptors.iter_mut().find(|m| m.slot == member.slot)
                    {
                        target.rank = member.rank;
                    }
                }
                method_sets.insert(name.clone(), Arc::new(set));
            }

            let mut ctor_bodies: Vec<MethodFn> = Vec::new();
            let mut ctor_descriptors: Vec<MethodDescriptor> = Vec::new();
            for entry in &class.constructors {
                push_method(
                    &entry.spec,
                    Arc::clone(&entry.body),
                    &mut ctor_descriptors,
                    &mut ctor_bodies,
                );
            }
            let constructor_set = Arc::new(OverloadSet::build(
                &class.name,
                ctor_descriptors.clone(),
                &shell,
            ));
            for member in &constructor_set.members {
                if let Some(target) =
                    ctor_descriptors.iter_mut().find(|m| m.slot == member.slot)
                {
                    target.rank = member.rank;
                }
            }

            let mut getters: Vec<FieldGet> = Vec::new();
            let mut setters: Vec<Option<FieldSet>> = Vec::new();
            let mut field_descriptors: Vec<FieldDescriptor> = Vec::new();
            let own_fields = class.fields.iter().map(|f| {
                (f.name.clone(), f.type_id, Arc::clone(&f.get), f.set.clone())
            });
            for (name, type_id, get, set) in own_fields.chain(inherited_fields) {
                let shadowed = field_descriptors.iter().any(|f| f.name == name);
                if shadowed {
                    continue;
                }
                field_descriptors.push(FieldDescriptor {
                    name,
                    type_id,
                    slot: u32::try_from(getters.len()).unwrap_or(u32::MAX),
                });
                getters.push(get);
                setters.push(set);
            }

            let descriptor = Arc::new(TypeDescriptor {
                id: class.id,
                name: class.name.clone(),
                supers: class.supers.clone(),
                ancestors: ancestor_cache.get(&class.id).cloned().unwrap_or_default(),
                flags: class.flags,
                element: class.element,
                constructors: ctor_descriptors,
                methods: descriptors,
                fields: field_descriptors,
            });
            let _ = types.intern(Arc::clone(&descriptor));
            classes.insert(
                class.id,
                Arc::new(ClassDef {
                    descriptor,
                    methods: bodies,
                    constructors: ctor_bodies,
                    getters,
                    setters,
                    method_sets,
                    constructor_set,
                    snapshot: class.snapshot.clone(),
                }),
            );
        }
        Ok(Registry::from_parts(types, classes))
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::runtime::{HostRuntime, NativeValue, ObjectInstance};

    fn build_pair() -> (Registry, TypeId, TypeId) {
        let mut b = RegistryBuilder::new();
        let base = b.declare("demo.Base");
        let derived = b.declare("demo.Derived");
        b.class(base).method(
            MethodSpec::new("greet", &[], TypeId::STRING),
            sync_method(|_, _| Ok(NativeValue::Str("base".to_owned()))),
        );
        b.class(derived).extends(base);
        let reg = b.build().unwrap();
        (reg, base, derived)
    }

    #[rstest]
    fn inherited_methods_appear_on_subclass() {
        let (reg, _, derived) = build_pair();
        let desc = reg.descriptor(derived).unwrap();
        assert!(desc.methods.iter().any(|m| m.name == "greet"));
        assert!(reg.method_set(derived, "greet").is_some());
    }

    #[tokio::test]
    async fn inherited_body_is_invocable() {
        let (reg, _, derived) = build_pair();
        let obj = ObjectInstance::new(derived, ());
        let set = reg.method_set(derived, "greet").unwrap();
        let slot = set.members[0].slot;
        let out = reg.invoke(Some(obj), derived, slot, Vec::new()).await.unwrap();
        assert_eq!(out.as_str(), Some("base"));
    }

    #[rstest]
    fn unknown_super_is_rejected() {
        let mut b = RegistryBuilder::new();
        let lonely = b.declare("demo.Lonely");
        b.class(lonely).extends(TypeId(999));
        assert!(matches!(b.build(), Err(BuildError::UnknownSuper(_, _))));
    }

    #[rstest]
    fn inheritance_cycle_is_rejected() {
        let mut b = RegistryBuilder::new();
        let a = b.declare("demo.A");
        let c = b.declare("demo.C");
        b.class(a).extends(c);
        b.class(c).extends(a);
        assert!(matches!(b.build(), Err(BuildError::InheritanceCycle(_))));
    }

    #[rstest]
    fn overload_ranks_prefer_narrower_signature() {
        let mut b = RegistryBuilder::new();
        let calc = b.declare("demo.Calc");
        b.class(calc)
            .method(
                MethodSpec::new("f", &[TypeId::F64], TypeId::VOID),
                sync_method(|_, _| Ok(NativeValue::Null)),
            )
            .method(
                MethodSpec::new("f", &[TypeId::I32], TypeId::VOID),
                sync_method(|_, _| Ok(NativeValue::Null)),
            );
        let reg = b.build().unwrap();
        let set = reg.method_set(calc, "f").unwrap();
        let narrow = set.members.iter().find(|m| m.params == [TypeId::I32]).unwrap();
        let wide = set.members.iter().find(|m| m.params == [TypeId::F64]).unwrap();
        assert!(narrow.rank < wide.rank);
    }
}
