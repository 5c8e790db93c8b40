//! The host reflection capability and its native implementation.
//!
//! The dispatch engine is deliberately ignorant of how classes come to
//! exist: everything it needs is behind [`HostRuntime`]: enumerate
//! classes and members, invoke a method, read or write a field, construct
//! an instance, and wrap a remote callback in a dynamic proxy. [`Registry`]
//! is the crate's builder-based implementation of that capability for
//! native Rust objects; embedders describe each class once and the
//! registry derives descriptors, overload sets, and specificity orders
//! from the declarations.

mod builder;

use std::{any::Any, collections::HashMap, fmt, sync::Arc, sync::RwLock};

use async_trait::async_trait;
use futures_util::future::BoxFuture;

pub use builder::{BuildError, ClassBuilder, MethodSpec, RegistryBuilder};

use crate::{
    codec::ElementKind,
    error::{ErrorKind, ErrorPayload},
    types::{OverloadSet, TypeDescriptor, TypeId, TypeRegistry},
};

/// A live native object paired with its bridge type.
#[derive(Clone)]
pub struct ObjectInstance {
    /// Bridge class of the object.
    pub type_id: TypeId,
    /// The object itself; methods downcast to their concrete type.
    pub inner: Arc<dyn Any + Send + Sync>,
}

impl ObjectInstance {
    /// Wrap a concrete value as an instance of `type_id`.
    #[must_use]
    pub fn new<T: Any + Send + Sync>(type_id: TypeId, value: T) -> Self {
        Self {
            type_id,
            inner: Arc::new(value),
        }
    }

    /// Downcast to the concrete type.
    #[must_use]
    pub fn downcast<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.inner.downcast_ref::<T>()
    }
}

impl fmt::Debug for ObjectInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectInstance")
            .field("type_id", &self.type_id)
            .finish_non_exhaustive()
    }
}

/// A value in the host runtime's own terms, after inbound coercion.
#[derive(Debug, Clone)]
pub enum NativeValue {
    /// Absent value.
    Null,
    /// Boolean.
    Bool(bool),
    /// Signed 8-bit integer.
    I8(i8),
    /// Signed 16-bit integer.
    I16(i16),
    /// Signed 32-bit integer.
    I32(i32),
    /// Signed 64-bit integer.
    I64(i64),
    /// IEEE-754 single.
    F32(f32),
    /// IEEE-754 double.
    F64(f64),
    /// String value.
    Str(String),
    /// Raw bytes.
    Bytes(Vec<u8>),
    /// Packed homogeneous numeric array.
    Array {
        /// Element kind of the packed data.
        kind: ElementKind,
        /// Big-endian element bytes.
        data: Vec<u8>,
    },
    /// Detached sequence copy.
    List(Vec<NativeValue>),
    /// Detached mapping copy.
    Map(Vec<(NativeValue, NativeValue)>),
    /// A live object (local, or a proxy over a remote callback).
    Object(ObjectInstance),
    /// A remote callable.
    Callback(CallbackRef),
}

impl NativeValue {
    /// Integer view, widening any integer width.
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::I8(v) => Some(i64::from(*v)),
            Self::I16(v) => Some(i64::from(*v)),
            Self::I32(v) => Some(i64::from(*v)),
            Self::I64(v) => Some(*v),
            _ => None,
        }
    }

    /// Double view, widening any numeric value.
    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::F32(v) => Some(f64::from(*v)),
            Self::F64(v) => Some(*v),
            #[allow(clippy::cast_precision_loss, reason = "widening view is lossy by contract")]
            other => other.as_i64().map(|n| n as f64),
        }
    }

    /// String view.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Object view.
    #[must_use]
    pub fn as_object(&self) -> Option<&ObjectInstance> {
        match self {
            Self::Object(obj) => Some(obj),
            _ => None,
        }
    }
}

/// Outcome of a native invocation.
pub type MethodResult = Result<NativeValue, ErrorPayload>;

/// Boxed future returned by native method bodies.
pub type MethodFuture = BoxFuture<'static, MethodResult>;

/// A native method body: receiver (absent for statics and constructors)
/// plus coerced arguments.
pub type MethodFn =
    Arc<dyn Fn(Option<ObjectInstance>, Vec<NativeValue>) -> MethodFuture + Send + Sync>;

/// Field reader.
pub type FieldGet = Arc<dyn Fn(&ObjectInstance) -> MethodResult + Send + Sync>;

/// Field writer.
pub type FieldSet =
    Arc<dyn Fn(&ObjectInstance, NativeValue) -> Result<(), ErrorPayload> + Send + Sync>;

/// By-value snapshot hook for GET_VALUE.
pub type SnapshotFn = Arc<dyn Fn(&ObjectInstance) -> Option<NativeValue> + Send + Sync>;

/// Wrap a synchronous closure as a [`MethodFn`].
pub fn sync_method<F>(f: F) -> MethodFn
where
    F: Fn(Option<ObjectInstance>, Vec<NativeValue>) -> MethodResult + Send + Sync + 'static,
{
    Arc::new(move |recv, args| {
        let result = f(recv, args);
        Box::pin(futures_util::future::ready(result))
    })
}

/// Shorthand for the `ErrorPayload` a native body raises on bad input.
#[must_use]
pub fn invocation_error(message: impl Into<String>) -> ErrorPayload {
    ErrorPayload::new(ErrorKind::RemoteException, message)
}

/// Transport-side hook that delivers a callback invocation to the peer
/// that owns the callable.
#[async_trait]
pub trait CallbackInvoker: Send + Sync {
    /// Invoke callable `lambda` with `args`; `method` names the interface
    /// method for object-shaped callbacks and is empty for bare callables.
    async fn invoke(
        &self,
        lambda: u64,
        method: &str,
        args: Vec<NativeValue>,
    ) -> MethodResult;
}

/// A remote callable: the peer-side handle plus the channel back to it.
#[derive(Clone)]
pub struct CallbackRef {
    /// Callback-table id on the owning peer.
    pub handle: u64,
    /// Positional arity, or [`crate::resolve::MULTI_METHOD_ARITY`].
    pub arity: u8,
    invoker: Arc<dyn CallbackInvoker>,
}

impl CallbackRef {
    /// Pair a callback handle with its transport.
    #[must_use]
    pub fn new(handle: u64, arity: u8, invoker: Arc<dyn CallbackInvoker>) -> Self {
        Self {
            handle,
            arity,
            invoker,
        }
    }

    /// Invoke the remote callable.
    ///
    /// # Errors
    /// Propagates the remote failure payload; a failure raised inside the
    /// callable crosses back as `remote_exception` with the root cause.
    pub async fn call(&self, method: &str, args: Vec<NativeValue>) -> MethodResult {
        self.invoker.invoke(self.handle, method, args).await
    }
}

impl fmt::Debug for CallbackRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackRef")
            .field("handle", &self.handle)
            .field("arity", &self.arity)
            .finish_non_exhaustive()
    }
}

/// A dynamic proxy: an object of an interface type whose method bodies all
/// route to one remote callback.
#[derive(Debug, Clone)]
pub struct ProxyObject {
    /// Interface the proxy implements.
    pub interface: TypeId,
    /// The remote callable behind every method.
    pub callback: CallbackRef,
}

/// The external reflection capability the dispatch engine consumes.
#[async_trait]
pub trait HostRuntime: Send + Sync {
    /// The session type registry (descriptors interned here are shipped
    /// to the peer on demand).
    fn types(&self) -> Arc<TypeRegistry>;

    /// Resolve a class by canonical name.
    fn class_by_name(&self, name: &str) -> Option<Arc<TypeDescriptor>>;

    /// Resolve a descriptor by id.
    fn descriptor(&self, id: TypeId) -> Option<Arc<TypeDescriptor>>;

    /// Look up a published named instance.
    fn named_instance(&self, name: &str) -> Option<ObjectInstance>;

    /// The overload set for `name` on `class`, inherited members included.
    fn method_set(&self, class: TypeId, name: &str) -> Option<Arc<OverloadSet>>;

    /// The constructor overload set of `class`.
    fn constructor_set(&self, class: TypeId) -> Option<Arc<OverloadSet>>;

    /// Invoke the method at `slot` on `class`.
    async fn invoke(
        &self,
        receiver: Option<ObjectInstance>,
        class: TypeId,
        slot: u32,
        args: Vec<NativeValue>,
    ) -> MethodResult;

    /// Invoke the constructor at `slot` on `class`.
    async fn construct(
        &self,
        class: TypeId,
        slot: u32,
        args: Vec<NativeValue>,
    ) -> MethodResult;

    /// Read the field at `slot`.
    fn get_field(&self, obj: &ObjectInstance, slot: u32) -> MethodResult;

    /// Write the field at `slot`.
    ///
    /// # Errors
    /// Returns the failure payload for unknown or read-only slots.
    fn set_field(
        &self,
        obj: &ObjectInstance,
        slot: u32,
        value: NativeValue,
    ) -> Result<(), ErrorPayload>;

    /// Build a dynamic proxy implementing `interface` over a remote
    /// callback.
    fn make_proxy(&self, interface: TypeId, callback: CallbackRef) -> ObjectInstance;

    /// By-value snapshot of an object, where one is representable.
    fn snapshot(&self, obj: &ObjectInstance) -> Option<NativeValue>;
}

/// One registered class: its descriptor plus the callable member bodies.
pub struct ClassDef {
    /// Interned descriptor.
    pub descriptor: Arc<TypeDescriptor>,
    pub(crate) methods: Vec<MethodFn>,
    pub(crate) constructors: Vec<MethodFn>,
    pub(crate) getters: Vec<FieldGet>,
    pub(crate) setters: Vec<Option<FieldSet>>,
    pub(crate) method_sets: HashMap<String, Arc<OverloadSet>>,
    pub(crate) constructor_set: Arc<OverloadSet>,
    pub(crate) snapshot: Option<SnapshotFn>,
}

impl fmt::Debug for ClassDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassDef")
            .field("descriptor", &self.descriptor)
            .finish_non_exhaustive()
    }
}

/// Builder-based [`HostRuntime`] over native Rust objects.
#[derive(Debug)]
pub struct Registry {
    types: Arc<TypeRegistry>,
    classes: HashMap<TypeId, Arc<ClassDef>>,
    instances: RwLock<HashMap<String, ObjectInstance>>,
}

impl Registry {
    /// Start describing classes.
    #[must_use]
    pub fn builder() -> RegistryBuilder { RegistryBuilder::new() }

    pub(crate) fn from_parts(
        types: Arc<TypeRegistry>,
        classes: HashMap<TypeId, Arc<ClassDef>>,
    ) -> Self {
        Self {
            types,
            classes,
            instances: RwLock::new(HashMap::new()),
        }
    }

    /// Publish an object under a name for GET_OBJECT_INSTANCE.
    pub fn publish(&self, name: impl Into<String>, obj: ObjectInstance) {
        self.instances
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(name.into(), obj);
    }

    /// The class definition for an id.
    #[must_use]
    pub fn class(&self, id: TypeId) -> Option<Arc<ClassDef>> {
        self.classes.get(&id).cloned()
    }

    fn proxy_dispatch(
        proxy: &ProxyObject,
        method: String,
        args: Vec<NativeValue>,
    ) -> MethodFuture {
        let callback = proxy.callback.clone();
        Box::pin(async move { callback.call(&method, args).await })
    }
}

#[async_trait]
impl HostRuntime for Registry {
    fn types(&self) -> Arc<TypeRegistry> { Arc::clone(&self.types) }

    fn class_by_name(&self, name: &str) -> Option<Arc<TypeDescriptor>> {
        let id = self.types.id_of(name)?;
        self.types.get(id)
    }

    fn descriptor(&self, id: TypeId) -> Option<Arc<TypeDescriptor>> { self.types.get(id) }

    fn named_instance(&self, name: &str) -> Option<ObjectInstance> {
        self.instances
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    fn method_set(&self, class: TypeId, name: &str) -> Option<Arc<OverloadSet>> {
        self.classes.get(&class)?.method_sets.get(name).cloned()
    }

    fn constructor_set(&self, class: TypeId) -> Option<Arc<OverloadSet>> {
        self.classes
            .get(&class)
            .map(|c| Arc::clone(&c.constructor_set))
    }

    async fn invoke(
        &self,
        receiver: Option<ObjectInstance>,
        class: TypeId,
        slot: u32,
        args: Vec<NativeValue>,
    ) -> MethodResult {
        // Proxy objects have no native bodies: every method routes to the
        // remote callback, keyed by method name.
        if let Some(proxy) = receiver
            .as_ref()
            .and_then(|r| r.downcast::<ProxyObject>().cloned())
        {
            let def = self
                .classes
                .get(&proxy.interface)
                .ok_or_else(|| invocation_error("proxy interface not registered"))?;
            let name = def
                .descriptor
                .methods
                .iter()
                .find(|m| m.slot == slot)
                .map(|m| m.name.clone())
                .ok_or_else(|| invocation_error("proxy method slot out of range"))?;
            return Self::proxy_dispatch(&proxy, name, args).await;
        }
        let def = self
            .classes
            .get(&class)
            .ok_or_else(|| invocation_error(format!("class {class} not registered")))?;
        let body = def
            .methods
            .get(slot as usize)
            .ok_or_else(|| invocation_error("method slot out of range"))?;
        body(receiver, args).await
    }

    async fn construct(
        &self,
        class: TypeId,
        slot: u32,
        args: Vec<NativeValue>,
    ) -> MethodResult {
        let def = self
            .classes
            .get(&class)
            .ok_or_else(|| invocation_error(format!("class {class} not registered")))?;
        let body = def
            .constructors
            .get(slot as usize)
            .ok_or_else(|| invocation_error("constructor slot out of range"))?;
        body(None, args).await
    }

    fn get_field(&self, obj: &ObjectInstance, slot: u32) -> MethodResult {
        let def = self
            .classes
            .get(&obj.type_id)
            .ok_or_else(|| invocation_error("field on unregistered class"))?;
        let getter = def
            .getters
            .get(slot as usize)
            .ok_or_else(|| invocation_error("field slot out of range"))?;
        getter(obj)
    }

    fn set_field(
        &self,
        obj: &ObjectInstance,
        slot: u32,
        value: NativeValue,
    ) -> Result<(), ErrorPayload> {
        let def = self
            .classes
            .get(&obj.type_id)
            .ok_or_else(|| invocation_error("field on unregistered class"))?;
        let setter = def
            .setters
            .get(slot as usize)
            .ok_or_else(|| invocation_error("field slot out of range"))?;
        let setter = setter
            .as_ref()
            .ok_or_else(|| invocation_error("field is read-only"))?;
        setter(obj, value)
    }

    fn make_proxy(&self, interface: TypeId, callback: CallbackRef) -> ObjectInstance {
        ObjectInstance::new(interface, ProxyObject { interface, callback })
    }

    fn snapshot(&self, obj: &ObjectInstance) -> Option<NativeValue> {
        let def = self.classes.get(&obj.type_id)?;
        def.snapshot.as_ref().and_then(|f| f(obj))
    }
}
