//! The client side of a bridge session.
//!
//! A [`Client`] connects a transport, negotiates options, and then
//! manipulates remote objects through [`ObjectShim`]s and [`ClassRef`]s as
//! though they were local: calls, field access, constructors, casts,
//! by-value snapshots, named locks, and async calls collected later.
//! Callables passed as arguments are parked in the callback table and
//! invoked re-entrantly when the server's dynamic proxy calls back in.
//!
//! Numerics of unspecified precision are fitted to the smallest
//! representable wire type ([`Arg::Int`] / [`Arg::Float`]); when that
//! loses a width the remote overload resolution needs (mapping keys are
//! the classic case), pin the width with a typed variant such as
//! [`Arg::I64`].

mod callbacks;
mod shim;

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use tracing::debug;

pub use callbacks::{CallbackFn, CallbackTable};
pub use shim::{ClassRef, ObjectShim};

use crate::{
    coerce::{Coercer, ShmConfig, fit_float, fit_int},
    codec::{Cursor, ElementKind, Value},
    dispatch::{Engine, Handler},
    error::{BridgeError, ErrorKind, ErrorPayload},
    handles::ImportTable,
    lock::LockMode,
    logical::LogicalThreads,
    messages::{self, AcquireWait, CallMethod, CallTarget, LockRequest, ProxyCallback},
    protocol::{Frame, MessageKind, OptionFlags, SessionOptions},
    resolve::MULTI_METHOD_ARITY,
    session::{self, SessionError},
    transport::Transport,
    types::{TypeDescriptor, TypeId, TypeRegistry},
};

use shim::ShimInner;

/// A value received from the server, in client terms.
#[derive(Debug, Clone)]
pub enum ClientValue {
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
    /// String, by value.
    Str(String),
    /// Bytes, by value.
    Bytes(Vec<u8>),
    /// Packed homogeneous numeric array, by value.
    Array {
        /// Element kind.
        kind: ElementKind,
        /// Big-endian element bytes.
        data: Vec<u8>,
    },
    /// Detached sequence copy.
    List(Vec<ClientValue>),
    /// Detached mapping copy.
    Map(Vec<(ClientValue, ClientValue)>),
    /// A live remote object.
    Shim(ObjectShim),
    /// A callable owned by this client, returned to it by the server.
    Lambda {
        /// Callback-table handle.
        handle: u64,
        /// Declared arity.
        arity: u8,
    },
}

impl ClientValue {
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

    /// Shim view.
    #[must_use]
    pub fn as_shim(&self) -> Option<&ObjectShim> {
        match self {
            Self::Shim(shim) => Some(shim),
            _ => None,
        }
    }
}

/// An argument to a remote call.
pub enum Arg {
    /// The null value.
    Null,
    /// Boolean.
    Bool(bool),
    /// Integer of unspecified precision; fitted to the smallest
    /// representable wire type.
    Int(i64),
    /// Float of unspecified precision; always travels as a double.
    Float(f64),
    /// Typed scalar pinned to `byte`.
    I8(i8),
    /// Typed scalar pinned to `short`.
    I16(i16),
    /// Typed scalar pinned to `int`.
    I32(i32),
    /// Typed scalar pinned to `long`.
    I64(i64),
    /// Typed scalar pinned to `float`.
    F32(f32),
    /// Typed scalar pinned to `double`.
    F64(f64),
    /// String, by value.
    Str(String),
    /// Bytes, by value.
    Bytes(Vec<u8>),
    /// Sequence, by value.
    List(Vec<Arg>),
    /// Mapping, by value.
    Map(Vec<(Arg, Arg)>),
    /// Packed 64-bit float array; large arrays take the shared-memory
    /// path when the session negotiated it.
    F64Array(Vec<f64>),
    /// Packed 64-bit integer array.
    I64Array(Vec<i64>),
    /// Packed 32-bit integer array.
    I32Array(Vec<i32>),
    /// A remote object going back to its owner.
    Shim(ObjectShim),
    /// An opaque native value, converted by the coercer's hook chain:
    /// a registered per-type formatter first, then the stringification
    /// fallback.
    Custom(Arc<dyn std::any::Any + Send + Sync>),
    /// A callable exported to the server.
    Callback {
        /// Positional arity; use [`Arg::object_callback`] for
        /// interface-shaped callbacks.
        arity: u8,
        /// The closure invoked re-entrantly.
        f: CallbackFn,
    },
}

impl Arg {
    /// A bare callable of fixed arity.
    #[must_use]
    pub fn callback(
        arity: u8,
        f: impl Fn(Vec<ClientValue>) -> Result<ClientValue, String> + Send + Sync + 'static,
    ) -> Self {
        Self::Callback {
            arity,
            f: Arc::new(move |_method, args| {
                let out = f(args);
                Box::pin(async move { out })
            }),
        }
    }

    /// A bare callable whose body is asynchronous; use this when the
    /// callback itself makes nested bridge calls.
    #[must_use]
    pub fn callback_async(
        arity: u8,
        f: impl Fn(Vec<ClientValue>) -> BoxFuture<'static, Result<ClientValue, String>>
        + Send
        + Sync
        + 'static,
    ) -> Self {
        Self::Callback {
            arity,
            f: Arc::new(move |_method, args| f(args)),
        }
    }

    /// An object-shaped callback: the closure also receives the invoked
    /// interface method name, so it can satisfy multi-method interfaces.
    #[must_use]
    pub fn object_callback(
        f: impl Fn(&str, Vec<ClientValue>) -> Result<ClientValue, String> + Send + Sync + 'static,
    ) -> Self {
        Self::Callback {
            arity: MULTI_METHOD_ARITY,
            f: Arc::new(move |method, args| {
                let out = f(method, args);
                Box::pin(async move { out })
            }),
        }
    }

    /// Convenience for string literals.
    #[must_use]
    pub fn str(s: &str) -> Self { Self::Str(s.to_owned()) }
}

struct ClientCore {
    engine: Engine,
    types: TypeRegistry,
    imports: ImportTable<ShimInner>,
    callbacks: CallbackTable,
    options: SessionOptions,
    coercer: Coercer,
    self_ref: std::sync::OnceLock<std::sync::Weak<ClientCore>>,
}

impl ClientCore {
    /// Fetch-or-recall the descriptor for a remote type id.
    pub(crate) async fn descriptor(
        &self,
        id: TypeId,
    ) -> Result<Arc<TypeDescriptor>, BridgeError> {
        if let Some(found) = self.types.get(id) {
            return Ok(found);
        }
        let value = self
            .engine
            .call(
                MessageKind::GetTypeDescriptor,
                messages::encode_u64(u64::from(id.0)),
            )
            .await?;
        let Value::Bytes(bytes) = value else {
            return Err(BridgeError::local(
                ErrorKind::ProtocolError,
                "descriptor reply was not a byte blob",
            ));
        };
        let mut cur = Cursor::new(&bytes);
        let desc = Arc::new(TypeDescriptor::decode(&mut cur).map_err(|e| {
            BridgeError::local(ErrorKind::ProtocolError, format!("bad descriptor: {e}"))
        })?);
        let _ = self.types.intern(Arc::clone(&desc));
        Ok(desc)
    }

    fn shim_for(&self, handle: u64, type_id: TypeId) -> ObjectShim {
        if let Some(inner) = self.imports.get(handle) {
            inner
                .receipts
                .fetch_add(1, std::sync::atomic::Ordering::AcqRel);
            return ObjectShim { inner };
        }
        let inner = Arc::new(ShimInner {
            handle,
            type_id,
            receipts: std::sync::atomic::AtomicU64::new(1),
            core: self.self_ref.get().cloned().unwrap_or_default(),
        });
        self.imports.insert(handle, &inner);
        ObjectShim { inner }
    }

    /// Decode a wire value into client terms, fetching descriptors and
    /// draining shared-memory references as needed.
    pub(crate) fn from_wire<'a>(
        &'a self,
        value: Value,
    ) -> BoxFuture<'a, Result<ClientValue, BridgeError>> {
        Box::pin(async move {
            Ok(match value {
                Value::Null => ClientValue::Null,
                Value::Bool(v) => ClientValue::Bool(v),
                Value::I8(v) => ClientValue::I8(v),
                Value::I16(v) => ClientValue::I16(v),
                Value::I32(v) => ClientValue::I32(v),
                Value::I64(v) => ClientValue::I64(v),
                Value::F32(v) => ClientValue::F32(v),
                Value::F64(v) => ClientValue::F64(v),
                Value::Str(s) => ClientValue::Str(s),
                Value::Bytes(b) => ClientValue::Bytes(b),
                Value::Handle { handle, type_id } => {
                    // Make sure the shim's descriptor is cached before the
                    // caller touches the object.
                    self.descriptor(type_id).await?;
                    ClientValue::Shim(self.shim_for(handle, type_id))
                }
                value @ (Value::Array { .. } | Value::ShmArray { .. }) => {
                    let (kind, data) = self.coercer.receive_array(value).map_err(|e| {
                        BridgeError::local(ErrorKind::CoercionFailed, e.to_string())
                    })?;
                    ClientValue::Array { kind, data }
                }
                Value::List(items) => {
                    let mut out = Vec::with_capacity(items.len());
                    for item in items {
                        out.push(self.from_wire(item).await?);
                    }
                    ClientValue::List(out)
                }
                Value::Map(entries) => {
                    let mut out = Vec::with_capacity(entries.len());
                    for (k, v) in entries {
                        out.push((self.from_wire(k).await?, self.from_wire(v).await?));
                    }
                    ClientValue::Map(out)
                }
                Value::Lambda { handle, arity } => ClientValue::Lambda { handle, arity },
                Value::Exception(payload) => return Err(BridgeError::Remote(payload)),
            })
        })
    }

    /// Encode an argument for the wire, applying the smallest-representable
    /// policy and the shared-memory switch.
    pub(crate) fn encode_arg(&self, arg: Arg) -> Result<Value, BridgeError> {
        Ok(match arg {
            Arg::Null => Value::Null,
            Arg::Bool(v) => Value::Bool(v),
            Arg::Int(n) => fit_int(n),
            Arg::Float(x) => fit_float(x),
            Arg::I8(v) => Value::I8(v),
            Arg::I16(v) => Value::I16(v),
            Arg::I32(v) => Value::I32(v),
            Arg::I64(v) => Value::I64(v),
            Arg::F32(v) => Value::F32(v),
            Arg::F64(v) => Value::F64(v),
            Arg::Str(s) => Value::Str(s),
            Arg::Bytes(b) => Value::Bytes(b),
            Arg::List(items) => Value::List(
                items
                    .into_iter()
                    .map(|a| self.encode_arg(a))
                    .collect::<Result<Vec<_>, _>>()?,
            ),
            Arg::Map(entries) => Value::Map(
                entries
                    .into_iter()
                    .map(|(k, v)| Ok((self.encode_arg(k)?, self.encode_arg(v)?)))
                    .collect::<Result<Vec<_>, BridgeError>>()?,
            ),
            Arg::F64Array(values) => self.pack_array(ElementKind::F64, crate::coerce::pack_f64(&values))?,
            Arg::I64Array(values) => self.pack_array(ElementKind::I64, crate::coerce::pack_i64(&values))?,
            Arg::I32Array(values) => self.pack_array(ElementKind::I32, crate::coerce::pack_i32(&values))?,
            Arg::Shim(shim) => Value::Handle {
                handle: shim.handle(),
                type_id: shim.type_id(),
            },
            Arg::Custom(value) => self
                .coercer
                .coerce_opaque(value.as_ref())
                .map_err(|e| BridgeError::local(ErrorKind::CoercionFailed, e.to_string()))?,
            Arg::Callback { arity, f } => {
                if !self.options.callbacks_enabled() {
                    return Err(BridgeError::local(
                        ErrorKind::CoercionFailed,
                        "callbacks require a session with at least two workers",
                    ));
                }
                let handle = self.callbacks.register(f, arity);
                Value::Lambda { handle, arity }
            }
        })
    }

    fn pack_array(&self, kind: ElementKind, data: Vec<u8>) -> Result<Value, BridgeError> {
        self.coercer
            .encode_array(kind, data)
            .map_err(|e| BridgeError::local(ErrorKind::ShmIoFailed, e.to_string()))
    }

    /// Encode a callback's return value for the wire.
    fn to_wire(&self, value: ClientValue) -> Result<Value, BridgeError> {
        Ok(match value {
            ClientValue::Null => Value::Null,
            ClientValue::Bool(v) => Value::Bool(v),
            ClientValue::I8(v) => Value::I8(v),
            ClientValue::I16(v) => Value::I16(v),
            ClientValue::I32(v) => Value::I32(v),
            ClientValue::I64(v) => Value::I64(v),
            ClientValue::F32(v) => Value::F32(v),
            ClientValue::F64(v) => Value::F64(v),
            ClientValue::Str(s) => Value::Str(s),
            ClientValue::Bytes(b) => Value::Bytes(b),
            ClientValue::Array { kind, data } => self.pack_array(kind, data)?,
            ClientValue::List(items) => Value::List(
                items
                    .into_iter()
                    .map(|v| self.to_wire(v))
                    .collect::<Result<Vec<_>, _>>()?,
            ),
            ClientValue::Map(entries) => Value::Map(
                entries
                    .into_iter()
                    .map(|(k, v)| Ok((self.to_wire(k)?, self.to_wire(v)?)))
                    .collect::<Result<Vec<_>, BridgeError>>()?,
            ),
            ClientValue::Shim(shim) => Value::Handle {
                handle: shim.handle(),
                type_id: shim.type_id(),
            },
            ClientValue::Lambda { handle, arity } => Value::Lambda { handle, arity },
        })
    }

    pub(crate) async fn call_target(
        &self,
        target: CallTarget,
        method: &str,
        args: Vec<Arg>,
        timeout: Option<std::time::Duration>,
    ) -> Result<ClientValue, BridgeError> {
        let mut encoded = Vec::with_capacity(args.len());
        for arg in args {
            encoded.push(self.encode_arg(arg)?);
        }
        let body = CallMethod::positional(target, method, encoded);
        let value = self
            .engine
            .call_with_timeout(MessageKind::CallMethod, body.encode(), timeout)
            .await?;
        self.from_wire(value).await
    }
}

struct ClientHandler {
    core: std::sync::Weak<ClientCore>,
}

#[async_trait]
impl Handler for ClientHandler {
    async fn handle(&self, _engine: &Engine, frame: Frame) -> Result<Value, ErrorPayload> {
        let Some(core) = self.core.upgrade() else {
            return Err(ErrorPayload::new(ErrorKind::SessionClosed, "client dropped"));
        };
        match frame.kind {
            MessageKind::Ping => Ok(Value::Null),
            MessageKind::InvokeProxyCallback => {
                let body = ProxyCallback::parse(&frame.payload)
                    .map_err(|e| ErrorPayload::new(ErrorKind::ProtocolError, e.to_string()))?;
                let Some((f, _arity)) = core.callbacks.get(body.lambda) else {
                    return Err(ErrorPayload::new(
                        ErrorKind::NoSuchHandle,
                        format!("no callback {}", body.lambda),
                    ));
                };
                let mut args = Vec::with_capacity(body.args.len());
                for arg in body.args {
                    args.push(
                        core.from_wire(arg)
                            .await
                            .map_err(BridgeError::into_payload)?,
                    );
                }
                match f(&body.method, args).await {
                    Ok(out) => core.to_wire(out).map_err(BridgeError::into_payload),
                    // The callable's own failure crosses back as the root
                    // cause of the whole nested call chain.
                    Err(message) => Err(ErrorPayload::remote(
                        message.clone(),
                        message.into_bytes(),
                    )),
                }
            }
            other => Err(ErrorPayload::new(
                ErrorKind::ProtocolError,
                format!("client cannot serve {other:?}"),
            )),
        }
    }

    fn release(&self, handle: u64, count: u64) {
        if let Some(core) = self.core.upgrade() {
            core.callbacks.release(handle, count);
        }
    }

    fn on_close(&self) {
        if let Some(core) = self.core.upgrade() {
            core.imports.clear();
            core.callbacks.clear();
        }
    }
}

/// A parked asynchronous call, collectable once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FutureRef {
    key: u64,
}

/// A connected client session.
#[derive(Clone)]
pub struct Client {
    core: Arc<ClientCore>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("peer", self.core.engine.peer())
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Handshake over a transport and start the session.
    ///
    /// # Errors
    /// Returns the handshake refusal or transport failure.
    pub async fn connect(
        transport: Transport,
        identity: &str,
        offer: SessionOptions,
    ) -> Result<Self, SessionError> {
        Self::connect_with_shm(transport, identity, offer, ShmConfig::default()).await
    }

    /// As [`Client::connect`], with an explicit shared-memory region and
    /// threshold (used when both peers agree on a non-default region).
    ///
    /// # Errors
    /// Returns the handshake refusal or transport failure.
    pub async fn connect_with_shm(
        transport: Transport,
        identity: &str,
        offer: SessionOptions,
        shm: ShmConfig,
    ) -> Result<Self, SessionError> {
        let established = session::initiate(transport, identity, offer).await?;
        let options = established.options.clone();
        let localhost = established.transport.info().localhost;
        let engine = Engine::new(
            established.transport,
            options.num_workers,
            Arc::new(LogicalThreads::originator()),
        );
        let coercer = if options.flags.contains(OptionFlags::USE_SHM) && localhost {
            Coercer::with_shm(shm)
        } else {
            Coercer::default()
        };
        let core = Arc::new(ClientCore {
            engine: engine.clone(),
            types: TypeRegistry::with_builtins(),
            imports: ImportTable::default(),
            callbacks: CallbackTable::default(),
            options,
            coercer,
            self_ref: std::sync::OnceLock::new(),
        });
        let _ = core.self_ref.set(Arc::downgrade(&core));
        engine.start(Arc::new(ClientHandler {
            core: Arc::downgrade(&core),
        }));
        debug!(peer = %engine.peer().address, "client session started");
        Ok(Self { core })
    }

    /// The negotiated session options.
    #[must_use]
    pub fn options(&self) -> &SessionOptions { &self.core.options }

    /// The dispatch engine, for advanced integrations and tests.
    #[must_use]
    pub fn engine(&self) -> &Engine { &self.core.engine }

    /// The outbound coercion policy, for registering formatter hooks.
    #[must_use]
    pub fn coercer(&self) -> &Coercer { &self.core.coercer }

    /// Resolve a server class by name.
    ///
    /// # Errors
    /// Surfaces `no_such_class` and `access_denied`.
    pub async fn get_class(&self, name: &str) -> Result<ClassRef, BridgeError> {
        let value = self
            .core
            .engine
            .call(MessageKind::GetClass, messages::encode_name(name))
            .await?;
        let raw = match value {
            Value::I64(raw) => raw,
            other => {
                return Err(BridgeError::local(
                    ErrorKind::ProtocolError,
                    format!("class reply was {other:?}"),
                ));
            }
        };
        let type_id = TypeId(u32::try_from(raw).map_err(|_| {
            BridgeError::local(ErrorKind::ProtocolError, "type id out of range")
        })?);
        self.core.descriptor(type_id).await?;
        Ok(ClassRef {
            type_id,
            name: name.to_owned(),
            core: Arc::downgrade(&self.core),
        })
    }

    /// Resolve a server-published named instance.
    ///
    /// # Errors
    /// Surfaces `no_such_handle` for unknown names.
    pub async fn get_object(&self, name: &str) -> Result<ObjectShim, BridgeError> {
        let value = self
            .core
            .engine
            .call(MessageKind::GetObjectInstance, messages::encode_name(name))
            .await?;
        match self.core.from_wire(value).await? {
            ClientValue::Shim(shim) => Ok(shim),
            other => Err(BridgeError::local(
                ErrorKind::ProtocolError,
                format!("instance reply was {other:?}"),
            )),
        }
    }

    /// Run a sequence of calls under one logical thread.
    ///
    /// Calls made outside a scope each mint a fresh top-level logical id;
    /// lock reentrancy and per-thread serialisation only span calls made
    /// inside the same scope (or inside a callback, which inherits the
    /// logical thread of the call that provoked it).
    pub async fn with_logical_thread<F>(&self, fut: F) -> F::Output
    where
        F: std::future::Future,
    {
        let id = self.core.engine.logical().allocate();
        crate::logical::scope(id, fut).await
    }

    /// Liveness probe.
    ///
    /// # Errors
    /// Surfaces session failures.
    pub async fn ping(&self) -> Result<(), BridgeError> {
        self.core
            .engine
            .call(MessageKind::Ping, bytes::Bytes::new())
            .await?;
        Ok(())
    }

    async fn lock_request(
        &self,
        kind: MessageKind,
        name: &str,
        mode: LockMode,
        wait: AcquireWait,
    ) -> Result<(), BridgeError> {
        let body = LockRequest {
            name: name.to_owned(),
            mode,
            wait,
        };
        self.core.engine.call(kind, body.encode()).await?;
        Ok(())
    }

    /// Ensure a named lock exists on the server.
    ///
    /// # Errors
    /// Surfaces session failures.
    pub async fn get_lock(&self, name: &str) -> Result<(), BridgeError> {
        self.lock_request(
            MessageKind::GetLock,
            name,
            LockMode::Exclusive,
            AcquireWait::Try,
        )
        .await
    }

    /// Acquire a named lock, blocking until granted.
    ///
    /// # Errors
    /// Surfaces `deadlock` when the acquisition would close a wait cycle.
    pub async fn acquire_lock(&self, name: &str, mode: LockMode) -> Result<(), BridgeError> {
        self.lock_request(MessageKind::AcquireLock, name, mode, AcquireWait::Block)
            .await
    }

    /// Acquire without blocking.
    ///
    /// # Errors
    /// Surfaces `acquire_failed` (or `deadlock` when both apply).
    pub async fn try_acquire_lock(&self, name: &str, mode: LockMode) -> Result<(), BridgeError> {
        self.lock_request(MessageKind::AcquireLock, name, mode, AcquireWait::Try)
            .await
    }

    /// Acquire with a server-side timeout.
    ///
    /// # Errors
    /// Surfaces `acquire_failed` on expiry.
    pub async fn acquire_lock_timeout(
        &self,
        name: &str,
        mode: LockMode,
        timeout: std::time::Duration,
    ) -> Result<(), BridgeError> {
        let millis = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self.lock_request(
            MessageKind::AcquireLock,
            name,
            mode,
            AcquireWait::TimeoutMillis(millis),
        )
        .await
    }

    /// Release one acquisition of a named lock.
    ///
    /// # Errors
    /// Surfaces `acquire_failed` when the lock is not held.
    pub async fn release_lock(&self, name: &str) -> Result<(), BridgeError> {
        self.lock_request(
            MessageKind::ReleaseLock,
            name,
            LockMode::Exclusive,
            AcquireWait::Try,
        )
        .await
    }

    /// Start a call without waiting; the outcome parks on the server.
    ///
    /// # Errors
    /// Surfaces session failures on the submission itself.
    pub async fn async_call(
        &self,
        shim: &ObjectShim,
        method: &str,
        args: Vec<Arg>,
    ) -> Result<FutureRef, BridgeError> {
        let mut encoded = Vec::with_capacity(args.len());
        for arg in args {
            encoded.push(self.core.encode_arg(arg)?);
        }
        let body = CallMethod::positional(CallTarget::Instance(shim.handle()), method, encoded);
        let value = self
            .core
            .engine
            .call(MessageKind::AsyncCall, body.encode())
            .await?;
        let Value::I64(key) = value else {
            return Err(BridgeError::local(
                ErrorKind::ProtocolError,
                "async-call ack was not a key",
            ));
        };
        Ok(FutureRef {
            key: u64::try_from(key).unwrap_or_default(),
        })
    }

    /// Collect a parked outcome; blocks until the call completes. Futures
    /// left uncollected accumulate on the server until session end.
    ///
    /// # Errors
    /// Surfaces the parked call's failure, or `no_such_handle` for an
    /// already-collected future.
    pub async fn collect(&self, future: FutureRef) -> Result<ClientValue, BridgeError> {
        let value = self
            .core
            .engine
            .call(MessageKind::CollectFuture, messages::encode_u64(future.key))
            .await?;
        self.core.from_wire(value).await
    }

    /// Hand source text to the server's injection hook.
    ///
    /// # Errors
    /// Surfaces `protocol_error` when the server has no hook installed.
    pub async fn inject_source(&self, name: &str, source: &str) -> Result<(), BridgeError> {
        self.core
            .engine
            .call(
                MessageKind::InjectSource,
                messages::encode_inject(name, source),
            )
            .await?;
        Ok(())
    }

    /// Announce an orderly shutdown and close the session.
    pub async fn goodbye(&self) {
        self.core.engine.goodbye().await;
    }

    /// Completes when the session closes.
    pub async fn closed(&self) { self.core.engine.closed().await }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bare_core() -> Arc<ClientCore> {
        // An engine over a dangling pipe is enough for encode-side tests.
        let (a, _b) = Transport::pair(64);
        let core = Arc::new(ClientCore {
            engine: Engine::new(a, 1, Arc::new(LogicalThreads::originator())),
            types: TypeRegistry::with_builtins(),
            imports: ImportTable::default(),
            callbacks: CallbackTable::default(),
            options: SessionOptions {
                num_workers: 1,
                flags: OptionFlags::empty(),
            },
            coercer: Coercer::default(),
            self_ref: std::sync::OnceLock::new(),
        });
        let _ = core.self_ref.set(Arc::downgrade(&core));
        core
    }

    #[tokio::test]
    async fn untyped_ints_fit_and_typed_ints_pin() {
        let core = bare_core();
        assert_eq!(core.encode_arg(Arg::Int(1)).unwrap(), Value::I8(1));
        assert_eq!(core.encode_arg(Arg::Int(40_000)).unwrap(), Value::I32(40_000));
        assert_eq!(core.encode_arg(Arg::I64(1)).unwrap(), Value::I64(1));
        assert_eq!(core.encode_arg(Arg::Float(1.0)).unwrap(), Value::F64(1.0));
    }

    #[tokio::test]
    async fn custom_values_run_the_hook_chain() {
        struct Money(u32);
        let core = bare_core();
        core.coercer.register_hook::<Money>(Arc::new(|v| {
            v.downcast_ref::<Money>().map(|m| Value::I64(i64::from(m.0)))
        }));
        let out = core.encode_arg(Arg::Custom(Arc::new(Money(9)))).unwrap();
        assert_eq!(out, Value::I64(9));
    }

    #[tokio::test]
    async fn callbacks_refused_in_single_worker_mode() {
        let core = bare_core();
        let err = core
            .encode_arg(Arg::callback(1, |_| Ok(ClientValue::Null)))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CoercionFailed);
        assert!(core.callbacks.is_empty(), "nothing was registered");
    }
}
