//! Server-side request processing.
//!
//! The handler owns the export table, the negotiated session options, and
//! the bridge between wire values and the host runtime: inbound arguments
//! are resolved against the receiver's overload sets, coerced to the
//! declared parameter types, and dispatched through [`HostRuntime`];
//! results flow back out through the export table and the shared-memory
//! switch. Callback-valued arguments become dynamic proxies whose method
//! bodies issue INVOKE_PROXY_CALLBACK frames to the client.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, OnceLock, Weak},
};

use async_trait::async_trait;
use tokio::sync::oneshot;
use tracing::{debug, instrument, trace};

use crate::{
    coerce::{Coercer, convert_scalar},
    codec::Value,
    dispatch::{Engine, Handler},
    error::{ErrorKind, ErrorPayload},
    handles::ExportTable,
    lock::{GLOBAL_LOCK_NAME, LockError, LockManager, LockMode},
    logical,
    messages::{
        AcquireWait, CallConstructor, CallMethod, CallTarget, FieldAccess, LockRequest,
        ProxyCallback, parse_cast, parse_inject, parse_name, parse_u64,
    },
    protocol::{Frame, MessageKind, SessionOptions},
    resolve::{ArgShape, resolve},
    runtime::{
        CallbackInvoker, CallbackRef, HostRuntime, MethodResult, NativeValue, ObjectInstance,
    },
    types::{TypeDescriptor, TypeFlags, TypeId},
};

/// Optional hook receiving INJECT_SOURCE payloads.
pub type InjectHook = Arc<dyn Fn(&str, &str) -> Result<(), ErrorPayload> + Send + Sync>;

/// Configuration for one server-side session handler.
pub struct ServerConfig {
    /// The reflection capability serving this session.
    pub runtime: Arc<dyn HostRuntime>,
    /// The process-wide lock registry.
    pub locks: Arc<LockManager>,
    /// Options agreed at handshake.
    pub options: SessionOptions,
    /// Coercion policy (shared-memory settings included).
    pub coercer: Coercer,
    /// Fully-qualified class names the client may access, when present.
    pub allow_list: Option<HashSet<String>>,
    /// Hold the process-wide lock across every request execution.
    pub global_lock: bool,
    /// Source-injection hook; absent means the kind is refused.
    pub inject_hook: Option<InjectHook>,
}

enum FutureSlot {
    Pending(Vec<oneshot::Sender<()>>),
    Done(Result<Value, ErrorPayload>),
}

/// Server-side [`Handler`] for one session.
pub struct ServerHandler {
    runtime: Arc<dyn HostRuntime>,
    locks: Arc<LockManager>,
    options: SessionOptions,
    coercer: Coercer,
    allow_list: Option<HashSet<String>>,
    global_lock: bool,
    inject_hook: Option<InjectHook>,
    exports: ExportTable,
    futures: Mutex<HashMap<u64, FutureSlot>>,
    self_ref: OnceLock<Weak<ServerHandler>>,
}

impl ServerHandler {
    /// Build the handler for a freshly-negotiated session.
    #[must_use]
    pub fn new(config: ServerConfig) -> Arc<Self> {
        let handler = Arc::new(Self {
            runtime: config.runtime,
            locks: config.locks,
            options: config.options,
            coercer: config.coercer,
            allow_list: config.allow_list,
            global_lock: config.global_lock,
            inject_hook: config.inject_hook,
            exports: ExportTable::default(),
            futures: Mutex::new(HashMap::new()),
            self_ref: OnceLock::new(),
        });
        let _ = handler.self_ref.set(Arc::downgrade(&handler));
        handler
    }

    /// Number of live exports, for the admin surface and tests.
    #[must_use]
    pub fn live_exports(&self) -> usize { self.exports.len() }

    /// Export an object, emitting the handle value for the wire.
    pub(crate) fn export(&self, obj: ObjectInstance) -> Value {
        let type_id = obj.type_id;
        let handle = self.exports.export(obj);
        Value::Handle { handle, type_id }
    }

    fn class_allowed(&self, name: &str) -> bool {
        self.allow_list
            .as_ref()
            .is_none_or(|list| list.contains(name))
    }

    fn callbacks_enabled(&self) -> bool { self.options.callbacks_enabled() }

    fn descriptor(&self, id: TypeId) -> Result<Arc<TypeDescriptor>, ErrorPayload> {
        self.runtime
            .descriptor(id)
            .ok_or_else(|| ErrorPayload::new(ErrorKind::NoSuchClass, format!("unknown type {id}")))
    }

    fn callback_ref(&self, engine: &Engine, handle: u64, arity: u8) -> CallbackRef {
        let invoker = ProxyInvoker {
            engine: engine.clone(),
            handler: self.self_ref.get().cloned().unwrap_or_default(),
        };
        CallbackRef::new(handle, arity, Arc::new(invoker))
    }

    /// Convert one inbound argument to the declared parameter type.
    fn native_arg(
        &self,
        engine: &Engine,
        value: Value,
        param: TypeId,
    ) -> Result<NativeValue, ErrorPayload> {
        match value {
            Value::Null => Ok(NativeValue::Null),
            Value::Handle { handle, .. } => self
                .exports
                .get(handle)
                .map(NativeValue::Object)
                .ok_or_else(|| {
                    ErrorPayload::new(ErrorKind::NoSuchHandle, format!("handle {handle}"))
                }),
            Value::Lambda { handle, arity } => {
                if !self.callbacks_enabled() {
                    return Err(ErrorPayload::new(
                        ErrorKind::CoercionFailed,
                        "callbacks are disabled for this session",
                    ));
                }
                let callback = self.callback_ref(engine, handle, arity);
                let is_interface = self.runtime.descriptor(param).is_some_and(|d| {
                    d.flags.contains(TypeFlags::INTERFACE) && !d.methods.is_empty()
                });
                if is_interface {
                    Ok(NativeValue::Object(self.runtime.make_proxy(param, callback)))
                } else {
                    Ok(NativeValue::Callback(callback))
                }
            }
            Value::Array { .. } | Value::ShmArray { .. } => {
                let (kind, data) = self
                    .coercer
                    .receive_array(value)
                    .map_err(|e| ErrorPayload::new(ErrorKind::CoercionFailed, e.to_string()))?;
                Ok(NativeValue::Array { kind, data })
            }
            Value::List(items) => {
                let converted = items
                    .into_iter()
                    .map(|v| self.native_arg(engine, v, TypeId::OBJECT))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(NativeValue::List(converted))
            }
            Value::Map(entries) => {
                let converted = entries
                    .into_iter()
                    .map(|(k, v)| {
                        Ok((
                            self.native_arg(engine, k, TypeId::OBJECT)?,
                            self.native_arg(engine, v, TypeId::OBJECT)?,
                        ))
                    })
                    .collect::<Result<Vec<_>, ErrorPayload>>()?;
                Ok(NativeValue::Map(converted))
            }
            Value::Str(s) => Ok(NativeValue::Str(s)),
            Value::Bytes(b) => Ok(NativeValue::Bytes(b)),
            Value::Exception(payload) => Err(payload),
            scalar => {
                let widened = convert_scalar(&scalar, param).unwrap_or(scalar);
                Ok(match widened {
                    Value::Bool(v) => NativeValue::Bool(v),
                    Value::I8(v) => NativeValue::I8(v),
                    Value::I16(v) => NativeValue::I16(v),
                    Value::I32(v) => NativeValue::I32(v),
                    Value::I64(v) => NativeValue::I64(v),
                    Value::F32(v) => NativeValue::F32(v),
                    Value::F64(v) => NativeValue::F64(v),
                    other => {
                        return Err(ErrorPayload::new(
                            ErrorKind::CoercionFailed,
                            format!("unexpected scalar {other:?}"),
                        ));
                    }
                })
            }
        }
    }

    /// Convert a native result back to a wire value, honouring the
    /// declared type for scalars.
    fn encode_native(
        &self,
        value: NativeValue,
        declared: Option<TypeId>,
    ) -> Result<Value, ErrorPayload> {
        let scalar = |v: Value| -> Value {
            declared
                .and_then(|target| convert_scalar(&v, target))
                .unwrap_or(v)
        };
        Ok(match value {
            NativeValue::Null => Value::Null,
            NativeValue::Bool(v) => Value::Bool(v),
            NativeValue::I8(v) => scalar(Value::I8(v)),
            NativeValue::I16(v) => scalar(Value::I16(v)),
            NativeValue::I32(v) => scalar(Value::I32(v)),
            NativeValue::I64(v) => scalar(Value::I64(v)),
            NativeValue::F32(v) => scalar(Value::F32(v)),
            NativeValue::F64(v) => scalar(Value::F64(v)),
            NativeValue::Str(s) => Value::Str(s),
            NativeValue::Bytes(b) => Value::Bytes(b),
            NativeValue::Array { kind, data } => self
                .coercer
                .encode_array(kind, data)
                .map_err(|e| ErrorPayload::new(ErrorKind::ShmIoFailed, e.to_string()))?,
            NativeValue::List(items) => Value::List(
                items
                    .into_iter()
                    .map(|v| self.encode_native(v, None))
                    .collect::<Result<Vec<_>, _>>()?,
            ),
            NativeValue::Map(entries) => Value::Map(
                entries
                    .into_iter()
                    .map(|(k, v)| Ok((self.encode_native(k, None)?, self.encode_native(v, None)?)))
                    .collect::<Result<Vec<_>, ErrorPayload>>()?,
            ),
            NativeValue::Object(obj) => self.export(obj),
            NativeValue::Callback(cb) => Value::Lambda {
                handle: cb.handle,
                arity: cb.arity,
            },
        })
    }

    fn shapes(&self, args: &[Value]) -> Vec<ArgShape> {
        args.iter()
            .map(|v| match ArgShape::of(v) {
                // Without callback support the overload resolver treats
                // callable arguments as unsupported.
                ArgShape::Callable { .. } if !self.callbacks_enabled() => ArgShape::Unsupported,
                shape => shape,
            })
            .collect()
    }

    async fn call_method(&self, engine: &Engine, body: CallMethod) -> Result<Value, ErrorPayload> {
        if !body.kwargs.is_empty() {
            // Host members are positional; keyword arguments only mean
            // something on the callback path.
            return Err(ErrorPayload::new(
                ErrorKind::CoercionFailed,
                "keyword arguments are not supported by this host",
            ));
        }
        let (class, receiver, class_receiver) = match body.target {
            CallTarget::Instance(handle) => {
                let obj = self.exports.get(handle).ok_or_else(|| {
                    ErrorPayload::new(ErrorKind::NoSuchHandle, format!("handle {handle}"))
                })?;
                (obj.type_id, Some(obj), false)
            }
            CallTarget::Class(id) => (id, None, true),
        };
        let set = self.runtime.method_set(class, &body.method).ok_or_else(|| {
            ErrorPayload::new(
                ErrorKind::NoSuchMethod,
                format!("no method {} on {class}", body.method),
            )
        })?;
        let types = self.runtime.types();
        let shapes = self.shapes(&body.args);
        let chosen = resolve(&set, &shapes, class_receiver, &types)
            .map_err(crate::resolve::ResolveError::into_payload)?;
        trace!(method = %body.method, slot = chosen.slot, "overload selected");
        let mut natives = Vec::with_capacity(body.args.len());
        for (pos, value) in body.args.into_iter().enumerate() {
            let param = chosen.params.get(pos).copied().unwrap_or(TypeId::OBJECT);
            natives.push(self.native_arg(engine, value, param)?);
        }
        let receiver = if chosen.is_static { None } else { receiver };
        let ret = chosen.ret;
        let slot = chosen.slot;
        let out = self.runtime.invoke(receiver, class, slot, natives).await?;
        self.encode_native(out, Some(ret))
    }

    async fn call_constructor(
        &self,
        engine: &Engine,
        body: CallConstructor,
    ) -> Result<Value, ErrorPayload> {
        let set = self.runtime.constructor_set(body.class).ok_or_else(|| {
            ErrorPayload::new(ErrorKind::NoSuchClass, format!("unknown class {}", body.class))
        })?;
        let types = self.runtime.types();
        let shapes = self.shapes(&body.args);
        let chosen = resolve(&set, &shapes, false, &types)
            .map_err(crate::resolve::ResolveError::into_payload)?;
        let mut natives = Vec::with_capacity(body.args.len());
        for (pos, value) in body.args.into_iter().enumerate() {
            let param = chosen.params.get(pos).copied().unwrap_or(TypeId::OBJECT);
            natives.push(self.native_arg(engine, value, param)?);
        }
        let slot = chosen.slot;
        let out = self.runtime.construct(body.class, slot, natives).await?;
        self.encode_native(out, None)
    }

    fn field_slot(
        &self,
        handle: u64,
        field: &str,
    ) -> Result<(ObjectInstance, u32, TypeId), ErrorPayload> {
        let obj = self.exports.get(handle).ok_or_else(|| {
            ErrorPayload::new(ErrorKind::NoSuchHandle, format!("handle {handle}"))
        })?;
        let desc = self.descriptor(obj.type_id)?;
        let field = desc.field_named(field).ok_or_else(|| {
            ErrorPayload::new(
                ErrorKind::NoSuchField,
                format!("no field {field} on {}", desc.name),
            )
        })?;
        Ok((obj.clone(), field.slot, field.type_id))
    }

    async fn acquire_lock(&self, request: LockRequest) -> Result<Value, ErrorPayload> {
        let lt = logical::current().unwrap_or_default();
        let outcome = match request.wait {
            AcquireWait::Try => self.locks.try_acquire(&request.name, request.mode, lt),
            AcquireWait::Block => self.locks.acquire(&request.name, request.mode, lt).await,
            AcquireWait::TimeoutMillis(ms) => {
                self.locks
                    .acquire_timeout(
                        &request.name,
                        request.mode,
                        lt,
                        std::time::Duration::from_millis(ms),
                    )
                    .await
            }
        };
        outcome.map(|()| Value::Null).map_err(lock_error_payload)
    }

    fn spawn_async_call(&self, engine: &Engine, frame: &Frame) -> Result<Value, ErrorPayload> {
        let body = CallMethod::parse(&frame.payload)
            .map_err(|e| ErrorPayload::new(ErrorKind::ProtocolError, e.to_string()))?;
        let key = frame.request_id;
        self.futures
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(key, FutureSlot::Pending(Vec::new()));
        let weak = self.self_ref.get().cloned().unwrap_or_default();
        let engine = engine.clone();
        // Detached execution runs under its own logical thread; the
        // caller's thread is free as soon as the ack goes back.
        let logical_id = engine.logical().allocate();
        tokio::spawn(async move {
            let Some(handler) = weak.upgrade() else { return };
            let outcome = logical::scope(logical_id, async {
                if handler.global_lock {
                    match handler
                        .locks
                        .acquire(GLOBAL_LOCK_NAME, LockMode::Exclusive, logical_id)
                        .await
                    {
                        Ok(()) => {
                            let out = handler.call_method(&engine, body).await;
                            let _ = handler.locks.release(GLOBAL_LOCK_NAME, logical_id);
                            out
                        }
                        Err(e) => Err(lock_error_payload(e)),
                    }
                } else {
                    handler.call_method(&engine, body).await
                }
            })
            .await;
            handler.complete_future(key, outcome);
        });
        Ok(Value::I64(i64::try_from(key).unwrap_or(i64::MAX)))
    }

    async fn guarded<Fut>(&self, lt: u64, run: Fut) -> Result<Value, ErrorPayload>
    where
        Fut: std::future::Future<Output = Result<Value, ErrorPayload>>,
    {
        if self.global_lock {
            self.locks
                .acquire(GLOBAL_LOCK_NAME, LockMode::Exclusive, lt)
                .await
                .map_err(lock_error_payload)?;
            let outcome = run.await;
            let _ = self.locks.release(GLOBAL_LOCK_NAME, lt);
            outcome
        } else {
            run.await
        }
    }

    fn complete_future(&self, key: u64, outcome: Result<Value, ErrorPayload>) {
        let mut futures = self
            .futures
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(FutureSlot::Pending(waiters)) = futures.insert(key, FutureSlot::Done(outcome))
        {
            for waiter in waiters {
                let _ = waiter.send(());
            }
        }
    }

    async fn collect_future(&self, key: u64) -> Result<Value, ErrorPayload> {
        loop {
            let waiter = {
                let mut futures = self
                    .futures
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                match futures.remove(&key) {
                    None => {
                        return Err(ErrorPayload::new(
                            ErrorKind::NoSuchHandle,
                            format!("no future for request {key}"),
                        ));
                    }
                    Some(FutureSlot::Done(outcome)) => return outcome,
                    Some(FutureSlot::Pending(mut waiters)) => {
                        let (tx, rx) = oneshot::channel();
                        waiters.push(tx);
                        futures.insert(key, FutureSlot::Pending(waiters));
                        rx
                    }
                }
            };
            let _ = waiter.await;
        }
    }

    #[instrument(skip_all, fields(kind = ?frame.kind, request_id = frame.request_id))]
    async fn dispatch(&self, engine: &Engine, frame: Frame) -> Result<Value, ErrorPayload> {
        let protocol_err =
            |e: crate::codec::CodecError| ErrorPayload::new(ErrorKind::ProtocolError, e.to_string());
        match frame.kind {
            MessageKind::Ping => Ok(Value::Null),
            MessageKind::GetObjectInstance => {
                let name = parse_name(&frame.payload).map_err(protocol_err)?;
                let obj = self.runtime.named_instance(&name).ok_or_else(|| {
                    ErrorPayload::new(ErrorKind::NoSuchHandle, format!("no instance '{name}'"))
                })?;
                Ok(self.export(obj))
            }
            MessageKind::GetClass => {
                let name = parse_name(&frame.payload).map_err(protocol_err)?;
                if !self.class_allowed(&name) {
                    return Err(ErrorPayload::new(
                        ErrorKind::AccessDenied,
                        format!("class {name} is not on the allow-list"),
                    ));
                }
                let desc = self.runtime.class_by_name(&name).ok_or_else(|| {
                    ErrorPayload::new(ErrorKind::NoSuchClass, format!("unknown class {name}"))
                })?;
                Ok(Value::I64(i64::from(desc.id.0)))
            }
            MessageKind::GetTypeDescriptor => {
                let raw = parse_u64(&frame.payload).map_err(protocol_err)?;
                let id = TypeId(u32::try_from(raw).map_err(|_| {
                    ErrorPayload::new(ErrorKind::ProtocolError, "type id out of range")
                })?);
                let desc = self.descriptor(id)?;
                Ok(Value::Bytes(desc.to_bytes().to_vec()))
            }
            MessageKind::CallMethod => {
                let body = CallMethod::parse(&frame.payload).map_err(protocol_err)?;
                let lt = logical::current().unwrap_or(frame.logical_id);
                self.guarded(lt, self.call_method(engine, body)).await
            }
            MessageKind::CallConstructor => {
                let body = CallConstructor::parse(&frame.payload).map_err(protocol_err)?;
                let lt = logical::current().unwrap_or(frame.logical_id);
                self.guarded(lt, self.call_constructor(engine, body)).await
            }
            MessageKind::GetField => {
                let body = FieldAccess::parse(&frame.payload, false).map_err(protocol_err)?;
                let (obj, slot, declared) = self.field_slot(body.handle, &body.field)?;
                let out = self.runtime.get_field(&obj, slot)?;
                self.encode_native(out, Some(declared))
            }
            MessageKind::SetField => {
                let body = FieldAccess::parse(&frame.payload, true).map_err(protocol_err)?;
                let (obj, slot, declared) = self.field_slot(body.handle, &body.field)?;
                let value = body.value.ok_or_else(|| {
                    ErrorPayload::new(ErrorKind::ProtocolError, "SET_FIELD without a value")
                })?;
                let native = self.native_arg(engine, value, declared)?;
                self.runtime.set_field(&obj, slot, native)?;
                Ok(Value::Null)
            }
            MessageKind::Cast => {
                let (handle, type_name) = parse_cast(&frame.payload).map_err(protocol_err)?;
                if !self.class_allowed(&type_name) {
                    return Err(ErrorPayload::new(
                        ErrorKind::AccessDenied,
                        format!("class {type_name} is not on the allow-list"),
                    ));
                }
                let obj = self.exports.get(handle).ok_or_else(|| {
                    ErrorPayload::new(ErrorKind::NoSuchHandle, format!("handle {handle}"))
                })?;
                let types = self.runtime.types();
                let target = types.id_of(&type_name).ok_or_else(|| {
                    ErrorPayload::new(ErrorKind::NoSuchClass, format!("unknown class {type_name}"))
                })?;
                if !types.is_subtype(obj.type_id, target) {
                    return Err(ErrorPayload::new(
                        ErrorKind::TypeMismatch,
                        format!("cannot cast {} to {type_name}", obj.type_id),
                    ));
                }
                // Re-transmission of the same export, re-tagged.
                self.exports.incref(handle);
                Ok(Value::Handle {
                    handle,
                    type_id: target,
                })
            }
            MessageKind::GetValue => {
                let handle = parse_u64(&frame.payload).map_err(protocol_err)?;
                let obj = self.exports.get(handle).ok_or_else(|| {
                    ErrorPayload::new(ErrorKind::NoSuchHandle, format!("handle {handle}"))
                })?;
                let snapshot = self.runtime.snapshot(&obj).ok_or_else(|| {
                    ErrorPayload::new(
                        ErrorKind::CoercionFailed,
                        "object has no by-value representation",
                    )
                })?;
                self.encode_native(snapshot, None)
            }
            MessageKind::InjectSource => {
                let (name, source) = parse_inject(&frame.payload).map_err(protocol_err)?;
                match &self.inject_hook {
                    Some(hook) => hook(&name, &source).map(|()| Value::Null),
                    None => Err(ErrorPayload::new(
                        ErrorKind::ProtocolError,
                        "source injection is not supported by this server",
                    )),
                }
            }
            MessageKind::GetLock => {
                let request = LockRequest::parse(&frame.payload).map_err(protocol_err)?;
                self.locks.ensure(&request.name);
                Ok(Value::Null)
            }
            MessageKind::AcquireLock => {
                let request = LockRequest::parse(&frame.payload).map_err(protocol_err)?;
                self.acquire_lock(request).await
            }
            MessageKind::ReleaseLock => {
                let request = LockRequest::parse(&frame.payload).map_err(protocol_err)?;
                let lt = logical::current().unwrap_or_default();
                self.locks
                    .release(&request.name, lt)
                    .map(|()| Value::Null)
                    .map_err(lock_error_payload)
            }
            MessageKind::AsyncCall => self.spawn_async_call(engine, &frame),
            MessageKind::CollectFuture => {
                let key = parse_u64(&frame.payload).map_err(protocol_err)?;
                self.collect_future(key).await
            }
            other => Err(ErrorPayload::new(
                ErrorKind::ProtocolError,
                format!("unexpected message kind {other:?}"),
            )),
        }
    }
}

fn lock_error_payload(err: LockError) -> ErrorPayload {
    let kind = match err {
        LockError::Deadlock(_) => ErrorKind::Deadlock,
        LockError::AcquireFailed(_) | LockError::NotHeld(_) => ErrorKind::AcquireFailed,
    };
    ErrorPayload::new(kind, err.to_string())
}

#[async_trait]
impl Handler for ServerHandler {
    async fn handle(&self, engine: &Engine, frame: Frame) -> Result<Value, ErrorPayload> {
        self.dispatch(engine, frame).await
    }

    fn release(&self, handle: u64, count: u64) {
        self.exports.decref(handle, count);
    }

    fn on_close(&self) {
        debug!("server session closing; clearing exports and lock waiters");
        self.exports.release_all();
        self.locks.shutdown();
    }
}

/// Routes proxy method invocations back to the client that owns the
/// callable.
struct ProxyInvoker {
    engine: Engine,
    handler: Weak<ServerHandler>,
}

#[async_trait]
impl CallbackInvoker for ProxyInvoker {
    async fn invoke(&self, lambda: u64, method: &str, args: Vec<NativeValue>) -> MethodResult {
        let handler = self
            .handler
            .upgrade()
            .ok_or_else(|| ErrorPayload::new(ErrorKind::SessionClosed, "session closed"))?;
        let mut encoded = Vec::with_capacity(args.len());
        for arg in args {
            encoded.push(handler.encode_native(arg, None)?);
        }
        let body = ProxyCallback {
            lambda,
            method: method.to_owned(),
            args: encoded,
        };
        let outcome = self
            .engine
            .call(MessageKind::InvokeProxyCallback, body.encode())
            .await
            .map_err(crate::error::BridgeError::into_payload)?;
        handler.native_arg(&self.engine, outcome, TypeId::OBJECT)
    }
}
