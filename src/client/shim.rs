//! Shims over remote objects and classes.
//!
//! A shim looks like an ordinary local object: method calls, field
//! accessors, and (for array-shaped remotes) indexing and length all
//! forward to the owning side by handle. Shims are cached weakly per
//! handle, count every receipt of the handle, and send one count-carrying
//! RELEASE_HANDLE when the last clone is finalised.

use std::sync::{
    Arc, Weak,
    atomic::{AtomicU64, Ordering},
};

use crate::{
    error::{BridgeError, ErrorKind},
    messages,
    protocol::MessageKind,
    types::{TypeDescriptor, TypeId},
};

use super::{Arg, ClientCore, ClientValue};

pub(super) struct ShimInner {
    pub(super) handle: u64,
    pub(super) type_id: TypeId,
    /// Times this handle has been received; carried on the final release.
    pub(super) receipts: AtomicU64,
    pub(super) core: Weak<ClientCore>,
}

impl Drop for ShimInner {
    fn drop(&mut self) {
        let Some(core) = self.core.upgrade() else { return };
        let count = self.receipts.load(Ordering::Acquire);
        core.imports.remove(self.handle);
        let payload = messages::encode_release(self.handle, count);
        let engine = core.engine.clone();
        // Finalisation may happen anywhere; the notify is fire-and-forget.
        if let Ok(rt) = tokio::runtime::Handle::try_current() {
            rt.spawn(async move {
                let _ = engine.notify(MessageKind::ReleaseHandle, payload).await;
            });
        }
    }
}

/// A remote object as seen from this side.
#[derive(Clone)]
pub struct ObjectShim {
    pub(super) inner: Arc<ShimInner>,
}

impl std::fmt::Debug for ObjectShim {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectShim")
            .field("handle", &self.inner.handle)
            .field("type_id", &self.inner.type_id)
            .finish_non_exhaustive()
    }
}

impl ObjectShim {
    fn core(&self) -> Result<Arc<ClientCore>, BridgeError> {
        self.inner
            .core
            .upgrade()
            .ok_or_else(|| BridgeError::local(ErrorKind::SessionClosed, "client dropped"))
    }

    /// The wire handle.
    #[must_use]
    pub fn handle(&self) -> u64 { self.inner.handle }

    /// The remote type id.
    #[must_use]
    pub fn type_id(&self) -> TypeId { self.inner.type_id }

    /// The cached descriptor of the remote type.
    ///
    /// # Errors
    /// Fails when the session has closed or the descriptor fetch fails.
    pub async fn descriptor(&self) -> Result<Arc<TypeDescriptor>, BridgeError> {
        let core = self.core()?;
        core.descriptor(self.inner.type_id).await
    }

    /// Invoke a method on the remote object.
    ///
    /// # Errors
    /// Surfaces the remote failure (`no_such_method`, `ambiguous_call`,
    /// `remote_exception`, ...) or a local session failure.
    pub async fn call(&self, method: &str, args: Vec<Arg>) -> Result<ClientValue, BridgeError> {
        let core = self.core()?;
        core.call_target(
            messages::CallTarget::Instance(self.inner.handle),
            method,
            args,
            None,
        )
        .await
    }

    /// Invoke with a caller-side timeout; expiry raises `timed_out`
    /// without signalling the server.
    ///
    /// # Errors
    /// As [`ObjectShim::call`], plus `timed_out`.
    pub async fn call_with_timeout(
        &self,
        method: &str,
        args: Vec<Arg>,
        timeout: std::time::Duration,
    ) -> Result<ClientValue, BridgeError> {
        let core = self.core()?;
        core.call_target(
            messages::CallTarget::Instance(self.inner.handle),
            method,
            args,
            Some(timeout),
        )
        .await
    }

    /// Read a public field.
    ///
    /// # Errors
    /// Surfaces `no_such_field` and session failures.
    pub async fn get_field(&self, field: &str) -> Result<ClientValue, BridgeError> {
        let core = self.core()?;
        let body = messages::FieldAccess {
            handle: self.inner.handle,
            field: field.to_owned(),
            value: None,
        };
        let value = core.engine.call(MessageKind::GetField, body.encode()).await?;
        core.from_wire(value).await
    }

    /// Write a public field.
    ///
    /// # Errors
    /// Surfaces `no_such_field`, coercion failures, and session failures.
    pub async fn set_field(&self, field: &str, value: Arg) -> Result<(), BridgeError> {
        let core = self.core()?;
        let encoded = core.encode_arg(value)?;
        let body = messages::FieldAccess {
            handle: self.inner.handle,
            field: field.to_owned(),
            value: Some(encoded),
        };
        core.engine.call(MessageKind::SetField, body.encode()).await?;
        Ok(())
    }

    /// Checked cast to a named remote type; returns a re-tagged shim.
    ///
    /// # Errors
    /// Surfaces `type_mismatch` when the object is not of that type.
    pub async fn cast(&self, type_name: &str) -> Result<Self, BridgeError> {
        let core = self.core()?;
        let value = core
            .engine
            .call(
                MessageKind::Cast,
                messages::encode_cast(self.inner.handle, type_name),
            )
            .await?;
        match core.from_wire(value).await? {
            ClientValue::Shim(shim) => Ok(shim),
            other => Err(BridgeError::local(
                ErrorKind::ProtocolError,
                format!("cast returned {other:?}"),
            )),
        }
    }

    /// By-value snapshot of the remote object.
    ///
    /// # Errors
    /// Surfaces `coercion_failed` when the object has no by-value form.
    pub async fn snapshot(&self) -> Result<ClientValue, BridgeError> {
        let core = self.core()?;
        let value = core
            .engine
            .call(
                MessageKind::GetValue,
                messages::encode_u64(self.inner.handle),
            )
            .await?;
        core.from_wire(value).await
    }

    /// Length of an array-shaped remote (`length()` on the remote side).
    ///
    /// # Errors
    /// Surfaces `no_such_method` for non-array remotes.
    pub async fn len(&self) -> Result<i64, BridgeError> {
        let out = self.call("length", Vec::new()).await?;
        out.as_i64().ok_or_else(|| {
            BridgeError::local(ErrorKind::TypeMismatch, "length() did not return an integer")
        })
    }

    /// Indexed read on an array-shaped remote (`get(i)`).
    ///
    /// # Errors
    /// Surfaces `no_such_method` for non-array remotes.
    pub async fn index(&self, i: i64) -> Result<ClientValue, BridgeError> {
        self.call("get", vec![Arg::Int(i)]).await
    }
}

/// A remote class, for statics and constructors.
#[derive(Clone)]
pub struct ClassRef {
    pub(super) type_id: TypeId,
    pub(super) name: String,
    pub(super) core: Weak<ClientCore>,
}

impl std::fmt::Debug for ClassRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClassRef")
            .field("type_id", &self.type_id)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl ClassRef {
    fn core(&self) -> Result<Arc<ClientCore>, BridgeError> {
        self.core
            .upgrade()
            .ok_or_else(|| BridgeError::local(ErrorKind::SessionClosed, "client dropped"))
    }

    /// The remote type id.
    #[must_use]
    pub fn type_id(&self) -> TypeId { self.type_id }

    /// Canonical class name.
    #[must_use]
    pub fn name(&self) -> &str { &self.name }

    /// Invoke a static method.
    ///
    /// # Errors
    /// Surfaces resolution and session failures.
    pub async fn call_static(
        &self,
        method: &str,
        args: Vec<Arg>,
    ) -> Result<ClientValue, BridgeError> {
        let core = self.core()?;
        core.call_target(messages::CallTarget::Class(self.type_id), method, args, None)
            .await
    }

    /// Construct a remote instance.
    ///
    /// # Errors
    /// Surfaces resolution and session failures.
    pub async fn construct(&self, args: Vec<Arg>) -> Result<ObjectShim, BridgeError> {
        let core = self.core()?;
        let mut encoded = Vec::with_capacity(args.len());
        for arg in args {
            encoded.push(core.encode_arg(arg)?);
        }
        let body = messages::CallConstructor {
            class: self.type_id,
            args: encoded,
        };
        let value = core
            .engine
            .call(MessageKind::CallConstructor, body.encode())
            .await?;
        match core.from_wire(value).await? {
            ClientValue::Shim(shim) => Ok(shim),
            other => Err(BridgeError::local(
                ErrorKind::ProtocolError,
                format!("constructor returned {other:?}"),
            )),
        }
    }
}
