//! Request payload formats, shared by both peers.
//!
//! Each message kind owns a small struct with an `encode`/`parse` pair so
//! the client and server sides can never drift apart on field order. The
//! frame header (kind, request id, logical id) lives in
//! [`crate::protocol`]; only the kind-specific bodies are described here.

use bytes::{BufMut, Bytes, BytesMut};

use crate::{
    codec::{CodecError, Cursor, Value, put_str},
    lock::LockMode,
    types::TypeId,
};

/// The receiver of a CALL_METHOD: a live instance or a class object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallTarget {
    /// An exported instance.
    Instance(u64),
    /// A class, for statics.
    Class(TypeId),
}

/// CALL_METHOD / ASYNC_CALL body.
#[derive(Debug, Clone, PartialEq)]
pub struct CallMethod {
    /// Receiver.
    pub target: CallTarget,
    /// Member name.
    pub method: String,
    /// Encoded positional arguments.
    pub args: Vec<Value>,
    /// Keyword arguments; carried on the wire for callable targets that
    /// accept them, refused by hosts whose members are positional-only.
    pub kwargs: Vec<(String, Value)>,
}

impl CallMethod {
    /// A positional-only call body.
    #[must_use]
    pub fn positional(target: CallTarget, method: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            target,
            method: method.into(),
            args,
            kwargs: Vec::new(),
        }
    }

    /// Serialise the body.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self.target {
            CallTarget::Instance(handle) => {
                buf.put_u8(0);
                buf.put_u64(handle);
            }
            CallTarget::Class(id) => {
                buf.put_u8(1);
                buf.put_u32(id.0);
            }
        }
        put_str(&mut buf, &self.method);
        encode_args(&mut buf, &self.args);
        buf.put_u32(u32::try_from(self.kwargs.len()).unwrap_or(u32::MAX));
        for (name, value) in &self.kwargs {
            put_str(&mut buf, name);
            value.encode(&mut buf);
        }
        buf.freeze()
    }

    /// Parse the body.
    ///
    /// # Errors
    /// Returns a [`CodecError`] for malformed payloads.
    pub fn parse(payload: &[u8]) -> Result<Self, CodecError> {
        let mut cur = Cursor::new(payload);
        let target = match cur.get_u8()? {
            0 => CallTarget::Instance(cur.get_u64()?),
            1 => CallTarget::Class(TypeId(cur.get_u32()?)),
            other => return Err(CodecError::BadTag(other)),
        };
        let method = cur.get_str()?;
        let args = parse_args(&mut cur)?;
        let n_kwargs = cur.get_u32()? as usize;
        let mut kwargs = Vec::with_capacity(n_kwargs.min(64));
        for _ in 0..n_kwargs {
            let name = cur.get_str()?;
            let value = Value::decode(&mut cur)?;
            kwargs.push((name, value));
        }
        Ok(Self {
            target,
            method,
            args,
            kwargs,
        })
    }
}

/// CALL_CONSTRUCTOR body.
#[derive(Debug, Clone, PartialEq)]
pub struct CallConstructor {
    /// Class to instantiate.
    pub class: TypeId,
    /// Encoded arguments.
    pub args: Vec<Value>,
}

impl CallConstructor {
    /// Serialise the body.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u32(self.class.0);
        encode_args(&mut buf, &self.args);
        buf.freeze()
    }

    /// Parse the body.
    ///
    /// # Errors
    /// Returns a [`CodecError`] for malformed payloads.
    pub fn parse(payload: &[u8]) -> Result<Self, CodecError> {
        let mut cur = Cursor::new(payload);
        let class = TypeId(cur.get_u32()?);
        let args = parse_args(&mut cur)?;
        Ok(Self { class, args })
    }
}

/// GET_FIELD / SET_FIELD body (the value is absent on reads).
#[derive(Debug, Clone, PartialEq)]
pub struct FieldAccess {
    /// Owning instance.
    pub handle: u64,
    /// Field name.
    pub field: String,
    /// New value, for SET_FIELD.
    pub value: Option<Value>,
}

impl FieldAccess {
    /// Serialise the body.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u64(self.handle);
        put_str(&mut buf, &self.field);
        if let Some(value) = &self.value {
            value.encode(&mut buf);
        }
        buf.freeze()
    }

    /// Parse the body; `has_value` is true for SET_FIELD.
    ///
    /// # Errors
    /// Returns a [`CodecError`] for malformed payloads.
    pub fn parse(payload: &[u8], has_value: bool) -> Result<Self, CodecError> {
        let mut cur = Cursor::new(payload);
        let handle = cur.get_u64()?;
        let field = cur.get_str()?;
        let value = if has_value {
            Some(Value::decode(&mut cur)?)
        } else {
            None
        };
        Ok(Self {
            handle,
            field,
            value,
        })
    }
}

/// INVOKE_PROXY_CALLBACK body.
#[derive(Debug, Clone, PartialEq)]
pub struct ProxyCallback {
    /// Callback-table id on the receiving side.
    pub lambda: u64,
    /// Interface method name; empty for bare callables.
    pub method: String,
    /// Encoded arguments.
    pub args: Vec<Value>,
}

impl ProxyCallback {
    /// Serialise the body.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u64(self.lambda);
        put_str(&mut buf, &self.method);
        encode_args(&mut buf, &self.args);
        buf.freeze()
    }

    /// Parse the body.
    ///
    /// # Errors
    /// Returns a [`CodecError`] for malformed payloads.
    pub fn parse(payload: &[u8]) -> Result<Self, CodecError> {
        let mut cur = Cursor::new(payload);
        let lambda = cur.get_u64()?;
        let method = cur.get_str()?;
        let args = parse_args(&mut cur)?;
        Ok(Self {
            lambda,
            method,
            args,
        })
    }
}

/// How an ACQUIRE_LOCK request is willing to wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireWait {
    /// Never block; fail with `acquire_failed` instead.
    Try,
    /// Block until granted (or deadlock is detected).
    Block,
    /// Block up to the given number of milliseconds.
    TimeoutMillis(u64),
}

/// GET_LOCK / ACQUIRE_LOCK / RELEASE_LOCK body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockRequest {
    /// Lock name.
    pub name: String,
    /// Requested mode.
    pub mode: LockMode,
    /// Wait policy (ACQUIRE_LOCK only).
    pub wait: AcquireWait,
}

impl LockRequest {
    /// Serialise the body.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        put_str(&mut buf, &self.name);
        buf.put_u8(self.mode.code());
        match self.wait {
            AcquireWait::Try => buf.put_u8(0),
            AcquireWait::Block => buf.put_u8(1),
            AcquireWait::TimeoutMillis(ms) => {
                buf.put_u8(2);
                buf.put_u64(ms);
            }
        }
        buf.freeze()
    }

    /// Parse the body.
    ///
    /// # Errors
    /// Returns a [`CodecError`] for malformed payloads.
    pub fn parse(payload: &[u8]) -> Result<Self, CodecError> {
        let mut cur = Cursor::new(payload);
        let name = cur.get_str()?;
        let mode_code = cur.get_u8()?;
        let mode = LockMode::from_code(mode_code).ok_or(CodecError::BadTag(mode_code))?;
        let wait = match cur.get_u8()? {
            0 => AcquireWait::Try,
            1 => AcquireWait::Block,
            2 => AcquireWait::TimeoutMillis(cur.get_u64()?),
            other => return Err(CodecError::BadTag(other)),
        };
        Ok(Self { name, mode, wait })
    }
}

/// Bodies that are a single name: GET_OBJECT_INSTANCE, GET_CLASS.
#[must_use]
pub fn encode_name(name: &str) -> Bytes {
    let mut buf = BytesMut::new();
    put_str(&mut buf, name);
    buf.freeze()
}

/// Parse a single-name body.
///
/// # Errors
/// Returns a [`CodecError`] for malformed payloads.
pub fn parse_name(payload: &[u8]) -> Result<String, CodecError> {
    Cursor::new(payload).get_str()
}

/// CAST body: handle plus target type name.
#[must_use]
pub fn encode_cast(handle: u64, type_name: &str) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u64(handle);
    put_str(&mut buf, type_name);
    buf.freeze()
}

/// Parse a CAST body.
///
/// # Errors
/// Returns a [`CodecError`] for malformed payloads.
pub fn parse_cast(payload: &[u8]) -> Result<(u64, String), CodecError> {
    let mut cur = Cursor::new(payload);
    Ok((cur.get_u64()?, cur.get_str()?))
}

/// Bodies that are a single handle: GET_VALUE, GET_TYPE_DESCRIPTOR (id),
/// COLLECT_FUTURE (request id).
#[must_use]
pub fn encode_u64(value: u64) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u64(value);
    buf.freeze()
}

/// Parse a single-`u64` body.
///
/// # Errors
/// Returns a [`CodecError`] for malformed payloads.
pub fn parse_u64(payload: &[u8]) -> Result<u64, CodecError> {
    Cursor::new(payload).get_u64()
}

/// RELEASE_HANDLE body: handle plus the count being released.
#[must_use]
pub fn encode_release(handle: u64, count: u64) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u64(handle);
    buf.put_u64(count);
    buf.freeze()
}

/// INJECT_SOURCE body: unit name plus source text.
#[must_use]
pub fn encode_inject(name: &str, source: &str) -> Bytes {
    let mut buf = BytesMut::new();
    put_str(&mut buf, name);
    put_str(&mut buf, source);
    buf.freeze()
}

/// Parse an INJECT_SOURCE body.
///
/// # Errors
/// Returns a [`CodecError`] for malformed payloads.
pub fn parse_inject(payload: &[u8]) -> Result<(String, String), CodecError> {
    let mut cur = Cursor::new(payload);
    Ok((cur.get_str()?, cur.get_str()?))
}

fn encode_args(buf: &mut BytesMut, args: &[Value]) {
    buf.put_u32(u32::try_from(args.len()).unwrap_or(u32::MAX));
    for arg in args {
        arg.encode(buf);
    }
}

fn parse_args(cur: &mut Cursor<'_>) -> Result<Vec<Value>, CodecError> {
    let argc = cur.get_u32()? as usize;
    let mut args = Vec::with_capacity(argc.min(64));
    for _ in 0..argc {
        args.push(Value::decode(cur)?);
    }
    Ok(args)
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    fn call_method_round_trips() {
        let body = CallMethod::positional(
            CallTarget::Instance(9),
            "resize",
            vec![Value::I32(800), Value::I32(600)],
        );
        assert_eq!(CallMethod::parse(&body.encode()).unwrap(), body);
        let via_class = CallMethod {
            target: CallTarget::Class(TypeId(40)),
            method: "of".to_owned(),
            args: vec![],
            kwargs: vec![("radix".to_owned(), Value::I8(16))],
        };
        assert_eq!(CallMethod::parse(&via_class.encode()).unwrap(), via_class);
    }

    #[rstest]
    fn lock_request_round_trips() {
        for wait in [
            AcquireWait::Try,
            AcquireWait::Block,
            AcquireWait::TimeoutMillis(250),
        ] {
            let body = LockRequest {
                name: "db".to_owned(),
                mode: LockMode::Shared,
                wait,
            };
            assert_eq!(LockRequest::parse(&body.encode()).unwrap(), body);
        }
    }

    #[rstest]
    fn field_access_round_trips() {
        let read = FieldAccess {
            handle: 3,
            field: "label".to_owned(),
            value: None,
        };
        assert_eq!(FieldAccess::parse(&read.encode(), false).unwrap(), read);
        let write = FieldAccess {
            handle: 3,
            field: "label".to_owned(),
            value: Some(Value::Str("hi".to_owned())),
        };
        assert_eq!(FieldAccess::parse(&write.encode(), true).unwrap(), write);
    }
}
