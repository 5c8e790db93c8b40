//! Primitive wire encoding and the tagged value union.
//!
//! All integers are big-endian; strings and byte blobs are length-prefixed
//! with a `u32`. Compound values carry a one-byte kind tag followed by a
//! kind-specific body. The [`Cursor`] reader never indexes past the end of
//! its slice; truncation surfaces as [`CodecError::ShortBuffer`].

use bytes::{BufMut, BytesMut};
use thiserror::Error;

use crate::{error::ErrorKind, error::ErrorPayload, types::TypeId};

/// Maximum nesting depth accepted when decoding compound values.
pub const MAX_VALUE_DEPTH: usize = 32;

/// Errors raised while encoding or decoding wire primitives.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    /// Buffer ended before the expected data.
    #[error("buffer too short")]
    ShortBuffer,
    /// Unknown value or element tag byte.
    #[error("unknown tag {0}")]
    BadTag(u8),
    /// String body is not valid UTF-8.
    #[error("invalid UTF-8 string")]
    BadUtf8,
    /// Compound value nests deeper than [`MAX_VALUE_DEPTH`].
    #[error("value nested too deeply")]
    TooDeep,
}

/// Bounds-checked reader over a byte slice.
#[derive(Debug)]
pub struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    /// Wrap a slice for reading from the start.
    #[must_use]
    pub const fn new(buf: &'a [u8]) -> Self { Self { buf, pos: 0 } }

    /// Bytes not yet consumed.
    #[must_use]
    pub const fn remaining(&self) -> usize { self.buf.len() - self.pos }

    /// Consume `n` bytes and return them.
    ///
    /// # Errors
    /// Returns [`CodecError::ShortBuffer`] if fewer than `n` bytes remain.
    pub fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        let end = self.pos.checked_add(n).ok_or(CodecError::ShortBuffer)?;
        let slice = self.buf.get(self.pos..end).ok_or(CodecError::ShortBuffer)?;
        self.pos = end;
        Ok(slice)
    }

    /// Read one byte.
    ///
    /// # Errors
    /// Returns [`CodecError::ShortBuffer`] at end of input.
    pub fn get_u8(&mut self) -> Result<u8, CodecError> {
        let b = self.take(1)?;
        Ok(b[0])
    }

    /// Read a big-endian `u16`.
    ///
    /// # Errors
    /// Returns [`CodecError::ShortBuffer`] at end of input.
    pub fn get_u16(&mut self) -> Result<u16, CodecError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    /// Read a big-endian `u32`.
    ///
    /// # Errors
    /// Returns [`CodecError::ShortBuffer`] at end of input.
    pub fn get_u32(&mut self) -> Result<u32, CodecError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Read a big-endian `u64`.
    ///
    /// # Errors
    /// Returns [`CodecError::ShortBuffer`] at end of input.
    pub fn get_u64(&mut self) -> Result<u64, CodecError> {
        let b = self.take(8)?;
        Ok(u64::from_be_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    /// Read a big-endian `i64`.
    ///
    /// # Errors
    /// Returns [`CodecError::ShortBuffer`] at end of input.
    pub fn get_i64(&mut self) -> Result<i64, CodecError> {
        Ok(self.get_u64()? as i64)
    }

    /// Read a big-endian `f64`.
    ///
    /// # Errors
    /// Returns [`CodecError::ShortBuffer`] at end of input.
    pub fn get_f64(&mut self) -> Result<f64, CodecError> {
        Ok(f64::from_bits(self.get_u64()?))
    }

    /// Read a big-endian `f32`.
    ///
    /// # Errors
    /// Returns [`CodecError::ShortBuffer`] at end of input.
    pub fn get_f32(&mut self) -> Result<f32, CodecError> {
        Ok(f32::from_bits(self.get_u32()?))
    }

    /// Read a length-prefixed byte blob.
    ///
    /// # Errors
    /// Returns [`CodecError::ShortBuffer`] on truncation.
    pub fn get_blob(&mut self) -> Result<Vec<u8>, CodecError> {
        let len = self.get_u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    /// Read a length-prefixed UTF-8 string.
    ///
    /// # Errors
    /// Returns [`CodecError::ShortBuffer`] on truncation and
    /// [`CodecError::BadUtf8`] for invalid string bodies.
    pub fn get_str(&mut self) -> Result<String, CodecError> {
        let len = self.get_u32()? as usize;
        let raw = self.take(len)?;
        String::from_utf8(raw.to_vec()).map_err(|_| CodecError::BadUtf8)
    }
}

/// Append a length-prefixed UTF-8 string.
pub fn put_str(buf: &mut BytesMut, s: &str) {
    buf.put_u32(u32::try_from(s.len()).unwrap_or(u32::MAX));
    buf.put_slice(s.as_bytes());
}

/// Append a length-prefixed byte blob.
pub fn put_blob(buf: &mut BytesMut, b: &[u8]) {
    buf.put_u32(u32::try_from(b.len()).unwrap_or(u32::MAX));
    buf.put_slice(b);
}

/// Element kinds for homogeneous numeric arrays, on the wire and in the
/// shared-memory header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ElementKind {
    /// One byte per element, 0 or 1.
    Bool = 0,
    /// Signed 8-bit integer.
    I8 = 1,
    /// Signed 16-bit integer.
    I16 = 2,
    /// Signed 32-bit integer.
    I32 = 3,
    /// Signed 64-bit integer.
    I64 = 4,
    /// IEEE-754 single.
    F32 = 5,
    /// IEEE-754 double.
    F64 = 6,
}

impl ElementKind {
    /// Decode an element-kind byte.
    #[must_use]
    pub const fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => Self::Bool,
            1 => Self::I8,
            2 => Self::I16,
            3 => Self::I32,
            4 => Self::I64,
            5 => Self::F32,
            6 => Self::F64,
            _ => return None,
        })
    }

    /// Wire code for this element kind.
    #[must_use]
    pub const fn code(self) -> u8 { self as u8 }

    /// Bytes per element.
    #[must_use]
    pub const fn width(self) -> usize {
        match self {
            Self::Bool | Self::I8 => 1,
            Self::I16 => 2,
            Self::I32 | Self::F32 => 4,
            Self::I64 | Self::F64 => 8,
        }
    }
}

mod tag {
    pub const NULL: u8 = 0;
    pub const BOOL: u8 = 1;
    pub const I8: u8 = 2;
    pub const I16: u8 = 3;
    pub const I32: u8 = 4;
    pub const I64: u8 = 5;
    pub const F32: u8 = 6;
    pub const F64: u8 = 7;
    pub const STR: u8 = 8;
    pub const BYTES: u8 = 9;
    pub const HANDLE: u8 = 10;
    pub const ARRAY: u8 = 11;
    pub const LIST: u8 = 12;
    pub const MAP: u8 = 13;
    pub const SHM_ARRAY: u8 = 14;
    pub const LAMBDA: u8 = 15;
    pub const EXCEPTION: u8 = 16;
}

/// A value as it crosses the wire: a tagged union over primitives,
/// handles, by-value containers, shared-memory array references, exported
/// callables, and exception payloads.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// The absent value.
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
    /// UTF-8 string, by value.
    Str(String),
    /// Raw byte blob, by value.
    Bytes(Vec<u8>),
    /// Reference to an object exported by the sending side.
    Handle {
        /// Export-table id on the owning side.
        handle: u64,
        /// Ambient type so the receiver can pick a shim.
        type_id: TypeId,
    },
    /// Homogeneous numeric array passed inline, by value.
    Array {
        /// Element kind; the byte length is `data.len()`.
        kind: ElementKind,
        /// Packed big-endian element bytes.
        data: Vec<u8>,
    },
    /// Heterogeneous sequence, by value.
    List(Vec<Value>),
    /// Key/value mapping, by value; entries keep insertion order.
    Map(Vec<(Value, Value)>),
    /// Homogeneous numeric array parked in the shared-memory region.
    ShmArray {
        /// File path inside the shared region; the reader unlinks it.
        path: String,
        /// Element kind recorded in the file header.
        kind: ElementKind,
        /// Element count.
        len: u64,
    },
    /// A callable exported by the sending side.
    Lambda {
        /// Callback-table id on the owning side.
        handle: u64,
        /// Number of positional parameters the callable accepts.
        arity: u8,
    },
    /// An error travelling as a value (callback failure propagation).
    Exception(ErrorPayload),
}

impl Value {
    /// Append the encoded value to `buf`.
    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            Self::Null => buf.put_u8(tag::NULL),
            Self::Bool(v) => {
                buf.put_u8(tag::BOOL);
                buf.put_u8(u8::from(*v));
            }
            Self::I8(v) => {
                buf.put_u8(tag::I8);
                buf.put_i8(*v);
            }
            Self::I16(v) => {
                buf.put_u8(tag::I16);
                buf.put_i16(*v);
            }
            Self::I32(v) => {
                buf.put_u8(tag::I32);
                buf.put_i32(*v);
            }
            Self::I64(v) => {
                buf.put_u8(tag::I64);
                buf.put_i64(*v);
            }
            Self::F32(v) => {
                buf.put_u8(tag::F32);
                buf.put_u32(v.to_bits());
            }
            Self::F64(v) => {
                buf.put_u8(tag::F64);
                buf.put_u64(v.to_bits());
            }
            Self::Str(s) => {
                buf.put_u8(tag::STR);
                put_str(buf, s);
            }
            Self::Bytes(b) => {
                buf.put_u8(tag::BYTES);
                put_blob(buf, b);
            }
            Self::Handle { handle, type_id } => {
                buf.put_u8(tag::HANDLE);
                buf.put_u64(*handle);
                buf.put_u32(type_id.0);
            }
            Self::Array { kind, data } => {
                buf.put_u8(tag::ARRAY);
                buf.put_u8(kind.code());
                put_blob(buf, data);
            }
            Self::List(items) => {
                buf.put_u8(tag::LIST);
                buf.put_u32(u32::try_from(items.len()).unwrap_or(u32::MAX));
                for item in items {
                    item.encode(buf);
                }
            }
            Self::Map(entries) => {
                buf.put_u8(tag::MAP);
                buf.put_u32(u32::try_from(entries.len()).unwrap_or(u32::MAX));
                for (k, v) in entries {
                    k.encode(buf);
                    v.encode(buf);
                }
            }
            Self::ShmArray { path, kind, len } => {
                buf.put_u8(tag::SHM_ARRAY);
                put_str(buf, path);
                buf.put_u8(kind.code());
                buf.put_u64(*len);
            }
            Self::Lambda { handle, arity } => {
                buf.put_u8(tag::LAMBDA);
                buf.put_u64(*handle);
                buf.put_u8(*arity);
            }
            Self::Exception(payload) => {
                buf.put_u8(tag::EXCEPTION);
                buf.put_u8(payload.kind.code());
                put_str(buf, &payload.message);
                put_blob(buf, &payload.stack);
            }
        }
    }

    /// Encode into a fresh buffer.
    #[must_use]
    pub fn to_bytes(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf
    }

    /// Decode one value from the cursor.
    ///
    /// # Errors
    /// Returns a [`CodecError`] on truncation, unknown tags, invalid UTF-8,
    /// or nesting past [`MAX_VALUE_DEPTH`].
    pub fn decode(cur: &mut Cursor<'_>) -> Result<Self, CodecError> {
        Self::decode_at(cur, 0)
    }

    fn decode_at(cur: &mut Cursor<'_>, depth: usize) -> Result<Self, CodecError> {
        if depth > MAX_VALUE_DEPTH {
            return Err(CodecError::TooDeep);
        }
        let t = cur.get_u8()?;
        Ok(match t {
            tag::NULL => Self::Null,
            tag::BOOL => Self::Bool(cur.get_u8()? != 0),
            tag::I8 => Self::I8(cur.get_u8()? as i8),
            tag::I16 => Self::I16(cur.get_u16()? as i16),
            tag::I32 => Self::I32(cur.get_u32()? as i32),
            tag::I64 => Self::I64(cur.get_i64()?),
            tag::F32 => Self::F32(cur.get_f32()?),
            tag::F64 => Self::F64(cur.get_f64()?),
            tag::STR => Self::Str(cur.get_str()?),
            tag::BYTES => Self::Bytes(cur.get_blob()?),
            tag::HANDLE => Self::Handle {
                handle: cur.get_u64()?,
                type_id: TypeId(cur.get_u32()?),
            },
            tag::ARRAY => {
                let code = cur.get_u8()?;
                let kind = ElementKind::from_code(code).ok_or(CodecError::BadTag(code))?;
                Self::Array {
                    kind,
                    data: cur.get_blob()?,
                }
            }
            tag::LIST => {
                let len = cur.get_u32()? as usize;
                let mut items = Vec::with_capacity(len.min(1024));
                for _ in 0..len {
                    items.push(Self::decode_at(cur, depth + 1)?);
                }
                Self::List(items)
            }
            tag::MAP => {
                let len = cur.get_u32()? as usize;
                let mut entries = Vec::with_capacity(len.min(1024));
                for _ in 0..len {
                    let k = Self::decode_at(cur, depth + 1)?;
                    let v = Self::decode_at(cur, depth + 1)?;
                    entries.push((k, v));
                }
                Self::Map(entries)
            }
            tag::SHM_ARRAY => {
                let path = cur.get_str()?;
                let code = cur.get_u8()?;
                let kind = ElementKind::from_code(code).ok_or(CodecError::BadTag(code))?;
                Self::ShmArray {
                    path,
                    kind,
                    len: cur.get_u64()?,
                }
            }
            tag::LAMBDA => Self::Lambda {
                handle: cur.get_u64()?,
                arity: cur.get_u8()?,
            },
            tag::EXCEPTION => {
                let code = cur.get_u8()?;
                let kind = ErrorKind::from_code(code).ok_or(CodecError::BadTag(code))?;
                let message = cur.get_str()?;
                let stack = cur.get_blob()?;
                Self::Exception(ErrorPayload {
                    kind,
                    message,
                    stack,
                })
            }
            other => return Err(CodecError::BadTag(other)),
        })
    }
}
