//! Constants and framing for the bridge wire protocol.
//!
//! Every message travels as one length-framed unit:
//! `[u32 length][u8 kind][u64 request-id][u64 logical-thread-id][payload]`,
//! all integers big-endian. The length counts everything after the length
//! field itself. There is no in-protocol backward compatibility: any change
//! to the wire bumps [`VERSION`] and a mismatch is a hard refusal at
//! handshake time.

use std::time::Duration;

use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{Decoder, Encoder};

/// Protocol version spoken by this build. Incremented on any wire change.
pub const VERSION: u32 = 3;

/// Fixed bytes that open every HELLO payload.
pub const PROTOCOL_ID: &[u8; 4] = b"JNUS";

/// Bytes of frame metadata after the length field: kind + request id +
/// logical-thread id.
pub const FRAME_META_LEN: usize = 1 + 8 + 8;

/// Upper bound on a single frame's length field (16 MiB).
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Timeout for the initial handshake exchange.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Message kinds carried in the frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    /// Initiator's version/identity/options offer.
    Hello = 0,
    /// Responder's accepted (possibly lowered) options.
    HelloAck = 1,
    /// Resolve a server-published named instance to a handle.
    GetObjectInstance = 2,
    /// Resolve a class name to its type id.
    GetClass = 3,
    /// Fetch the full descriptor for a type id.
    GetTypeDescriptor = 4,
    /// Invoke a method on a handle (or a static on a class id).
    CallMethod = 5,
    /// Invoke a constructor on a class id.
    CallConstructor = 6,
    /// Read a public field.
    GetField = 7,
    /// Write a public field.
    SetField = 8,
    /// Server-to-client invocation of an exported callable.
    InvokeProxyCallback = 9,
    /// Successful outcome for the echoed request id.
    Result = 10,
    /// Failed outcome for the echoed request id.
    Error = 11,
    /// Count-carrying refcount decrement for an exported handle.
    ReleaseHandle = 12,
    /// Checked cast of a handle to a named type.
    Cast = 13,
    /// By-value snapshot of a remote object.
    GetValue = 14,
    /// Hand source text to the optional injection hook.
    InjectSource = 15,
    /// Ensure a named lock exists.
    GetLock = 16,
    /// Acquire a named lock in the requested mode.
    AcquireLock = 17,
    /// Release a named lock.
    ReleaseLock = 18,
    /// Invoke without waiting; the outcome parks in the future table.
    AsyncCall = 19,
    /// Collect (and forget) a parked async outcome.
    CollectFuture = 20,
    /// Liveness probe.
    Ping = 21,
    /// Orderly shutdown notice.
    Goodbye = 22,
}

impl MessageKind {
    /// Decode a kind byte.
    #[must_use]
    pub const fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => Self::Hello,
            1 => Self::HelloAck,
            2 => Self::GetObjectInstance,
            3 => Self::GetClass,
            4 => Self::GetTypeDescriptor,
            5 => Self::CallMethod,
            6 => Self::CallConstructor,
            7 => Self::GetField,
            8 => Self::SetField,
            9 => Self::InvokeProxyCallback,
            10 => Self::Result,
            11 => Self::Error,
            12 => Self::ReleaseHandle,
            13 => Self::Cast,
            14 => Self::GetValue,
            15 => Self::InjectSource,
            16 => Self::GetLock,
            17 => Self::AcquireLock,
            18 => Self::ReleaseLock,
            19 => Self::AsyncCall,
            20 => Self::CollectFuture,
            21 => Self::Ping,
            22 => Self::Goodbye,
            _ => return None,
        })
    }

    /// Wire code for this kind.
    #[must_use]
    pub const fn code(self) -> u8 { self as u8 }

    /// Whether this kind is a reply correlated to an earlier request.
    #[must_use]
    pub const fn is_reply(self) -> bool { matches!(self, Self::Result | Self::Error) }
}

/// Errors raised by frame reading and writing.
#[derive(Debug, Error)]
pub enum FrameError {
    /// Length field exceeds [`MAX_FRAME_LEN`] or is shorter than the
    /// fixed metadata.
    #[error("invalid frame length {0}")]
    BadLength(u32),
    /// Kind byte is not a known [`MessageKind`].
    #[error("unknown message kind {0}")]
    UnknownKind(u8),
    /// I/O failure on the underlying transport.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// One decoded wire frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Message kind.
    pub kind: MessageKind,
    /// Request id; replies echo the request they answer.
    pub request_id: u64,
    /// Logical-thread id the sender was executing under.
    pub logical_id: u64,
    /// Kind-specific body.
    pub payload: Bytes,
}

impl Frame {
    /// Build a frame with the given coordinates and body.
    #[must_use]
    pub fn new(kind: MessageKind, request_id: u64, logical_id: u64, payload: Bytes) -> Self {
        Self {
            kind,
            request_id,
            logical_id,
            payload,
        }
    }

    /// Serialise the frame, length prefix included.
    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        let len = FRAME_META_LEN + self.payload.len();
        let mut buf = BytesMut::with_capacity(4 + len);
        buf.put_u32(u32::try_from(len).unwrap_or(u32::MAX));
        buf.put_u8(self.kind.code());
        buf.put_u64(self.request_id);
        buf.put_u64(self.logical_id);
        buf.put_slice(&self.payload);
        buf.freeze()
    }
}

/// Read one frame from the stream.
///
/// # Errors
/// Returns [`FrameError::BadLength`] for an out-of-range length field,
/// [`FrameError::UnknownKind`] for an unrecognised kind byte, and
/// [`FrameError::Io`] for transport failures (including EOF).
pub async fn read_frame<R: AsyncRead + Unpin>(rdr: &mut R) -> Result<Frame, FrameError> {
    let len = rdr.read_u32().await?;
    if (len as usize) < FRAME_META_LEN || len as usize > MAX_FRAME_LEN {
        return Err(FrameError::BadLength(len));
    }
    let kind_code = rdr.read_u8().await?;
    let kind = MessageKind::from_code(kind_code).ok_or(FrameError::UnknownKind(kind_code))?;
    let request_id = rdr.read_u64().await?;
    let logical_id = rdr.read_u64().await?;
    let mut payload = vec![0u8; len as usize - FRAME_META_LEN];
    rdr.read_exact(&mut payload).await?;
    Ok(Frame {
        kind,
        request_id,
        logical_id,
        payload: Bytes::from(payload),
    })
}

/// Write one frame to the stream.
///
/// # Errors
/// Propagates transport I/O failures.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    wtr: &mut W,
    frame: &Frame,
) -> Result<(), FrameError> {
    wtr.write_all(&frame.to_bytes()).await?;
    wtr.flush().await?;
    Ok(())
}

/// Length-delimited frame codec for the steady-state dispatch loop.
///
/// The handshake uses the plain [`read_frame`]/[`write_frame`] helpers;
/// once a session is up, the reader task drives a `FramedRead` over this
/// codec instead.
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        if src.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]);
        if (len as usize) < FRAME_META_LEN || len as usize > MAX_FRAME_LEN {
            return Err(FrameError::BadLength(len));
        }
        let total = 4 + len as usize;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }
        src.advance(4);
        let kind_code = src.get_u8();
        let kind = MessageKind::from_code(kind_code).ok_or(FrameError::UnknownKind(kind_code))?;
        let request_id = src.get_u64();
        let logical_id = src.get_u64();
        let payload = src.split_to(len as usize - FRAME_META_LEN).freeze();
        Ok(Some(Frame {
            kind,
            request_id,
            logical_id,
            payload,
        }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), FrameError> {
        dst.extend_from_slice(&frame.to_bytes());
        Ok(())
    }
}

bitflags! {
    /// Boolean session options advertised in HELLO and confirmed in
    /// HELLO_ACK. The responder may clear bits but never set ones the
    /// initiator did not offer.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OptionFlags: u8 {
        /// Shared-memory fast path for large numeric arrays.
        const USE_SHM = 1 << 0;
        /// Class access restricted to the server's allow-list.
        const ALLOW_LIST = 1 << 1;
        /// Client-side callables may cross the wire as proxies.
        const CALLBACKS = 1 << 2;
    }
}

/// Negotiated (or offered) session parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOptions {
    /// Minimum worker count for the request pool; callbacks need >= 2.
    pub num_workers: u32,
    /// Boolean option bits.
    pub flags: OptionFlags,
}

impl SessionOptions {
    /// Whether callables may cross the wire under these options.
    #[must_use]
    pub fn callbacks_enabled(&self) -> bool {
        self.flags.contains(OptionFlags::CALLBACKS) && self.num_workers >= 2
    }

    /// Clamp this offer to the responder's own limits, never raising.
    #[must_use]
    pub fn capped_by(&self, cap: &Self) -> Self {
        Self {
            num_workers: self.num_workers.min(cap.num_workers),
            flags: self.flags & cap.flags,
        }
    }
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            num_workers: 2,
            flags: OptionFlags::USE_SHM | OptionFlags::CALLBACKS,
        }
    }
}

/// HELLO payload: version, peer identity, offered options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hello {
    /// Protocol version of the sender.
    pub version: u32,
    /// Self-reported peer identity (the transport identity is
    /// authoritative for authentication).
    pub identity: String,
    /// Offered options.
    pub options: SessionOptions,
}

/// Errors raised while parsing a handshake payload.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HandshakeError {
    /// Payload does not open with [`PROTOCOL_ID`].
    #[error("invalid protocol id")]
    InvalidProtocol,
    /// Versions differ; carries the peer's version.
    #[error("unsupported version {0}")]
    UnsupportedVersion(u32),
    /// Payload is truncated or malformed.
    #[error("malformed handshake")]
    Malformed,
}

impl Hello {
    /// Serialise the HELLO payload.
    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_slice(PROTOCOL_ID);
        buf.put_u32(self.version);
        crate::codec::put_str(&mut buf, &self.identity);
        buf.put_u32(self.options.num_workers);
        buf.put_u8(self.options.flags.bits());
        buf.freeze()
    }

    /// Parse a HELLO (or HELLO_ACK) payload.
    ///
    /// # Errors
    /// Returns [`HandshakeError::InvalidProtocol`] when the magic is wrong,
    /// [`HandshakeError::UnsupportedVersion`] when the version differs from
    /// [`VERSION`], and [`HandshakeError::Malformed`] for truncation.
    pub fn parse(payload: &[u8]) -> Result<Self, HandshakeError> {
        let mut cur = crate::codec::Cursor::new(payload);
        let magic = cur.take(4).map_err(|_| HandshakeError::Malformed)?;
        if magic != PROTOCOL_ID {
            return Err(HandshakeError::InvalidProtocol);
        }
        let version = cur.get_u32().map_err(|_| HandshakeError::Malformed)?;
        if version != VERSION {
            return Err(HandshakeError::UnsupportedVersion(version));
        }
        let identity = cur.get_str().map_err(|_| HandshakeError::Malformed)?;
        let num_workers = cur.get_u32().map_err(|_| HandshakeError::Malformed)?;
        let bits = cur.get_u8().map_err(|_| HandshakeError::Malformed)?;
        Ok(Self {
            version,
            identity,
            options: SessionOptions {
                num_workers,
                flags: OptionFlags::from_bits_truncate(bits),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    fn kind_codes_round_trip() {
        for code in 0..=22u8 {
            let kind = MessageKind::from_code(code).expect("valid code");
            assert_eq!(kind.code(), code);
        }
        assert!(MessageKind::from_code(23).is_none());
    }

    #[tokio::test]
    async fn frame_round_trip() {
        let frame = Frame::new(
            MessageKind::CallMethod,
            7,
            42,
            Bytes::from_static(b"payload"),
        );
        let (mut a, mut b) = tokio::io::duplex(256);
        write_frame(&mut a, &frame).await.unwrap();
        let rx = read_frame(&mut b).await.unwrap();
        assert_eq!(frame, rx);
    }

    #[rstest]
    fn codec_decodes_across_split_buffers() {
        let frame = Frame::new(MessageKind::Ping, 3, 9, Bytes::from_static(b"xyz"));
        let wire = frame.to_bytes();
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&wire[..6]);
        assert!(codec.decode(&mut buf).unwrap().is_none(), "incomplete frame");
        buf.extend_from_slice(&wire[6..]);
        let decoded = codec.decode(&mut buf).unwrap().expect("complete frame");
        assert_eq!(decoded, frame);
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn oversized_length_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let bad = u32::try_from(MAX_FRAME_LEN).unwrap() + 1;
        tokio::io::AsyncWriteExt::write_u32(&mut a, bad)
            .await
            .unwrap();
        assert!(matches!(
            read_frame(&mut b).await,
            Err(FrameError::BadLength(_))
        ));
    }

    #[rstest]
    fn hello_round_trip() {
        let hello = Hello {
            version: VERSION,
            identity: "tester".to_owned(),
            options: SessionOptions {
                num_workers: 4,
                flags: OptionFlags::USE_SHM | OptionFlags::CALLBACKS,
            },
        };
        let parsed = Hello::parse(&hello.to_bytes()).unwrap();
        assert_eq!(parsed, hello);
    }

    #[rstest]
    fn hello_rejects_foreign_version() {
        let hello = Hello {
            version: VERSION + 1,
            identity: String::new(),
            options: SessionOptions::default(),
        };
        assert_eq!(
            Hello::parse(&hello.to_bytes()),
            Err(HandshakeError::UnsupportedVersion(VERSION + 1))
        );
    }

    #[rstest]
    fn responder_caps_never_raise() {
        let offer = SessionOptions {
            num_workers: 8,
            flags: OptionFlags::USE_SHM | OptionFlags::CALLBACKS,
        };
        let cap = SessionOptions {
            num_workers: 2,
            flags: OptionFlags::CALLBACKS,
        };
        let agreed = offer.capped_by(&cap);
        assert_eq!(agreed.num_workers, 2);
        assert_eq!(agreed.flags, OptionFlags::CALLBACKS);
    }
}
