//! Session startup: the handshake, authentication, and option agreement.
//!
//! The initiator opens with HELLO (version, identity, offered options);
//! the responder authenticates the transport identity, lowers the offer
//! to its own caps, and answers HELLO_ACK. A version difference is a hard
//! refusal: the responder sends ERROR(version_mismatch) and both sides
//! close. The responder may clear option bits and lower the worker count
//! but never raises either, and the shared-memory option is always
//! cleared for peers that do not share this host.

use std::{collections::HashSet, io, path::Path, sync::Arc};

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::{
    codec::put_str,
    error::{ErrorKind, ErrorPayload},
    protocol::{
        Frame, FrameError, HANDSHAKE_TIMEOUT, Hello, HandshakeError, MessageKind, OptionFlags,
        SessionOptions, VERSION, read_frame, write_frame,
    },
    transport::{PeerInfo, Transport},
};

/// Decides whether a peer may open a session: transport metadata plus the
/// identity claimed in HELLO.
pub type AuthPolicy = Arc<dyn Fn(&PeerInfo, &str) -> bool + Send + Sync>;

/// Errors raised during session startup.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The peer refused the handshake (version mismatch, failed auth).
    #[error("handshake refused: {}: {}", .0.kind.name(), .0.message)]
    Refused(ErrorPayload),
    /// The peer's handshake payload was malformed.
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
    /// No handshake arrived within [`HANDSHAKE_TIMEOUT`].
    #[error("handshake timed out")]
    Timeout,
    /// The peer broke the handshake sequence.
    #[error("handshake protocol error: {0}")]
    Protocol(String),
    /// Transport failure.
    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// A completed handshake: the transport handed back for the engine, the
/// peer's HELLO, and the agreed options.
#[derive(Debug)]
pub struct Established {
    /// Transport, ready for the dispatch engine.
    pub transport: Transport,
    /// The peer's HELLO (or HELLO_ACK) contents.
    pub peer_hello: Hello,
    /// Options both sides will honour.
    pub options: SessionOptions,
}

fn error_frame(payload: &ErrorPayload) -> Frame {
    let mut buf = BytesMut::new();
    buf.put_u8(payload.kind.code());
    put_str(&mut buf, &payload.message);
    crate::codec::put_blob(&mut buf, &payload.stack);
    Frame::new(MessageKind::Error, 0, 0, buf.freeze())
}

/// Run the initiator (client) side of the handshake.
///
/// # Errors
/// Returns [`SessionError::Refused`] when the responder answers with an
/// ERROR frame, and protocol/transport failures otherwise.
pub async fn initiate(
    transport: Transport,
    identity: &str,
    offer: SessionOptions,
) -> Result<Established, SessionError> {
    let (mut reader, mut writer, info, closed) = transport.into_parts();
    let hello = Hello {
        version: VERSION,
        identity: identity.to_owned(),
        options: offer.clone(),
    };
    write_frame(
        &mut writer,
        &Frame::new(MessageKind::Hello, 0, 0, hello.to_bytes()),
    )
    .await?;
    let reply = timeout(HANDSHAKE_TIMEOUT, read_frame(&mut reader))
        .await
        .map_err(|_| SessionError::Timeout)??;
    match reply.kind {
        MessageKind::HelloAck => {
            let ack = Hello::parse(&reply.payload)?;
            let agreed = ack.options.clone();
            if agreed.num_workers > offer.num_workers
                || !offer.flags.contains(agreed.flags)
            {
                return Err(SessionError::Protocol(
                    "responder raised options beyond the offer".to_owned(),
                ));
            }
            info!(peer = %info.address, workers = agreed.num_workers, "session established");
            Ok(Established {
                transport: Transport::from_parts(reader, writer, info, closed),
                peer_hello: ack,
                options: agreed,
            })
        }
        MessageKind::Error => {
            let payload = parse_error(&reply.payload);
            Err(SessionError::Refused(payload))
        }
        other => Err(SessionError::Protocol(format!(
            "expected HELLO_ACK, got {other:?}"
        ))),
    }
}

/// Server-side handshake parameters.
#[derive(Clone)]
pub struct Responder {
    /// Identity announced in HELLO_ACK.
    pub identity: String,
    /// The server's own option ceiling; offers are lowered to fit.
    pub caps: SessionOptions,
    /// Authentication policy; `None` admits everyone.
    pub auth: Option<AuthPolicy>,
}

impl std::fmt::Debug for Responder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Responder")
            .field("identity", &self.identity)
            .field("caps", &self.caps)
            .finish_non_exhaustive()
    }
}

/// Run the responder (server) side of the handshake.
///
/// # Errors
/// Returns [`SessionError::Refused`] after answering a refusal (version
/// mismatch or failed authentication), and protocol/transport failures
/// otherwise.
pub async fn respond(
    transport: Transport,
    responder: &Responder,
) -> Result<Established, SessionError> {
    let (mut reader, mut writer, info, closed) = transport.into_parts();
    let frame = timeout(HANDSHAKE_TIMEOUT, read_frame(&mut reader))
        .await
        .map_err(|_| SessionError::Timeout)??;
    if frame.kind != MessageKind::Hello {
        return Err(SessionError::Protocol(format!(
            "expected HELLO, got {:?}",
            frame.kind
        )));
    }
    let hello = match Hello::parse(&frame.payload) {
        Ok(hello) => hello,
        Err(HandshakeError::UnsupportedVersion(theirs)) => {
            let payload = ErrorPayload::new(
                ErrorKind::VersionMismatch,
                format!("server speaks version {VERSION}, peer sent {theirs}"),
            );
            warn!(peer = %info.address, theirs, "refusing version-mismatched peer");
            let _ = write_frame(&mut writer, &error_frame(&payload)).await;
            return Err(SessionError::Refused(payload));
        }
        Err(e) => return Err(e.into()),
    };
    if let Some(auth) = &responder.auth {
        if !auth(&info, &hello.identity) {
            let payload = ErrorPayload::new(
                ErrorKind::AuthFailed,
                format!("identity '{}' rejected", hello.identity),
            );
            warn!(peer = %info.address, identity = %hello.identity, "authentication failed");
            let _ = write_frame(&mut writer, &error_frame(&payload)).await;
            return Err(SessionError::Refused(payload));
        }
    }
    let mut agreed = hello.options.capped_by(&responder.caps);
    if !info.localhost {
        // The fast path is a filesystem hand-off; it cannot cross hosts.
        agreed.flags &= !OptionFlags::USE_SHM;
    }
    let ack = Hello {
        version: VERSION,
        identity: responder.identity.clone(),
        options: agreed.clone(),
    };
    write_frame(
        &mut writer,
        &Frame::new(MessageKind::HelloAck, 0, 0, ack.to_bytes()),
    )
    .await?;
    debug!(peer = %info.address, identity = %hello.identity, workers = agreed.num_workers,
           "handshake complete");
    Ok(Established {
        transport: Transport::from_parts(reader, writer, info, closed),
        peer_hello: hello,
        options: agreed,
    })
}

fn parse_error(payload: &[u8]) -> ErrorPayload {
    let mut cur = crate::codec::Cursor::new(payload);
    let parsed = (|| -> Result<ErrorPayload, crate::codec::CodecError> {
        let code = cur.get_u8()?;
        let kind =
            ErrorKind::from_code(code).ok_or(crate::codec::CodecError::BadTag(code))?;
        Ok(ErrorPayload {
            kind,
            message: cur.get_str()?,
            stack: cur.get_blob()?,
        })
    })();
    parsed.unwrap_or_else(|_| {
        ErrorPayload::new(ErrorKind::ProtocolError, "malformed refusal payload")
    })
}

/// Load an allow-list file: one fully-qualified class name per line,
/// blank lines and `#` comments ignored.
///
/// # Errors
/// Propagates filesystem failures.
pub fn load_allow_list(path: &Path) -> io::Result<HashSet<String>> {
    let text = std::fs::read_to_string(path)?;
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_owned)
        .collect())
}

/// Raw bytes of a HELLO carrying an arbitrary version, for tests and
/// tooling that need to provoke a refusal.
#[must_use]
pub fn hello_bytes_with_version(version: u32, identity: &str, options: &SessionOptions) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_slice(crate::protocol::PROTOCOL_ID);
    buf.put_u32(version);
    put_str(&mut buf, identity);
    buf.put_u32(options.num_workers);
    buf.put_u8(options.flags.bits());
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(workers: u32, flags: OptionFlags) -> SessionOptions {
        SessionOptions {
            num_workers: workers,
            flags,
        }
    }

    fn default_responder() -> Responder {
        Responder {
            identity: "server".to_owned(),
            caps: caps(8, OptionFlags::all()),
            auth: None,
        }
    }

    #[tokio::test]
    async fn handshake_agrees_on_lowered_options() {
        let (a, b) = Transport::pair(4096);
        let responder = Responder {
            caps: caps(2, OptionFlags::USE_SHM | OptionFlags::CALLBACKS),
            ..default_responder()
        };
        let server = tokio::spawn(async move { respond(b, &responder).await });
        let client = initiate(
            a,
            "alice",
            caps(6, OptionFlags::USE_SHM | OptionFlags::CALLBACKS),
        )
        .await
        .unwrap();
        let server = server.await.unwrap().unwrap();
        assert_eq!(client.options.num_workers, 2);
        assert_eq!(server.options, client.options);
        assert_eq!(server.peer_hello.identity, "alice");
    }

    #[tokio::test]
    async fn version_mismatch_is_refused() {
        let (a, b) = Transport::pair(4096);
        let responder = default_responder();
        let server = tokio::spawn(async move { respond(b, &responder).await });
        // Hand-craft a HELLO from the future.
        let (mut reader, mut writer, _, _) = a.into_parts();
        let bytes = hello_bytes_with_version(VERSION + 1, "time-traveller", &caps(2, OptionFlags::empty()));
        write_frame(&mut writer, &Frame::new(MessageKind::Hello, 0, 0, bytes))
            .await
            .unwrap();
        let reply = read_frame(&mut reader).await.unwrap();
        assert_eq!(reply.kind, MessageKind::Error);
        let err = server.await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            SessionError::Refused(payload) if payload.kind == ErrorKind::VersionMismatch
        ));
    }

    #[tokio::test]
    async fn auth_policy_can_reject() {
        let (a, b) = Transport::pair(4096);
        let responder = Responder {
            auth: Some(Arc::new(|_info, identity| identity == "alice")),
            ..default_responder()
        };
        let server = tokio::spawn(async move { respond(b, &responder).await });
        let err = initiate(a, "mallory", SessionOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SessionError::Refused(payload) if payload.kind == ErrorKind::AuthFailed
        ));
        assert!(server.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn allow_list_file_parses() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("allow.txt");
        std::fs::write(&path, "# trusted classes\ndemo.Calculator\n\n  demo.Widget  \n").unwrap();
        let list = load_allow_list(&path).unwrap();
        assert_eq!(list.len(), 2);
        assert!(list.contains("demo.Calculator"));
        assert!(list.contains("demo.Widget"));
    }
}
