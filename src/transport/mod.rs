//! Transport variants carrying the framed byte stream.
//!
//! A transport is an opaque bidirectional byte stream plus peer metadata:
//! the codec and dispatch layers never see anything transport-specific.
//! Variants cover a network socket, an in-process piped pair (for an
//! embedded server and for tests), and a child process speaking the
//! protocol over its standard streams. Closure is sticky: once the closed
//! flag is set it stays set, and every layer above observes it.
//!
//! TLS termination is an integration point, not an implementation here: a
//! wrapped stream can be handed to [`Transport::from_stream`] with the
//! authenticated identity filled in.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{TcpStream, ToSocketAddrs},
    process::Child,
};

/// Peer metadata exposed by every transport variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    /// Printable peer address.
    pub address: String,
    /// Authenticated identity supplied by the transport, when it has one.
    pub user_name: Option<String>,
    /// Whether the peer shares this host; gates the shared-memory path.
    pub localhost: bool,
}

/// Reader half of a split transport.
pub type TransportReader = Box<dyn AsyncRead + Send + Unpin>;

/// Writer half of a split transport.
pub type TransportWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// A connected, not-yet-split transport.
pub struct Transport {
    reader: TransportReader,
    writer: TransportWriter,
    info: PeerInfo,
    closed: Arc<AtomicBool>,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("info", &self.info)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Transport {
    /// Wrap an arbitrary stream pair with explicit peer metadata.
    #[must_use]
    pub fn from_stream(reader: TransportReader, writer: TransportWriter, info: PeerInfo) -> Self {
        Self {
            reader,
            writer,
            info,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Adopt an accepted TCP stream.
    ///
    /// # Errors
    /// Propagates failures reading the peer address.
    pub fn tcp(stream: TcpStream, user_name: Option<String>) -> std::io::Result<Self> {
        let peer = stream.peer_addr()?;
        let info = PeerInfo {
            address: peer.to_string(),
            user_name,
            localhost: peer.ip().is_loopback(),
        };
        let (reader, writer) = tokio::io::split(stream);
        Ok(Self::from_stream(Box::new(reader), Box::new(writer), info))
    }

    /// Connect out to a listening peer.
    ///
    /// # Errors
    /// Propagates connection failures.
    pub async fn connect<A: ToSocketAddrs>(addr: A) -> std::io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        Self::tcp(stream, None)
    }

    /// An in-process piped pair; both ends report localhost.
    #[must_use]
    pub fn pair(buffer: usize) -> (Self, Self) {
        let (a, b) = tokio::io::duplex(buffer);
        let info = |address: &str| PeerInfo {
            address: address.to_owned(),
            user_name: None,
            localhost: true,
        };
        let (ar, aw) = tokio::io::split(a);
        let (br, bw) = tokio::io::split(b);
        (
            Self::from_stream(Box::new(ar), Box::new(aw), info("in-process:a")),
            Self::from_stream(Box::new(br), Box::new(bw), info("in-process:b")),
        )
    }

    /// Speak the protocol over a child process's standard streams.
    ///
    /// # Errors
    /// Fails when the child was spawned without piped stdin/stdout.
    pub fn child_process(child: &mut Child) -> std::io::Result<Self> {
        let stdin = child.stdin.take().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "child stdin not piped")
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "child stdout not piped")
        })?;
        let info = PeerInfo {
            address: format!("child-process:{}", child.id().unwrap_or_default()),
            user_name: None,
            localhost: true,
        };
        Ok(Self::from_stream(Box::new(stdout), Box::new(stdin), info))
    }

    /// Peer metadata.
    #[must_use]
    pub const fn info(&self) -> &PeerInfo { &self.info }

    /// The sticky closed flag shared with whatever drives the stream.
    #[must_use]
    pub fn closed_flag(&self) -> Arc<AtomicBool> { Arc::clone(&self.closed) }

    /// Whether the transport has been marked closed.
    #[must_use]
    pub fn is_closed(&self) -> bool { self.closed.load(Ordering::Acquire) }

    /// Split into halves for the dispatch engine, keeping the metadata and
    /// closed flag attached.
    #[must_use]
    pub fn into_parts(self) -> (TransportReader, TransportWriter, PeerInfo, Arc<AtomicBool>) {
        (self.reader, self.writer, self.info, self.closed)
    }

    /// Reassemble a transport that was split for the handshake.
    #[must_use]
    pub fn from_parts(
        reader: TransportReader,
        writer: TransportWriter,
        info: PeerInfo,
        closed: Arc<AtomicBool>,
    ) -> Self {
        Self {
            reader,
            writer,
            info,
            closed,
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    #[tokio::test]
    async fn pair_carries_bytes_both_ways() {
        let (a, b) = Transport::pair(64);
        assert!(a.info().localhost);
        let (mut ar, mut aw, _, _) = a.into_parts();
        let (mut br, mut bw, _, _) = b.into_parts();
        aw.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        br.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        bw.write_all(b"pong").await.unwrap();
        ar.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[tokio::test]
    async fn closed_flag_is_sticky_and_shared() {
        let (a, _b) = Transport::pair(8);
        let flag = a.closed_flag();
        assert!(!a.is_closed());
        flag.store(true, Ordering::Release);
        assert!(a.is_closed());
    }
}
