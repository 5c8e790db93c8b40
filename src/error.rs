//! Wire-visible error taxonomy shared by both peers.
//!
//! Every failure that crosses the wire is reduced to an [`ErrorKind`] plus a
//! human-readable message, and, for exceptions raised inside the remote
//! runtime, an opaque stack blob captured on the raising side. The kinds
//! split into recoverable failures the caller can act on and fatal ones that
//! tear the session down.

use thiserror::Error;

/// Wire-visible failure categories.
///
/// The numeric codes are part of the protocol; any change bumps
/// [`crate::protocol::VERSION`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ErrorKind {
    /// Peer speaks a different protocol version.
    VersionMismatch = 0,
    /// Transport identity was rejected by the authentication policy.
    AuthFailed = 1,
    /// Class is outside the session allow-list.
    AccessDenied = 2,
    /// Handle is not present in the peer's export table.
    NoSuchHandle = 3,
    /// Class name did not resolve.
    NoSuchClass = 4,
    /// No overload of the named method accepts the supplied arguments.
    NoSuchMethod = 5,
    /// Field name did not resolve on the target class.
    NoSuchField = 6,
    /// More than one overload remained minimal; the message lists them.
    AmbiguousCall = 7,
    /// Value does not satisfy the declared parameter or cast target.
    TypeMismatch = 8,
    /// Value could not be converted between the two type systems.
    CoercionFailed = 9,
    /// An exception escaped the remote handler; carries the peer stack.
    RemoteException = 10,
    /// Acquiring the lock would close a cycle in the wait-for graph.
    Deadlock = 11,
    /// A non-blocking acquire could not take the lock.
    AcquireFailed = 12,
    /// The caller-side timeout expired before the response arrived.
    TimedOut = 13,
    /// The session closed while the request was outstanding.
    SessionClosed = 14,
    /// Shared-memory file I/O failed.
    ShmIoFailed = 15,
    /// The shared-memory region has no room for the array.
    ShmOutOfSpace = 16,
    /// Malformed frame or a message kind the peer cannot accept.
    ProtocolError = 17,
}

impl ErrorKind {
    /// Decode a kind from its wire code.
    #[must_use]
    pub const fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => Self::VersionMismatch,
            1 => Self::AuthFailed,
            2 => Self::AccessDenied,
            3 => Self::NoSuchHandle,
            4 => Self::NoSuchClass,
            5 => Self::NoSuchMethod,
            6 => Self::NoSuchField,
            7 => Self::AmbiguousCall,
            8 => Self::TypeMismatch,
            9 => Self::CoercionFailed,
            10 => Self::RemoteException,
            11 => Self::Deadlock,
            12 => Self::AcquireFailed,
            13 => Self::TimedOut,
            14 => Self::SessionClosed,
            15 => Self::ShmIoFailed,
            16 => Self::ShmOutOfSpace,
            17 => Self::ProtocolError,
            _ => return None,
        })
    }

    /// Wire code for this kind.
    #[must_use]
    pub const fn code(self) -> u8 { self as u8 }

    /// Whether the caller can recover and keep using the session.
    ///
    /// `ProtocolError` and `VersionMismatch` tear the session down;
    /// `SessionClosed` is terminal for the caller by definition.
    #[must_use]
    pub const fn is_recoverable(self) -> bool {
        !matches!(
            self,
            Self::ProtocolError | Self::VersionMismatch | Self::SessionClosed
        )
    }
}

/// A failure as it travels on the wire: kind, message, and (for remote
/// exceptions) the raising side's stack rendering as an opaque blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorPayload {
    /// Failure category.
    pub kind: ErrorKind,
    /// Human-readable description; for [`ErrorKind::AmbiguousCall`] this
    /// lists every tied candidate signature.
    pub message: String,
    /// Remote stack rendering; empty unless the kind is
    /// [`ErrorKind::RemoteException`].
    pub stack: Vec<u8>,
}

impl ErrorPayload {
    /// Build a payload with no stack blob.
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            stack: Vec::new(),
        }
    }

    /// Build a remote-exception payload carrying the peer's stack blob.
    #[must_use]
    pub fn remote(message: impl Into<String>, stack: Vec<u8>) -> Self {
        Self {
            kind: ErrorKind::RemoteException,
            message: message.into(),
            stack,
        }
    }
}

/// A bridge operation failure as surfaced to local callers.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// The peer answered with an ERROR frame.
    #[error("{}: {}", .0.kind.name(), .0.message)]
    Remote(ErrorPayload),
    /// A local failure before the request reached the wire.
    #[error("{kind:?}: {message}")]
    Local {
        /// Failure category.
        kind: ErrorKind,
        /// Description of the failure.
        message: String,
    },
    /// Transport-level I/O failure.
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    /// Build a local failure with the given kind and message.
    #[must_use]
    pub fn local(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::Local {
            kind,
            message: message.into(),
        }
    }

    /// The wire kind of this failure, where one applies.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Remote(payload) => payload.kind,
            Self::Local { kind, .. } => *kind,
            Self::Io(_) => ErrorKind::SessionClosed,
        }
    }

    /// Convert into the payload an ERROR frame would carry.
    #[must_use]
    pub fn into_payload(self) -> ErrorPayload {
        match self {
            Self::Remote(payload) => payload,
            Self::Local { kind, message } => ErrorPayload::new(kind, message),
            Self::Io(e) => ErrorPayload::new(ErrorKind::SessionClosed, e.to_string()),
        }
    }
}

impl From<ErrorPayload> for BridgeError {
    fn from(payload: ErrorPayload) -> Self { Self::Remote(payload) }
}

impl ErrorKind {
    /// Stable lowercase name used in messages and logs.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::VersionMismatch => "version_mismatch",
            Self::AuthFailed => "auth_failed",
            Self::AccessDenied => "access_denied",
            Self::NoSuchHandle => "no_such_handle",
            Self::NoSuchClass => "no_such_class",
            Self::NoSuchMethod => "no_such_method",
            Self::NoSuchField => "no_such_field",
            Self::AmbiguousCall => "ambiguous_call",
            Self::TypeMismatch => "type_mismatch",
            Self::CoercionFailed => "coercion_failed",
            Self::RemoteException => "remote_exception",
            Self::Deadlock => "deadlock",
            Self::AcquireFailed => "acquire_failed",
            Self::TimedOut => "timed_out",
            Self::SessionClosed => "session_closed",
            Self::ShmIoFailed => "shm_io_failed",
            Self::ShmOutOfSpace => "shm_out_of_space",
            Self::ProtocolError => "protocol_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    fn codes_round_trip() {
        for code in 0..=17u8 {
            let kind = ErrorKind::from_code(code).expect("valid code");
            assert_eq!(kind.code(), code);
        }
        assert!(ErrorKind::from_code(18).is_none());
    }

    #[rstest]
    #[case(ErrorKind::Deadlock, true)]
    #[case(ErrorKind::AmbiguousCall, true)]
    #[case(ErrorKind::TimedOut, true)]
    #[case(ErrorKind::ProtocolError, false)]
    #[case(ErrorKind::VersionMismatch, false)]
    #[case(ErrorKind::SessionClosed, false)]
    fn recoverability(#[case] kind: ErrorKind, #[case] recoverable: bool) {
        assert_eq!(kind.is_recoverable(), recoverable);
    }
}
