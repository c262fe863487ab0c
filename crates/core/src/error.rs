use std::io;

use thiserror::Error;

/// Failures surfaced by circuit establishment and relayed streams
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    #[error("Relay unsupported: peer does not serve circuits")]
    RelayUnsupported,

    #[error("No route: relay cannot reach the destination")]
    NoRoute,

    #[error("Permission denied by relay")]
    PermissionDenied,

    #[error("Connection refused by destination")]
    ConnectionRefused,

    #[error("Handshake timeout")]
    HandshakeTimeout,

    #[error("No relay available")]
    NoRelayAvailable,

    #[error("Peer unreachable: {0}")]
    Unreachable(String),

    #[error("Circuit closed")]
    CircuitClosed,

    #[error("Network error: {0}")]
    Network(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl RelayError {
    /// Wrap this error in an `io::Error` so it can travel through
    /// `AsyncRead`/`AsyncWrite` implementations.
    pub fn into_io(self) -> io::Error {
        let kind = match self {
            RelayError::CircuitClosed => io::ErrorKind::NotConnected,
            RelayError::HandshakeTimeout => io::ErrorKind::TimedOut,
            RelayError::ConnectionRefused => io::ErrorKind::ConnectionRefused,
            _ => io::ErrorKind::Other,
        };
        io::Error::new(kind, self)
    }

    /// Recover a `RelayError` previously wrapped with [`RelayError::into_io`].
    pub fn from_io(err: &io::Error) -> Option<&RelayError> {
        err.get_ref().and_then(|inner| inner.downcast_ref::<RelayError>())
    }
}

impl From<io::Error> for RelayError {
    fn from(err: io::Error) -> Self {
        match RelayError::from_io(&err) {
            Some(inner) => inner.clone(),
            None => RelayError::Io(err.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;
