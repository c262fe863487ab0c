use thiserror::Error;

use circuitcraft_core::RelayError;
use libp2p::PeerId;

#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Unsupported address: {0}")]
    UnsupportedAddress(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Protocol not supported by remote: {0}")]
    UnsupportedProtocol(String),

    #[error("Peer mismatch: expected {expected}, got {actual}")]
    PeerMismatch { expected: PeerId, actual: PeerId },

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Protocol already registered: {0}")]
    ProtocolAlreadyRegistered(String),

    #[error("Not connected to {0}")]
    NotConnected(PeerId),

    #[error("Cannot dial self")]
    DialSelf,

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Message exceeds {limit} bytes")]
    MessageTooLarge { limit: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Timeout")]
    Timeout,
}

impl From<bincode::Error> for NetworkError {
    fn from(err: bincode::Error) -> Self {
        NetworkError::Codec(err.to_string())
    }
}

impl From<NetworkError> for RelayError {
    fn from(err: NetworkError) -> Self {
        match err {
            NetworkError::Timeout => RelayError::HandshakeTimeout,
            NetworkError::Io(io) => RelayError::from(io),
            NetworkError::Codec(msg) => RelayError::Protocol(msg),
            other => RelayError::Network(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, NetworkError>;
