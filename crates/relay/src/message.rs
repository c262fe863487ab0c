//! HOP / STOP / STATUS wire messages
//!
//! Every message is a bincode encoded [`CircuitMessage`] in a `u32`
//! length-delimited frame (see [`MessageStream`]). Peer ids and addresses travel as raw bytes so
//! that a malformed value is reported as `MalformedMessage` instead of a
//! decoding failure of the whole frame.

use circuitcraft_core::{CircuitId, RelayError};
use circuitcraft_network::{MessageStream, NetworkError};
use libp2p::{Multiaddr, PeerId, StreamProtocol};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};

/// Protocol spoken by initiators towards a relay
pub const HOP_PROTOCOL: StreamProtocol = StreamProtocol::new("/circuitcraft/relay/hop/1.0.0");

/// Protocol spoken by a relay towards the destination
pub const STOP_PROTOCOL: StreamProtocol = StreamProtocol::new("/circuitcraft/relay/stop/1.0.0");

/// Maximum encoded size of a single circuit message
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Outcome carried in a `Status` message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusCode {
    Ok,
    RelayUnsupported,
    NoRoute,
    PermissionDenied,
    ConnectionRefused,
    HandshakeTimeout,
    CantRelayToSelf,
    MalformedMessage,
}

impl StatusCode {
    /// Error surfaced to the initiator for a non-`Ok` status
    pub fn into_error(self) -> Option<RelayError> {
        match self {
            StatusCode::Ok => None,
            StatusCode::RelayUnsupported => Some(RelayError::RelayUnsupported),
            StatusCode::NoRoute | StatusCode::CantRelayToSelf => Some(RelayError::NoRoute),
            StatusCode::PermissionDenied => Some(RelayError::PermissionDenied),
            StatusCode::ConnectionRefused => Some(RelayError::ConnectionRefused),
            StatusCode::HandshakeTimeout => Some(RelayError::HandshakeTimeout),
            StatusCode::MalformedMessage => {
                Some(RelayError::Protocol("relay rejected malformed request".to_string()))
            }
        }
    }
}

/// HOP request: initiator asks the relay for a circuit to `dst`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HopRequest {
    pub src: Vec<u8>,
    pub dst: Vec<u8>,
    /// Known addresses of the destination, for relays that dial on demand
    pub dst_addrs: Vec<Vec<u8>>,
}

/// STOP request: relay asks the destination to accept a circuit from `src`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopRequest {
    pub circuit_id: CircuitId,
    pub src: Vec<u8>,
    pub dst: Vec<u8>,
    pub src_addrs: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitMessage {
    Hop(HopRequest),
    Stop(StopRequest),
    Status {
        circuit_id: Option<CircuitId>,
        code: StatusCode,
    },
}

impl CircuitMessage {
    pub fn hop(src: PeerId, dst: PeerId, dst_addrs: &[Multiaddr]) -> Self {
        CircuitMessage::Hop(HopRequest {
            src: src.to_bytes(),
            dst: dst.to_bytes(),
            dst_addrs: encode_addrs(dst_addrs),
        })
    }

    pub fn stop(circuit_id: CircuitId, src: PeerId, dst: PeerId, src_addrs: &[Multiaddr]) -> Self {
        CircuitMessage::Stop(StopRequest {
            circuit_id,
            src: src.to_bytes(),
            dst: dst.to_bytes(),
            src_addrs: encode_addrs(src_addrs),
        })
    }

    pub fn status(circuit_id: Option<CircuitId>, code: StatusCode) -> Self {
        CircuitMessage::Status { circuit_id, code }
    }
}

pub fn decode_peer(bytes: &[u8]) -> Option<PeerId> {
    PeerId::from_bytes(bytes).ok()
}

/// Decode address bytes, skipping entries that do not parse
pub fn decode_addrs(addrs: &[Vec<u8>]) -> Vec<Multiaddr> {
    addrs
        .iter()
        .filter_map(|bytes| Multiaddr::try_from(bytes.clone()).ok())
        .collect()
}

fn encode_addrs(addrs: &[Multiaddr]) -> Vec<Vec<u8>> {
    addrs.iter().map(|a| a.to_vec()).collect()
}

/// Circuit message framing over `io`
pub fn framed<S>(io: S) -> MessageStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    MessageStream::new(io, MAX_MESSAGE_SIZE)
}

pub async fn send<S>(io: &mut MessageStream<S>, message: &CircuitMessage) -> Result<(), RelayError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    io.send(message).await.map_err(RelayError::from)
}

pub async fn recv<S>(io: &mut MessageStream<S>) -> Result<CircuitMessage, RelayError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match io.recv().await {
        Ok(message) => Ok(message),
        Err(NetworkError::ConnectionClosed) => Err(RelayError::Protocol(
            "stream closed before a message arrived".to_string(),
        )),
        Err(e) => Err(e.into()),
    }
}
