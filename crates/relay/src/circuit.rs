//! Circuit Connection
//!
//! A relayed byte stream to a remote peer, established through the HOP and
//! STOP handshakes. From the application's point of view it behaves like any
//! other `AsyncRead + AsyncWrite` stream; once torn down, every further read
//! or write fails with [`RelayError::CircuitClosed`].

use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use circuitcraft_core::{circuit_tag, CircuitDirection, CircuitId, RelayError, RelaySelection, Result};
use circuitcraft_network::{Connection, Host, NetworkError, Rewind, Substream};
use libp2p::multiaddr::Protocol;
use libp2p::{Multiaddr, PeerId};
use rand::seq::SliceRandom;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tracing::{debug, info, warn};

use crate::message::{self, CircuitMessage, StatusCode, HOP_PROTOCOL};

/// A relay that may be asked for a circuit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayCandidate {
    pub peer: PeerId,
    /// Addresses to dial if we are not connected to the relay yet
    pub addrs: Vec<Multiaddr>,
}

impl RelayCandidate {
    pub fn new(peer: PeerId) -> Self {
        Self {
            peer,
            addrs: Vec::new(),
        }
    }

    pub fn with_addr(mut self, addr: Multiaddr) -> Self {
        if !addr.is_empty() && !self.addrs.contains(&addr) {
            self.addrs.push(addr);
        }
        self
    }
}

/// Timeouts and candidate ordering for circuit establishment
#[derive(Debug, Clone)]
pub struct CircuitOptions {
    pub handshake_timeout: Duration,
    pub dial_timeout: Duration,
    pub selection: RelaySelection,
    /// Starting offset for [`RelaySelection::RoundRobin`]
    pub rotation: usize,
}

impl Default for CircuitOptions {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            dial_timeout: Duration::from_secs(5),
            selection: RelaySelection::InOrder,
            rotation: 0,
        }
    }
}

/// Apply the selection strategy to a candidate list
pub fn order_candidates(candidates: &[RelayCandidate], selection: RelaySelection, rotation: usize) -> Vec<RelayCandidate> {
    let mut ordered = candidates.to_vec();
    match selection {
        RelaySelection::InOrder => {}
        RelaySelection::RoundRobin => {
            if !ordered.is_empty() {
                let len = ordered.len();
                ordered.rotate_left(rotation % len);
            }
        }
        RelaySelection::Random => ordered.shuffle(&mut rand::thread_rng()),
    }
    ordered
}

/// Circuit leg after the handshake, replaying any bytes read along with it
pub(crate) type CircuitStream = Rewind<Substream>;

pub struct CircuitConnection {
    stream: CircuitStream,
    relay: PeerId,
    remote: PeerId,
    circuit_id: CircuitId,
    direction: CircuitDirection,
    closed: bool,
}

impl std::fmt::Debug for CircuitConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitConnection")
            .field("circuit_id", &circuit_tag(self.circuit_id))
            .field("relay", &self.relay)
            .field("remote", &self.remote)
            .field("direction", &self.direction)
            .field("closed", &self.closed)
            .finish()
    }
}

impl CircuitConnection {
    pub(crate) fn new(
        stream: CircuitStream,
        relay: PeerId,
        remote: PeerId,
        circuit_id: CircuitId,
        direction: CircuitDirection,
    ) -> Self {
        Self {
            stream,
            relay,
            remote,
            circuit_id,
            direction,
            closed: false,
        }
    }

    /// Try each candidate relay until one yields a circuit to `dst`.
    pub async fn open(
        host: &Host,
        dst: PeerId,
        candidates: &[RelayCandidate],
        options: &CircuitOptions,
    ) -> Result<Self> {
        let ordered = order_candidates(candidates, options.selection, options.rotation);
        let mut attempts = 0usize;

        for candidate in ordered {
            if candidate.peer == dst || candidate.peer == host.peer_id() {
                continue;
            }
            attempts += 1;
            match Self::open_via(host, &candidate, dst, options).await {
                Ok(circuit) => return Ok(circuit),
                Err(e) => {
                    warn!("Circuit to {} via {} failed: {}", dst, candidate.peer, e);
                }
            }
        }

        debug!("No relay produced a circuit to {} ({} tried)", dst, attempts);
        Err(RelayError::NoRelayAvailable)
    }

    /// Single attempt through `relay`
    pub async fn open_via(
        host: &Host,
        relay: &RelayCandidate,
        dst: PeerId,
        options: &CircuitOptions,
    ) -> Result<Self> {
        let connection = match host.connection(&relay.peer) {
            Some(connection) => connection,
            None => dial_relay(host, relay, options.dial_timeout).await?,
        };

        if !connection.supports(&HOP_PROTOCOL) {
            return Err(RelayError::RelayUnsupported);
        }

        let (stream, circuit_id) = tokio::time::timeout(options.handshake_timeout, hop_exchange(host, &connection, dst))
            .await
            .map_err(|_| RelayError::HandshakeTimeout)??;

        info!(
            "Circuit {} open: {} -> {} via {}",
            circuit_tag(circuit_id),
            host.peer_id(),
            dst,
            relay.peer
        );
        Ok(Self::new(stream, relay.peer, dst, circuit_id, CircuitDirection::Outbound))
    }

    pub fn relay(&self) -> PeerId {
        self.relay
    }

    pub fn remote_peer(&self) -> PeerId {
        self.remote
    }

    pub fn circuit_id(&self) -> CircuitId {
        self.circuit_id
    }

    pub fn direction(&self) -> CircuitDirection {
        self.direction
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Relay-qualified address of the remote peer
    pub fn remote_addr(&self) -> Multiaddr {
        Multiaddr::empty()
            .with(Protocol::P2p(self.relay))
            .with(Protocol::P2pCircuit)
            .with(Protocol::P2p(self.remote))
    }

    /// Shut the local leg. The relay closes the other leg in turn.
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        debug!("Closing circuit {}", circuit_tag(self.circuit_id));
        self.stream.shutdown().await.map_err(RelayError::from)
    }
}

async fn hop_exchange(host: &Host, connection: &Connection, dst: PeerId) -> Result<(CircuitStream, CircuitId)> {
    let stream = connection
        .open_stream(HOP_PROTOCOL)
        .await
        .map_err(|e| match e {
            NetworkError::UnsupportedProtocol(_) => RelayError::RelayUnsupported,
            other => RelayError::from(other),
        })?;
    let mut stream = message::framed(stream);

    let dst_addrs = host.peer_store().direct_addresses(&dst);
    message::send(&mut stream, &CircuitMessage::hop(host.peer_id(), dst, &dst_addrs)).await?;

    match message::recv(&mut stream).await? {
        CircuitMessage::Status {
            circuit_id: Some(circuit_id),
            code: StatusCode::Ok,
        } => Ok((stream.into_inner(), circuit_id)),
        CircuitMessage::Status { code, .. } => Err(code
            .into_error()
            .unwrap_or_else(|| RelayError::Protocol("status ok without circuit id".to_string()))),
        other => Err(RelayError::Protocol(format!("unexpected reply to HOP: {:?}", other))),
    }
}

async fn dial_relay(host: &Host, relay: &RelayCandidate, dial_timeout: Duration) -> Result<Connection> {
    if relay.addrs.is_empty() {
        return Err(RelayError::Network(format!("no address for relay {}", relay.peer)));
    }

    let mut last_error = None;
    for addr in &relay.addrs {
        let target = addr.clone().with(Protocol::P2p(relay.peer));
        match tokio::time::timeout(dial_timeout, host.dial(&target)).await {
            Ok(Ok(connection)) => return Ok(connection),
            Ok(Err(e)) => {
                debug!("Dial to relay {} at {} failed: {}", relay.peer, addr, e);
                last_error = Some(RelayError::from(e));
            }
            Err(_) => {
                debug!("Dial to relay {} at {} timed out", relay.peer, addr);
                last_error = Some(RelayError::Network(format!("dial to {} timed out", addr)));
            }
        }
    }
    Err(last_error.unwrap_or_else(|| RelayError::Network("relay unreachable".to_string())))
}

fn closed_error() -> std::io::Error {
    RelayError::CircuitClosed.into_io()
}

impl AsyncRead for CircuitConnection {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        if self.closed {
            return Poll::Ready(Err(closed_error()));
        }
        let before = buf.filled().len();
        match Pin::new(&mut self.stream).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                if buf.filled().len() == before && buf.remaining() > 0 {
                    // Remote end gone: report EOF once, then fail
                    self.closed = true;
                }
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(_)) => {
                self.closed = true;
                Poll::Ready(Err(closed_error()))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl AsyncWrite for CircuitConnection {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        if self.closed {
            return Poll::Ready(Err(closed_error()));
        }
        match Pin::new(&mut self.stream).poll_write(cx, buf) {
            Poll::Ready(Err(_)) => {
                self.closed = true;
                Poll::Ready(Err(closed_error()))
            }
            other => other,
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        if self.closed {
            return Poll::Ready(Err(closed_error()));
        }
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        if self.closed {
            return Poll::Ready(Ok(()));
        }
        let result = Pin::new(&mut self.stream).poll_shutdown(cx);
        if result.is_ready() {
            self.closed = true;
        }
        result
    }
}
