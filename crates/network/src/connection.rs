//! Connection handles and protocol streams
//!
//! The swarm owns the actual connections. A [`Connection`] is a handle onto
//! one of them: what the host learned about the remote (identity, address,
//! relay, identify-reported protocols) plus the ability to open streams and
//! close it.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use circuitcraft_core::parse_circuit_addr;
use libp2p::swarm::ConnectionId;
use libp2p::{Multiaddr, PeerId, StreamProtocol};
use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::{mpsc, watch};
use tokio_util::compat::{Compat, FuturesAsyncReadCompatExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::host::Command;
use crate::{NetworkError, Result};

/// Which side opened the connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Dialer,
    Listener,
}

#[derive(Default)]
struct RemoteInfo {
    protocols: Vec<StreamProtocol>,
    listen_addrs: Vec<Multiaddr>,
}

struct ConnectionInner {
    id: ConnectionId,
    peer: PeerId,
    role: Role,
    remote_addr: Multiaddr,
    relayed_via: Option<PeerId>,
    established: Instant,
    remote: RwLock<RemoteInfo>,
    identified: watch::Sender<bool>,
    closed: CancellationToken,
    control: libp2p_stream::Control,
    commands: mpsc::WeakUnboundedSender<Command>,
}

/// Handle to a live connection. Cheap to clone.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("peer", &self.inner.peer)
            .field("remote_addr", &self.inner.remote_addr)
            .field("relayed_via", &self.inner.relayed_via)
            .finish()
    }
}

impl Connection {
    pub(crate) fn new(
        id: ConnectionId,
        peer: PeerId,
        role: Role,
        remote_addr: Multiaddr,
        control: libp2p_stream::Control,
        commands: mpsc::WeakUnboundedSender<Command>,
    ) -> Self {
        let relayed_via = parse_circuit_addr(&remote_addr).map(|circuit| circuit.relay);
        let (identified, _) = watch::channel(false);
        Self {
            inner: Arc::new(ConnectionInner {
                id,
                peer,
                role,
                remote_addr,
                relayed_via,
                established: Instant::now(),
                remote: RwLock::new(RemoteInfo::default()),
                identified,
                closed: CancellationToken::new(),
                control,
                commands,
            }),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    pub fn remote_peer(&self) -> PeerId {
        self.inner.peer
    }

    /// Transport address of the remote, or its `/p2p/<relay>/p2p-circuit/p2p/<id>`
    /// address for a relayed connection
    pub fn remote_addr(&self) -> &Multiaddr {
        &self.inner.remote_addr
    }

    /// Listen addresses the remote reported through identify
    pub fn remote_listen_addrs(&self) -> Vec<Multiaddr> {
        self.inner.remote.read().listen_addrs.clone()
    }

    pub fn relayed_via(&self) -> Option<PeerId> {
        self.inner.relayed_via
    }

    pub fn is_relayed(&self) -> bool {
        self.inner.relayed_via.is_some()
    }

    pub fn age(&self) -> Duration {
        self.inner.established.elapsed()
    }

    /// Whether the remote accepts `protocol`, as of its last identify
    pub fn supports(&self, protocol: &StreamProtocol) -> bool {
        self.inner.remote.read().protocols.contains(protocol)
    }

    pub fn is_identified(&self) -> bool {
        *self.inner.identified.borrow()
    }

    /// Resolves once the first identify exchange finished (or failed) or
    /// the connection closed
    pub async fn identified(&self) {
        let mut rx = self.inner.identified.subscribe();
        tokio::select! {
            _ = rx.wait_for(|done| *done) => {}
            _ = self.inner.closed.cancelled() => {}
        }
    }

    pub(crate) fn set_remote_info(&self, protocols: Vec<StreamProtocol>, listen_addrs: Vec<Multiaddr>) {
        *self.inner.remote.write() = RemoteInfo {
            protocols,
            listen_addrs,
        };
        self.mark_identified();
    }

    pub(crate) fn mark_identified(&self) {
        self.inner.identified.send_replace(true);
    }

    /// Open a new stream for `protocol` to the remote peer
    pub async fn open_stream(&self, protocol: StreamProtocol) -> Result<Substream> {
        if self.is_closed() {
            return Err(NetworkError::ConnectionClosed);
        }

        let mut control = self.inner.control.clone();
        let stream = control
            .open_stream(self.inner.peer, protocol.clone())
            .await
            .map_err(|e| match e {
                libp2p_stream::OpenStreamError::UnsupportedProtocol(p) => {
                    NetworkError::UnsupportedProtocol(p.to_string())
                }
                libp2p_stream::OpenStreamError::Io(io) => NetworkError::Io(io),
                other => NetworkError::Transport(format!("{:?}", other)),
            })?;

        Ok(Substream::new(stream, self.inner.peer, protocol))
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    /// Resolves once the connection is closed
    pub async fn closed(&self) {
        self.inner.closed.cancelled().await
    }

    /// Close the connection and every stream on it
    pub fn close(&self) {
        if self.is_closed() {
            return;
        }
        debug!("Closing connection {} to {}", self.inner.id, self.inner.peer);
        self.inner.closed.cancel();
        if let Some(commands) = self.inner.commands.upgrade() {
            let _ = commands.send(Command::Close(self.inner.id));
        }
    }

    /// Mark closed after the swarm reported the connection gone
    pub(crate) fn set_closed(&self) {
        self.inner.closed.cancel();
    }
}

/// A protocol stream to a remote peer
pub struct Substream {
    inner: Compat<libp2p::Stream>,
    peer: PeerId,
    protocol: StreamProtocol,
}

impl std::fmt::Debug for Substream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Substream")
            .field("peer", &self.peer)
            .field("protocol", &self.protocol)
            .finish()
    }
}

impl Substream {
    pub(crate) fn new(stream: libp2p::Stream, peer: PeerId, protocol: StreamProtocol) -> Self {
        Self {
            inner: stream.compat(),
            peer,
            protocol,
        }
    }

    pub fn remote_peer(&self) -> PeerId {
        self.peer
    }

    pub fn protocol(&self) -> &StreamProtocol {
        &self.protocol
    }
}

impl AsyncRead for Substream {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for Substream {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    /// Closes the write half; the remote reads EOF
    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
