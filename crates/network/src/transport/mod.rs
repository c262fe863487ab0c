//! Transport stack of a host
//!
//! A base transport (TCP, or libp2p's in-process memory transport) and the
//! relayed transport for `/p2p-circuit` addresses are combined, then every
//! connection is authenticated with noise and multiplexed with yamux.

mod memory;
mod relayed;

pub use memory::MemoryTransport;
pub(crate) use relayed::{circuit_listen_addr, CircuitHandoff, RelayedTransport};

use libp2p::core::muxing::StreamMuxerBox;
use libp2p::core::transport::Boxed;
use libp2p::core::upgrade::Version;
use libp2p::identity::Keypair;
use libp2p::{noise, tcp, yamux, PeerId, Transport};
use tokio::io::{AsyncRead, AsyncWrite};

/// Any bidirectional byte stream a connection can be upgraded over
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> AsyncStream for T {}

/// Type-erased byte stream
pub type BoxedStream = Box<dyn AsyncStream>;

/// Raw socket of any base transport, before noise and yamux
trait Socket: futures::AsyncRead + futures::AsyncWrite + Send + Unpin + 'static {}

impl<T: futures::AsyncRead + futures::AsyncWrite + Send + Unpin + 'static> Socket for T {}

type BoxedSocket = Box<dyn Socket>;

/// Base transport a host listens and dials on
#[derive(Debug, Clone, Default)]
pub enum HostTransport {
    /// `/ip4|ip6/<ip>/tcp/<port>` with `TCP_NODELAY`
    #[default]
    Tcp,
    /// `/memory/<port>` inside this process
    Memory(MemoryTransport),
}

impl From<MemoryTransport> for HostTransport {
    fn from(transport: MemoryTransport) -> Self {
        HostTransport::Memory(transport)
    }
}

/// Authenticated, multiplexed transport for the swarm
pub(crate) fn build(
    keypair: &Keypair,
    base: HostTransport,
    relayed: RelayedTransport,
) -> Result<Boxed<(PeerId, StreamMuxerBox)>, noise::Error> {
    let base = match base {
        HostTransport::Tcp => tcp::tokio::Transport::new(tcp::Config::default().nodelay(true))
            .map(|socket, _| Box::new(socket) as BoxedSocket)
            .boxed(),
        HostTransport::Memory(memory) => memory
            .into_transport()
            .map(|socket, _| Box::new(socket) as BoxedSocket)
            .boxed(),
    };
    let relayed = relayed
        .map(|socket, _| Box::new(socket) as BoxedSocket)
        .boxed();

    Ok(relayed
        .or_transport(base)
        .map(|either, _| either.into_inner())
        .upgrade(Version::V1)
        .authenticate(noise::Config::new(keypair)?)
        .multiplex(yamux::Config::default())
        .boxed())
}
