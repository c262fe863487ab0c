//! In-process transport with per-transport blocked addresses
//!
//! Wraps libp2p's memory transport: every host in the process can reach
//! every `/memory/<port>` listener unless its own transport blocks the
//! address, which models peers without a direct route.

use std::collections::HashSet;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use libp2p::core::transport::memory::{Channel, MemoryTransportError};
use libp2p::core::transport::{self, DialOpts, ListenerId, TransportEvent};
use libp2p::multiaddr::Protocol;
use libp2p::{Multiaddr, Transport, TransportError};
use parking_lot::RwLock;
use tracing::debug;

/// Memory transport settings shared by clones. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct MemoryTransport {
    blocked: Arc<RwLock<HashSet<u64>>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse to dial `addr` from this transport, as if no route existed
    pub fn block(&self, addr: &Multiaddr) {
        if let Some(port) = memory_port(addr) {
            self.blocked.write().insert(port);
        }
    }

    /// Lift a block added with [`MemoryTransport::block`]
    pub fn unblock(&self, addr: &Multiaddr) {
        if let Some(port) = memory_port(addr) {
            self.blocked.write().remove(&port);
        }
    }

    pub fn is_blocked(&self, addr: &Multiaddr) -> bool {
        memory_port(addr).is_some_and(|port| self.blocked.read().contains(&port))
    }

    pub(crate) fn into_transport(self) -> BlockingMemoryTransport {
        BlockingMemoryTransport {
            inner: transport::MemoryTransport::default(),
            settings: self,
        }
    }
}

fn memory_port(addr: &Multiaddr) -> Option<u64> {
    match addr.iter().next() {
        Some(Protocol::Memory(port)) => Some(port),
        _ => None,
    }
}

/// libp2p memory transport that fails dials to blocked ports
pub(crate) struct BlockingMemoryTransport {
    inner: transport::MemoryTransport,
    settings: MemoryTransport,
}

impl Transport for BlockingMemoryTransport {
    type Output = Channel<Vec<u8>>;
    type Error = MemoryTransportError;
    type ListenerUpgrade = <transport::MemoryTransport as Transport>::ListenerUpgrade;
    type Dial = <transport::MemoryTransport as Transport>::Dial;

    fn listen_on(&mut self, id: ListenerId, addr: Multiaddr) -> Result<(), TransportError<Self::Error>> {
        self.inner.listen_on(id, addr)
    }

    fn remove_listener(&mut self, id: ListenerId) -> bool {
        self.inner.remove_listener(id)
    }

    fn dial(&mut self, addr: Multiaddr, opts: DialOpts) -> Result<Self::Dial, TransportError<Self::Error>> {
        if self.settings.is_blocked(&addr) {
            debug!("Memory dial to {} blocked", addr);
            return Err(TransportError::Other(MemoryTransportError::Unreachable));
        }
        self.inner.dial(addr, opts)
    }

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<TransportEvent<Self::ListenerUpgrade, Self::Error>> {
        Pin::new(&mut self.inner).poll(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_and_unblock() {
        let transport = MemoryTransport::new();
        let addr: Multiaddr = "/memory/4711".parse().unwrap();
        assert!(!transport.is_blocked(&addr));

        transport.block(&addr);
        assert!(transport.is_blocked(&addr));
        assert!(transport.clone().is_blocked(&"/memory/4711/p2p/12D3KooWETLZBFBfkzvH3BQEtA1TJZPmjb4a18ss5TpwNU7DHDX6".parse().unwrap()));

        transport.unblock(&addr);
        assert!(!transport.is_blocked(&addr));
    }

    #[test]
    fn test_non_memory_address_never_blocked() {
        let transport = MemoryTransport::new();
        let tcp: Multiaddr = "/ip4/127.0.0.1/tcp/4711".parse().unwrap();
        transport.block(&tcp);
        assert!(!transport.is_blocked(&tcp));
    }

    #[test]
    fn test_blocked_dial_is_unreachable() {
        let settings = MemoryTransport::new();
        let addr: Multiaddr = "/memory/4712".parse().unwrap();
        settings.block(&addr);

        let mut transport = settings.into_transport();
        let opts = DialOpts {
            role: libp2p::core::Endpoint::Dialer,
            port_use: transport::PortUse::New,
        };
        assert!(matches!(
            transport.dial(addr, opts),
            Err(TransportError::Other(MemoryTransportError::Unreachable))
        ));
    }
}
