//! Known peer addresses

use std::collections::HashMap;
use std::sync::Arc;

use circuitcraft_core::is_circuit_addr;
use libp2p::{Multiaddr, PeerId};
use parking_lot::RwLock;

/// Addresses per peer, direct and relayed, in insertion order
#[derive(Clone, Default)]
pub struct PeerStore {
    peers: Arc<RwLock<HashMap<PeerId, Vec<Multiaddr>>>>,
}

impl PeerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an address for `peer`. Duplicates are ignored.
    pub fn add_address(&self, peer: PeerId, addr: Multiaddr) -> bool {
        let mut peers = self.peers.write();
        let addrs = peers.entry(peer).or_default();
        if addrs.contains(&addr) {
            return false;
        }
        addrs.push(addr);
        true
    }

    pub fn addresses(&self, peer: &PeerId) -> Vec<Multiaddr> {
        self.peers.read().get(peer).cloned().unwrap_or_default()
    }

    /// Addresses that reach the peer without a relay
    pub fn direct_addresses(&self, peer: &PeerId) -> Vec<Multiaddr> {
        self.addresses(peer)
            .into_iter()
            .filter(|a| !is_circuit_addr(a))
            .collect()
    }

    /// `/p2p-circuit` addresses for the peer
    pub fn circuit_addresses(&self, peer: &PeerId) -> Vec<Multiaddr> {
        self.addresses(peer)
            .into_iter()
            .filter(is_circuit_addr)
            .collect()
    }

    pub fn remove_address(&self, peer: &PeerId, addr: &Multiaddr) {
        if let Some(addrs) = self.peers.write().get_mut(peer) {
            addrs.retain(|a| a != addr);
        }
    }

    pub fn remove_peer(&self, peer: &PeerId) {
        self.peers.write().remove(peer);
    }

    pub fn peers(&self) -> Vec<PeerId> {
        self.peers.read().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }
}
