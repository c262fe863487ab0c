//! Relay-qualified multiaddresses
//!
//! A peer reachable only through a relay is advertised as
//! `<relay transport addr>/p2p/<relay>/p2p-circuit/p2p/<destination>`.

use libp2p::multiaddr::Protocol;
use libp2p::{Multiaddr, PeerId};

/// Components of a `/p2p-circuit` address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitAddr {
    /// Peer id of the relay
    pub relay: PeerId,
    /// Transport address of the relay (may be empty when only the id is known)
    pub relay_addr: Multiaddr,
    /// Destination behind the relay, if the address names one
    pub destination: Option<PeerId>,
}

/// Build the relay-qualified address of `destination` behind `relay`.
pub fn circuit_addr(relay_addr: &Multiaddr, relay: PeerId, destination: PeerId) -> Multiaddr {
    let (base, _) = split_peer_id(relay_addr);
    base.with(Protocol::P2p(relay))
        .with(Protocol::P2pCircuit)
        .with(Protocol::P2p(destination))
}

/// Whether the address goes through a relay
pub fn is_circuit_addr(addr: &Multiaddr) -> bool {
    addr.iter().any(|p| matches!(p, Protocol::P2pCircuit))
}

/// Parse a `/p2p-circuit` address. Returns `None` for direct addresses and for
/// circuit addresses that do not name the relay.
pub fn parse_circuit_addr(addr: &Multiaddr) -> Option<CircuitAddr> {
    let mut relay_addr = Multiaddr::empty();
    let mut relay = None;
    let mut destination = None;
    let mut after_circuit = false;

    for proto in addr.iter() {
        match proto {
            Protocol::P2pCircuit => after_circuit = true,
            Protocol::P2p(id) if after_circuit => destination = Some(id),
            Protocol::P2p(id) => relay = Some(id),
            other if !after_circuit => relay_addr.push(other),
            _ => {}
        }
    }

    if !after_circuit {
        return None;
    }

    Some(CircuitAddr {
        relay: relay?,
        relay_addr,
        destination,
    })
}

/// Strip a trailing `/p2p/<id>` component, returning the transport part and the id.
pub fn split_peer_id(addr: &Multiaddr) -> (Multiaddr, Option<PeerId>) {
    let mut base = addr.clone();
    match base.pop() {
        Some(Protocol::P2p(id)) => (base, Some(id)),
        Some(other) => {
            base.push(other);
            (base, None)
        }
        None => (base, None),
    }
}
