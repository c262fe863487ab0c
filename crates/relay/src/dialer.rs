//! Dialer: direct connection first, relayed circuit as fallback

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use circuitcraft_core::{parse_circuit_addr, split_peer_id, DialerConfig, RelayError, Result};
use circuitcraft_network::{Connection, Host, Role};
use libp2p::multiaddr::Protocol;
use libp2p::{Multiaddr, PeerId};
use tracing::{debug, info};

use crate::circuit::{CircuitConnection, CircuitOptions, RelayCandidate};
use crate::message::HOP_PROTOCOL;

/// Connects to peers, falling back to relays when no direct route works.
/// Cheap to clone.
#[derive(Clone)]
pub struct Dialer {
    host: Host,
    config: DialerConfig,
    rotation: Arc<AtomicUsize>,
}

impl Dialer {
    pub fn new(host: Host, config: DialerConfig) -> Self {
        Self {
            host,
            config,
            rotation: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn host(&self) -> &Host {
        &self.host
    }

    pub fn config(&self) -> &DialerConfig {
        &self.config
    }

    fn circuit_options(&self) -> CircuitOptions {
        CircuitOptions {
            handshake_timeout: self.config.handshake_timeout(),
            dial_timeout: self.config.dial_timeout(),
            selection: self.config.selection,
            rotation: self.rotation.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Connect to `peer`: reuse an existing connection, else try every known
    /// direct address, else open a circuit through a relay.
    pub async fn connect(&self, peer: PeerId) -> Result<Connection> {
        if peer == self.host.peer_id() {
            return Err(RelayError::Unreachable("cannot connect to self".to_string()));
        }
        if let Some(connection) = self.host.connection(&peer) {
            return Ok(connection);
        }

        let mut attempts = 0usize;
        let mut last_error = None;

        for addr in self.host.peer_store().direct_addresses(&peer) {
            attempts += 1;
            match self.dial_direct(&addr, peer).await {
                Ok(connection) => return Ok(connection),
                Err(e) => {
                    debug!("Direct dial to {} at {} failed: {}", peer, addr, e);
                    last_error = Some(e);
                }
            }
        }

        if !self.config.relay_fallback {
            return Err(exhausted(peer, attempts, last_error));
        }

        let candidates = self.relay_candidates(&peer);
        if candidates.is_empty() {
            return Err(exhausted(peer, attempts, last_error));
        }

        debug!("Falling back to {} relay candidate(s) for {}", candidates.len(), peer);
        match CircuitConnection::open(&self.host, peer, &candidates, &self.circuit_options()).await {
            Ok(circuit) => self.upgrade_circuit(circuit).await,
            Err(e) => Err(RelayError::Unreachable(format!(
                "{}: {} direct address(es) and {} relay(s) failed ({})",
                peer,
                attempts,
                candidates.len(),
                e
            ))),
        }
    }

    /// Connect to an explicit address. A `/p2p-circuit` address goes through
    /// the relay it names; anything else is dialed directly.
    pub async fn connect_addr(&self, addr: &Multiaddr) -> Result<Connection> {
        let Some(circuit) = parse_circuit_addr(addr) else {
            let (base, peer) = split_peer_id(addr);
            if let Some(existing) = peer.and_then(|p| self.host.connection(&p)) {
                return Ok(existing);
            }
            let connection = tokio::time::timeout(self.config.dial_timeout(), self.host.dial(addr))
                .await
                .map_err(|_| RelayError::Unreachable(format!("dial to {} timed out", base)))?
                .map_err(|e| RelayError::Unreachable(format!("{}: {}", addr, e)))?;
            return Ok(connection);
        };

        let dst = circuit
            .destination
            .ok_or_else(|| RelayError::Unreachable(format!("{} names no destination", addr)))?;
        if let Some(existing) = self.host.connection(&dst) {
            return Ok(existing);
        }

        let relay = RelayCandidate::new(circuit.relay).with_addr(circuit.relay_addr);
        let circuit = CircuitConnection::open_via(&self.host, &relay, dst, &self.circuit_options()).await?;
        self.upgrade_circuit(circuit).await
    }

    /// Relays that might reach `peer`: relays named in its circuit addresses
    /// first, then connected peers advertising HOP.
    pub fn relay_candidates(&self, peer: &PeerId) -> Vec<RelayCandidate> {
        let mut candidates: Vec<RelayCandidate> = Vec::new();
        let local = self.host.peer_id();

        let mut add = |candidate: RelayCandidate| {
            if candidate.peer == *peer || candidate.peer == local {
                return;
            }
            match candidates.iter_mut().find(|c| c.peer == candidate.peer) {
                Some(existing) => {
                    for addr in candidate.addrs {
                        if !existing.addrs.contains(&addr) {
                            existing.addrs.push(addr);
                        }
                    }
                }
                None => candidates.push(candidate),
            }
        };

        for addr in self.host.peer_store().circuit_addresses(peer) {
            if let Some(circuit) = parse_circuit_addr(&addr) {
                add(RelayCandidate::new(circuit.relay).with_addr(circuit.relay_addr));
            }
        }

        for connection in self.host.connections() {
            if !connection.is_relayed() && connection.supports(&HOP_PROTOCOL) {
                add(RelayCandidate::new(connection.remote_peer()));
            }
        }

        candidates
    }

    async fn dial_direct(&self, addr: &Multiaddr, peer: PeerId) -> Result<Connection> {
        let target = addr.clone().with(Protocol::P2p(peer));
        tokio::time::timeout(self.config.dial_timeout(), self.host.dial(&target))
            .await
            .map_err(|_| RelayError::HandshakeTimeout)?
            .map_err(RelayError::from)
    }

    /// Authenticate and multiplex an outbound circuit as a host connection
    async fn upgrade_circuit(&self, circuit: CircuitConnection) -> Result<Connection> {
        let remote = circuit.remote_peer();
        let relay = circuit.relay();

        let connection = self
            .host
            .upgrade(Box::new(circuit), Role::Dialer, relay, remote)
            .await
            .map_err(RelayError::from)?;
        info!("Relayed connection to {} via {} ready", remote, relay);
        Ok(connection)
    }
}

fn exhausted(peer: PeerId, attempts: usize, last_error: Option<RelayError>) -> RelayError {
    match (attempts, last_error) {
        (0, _) => RelayError::NoRelayAvailable,
        (n, Some(e)) => RelayError::Unreachable(format!("{}: {} direct address(es) failed, last: {}", peer, n, e)),
        (n, None) => RelayError::Unreachable(format!("{}: {} direct address(es) failed", peer, n)),
    }
}

/// Upgrade inbound circuits from `listener` into host connections until the
/// host shuts down.
pub fn spawn_circuit_upgrader(host: &Host, mut listener: crate::CircuitListener) {
    let host = host.clone();
    let token = host.shutdown_token();
    tokio::spawn(async move {
        loop {
            let circuit = tokio::select! {
                _ = token.cancelled() => break,
                circuit = listener.next() => circuit,
            };
            let Some(circuit) = circuit else { break };

            let host = host.clone();
            tokio::spawn(async move {
                let remote = circuit.remote_peer();
                let relay = circuit.relay();
                match host
                    .upgrade(Box::new(circuit), Role::Listener, relay, remote)
                    .await
                {
                    Ok(_) => debug!("Inbound relayed connection from {} via {} ready", remote, relay),
                    Err(e) => debug!("Upgrading circuit from {} via {} failed: {}", remote, relay, e),
                }
            });
        }
    });
}
