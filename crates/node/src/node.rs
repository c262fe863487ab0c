//! CircuitNode: a host with the relay subsystem mounted

use bytes::Bytes;
use circuitcraft_core::CircuitCraftConfig;
use circuitcraft_network::{Connection, Host, HostConfig, HostTransport};
use circuitcraft_relay::{spawn_circuit_upgrader, CircuitListener, Dialer, RelayService};
use libp2p::identity::Keypair;
use libp2p::{Multiaddr, PeerId};
use tracing::{debug, info, warn};

use crate::block::{fetch_block, serve_blocks, BlockStore, ContentId};
use crate::{NodeError, Result};

pub struct CircuitNode {
    host: Host,
    dialer: Dialer,
    relay: Option<RelayService>,
    store: BlockStore,
    config: CircuitCraftConfig,
}

impl CircuitNode {
    /// Mount protocols, start listening and dial bootstrap peers.
    ///
    /// Protocols are accepted before any connection exists so that every
    /// peer learns them from the first identify exchange.
    pub async fn start(keypair: Keypair, transport: HostTransport, config: CircuitCraftConfig) -> Result<Self> {
        let handshake_timeout = config.dialer.handshake_timeout();
        let host_config = HostConfig {
            handshake_timeout,
            ..Default::default()
        };
        let host = Host::with_config(keypair, transport, host_config)?;

        let relay = if config.relay.enabled {
            Some(RelayService::spawn(&host, config.relay.clone(), handshake_timeout)?)
        } else {
            None
        };

        let listener = CircuitListener::spawn(&host, config.circuit.clone(), handshake_timeout)?;
        spawn_circuit_upgrader(&host, listener);

        let store = BlockStore::new();
        serve_blocks(&host, store.clone())?;

        for addr in &config.network.listen_addrs {
            let addr = parse_addr(addr)?;
            let bound = host.listen_on(addr).await?;
            debug!("Bound {}", bound);
        }

        let dialer = Dialer::new(host.clone(), config.dialer.clone());
        let node = Self {
            host,
            dialer,
            relay,
            store,
            config,
        };
        node.dial_bootstrap_peers().await;
        Ok(node)
    }

    async fn dial_bootstrap_peers(&self) {
        for raw in &self.config.network.bootstrap_peers {
            let addr = match parse_addr(raw) {
                Ok(addr) => addr,
                Err(e) => {
                    warn!("Skipping bootstrap peer: {}", e);
                    continue;
                }
            };
            match self.dialer.connect_addr(&addr).await {
                Ok(connection) => info!("Connected to bootstrap peer {}", connection.remote_peer()),
                Err(e) => warn!("Bootstrap peer {} unreachable: {}", addr, e),
            }
        }
    }

    pub fn peer_id(&self) -> PeerId {
        self.host.peer_id()
    }

    pub fn listen_addrs(&self) -> Vec<Multiaddr> {
        self.host.listen_addrs()
    }

    pub fn host(&self) -> &Host {
        &self.host
    }

    pub fn dialer(&self) -> &Dialer {
        &self.dialer
    }

    pub fn relay(&self) -> Option<&RelayService> {
        self.relay.as_ref()
    }

    pub fn store(&self) -> &BlockStore {
        &self.store
    }

    pub fn config(&self) -> &CircuitCraftConfig {
        &self.config
    }

    /// Remember an address for `peer`; circuit addresses make relays known
    pub fn add_peer_address(&self, peer: PeerId, addr: Multiaddr) {
        if self.host.peer_store().add_address(peer, addr.clone()) {
            debug!("Learned address {} for {}", addr, peer);
        }
    }

    /// Connect to `peer`, directly or through a relay
    pub async fn connect(&self, peer: PeerId) -> Result<Connection> {
        Ok(self.dialer.connect(peer).await?)
    }

    pub async fn connect_addr(&self, addr: &Multiaddr) -> Result<Connection> {
        Ok(self.dialer.connect_addr(addr).await?)
    }

    /// Store `data` locally and return its content id
    pub fn add(&self, data: impl Into<Bytes>) -> Result<ContentId> {
        let cid = self.store.put(data)?;
        info!("Stored block {}", cid);
        Ok(cid)
    }

    /// Fetch `cid` from the local store, else from connected peers
    pub async fn cat(&self, cid: ContentId) -> Result<Bytes> {
        if let Some(data) = self.store.get(&cid) {
            return Ok(data);
        }

        for connection in self.host.connections() {
            let peer = connection.remote_peer();
            match fetch_block(&connection, cid).await {
                Ok(Some(data)) => {
                    info!("Fetched block {} from {}", cid, peer);
                    return Ok(data);
                }
                Ok(None) => debug!("{} does not have {}", peer, cid),
                Err(e) => debug!("Fetching {} from {} failed: {}", cid, peer, e),
            }
        }
        Err(NodeError::BlockNotFound(cid))
    }

    /// Connect to `peer` (relaying if needed) and fetch `cid` from it
    pub async fn cat_from(&self, peer: PeerId, cid: ContentId) -> Result<Bytes> {
        let connection = self.connect(peer).await?;
        fetch_block(&connection, cid)
            .await?
            .ok_or(NodeError::BlockNotFound(cid))
    }

    /// Stop serving relays and close every connection
    pub fn stop(&self) {
        if let Some(relay) = &self.relay {
            relay.stop();
        }
        self.host.shutdown();
        info!("Node {} stopped", self.host.peer_id());
    }
}

impl Drop for CircuitNode {
    fn drop(&mut self) {
        if !self.host.is_shutdown() {
            self.host.shutdown();
        }
    }
}

fn parse_addr(raw: &str) -> Result<Multiaddr> {
    raw.parse()
        .map_err(|e| NodeError::InvalidAddress(format!("{}: {}", raw, e)))
}
