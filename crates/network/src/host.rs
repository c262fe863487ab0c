//! Host: identity, swarm driver, connection table and protocol streams
//!
//! A [`Host`] owns a libp2p swarm through a driver task. Handles talk to the
//! driver with commands; the driver keeps the shared connection table in
//! step with swarm events.

use std::collections::{HashMap, VecDeque};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use circuitcraft_core::{circuit_addr, is_circuit_addr, parse_circuit_addr, split_peer_id};
use futures::StreamExt;
use libp2p::core::transport::ListenerId;
use libp2p::core::ConnectedPoint;
use libp2p::identity::Keypair;
use libp2p::swarm::dial_opts::{DialOpts, PeerCondition};
use libp2p::swarm::{ConnectionId, DialError, ListenError, SwarmEvent};
use libp2p::{identify, Multiaddr, PeerId, StreamProtocol, Swarm, SwarmBuilder, TransportError};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::behaviour::{CircuitCraftBehaviour, CircuitCraftBehaviourEvent};
use crate::connection::{Connection, Role, Substream};
use crate::peer_store::PeerStore;
use crate::protocol::{InboundStream, IncomingStreams};
use crate::transport::{self, circuit_listen_addr, BoxedStream, CircuitHandoff, HostTransport, RelayedTransport};
use crate::{NetworkError, Result};

/// Default time allowed for a connection upgrade (noise, yamux, identify)
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default time a connection without open streams stays up
pub const DEFAULT_IDLE_CONNECTION_TIMEOUT: Duration = Duration::from_secs(3600);

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Inbound streams queued per accepted protocol before new ones are dropped
const ACCEPT_BACKLOG: usize = 32;

type ConnectionReply = oneshot::Sender<Result<Connection>>;

/// Connection lifecycle notifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    ConnectionEstablished { peer: PeerId, relayed: bool },
    /// Last connection to `peer` is gone
    ConnectionClosed { peer: PeerId },
}

/// Host configuration
#[derive(Debug, Clone)]
pub struct HostConfig {
    pub handshake_timeout: Duration,
    pub idle_connection_timeout: Duration,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            idle_connection_timeout: DEFAULT_IDLE_CONNECTION_TIMEOUT,
        }
    }
}

/// Requests from host handles to the swarm driver
pub(crate) enum Command {
    Listen {
        addr: Multiaddr,
        reply: oneshot::Sender<Result<Multiaddr>>,
    },
    Dial {
        opts: DialOpts,
        expected: Option<PeerId>,
        reply: ConnectionReply,
    },
    /// Upgrade an outbound circuit to `remote` through `relay`
    DialCircuit {
        stream: BoxedStream,
        relay: PeerId,
        remote: PeerId,
        reply: ConnectionReply,
    },
    /// Upgrade an inbound circuit from `remote` through `relay`
    AcceptCircuit {
        stream: BoxedStream,
        relay: PeerId,
        remote: PeerId,
        reply: ConnectionReply,
    },
    Close(ConnectionId),
    Disconnect(PeerId),
}

/// State shared by host handles and the driver
struct Shared {
    peer_id: PeerId,
    peer_store: PeerStore,
    connections: Mutex<HashMap<PeerId, Vec<Connection>>>,
    listen_addrs: RwLock<Vec<Multiaddr>>,
    events: broadcast::Sender<HostEvent>,
    token: CancellationToken,
}

impl Shared {
    fn register(&self, connection: Connection) {
        let peer = connection.remote_peer();
        let relayed = connection.is_relayed();
        self.connections
            .lock()
            .entry(peer)
            .or_default()
            .insert(0, connection.clone());

        match connection.relayed_via() {
            Some(relay) => info!("Connected to {} via relay {}", peer, relay),
            None => info!("Connected to {} at {}", peer, connection.remote_addr()),
        }
        let _ = self.events.send(HostEvent::ConnectionEstablished { peer, relayed });
    }

    fn find(&self, peer: &PeerId, id: ConnectionId) -> Option<Connection> {
        self.connections
            .lock()
            .get(peer)?
            .iter()
            .find(|c| c.id() == id)
            .cloned()
    }

    /// Drop a closed connection from the table
    fn forget(&self, peer: PeerId, id: ConnectionId) {
        let (removed, last) = {
            let mut connections = self.connections.lock();
            let Some(list) = connections.get_mut(&peer) else {
                return;
            };
            let removed = list.iter().position(|c| c.id() == id).map(|i| list.remove(i));
            let last = list.is_empty();
            if last {
                connections.remove(&peer);
            }
            (removed, last)
        };

        let Some(connection) = removed else { return };
        connection.set_closed();
        debug!("Connection {} to {} removed", id, peer);
        if last {
            let _ = self.events.send(HostEvent::ConnectionClosed { peer });
        }
    }

    fn close_all(&self) {
        let all: Vec<Connection> = self
            .connections
            .lock()
            .drain()
            .flat_map(|(_, list)| list)
            .collect();
        for connection in all {
            connection.set_closed();
        }
    }
}

struct HostInner {
    keypair: Keypair,
    shared: Arc<Shared>,
    control: libp2p_stream::Control,
    commands: mpsc::UnboundedSender<Command>,
    config: HostConfig,
}

/// A network endpoint. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Host {
    inner: Arc<HostInner>,
}

impl std::fmt::Debug for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Host").field("peer_id", &self.inner.shared.peer_id).finish()
    }
}

impl Host {
    /// Start a host on `transport`. Must be called inside a tokio runtime.
    pub fn new(keypair: Keypair, transport: impl Into<HostTransport>) -> Result<Self> {
        Self::with_config(keypair, transport.into(), HostConfig::default())
    }

    pub fn with_config(keypair: Keypair, base: HostTransport, config: HostConfig) -> Result<Self> {
        let peer_id = keypair.public().to_peer_id();
        let (relayed, handoff) = RelayedTransport::new();

        let swarm = SwarmBuilder::with_existing_identity(keypair.clone())
            .with_tokio()
            .with_other_transport(|key| {
                transport::build(key, base, relayed)
                    .map_err(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>)
            })
            .map_err(|e| NetworkError::Handshake(e.to_string()))?
            .with_behaviour(CircuitCraftBehaviour::new)
            .map_err(|never: Infallible| -> NetworkError { match never {} })?
            .with_swarm_config(|c| c.with_idle_connection_timeout(config.idle_connection_timeout))
            .with_connection_timeout(config.handshake_timeout)
            .build();

        let control = swarm.behaviour().stream_control();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let shared = Arc::new(Shared {
            peer_id,
            peer_store: PeerStore::new(),
            connections: Mutex::new(HashMap::new()),
            listen_addrs: RwLock::new(Vec::new()),
            events,
            token: CancellationToken::new(),
        });

        let (commands, commands_rx) = mpsc::unbounded_channel();
        let driver = Driver {
            swarm,
            shared: shared.clone(),
            control: control.clone(),
            handoff,
            commands: commands_rx,
            weak_commands: commands.downgrade(),
            pending_listens: HashMap::new(),
            pending_dials: HashMap::new(),
            pending_inbound: HashMap::new(),
            inbound_circuits: HashMap::new(),
        };
        tokio::spawn(driver.run());

        Ok(Self {
            inner: Arc::new(HostInner {
                keypair,
                shared,
                control,
                commands,
                config,
            }),
        })
    }

    pub fn peer_id(&self) -> PeerId {
        self.inner.shared.peer_id
    }

    pub fn keypair(&self) -> &Keypair {
        &self.inner.keypair
    }

    pub fn peer_store(&self) -> &PeerStore {
        &self.inner.shared.peer_store
    }

    pub fn listen_addrs(&self) -> Vec<Multiaddr> {
        self.inner.shared.listen_addrs.read().clone()
    }

    pub fn handshake_timeout(&self) -> Duration {
        self.inner.config.handshake_timeout
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HostEvent> {
        self.inner.shared.events.subscribe()
    }

    fn command(&self, command: Command) -> Result<()> {
        if self.is_shutdown() {
            return Err(NetworkError::ConnectionClosed);
        }
        self.inner
            .commands
            .send(command)
            .map_err(|_| NetworkError::ConnectionClosed)
    }

    /// Start accepting connections on `addr`; returns the bound address
    pub async fn listen_on(&self, addr: Multiaddr) -> Result<Multiaddr> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Listen { addr, reply })?;
        rx.await.map_err(|_| NetworkError::ConnectionClosed)?
    }

    /// Dial a direct address. A trailing `/p2p/<id>` pins the expected peer;
    /// noise rejects any other identity.
    pub async fn dial(&self, addr: &Multiaddr) -> Result<Connection> {
        if is_circuit_addr(addr) {
            return Err(NetworkError::UnsupportedAddress(addr.to_string()));
        }
        let (base, expected) = split_peer_id(addr);
        if expected == Some(self.peer_id()) {
            return Err(NetworkError::DialSelf);
        }

        let opts = match expected {
            Some(peer) => DialOpts::peer_id(peer)
                .addresses(vec![base])
                .condition(PeerCondition::Always)
                .build(),
            None => DialOpts::unknown_peer_id().address(base).build(),
        };

        debug!("Dialing {}", addr);
        let (reply, rx) = oneshot::channel();
        self.command(Command::Dial { opts, expected, reply })?;
        let connection = rx.await.map_err(|_| NetworkError::ConnectionClosed)??;
        self.await_identify(&connection).await;
        Ok(connection)
    }

    /// Authenticate and multiplex a relay circuit to `remote`, adding the
    /// resulting connection to the table.
    pub async fn upgrade(&self, stream: BoxedStream, role: Role, relay: PeerId, remote: PeerId) -> Result<Connection> {
        if remote == self.peer_id() {
            return Err(NetworkError::DialSelf);
        }

        let (reply, rx) = oneshot::channel();
        let command = match role {
            Role::Dialer => Command::DialCircuit {
                stream,
                relay,
                remote,
                reply,
            },
            Role::Listener => Command::AcceptCircuit {
                stream,
                relay,
                remote,
                reply,
            },
        };
        self.command(command)?;

        let connection = tokio::time::timeout(self.handshake_timeout(), rx)
            .await
            .map_err(|_| NetworkError::Timeout)?
            .map_err(|_| NetworkError::ConnectionClosed)??;
        self.await_identify(&connection).await;
        Ok(connection)
    }

    /// Give identify a chance to report the remote's protocols
    async fn await_identify(&self, connection: &Connection) {
        if tokio::time::timeout(self.handshake_timeout(), connection.identified())
            .await
            .is_err()
        {
            debug!("No identify from {} yet", connection.remote_peer());
        }
    }

    /// Best live connection to `peer`: direct before relayed, newest first
    pub fn connection(&self, peer: &PeerId) -> Option<Connection> {
        let connections = self.inner.shared.connections.lock();
        let list = connections.get(peer)?;
        list.iter()
            .filter(|c| !c.is_closed())
            .find(|c| !c.is_relayed())
            .or_else(|| list.iter().find(|c| !c.is_closed()))
            .cloned()
    }

    pub fn connections(&self) -> Vec<Connection> {
        self.inner
            .shared
            .connections
            .lock()
            .values()
            .flatten()
            .filter(|c| !c.is_closed())
            .cloned()
            .collect()
    }

    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.inner
            .shared
            .connections
            .lock()
            .iter()
            .filter(|(_, list)| list.iter().any(|c| !c.is_closed()))
            .map(|(peer, _)| *peer)
            .collect()
    }

    pub fn is_connected(&self, peer: &PeerId) -> bool {
        self.connection(peer).is_some()
    }

    /// Accept inbound streams for `protocol`.
    ///
    /// Identify advertises the protocol on new connections and pushes it to
    /// existing ones.
    pub fn accept(&self, protocol: StreamProtocol) -> Result<IncomingStreams> {
        let mut control = self.inner.control.clone();
        let mut incoming = control
            .accept(protocol.clone())
            .map_err(|_| NetworkError::ProtocolAlreadyRegistered(protocol.to_string()))?;

        let (tx, rx) = mpsc::channel(ACCEPT_BACKLOG);
        let token = self.inner.shared.token.clone();
        let name = protocol.clone();
        tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tx.closed() => break,
                    next = incoming.next() => next,
                };
                let Some((peer, stream)) = next else { break };

                let inbound = InboundStream {
                    peer,
                    stream: Substream::new(stream, peer, name.clone()),
                };
                match tx.try_send(inbound) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!("Dropping {} stream from {}: backlog full", name, peer);
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => break,
                }
            }
            debug!("Stopped accepting {}", name);
        });

        debug!("Accepting {}", protocol);
        Ok(IncomingStreams::new(protocol, rx))
    }

    pub async fn open_stream(&self, peer: &PeerId, protocol: StreamProtocol) -> Result<Substream> {
        let connection = self
            .connection(peer)
            .ok_or(NetworkError::NotConnected(*peer))?;
        connection.open_stream(protocol).await
    }

    /// Close every connection to `peer`
    pub fn disconnect(&self, peer: &PeerId) {
        let removed = self.inner.shared.connections.lock().remove(peer);
        let Some(list) = removed else { return };
        for connection in &list {
            connection.set_closed();
        }
        let _ = self.inner.commands.send(Command::Disconnect(*peer));
        let _ = self
            .inner
            .shared
            .events
            .send(HostEvent::ConnectionClosed { peer: *peer });
    }

    /// Stop listeners and close all connections
    pub fn shutdown(&self) {
        if self.inner.shared.token.is_cancelled() {
            return;
        }
        info!("Shutting down host {}", self.peer_id());
        self.inner.shared.token.cancel();
        self.inner.shared.close_all();
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.shared.token.is_cancelled()
    }

    /// Token cancelled on [`Host::shutdown`], for tasks tied to this host
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shared.token.clone()
    }
}

struct PendingDial {
    expected: Option<PeerId>,
    reply: ConnectionReply,
}

/// Owns the swarm. Exits on shutdown or once every host handle is gone.
struct Driver {
    swarm: Swarm<CircuitCraftBehaviour>,
    shared: Arc<Shared>,
    control: libp2p_stream::Control,
    handoff: CircuitHandoff,
    commands: mpsc::UnboundedReceiver<Command>,
    weak_commands: mpsc::WeakUnboundedSender<Command>,
    pending_listens: HashMap<ListenerId, oneshot::Sender<Result<Multiaddr>>>,
    pending_dials: HashMap<ConnectionId, PendingDial>,
    /// Inbound circuits handed to the transport, by send-back address
    pending_inbound: HashMap<Multiaddr, VecDeque<ConnectionReply>>,
    inbound_circuits: HashMap<ConnectionId, ConnectionReply>,
}

impl Driver {
    async fn run(mut self) {
        if let Err(e) = self.swarm.listen_on(circuit_listen_addr()) {
            warn!("Relayed connections disabled: {}", e);
        }

        loop {
            tokio::select! {
                _ = self.shared.token.cancelled() => break,
                command = self.commands.recv() => match command {
                    Some(command) => self.on_command(command),
                    None => break,
                },
                event = self.swarm.select_next_some() => self.on_swarm_event(event),
            }
        }

        self.shared.close_all();
        debug!("Host {} stopped", self.shared.peer_id);
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Listen { addr, reply } => match self.swarm.listen_on(addr) {
                Ok(id) => {
                    self.pending_listens.insert(id, reply);
                }
                Err(TransportError::MultiaddrNotSupported(addr)) => {
                    let _ = reply.send(Err(NetworkError::UnsupportedAddress(addr.to_string())));
                }
                Err(TransportError::Other(e)) => {
                    let _ = reply.send(Err(NetworkError::Io(e)));
                }
            },
            Command::Dial { opts, expected, reply } => {
                self.dial(opts, expected, reply);
            }
            Command::DialCircuit {
                stream,
                relay,
                remote,
                reply,
            } => {
                let addr = circuit_addr(&Multiaddr::empty(), relay, remote);
                self.handoff.push_outbound(addr.clone(), stream);
                let opts = DialOpts::peer_id(remote)
                    .addresses(vec![addr.clone()])
                    .condition(PeerCondition::Always)
                    .build();
                if !self.dial(opts, Some(remote), reply) {
                    self.handoff.discard_outbound(&addr);
                }
            }
            Command::AcceptCircuit {
                stream,
                relay,
                remote,
                reply,
            } => {
                let send_back_addr = circuit_addr(&Multiaddr::empty(), relay, remote);
                self.pending_inbound
                    .entry(send_back_addr.clone())
                    .or_default()
                    .push_back(reply);
                if !self.handoff.push_inbound(send_back_addr.clone(), stream) {
                    if let Some(reply) = self.take_pending_inbound(&send_back_addr) {
                        let _ = reply.send(Err(NetworkError::ConnectionClosed));
                    }
                }
            }
            Command::Close(id) => {
                self.swarm.close_connection(id);
            }
            Command::Disconnect(peer) => {
                let _ = self.swarm.disconnect_peer_id(peer);
            }
        }
    }

    /// Start a dial; false if the swarm refused it outright
    fn dial(&mut self, opts: DialOpts, expected: Option<PeerId>, reply: ConnectionReply) -> bool {
        let id = opts.connection_id();
        match self.swarm.dial(opts) {
            Ok(()) => {
                self.pending_dials.insert(id, PendingDial { expected, reply });
                true
            }
            Err(e) => {
                let _ = reply.send(Err(dial_error(e, expected)));
                false
            }
        }
    }

    fn take_pending_inbound(&mut self, send_back_addr: &Multiaddr) -> Option<ConnectionReply> {
        let queue = self.pending_inbound.get_mut(send_back_addr)?;
        let reply = queue.pop_front();
        if queue.is_empty() {
            self.pending_inbound.remove(send_back_addr);
        }
        reply
    }

    fn on_swarm_event(&mut self, event: SwarmEvent<CircuitCraftBehaviourEvent>) {
        match event {
            SwarmEvent::NewListenAddr { listener_id, address } => {
                info!("Listening on {}/p2p/{}", address, self.shared.peer_id);
                self.shared.listen_addrs.write().push(address.clone());
                if let Some(reply) = self.pending_listens.remove(&listener_id) {
                    let _ = reply.send(Ok(address));
                }
            }
            SwarmEvent::ExpiredListenAddr { address, .. } => {
                self.shared.listen_addrs.write().retain(|a| a != &address);
            }
            SwarmEvent::ListenerClosed {
                listener_id,
                addresses,
                reason,
            } => {
                debug!("Listener {:?} closed", listener_id);
                self.shared.listen_addrs.write().retain(|a| !addresses.contains(a));
                if let Some(reply) = self.pending_listens.remove(&listener_id) {
                    let err = match reason {
                        Ok(()) => NetworkError::ConnectionClosed,
                        Err(e) => NetworkError::Io(e),
                    };
                    let _ = reply.send(Err(err));
                }
            }
            SwarmEvent::ListenerError { listener_id, error } => {
                warn!("Listener {:?} error: {}", listener_id, error);
            }
            SwarmEvent::IncomingConnection {
                connection_id,
                send_back_addr,
                ..
            } => {
                if let Some(reply) = self.take_pending_inbound(&send_back_addr) {
                    self.inbound_circuits.insert(connection_id, reply);
                }
            }
            SwarmEvent::IncomingConnectionError {
                connection_id,
                send_back_addr,
                error,
                ..
            } => {
                debug!("Inbound connection from {} failed: {}", send_back_addr, error);
                if let Some(reply) = self.inbound_circuits.remove(&connection_id) {
                    let _ = reply.send(Err(listen_error(error)));
                }
            }
            SwarmEvent::ConnectionEstablished {
                peer_id,
                connection_id,
                endpoint,
                ..
            } => self.on_established(peer_id, connection_id, &endpoint),
            SwarmEvent::OutgoingConnectionError {
                connection_id,
                peer_id,
                error,
            } => {
                debug!("Dial {:?} failed: {}", peer_id, error);
                if let Some(pending) = self.pending_dials.remove(&connection_id) {
                    let _ = pending.reply.send(Err(dial_error(error, pending.expected)));
                }
            }
            SwarmEvent::ConnectionClosed {
                peer_id,
                connection_id,
                cause,
                ..
            } => {
                match cause {
                    Some(cause) => debug!("Connection {} to {} closed: {}", connection_id, peer_id, cause),
                    None => debug!("Connection {} to {} closed", connection_id, peer_id),
                }
                self.shared.forget(peer_id, connection_id);
            }
            SwarmEvent::Behaviour(CircuitCraftBehaviourEvent::Identify(event)) => self.on_identify(event),
            _ => {}
        }
    }

    fn on_established(&mut self, peer: PeerId, id: ConnectionId, endpoint: &ConnectedPoint) {
        let role = if endpoint.is_dialer() {
            Role::Dialer
        } else {
            Role::Listener
        };
        let reply = match self.pending_dials.remove(&id) {
            Some(pending) => Some(pending.reply),
            None => self.inbound_circuits.remove(&id),
        };

        let remote_addr = endpoint.get_remote_address();
        let circuit = parse_circuit_addr(remote_addr);

        // An inbound circuit must authenticate as the peer the relay named
        if let Some(claimed) = circuit.as_ref().and_then(|c| c.destination) {
            if claimed != peer {
                warn!(
                    "Relayed connection claimed to be {} but authenticated as {}",
                    claimed, peer
                );
                self.swarm.close_connection(id);
                if let Some(reply) = reply {
                    let _ = reply.send(Err(NetworkError::PeerMismatch {
                        expected: claimed,
                        actual: peer,
                    }));
                }
                return;
            }
        }

        let remote_addr = match circuit {
            Some(_) => remote_addr.clone(),
            None => split_peer_id(remote_addr).0,
        };
        let connection = Connection::new(
            id,
            peer,
            role,
            remote_addr.clone(),
            self.control.clone(),
            self.weak_commands.clone(),
        );
        if role == Role::Dialer && !connection.is_relayed() {
            self.shared.peer_store.add_address(peer, remote_addr);
        }
        self.shared.register(connection.clone());

        if let Some(reply) = reply {
            if reply.send(Ok(connection)).is_err() {
                debug!("Connection {} to {} no longer awaited", id, peer);
            }
        }
    }

    fn on_identify(&mut self, event: identify::Event) {
        match event {
            identify::Event::Received {
                connection_id,
                peer_id,
                info,
            }
            | identify::Event::Pushed {
                connection_id,
                peer_id,
                info,
            } => {
                debug!(
                    "Identified {} ({}): {} protocols",
                    peer_id,
                    info.agent_version,
                    info.protocols.len()
                );
                for addr in &info.listen_addrs {
                    self.shared.peer_store.add_address(peer_id, addr.clone());
                }
                if let Some(connection) = self.shared.find(&peer_id, connection_id) {
                    connection.set_remote_info(info.protocols, info.listen_addrs);
                }
            }
            identify::Event::Error {
                connection_id,
                peer_id,
                error,
            } => {
                debug!("Identify with {} failed: {}", peer_id, error);
                if let Some(connection) = self.shared.find(&peer_id, connection_id) {
                    connection.mark_identified();
                }
            }
            _ => {}
        }
    }
}

fn dial_error(error: DialError, expected: Option<PeerId>) -> NetworkError {
    match error {
        DialError::WrongPeerId { obtained, .. } => match expected {
            Some(expected) => NetworkError::PeerMismatch {
                expected,
                actual: obtained,
            },
            None => NetworkError::Handshake(format!("unexpected peer {}", obtained)),
        },
        DialError::LocalPeerId { .. } => NetworkError::DialSelf,
        DialError::Aborted => NetworkError::ConnectionClosed,
        DialError::Transport(errors) => {
            let unsupported = !errors.is_empty()
                && errors
                    .iter()
                    .all(|(_, e)| matches!(e, TransportError::MultiaddrNotSupported(_)));
            let detail: Vec<String> = if unsupported {
                errors.iter().map(|(addr, _)| addr.to_string()).collect()
            } else {
                errors.iter().map(|(addr, e)| format!("{}: {}", addr, e)).collect()
            };
            if unsupported {
                NetworkError::UnsupportedAddress(detail.join(", "))
            } else {
                NetworkError::Transport(detail.join("; "))
            }
        }
        other => NetworkError::Transport(other.to_string()),
    }
}

fn listen_error(error: ListenError) -> NetworkError {
    match error {
        ListenError::LocalPeerId { .. } => NetworkError::DialSelf,
        ListenError::Aborted => NetworkError::ConnectionClosed,
        other => NetworkError::Handshake(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryTransport;
    use libp2p::multiaddr::Protocol;

    fn memory_host() -> Host {
        Host::new(Keypair::generate_ed25519(), MemoryTransport::new()).unwrap()
    }

    async fn listening_host() -> (Host, Multiaddr) {
        let host = memory_host();
        let addr = host.listen_on("/memory/0".parse().unwrap()).await.unwrap();
        (host, addr)
    }

    #[tokio::test]
    async fn test_dial_registers_both_sides() {
        let a = memory_host();
        let (b, addr) = listening_host().await;

        let mut events = b.subscribe();
        let connection = a.dial(&addr).await.unwrap();
        assert_eq!(connection.remote_peer(), b.peer_id());
        assert_eq!(connection.role(), Role::Dialer);
        assert!(a.is_connected(&b.peer_id()));

        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            event,
            HostEvent::ConnectionEstablished {
                peer: a.peer_id(),
                relayed: false
            }
        );
        assert!(b.is_connected(&a.peer_id()));
        assert_eq!(a.peer_store().direct_addresses(&b.peer_id()), vec![addr]);
    }

    #[tokio::test]
    async fn test_dial_self_rejected() {
        let (a, addr) = listening_host().await;
        let with_id = addr.with(Protocol::P2p(a.peer_id()));
        assert!(matches!(a.dial(&with_id).await, Err(NetworkError::DialSelf)));
    }

    #[tokio::test]
    async fn test_dial_pinned_to_other_identity_rejected() {
        let a = memory_host();
        let (b, addr) = listening_host().await;
        let claimed = PeerId::random();

        let result = a.dial(&addr.with(Protocol::P2p(claimed))).await;
        match result {
            Err(NetworkError::PeerMismatch { expected, actual }) => {
                assert_eq!(expected, claimed);
                assert_eq!(actual, b.peer_id());
            }
            other => panic!("expected a peer mismatch, got {:?}", other),
        }
        assert!(!a.is_connected(&claimed));
        assert!(!a.is_connected(&b.peer_id()));
    }

    #[tokio::test]
    async fn test_unsupported_address() {
        let a = memory_host();
        let tcp: Multiaddr = "/ip4/127.0.0.1/tcp/1".parse().unwrap();
        assert!(matches!(a.dial(&tcp).await, Err(NetworkError::UnsupportedAddress(_))));
        assert!(matches!(a.listen_on(tcp).await, Err(NetworkError::UnsupportedAddress(_))));
    }

    #[tokio::test]
    async fn test_open_stream_not_connected() {
        let a = memory_host();
        let stranger = PeerId::random();
        assert!(matches!(
            a.open_stream(&stranger, StreamProtocol::new("/x/1")).await,
            Err(NetworkError::NotConnected(p)) if p == stranger
        ));
    }

    #[tokio::test]
    async fn test_identify_reports_accepted_protocols() {
        const ECHO: StreamProtocol = StreamProtocol::new("/test/echo/1");
        let a = memory_host();
        let (b, addr) = listening_host().await;
        let _incoming = b.accept(ECHO).unwrap();
        assert!(matches!(
            b.accept(ECHO),
            Err(NetworkError::ProtocolAlreadyRegistered(_))
        ));

        let connection = a.dial(&addr).await.unwrap();
        assert!(connection.is_identified());
        assert!(connection.supports(&ECHO));
        assert!(!connection.supports(&StreamProtocol::new("/test/other/1")));
    }

    #[tokio::test]
    async fn test_disconnect_removes_connection() {
        let a = memory_host();
        let (b, addr) = listening_host().await;
        let connection = a.dial(&addr).await.unwrap();

        let mut events = b.subscribe();
        a.disconnect(&b.peer_id());
        assert!(!a.is_connected(&b.peer_id()));

        tokio::time::timeout(Duration::from_secs(5), connection.closed())
            .await
            .unwrap();
        let event = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(HostEvent::ConnectionClosed { peer }) = events.recv().await {
                    return peer;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(event, a.peer_id());
    }

    #[tokio::test]
    async fn test_shutdown_closes_connections() {
        let a = memory_host();
        let (_b, addr) = listening_host().await;
        let connection = a.dial(&addr).await.unwrap();

        a.shutdown();
        assert!(a.is_shutdown());
        assert!(connection.is_closed());
        assert!(a.connections().is_empty());
        assert!(matches!(a.dial(&addr).await, Err(NetworkError::ConnectionClosed)));
    }
}
