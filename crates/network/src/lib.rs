//! CircuitCraft Network
//!
//! The libp2p host that the relay protocols run on.
//!
//! ## Layers
//!
//! - [`transport`]: TCP or in-memory sockets plus relay circuits, authenticated
//!   with noise and multiplexed with yamux
//! - [`CircuitCraftBehaviour`]: identify and libp2p-stream protocol streams
//! - [`Host`]: swarm driver, connection table, [`PeerStore`]
//! - [`MessageStream`]: length-delimited bincode messages on a stream

mod behaviour;
mod connection;
mod error;
mod host;
mod peer_store;
mod protocol;
pub mod transport;

pub use behaviour::{CircuitCraftBehaviour, CircuitCraftBehaviourEvent, IDENTIFY_PROTOCOL};
pub use connection::{Connection, Role, Substream};
pub use error::{NetworkError, Result};
pub use host::{Host, HostConfig, HostEvent, DEFAULT_HANDSHAKE_TIMEOUT, DEFAULT_IDLE_CONNECTION_TIMEOUT};
pub use peer_store::PeerStore;
pub use protocol::{InboundStream, IncomingStreams, MessageStream, Rewind};
pub use transport::{AsyncStream, BoxedStream, HostTransport, MemoryTransport};

// Re-export commonly used libp2p types
pub use libp2p::identity::Keypair;
pub use libp2p::{Multiaddr, PeerId, StreamProtocol};
