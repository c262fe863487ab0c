//! CircuitCraft Node
//!
//! Wires a [`Host`](circuitcraft_network::Host) together with the relay
//! subsystem and a minimal block exchange.
//!
//! ## Components
//!
//! - **CircuitNode**: host, optional relay service, circuit listener and dialer
//! - **BlockStore**: in-memory blocks keyed by SHA-256 content id
//! - **Block exchange**: `/circuitcraft/block/1.0.0`, one request and one
//!   response per stream

mod block;
mod node;

pub use block::{fetch_block, serve_blocks, BlockRequest, BlockResponse, BlockStore, ContentId, BLOCK_PROTOCOL, MAX_BLOCK_SIZE};
pub use node::CircuitNode;

use circuitcraft_core::RelayError;
use circuitcraft_network::NetworkError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum NodeError {
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Relay error: {0}")]
    Relay(#[from] RelayError),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Invalid content id: {0}")]
    InvalidContentId(String),

    #[error("Block {0} not found")]
    BlockNotFound(ContentId),

    #[error("Block {0} failed hash verification")]
    Integrity(ContentId),

    #[error("Block too large: {0} bytes")]
    BlockTooLarge(usize),
}

pub type Result<T> = std::result::Result<T, NodeError>;
