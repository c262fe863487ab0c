//! CircuitCraft Core Types
//!
//! Shared identities, relay-qualified addresses, configuration and the relay
//! error taxonomy used by every CircuitCraft crate.

mod addr;
mod config;
mod error;
mod types;

pub use addr::*;
pub use config::*;
pub use error::*;
pub use types::*;

// Re-export the identity and address types used across the workspace
pub use libp2p::{Multiaddr, PeerId};
