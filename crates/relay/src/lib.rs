//! CircuitCraft Relay
//!
//! Relayed ("circuit") connectivity between peers that cannot reach each
//! other directly.
//!
//! ## Roles
//!
//! - Relay: [`RelayService`] answers HOP requests, admits them through the
//!   [`RelayRegistry`] and splices the two legs together
//! - Destination: [`CircuitListener`] answers STOP requests
//! - Initiator: [`CircuitConnection::open`] and the [`Dialer`] fallback

mod circuit;
mod dialer;
mod hop;
pub mod message;
mod registry;
mod splice;
mod stop;

pub use circuit::{order_candidates, CircuitConnection, CircuitOptions, RelayCandidate};
pub use dialer::{spawn_circuit_upgrader, Dialer};
pub use hop::RelayService;
pub use message::{CircuitMessage, StatusCode, HOP_PROTOCOL, MAX_MESSAGE_SIZE, STOP_PROTOCOL};
pub use registry::{
    AdmitDecision, RegistryStats, RejectReason, RelayRegistry, ReservationGuard, ReservationInfo,
};
pub use splice::{splice, SpliceEnd, SpliceOptions, SpliceOutcome};
pub use stop::CircuitListener;
