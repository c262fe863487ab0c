use std::fmt;

use serde::{Deserialize, Serialize};

/// Circuit identifier assigned by the relay when a HOP request is admitted
pub type CircuitId = u64;

/// Which end of a circuit the local node is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CircuitDirection {
    /// We sent the HOP request
    Outbound,
    /// We accepted a STOP request
    Inbound,
}

/// Lifecycle of a relay reservation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReservationState {
    /// Admitted, waiting for the destination to accept
    Requested,
    /// Both legs open, bytes are being spliced
    Active,
    /// Released after either leg closed
    Closed,
    /// Never activated within the reservation TTL
    Expired,
}

impl fmt::Display for ReservationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReservationState::Requested => "requested",
            ReservationState::Active => "active",
            ReservationState::Closed => "closed",
            ReservationState::Expired => "expired",
        };
        f.write_str(s)
    }
}

/// Short hex rendering of a circuit id for log lines
pub fn circuit_tag(id: CircuitId) -> String {
    format!("{:016x}", id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_circuit_tag_is_fixed_width() {
        assert_eq!(circuit_tag(1), "0000000000000001");
        assert_eq!(circuit_tag(u64::MAX).len(), 16);
    }

    #[test]
    fn test_reservation_state_display() {
        assert_eq!(ReservationState::Requested.to_string(), "requested");
        assert_eq!(ReservationState::Expired.to_string(), "expired");
    }
}
