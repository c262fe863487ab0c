//! Configuration types

use std::collections::HashSet;
use std::time::Duration;

use libp2p::PeerId;
use serde::{Deserialize, Serialize};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CircuitCraftConfig {
    /// Listen addresses and bootstrap peers
    #[serde(default)]
    pub network: NetworkSettings,

    /// Relay serving (relay-node role)
    #[serde(default)]
    pub relay: RelayConfig,

    /// Outbound connection behaviour
    #[serde(default)]
    pub dialer: DialerConfig,

    /// Accepting relayed connections (destination role)
    #[serde(default)]
    pub circuit: CircuitConfig,
}

/// Network settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkSettings {
    /// Listen addresses (multiaddr strings)
    #[serde(default = "default_listen_addrs")]
    pub listen_addrs: Vec<String>,

    /// Peers to connect to at startup (multiaddr ending in `/p2p/<id>`)
    #[serde(default)]
    pub bootstrap_peers: Vec<String>,
}

fn default_listen_addrs() -> Vec<String> {
    vec!["/ip4/0.0.0.0/tcp/4001".to_string()]
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            listen_addrs: default_listen_addrs(),
            bootstrap_peers: Vec::new(),
        }
    }
}

/// Relay serving configuration
///
/// A node with `enabled = false` does not advertise the HOP protocol and
/// never forwards traffic for other peers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Serve circuits for other peers
    #[serde(default)]
    pub enabled: bool,

    /// Maximum concurrent circuits (pending + active)
    #[serde(default = "default_max_circuits")]
    pub max_circuits: usize,

    /// Maximum circuits a single peer may take part in, as initiator or destination
    #[serde(default)]
    pub max_circuits_per_peer: Option<usize>,

    /// If non-empty, only these initiators are relayed
    #[serde(default, with = "peer_set")]
    pub allow_list: HashSet<PeerId>,

    /// Never relay from or to these peers
    #[serde(default, with = "peer_set")]
    pub deny_list: HashSet<PeerId>,

    /// Dial destinations we are not yet connected to ("active" relay)
    #[serde(default)]
    pub hop_dial: bool,

    /// Tear down circuits with no traffic for this many seconds
    #[serde(default)]
    pub circuit_idle_timeout_secs: Option<u64>,

    /// Maximum lifetime of a circuit in seconds
    #[serde(default)]
    pub circuit_duration_limit_secs: Option<u64>,

    /// Maximum bytes relayed per circuit (both directions)
    #[serde(default)]
    pub circuit_data_limit_bytes: Option<u64>,

    /// Expire admitted reservations the destination never accepted
    #[serde(default = "default_reservation_ttl")]
    pub reservation_ttl_secs: u64,
}

fn default_max_circuits() -> usize {
    16
}

fn default_reservation_ttl() -> u64 {
    30
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_circuits: default_max_circuits(),
            max_circuits_per_peer: None,
            allow_list: HashSet::new(),
            deny_list: HashSet::new(),
            hop_dial: false,
            circuit_idle_timeout_secs: None,
            circuit_duration_limit_secs: None,
            circuit_data_limit_bytes: None,
            reservation_ttl_secs: default_reservation_ttl(),
        }
    }
}

impl RelayConfig {
    /// Relay serving enabled with default limits
    pub fn enabled() -> Self {
        Self {
            enabled: true,
            ..Self::default()
        }
    }

    pub fn circuit_idle_timeout(&self) -> Option<Duration> {
        self.circuit_idle_timeout_secs.map(Duration::from_secs)
    }

    pub fn circuit_duration_limit(&self) -> Option<Duration> {
        self.circuit_duration_limit_secs.map(Duration::from_secs)
    }

    pub fn reservation_ttl(&self) -> Duration {
        Duration::from_secs(self.reservation_ttl_secs)
    }
}

/// Order in which relay candidates are tried
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RelaySelection {
    /// Candidate order, first success wins
    #[default]
    InOrder,
    /// Rotate the starting candidate on every attempt
    RoundRobin,
    /// Shuffle candidates
    Random,
}

/// Outbound connection behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DialerConfig {
    /// Fall back to a relayed circuit when direct dialing fails
    #[serde(default = "default_true")]
    pub relay_fallback: bool,

    /// HOP/STOP handshake timeout in milliseconds
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_ms: u64,

    /// Per-address direct dial timeout in milliseconds
    #[serde(default = "default_dial_timeout")]
    pub dial_timeout_ms: u64,

    /// Relay candidate ordering
    #[serde(default)]
    pub selection: RelaySelection,
}

fn default_true() -> bool {
    true
}

fn default_handshake_timeout() -> u64 {
    10_000
}

fn default_dial_timeout() -> u64 {
    5_000
}

impl Default for DialerConfig {
    fn default() -> Self {
        Self {
            relay_fallback: true,
            handshake_timeout_ms: default_handshake_timeout(),
            dial_timeout_ms: default_dial_timeout(),
            selection: RelaySelection::default(),
        }
    }
}

impl DialerConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }
}

/// Destination-side circuit acceptance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitConfig {
    /// Accept inbound relayed connections (answer STOP requests)
    #[serde(default = "default_true")]
    pub accept_relayed: bool,

    /// Refuse relayed connections from these initiators
    #[serde(default, with = "peer_set")]
    pub deny_list: HashSet<PeerId>,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            accept_relayed: true,
            deny_list: HashSet::new(),
        }
    }
}

/// Serialize peer sets as lists of base58 peer id strings
mod peer_set {
    use std::collections::HashSet;
    use std::str::FromStr;

    use libp2p::PeerId;
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(set: &HashSet<PeerId>, serializer: S) -> Result<S::Ok, S::Error> {
        let mut ids: Vec<String> = set.iter().map(|p| p.to_string()).collect();
        ids.sort();
        serializer.collect_seq(ids)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<HashSet<PeerId>, D::Error> {
        let ids = Vec::<String>::deserialize(deserializer)?;
        ids.iter()
            .map(|s| PeerId::from_str(s).map_err(D::Error::custom))
            .collect()
    }
}
