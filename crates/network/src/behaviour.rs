//! Swarm behaviour for CircuitCraft hosts
//!
//! Identify tells each side which stream protocols the other accepts (a
//! relay advertises HOP this way); libp2p-stream carries every protocol
//! stream (HOP, STOP, blocks).

use libp2p::identity::Keypair;
use libp2p::swarm::NetworkBehaviour;
use libp2p::identify;

/// Identify protocol name
pub const IDENTIFY_PROTOCOL: &str = "/circuitcraft/id/1.0.0";

#[derive(NetworkBehaviour)]
pub struct CircuitCraftBehaviour {
    pub identify: identify::Behaviour,
    pub stream: libp2p_stream::Behaviour,
}

impl CircuitCraftBehaviour {
    pub fn new(keypair: &Keypair) -> Self {
        let identify = identify::Behaviour::new(
            identify::Config::new(IDENTIFY_PROTOCOL.to_string(), keypair.public())
                .with_agent_version(format!("circuitcraft/{}", env!("CARGO_PKG_VERSION"))),
        );

        Self {
            identify,
            stream: libp2p_stream::Behaviour::new(),
        }
    }

    /// Handle for opening and accepting protocol streams
    pub fn stream_control(&self) -> libp2p_stream::Control {
        self.stream.new_control()
    }
}
