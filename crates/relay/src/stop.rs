//! STOP protocol handler (destination role)

use std::time::Duration;

use circuitcraft_core::{circuit_tag, CircuitConfig, CircuitDirection, CircuitId};
use circuitcraft_network::{Host, InboundStream, MessageStream, Result as NetworkResult, Substream};
use libp2p::PeerId;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::circuit::CircuitConnection;
use crate::message::{self, decode_addrs, decode_peer, CircuitMessage, StatusCode, STOP_PROTOCOL};

/// Accepted circuits waiting for the application
const INBOUND_CIRCUIT_QUEUE: usize = 32;

/// Inbound circuits accepted through the STOP protocol
pub struct CircuitListener {
    rx: mpsc::Receiver<CircuitConnection>,
}

impl CircuitListener {
    /// Register the STOP protocol on `host` and start answering requests.
    pub fn spawn(host: &Host, config: CircuitConfig, handshake_timeout: Duration) -> NetworkResult<Self> {
        let mut incoming = host.accept(STOP_PROTOCOL)?;
        let (tx, rx) = mpsc::channel(INBOUND_CIRCUIT_QUEUE);
        let local = host.peer_id();
        let host = host.clone();
        let token = host.shutdown_token();

        tokio::spawn(async move {
            loop {
                let inbound = tokio::select! {
                    _ = token.cancelled() => break,
                    inbound = incoming.next() => inbound,
                };
                let Some(inbound) = inbound else { break };

                let tx = tx.clone();
                let config = config.clone();
                let host = host.clone();
                tokio::spawn(async move {
                    let relay = inbound.peer;
                    match handle_stop(&host, local, &config, handshake_timeout, inbound).await {
                        Some(circuit) => {
                            if tx.send(circuit).await.is_err() {
                                debug!("Circuit listener dropped; discarding circuit from relay {}", relay);
                            }
                        }
                        None => debug!("STOP request from relay {} not accepted", relay),
                    }
                });
            }
            debug!("STOP handler on {} stopped", local);
        });

        Ok(Self { rx })
    }

    pub async fn next(&mut self) -> Option<CircuitConnection> {
        self.rx.recv().await
    }
}

async fn handle_stop(
    host: &Host,
    local: PeerId,
    config: &CircuitConfig,
    handshake_timeout: Duration,
    inbound: InboundStream,
) -> Option<CircuitConnection> {
    let InboundStream { peer: relay, stream } = inbound;
    let mut stream = message::framed(stream);

    let request = match tokio::time::timeout(handshake_timeout, message::recv(&mut stream)).await {
        Ok(Ok(CircuitMessage::Stop(request))) => request,
        Ok(Ok(other)) => {
            warn!("Expected STOP from relay {}, got {:?}", relay, other);
            reply(&mut stream, None, StatusCode::MalformedMessage).await;
            return None;
        }
        Ok(Err(e)) => {
            debug!("Failed to read STOP from relay {}: {}", relay, e);
            return None;
        }
        Err(_) => {
            debug!("STOP request from relay {} timed out", relay);
            return None;
        }
    };

    let circuit_id = request.circuit_id;
    let (src, dst) = match (decode_peer(&request.src), decode_peer(&request.dst)) {
        (Some(src), Some(dst)) => (src, dst),
        _ => {
            warn!("Malformed STOP from relay {}", relay);
            reply(&mut stream, Some(circuit_id), StatusCode::MalformedMessage).await;
            return None;
        }
    };

    let refusal = if !config.accept_relayed {
        Some("relayed connections disabled")
    } else if config.deny_list.contains(&src) {
        Some("initiator denied")
    } else if dst != local {
        Some("circuit addressed to another peer")
    } else {
        None
    };

    if let Some(why) = refusal {
        warn!(
            "Refusing circuit {} from {} via {}: {}",
            circuit_tag(circuit_id),
            src,
            relay,
            why
        );
        reply(&mut stream, Some(circuit_id), StatusCode::ConnectionRefused).await;
        return None;
    }

    for addr in decode_addrs(&request.src_addrs) {
        host.peer_store().add_address(src, addr);
    }

    let ok = CircuitMessage::status(Some(circuit_id), StatusCode::Ok);
    if let Err(e) = message::send(&mut stream, &ok).await {
        debug!("Relay {} went away during STOP: {}", relay, e);
        return None;
    }

    info!(
        "Accepted circuit {} from {} via {}",
        circuit_tag(circuit_id),
        src,
        relay
    );
    Some(CircuitConnection::new(
        stream.into_inner(),
        relay,
        src,
        circuit_id,
        CircuitDirection::Inbound,
    ))
}

async fn reply(stream: &mut MessageStream<Substream>, circuit_id: Option<CircuitId>, code: StatusCode) {
    if let Err(e) = message::send(stream, &CircuitMessage::status(circuit_id, code)).await {
        debug!("Failed to send {:?} status: {}", code, e);
    }
}
