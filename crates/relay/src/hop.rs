//! HOP protocol handler (relay-node role)
//!
//! For every inbound HOP stream: validate the request, ask the registry for
//! admission, find the destination, run the STOP exchange, then splice the
//! two legs until one of them closes.

use std::sync::Arc;
use std::time::Duration;

use circuitcraft_core::{circuit_tag, RelayConfig};
use circuitcraft_network::{Connection, Host, InboundStream, MessageStream, NetworkError, Result as NetworkResult, Substream};
use libp2p::multiaddr::Protocol;
use libp2p::{Multiaddr, PeerId};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::circuit::CircuitStream;
use crate::message::{self, decode_addrs, decode_peer, CircuitMessage, StatusCode, STOP_PROTOCOL};
use crate::registry::{AdmitDecision, RelayRegistry, ReservationGuard};
use crate::splice::{splice, SpliceOptions};
use crate::HOP_PROTOCOL;

struct RelayInner {
    host: Host,
    registry: RelayRegistry,
    config: RelayConfig,
    handshake_timeout: Duration,
    token: CancellationToken,
}

/// Serves circuits for other peers. Stops when dropped or on [`RelayService::stop`].
pub struct RelayService {
    inner: Arc<RelayInner>,
}

impl RelayService {
    /// Register the HOP protocol on `host` and start serving.
    ///
    /// Peers learn about HOP through identify: at connection time, or from an
    /// identify push on connections that already exist.
    pub fn spawn(host: &Host, config: RelayConfig, handshake_timeout: Duration) -> NetworkResult<Self> {
        let mut incoming = host.accept(HOP_PROTOCOL)?;
        let inner = Arc::new(RelayInner {
            host: host.clone(),
            registry: RelayRegistry::new(&config),
            config,
            handshake_timeout,
            token: host.shutdown_token().child_token(),
        });

        info!(
            "Relay service started on {} (max {} circuits)",
            host.peer_id(),
            inner.config.max_circuits
        );

        let service = inner.clone();
        tokio::spawn(async move {
            loop {
                let inbound = tokio::select! {
                    _ = service.token.cancelled() => break,
                    inbound = incoming.next() => inbound,
                };
                let Some(inbound) = inbound else { break };
                tokio::spawn(service.clone().handle_hop(inbound));
            }
            debug!("Relay service on {} stopped", service.host.peer_id());
        });

        Ok(Self { inner })
    }

    pub fn registry(&self) -> &RelayRegistry {
        &self.inner.registry
    }

    /// Stop accepting HOP requests and tear down live circuits
    pub fn stop(&self) {
        self.inner.token.cancel();
    }
}

impl Drop for RelayService {
    fn drop(&mut self) {
        self.inner.token.cancel();
    }
}

impl RelayInner {
    async fn handle_hop(self: Arc<Self>, inbound: InboundStream) {
        let InboundStream { peer: initiator, stream } = inbound;
        let mut stream = message::framed(stream);

        let request = match tokio::time::timeout(self.handshake_timeout, message::recv(&mut stream)).await {
            Ok(Ok(CircuitMessage::Hop(request))) => request,
            Ok(Ok(other)) => {
                warn!("Expected HOP from {}, got {:?}", initiator, other);
                reply(&mut stream, StatusCode::MalformedMessage).await;
                return;
            }
            Ok(Err(e)) => {
                debug!("Failed to read HOP from {}: {}", initiator, e);
                return;
            }
            Err(_) => {
                debug!("HOP request from {} timed out", initiator);
                return;
            }
        };

        let (src, dst) = match (decode_peer(&request.src), decode_peer(&request.dst)) {
            (Some(src), Some(dst)) if src == initiator => (src, dst),
            _ => {
                warn!("Malformed HOP from {}", initiator);
                reply(&mut stream, StatusCode::MalformedMessage).await;
                return;
            }
        };

        if dst == self.host.peer_id() {
            warn!("{} asked us to relay to ourselves", src);
            reply(&mut stream, StatusCode::CantRelayToSelf).await;
            return;
        }

        let guard = match self.registry.admit(src, dst).await {
            AdmitDecision::Admitted(guard) => guard,
            AdmitDecision::Rejected(_) => {
                reply(&mut stream, StatusCode::PermissionDenied).await;
                return;
            }
        };

        let dst_addrs = decode_addrs(&request.dst_addrs);
        let stop_stream = match self.connect_destination(&guard, src, dst, &dst_addrs).await {
            Ok(stop_stream) => stop_stream,
            Err(code) => {
                warn!(
                    "Circuit {} {} -> {} failed: {:?}",
                    circuit_tag(guard.circuit_id()),
                    src,
                    dst,
                    code
                );
                reply(&mut stream, code).await;
                return;
            }
        };

        if !guard.activate().await {
            warn!("Circuit {} expired before activation", circuit_tag(guard.circuit_id()));
            reply(&mut stream, StatusCode::HandshakeTimeout).await;
            return;
        }

        let ok = CircuitMessage::status(Some(guard.circuit_id()), StatusCode::Ok);
        if let Err(e) = message::send(&mut stream, &ok).await {
            debug!("Initiator {} went away before circuit start: {}", src, e);
            return;
        }

        self.run_circuit(guard, stream.into_inner(), stop_stream).await;
    }

    /// Find (or dial) the destination and run the STOP exchange
    async fn connect_destination(
        &self,
        guard: &ReservationGuard,
        src: PeerId,
        dst: PeerId,
        dst_addrs: &[Multiaddr],
    ) -> std::result::Result<CircuitStream, StatusCode> {
        // Circuits are not stacked on circuits
        let direct = self.host.connection(&dst).filter(|c| !c.is_relayed());
        let dst_conn = match direct {
            Some(connection) => connection,
            None if self.config.hop_dial => self.dial_destination(dst, dst_addrs).await.ok_or(StatusCode::NoRoute)?,
            None => {
                debug!("No connection to destination {}", dst);
                return Err(StatusCode::NoRoute);
            }
        };

        let src_addrs = self.host.peer_store().direct_addresses(&src);
        let request = CircuitMessage::stop(guard.circuit_id(), src, dst, &src_addrs);
        tokio::time::timeout(self.handshake_timeout, stop_exchange(&dst_conn, dst, &request))
            .await
            .map_err(|_| StatusCode::HandshakeTimeout)?
    }

    async fn dial_destination(&self, dst: PeerId, hinted: &[Multiaddr]) -> Option<Connection> {
        let mut addrs = hinted.to_vec();
        for known in self.host.peer_store().direct_addresses(&dst) {
            if !addrs.contains(&known) {
                addrs.push(known);
            }
        }

        for addr in addrs {
            let target = addr.clone().with(Protocol::P2p(dst));
            match tokio::time::timeout(self.handshake_timeout, self.host.dial(&target)).await {
                Ok(Ok(connection)) => return Some(connection),
                Ok(Err(NetworkError::UnsupportedAddress(_))) => {}
                Ok(Err(e)) => debug!("Relay dial to {} at {} failed: {}", dst, addr, e),
                Err(_) => debug!("Relay dial to {} at {} timed out", dst, addr),
            }
        }
        None
    }

    async fn run_circuit(&self, guard: ReservationGuard, initiator_leg: CircuitStream, destination_leg: CircuitStream) {
        let circuit_id = guard.circuit_id();
        let options = SpliceOptions {
            idle_timeout: self.config.circuit_idle_timeout(),
            max_duration: self.config.circuit_duration_limit(),
            max_bytes: self.config.circuit_data_limit_bytes,
            cancel: self.token.child_token(),
        };

        let outcome = splice(initiator_leg, destination_leg, options).await;
        info!(
            "Circuit {} closed ({:?}): {} bytes out, {} bytes back",
            circuit_tag(circuit_id),
            outcome.end,
            outcome.a_to_b,
            outcome.b_to_a
        );
        guard.release();
    }
}

async fn stop_exchange(
    dst_conn: &Connection,
    dst: PeerId,
    request: &CircuitMessage,
) -> std::result::Result<CircuitStream, StatusCode> {
    let stop_stream = dst_conn.open_stream(STOP_PROTOCOL).await.map_err(|e| {
        debug!("Destination {} refused STOP stream: {}", dst, e);
        StatusCode::ConnectionRefused
    })?;
    let mut stop_stream = message::framed(stop_stream);

    if message::send(&mut stop_stream, request).await.is_err() {
        return Err(StatusCode::ConnectionRefused);
    }

    match message::recv(&mut stop_stream).await {
        Ok(CircuitMessage::Status {
            code: StatusCode::Ok, ..
        }) => Ok(stop_stream.into_inner()),
        Ok(other) => {
            debug!("Destination {} declined circuit: {:?}", dst, other);
            Err(StatusCode::ConnectionRefused)
        }
        Err(e) => {
            debug!("No STOP reply from {}: {}", dst, e);
            Err(StatusCode::ConnectionRefused)
        }
    }
}

async fn reply(stream: &mut MessageStream<Substream>, code: StatusCode) {
    if let Err(e) = message::send(stream, &CircuitMessage::status(None, code)).await {
        debug!("Failed to send {:?} status: {}", code, e);
    }
}
