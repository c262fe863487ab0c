//! Transport for connections carried over relay circuits
//!
//! Circuits are negotiated outside the swarm (HOP/STOP streams). The host
//! hands each finished circuit stream to this transport: outbound ones are
//! picked up by the swarm's dial of the matching `/p2p/<relay>/p2p-circuit/
//! p2p/<remote>` address, inbound ones surface as incoming connections on the
//! `/p2p-circuit` listener. Either way the stream then goes through the same
//! noise and yamux upgrade as a direct connection.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::{self, Ready};
use libp2p::core::transport::{DialOpts, ListenerId, TransportEvent};
use libp2p::multiaddr::Protocol;
use libp2p::{Multiaddr, Transport, TransportError};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::compat::{Compat, TokioAsyncReadCompatExt};

use super::BoxedStream;

type OutboundCircuits = Arc<Mutex<HashMap<Multiaddr, VecDeque<BoxedStream>>>>;

type CircuitUpgrade = Ready<Result<Compat<BoxedStream>, io::Error>>;

/// Address the host listens on for inbound circuits
pub(crate) fn circuit_listen_addr() -> Multiaddr {
    Multiaddr::empty().with(Protocol::P2pCircuit)
}

fn is_circuit(addr: &Multiaddr) -> bool {
    addr.iter().any(|p| matches!(p, Protocol::P2pCircuit))
}

/// Host side of the relayed transport. Cheap to clone.
#[derive(Clone)]
pub(crate) struct CircuitHandoff {
    outbound: OutboundCircuits,
    inbound: mpsc::UnboundedSender<(Multiaddr, BoxedStream)>,
}

impl CircuitHandoff {
    /// Queue an outbound circuit for the next dial of `addr`
    pub(crate) fn push_outbound(&self, addr: Multiaddr, stream: BoxedStream) {
        self.outbound.lock().entry(addr).or_default().push_back(stream);
    }

    /// Drop the newest queued circuit for `addr`, after a dial that never
    /// reached the transport
    pub(crate) fn discard_outbound(&self, addr: &Multiaddr) {
        let mut outbound = self.outbound.lock();
        if let Some(queue) = outbound.get_mut(addr) {
            queue.pop_back();
            if queue.is_empty() {
                outbound.remove(addr);
            }
        }
    }

    /// Offer an inbound circuit to the listener. `send_back_addr` names the
    /// relay and the remote peer.
    pub(crate) fn push_inbound(&self, send_back_addr: Multiaddr, stream: BoxedStream) -> bool {
        self.inbound.send((send_back_addr, stream)).is_ok()
    }
}

/// Swarm side of the relayed transport
pub(crate) struct RelayedTransport {
    outbound: OutboundCircuits,
    inbound: mpsc::UnboundedReceiver<(Multiaddr, BoxedStream)>,
    listener: Option<ListenerId>,
    pending_events: VecDeque<TransportEvent<CircuitUpgrade, io::Error>>,
}

impl RelayedTransport {
    pub(crate) fn new() -> (Self, CircuitHandoff) {
        let outbound = OutboundCircuits::default();
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Self {
            outbound: outbound.clone(),
            inbound: rx,
            listener: None,
            pending_events: VecDeque::new(),
        };
        (transport, CircuitHandoff { outbound, inbound: tx })
    }
}

impl Transport for RelayedTransport {
    type Output = Compat<BoxedStream>;
    type Error = io::Error;
    type ListenerUpgrade = CircuitUpgrade;
    type Dial = CircuitUpgrade;

    fn listen_on(&mut self, id: ListenerId, addr: Multiaddr) -> Result<(), TransportError<Self::Error>> {
        if addr != circuit_listen_addr() {
            return Err(TransportError::MultiaddrNotSupported(addr));
        }
        if self.listener.is_some() {
            return Err(TransportError::Other(io::Error::new(
                io::ErrorKind::AddrInUse,
                "already listening for circuits",
            )));
        }
        self.listener = Some(id);
        Ok(())
    }

    fn remove_listener(&mut self, id: ListenerId) -> bool {
        if self.listener != Some(id) {
            return false;
        }
        self.listener = None;
        self.pending_events.push_back(TransportEvent::ListenerClosed {
            listener_id: id,
            reason: Ok(()),
        });
        true
    }

    fn dial(&mut self, addr: Multiaddr, _opts: DialOpts) -> Result<Self::Dial, TransportError<Self::Error>> {
        if !is_circuit(&addr) {
            return Err(TransportError::MultiaddrNotSupported(addr));
        }

        let stream = {
            let mut outbound = self.outbound.lock();
            let stream = outbound.get_mut(&addr).and_then(|queue| queue.pop_front());
            if outbound.get(&addr).is_some_and(|queue| queue.is_empty()) {
                outbound.remove(&addr);
            }
            stream
        };

        match stream {
            Some(stream) => Ok(future::ready(Ok(stream.compat()))),
            None => Err(TransportError::Other(io::Error::new(
                io::ErrorKind::NotConnected,
                format!("no circuit open for {}", addr),
            ))),
        }
    }

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<TransportEvent<Self::ListenerUpgrade, Self::Error>> {
        if let Some(event) = self.pending_events.pop_front() {
            return Poll::Ready(event);
        }

        loop {
            let Poll::Ready(Some((send_back_addr, stream))) = self.inbound.poll_recv(cx) else {
                return Poll::Pending;
            };
            // Circuits offered while nobody listens are dropped, closing them
            let Some(listener_id) = self.listener else {
                continue;
            };
            return Poll::Ready(TransportEvent::Incoming {
                listener_id,
                upgrade: future::ready(Ok(stream.compat())),
                local_addr: circuit_listen_addr(),
                send_back_addr,
            });
        }
    }
}
