//! Relay Registry
//!
//! Admission control and bookkeeping for the circuits a relay serves. All
//! state is owned by a single actor task; [`RelayRegistry`] handles send it
//! commands and await `oneshot` replies.
//!
//! ## Lifecycle
//!
//! `admit` creates a reservation in the `Requested` state and hands back a
//! [`ReservationGuard`]. The HOP handler activates it once the destination
//! accepted, and the guard releases it when the circuit ends. Reservations
//! that are never activated expire after the configured TTL.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::time::Duration;

use circuitcraft_core::{circuit_tag, CircuitId, RelayConfig, ReservationState};
use libp2p::PeerId;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Why an admission request was turned down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Relaying is switched off on this node
    RelayDisabled,
    /// Initiator or destination is on the deny list
    Denied,
    /// An allow list is configured and the initiator is not on it
    NotAllowed,
    /// `max_circuits` reached
    CapacityExhausted,
    /// Per-peer circuit limit reached for initiator or destination
    PeerLimit,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RejectReason::RelayDisabled => "relay disabled",
            RejectReason::Denied => "peer denied",
            RejectReason::NotAllowed => "initiator not on allow list",
            RejectReason::CapacityExhausted => "circuit capacity exhausted",
            RejectReason::PeerLimit => "per-peer circuit limit reached",
        };
        f.write_str(s)
    }
}

#[derive(Debug)]
pub enum AdmitDecision {
    Admitted(ReservationGuard),
    Rejected(RejectReason),
}

impl AdmitDecision {
    pub fn is_admitted(&self) -> bool {
        matches!(self, AdmitDecision::Admitted(_))
    }
}

/// Registry counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    /// Circuits currently splicing
    pub active: usize,
    /// Admitted, waiting for the destination
    pub pending: usize,
    pub admitted_total: u64,
    pub rejected_total: u64,
}

/// Snapshot of a live reservation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationInfo {
    pub circuit_id: CircuitId,
    pub initiator: PeerId,
    pub destination: PeerId,
    pub state: ReservationState,
    pub age: Duration,
}

enum Command {
    Admit {
        initiator: PeerId,
        destination: PeerId,
        reply: oneshot::Sender<Result<CircuitId, RejectReason>>,
    },
    Activate {
        circuit_id: CircuitId,
        reply: oneshot::Sender<bool>,
    },
    Release {
        circuit_id: CircuitId,
    },
    Stats {
        reply: oneshot::Sender<RegistryStats>,
    },
    Reservation {
        circuit_id: CircuitId,
        reply: oneshot::Sender<Option<ReservationInfo>>,
    },
    UpdatePolicy {
        allow: HashSet<PeerId>,
        deny: HashSet<PeerId>,
    },
}

/// Handle to the registry actor. Cheap to clone.
#[derive(Clone)]
pub struct RelayRegistry {
    cmd_tx: mpsc::UnboundedSender<Command>,
}

impl fmt::Debug for RelayRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayRegistry")
            .field("running", &!self.cmd_tx.is_closed())
            .finish()
    }
}

impl RelayRegistry {
    /// Spawn the registry actor. Must be called inside a tokio runtime.
    pub fn new(config: &RelayConfig) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let actor = RegistryActor::new(config);
        tokio::spawn(actor.run(cmd_rx));
        Self { cmd_tx }
    }

    /// Decide whether a circuit from `initiator` to `destination` may be relayed
    pub async fn admit(&self, initiator: PeerId, destination: PeerId) -> AdmitDecision {
        let (reply, rx) = oneshot::channel();
        let sent = self.cmd_tx.send(Command::Admit {
            initiator,
            destination,
            reply,
        });
        if sent.is_err() {
            return AdmitDecision::Rejected(RejectReason::RelayDisabled);
        }
        match rx.await {
            Ok(Ok(circuit_id)) => AdmitDecision::Admitted(ReservationGuard {
                circuit_id,
                cmd_tx: self.cmd_tx.clone(),
                released: false,
            }),
            Ok(Err(reason)) => AdmitDecision::Rejected(reason),
            Err(_) => AdmitDecision::Rejected(RejectReason::RelayDisabled),
        }
    }

    /// Mark a reservation active. Returns false if it no longer exists.
    pub async fn activate(&self, circuit_id: CircuitId) -> bool {
        let (reply, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Activate { circuit_id, reply }).is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    pub fn release(&self, circuit_id: CircuitId) {
        let _ = self.cmd_tx.send(Command::Release { circuit_id });
    }

    pub async fn stats(&self) -> RegistryStats {
        let (reply, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Stats { reply }).is_err() {
            return RegistryStats::default();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn reservation(&self, circuit_id: CircuitId) -> Option<ReservationInfo> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Reservation { circuit_id, reply })
            .ok()?;
        rx.await.ok().flatten()
    }

    /// Replace the allow and deny lists. Existing circuits are not affected.
    pub fn update_policy(&self, allow: HashSet<PeerId>, deny: HashSet<PeerId>) {
        let _ = self.cmd_tx.send(Command::UpdatePolicy { allow, deny });
    }
}

/// Releases its reservation when dropped
pub struct ReservationGuard {
    circuit_id: CircuitId,
    cmd_tx: mpsc::UnboundedSender<Command>,
    released: bool,
}

impl fmt::Debug for ReservationGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReservationGuard")
            .field("circuit_id", &circuit_tag(self.circuit_id))
            .finish()
    }
}

impl ReservationGuard {
    pub fn circuit_id(&self) -> CircuitId {
        self.circuit_id
    }

    pub async fn activate(&self) -> bool {
        let (reply, rx) = oneshot::channel();
        let sent = self.cmd_tx.send(Command::Activate {
            circuit_id: self.circuit_id,
            reply,
        });
        if sent.is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    pub fn release(mut self) {
        self.send_release();
    }

    fn send_release(&mut self) {
        if !self.released {
            self.released = true;
            let _ = self.cmd_tx.send(Command::Release {
                circuit_id: self.circuit_id,
            });
        }
    }
}

impl Drop for ReservationGuard {
    fn drop(&mut self) {
        self.send_release();
    }
}

struct Reservation {
    initiator: PeerId,
    destination: PeerId,
    state: ReservationState,
    created_at: Instant,
}

impl Reservation {
    fn involves(&self, peer: &PeerId) -> bool {
        self.initiator == *peer || self.destination == *peer
    }
}

struct RegistryActor {
    enabled: bool,
    max_circuits: usize,
    max_circuits_per_peer: Option<usize>,
    allow_list: HashSet<PeerId>,
    deny_list: HashSet<PeerId>,
    reservation_ttl: Duration,
    reservations: HashMap<CircuitId, Reservation>,
    admitted_total: u64,
    rejected_total: u64,
}

impl RegistryActor {
    fn new(config: &RelayConfig) -> Self {
        Self {
            enabled: config.enabled,
            max_circuits: config.max_circuits,
            max_circuits_per_peer: config.max_circuits_per_peer,
            allow_list: config.allow_list.clone(),
            deny_list: config.deny_list.clone(),
            reservation_ttl: config.reservation_ttl(),
            reservations: HashMap::new(),
            admitted_total: 0,
            rejected_total: 0,
        }
    }

    fn sweep_interval(&self) -> Duration {
        (self.reservation_ttl / 2).clamp(Duration::from_millis(100), Duration::from_secs(5))
    }

    async fn run(mut self, mut cmd_rx: mpsc::UnboundedReceiver<Command>) {
        let mut sweep = tokio::time::interval(self.sweep_interval());
        sweep.tick().await; // Skip initial tick

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(Command::Admit { initiator, destination, reply }) => {
                            let result = self.admit(initiator, destination);
                            let _ = reply.send(result);
                        }
                        Some(Command::Activate { circuit_id, reply }) => {
                            let _ = reply.send(self.activate(circuit_id));
                        }
                        Some(Command::Release { circuit_id }) => self.release(circuit_id),
                        Some(Command::Stats { reply }) => {
                            let _ = reply.send(self.stats());
                        }
                        Some(Command::Reservation { circuit_id, reply }) => {
                            let _ = reply.send(self.info(circuit_id));
                        }
                        Some(Command::UpdatePolicy { allow, deny }) => {
                            debug!("Relay policy updated: {} allowed, {} denied", allow.len(), deny.len());
                            self.allow_list = allow;
                            self.deny_list = deny;
                        }
                        None => {
                            debug!("Relay registry shutting down");
                            break;
                        }
                    }
                }
                _ = sweep.tick() => self.expire_stale(),
            }
        }
    }

    fn admit(&mut self, initiator: PeerId, destination: PeerId) -> Result<CircuitId, RejectReason> {
        if let Err(reason) = self.check(&initiator, &destination) {
            self.rejected_total += 1;
            warn!("Rejected circuit {} -> {}: {}", initiator, destination, reason);
            return Err(reason);
        }

        let circuit_id = self.next_circuit_id();
        self.reservations.insert(
            circuit_id,
            Reservation {
                initiator,
                destination,
                state: ReservationState::Requested,
                created_at: Instant::now(),
            },
        );
        self.admitted_total += 1;
        debug!(
            "Admitted circuit {}: {} -> {} ({} live)",
            circuit_tag(circuit_id),
            initiator,
            destination,
            self.reservations.len()
        );
        Ok(circuit_id)
    }

    fn check(&self, initiator: &PeerId, destination: &PeerId) -> Result<(), RejectReason> {
        if !self.enabled {
            return Err(RejectReason::RelayDisabled);
        }
        if self.deny_list.contains(initiator) || self.deny_list.contains(destination) {
            return Err(RejectReason::Denied);
        }
        if !self.allow_list.is_empty() && !self.allow_list.contains(initiator) {
            return Err(RejectReason::NotAllowed);
        }
        if self.reservations.len() >= self.max_circuits {
            return Err(RejectReason::CapacityExhausted);
        }
        if let Some(limit) = self.max_circuits_per_peer {
            let over = |peer: &PeerId| {
                self.reservations.values().filter(|r| r.involves(peer)).count() >= limit
            };
            if over(initiator) || over(destination) {
                return Err(RejectReason::PeerLimit);
            }
        }
        Ok(())
    }

    fn next_circuit_id(&self) -> CircuitId {
        loop {
            let id: CircuitId = rand::random();
            if id != 0 && !self.reservations.contains_key(&id) {
                return id;
            }
        }
    }

    fn activate(&mut self, circuit_id: CircuitId) -> bool {
        match self.reservations.get_mut(&circuit_id) {
            Some(reservation) if reservation.state == ReservationState::Requested => {
                reservation.state = ReservationState::Active;
                info!(
                    "Circuit {} active: {} -> {}",
                    circuit_tag(circuit_id),
                    reservation.initiator,
                    reservation.destination
                );
                true
            }
            Some(reservation) => reservation.state == ReservationState::Active,
            None => false,
        }
    }

    fn release(&mut self, circuit_id: CircuitId) {
        if let Some(mut reservation) = self.reservations.remove(&circuit_id) {
            reservation.state = ReservationState::Closed;
            debug!(
                "Circuit {} {} after {:?} ({} live)",
                circuit_tag(circuit_id),
                reservation.state,
                reservation.created_at.elapsed(),
                self.reservations.len()
            );
        }
    }

    fn expire_stale(&mut self) {
        let ttl = self.reservation_ttl;
        let stale: Vec<CircuitId> = self
            .reservations
            .iter()
            .filter(|(_, r)| r.state == ReservationState::Requested && r.created_at.elapsed() >= ttl)
            .map(|(id, _)| *id)
            .collect();

        for circuit_id in stale {
            if let Some(mut reservation) = self.reservations.remove(&circuit_id) {
                reservation.state = ReservationState::Expired;
                warn!(
                    "Circuit {} {}: {} -> {} never activated",
                    circuit_tag(circuit_id),
                    reservation.state,
                    reservation.initiator,
                    reservation.destination
                );
            }
        }
    }

    fn stats(&self) -> RegistryStats {
        let active = self
            .reservations
            .values()
            .filter(|r| r.state == ReservationState::Active)
            .count();
        RegistryStats {
            active,
            pending: self.reservations.len() - active,
            admitted_total: self.admitted_total,
            rejected_total: self.rejected_total,
        }
    }

    fn info(&self, circuit_id: CircuitId) -> Option<ReservationInfo> {
        self.reservations.get(&circuit_id).map(|r| ReservationInfo {
            circuit_id,
            initiator: r.initiator,
            destination: r.destination,
            state: r.state,
            age: r.created_at.elapsed(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enabled(max_circuits: usize) -> RelayConfig {
        RelayConfig {
            max_circuits,
            ..RelayConfig::enabled()
        }
    }

    fn expect_admitted(decision: AdmitDecision) -> ReservationGuard {
        match decision {
            AdmitDecision::Admitted(guard) => guard,
            AdmitDecision::Rejected(reason) => panic!("expected admission, got {}", reason),
        }
    }

    fn expect_rejected(decision: AdmitDecision) -> RejectReason {
        match decision {
            AdmitDecision::Admitted(guard) => panic!("expected rejection, got {:?}", guard),
            AdmitDecision::Rejected(reason) => reason,
        }
    }

    #[tokio::test]
    async fn test_disabled_registry_rejects() {
        let registry = RelayRegistry::new(&RelayConfig::default());
        let reason = expect_rejected(registry.admit(PeerId::random(), PeerId::random()).await);
        assert_eq!(reason, RejectReason::RelayDisabled);
        assert_eq!(registry.stats().await.rejected_total, 1);
    }

    #[tokio::test]
    async fn test_admit_activate_release() {
        let registry = RelayRegistry::new(&enabled(4));
        let (a, b) = (PeerId::random(), PeerId::random());

        let guard = expect_admitted(registry.admit(a, b).await);
        let id = guard.circuit_id();
        assert_ne!(id, 0);

        let info = registry.reservation(id).await.unwrap();
        assert_eq!(info.state, ReservationState::Requested);
        assert_eq!(info.initiator, a);
        assert_eq!(info.destination, b);
        assert_eq!(registry.stats().await.pending, 1);

        assert!(guard.activate().await);
        let stats = registry.stats().await;
        assert_eq!(stats.active, 1);
        assert_eq!(stats.pending, 0);

        drop(guard);
        let stats = registry.stats().await;
        assert_eq!(stats.active, 0);
        assert_eq!(stats.admitted_total, 1);
        assert!(registry.reservation(id).await.is_none());
        assert!(!registry.activate(id).await);
    }

    #[tokio::test]
    async fn test_capacity_exhausted() {
        let registry = RelayRegistry::new(&enabled(1));
        let first = expect_admitted(registry.admit(PeerId::random(), PeerId::random()).await);

        let reason = expect_rejected(registry.admit(PeerId::random(), PeerId::random()).await);
        assert_eq!(reason, RejectReason::CapacityExhausted);

        first.release();
        assert!(registry.admit(PeerId::random(), PeerId::random()).await.is_admitted());
    }

    #[tokio::test]
    async fn test_allow_and_deny_lists() {
        let allowed = PeerId::random();
        let denied = PeerId::random();
        let mut config = enabled(8);
        config.allow_list.insert(allowed);
        config.deny_list.insert(denied);
        let registry = RelayRegistry::new(&config);

        assert!(registry.admit(allowed, PeerId::random()).await.is_admitted());
        assert_eq!(
            expect_rejected(registry.admit(PeerId::random(), PeerId::random()).await),
            RejectReason::NotAllowed
        );
        assert_eq!(
            expect_rejected(registry.admit(allowed, denied).await),
            RejectReason::Denied
        );

        registry.update_policy(HashSet::new(), HashSet::new());
        assert!(registry.admit(PeerId::random(), denied).await.is_admitted());
    }

    #[tokio::test]
    async fn test_per_peer_limit_counts_both_roles() {
        let mut config = enabled(8);
        config.max_circuits_per_peer = Some(1);
        let registry = RelayRegistry::new(&config);
        let busy = PeerId::random();

        let _guard = expect_admitted(registry.admit(busy, PeerId::random()).await);
        assert_eq!(
            expect_rejected(registry.admit(PeerId::random(), busy).await),
            RejectReason::PeerLimit
        );
        assert!(registry.admit(PeerId::random(), PeerId::random()).await.is_admitted());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unactivated_reservation_expires() {
        let mut config = enabled(8);
        config.reservation_ttl_secs = 1;
        let registry = RelayRegistry::new(&config);

        let guard = expect_admitted(registry.admit(PeerId::random(), PeerId::random()).await);
        let id = guard.circuit_id();

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(registry.reservation(id).await.is_none());
        assert!(!guard.activate().await);
        assert_eq!(registry.stats().await.pending, 0);
    }
}
