//! End-to-end relay scenarios over the in-memory transport
//!
//! Topology in every test: A and B cannot dial each other, both reach one or
//! more relays R.
//!
//! Run with: cargo test -p circuitcraft-tests --test circuit_scenarios

use std::time::Duration;

use anyhow::{Context, Result};
use libp2p::identity::Keypair;
use tokio::time::timeout;

use circuitcraft_core::{CircuitCraftConfig, RelayError};
use circuitcraft_network::{MemoryTransport, Multiaddr};
use circuitcraft_node::{CircuitNode, NodeError};

const SCENARIO_TIMEOUT: Duration = Duration::from_secs(10);

fn init_tracing() {
    let _ = circuitcraft_logging::try_init(true);
}

fn config(relay: bool, bootstrap: &[&CircuitNode]) -> CircuitCraftConfig {
    let mut config = CircuitCraftConfig::default();
    config.network.listen_addrs = vec!["/memory/0".to_string()];
    config.network.bootstrap_peers = bootstrap.iter().map(|n| dial_addr(n).to_string()).collect();
    config.relay.enabled = relay;
    config.dialer.handshake_timeout_ms = 1_000;
    config.dialer.dial_timeout_ms = 1_000;
    config
}

fn dial_addr(node: &CircuitNode) -> Multiaddr {
    let addr = node.listen_addrs()[0].clone();
    addr.with(libp2p::multiaddr::Protocol::P2p(node.peer_id()))
}

async fn start(transport: &MemoryTransport, config: CircuitCraftConfig) -> Result<CircuitNode> {
    let node = CircuitNode::start(Keypair::generate_ed25519(), transport.clone().into(), config).await?;
    Ok(node)
}

/// Start B behind `relays`, then A behind the same relays with B's address blocked
async fn split_pair(relays: &[&CircuitNode]) -> Result<(CircuitNode, CircuitNode)> {
    let b = start(&MemoryTransport::new(), config(false, relays)).await?;

    let a_transport = MemoryTransport::new();
    a_transport.block(&b.listen_addrs()[0]);
    let a = start(&a_transport, config(false, relays)).await?;

    // A knows where B lives but cannot get there directly
    a.add_peer_address(b.peer_id(), b.listen_addrs()[0].clone());
    Ok((a, b))
}

async fn wait_until_connected(relay: &CircuitNode, peers: &[&CircuitNode]) {
    let _ = timeout(SCENARIO_TIMEOUT, async {
        while !peers.iter().all(|p| relay.host().is_connected(&p.peer_id())) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
}

#[tokio::test]
async fn hello_world_over_circuit() -> Result<()> {
    init_tracing();
    let relay = start(&MemoryTransport::new(), config(true, &[])).await?;
    let (a, b) = split_pair(&[&relay]).await?;
    wait_until_connected(&relay, &[&a, &b]).await;

    let connection = timeout(SCENARIO_TIMEOUT, a.connect(b.peer_id()))
        .await
        .context("connect hung")??;
    assert!(connection.is_relayed());
    assert_eq!(connection.relayed_via(), Some(relay.peer_id()));

    let cid = b.add(&b"Hello world over circuit!"[..])?;
    let fetched = timeout(SCENARIO_TIMEOUT, a.cat_from(b.peer_id(), cid))
        .await
        .context("cat hung")??;
    assert_eq!(&fetched[..], b"Hello world over circuit!");

    // The reverse direction rides the same relayed connection
    let cid = a.add(&b"and back again"[..])?;
    let fetched = b.cat_from(a.peer_id(), cid).await?;
    assert_eq!(&fetched[..], b"and back again");

    let stats = relay.relay().context("relay service")?.registry().stats().await;
    assert_eq!(stats.active, 1);
    Ok(())
}

#[tokio::test]
async fn disabled_relay_fails_fast() -> Result<()> {
    init_tracing();
    let relay = start(&MemoryTransport::new(), config(false, &[])).await?;
    let (a, b) = split_pair(&[&relay]).await?;
    wait_until_connected(&relay, &[&a, &b]).await;

    // Direct attempt fails, no peer advertises HOP
    let result = timeout(SCENARIO_TIMEOUT, a.connect(b.peer_id()))
        .await
        .context("connect hung")?;
    assert!(
        matches!(result, Err(NodeError::Relay(RelayError::Unreachable(_)))),
        "got {:?}",
        result.map(|c| c.remote_peer())
    );

    // Nothing known about B at all
    a.host().peer_store().remove_peer(&b.peer_id());
    let result = timeout(SCENARIO_TIMEOUT, a.connect(b.peer_id()))
        .await
        .context("connect hung")?;
    assert!(
        matches!(result, Err(NodeError::Relay(RelayError::NoRelayAvailable))),
        "got {:?}",
        result.map(|c| c.remote_peer())
    );
    Ok(())
}

#[tokio::test]
async fn full_relay_is_skipped_for_next_candidate() -> Result<()> {
    init_tracing();

    let mut full_config = config(true, &[]);
    full_config.relay.max_circuits = 0;
    let full = start(&MemoryTransport::new(), full_config).await?;
    let open = start(&MemoryTransport::new(), config(true, &[])).await?;

    let (a, b) = split_pair(&[&full, &open]).await?;
    wait_until_connected(&full, &[&a, &b]).await;
    wait_until_connected(&open, &[&a, &b]).await;

    let connection = timeout(SCENARIO_TIMEOUT, a.connect(b.peer_id()))
        .await
        .context("connect hung")??;
    assert_eq!(connection.relayed_via(), Some(open.peer_id()));

    let cid = b.add(&b"through the second relay"[..])?;
    assert_eq!(&a.cat(cid).await?[..], b"through the second relay");
    Ok(())
}

#[tokio::test]
async fn destination_refusing_relays() -> Result<()> {
    init_tracing();
    let relay = start(&MemoryTransport::new(), config(true, &[])).await?;

    let mut b_config = config(false, &[&relay]);
    b_config.circuit.accept_relayed = false;
    let b = start(&MemoryTransport::new(), b_config).await?;
    let a_transport = MemoryTransport::new();
    a_transport.block(&b.listen_addrs()[0]);
    let a = start(&a_transport, config(false, &[&relay])).await?;
    wait_until_connected(&relay, &[&a, &b]).await;

    let addr = circuitcraft_core::circuit_addr(&relay.listen_addrs()[0], relay.peer_id(), b.peer_id());
    let result = a.connect_addr(&addr).await;
    assert!(
        matches!(result, Err(NodeError::Relay(RelayError::ConnectionRefused))),
        "got {:?}",
        result.map(|c| c.remote_peer())
    );
    Ok(())
}

#[tokio::test]
async fn closing_relayed_connection_frees_the_circuit() -> Result<()> {
    init_tracing();
    let relay = start(&MemoryTransport::new(), config(true, &[])).await?;
    let (a, b) = split_pair(&[&relay]).await?;
    wait_until_connected(&relay, &[&a, &b]).await;

    let connection = a.connect(b.peer_id()).await?;
    connection.close();

    let registry = relay.relay().context("relay service")?.registry().clone();
    timeout(SCENARIO_TIMEOUT, async {
        loop {
            let stats = registry.stats().await;
            if stats.admitted_total == 1 && stats.active == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .context("circuit never released")?;

    timeout(SCENARIO_TIMEOUT, async {
        while b.host().is_connected(&a.peer_id()) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .context("destination kept the relayed connection")?;
    Ok(())
}
