//! Integration tests for host connections and protocol streams
//!
//! These tests verify that two hosts can connect over TCP and over the
//! in-memory transport, that dials pinned to an identity only reach that
//! identity, and that protocol streams are independent and flow-controlled.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::time::timeout;

use circuitcraft_network::{
    Host, HostTransport, Keypair, MemoryTransport, MessageStream, Multiaddr, NetworkError, PeerId, Role,
    StreamProtocol,
};

const ECHO_PROTOCOL: StreamProtocol = StreamProtocol::new("/circuitcraft/test-echo/1.0.0");
const SINK_PROTOCOL: StreamProtocol = StreamProtocol::new("/circuitcraft/test-sink/1.0.0");
const MAX_MESSAGE: usize = 4096;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Note {
    seq: u32,
    text: String,
}

fn note(seq: u32) -> Note {
    Note {
        seq,
        text: format!("note {}", seq),
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("circuitcraft=debug")
        .with_test_writer()
        .try_init();
}

fn memory_host() -> Host {
    Host::new(Keypair::generate_ed25519(), MemoryTransport::new()).unwrap()
}

/// Echo every message received on the echo protocol back to the sender
fn spawn_echo(host: &Host) {
    let mut incoming = host.accept(ECHO_PROTOCOL).unwrap();
    tokio::spawn(async move {
        while let Some(inbound) = incoming.next().await {
            tokio::spawn(async move {
                let mut stream = MessageStream::new(inbound.stream, MAX_MESSAGE);
                while let Ok(note) = stream.recv::<Note>().await {
                    if stream.send(&note).await.is_err() {
                        break;
                    }
                }
            });
        }
    });
}

#[tokio::test]
async fn test_tcp_hosts_exchange_messages() {
    init_tracing();

    let server = Host::new(Keypair::generate_ed25519(), HostTransport::Tcp).unwrap();
    let client = Host::new(Keypair::generate_ed25519(), HostTransport::Tcp).unwrap();
    spawn_echo(&server);

    let addr = server
        .listen_on("/ip4/127.0.0.1/tcp/0".parse().unwrap())
        .await
        .unwrap();
    let full: Multiaddr = format!("{}/p2p/{}", addr, server.peer_id()).parse().unwrap();

    let connection = timeout(Duration::from_secs(10), client.dial(&full))
        .await
        .expect("dial timed out")
        .unwrap();
    assert!(connection.supports(&ECHO_PROTOCOL));

    let stream = client
        .open_stream(&server.peer_id(), ECHO_PROTOCOL)
        .await
        .unwrap();
    let mut stream = MessageStream::new(stream, MAX_MESSAGE);
    for seq in 0..3 {
        stream.send(&note(seq)).await.unwrap();
        let echoed: Note = stream.recv().await.unwrap();
        assert_eq!(echoed, note(seq));
    }

    client.shutdown();
    server.shutdown();
}

#[tokio::test]
async fn test_wrong_peer_id_is_rejected() {
    init_tracing();

    let server = memory_host();
    let client = memory_host();
    spawn_echo(&server);
    let addr = server.listen_on("/memory/0".parse().unwrap()).await.unwrap();

    // The listener cannot pass itself off as another identity
    let impostor = Keypair::generate_ed25519().public().to_peer_id();
    let wrong: Multiaddr = format!("{}/p2p/{}", addr, impostor).parse().unwrap();
    let result = client.dial(&wrong).await;
    assert!(matches!(
        result,
        Err(NetworkError::PeerMismatch { expected, actual })
            if expected == impostor && actual == server.peer_id()
    ));
    assert!(!client.is_connected(&impostor));
    assert!(!client.is_connected(&server.peer_id()));
    assert!(client.peer_store().addresses(&impostor).is_empty());

    // Pinned to the right identity the same address works
    let right: Multiaddr = format!("{}/p2p/{}", addr, server.peer_id()).parse().unwrap();
    let connection = client.dial(&right).await.unwrap();
    assert_eq!(connection.remote_peer(), server.peer_id());
}

#[tokio::test]
async fn test_connection_over_relayed_stream() {
    init_tracing();

    let a = memory_host();
    let b = memory_host();
    spawn_echo(&b);
    let relay = PeerId::random();

    // Stands in for a finished HOP/STOP handshake
    let (a_leg, b_leg) = tokio::io::duplex(64 * 1024);
    let (outbound, inbound) = tokio::join!(
        a.upgrade(Box::new(a_leg), Role::Dialer, relay, b.peer_id()),
        b.upgrade(Box::new(b_leg), Role::Listener, relay, a.peer_id()),
    );
    let outbound = outbound.unwrap();
    let inbound = inbound.unwrap();

    assert_eq!(outbound.remote_peer(), b.peer_id());
    assert_eq!(outbound.relayed_via(), Some(relay));
    assert_eq!(inbound.remote_peer(), a.peer_id());
    assert_eq!(inbound.role(), Role::Listener);
    assert!(inbound.is_relayed());
    assert!(outbound.supports(&ECHO_PROTOCOL));

    let stream = outbound.open_stream(ECHO_PROTOCOL).await.unwrap();
    let mut stream = MessageStream::new(stream, MAX_MESSAGE);
    stream.send(&note(9)).await.unwrap();
    assert_eq!(stream.recv::<Note>().await.unwrap(), note(9));
}

#[tokio::test]
async fn test_relayed_peer_must_match_named_initiator() {
    init_tracing();

    let a = memory_host();
    let b = memory_host();
    let relay = PeerId::random();
    let claimed = PeerId::random();

    // The relay names `claimed` as the initiator but A is on the other end
    let (a_leg, b_leg) = tokio::io::duplex(64 * 1024);
    let (_outbound, inbound) = tokio::join!(
        a.upgrade(Box::new(a_leg), Role::Dialer, relay, b.peer_id()),
        b.upgrade(Box::new(b_leg), Role::Listener, relay, claimed),
    );
    assert!(matches!(
        inbound,
        Err(NetworkError::PeerMismatch { expected, actual })
            if expected == claimed && actual == a.peer_id()
    ));
    assert!(!b.is_connected(&claimed));
    assert!(!b.is_connected(&a.peer_id()));
}

#[tokio::test]
async fn test_relayed_peer_must_match_destination() {
    init_tracing();

    let a = memory_host();
    let b = memory_host();
    let relay = PeerId::random();
    let expected_destination = PeerId::random();

    // A asked for `expected_destination`; B answering instead is refused
    let (a_leg, b_leg) = tokio::io::duplex(64 * 1024);
    let (outbound, _inbound) = tokio::join!(
        a.upgrade(Box::new(a_leg), Role::Dialer, relay, expected_destination),
        b.upgrade(Box::new(b_leg), Role::Listener, relay, a.peer_id()),
    );
    assert!(matches!(
        outbound,
        Err(NetworkError::PeerMismatch { expected, actual })
            if expected == expected_destination && actual == b.peer_id()
    ));
    assert!(!a.is_connected(&expected_destination));
    assert!(!a.is_connected(&b.peer_id()));
}

#[tokio::test]
async fn test_many_concurrent_streams() {
    init_tracing();

    let server = memory_host();
    let client = memory_host();
    spawn_echo(&server);

    let addr = server.listen_on("/memory/0".parse().unwrap()).await.unwrap();
    let connection = client.dial(&addr).await.unwrap();

    let mut tasks = Vec::new();
    for seq in 0..16u32 {
        let connection = connection.clone();
        tasks.push(tokio::spawn(async move {
            let stream = connection.open_stream(ECHO_PROTOCOL).await.unwrap();
            let mut stream = MessageStream::new(stream, MAX_MESSAGE);
            stream.send(&note(seq)).await.unwrap();
            stream.recv::<Note>().await.unwrap()
        }));
    }

    for (seq, task) in tasks.into_iter().enumerate() {
        assert_eq!(task.await.unwrap(), note(seq as u32));
    }
}

#[tokio::test]
async fn test_writer_stalls_when_reader_stops_reading() {
    init_tracing();

    let server = memory_host();
    let client = memory_host();
    spawn_echo(&server);

    // Accept sink streams and hold them without ever reading
    let mut incoming = server.accept(SINK_PROTOCOL).unwrap();
    let (held_tx, mut held_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(inbound) = incoming.next().await {
            let _ = held_tx.send(inbound.stream);
        }
    });

    let addr = server.listen_on("/memory/0".parse().unwrap()).await.unwrap();
    let connection = client.dial(&addr).await.unwrap();

    let mut sink = connection.open_stream(SINK_PROTOCOL).await.unwrap();
    let chunk = vec![7u8; 64 * 1024];
    let mut written = 0usize;
    let result = timeout(Duration::from_secs(2), async {
        while written < 64 * 1024 * 1024 {
            sink.write_all(&chunk).await.unwrap();
            written += chunk.len();
        }
    })
    .await;
    assert!(result.is_err(), "64 MiB written to a reader that never reads");
    assert!(
        written < 4 * 1024 * 1024,
        "{} bytes accepted for a reader that never reads",
        written
    );
    let _held = held_rx.recv().await.unwrap();

    // A stalled stream does not hold up the rest of the connection
    let echo = connection.open_stream(ECHO_PROTOCOL).await.unwrap();
    let mut echo = MessageStream::new(echo, MAX_MESSAGE);
    echo.send(&note(1)).await.unwrap();
    let echoed = timeout(Duration::from_secs(5), echo.recv::<Note>())
        .await
        .expect("echo stalled behind the sink stream")
        .unwrap();
    assert_eq!(echoed, note(1));
}
