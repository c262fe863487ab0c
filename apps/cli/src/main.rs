//! CircuitCraft CLI
//!
//! Run a node (optionally serving as a relay) and fetch blocks through
//! relayed circuits.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use libp2p::{Multiaddr, PeerId};
use tracing::info;

use circuitcraft_core::is_circuit_addr;
use circuitcraft_keystore::load_or_generate_keypair;
use circuitcraft_network::HostTransport;
use circuitcraft_node::{CircuitNode, ContentId};
use circuitcraft_settings::{default_settings_path, Settings};

/// CircuitCraft - relayed connectivity for peer-to-peer nodes
#[derive(Parser)]
#[command(name = "circuitcraft")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Settings file (defaults to the platform config directory)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a node until Ctrl+C
    Node {
        /// Listen address (repeatable; overrides the settings file)
        #[arg(short, long)]
        listen: Vec<String>,

        /// Peer to connect to at startup, `/.../p2p/<peer id>` (repeatable)
        #[arg(short, long)]
        bootstrap: Vec<String>,

        /// Serve circuits for other peers
        #[arg(long)]
        relay: bool,

        /// Maximum concurrent circuits when relaying
        #[arg(long)]
        max_circuits: Option<usize>,

        /// Publish this file as a block and print its content id
        #[arg(long)]
        publish: Option<PathBuf>,

        /// Path to keypair file
        #[arg(long)]
        keyfile: Option<String>,
    },

    /// Fetch a block from a peer, directly or through a relay
    Cat {
        /// Content id (hex)
        cid: String,

        /// Peer address; `/.../p2p/<relay>/p2p-circuit/p2p/<peer>` goes through the relay
        #[arg(short, long)]
        peer: String,

        /// Write the block here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show node information
    Info {
        /// Path to keypair file
        #[arg(long)]
        keyfile: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    circuitcraft_logging::init_logging(cli.verbose);

    let settings_path = cli.config.clone().unwrap_or_else(default_settings_path);
    let mut settings = Settings::load_from(&settings_path).context("Failed to load settings")?;

    match cli.command {
        Commands::Node {
            listen,
            bootstrap,
            relay,
            max_circuits,
            publish,
            keyfile,
        } => {
            if !listen.is_empty() {
                settings.config.network.listen_addrs = listen;
            }
            settings.config.network.bootstrap_peers.extend(bootstrap);
            if relay {
                settings.config.relay.enabled = true;
            }
            if let Some(max) = max_circuits {
                settings.config.relay.max_circuits = max;
            }
            if keyfile.is_some() {
                settings.identity.keyfile = keyfile;
            }
            run_node(settings, publish.as_deref()).await?;
        }
        Commands::Cat { cid, peer, output } => {
            cat(settings, &cid, &peer, output.as_deref()).await?;
        }
        Commands::Info { keyfile } => {
            if keyfile.is_some() {
                settings.identity.keyfile = keyfile;
            }
            show_node_info(&settings, &settings_path)?;
        }
    }

    Ok(())
}

async fn start_node(settings: &Settings) -> Result<CircuitNode> {
    let keypair = load_or_generate_keypair(&settings.identity.key_path())
        .map_err(|e| anyhow::anyhow!("Failed to load keypair: {}", e))?;
    let node = CircuitNode::start(keypair, HostTransport::Tcp, settings.config.clone())
        .await
        .context("Failed to start node")?;
    Ok(node)
}

async fn run_node(settings: Settings, publish: Option<&Path>) -> Result<()> {
    info!(
        "Starting CircuitCraft node (relay {})",
        if settings.config.relay.enabled { "enabled" } else { "disabled" }
    );
    let node = start_node(&settings).await?;

    for addr in node.listen_addrs() {
        println!("Listening on {}/p2p/{}", addr, node.peer_id());
    }

    if let Some(path) = publish {
        let data = std::fs::read(path).with_context(|| format!("Failed to read {:?}", path))?;
        let cid = node.add(data)?;
        println!("Published {:?} as {}", path, cid);
    }

    info!("Node {} running. Press Ctrl+C to stop.", node.peer_id());
    tokio::signal::ctrl_c().await?;

    if let Some(relay) = node.relay() {
        let stats = relay.registry().stats().await;
        info!(
            "Circuits admitted: {}, rejected: {}, still active: {}",
            stats.admitted_total, stats.rejected_total, stats.active
        );
    }
    node.stop();
    Ok(())
}

async fn cat(mut settings: Settings, cid: &str, peer: &str, output: Option<&Path>) -> Result<()> {
    let cid: ContentId = cid.parse()?;
    let addr: Multiaddr = peer.parse().context("Invalid peer address")?;
    if is_circuit_addr(&addr) {
        info!("Fetching {} through relay address {}", cid, addr);
    }

    // Outbound only: no listeners, no bootstrap dialing
    settings.config.network.listen_addrs.clear();
    settings.config.network.bootstrap_peers.clear();
    settings.config.relay.enabled = false;
    let node = start_node(&settings).await?;

    let connection = node.connect_addr(&addr).await?;
    let data = node.cat_from(connection.remote_peer(), cid).await?;

    match output {
        Some(path) => {
            std::fs::write(path, &data).with_context(|| format!("Failed to write {:?}", path))?;
            println!("Wrote {} bytes to {:?}", data.len(), path);
        }
        None => {
            use std::io::Write;
            std::io::stdout().write_all(&data)?;
        }
    }

    node.stop();
    Ok(())
}

fn show_node_info(settings: &Settings, settings_path: &Path) -> Result<()> {
    let key_path = settings.identity.key_path();
    let keypair = load_or_generate_keypair(&key_path)
        .map_err(|e| anyhow::anyhow!("Failed to load keypair: {}", e))?;
    let peer_id = PeerId::from(keypair.public());

    println!("CircuitCraft Node Information");
    println!("=============================");
    println!("Peer ID:  {}", peer_id);
    println!("Keyfile:  {:?}", key_path);
    println!("Settings: {:?}", settings_path);
    println!("Relay:    {}", if settings.config.relay.enabled { "enabled" } else { "disabled" });
    for addr in &settings.config.network.listen_addrs {
        println!("Listen:   {}", addr);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parsing() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn test_node_flags() {
        let cli = Cli::try_parse_from([
            "circuitcraft",
            "node",
            "--relay",
            "-l",
            "/ip4/127.0.0.1/tcp/0",
            "--max-circuits",
            "4",
        ])
        .unwrap();
        match cli.command {
            Commands::Node {
                relay,
                listen,
                max_circuits,
                ..
            } => {
                assert!(relay);
                assert_eq!(listen, vec!["/ip4/127.0.0.1/tcp/0".to_string()]);
                assert_eq!(max_circuits, Some(4));
            }
            _ => panic!("expected node command"),
        }
    }

    #[test]
    fn test_cat_requires_peer() {
        assert!(Cli::try_parse_from(["circuitcraft", "cat", "abcd"]).is_err());
    }
}
