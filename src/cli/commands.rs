//! CLI commands for the overlay node
//!
//! Implements the command handlers for the `meshcast` binary.

use crate::network::{
    CustomMessage, Message, Node, NodeConfig, NodeEvents, Responder, DEFAULT_BACKLOG,
};
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use tokio::io::{AsyncBufReadExt, BufReader};

/// Result type for CLI operations
pub type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

/// Custom message code for chat lines
pub const TEXT_CODE: u16 = 1;

/// Network joined when none is configured
pub const DEFAULT_NETWORK: &str = "meshcast";

/// Load a config file, or the defaults
pub fn load_config(path: Option<&Path>) -> CliResult<NodeConfig> {
    match path {
        Some(path) => {
            let config = NodeConfig::from_file(path)?;
            log::info!("Loaded config from {:?}", path);
            Ok(config)
        }
        None => Ok(NodeConfig::default()),
    }
}

/// Prints connection events to the console
struct ConsoleEvents;

impl NodeEvents for ConsoleEvents {
    fn on_connect(&self, addr: SocketAddr) {
        println!("🔗 Connected: {}", addr);
    }

    fn on_disconnect(&self, addr: SocketAddr) {
        println!("📴 Disconnected: {}", addr);
    }

    fn on_new_public_nodes(&self, nodes: &[SocketAddr]) {
        println!("🌐 Found {} new public nodes", nodes.len());
    }

    fn on_post_broadcast(&self, _message: &Message, sent: usize) {
        println!("📡 Broadcast sent to {} peers", sent);
    }

    fn on_connect_refused(&self, addr: SocketAddr, reason: &str, alternatives: &[SocketAddr]) {
        println!(
            "⛔ {} refused the connection ({}), {} alternatives offered",
            addr,
            reason,
            alternatives.len()
        );
    }

    fn on_reachability(&self, address: SocketAddr, alive: bool) {
        if alive {
            println!("✅ Reachable from outside at {}", address);
        } else {
            println!("⚠️  Not reachable from outside at {}", address);
        }
    }
}

async fn print_text(message: CustomMessage, responder: Responder) {
    let text = String::from_utf8_lossy(&message.payload);
    println!("💬 [{}] {}", responder.peer_addr(), text.trim_end());
}

/// Run a node: listen, dial bootstrap peers and broadcast stdin lines
pub async fn cmd_run(mut config: NodeConfig, port: u16, bind: Option<IpAddr>) -> CliResult<()> {
    if config.network.is_none() {
        config.network = Some(DEFAULT_NETWORK.to_string());
    }
    let bootstrap = config.bootstrap_peers.clone();

    let node = Node::builder(config)
        .handler(TEXT_CODE, print_text)
        .subscribe(ConsoleEvents)
        .build()?;

    let addr = node.listen(port, DEFAULT_BACKLOG, bind)?;
    println!("🚀 Node listening on {} (network {})", addr, node.network_id());

    for peer in bootstrap {
        if let Err(e) = node.connect(peer.ip(), peer.port()).await {
            println!("❌ Failed to connect to {}: {}", peer, e);
        }
    }

    println!("Type a line to broadcast it, /status for node status, Ctrl+C to quit.");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if line == "/status" {
                    print_status(&node).await;
                    continue;
                }
                if let Err(e) = node.broadcast(Message::custom(TEXT_CODE, line.as_bytes().to_vec()), 1).await {
                    println!("❌ {}", e);
                }
            }
        }
    }

    println!("\n📴 Shutting down node...");
    node.shutdown().await;
    Ok(())
}

async fn print_status(node: &Node) {
    let status = node.status().await;
    println!("ℹ️  Node status:");
    println!("   Network:      {}", status.network_id);
    match status.listen_addr {
        Some(addr) => println!("   Listening:    {}", addr),
        None => println!("   Listening:    no"),
    }
    println!(
        "   Connections:  {}/{}",
        status.connected, status.max_connections
    );
    println!("   Public nodes: {}", status.public_nodes);
    for peer in node.connected_peers().await {
        println!("   - {}", peer);
    }
}

/// Probe a single address
pub async fn cmd_detect(config: NodeConfig, addr: SocketAddr) -> CliResult<()> {
    let node = Node::new(config)?;
    let alive = node.detect(addr.ip(), addr.port()).await;
    node.shutdown().await;

    if alive {
        println!("✅ {} is alive", addr);
    } else {
        println!("❌ {} did not answer", addr);
    }
    Ok(())
}
