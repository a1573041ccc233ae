//! Meshcast CLI Application
//!
//! Runs an overlay node from the command line.

use clap::{Parser, Subcommand};
use meshcast::cli;
use meshcast::network::DEFAULT_PORT;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "meshcast")]
#[command(version = "0.1.0")]
#[command(about = "Peer-to-peer flood gossip overlay node", long_about = None)]
struct Cli {
    /// JSON config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a node and broadcast stdin lines
    Run {
        /// Port to listen on
        #[arg(short, long, default_value_t = DEFAULT_PORT)]
        port: u16,

        /// Address to bind (all interfaces by default)
        #[arg(long)]
        bind: Option<IpAddr>,

        /// Network name
        #[arg(short, long)]
        network: Option<String>,

        /// Initial peers to connect to (comma-separated host:port)
        #[arg(long)]
        peers: Option<String>,

        /// Maximum number of connections
        #[arg(long)]
        max_connections: Option<usize>,

        /// Broadcast proof-of-work difficulty in leading zero bits
        #[arg(short, long)]
        difficulty: Option<u32>,

        /// Accept private and loopback addresses as public nodes
        #[arg(long)]
        allow_private: bool,
    },

    /// Check whether a node answers at an address
    Detect {
        /// Node address (ip:port)
        addr: SocketAddr,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let mut config = cli::load_config(cli.config.as_deref())?;

    let rt = tokio::runtime::Runtime::new()?;

    rt.block_on(async move {
        match cli.command {
            Commands::Run {
                port,
                bind,
                network,
                peers,
                max_connections,
                difficulty,
                allow_private,
            } => {
                if let Some(network) = network {
                    config.network = Some(network);
                }
                if let Some(peers) = peers {
                    for peer in peers.split(',').map(str::trim).filter(|p| !p.is_empty()) {
                        config.bootstrap_peers.push(peer.parse()?);
                    }
                }
                if let Some(max) = max_connections {
                    config.max_connections = max;
                }
                if let Some(difficulty) = difficulty {
                    config.broadcast_difficulty = difficulty;
                }
                if allow_private {
                    config.allow_private_addresses = true;
                }

                cli::cmd_run(config, port, bind).await?;
            }

            Commands::Detect { addr } => {
                cli::cmd_detect(config, addr).await?;
            }
        }

        Ok::<(), Box<dyn std::error::Error>>(())
    })?;

    Ok(())
}
