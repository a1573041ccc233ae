//! Meshcast: a peer-to-peer flood gossip overlay in Rust
//!
//! This crate provides an overlay node featuring:
//! - Magic-tag handshake and a length-prefixed binary envelope
//! - Flood broadcast with bloom filter loop prevention
//! - Parallel proof-of-work gating of broadcasts
//! - Network partitions for application messages
//! - Heartbeats for idle connections
//! - Public node discovery with liveness probes
//!
//! # Example
//!
//! ```no_run
//! use meshcast::network::{CustomMessage, Message, Node, NodeConfig, Responder};
//!
//! # async fn run() -> Result<(), meshcast::network::NodeError> {
//! let config = NodeConfig {
//!     network: Some("chat".to_string()),
//!     ..Default::default()
//! };
//!
//! let node = Node::builder(config)
//!     .handler(1, |msg: CustomMessage, from: Responder| async move {
//!         println!("{}: {:?}", from.peer_addr(), msg.payload);
//!     })
//!     .build()?;
//!
//! node.listen_on(7700)?;
//! node.connect("203.0.113.7".parse().unwrap(), 7700).await?;
//! node.broadcast(Message::custom(1, &b"hello"[..]), 1).await?;
//! # Ok(())
//! # }
//! ```

pub mod cli;
pub mod collection;
pub mod crypto;
pub mod network;
pub mod pow;

// Re-export commonly used types
pub use collection::{BloomFilter, LimitedRandomSet};
pub use network::{
    CustomMessage, Message, Node, NodeBuilder, NodeConfig, NodeError, NodeEvents, Responder,
};
pub use pow::ProofOfWorkEngine;
