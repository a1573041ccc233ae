//! Overlay networking
//!
//! Provides the peer-to-peer overlay: framed TCP connections behind a magic
//! handshake, flood gossip with proof-of-work gated broadcasts, heartbeats and
//! public node discovery.
//!
//! # Features
//! - Length-prefixed binary envelope with network partitions
//! - Bloom filter de-duplication of broadcasts
//! - Bounded connection registry with refusal and alternatives
//! - Liveness probing of candidate public nodes

pub mod codec;
pub mod config;
pub mod connection;
pub mod discovery;
pub mod error;
pub mod gossip;
pub mod handler;
pub mod handshake;
pub mod heartbeat;
pub mod message;
pub mod node;
pub mod registry;
pub mod server;

pub use codec::{
    CodecError, Envelope, EnvelopeCodec, Frame, MessageType, NetworkId, Packet, BROADCAST_FLAG,
    DEFAULT_MAX_PAYLOAD,
};
pub use config::{ConfigError, NodeConfig, DEFAULT_BACKLOG, DEFAULT_PORT};
pub use connection::PeerConnection;
pub use discovery::{detect, is_internet_address};
pub use error::NodeError;
pub use gossip::{flood, FloodReport};
pub use handler::{HandlerRegistry, MessageHandler, NodeEvents, Responder};
pub use handshake::MAGIC;
pub use message::{
    ConnectionRefuse, ConnectivityProbe, CustomMessage, Message, MessageError, NodesExchange,
};
pub use node::{Node, NodeBuilder, NodeStatus};
pub use registry::ConnectionRegistry;
pub use server::REFUSE_REASON;
