//! Node configuration

use crate::collection::{DEFAULT_BLOOM_BYTES, DEFAULT_FALSE_POSITIVE_RATE};
use crate::network::codec::DEFAULT_MAX_PAYLOAD;
use crate::pow::DEFAULT_WORKERS;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Default port for the CLI
pub const DEFAULT_PORT: u16 = 7700;

/// Default listen backlog
pub const DEFAULT_BACKLOG: u32 = 50;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Network name; `None` joins only the empty partition
    pub network: Option<String>,
    /// Maximum number of accepted connections
    pub max_connections: usize,
    /// Idle seconds before a heartbeat is sent
    pub heartbeat_interval_secs: u64,
    /// Extra idle seconds the accepting side waits, so the initiator probes first
    pub server_heartbeat_grace_secs: u64,
    /// Dial timeout
    pub connect_timeout_ms: u64,
    /// Time allowed for the peer's magic tag to arrive
    pub handshake_timeout_ms: u64,
    /// Time allowed for a detection reply
    pub detect_timeout_ms: u64,
    /// Time allowed for one write; a peer that stops reading is dropped
    pub write_timeout_ms: u64,
    /// Capacity of the public node list
    pub public_nodes_capacity: usize,
    /// Leading zero bits required on broadcasts
    pub broadcast_difficulty: u32,
    /// Proof-of-work worker threads
    pub pow_threads: usize,
    /// Bloom filter size in bytes
    pub bloom_filter_bytes: usize,
    /// Bloom filter target false positive rate
    pub bloom_false_positive_rate: f64,
    /// Maximum payload size of one message
    pub max_payload_size: usize,
    /// Public nodes requested from a server after connecting
    pub exchange_request_size: u16,
    /// Alternatives offered in a refusal when the client asked for none
    pub refusal_batch_size: u16,
    /// Re-flood accepted broadcasts automatically
    pub relay_broadcasts: bool,
    /// Accept private and loopback addresses as public nodes
    pub allow_private_addresses: bool,
    /// Addresses that belong to this node
    pub external_addresses: Vec<IpAddr>,
    /// Peers the CLI dials at start
    pub bootstrap_peers: Vec<SocketAddr>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            network: None,
            max_connections: 255,
            heartbeat_interval_secs: 15,
            server_heartbeat_grace_secs: 2,
            connect_timeout_ms: 1500,
            handshake_timeout_ms: 10_000,
            detect_timeout_ms: 3000,
            write_timeout_ms: 10_000,
            public_nodes_capacity: 500,
            broadcast_difficulty: 20,
            pow_threads: DEFAULT_WORKERS,
            bloom_filter_bytes: DEFAULT_BLOOM_BYTES,
            bloom_false_positive_rate: DEFAULT_FALSE_POSITIVE_RATE,
            max_payload_size: DEFAULT_MAX_PAYLOAD,
            exchange_request_size: 16,
            refusal_batch_size: 8,
            relay_broadcasts: true,
            allow_private_addresses: false,
            external_addresses: Vec::new(),
            bootstrap_peers: Vec::new(),
        }
    }
}

impl NodeConfig {
    /// Load a JSON config file; missing fields take their defaults
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path)?;
        let config: NodeConfig = serde_json::from_str(&data)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid("max_connections must be positive".into()));
        }
        if self.pow_threads == 0 || self.pow_threads > 256 {
            return Err(ConfigError::Invalid("pow_threads must be in 1..=256".into()));
        }
        if !(self.bloom_false_positive_rate > 0.0 && self.bloom_false_positive_rate < 1.0) {
            return Err(ConfigError::Invalid(
                "bloom_false_positive_rate must be in (0, 1)".into(),
            ));
        }
        if self.write_timeout_ms == 0 {
            return Err(ConfigError::Invalid("write_timeout_ms must be positive".into()));
        }
        if self.bloom_filter_bytes == 0 {
            return Err(ConfigError::Invalid("bloom_filter_bytes must be positive".into()));
        }
        if self.max_payload_size > u32::MAX as usize {
            return Err(ConfigError::Invalid("max_payload_size exceeds u32".into()));
        }
        if self.broadcast_difficulty > 256 {
            return Err(ConfigError::Invalid("broadcast_difficulty exceeds 256 bits".into()));
        }
        if matches!(&self.network, Some(name) if name.is_empty()) {
            return Err(ConfigError::Invalid("network name must not be empty".into()));
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn detect_timeout(&self) -> Duration {
        Duration::from_millis(self.detect_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    /// Idle seconds after which a connection gets a heartbeat
    pub fn heartbeat_threshold(&self, is_client: bool) -> u64 {
        if is_client {
            self.heartbeat_interval_secs
        } else {
            self.heartbeat_interval_secs + self.server_heartbeat_grace_secs
        }
    }
}
