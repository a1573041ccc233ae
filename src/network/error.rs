//! Node error taxonomy

use crate::network::codec::CodecError;
use crate::network::config::ConfigError;
use crate::network::message::MessageError;
use crate::pow::PowError;
use thiserror::Error;

/// Errors surfaced to callers of the node API
///
/// Handshake mismatches, malformed headers and proof-of-work shortfalls on
/// incoming traffic never appear here: they end in a silent disconnect or a
/// silent drop.
#[derive(Error, Debug)]
pub enum NodeError {
    #[error("Connections are full (max {max})")]
    ConnectionFull { max: usize },
    #[error("Already connected to {0}")]
    AlreadyConnected(std::net::SocketAddr),
    #[error("Unrecognized message type {kind} code {code}")]
    UnrecognizedMessage { kind: u8, code: u16 },
    #[error("Message of {size} bytes exceeds maximum of {max}")]
    MessageTooLarge { size: usize, max: usize },
    #[error("Broadcast needs {required} connected peers, have {connected}")]
    InsufficientPeers { required: usize, connected: usize },
    #[error("Custom messages need a network name")]
    EmptyNetwork,
    #[error("Handler already registered for custom code {code}")]
    DuplicateHandler { code: u16 },
    #[error("Node is already listening on {0}")]
    AlreadyListening(std::net::SocketAddr),
    #[error("Connecting to {0} timed out")]
    ConnectTimeout(std::net::SocketAddr),
    #[error("Write to {0} timed out")]
    WriteTimeout(std::net::SocketAddr),
    #[error("Peer disconnected")]
    NotConnected,
    #[error("Node is shut down")]
    ShutDown,
    #[error("Node must be created inside a Tokio runtime")]
    NoRuntime,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Codec error: {0}")]
    Codec(CodecError),
    #[error("Message error: {0}")]
    Message(#[from] MessageError),
    #[error("Proof-of-work error: {0}")]
    Pow(#[from] PowError),
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

impl From<CodecError> for NodeError {
    fn from(e: CodecError) -> Self {
        match e {
            CodecError::PayloadTooLarge { size, max } => NodeError::MessageTooLarge { size, max },
            CodecError::EmptyNetwork => NodeError::EmptyNetwork,
            CodecError::Io(e) => NodeError::Io(e),
            other => NodeError::Codec(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_errors_map_to_taxonomy() {
        let too_large: NodeError = CodecError::PayloadTooLarge { size: 10, max: 5 }.into();
        assert!(matches!(too_large, NodeError::MessageTooLarge { size: 10, max: 5 }));

        let empty: NodeError = CodecError::EmptyNetwork.into();
        assert!(matches!(empty, NodeError::EmptyNetwork));

        let other: NodeError = CodecError::UnknownType(9).into();
        assert!(matches!(other, NodeError::Codec(CodecError::UnknownType(9))));
    }
}
