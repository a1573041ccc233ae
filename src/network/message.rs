//! Message payloads carried inside the envelope
//!
//! Built-in protocol messages have fixed binary payloads (big-endian).
//! Custom messages (type 7) are opaque bytes routed to a handler by code.

use crate::network::codec::MessageType;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use thiserror::Error;

/// Largest encoding of one address (family + IPv6 + port)
pub const MAX_ADDRESS_LEN: usize = 1 + 16 + 2;

/// Bytes taken by an address list's count prefix
pub const ADDRESS_LIST_OVERHEAD: usize = 2;

/// Message payload errors
#[derive(Error, Debug)]
pub enum MessageError {
    #[error("Malformed {kind:?} payload: {reason}")]
    Malformed {
        kind: MessageType,
        reason: &'static str,
    },
    #[error("Address list of {0} entries is too long")]
    TooManyAddresses(usize),
    #[error("Refusal reason is too long")]
    ReasonTooLong,
}

/// Peer list exchange; sent by the initiator right after the handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodesExchange {
    /// How many public nodes the sender wants back (0 = no reply)
    pub max_req: u16,
    /// Sender's listening port (0 = not listening)
    pub listen_port: u16,
    /// Public nodes the sender knows
    pub nodes: Vec<SocketAddr>,
}

/// Refusal sent to a client when the registry is full
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionRefuse {
    pub reason: String,
    /// Alternative peers the client may try
    pub nodes: Vec<SocketAddr>,
}

/// Ask a neighbour to probe us, or its answer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectivityProbe {
    /// Probe the requester's remote address at `port`
    Request { port: u16 },
    /// Result of probing `address`
    Response { address: SocketAddr, alive: bool },
}

/// Application message scoped to a network id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomMessage {
    pub code: u16,
    pub payload: Bytes,
}

/// Every message the overlay understands
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Keep-alive
    HeartBeat,
    /// Liveness probe / probe reply
    NodeDetection,
    NodesExchange(NodesExchange),
    ConnectionRefuse(ConnectionRefuse),
    ConnectivityDetectProxy(ConnectivityProbe),
    /// Newly verified public nodes
    NewNodesShare(Vec<SocketAddr>),
    Custom(CustomMessage),
}

impl Message {
    pub fn custom(code: u16, payload: impl Into<Bytes>) -> Self {
        Message::Custom(CustomMessage {
            code,
            payload: payload.into(),
        })
    }

    pub fn kind(&self) -> MessageType {
        match self {
            Message::HeartBeat => MessageType::HeartBeat,
            Message::NodeDetection => MessageType::NodeDetection,
            Message::NodesExchange(_) => MessageType::NodesExchange,
            Message::ConnectionRefuse(_) => MessageType::ConnectionRefuse,
            Message::ConnectivityDetectProxy(_) => MessageType::ConnectivityDetectProxy,
            Message::NewNodesShare(_) => MessageType::NewNodesShare,
            Message::Custom(_) => MessageType::Custom,
        }
    }

    /// Custom message code (0 for built-ins)
    pub fn code(&self) -> u16 {
        match self {
            Message::Custom(custom) => custom.code,
            _ => 0,
        }
    }

    /// Get message type name for logging
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::HeartBeat => "HeartBeat",
            Message::NodeDetection => "NodeDetection",
            Message::NodesExchange(_) => "NodesExchange",
            Message::ConnectionRefuse(_) => "ConnectionRefuse",
            Message::ConnectivityDetectProxy(_) => "ConnectivityDetectProxy",
            Message::NewNodesShare(_) => "NewNodesShare",
            Message::Custom(_) => "Custom",
        }
    }

    /// Serialize the payload
    pub fn encode_payload(&self) -> Result<Bytes, MessageError> {
        let mut buf = BytesMut::new();
        match self {
            Message::HeartBeat | Message::NodeDetection => {}
            Message::NodesExchange(exchange) => {
                buf.put_u16(exchange.max_req);
                buf.put_u16(exchange.listen_port);
                put_addresses(&mut buf, &exchange.nodes)?;
            }
            Message::ConnectionRefuse(refuse) => {
                let reason = refuse.reason.as_bytes();
                if reason.len() > u16::MAX as usize {
                    return Err(MessageError::ReasonTooLong);
                }
                buf.put_u16(reason.len() as u16);
                buf.put_slice(reason);
                put_addresses(&mut buf, &refuse.nodes)?;
            }
            Message::ConnectivityDetectProxy(ConnectivityProbe::Request { port }) => {
                buf.put_u8(0);
                buf.put_u16(*port);
            }
            Message::ConnectivityDetectProxy(ConnectivityProbe::Response { address, alive }) => {
                buf.put_u8(1);
                put_address(&mut buf, address);
                buf.put_u8(u8::from(*alive));
            }
            Message::NewNodesShare(nodes) => put_addresses(&mut buf, nodes)?,
            Message::Custom(custom) => return Ok(custom.payload.clone()),
        }
        Ok(buf.freeze())
    }

    /// Deserialize a payload of the given type
    pub fn decode(kind: MessageType, code: u16, payload: Bytes) -> Result<Self, MessageError> {
        let mut buf = payload;
        let message = match kind {
            MessageType::HeartBeat => Message::HeartBeat,
            MessageType::NodeDetection => Message::NodeDetection,
            MessageType::NodesExchange => {
                need(&buf, 4, kind)?;
                let max_req = buf.get_u16();
                let listen_port = buf.get_u16();
                let nodes = get_addresses(&mut buf, kind)?;
                Message::NodesExchange(NodesExchange {
                    max_req,
                    listen_port,
                    nodes,
                })
            }
            MessageType::ConnectionRefuse => {
                need(&buf, 2, kind)?;
                let len = buf.get_u16() as usize;
                need(&buf, len, kind)?;
                let reason = String::from_utf8(buf.split_to(len).to_vec()).map_err(|_| {
                    MessageError::Malformed {
                        kind,
                        reason: "reason is not UTF-8",
                    }
                })?;
                let nodes = get_addresses(&mut buf, kind)?;
                Message::ConnectionRefuse(ConnectionRefuse { reason, nodes })
            }
            MessageType::ConnectivityDetectProxy => {
                need(&buf, 1, kind)?;
                match buf.get_u8() {
                    0 => {
                        need(&buf, 2, kind)?;
                        Message::ConnectivityDetectProxy(ConnectivityProbe::Request {
                            port: buf.get_u16(),
                        })
                    }
                    1 => {
                        let address = get_address(&mut buf, kind)?;
                        need(&buf, 1, kind)?;
                        let alive = buf.get_u8() != 0;
                        Message::ConnectivityDetectProxy(ConnectivityProbe::Response {
                            address,
                            alive,
                        })
                    }
                    _ => {
                        return Err(MessageError::Malformed {
                            kind,
                            reason: "unknown probe kind",
                        })
                    }
                }
            }
            MessageType::NewNodesShare => Message::NewNodesShare(get_addresses(&mut buf, kind)?),
            MessageType::Custom => return Ok(Message::custom(code, buf)),
        };
        Ok(message)
    }
}

fn need(buf: &Bytes, len: usize, kind: MessageType) -> Result<(), MessageError> {
    if buf.remaining() < len {
        return Err(MessageError::Malformed {
            kind,
            reason: "payload too short",
        });
    }
    Ok(())
}

fn put_address(buf: &mut BytesMut, addr: &SocketAddr) {
    match addr.ip() {
        IpAddr::V4(ip) => {
            buf.put_u8(4);
            buf.put_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            buf.put_u8(6);
            buf.put_slice(&ip.octets());
        }
    }
    buf.put_u16(addr.port());
}

fn put_addresses(buf: &mut BytesMut, addrs: &[SocketAddr]) -> Result<(), MessageError> {
    if addrs.len() > u16::MAX as usize {
        return Err(MessageError::TooManyAddresses(addrs.len()));
    }
    buf.put_u16(addrs.len() as u16);
    for addr in addrs {
        put_address(buf, addr);
    }
    Ok(())
}

fn get_address(buf: &mut Bytes, kind: MessageType) -> Result<SocketAddr, MessageError> {
    need(buf, 1, kind)?;
    let ip = match buf.get_u8() {
        4 => {
            need(buf, 4 + 2, kind)?;
            let mut octets = [0u8; 4];
            buf.copy_to_slice(&mut octets);
            IpAddr::V4(Ipv4Addr::from(octets))
        }
        6 => {
            need(buf, 16 + 2, kind)?;
            let mut octets = [0u8; 16];
            buf.copy_to_slice(&mut octets);
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        _ => {
            return Err(MessageError::Malformed {
                kind,
                reason: "unknown address family",
            })
        }
    };
    Ok(SocketAddr::new(ip, buf.get_u16()))
}

fn get_addresses(buf: &mut Bytes, kind: MessageType) -> Result<Vec<SocketAddr>, MessageError> {
    need(buf, 2, kind)?;
    let count = buf.get_u16() as usize;
    // Each entry needs at least 7 bytes; refuse counts the payload cannot hold
    need(buf, count * 7, kind)?;
    (0..count).map(|_| get_address(buf, kind)).collect()
}

/// How many addresses fit in one address-list payload of at most `max_payload` bytes
pub fn addresses_per_message(max_payload: usize) -> usize {
    (max_payload.saturating_sub(ADDRESS_LIST_OVERHEAD) / MAX_ADDRESS_LEN).clamp(1, u16::MAX as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_nodes() -> Vec<SocketAddr> {
        vec![
            "8.8.8.8:7700".parse().unwrap(),
            "[2001:db8::1]:7701".parse().unwrap(),
        ]
    }

    fn round_trip(message: Message) -> Message {
        let payload = message.encode_payload().unwrap();
        Message::decode(message.kind(), message.code(), payload).unwrap()
    }

    #[test]
    fn test_nodes_exchange_round_trip() {
        let message = Message::NodesExchange(NodesExchange {
            max_req: 16,
            listen_port: 7700,
            nodes: sample_nodes(),
        });
        assert_eq!(round_trip(message.clone()), message);
    }

    #[test]
    fn test_refuse_and_probe_round_trip() {
        let refuse = Message::ConnectionRefuse(ConnectionRefuse {
            reason: "Connections are full".to_string(),
            nodes: sample_nodes(),
        });
        assert_eq!(round_trip(refuse.clone()), refuse);

        let response = Message::ConnectivityDetectProxy(ConnectivityProbe::Response {
            address: "1.2.3.4:9".parse().unwrap(),
            alive: true,
        });
        assert_eq!(round_trip(response.clone()), response);
    }

    #[test]
    fn test_custom_payload_is_opaque() {
        let message = Message::custom(42, &b"\x00\xffraw"[..]);
        assert_eq!(message.kind(), MessageType::Custom);
        assert_eq!(message.code(), 42);
        assert_eq!(round_trip(message.clone()), message);
    }

    #[test]
    fn test_truncated_payload_is_malformed() {
        let message = Message::NewNodesShare(sample_nodes());
        let payload = message.encode_payload().unwrap();
        let truncated = payload.slice(..payload.len() - 1);

        assert!(matches!(
            Message::decode(MessageType::NewNodesShare, 0, truncated),
            Err(MessageError::Malformed { .. })
        ));
        assert!(Message::decode(MessageType::NodesExchange, 0, Bytes::from_static(&[0])).is_err());
    }

    #[test]
    fn test_addresses_per_message() {
        assert_eq!(addresses_per_message(2 + 19 * 10), 10);
        assert_eq!(addresses_per_message(0), 1);
        assert_eq!(addresses_per_message(usize::MAX), u16::MAX as usize);
    }
}
