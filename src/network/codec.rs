//! Wire codec for the message envelope
//!
//! Frame layout (big-endian):
//!
//! ```text
//! [type|flag:1][network id:16, code:2 (custom only)][length:4][payload]
//! [nonce length:1, nonce (broadcast only)]
//! ```
//!
//! The low seven bits of the first byte carry the message type, the high bit
//! marks a broadcast. Broadcast frames end with the proof-of-work nonce.

use crate::crypto::{network_id, NETWORK_ID_LEN};
use crate::pow::MAX_NONCE_LEN;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// High bit of the type byte
pub const BROADCAST_FLAG: u8 = 0x80;

/// Type bits of the type byte
pub const TYPE_MASK: u8 = 0x7F;

/// Default maximum payload size
pub const DEFAULT_MAX_PAYLOAD: usize = 4 * 1024 * 1024;

/// Codec errors
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Unknown message type {0}")]
    UnknownType(u8),
    #[error("Payload of {size} bytes exceeds maximum of {max}")]
    PayloadTooLarge { size: usize, max: usize },
    #[error("Custom message on the empty network")]
    EmptyNetwork,
    #[error("Nonce of {0} bytes is too long")]
    NonceTooLong(usize),
    #[error("Stream ended inside a frame ({remaining} bytes buffered)")]
    Truncated { remaining: usize },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Envelope message types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    HeartBeat = 0,
    NodeDetection = 1,
    NodesExchange = 2,
    ConnectionRefuse = 3,
    ConnectivityDetectProxy = 5,
    NewNodesShare = 6,
    Custom = 7,
}

impl MessageType {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Built-in protocol messages ignore network partitioning
    pub fn is_builtin(self) -> bool {
        self != MessageType::Custom
    }
}

impl TryFrom<u8> for MessageType {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(MessageType::HeartBeat),
            1 => Ok(MessageType::NodeDetection),
            2 => Ok(MessageType::NodesExchange),
            3 => Ok(MessageType::ConnectionRefuse),
            5 => Ok(MessageType::ConnectivityDetectProxy),
            6 => Ok(MessageType::NewNodesShare),
            7 => Ok(MessageType::Custom),
            other => Err(CodecError::UnknownType(other)),
        }
    }
}

/// 16-byte network partition tag; all zero means "no partition"
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct NetworkId([u8; NETWORK_ID_LEN]);

impl NetworkId {
    pub const EMPTY: NetworkId = NetworkId([0u8; NETWORK_ID_LEN]);

    pub fn new(bytes: [u8; NETWORK_ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Network id for a network name, or the empty id for `None`
    pub fn from_name(name: Option<&str>) -> Self {
        match name {
            Some(name) => Self(network_id(name)),
            None => Self::EMPTY,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0 == [0u8; NETWORK_ID_LEN]
    }

    pub fn as_bytes(&self) -> &[u8; NETWORK_ID_LEN] {
        &self.0
    }
}

impl fmt::Display for NetworkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for NetworkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NetworkId({})", self)
    }
}

/// Decoded envelope header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub kind: MessageType,
    pub broadcast: bool,
    pub network_id: NetworkId,
    pub code: u16,
    pub payload_len: u32,
}

impl Envelope {
    /// Length of the header on the wire
    pub fn header_len(&self) -> usize {
        header_len(self.kind)
    }
}

fn header_len(kind: MessageType) -> usize {
    match kind {
        MessageType::Custom => 1 + NETWORK_ID_LEN + 2 + 4,
        _ => 1 + 4,
    }
}

/// One complete frame read off the wire
///
/// Keeps the exact received bytes: broadcasts are relayed and de-duplicated
/// on the raw frame, and their proof-of-work covers it.
#[derive(Debug, Clone)]
pub struct Frame {
    pub envelope: Envelope,
    raw: Bytes,
}

impl Frame {
    /// Complete frame as received
    pub fn raw(&self) -> &Bytes {
        &self.raw
    }

    fn payload_end(&self) -> usize {
        self.envelope.header_len() + self.envelope.payload_len as usize
    }

    pub fn payload(&self) -> Bytes {
        self.raw.slice(self.envelope.header_len()..self.payload_end())
    }

    /// Proof-of-work nonce (empty for non-broadcast frames)
    pub fn nonce(&self) -> &[u8] {
        if self.envelope.broadcast {
            &self.raw[self.payload_end() + 1..]
        } else {
            &[]
        }
    }

    /// Proof bytes as `(header ‖ payload, nonce)`
    pub fn proof_parts(&self) -> (&[u8], &[u8]) {
        (&self.raw[..self.payload_end()], self.nonce())
    }
}

/// Outgoing message ready for encoding
#[derive(Debug, Clone)]
pub struct Packet {
    pub kind: MessageType,
    pub broadcast: bool,
    pub network_id: NetworkId,
    pub code: u16,
    pub payload: Bytes,
    /// Broadcast nonce; a broadcast without one is encoded unsealed
    pub nonce: Option<Vec<u8>>,
}

/// Envelope codec for length-prefixed framing
#[derive(Debug, Clone)]
pub struct EnvelopeCodec {
    max_payload: usize,
}

impl EnvelopeCodec {
    pub fn new(max_payload: usize) -> Self {
        Self { max_payload }
    }

    /// Encode a packet into a fresh buffer
    pub fn pack(&mut self, packet: Packet) -> Result<BytesMut, CodecError> {
        let mut dst = BytesMut::new();
        self.encode(packet, &mut dst)?;
        Ok(dst)
    }
}

impl Default for EnvelopeCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PAYLOAD)
    }
}

impl Encoder<Packet> for EnvelopeCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let size = item.payload.len();
        if size > self.max_payload || size > u32::MAX as usize {
            return Err(CodecError::PayloadTooLarge {
                size,
                max: self.max_payload,
            });
        }

        let nonce = match (&item.nonce, item.broadcast) {
            (Some(nonce), true) => {
                if nonce.len() > MAX_NONCE_LEN {
                    return Err(CodecError::NonceTooLong(nonce.len()));
                }
                Some(nonce)
            }
            _ => None,
        };

        dst.reserve(header_len(item.kind) + size + nonce.map_or(0, |n| 1 + n.len()));

        let flag = if item.broadcast { BROADCAST_FLAG } else { 0 };
        dst.put_u8(item.kind.as_u8() | flag);

        if item.kind == MessageType::Custom {
            if item.network_id.is_empty() {
                return Err(CodecError::EmptyNetwork);
            }
            dst.put_slice(item.network_id.as_bytes());
            dst.put_u16(item.code);
        }

        dst.put_u32(size as u32);
        dst.put_slice(&item.payload);

        if let Some(nonce) = nonce {
            dst.put_u8(nonce.len() as u8);
            dst.put_slice(nonce);
        }

        Ok(())
    }
}

impl Decoder for EnvelopeCodec {
    type Item = Frame;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }

        let first = src[0];
        let broadcast = first & BROADCAST_FLAG != 0;
        let kind = MessageType::try_from(first & TYPE_MASK)?;
        let header_len = header_len(kind);

        let mut network_id = NetworkId::EMPTY;
        let mut code = 0;
        if kind == MessageType::Custom {
            if src.len() < 1 + NETWORK_ID_LEN + 2 {
                return Ok(None);
            }
            let mut id = [0u8; NETWORK_ID_LEN];
            id.copy_from_slice(&src[1..1 + NETWORK_ID_LEN]);
            network_id = NetworkId::new(id);
            if network_id.is_empty() {
                return Err(CodecError::EmptyNetwork);
            }
            code = (&src[1 + NETWORK_ID_LEN..]).get_u16();
        }

        // Need the length field
        if src.len() < header_len {
            return Ok(None);
        }
        let payload_len = (&src[header_len - 4..]).get_u32();
        if payload_len as usize > self.max_payload {
            return Err(CodecError::PayloadTooLarge {
                size: payload_len as usize,
                max: self.max_payload,
            });
        }

        let mut total = header_len + payload_len as usize;
        if broadcast {
            if src.len() <= total {
                src.reserve(total + 1 - src.len());
                return Ok(None);
            }
            let nonce_len = src[total] as usize;
            if nonce_len > MAX_NONCE_LEN {
                return Err(CodecError::NonceTooLong(nonce_len));
            }
            total += 1 + nonce_len;
        }

        // Check if we have full message
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        let raw = src.split_to(total).freeze();
        Ok(Some(Frame {
            envelope: Envelope {
                kind,
                broadcast,
                network_id,
                code,
                payload_len,
            },
            raw,
        }))
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(buf)? {
            Some(frame) => Ok(Some(frame)),
            None if buf.is_empty() => Ok(None),
            None => Err(CodecError::Truncated {
                remaining: buf.len(),
            }),
        }
    }
}
