//! Node discovery
//!
//! Candidate public nodes are vetted with a short-lived detection probe
//! before they enter the public node list. Newly accepted nodes are shared
//! with neighbours so discoveries spread through the mesh.

use crate::network::codec::{EnvelopeCodec, MessageType, NetworkId, Packet};
use crate::network::error::NodeError;
use crate::network::handshake;
use crate::network::message::{addresses_per_message, Message};
use crate::network::node::NodeContext;
use bytes::Bytes;
use futures::stream::StreamExt;
use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_util::codec::FramedRead;

/// Probe `addr`: handshake, send a detection request, expect a detection reply
///
/// Any failure, protocol violation or timeout means "not alive".
pub async fn detect(addr: SocketAddr, connect_timeout: Duration, detect_timeout: Duration) -> bool {
    let stream = match tokio::time::timeout(connect_timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            log::trace!("Detect {}: connect failed: {}", addr, e);
            return false;
        }
        Err(_) => {
            log::trace!("Detect {}: connect timed out", addr);
            return false;
        }
    };

    match tokio::time::timeout(detect_timeout, probe(stream, detect_timeout)).await {
        Ok(Ok(alive)) => alive,
        Ok(Err(e)) => {
            log::trace!("Detect {}: {}", addr, e);
            false
        }
        Err(_) => false,
    }
}

async fn probe(stream: TcpStream, timeout: Duration) -> Result<bool, NodeError> {
    let (mut reader, mut writer) = stream.into_split();
    if !handshake::exchange(&mut reader, &mut writer, timeout).await? {
        return Ok(false);
    }

    let mut codec = EnvelopeCodec::default();
    let request = codec.pack(Packet {
        kind: MessageType::NodeDetection,
        broadcast: false,
        network_id: NetworkId::EMPTY,
        code: 0,
        payload: Bytes::new(),
        nonce: None,
    })?;
    writer.write_all(&request).await?;
    writer.flush().await?;

    let mut frames = FramedRead::new(reader, codec);
    let alive = match frames.next().await {
        Some(Ok(frame)) => {
            frame.envelope.kind == MessageType::NodeDetection && !frame.envelope.broadcast
        }
        _ => false,
    };

    let _ = writer.shutdown().await;
    Ok(alive)
}

/// Whether `ip` may be reachable from the public internet
pub fn is_internet_address(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            !(v4.is_unspecified()
                || v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_multicast()
                || v4.is_broadcast()
                || v4.is_documentation())
        }
        IpAddr::V6(v6) => {
            if let Some(v4) = v6.to_ipv4_mapped() {
                return is_internet_address(&IpAddr::V4(v4));
            }
            let first = v6.segments()[0];
            !(v6.is_unspecified()
                || v6.is_loopback()
                || v6.is_multicast()
                // fc00::/7 unique local
                || (first & 0xfe00) == 0xfc00
                // fe80::/10 link local, fec0::/10 site local
                || (first & 0xffc0) == 0xfe80
                || (first & 0xffc0) == 0xfec0)
        }
    }
}

impl NodeContext {
    /// Detect with the configured timeouts
    pub(crate) async fn detect(&self, addr: SocketAddr) -> bool {
        detect(addr, self.config.connect_timeout(), self.config.detect_timeout()).await
    }

    /// Whether `addr` is this node's own listening endpoint
    pub(crate) fn is_self_address(&self, addr: &SocketAddr) -> bool {
        let Some(listen) = *self.listen_addr.read() else {
            return false;
        };
        if addr.port() != listen.port() {
            return false;
        }

        addr.ip() == listen.ip()
            || (listen.ip().is_unspecified() && addr.ip().is_loopback())
            || self.external_addrs.read().contains(&addr.ip())
    }

    /// Drop duplicates, self addresses, port 0, known nodes and, unless
    /// allowed, non-internet addresses
    fn public_candidates(&self, addrs: Vec<SocketAddr>) -> Vec<SocketAddr> {
        let mut seen = HashSet::new();
        addrs
            .into_iter()
            .filter(|addr| seen.insert(*addr))
            .filter(|addr| addr.port() != 0)
            .filter(|addr| self.config.allow_private_addresses || is_internet_address(&addr.ip()))
            .filter(|addr| !self.is_self_address(addr))
            .filter(|addr| !self.public_nodes.contains(addr))
            .collect()
    }

    /// Merge candidates into the public node list
    ///
    /// Returns the newly added nodes.
    pub(crate) async fn add_public_nodes(
        &self,
        addrs: Vec<SocketAddr>,
        skip_detection: bool,
    ) -> Vec<SocketAddr> {
        let mut candidates = self.public_candidates(addrs);
        if candidates.is_empty() {
            return candidates;
        }

        if !skip_detection {
            let alive =
                futures::future::join_all(candidates.iter().map(|addr| self.detect(*addr))).await;
            candidates = candidates
                .into_iter()
                .zip(alive)
                .filter_map(|(addr, alive)| alive.then_some(addr))
                .collect();
        }

        let added = self.public_nodes.add_all(candidates, |addr| self.is_self_address(addr));
        if !added.is_empty() {
            log::info!(
                "Added {} public nodes ({} known)",
                added.len(),
                self.public_nodes.len()
            );
        }
        added
    }

    /// Merge candidates and share the newly added ones with neighbours
    ///
    /// Large lists are split so no message exceeds the payload limit.
    pub(crate) async fn add_and_share_public_nodes(
        &self,
        addrs: Vec<SocketAddr>,
        from: Option<SocketAddr>,
        skip_detection: bool,
    ) -> Vec<SocketAddr> {
        let added = self.add_public_nodes(addrs, skip_detection).await;
        if added.is_empty() {
            return added;
        }

        let found = added.clone();
        self.emit(move |events| events.on_new_public_nodes(&found));

        for chunk in added.chunks(addresses_per_message(self.config.max_payload_size)) {
            let share = Message::NewNodesShare(chunk.to_vec());
            match self.request_neighbors(&share, from, 0).await {
                Ok(sent) => log::debug!("Shared {} nodes with {} peers", chunk.len(), sent),
                Err(e) => log::warn!("Failed to share public nodes: {}", e),
            }
        }
        added
    }
}
