//! Flood gossip to neighbours

use crate::network::connection::PeerConnection;
use crate::network::error::NodeError;
use crate::network::message::Message;
use crate::network::node::NodeContext;
use crate::network::registry::ConnectionRegistry;
use bytes::Bytes;
use futures::future::join_all;
use std::net::SocketAddr;
use std::sync::Arc;

/// Outcome of one flood
#[derive(Debug, Default)]
pub struct FloodReport {
    /// Successful sends
    pub sent: usize,
    /// Connections dropped after a failed write
    pub dropped: Vec<SocketAddr>,
}

/// Write `bytes` to every registered connection except `exclude`
///
/// Stops after `limit` successful sends (0 = no limit). Sends go out
/// concurrently in rounds sized to the sends still wanted, so a slow peer
/// never holds up the others. A failed write removes and closes that
/// connection.
pub async fn flood(
    registry: &ConnectionRegistry,
    bytes: &[u8],
    exclude: Option<SocketAddr>,
    limit: usize,
) -> FloodReport {
    let mut report = FloodReport::default();
    let mut targets = registry
        .snapshot()
        .await
        .into_iter()
        .filter(|conn| exclude != Some(conn.addr()));

    loop {
        let wanted = if limit == 0 {
            usize::MAX
        } else {
            limit - report.sent
        };
        if wanted == 0 {
            break;
        }
        let round: Vec<_> = targets.by_ref().take(wanted).collect();
        if round.is_empty() {
            break;
        }
        deliver(registry, round, bytes, &mut report).await;
    }

    report
}

/// Send to all of `targets` at once, recording results in `report`
pub(crate) async fn deliver(
    registry: &ConnectionRegistry,
    targets: Vec<Arc<PeerConnection>>,
    bytes: &[u8],
    report: &mut FloodReport,
) {
    let results = join_all(targets.iter().map(|conn| conn.send(bytes))).await;

    for (conn, result) in targets.into_iter().zip(results) {
        match result {
            Ok(()) => report.sent += 1,
            Err(e) => {
                log::debug!("Send to {} failed: {}", conn.addr(), e);
                if registry.remove(&conn).await {
                    report.dropped.push(conn.addr());
                }
                conn.close().await;
            }
        }
    }
}

impl NodeContext {
    /// Flood pre-packed bytes; returns the number of peers reached
    pub(crate) async fn flood(&self, bytes: &[u8], exclude: Option<SocketAddr>, limit: usize) -> usize {
        let report = flood(&self.registry, bytes, exclude, limit).await;
        for addr in report.dropped {
            self.emit(move |events| events.on_disconnect(addr));
        }
        report.sent
    }

    /// Flood on a worker task
    ///
    /// With a `source` message the post-broadcast event fires once done.
    pub(crate) fn flood_async(
        self: &Arc<Self>,
        bytes: Bytes,
        exclude: Option<SocketAddr>,
        source: Option<Message>,
    ) {
        let ctx = Arc::clone(self);
        self.spawn(async move {
            let sent = ctx.flood(&bytes, exclude, 0).await;
            log::debug!("Flooded {} bytes to {} peers", bytes.len(), sent);
            if let Some(message) = source {
                ctx.emit(move |events| events.on_post_broadcast(&message, sent));
            }
        });
    }

    /// Send a direct (non-broadcast) message to neighbours
    pub(crate) async fn request_neighbors(
        &self,
        message: &Message,
        exclude: Option<SocketAddr>,
        limit: usize,
    ) -> Result<usize, NodeError> {
        let bytes = self.pack(message, false)?;
        Ok(self.flood(&bytes, exclude, limit).await)
    }
}
