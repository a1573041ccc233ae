//! Idle-connection heartbeats

use crate::network::gossip::{deliver, FloodReport};
use crate::network::message::Message;
use crate::network::node::NodeContext;
use crate::network::registry::ConnectionRegistry;
use std::sync::Arc;
use std::time::Duration;

/// Scan period
pub const TICK: Duration = Duration::from_secs(1);

/// Send `heartbeat` to every connection idle for at least its threshold
///
/// `threshold(is_client)` gives the idle seconds for each role. Due
/// connections are written concurrently; a failed send drops the connection.
pub async fn send_due_heartbeats<F>(
    registry: &ConnectionRegistry,
    now: i64,
    threshold: F,
    heartbeat: &[u8],
) -> FloodReport
where
    F: Fn(bool) -> u64,
{
    let due: Vec<_> = registry
        .snapshot()
        .await
        .into_iter()
        .filter(|conn| conn.idle_secs(now) >= threshold(conn.is_client()))
        .collect();
    for conn in &due {
        log::trace!("Heartbeat to {}", conn.addr());
    }

    let mut report = FloodReport::default();
    deliver(registry, due, heartbeat, &mut report).await;
    report
}

/// Start the heartbeat timer; it stops with the node
pub(crate) fn spawn(ctx: Arc<NodeContext>) {
    let task_ctx = Arc::clone(&ctx);
    ctx.spawn(async move {
        let ctx = task_ctx;
        let heartbeat = match ctx.pack(&Message::HeartBeat, false) {
            Ok(bytes) => bytes,
            Err(e) => {
                log::error!("Failed to encode heartbeat: {}", e);
                return;
            }
        };

        let mut ticker = tokio::time::interval(TICK);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ctx.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let now = chrono::Utc::now().timestamp();
                    let report = send_due_heartbeats(
                        &ctx.registry,
                        now,
                        |is_client| ctx.config.heartbeat_threshold(is_client),
                        &heartbeat,
                    )
                    .await;
                    for addr in report.dropped {
                        ctx.emit(move |events| events.on_disconnect(addr));
                    }
                }
            }
        }

        log::debug!("Heartbeat timer stopped");
    });
}
