//! Message dispatch and event subscribers
//!
//! Built-in protocol messages are handled here. Custom messages are routed by
//! code to handlers registered on the node builder.

use crate::network::connection::PeerConnection;
use crate::network::error::NodeError;
use crate::network::message::{ConnectivityProbe, CustomMessage, Message, NodesExchange};
use crate::network::node::{Node, NodeContext};
use bytes::Bytes;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

/// Handles custom messages of one code
///
/// Implemented for any `Fn(CustomMessage, Responder) -> impl Future`.
pub trait MessageHandler: Send + Sync + 'static {
    fn handle(&self, message: CustomMessage, responder: Responder) -> BoxFuture<'static, ()>;
}

impl<F, Fut> MessageHandler for F
where
    F: Fn(CustomMessage, Responder) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn handle(&self, message: CustomMessage, responder: Responder) -> BoxFuture<'static, ()> {
        Box::pin(self(message, responder))
    }
}

/// Custom message handlers keyed by code
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<u16, Arc<dyn MessageHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler; each code may be registered once
    pub fn register(&mut self, code: u16, handler: Arc<dyn MessageHandler>) -> Result<(), NodeError> {
        if self.handlers.contains_key(&code) {
            return Err(NodeError::DuplicateHandler { code });
        }
        self.handlers.insert(code, handler);
        Ok(())
    }

    pub fn get(&self, code: u16) -> Option<Arc<dyn MessageHandler>> {
        self.handlers.get(&code).cloned()
    }

    pub fn contains(&self, code: u16) -> bool {
        self.handlers.contains_key(&code)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Node lifecycle notifications
///
/// Every method defaults to a no-op. Calls run on worker tasks, never on a
/// connection's read loop, so blocking here only delays other events.
pub trait NodeEvents: Send + Sync + 'static {
    /// A connection was accepted into the registry
    fn on_connect(&self, _addr: SocketAddr) {}

    /// An accepted connection was closed
    fn on_disconnect(&self, _addr: SocketAddr) {}

    /// Public nodes that passed filtering and were newly added
    fn on_new_public_nodes(&self, _nodes: &[SocketAddr]) {}

    /// One of our broadcasts was flooded to `sent` peers
    fn on_post_broadcast(&self, _message: &Message, _sent: usize) {}

    /// A server refused our connection
    fn on_connect_refused(&self, _addr: SocketAddr, _reason: &str, _alternatives: &[SocketAddr]) {}

    /// A neighbour reported whether `address` is reachable from outside
    fn on_reachability(&self, _address: SocketAddr, _alive: bool) {}
}

/// Reply channel handed to custom message handlers
#[derive(Clone)]
pub struct Responder {
    ctx: Arc<NodeContext>,
    conn: Arc<PeerConnection>,
    raw: Option<Bytes>,
}

impl Responder {
    pub(crate) fn new(ctx: Arc<NodeContext>, conn: Arc<PeerConnection>, raw: Option<Bytes>) -> Self {
        Self { ctx, conn, raw }
    }

    /// Address of the neighbour the message arrived from
    pub fn peer_addr(&self) -> SocketAddr {
        self.conn.addr()
    }

    /// Whether the message arrived as a broadcast
    pub fn is_broadcast(&self) -> bool {
        self.raw.is_some()
    }

    /// Send a direct message back to the neighbour
    pub async fn reply(&self, message: &Message) -> Result<(), NodeError> {
        self.ctx.send_message(&self.conn, message).await
    }

    /// Re-flood the received broadcast to every other neighbour
    ///
    /// Returns the number of peers reached; 0 for direct messages.
    pub async fn forward(&self) -> usize {
        match &self.raw {
            Some(raw) => self.ctx.flood(raw, Some(self.conn.addr()), 0).await,
            None => 0,
        }
    }

    pub fn node(&self) -> Node {
        Node::from_context(Arc::clone(&self.ctx))
    }
}

/// Handle one decoded message
///
/// `raw` carries the wire frame of broadcasts so handlers can forward them.
pub(crate) async fn dispatch(
    ctx: Arc<NodeContext>,
    conn: Arc<PeerConnection>,
    message: Message,
    raw: Option<Bytes>,
) {
    let addr = conn.addr();
    log::trace!("Dispatching {} from {}", message.type_name(), addr);

    match message {
        Message::HeartBeat => {}

        Message::NodeDetection => {
            // Only probes get an answer; accepted peers would ping-pong
            if !conn.is_accepted() {
                if let Err(e) = ctx.send_message(&conn, &Message::NodeDetection).await {
                    log::debug!("Detection reply to {} failed: {}", addr, e);
                }
            }
        }

        Message::NodesExchange(exchange) => {
            if exchange.max_req > 0 {
                let reply = Message::NodesExchange(NodesExchange {
                    max_req: 0,
                    listen_port: ctx.listen_port(),
                    nodes: ctx.public_nodes.pick(exchange.max_req as usize),
                });
                if let Err(e) = ctx.send_message(&conn, &reply).await {
                    log::debug!("Node exchange reply to {} failed: {}", addr, e);
                    return;
                }
            }

            let mut nodes = exchange.nodes;
            if exchange.listen_port != 0 {
                nodes.push(SocketAddr::new(addr.ip(), exchange.listen_port));
            }
            ctx.add_and_share_public_nodes(nodes, Some(addr), false).await;
        }

        Message::ConnectionRefuse(refuse) => {
            log::info!("Connection refused by {}: {}", addr, refuse.reason);
            let alternatives = refuse.nodes.clone();
            let reason = refuse.reason;
            ctx.emit(move |events| events.on_connect_refused(addr, &reason, &alternatives));
            ctx.add_and_share_public_nodes(refuse.nodes, Some(addr), false).await;
        }

        Message::ConnectivityDetectProxy(ConnectivityProbe::Request { port }) => {
            let target = SocketAddr::new(addr.ip(), port);
            let alive = ctx.detect(target).await;
            let reply = Message::ConnectivityDetectProxy(ConnectivityProbe::Response {
                address: target,
                alive,
            });
            if let Err(e) = ctx.send_message(&conn, &reply).await {
                log::debug!("Connectivity reply to {} failed: {}", addr, e);
            }
        }

        Message::ConnectivityDetectProxy(ConnectivityProbe::Response { address, alive }) => {
            log::info!(
                "{} reports {} as {}",
                addr,
                address,
                if alive { "reachable" } else { "unreachable" }
            );
            if alive {
                ctx.learn_external_address(address.ip());
            }
            ctx.emit(move |events| events.on_reachability(address, alive));
        }

        Message::NewNodesShare(nodes) => {
            ctx.add_and_share_public_nodes(nodes, Some(addr), false).await;
        }

        Message::Custom(custom) => match ctx.handlers.get(custom.code) {
            Some(handler) => {
                let responder = Responder::new(Arc::clone(&ctx), conn, raw);
                handler.handle(custom, responder).await;
            }
            None => log::debug!("No handler for custom code {}", custom.code),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_registration_fails() {
        let mut registry = HandlerRegistry::new();
        registry
            .register(1, Arc::new(|_msg: CustomMessage, _r: Responder| async {}))
            .unwrap();
        registry
            .register(2, Arc::new(|_msg: CustomMessage, _r: Responder| async {}))
            .unwrap();

        assert!(matches!(
            registry.register(1, Arc::new(|_msg: CustomMessage, _r: Responder| async {})),
            Err(NodeError::DuplicateHandler { code: 1 })
        ));
        assert_eq!(registry.len(), 2);
        assert!(registry.contains(2));
        assert!(registry.get(3).is_none());
    }

    struct Silent;
    impl NodeEvents for Silent {}

    #[test]
    fn test_events_default_to_noop() {
        let events: Arc<dyn NodeEvents> = Arc::new(Silent);
        events.on_connect("1.2.3.4:5".parse().unwrap());
        events.on_post_broadcast(&Message::HeartBeat, 3);
        events.on_new_public_nodes(&[]);
    }
}
