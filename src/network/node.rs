//! Overlay node
//!
//! `Node` is a cheap handle over shared state. It owns the connection
//! registry, the broadcast de-duplication filter, the public node list, the
//! proof-of-work engine and every background task; `shutdown` tears all of
//! them down once.

use crate::collection::{BloomFilter, LimitedRandomSet};
use crate::network::codec::{EnvelopeCodec, NetworkId, Packet};
use crate::network::config::{NodeConfig, DEFAULT_BACKLOG};
use crate::network::connection::PeerConnection;
use crate::network::error::NodeError;
use crate::network::handler::{HandlerRegistry, MessageHandler, NodeEvents};
use crate::network::message::{ConnectivityProbe, Message};
use crate::network::registry::ConnectionRegistry;
use crate::network::{heartbeat, server};
use crate::pow::ProofOfWorkEngine;
use bytes::Bytes;
use futures::future::join_all;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// How long shutdown waits for background tasks
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Node status snapshot
#[derive(Debug, Clone)]
pub struct NodeStatus {
    pub network_id: NetworkId,
    pub listen_addr: Option<SocketAddr>,
    pub connected: usize,
    pub max_connections: usize,
    pub public_nodes: usize,
    pub external_addrs: Vec<IpAddr>,
    pub shut_down: bool,
}

/// State shared by the node handle, connection loops and worker tasks
pub(crate) struct NodeContext {
    pub(crate) config: NodeConfig,
    pub(crate) network_id: NetworkId,
    pub(crate) registry: ConnectionRegistry,
    pub(crate) bloom: BloomFilter,
    pub(crate) public_nodes: LimitedRandomSet<SocketAddr>,
    pub(crate) handlers: HandlerRegistry,
    events: Vec<Arc<dyn NodeEvents>>,
    pow: ProofOfWorkEngine,
    pub(crate) shutdown: CancellationToken,
    tasks: TaskTracker,
    runtime: Handle,
    pub(crate) listen_addr: RwLock<Option<SocketAddr>>,
    pub(crate) external_addrs: RwLock<HashSet<IpAddr>>,
    closed: AtomicBool,
}

impl NodeContext {
    /// Run a future on the node's worker tasks
    pub(crate) fn spawn<F>(&self, future: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tasks.spawn_on(future, &self.runtime)
    }

    /// Notify every subscriber on a worker task
    pub(crate) fn emit<F>(&self, notify: F)
    where
        F: Fn(&dyn NodeEvents) + Send + 'static,
    {
        if self.events.is_empty() {
            return;
        }
        let events = self.events.clone();
        self.spawn(async move {
            for subscriber in &events {
                notify(subscriber.as_ref());
            }
        });
    }

    /// Encode a message; broadcasts come out unsealed (no nonce yet)
    pub(crate) fn pack(&self, message: &Message, broadcast: bool) -> Result<Bytes, NodeError> {
        let payload = message.encode_payload()?;
        let mut codec = EnvelopeCodec::new(self.config.max_payload_size);
        let bytes = codec.pack(Packet {
            kind: message.kind(),
            broadcast,
            network_id: self.network_id,
            code: message.code(),
            payload,
            nonce: None,
        })?;
        Ok(bytes.freeze())
    }

    /// Send a direct message on one connection; failure disconnects it
    pub(crate) async fn send_message(
        &self,
        conn: &Arc<PeerConnection>,
        message: &Message,
    ) -> Result<(), NodeError> {
        let bytes = self.pack(message, false)?;
        if let Err(e) = conn.send(&bytes).await {
            self.disconnect(conn).await;
            return Err(e);
        }
        Ok(())
    }

    /// Remove and close a connection
    pub(crate) async fn disconnect(&self, conn: &Arc<PeerConnection>) {
        let removed = self.registry.remove(conn).await;
        conn.close().await;
        if removed {
            let addr = conn.addr();
            self.emit(move |events| events.on_disconnect(addr));
        }
    }

    pub(crate) fn listen_port(&self) -> u16 {
        self.listen_addr.read().map_or(0, |addr| addr.port())
    }

    pub(crate) fn learn_external_address(&self, ip: IpAddr) {
        if self.external_addrs.write().insert(ip) {
            log::info!("Learned external address {}", ip);
        }
    }

    fn ensure_running(&self) -> Result<(), NodeError> {
        if self.shutdown.is_cancelled() {
            return Err(NodeError::ShutDown);
        }
        Ok(())
    }
}

/// Builds a node with its handlers and subscribers
pub struct NodeBuilder {
    config: NodeConfig,
    handlers: Vec<(u16, Arc<dyn MessageHandler>)>,
    events: Vec<Arc<dyn NodeEvents>>,
}

impl NodeBuilder {
    pub fn new(config: NodeConfig) -> Self {
        Self {
            config,
            handlers: Vec::new(),
            events: Vec::new(),
        }
    }

    /// Handle custom messages with `code`
    pub fn handler<H: MessageHandler>(mut self, code: u16, handler: H) -> Self {
        self.handlers.push((code, Arc::new(handler)));
        self
    }

    /// Receive node events
    pub fn subscribe<E: NodeEvents>(mut self, events: E) -> Self {
        self.events.push(Arc::new(events));
        self
    }

    /// Create the node; must run inside a Tokio runtime
    ///
    /// Fails on invalid configuration or a code registered twice.
    pub fn build(self) -> Result<Node, NodeError> {
        self.config.validate()?;
        let runtime = Handle::try_current().map_err(|_| NodeError::NoRuntime)?;

        let mut handlers = HandlerRegistry::new();
        for (code, handler) in self.handlers {
            handlers.register(code, handler)?;
        }

        let config = self.config;
        let shutdown = CancellationToken::new();
        let pow = ProofOfWorkEngine::new(config.pow_threads, shutdown.child_token())?;
        let network_id = NetworkId::from_name(config.network.as_deref());

        log::info!(
            "Node created (network {}, max {} connections, difficulty {})",
            config.network.as_deref().unwrap_or("<none>"),
            config.max_connections,
            config.broadcast_difficulty
        );

        let ctx = Arc::new(NodeContext {
            network_id,
            registry: ConnectionRegistry::new(config.max_connections),
            bloom: BloomFilter::new(config.bloom_filter_bytes, config.bloom_false_positive_rate),
            public_nodes: LimitedRandomSet::new(config.public_nodes_capacity),
            handlers,
            events: self.events,
            pow,
            shutdown,
            tasks: TaskTracker::new(),
            runtime,
            listen_addr: RwLock::new(None),
            external_addrs: RwLock::new(config.external_addresses.iter().copied().collect()),
            closed: AtomicBool::new(false),
            config,
        });

        heartbeat::spawn(Arc::clone(&ctx));
        Ok(Node { ctx })
    }
}

/// Handle to a running overlay node
#[derive(Clone)]
pub struct Node {
    ctx: Arc<NodeContext>,
}

impl Node {
    pub fn builder(config: NodeConfig) -> NodeBuilder {
        NodeBuilder::new(config)
    }

    /// Node without handlers or subscribers
    pub fn new(config: NodeConfig) -> Result<Self, NodeError> {
        NodeBuilder::new(config).build()
    }

    pub(crate) fn from_context(ctx: Arc<NodeContext>) -> Self {
        Self { ctx }
    }

    pub fn config(&self) -> &NodeConfig {
        &self.ctx.config
    }

    pub fn network_id(&self) -> NetworkId {
        self.ctx.network_id
    }

    /// Start accepting connections on `bind:port` (all interfaces by default)
    ///
    /// Returns the bound address; port 0 picks a free port.
    pub fn listen(&self, port: u16, backlog: u32, bind: Option<IpAddr>) -> Result<SocketAddr, NodeError> {
        self.ctx.ensure_running()?;
        let _guard = self.ctx.runtime.enter();

        let mut slot = self.ctx.listen_addr.write();
        if let Some(addr) = *slot {
            return Err(NodeError::AlreadyListening(addr));
        }

        let ip = bind.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        let listener = server::bind(SocketAddr::new(ip, port), backlog)?;
        let addr = listener.local_addr()?;
        *slot = Some(addr);
        drop(slot);

        log::info!("Listening on {}", addr);
        self.ctx
            .spawn(server::accept_loop(Arc::clone(&self.ctx), listener));
        Ok(addr)
    }

    /// Listen on all interfaces with the default backlog
    pub fn listen_on(&self, port: u16) -> Result<SocketAddr, NodeError> {
        self.listen(port, DEFAULT_BACKLOG, None)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.ctx.listen_addr.read()
    }

    /// Dial a peer
    ///
    /// Returns once the TCP connection is up; the handshake and acceptance
    /// continue on the connection's own task.
    pub async fn connect(&self, ip: IpAddr, port: u16) -> Result<(), NodeError> {
        self.ctx.ensure_running()?;
        let addr = SocketAddr::new(ip, port);

        if self.ctx.registry.is_full().await {
            return Err(NodeError::ConnectionFull {
                max: self.ctx.registry.max_connections(),
            });
        }
        if self.ctx.registry.contains(&addr).await {
            return Err(NodeError::AlreadyConnected(addr));
        }

        log::info!("Connecting to {}", addr);
        let stream = tokio::time::timeout(self.ctx.config.connect_timeout(), TcpStream::connect(addr))
            .await
            .map_err(|_| NodeError::ConnectTimeout(addr))??;

        if self.ctx.registry.contains(&addr).await {
            return Err(NodeError::AlreadyConnected(addr));
        }

        self.ctx.spawn(server::handle_connection(
            Arc::clone(&self.ctx),
            stream,
            addr,
            true,
        ));
        Ok(())
    }

    /// Broadcast a message to the whole overlay
    ///
    /// Fails before any work is done if fewer than `min_connected` peers are
    /// connected. Otherwise the proof-of-work runs in the background and the
    /// sealed message is flooded as soon as it is found.
    pub async fn broadcast(&self, message: Message, min_connected: usize) -> Result<(), NodeError> {
        self.ctx.ensure_running()?;

        let connected = self.ctx.registry.len().await;
        if connected < min_connected {
            return Err(NodeError::InsufficientPeers {
                required: min_connected,
                connected,
            });
        }

        let source = self.ctx.pack(&message, true)?;
        let ctx = Arc::clone(&self.ctx);
        self.ctx.pow.solve(
            source,
            self.ctx.config.broadcast_difficulty,
            Box::new(move |frame| {
                // Echoes of our own broadcast are dropped on arrival
                ctx.bloom.add(&frame);
                ctx.flood_async(frame, None, Some(message));
            }),
        )?;
        Ok(())
    }

    /// Send a direct message to up to `limit` neighbours (0 = all)
    pub async fn request_neighbors(
        &self,
        message: &Message,
        exclude: Option<SocketAddr>,
        limit: usize,
    ) -> Result<usize, NodeError> {
        self.ctx.ensure_running()?;
        self.ctx.request_neighbors(message, exclude, limit).await
    }

    /// Probe whether a node answers at `ip:port`
    pub async fn detect(&self, ip: IpAddr, port: u16) -> bool {
        self.ctx.detect(SocketAddr::new(ip, port)).await
    }

    /// Up to `n` random public nodes
    pub fn public_nodes(&self, n: usize) -> Vec<SocketAddr> {
        self.ctx.public_nodes.pick(n)
    }

    /// Vet and merge candidate public nodes; returns the ones added
    pub async fn add_public_nodes(&self, addrs: Vec<SocketAddr>, skip_detection: bool) -> Vec<SocketAddr> {
        self.ctx.add_public_nodes(addrs, skip_detection).await
    }

    /// Like `add_public_nodes`, then share the added nodes with neighbours
    pub async fn add_and_share_public_nodes(
        &self,
        addrs: Vec<SocketAddr>,
        skip_detection: bool,
    ) -> Vec<SocketAddr> {
        self.ctx
            .add_and_share_public_nodes(addrs, None, skip_detection)
            .await
    }

    /// Ask up to `limit` neighbours to probe our listening port
    ///
    /// Answers arrive as `on_reachability` events. Returns the number of
    /// requests sent; 0 when not listening.
    pub async fn request_connectivity_check(&self, limit: usize) -> Result<usize, NodeError> {
        let port = self.ctx.listen_port();
        if port == 0 {
            log::warn!("Connectivity check needs a listening port");
            return Ok(0);
        }
        self.request_neighbors(
            &Message::ConnectivityDetectProxy(ConnectivityProbe::Request { port }),
            None,
            limit,
        )
        .await
    }

    pub async fn connected_count(&self) -> usize {
        self.ctx.registry.len().await
    }

    pub async fn connected_peers(&self) -> Vec<SocketAddr> {
        self.ctx.registry.addresses().await
    }

    pub async fn status(&self) -> NodeStatus {
        NodeStatus {
            network_id: self.ctx.network_id,
            listen_addr: self.local_addr(),
            connected: self.ctx.registry.len().await,
            max_connections: self.ctx.registry.max_connections(),
            public_nodes: self.ctx.public_nodes.len(),
            external_addrs: self.ctx.external_addrs.read().iter().copied().collect(),
            shut_down: self.is_shutdown(),
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.ctx.closed.load(Ordering::Acquire)
    }

    /// Stop everything; later calls do nothing
    pub async fn shutdown(&self) {
        if self.ctx.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        log::info!("Node shutting down...");

        self.ctx.shutdown.cancel();
        self.ctx.pow.shutdown();

        let connections = self.ctx.registry.drain().await;
        join_all(connections.iter().map(|conn| conn.close())).await;
        for conn in connections {
            let addr = conn.addr();
            self.ctx.emit(move |events| events.on_disconnect(addr));
        }

        self.ctx.tasks.close();
        if tokio::time::timeout(SHUTDOWN_GRACE, self.ctx.tasks.wait())
            .await
            .is_err()
        {
            log::warn!("{} tasks still running after shutdown", self.ctx.tasks.len());
        }
        log::info!("Node stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::codec::MessageType;
    use crate::network::handler::Responder;
    use crate::network::handshake::MAGIC;
    use crate::network::message::CustomMessage;
    use crate::pow::NONCE_LEN;
    use std::sync::atomic::AtomicUsize;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::mpsc;

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    fn test_config() -> NodeConfig {
        NodeConfig {
            network: Some("testnet".to_string()),
            allow_private_addresses: true,
            broadcast_difficulty: 0,
            pow_threads: 2,
            bloom_filter_bytes: 4096,
            ..Default::default()
        }
    }

    fn counting_node(config: NodeConfig, code: u16) -> (Node, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let node = Node::builder(config)
            .handler(code, move |_msg: CustomMessage, _r: Responder| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            })
            .build()
            .unwrap();
        (node, count)
    }

    async fn wait_for<F: Fn() -> bool>(condition: F) -> bool {
        for _ in 0..100 {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        false
    }

    async fn wait_connected(node: &Node, n: usize) -> bool {
        for _ in 0..100 {
            if node.connected_count().await == n {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        false
    }

    /// Raw socket that has done the handshake and the client's first message
    async fn raw_peer(addr: SocketAddr) -> tokio::net::TcpStream {
        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        stream.write_all(MAGIC).await.unwrap();
        let mut tag = [0u8; MAGIC.len()];
        stream.read_exact(&mut tag).await.unwrap();
        assert_eq!(&tag, MAGIC);

        // NodesExchange { max_req: 0, listen_port: 0, nodes: [] }
        stream.write_all(&[2, 0, 0, 0, 6, 0, 0, 0, 0, 0, 0]).await.unwrap();
        stream
    }

    fn sealed_broadcast(node: &Node, payload: &'static [u8], nonce: &[u8]) -> Vec<u8> {
        let source = node
            .ctx
            .pack(&Message::custom(1, payload), true)
            .unwrap();
        crate::pow::assemble(&source, nonce).to_vec()
    }

    #[test]
    fn test_build_needs_runtime() {
        assert!(matches!(
            Node::new(NodeConfig::default()),
            Err(NodeError::NoRuntime)
        ));
    }

    #[tokio::test]
    async fn test_duplicate_handler_rejected_at_build() {
        let result = Node::builder(test_config())
            .handler(7, |_m: CustomMessage, _r: Responder| async {})
            .handler(7, |_m: CustomMessage, _r: Responder| async {})
            .build();
        assert!(matches!(result, Err(NodeError::DuplicateHandler { code: 7 })));
    }

    #[tokio::test]
    async fn test_two_nodes_connect() {
        let a = Node::new(test_config()).unwrap();
        let b = Node::new(test_config()).unwrap();
        let addr = a.listen(0, 16, Some(LOCALHOST)).unwrap();
        b.listen(0, 16, Some(LOCALHOST)).unwrap();

        b.connect(LOCALHOST, addr.port()).await.unwrap();
        assert!(wait_connected(&a, 1).await);
        assert!(wait_connected(&b, 1).await);

        // Each learned the other's listening address
        assert!(wait_for(|| !b.public_nodes(4).is_empty()).await);
        assert_eq!(b.public_nodes(4), vec![addr]);

        assert!(matches!(
            b.connect(LOCALHOST, addr.port()).await,
            Err(NodeError::AlreadyConnected(_))
        ));
        assert!(matches!(
            a.listen(0, 16, Some(LOCALHOST)),
            Err(NodeError::AlreadyListening(_))
        ));

        a.shutdown().await;
        b.shutdown().await;
    }

    #[tokio::test]
    async fn test_wrong_magic_is_closed_silently() {
        let node = Node::new(test_config()).unwrap();
        let addr = node.listen(0, 16, Some(LOCALHOST)).unwrap();

        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        stream.write_all(b"COMMUNICAS").await.unwrap();

        let mut received = Vec::new();
        let read = tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut received))
            .await
            .unwrap();
        // Only the node's own tag arrives before the close
        assert!(read.is_err() || received == MAGIC.to_vec());
        assert_eq!(node.connected_count().await, 0);

        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_full_node_refuses_with_alternatives() {
        let config = NodeConfig {
            max_connections: 1,
            ..test_config()
        };
        let node = Node::new(config).unwrap();
        let addr = node.listen(0, 16, Some(LOCALHOST)).unwrap();
        node.add_public_nodes(vec!["8.8.8.8:7700".parse().unwrap()], true)
            .await;

        let _first = raw_peer(addr).await;
        assert!(wait_connected(&node, 1).await);

        let mut second = raw_peer(addr).await;
        let mut received = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), second.read_to_end(&mut received))
            .await
            .unwrap()
            .unwrap();

        let mut codec = EnvelopeCodec::default();
        let mut buf = bytes::BytesMut::from(&received[..]);
        let frame = tokio_util::codec::Decoder::decode(&mut codec, &mut buf)
            .unwrap()
            .unwrap();
        assert_eq!(frame.envelope.kind, MessageType::ConnectionRefuse);
        match Message::decode(frame.envelope.kind, 0, frame.payload()).unwrap() {
            Message::ConnectionRefuse(refuse) => {
                assert_eq!(refuse.reason, server::REFUSE_REASON);
                assert_eq!(refuse.nodes, vec!["8.8.8.8:7700".parse().unwrap()]);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(node.connected_count().await, 1);

        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_detect_live_node() {
        let node = Node::new(test_config()).unwrap();
        let addr = node.listen(0, 16, Some(LOCALHOST)).unwrap();
        let prober = Node::new(test_config()).unwrap();

        assert!(prober.detect(LOCALHOST, addr.port()).await);
        // A probe never becomes a registered connection
        assert_eq!(node.connected_count().await, 0);

        node.shutdown().await;
        prober.shutdown().await;
    }

    #[tokio::test]
    async fn test_duplicate_broadcast_dispatched_once() {
        let (node, count) = counting_node(test_config(), 1);
        let addr = node.listen(0, 16, Some(LOCALHOST)).unwrap();

        let mut first = raw_peer(addr).await;
        let mut second = raw_peer(addr).await;
        assert!(wait_connected(&node, 2).await);

        let frame = sealed_broadcast(&node, b"hello", &[0u8; NONCE_LEN]);
        first.write_all(&frame).await.unwrap();
        second.write_all(&frame).await.unwrap();

        assert!(wait_for(|| count.load(Ordering::SeqCst) == 1).await);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_insufficient_work_is_dropped() {
        let config = NodeConfig {
            broadcast_difficulty: 64,
            ..test_config()
        };
        let (node, count) = counting_node(config, 1);
        let addr = node.listen(0, 16, Some(LOCALHOST)).unwrap();

        let mut sender = raw_peer(addr).await;
        let mut observer = raw_peer(addr).await;
        assert!(wait_connected(&node, 2).await);

        let frame = sealed_broadcast(&node, b"cheap", &[1u8; NONCE_LEN]);
        sender.write_all(&frame).await.unwrap();

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        // Not relayed either: the observer sees nothing (or only a heartbeat)
        let mut buf = [0u8; 64];
        let relayed = tokio::time::timeout(Duration::from_millis(200), observer.read(&mut buf)).await;
        if let Ok(Ok(n)) = relayed {
            assert!(n == 0 || buf[0] == MessageType::HeartBeat.as_u8());
        }

        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_broadcast_needs_peers() {
        let node = Node::new(test_config()).unwrap();
        assert!(matches!(
            node.broadcast(Message::custom(1, &b"x"[..]), 1).await,
            Err(NodeError::InsufficientPeers {
                required: 1,
                connected: 0
            })
        ));
        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_broadcast_reaches_neighbor() {
        let config = NodeConfig {
            broadcast_difficulty: 4,
            ..test_config()
        };
        let (tx, mut rx) = mpsc::unbounded_channel();
        let receiver = Node::builder(config.clone())
            .handler(1, move |msg: CustomMessage, responder: Responder| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send((msg.payload, responder.is_broadcast()));
                }
            })
            .build()
            .unwrap();
        let sender = Node::new(config).unwrap();
        let addr = receiver.listen(0, 16, Some(LOCALHOST)).unwrap();

        sender.connect(LOCALHOST, addr.port()).await.unwrap();
        assert!(wait_connected(&sender, 1).await);

        sender
            .broadcast(Message::custom(1, &b"over the mesh"[..]), 1)
            .await
            .unwrap();

        let (payload, broadcast) = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&payload[..], b"over the mesh");
        assert!(broadcast);

        sender.shutdown().await;
        receiver.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let node = Node::new(test_config()).unwrap();
        node.listen(0, 16, Some(LOCALHOST)).unwrap();

        node.shutdown().await;
        node.shutdown().await;
        assert!(node.is_shutdown());
        assert!(matches!(
            node.connect(LOCALHOST, 1).await,
            Err(NodeError::ShutDown)
        ));
        assert!(node.status().await.shut_down);
    }

    #[tokio::test]
    async fn test_custom_before_acceptance_disconnects() {
        let (node, count) = counting_node(test_config(), 1);
        let addr = node.listen(0, 16, Some(LOCALHOST)).unwrap();

        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        stream.write_all(MAGIC).await.unwrap();
        let mut tag = [0u8; MAGIC.len()];
        stream.read_exact(&mut tag).await.unwrap();

        let custom = node.ctx.pack(&Message::custom(1, &b"too early"[..]), false).unwrap();
        stream.write_all(&custom).await.unwrap();

        let mut received = Vec::new();
        let read = tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut received))
            .await
            .unwrap();
        assert!(read.is_err() || received.is_empty());
        assert_eq!(node.connected_count().await, 0);
        assert_eq!(count.load(Ordering::SeqCst), 0);

        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_foreign_network_broadcast_is_relayed_not_dispatched() {
        let (node, count) = counting_node(test_config(), 1);
        let addr = node.listen(0, 16, Some(LOCALHOST)).unwrap();
        let foreign = Node::new(NodeConfig {
            network: Some("othernet".to_string()),
            ..test_config()
        })
        .unwrap();

        let mut sender = raw_peer(addr).await;
        let mut observer = raw_peer(addr).await;
        assert!(wait_connected(&node, 2).await);

        let frame = sealed_broadcast(&foreign, b"elsewhere", &[3u8; NONCE_LEN]);
        sender.write_all(&frame).await.unwrap();

        let mut relayed = vec![0u8; frame.len()];
        tokio::time::timeout(Duration::from_secs(5), observer.read_exact(&mut relayed))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(relayed, frame);

        // Not echoed back to the sender
        let mut buf = [0u8; 64];
        let echoed = tokio::time::timeout(Duration::from_millis(200), sender.read(&mut buf)).await;
        if let Ok(Ok(n)) = echoed {
            assert!(n == 0 || buf[0] == MessageType::HeartBeat.as_u8());
        }
        assert_eq!(count.load(Ordering::SeqCst), 0);

        node.shutdown().await;
        foreign.shutdown().await;
    }

    #[tokio::test]
    async fn test_shared_nodes_split_across_messages() {
        let config = NodeConfig {
            max_payload_size: 64,
            ..test_config()
        };
        let node = Node::new(config).unwrap();
        let (local, mut remote) = tokio::io::duplex(64 * 1024);
        node.ctx
            .registry
            .insert(Arc::new(PeerConnection::new(
                SocketAddr::from(([127, 0, 0, 1], 9000)),
                false,
                local,
            )))
            .await
            .unwrap();

        let nodes: Vec<SocketAddr> = (1..=20u8)
            .map(|i| SocketAddr::from(([8, 8, 4, i], 7700)))
            .collect();
        let added = node.add_and_share_public_nodes(nodes.clone(), true).await;
        assert_eq!(added.len(), 20);

        let mut received = Vec::new();
        let mut buf = [0u8; 1024];
        while let Ok(Ok(n)) =
            tokio::time::timeout(Duration::from_millis(200), remote.read(&mut buf)).await
        {
            if n == 0 {
                break;
            }
            received.extend_from_slice(&buf[..n]);
        }

        let mut codec = EnvelopeCodec::new(64);
        let mut bytes = bytes::BytesMut::from(&received[..]);
        let mut shared = Vec::new();
        let mut frames = 0;
        while let Some(frame) = tokio_util::codec::Decoder::decode(&mut codec, &mut bytes).unwrap() {
            frames += 1;
            assert_eq!(frame.envelope.kind, MessageType::NewNodesShare);
            assert!(frame.payload().len() <= 64);
            match Message::decode(frame.envelope.kind, 0, frame.payload()).unwrap() {
                Message::NewNodesShare(chunk) => shared.extend(chunk),
                other => panic!("unexpected {:?}", other),
            }
        }
        assert!(bytes.is_empty());
        assert_eq!(frames, 7);
        shared.sort();
        let mut expected = nodes;
        expected.sort();
        assert_eq!(shared, expected);

        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_with_peer_that_stops_reading() {
        let config = NodeConfig {
            write_timeout_ms: 60_000,
            ..test_config()
        };
        let node = Node::new(config).unwrap();
        let addr = node.listen(0, 16, Some(LOCALHOST)).unwrap();

        // Completes the handshake, then never reads again
        let _silent = raw_peer(addr).await;
        assert!(wait_connected(&node, 1).await);

        let writer = node.clone();
        let pending = tokio::spawn(async move {
            let big = Message::custom(1, vec![0u8; 3 * 1024 * 1024]);
            for _ in 0..8 {
                if writer.request_neighbors(&big, None, 0).await.unwrap_or(0) == 0 {
                    break;
                }
            }
        });
        tokio::time::sleep(Duration::from_millis(500)).await;

        tokio::time::timeout(Duration::from_secs(10), node.shutdown())
            .await
            .expect("shutdown waited on a stalled peer");
        assert_eq!(node.connected_count().await, 0);
        tokio::time::timeout(Duration::from_secs(5), pending)
            .await
            .unwrap()
            .unwrap();
    }
}
