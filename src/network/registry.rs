//! Registry of accepted connections

use crate::network::connection::PeerConnection;
use crate::network::error::NodeError;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Accepted connections keyed by remote address, bounded by `max_connections`
///
/// Safe to mutate and iterate from any task; iteration works on snapshots so
/// writers are never blocked by a slow flood.
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<SocketAddr, Arc<PeerConnection>>>,
    max_connections: usize,
}

impl ConnectionRegistry {
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            max_connections,
        }
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    /// Add a connection; capacity and duplicate checks happen under one lock
    pub async fn insert(&self, conn: Arc<PeerConnection>) -> Result<(), NodeError> {
        let mut connections = self.connections.write().await;

        if connections.contains_key(&conn.addr()) {
            return Err(NodeError::AlreadyConnected(conn.addr()));
        }
        if connections.len() >= self.max_connections {
            return Err(NodeError::ConnectionFull {
                max: self.max_connections,
            });
        }

        log::info!(
            "Added connection: {} (client: {})",
            conn.addr(),
            conn.is_client()
        );
        connections.insert(conn.addr(), conn);
        Ok(())
    }

    /// Remove `conn` only if it is the registered instance for its address
    ///
    /// Returns true if it was removed.
    pub async fn remove(&self, conn: &Arc<PeerConnection>) -> bool {
        let mut connections = self.connections.write().await;
        match connections.get(&conn.addr()) {
            Some(existing) if Arc::ptr_eq(existing, conn) => {
                connections.remove(&conn.addr());
                log::info!("Removed connection: {}", conn.addr());
                true
            }
            _ => false,
        }
    }

    pub async fn contains(&self, addr: &SocketAddr) -> bool {
        self.connections.read().await.contains_key(addr)
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }

    pub async fn is_full(&self) -> bool {
        self.len().await >= self.max_connections
    }

    /// Current connections
    pub async fn snapshot(&self) -> Vec<Arc<PeerConnection>> {
        self.connections.read().await.values().cloned().collect()
    }

    pub async fn addresses(&self) -> Vec<SocketAddr> {
        self.connections.read().await.keys().cloned().collect()
    }

    /// Remove and return every connection
    pub async fn drain(&self) -> Vec<Arc<PeerConnection>> {
        self.connections
            .write()
            .await
            .drain()
            .map(|(_, conn)| conn)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn(port: u16) -> Arc<PeerConnection> {
        Arc::new(PeerConnection::new(
            SocketAddr::from(([127, 0, 0, 1], port)),
            false,
            tokio::io::sink(),
        ))
    }

    #[tokio::test]
    async fn test_capacity_is_enforced() {
        let registry = ConnectionRegistry::new(2);
        registry.insert(conn(1)).await.unwrap();
        registry.insert(conn(2)).await.unwrap();

        assert!(registry.is_full().await);
        assert!(matches!(
            registry.insert(conn(3)).await,
            Err(NodeError::ConnectionFull { max: 2 })
        ));
        assert_eq!(registry.len().await, 2);
    }

    #[tokio::test]
    async fn test_duplicate_address_rejected() {
        let registry = ConnectionRegistry::new(4);
        registry.insert(conn(1)).await.unwrap();
        assert!(matches!(
            registry.insert(conn(1)).await,
            Err(NodeError::AlreadyConnected(_))
        ));
    }

    #[tokio::test]
    async fn test_remove_only_same_instance() {
        let registry = ConnectionRegistry::new(4);
        let first = conn(1);
        registry.insert(Arc::clone(&first)).await.unwrap();

        // A stale connection with the same address must not evict the live one
        let stale = conn(1);
        assert!(!registry.remove(&stale).await);
        assert!(registry.contains(&first.addr()).await);

        assert!(registry.remove(&first).await);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_concurrent_inserts_never_exceed_capacity() {
        let registry = Arc::new(ConnectionRegistry::new(5));
        let mut tasks = Vec::new();
        for port in 0..50 {
            let registry = Arc::clone(&registry);
            tasks.push(tokio::spawn(async move { registry.insert(conn(port)).await }));
        }
        let accepted = futures::future::join_all(tasks)
            .await
            .into_iter()
            .filter(|r| matches!(r, Ok(Ok(()))))
            .count();

        assert_eq!(accepted, 5);
        assert_eq!(registry.len().await, 5);
    }
}
