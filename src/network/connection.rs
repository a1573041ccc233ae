//! A single peer connection
//!
//! The read half is owned by the connection's message loop; everything else
//! (writes, activity tracking, acceptance state) is shared through this type.

use crate::network::error::NodeError;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Write timeout until one is configured
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Write side and state of one peer connection
///
/// Identity is the remote address, so a peer reconnecting from the same
/// endpoint compares equal to its earlier connection.
pub struct PeerConnection {
    addr: SocketAddr,
    is_client: bool,
    writer: Mutex<BoxedWriter>,
    write_timeout: Duration,
    /// Unix seconds of the last successful read or write
    last_active: AtomicI64,
    accepted: AtomicBool,
    closed: AtomicBool,
    close_token: CancellationToken,
}

impl PeerConnection {
    /// Wrap the write half of a stream
    ///
    /// `is_client` is true when this side dialled the connection.
    pub fn new<W>(addr: SocketAddr, is_client: bool, writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            addr,
            is_client,
            writer: Mutex::new(Box::new(writer)),
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            last_active: AtomicI64::new(chrono::Utc::now().timestamp()),
            accepted: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            close_token: CancellationToken::new(),
        }
    }

    /// Bound every write (and the final shutdown) by `timeout`
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn is_client(&self) -> bool {
        self.is_client
    }

    pub fn is_accepted(&self) -> bool {
        self.accepted.load(Ordering::Acquire)
    }

    pub(crate) fn mark_accepted(&self) {
        self.accepted.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Record activity now
    pub fn touch(&self) {
        self.last_active
            .store(chrono::Utc::now().timestamp(), Ordering::Relaxed);
    }

    pub fn last_active(&self) -> i64 {
        self.last_active.load(Ordering::Relaxed)
    }

    /// Seconds since the last activity, relative to `now`
    pub fn idle_secs(&self, now: i64) -> u64 {
        now.saturating_sub(self.last_active()).max(0) as u64
    }

    /// Write pre-packed bytes and flush
    ///
    /// Any error is fatal for the connection; callers disconnect on failure.
    /// A write that cannot finish within the write timeout fails with
    /// `WriteTimeout`, and one still pending when the connection closes
    /// fails with `NotConnected`.
    pub async fn send(&self, bytes: &[u8]) -> Result<(), NodeError> {
        if self.is_closed() {
            return Err(NodeError::NotConnected);
        }

        let write = async {
            let mut writer = self.writer.lock().await;
            writer.write_all(bytes).await?;
            writer.flush().await
        };

        tokio::select! {
            _ = self.close_token.cancelled() => return Err(NodeError::NotConnected),
            result = tokio::time::timeout(self.write_timeout, write) => match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => return Err(NodeError::WriteTimeout(self.addr)),
            },
        }

        self.touch();
        Ok(())
    }

    /// Close the connection; only the first call has an effect
    ///
    /// Pending sends are released before the writer is shut down.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.close_token.cancel();

        let shutdown = async {
            let mut writer = self.writer.lock().await;
            writer.shutdown().await
        };
        match tokio::time::timeout(self.write_timeout, shutdown).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => log::trace!("Shutdown of {} failed: {}", self.addr, e),
            Err(_) => log::debug!("Shutdown of {} timed out", self.addr),
        }
    }

    /// Cancelled once the connection is closed; wakes the read loop
    pub fn closed_token(&self) -> CancellationToken {
        self.close_token.clone()
    }
}

impl PartialEq for PeerConnection {
    fn eq(&self, other: &Self) -> bool {
        self.addr == other.addr
    }
}

impl Eq for PeerConnection {}

impl Hash for PeerConnection {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.addr.hash(state);
    }
}

impl fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerConnection")
            .field("addr", &self.addr)
            .field("is_client", &self.is_client)
            .field("accepted", &self.is_accepted())
            .field("closed", &self.is_closed())
            .finish()
    }
}
