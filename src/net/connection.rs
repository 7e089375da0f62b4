//! Connection identity, lifecycle observation and tracking.
//!
//! # Responsibilities
//! - Generate unique connection IDs for tracing
//! - Describe a connection (or one HTTP/2 stream on it) to observers
//! - Define the lifecycle observer notified of state transitions
//! - Track live connections and signal draining on shutdown

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::http::error::HttpError;
use crate::pipeline::NegotiatedProtocol;

/// Global atomic counter for connection IDs.
/// Using relaxed ordering is sufficient since we only need uniqueness, not synchronization.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generate a new unique connection ID.
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// What observers and request objects know about the underlying transport.
///
/// HTTP/2 streams get a copy carrying their stream id; everything else is
/// shared with the parent connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    id: ConnectionId,
    remote_addr: SocketAddr,
    local_addr: SocketAddr,
    secure: bool,
    stream_id: Option<u32>,
}

impl ConnectionInfo {
    pub fn new(id: ConnectionId, remote_addr: SocketAddr, local_addr: SocketAddr, secure: bool) -> Self {
        Self {
            id,
            remote_addr,
            local_addr,
            secure,
            stream_id: None,
        }
    }

    /// Same connection, scoped to one multiplexed stream.
    pub fn for_stream(&self, stream_id: u32) -> Self {
        Self {
            stream_id: Some(stream_id),
            ..self.clone()
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Whether the connection carries a TLS session.
    pub fn is_secure(&self) -> bool {
        self.secure
    }

    /// HTTP/2 stream id, `None` for the connection itself and for HTTP/1.1.
    pub fn stream_id(&self) -> Option<u32> {
        self.stream_id
    }
}

/// Lifecycle states reported to a [`ConnectionObserver`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// The transport is accepted (and the TLS handshake, if any, completed).
    Established,
    /// The protocol for the connection has been decided.
    Configured(NegotiatedProtocol),
    /// A request (or HTTP/2 stream) reached the reactive bridge.
    RequestReceived,
    /// A response was fully written.
    ResponseCompleted,
    /// The connection is closed. Reported once per connection.
    Closed,
}

/// Receives lifecycle notifications for connections and their requests.
///
/// One observer serves a physical connection and every HTTP/2 stream
/// multiplexed on it. Calls arrive from the connection's task.
pub trait ConnectionObserver: Send + Sync + 'static {
    fn on_state_change(&self, connection: &ConnectionInfo, state: ConnectionState);

    fn on_error(&self, connection: &ConnectionInfo, error: &HttpError);
}

impl<T: ConnectionObserver + ?Sized> ConnectionObserver for Arc<T> {
    fn on_state_change(&self, connection: &ConnectionInfo, state: ConnectionState) {
        (**self).on_state_change(connection, state)
    }

    fn on_error(&self, connection: &ConnectionInfo, error: &HttpError) {
        (**self).on_error(connection, error)
    }
}

/// Observer that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl ConnectionObserver for NoopObserver {
    fn on_state_change(&self, _connection: &ConnectionInfo, _state: ConnectionState) {}

    fn on_error(&self, _connection: &ConnectionInfo, _error: &HttpError) {}
}

/// Tracks active connections for graceful shutdown.
///
/// Uses a watch channel to tell connections to stop taking new requests.
#[derive(Debug, Clone)]
pub struct ConnectionTracker {
    /// Current count of active connections.
    active_count: Arc<AtomicU64>,
    /// Flipped to `true` once draining starts.
    drain_tx: Arc<watch::Sender<bool>>,
    drain_rx: watch::Receiver<bool>,
}

impl ConnectionTracker {
    /// Create a new connection tracker.
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            active_count: Arc::new(AtomicU64::new(0)),
            drain_tx: Arc::new(tx),
            drain_rx: rx,
        }
    }

    /// Record a new active connection. Returns a guard that decrements on drop.
    pub fn track(&self) -> ConnectionGuard {
        self.active_count.fetch_add(1, Ordering::SeqCst);
        metrics::gauge!("http_active_connections").increment(1.0);
        ConnectionGuard {
            active_count: Arc::clone(&self.active_count),
            id: ConnectionId::new(),
        }
    }

    /// Get current active connection count.
    pub fn active_count(&self) -> u64 {
        self.active_count.load(Ordering::SeqCst)
    }

    /// Ask every tracked connection to finish in-flight work and close.
    pub fn begin_draining(&self) {
        let _ = self.drain_tx.send(true);
    }

    /// Wait until all connections are closed or the timeout elapses.
    ///
    /// Returns `false` if connections were still open at the deadline.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.active_count.load(Ordering::SeqCst) > 0 {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        true
    }

    /// Clone the drain receiver for use in connection tasks.
    pub fn drain_receiver(&self) -> watch::Receiver<bool> {
        self.drain_rx.clone()
    }
}

impl Default for ConnectionTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Guard that tracks a connection's lifetime.
/// Decrements active count when dropped.
#[derive(Debug)]
pub struct ConnectionGuard {
    active_count: Arc<AtomicU64>,
    id: ConnectionId,
}

impl ConnectionGuard {
    /// Get this connection's ID.
    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.active_count.fetch_sub(1, Ordering::SeqCst);
        metrics::gauge!("http_active_connections").decrement(1.0);
        tracing::trace!(connection_id = %self.id, "Connection released");
    }
}
