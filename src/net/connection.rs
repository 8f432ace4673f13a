//! Accepted connections and their lifetime tracking.
//!
//! # Responsibilities
//! - Generate unique connection IDs for tracing
//! - Carry the byte stream plus addressing info to whichever server serves it
//! - Keep the open-connection gauge and the limit permit alive exactly as
//!   long as the connection
//!
//! # Design Decisions
//! - The stream is boxed so plain TCP, TLS and replayed streams share one type
//! - Bookkeeping lives in a guard that decrements on drop, so a panicking
//!   handler still releases its slot

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use metrics::Gauge;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::OwnedSemaphorePermit;

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

/// Any bidirectional byte stream a connection can carry.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// Addressing details of a connection, available to handlers as a request
/// extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub remote_addr: SocketAddr,
    pub local_addr: SocketAddr,
    pub tls: bool,
}

/// Counts open connections for one listener and mirrors the count into a
/// gauge.
#[derive(Clone)]
pub struct ConnectionTracker {
    active_count: Arc<AtomicU64>,
    gauge: Gauge,
}

impl ConnectionTracker {
    pub fn new(gauge: Gauge) -> Self {
        Self {
            active_count: Arc::new(AtomicU64::new(0)),
            gauge,
        }
    }

    /// Record a new open connection. Returns a guard that decrements on drop.
    pub fn track(&self, permit: Option<OwnedSemaphorePermit>) -> ConnectionGuard {
        self.active_count.fetch_add(1, Ordering::SeqCst);
        self.gauge.increment(1.0);
        ConnectionGuard {
            active_count: Arc::clone(&self.active_count),
            gauge: self.gauge.clone(),
            id: ConnectionId::new(),
            _permit: permit,
        }
    }

    /// Get current open connection count.
    pub fn active_count(&self) -> u64 {
        self.active_count.load(Ordering::SeqCst)
    }
}

/// Guard that tracks a connection's lifetime.
/// Decrements the count and releases the limit slot when dropped.
pub struct ConnectionGuard {
    active_count: Arc<AtomicU64>,
    gauge: Gauge,
    id: ConnectionId,
    _permit: Option<OwnedSemaphorePermit>,
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
        self.gauge.decrement(1.0);
        tracing::trace!(connection_id = %self.id, "Connection closed");
    }
}

/// Everything about a connection except its stream.
pub struct ConnectionHandle {
    info: ConnectionInfo,
    guard: ConnectionGuard,
}

/// An accepted connection.
pub struct Connection {
    stream: Box<dyn AsyncStream>,
    handle: ConnectionHandle,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").field("info", &self.handle.info).finish()
    }
}

impl Connection {
    pub fn new(
        stream: impl AsyncStream,
        remote_addr: SocketAddr,
        local_addr: SocketAddr,
        guard: ConnectionGuard,
    ) -> Self {
        let info = ConnectionInfo {
            id: guard.id(),
            remote_addr,
            local_addr,
            tls: false,
        };
        Self {
            stream: Box::new(stream),
            handle: ConnectionHandle { info, guard },
        }
    }

    pub fn info(&self) -> &ConnectionInfo {
        &self.handle.info
    }

    pub fn id(&self) -> ConnectionId {
        self.handle.info.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.handle.info.remote_addr
    }

    /// Detach the stream, e.g. to wrap it in TLS or a replay buffer.
    pub fn into_parts(self) -> (Box<dyn AsyncStream>, ConnectionHandle) {
        (self.stream, self.handle)
    }

    pub fn from_parts(stream: impl AsyncStream, handle: ConnectionHandle) -> Self {
        Self {
            stream: Box::new(stream),
            handle,
        }
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle").field("info", &self.info).finish()
    }
}

impl ConnectionHandle {
    pub fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    pub(crate) fn mark_tls(&mut self) {
        self.info.tls = true;
    }

    pub fn id(&self) -> ConnectionId {
        self.guard.id()
    }
}

impl AsyncRead for Connection {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for Connection {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.stream.is_write_vectored()
    }
}
