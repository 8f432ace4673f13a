//! Serving HTTP and gRPC from one listener.
//!
//! # Responsibilities
//! - Own the shared listener and accept from it
//! - Classify each connection by its first bytes
//! - Replay those bytes to whichever server takes the connection
//!
//! # Design Decisions
//! - Classification runs in a task per connection with a deadline, so a slow
//!   or silent client never stalls the accept loop
//! - HTTP/1 is recognised by a method token and a space, gRPC by the HTTP/2
//!   client preface; anything else is dropped

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::{Buf, Bytes};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio_util::sync::CancellationToken;

use crate::net::connection::{AsyncStream, Connection};
use crate::net::incoming::ConnectionSender;
use crate::net::listener::{Listener, ListenerError};

/// HTTP/2 connection preface every gRPC client sends first.
pub const HTTP2_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

const HTTP1_METHODS: &[&[u8]] = &[
    b"GET ",
    b"POST ",
    b"PUT ",
    b"DELETE ",
    b"HEAD ",
    b"OPTIONS ",
    b"PATCH ",
    b"CONNECT ",
    b"TRACE ",
];

/// Protocol a connection was classified as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Http,
    Grpc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Detection {
    Matched(Protocol),
    NeedMore,
    Unknown,
}

fn detect(prefix: &[u8]) -> Detection {
    if prefix.len() >= HTTP2_PREFACE.len() {
        if prefix.starts_with(HTTP2_PREFACE) {
            return Detection::Matched(Protocol::Grpc);
        }
    } else if HTTP2_PREFACE.starts_with(prefix) {
        return Detection::NeedMore;
    }

    let mut partial = false;
    for method in HTTP1_METHODS {
        if prefix.starts_with(method) {
            return Detection::Matched(Protocol::Http);
        }
        if method.starts_with(prefix) {
            partial = true;
        }
    }
    if partial {
        Detection::NeedMore
    } else {
        Detection::Unknown
    }
}

/// Read just enough of `conn` to classify it. Returns the bytes consumed.
async fn classify<S: AsyncRead + Unpin>(stream: &mut S) -> io::Result<Option<(Protocol, Bytes)>> {
    let mut buf = [0u8; 24];
    let mut filled = 0;
    loop {
        let n = stream.read(&mut buf[filled..]).await?;
        if n == 0 {
            return Ok(None);
        }
        filled += n;
        match detect(&buf[..filled]) {
            Detection::Matched(protocol) => return Ok(Some((protocol, Bytes::copy_from_slice(&buf[..filled])))),
            Detection::Unknown => return Ok(None),
            Detection::NeedMore if filled == buf.len() => return Ok(None),
            Detection::NeedMore => {}
        }
    }
}

/// A stream that yields `prefix` before reading from the inner stream.
pub struct Rewind<S> {
    prefix: Bytes,
    inner: S,
}

impl<S> Rewind<S> {
    pub fn new(prefix: Bytes, inner: S) -> Self {
        Self { prefix, inner }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Rewind<S> {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        if !self.prefix.is_empty() {
            let n = self.prefix.len().min(buf.remaining());
            buf.put_slice(&self.prefix[..n]);
            self.prefix.advance(n);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Rewind<S> {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Splits one listener's connections between the HTTP and gRPC servers.
pub struct Multiplexer {
    listener: Listener,
    http: ConnectionSender,
    grpc: ConnectionSender,
    classify_timeout: Duration,
}

impl Multiplexer {
    pub fn new(listener: Listener, http: ConnectionSender, grpc: ConnectionSender, classify_timeout: Duration) -> Self {
        Self {
            listener,
            http,
            grpc,
            classify_timeout,
        }
    }

    /// Accept and classify until `stop` fires.
    pub async fn run(self, stop: CancellationToken) -> Result<(), ListenerError> {
        tracing::info!(address = %self.listener.local_addr(), "Multiplexing HTTP and gRPC");
        loop {
            let accepted = tokio::select! {
                _ = stop.cancelled() => return Ok(()),
                accepted = self.listener.accept() => accepted,
            };
            let conn = match accepted {
                Ok(conn) => conn,
                Err(e) if e.is_transient() => {
                    tracing::debug!(error = %e, "Dropping failed connection");
                    continue;
                }
                Err(e) => {
                    tracing::error!(error = %e, "Multiplexer accept loop failed");
                    return Err(e);
                }
            };

            let http = self.http.clone();
            let grpc = self.grpc.clone();
            let classify_timeout = self.classify_timeout;
            tokio::spawn(async move {
                route(conn, http, grpc, classify_timeout).await;
            });
        }
    }
}

async fn route(conn: Connection, http: ConnectionSender, grpc: ConnectionSender, classify_timeout: Duration) {
    let remote = conn.remote_addr();
    let (mut stream, handle) = conn.into_parts();

    let classified = match tokio::time::timeout(classify_timeout, classify(&mut stream)).await {
        Ok(Ok(Some(classified))) => classified,
        Ok(Ok(None)) => {
            tracing::debug!(peer_addr = %remote, "Dropping unrecognised connection");
            return;
        }
        Ok(Err(e)) => {
            tracing::debug!(peer_addr = %remote, error = %e, "Dropping connection, read failed");
            return;
        }
        Err(_) => {
            tracing::debug!(peer_addr = %remote, "Dropping connection, classification timed out");
            return;
        }
    };

    let (protocol, prefix) = classified;
    let replay: Rewind<Box<dyn AsyncStream>> = Rewind::new(prefix, stream);
    let conn = Connection::from_parts(replay, handle);
    let target = match protocol {
        Protocol::Http => http,
        Protocol::Grpc => grpc,
    };
    tracing::trace!(peer_addr = %remote, ?protocol, "Connection classified");
    if target.send(conn).await.is_err() {
        tracing::debug!(peer_addr = %remote, ?protocol, "Server gone, dropping connection");
    }
}
