//! Serving accepted connections with hyper.
//!
//! # Responsibilities
//! - Take connections off a server's channel and serve each on its own task
//! - Hand every request to the protocol's handler with the connection
//!   details attached
//! - Close connections that sit idle or outlive their maximum age
//! - Ask open connections to finish when the server drains
//!
//! # Design Decisions
//! - The HTTP and gRPC servers share this loop and differ only in the
//!   handler and hyper builder they pass in
//! - A connection is idle only while no request is in flight, and a request
//!   stays in flight until its response body is done
//! - Draining only stops new connections and asks open ones to finish; the
//!   caller owns the deadline

use std::convert::Infallible;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::body::Body;
use axum::extract::ConnectInfo;
use bytes::Bytes;
use futures_util::future::BoxFuture;
use http_body::{Frame, SizeHint};
use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use parking_lot::Mutex;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::net::connection::{Connection, ConnectionInfo};
use crate::net::incoming::ConnectionReceiver;
use crate::server::ServerError;

/// Turns a request into a response. Failures are already encoded in the
/// response the way the protocol expects.
pub type Handler = Arc<dyn Fn(http::Request<Body>) -> BoxFuture<'static, http::Response<Body>> + Send + Sync>;

/// Lifetime limits applied to every connection of a server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionPolicy {
    /// Close after this long without a request in flight.
    pub idle_timeout: Option<Duration>,
    /// Ask the connection to go away once it is this old.
    pub max_age: Option<Duration>,
    /// After `max_age`, close outright once this much more time has passed.
    pub max_age_grace: Option<Duration>,
}

/// Serves one protocol on every connection it receives.
pub struct ConnectionServer {
    protocol: &'static str,
    builder: auto::Builder<TokioExecutor>,
    handler: Handler,
    policy: ConnectionPolicy,
    incoming: ConnectionReceiver,
}

impl ConnectionServer {
    pub fn new(
        protocol: &'static str,
        builder: auto::Builder<TokioExecutor>,
        handler: Handler,
        policy: ConnectionPolicy,
        incoming: ConnectionReceiver,
    ) -> Self {
        Self {
            protocol,
            builder,
            handler,
            policy,
            incoming,
        }
    }

    /// Serve until `drain` fires, then let open connections finish.
    ///
    /// Always ends with [`ServerError::Closed`]; the caller bounds how long
    /// the drain may take by dropping this future.
    pub async fn serve(mut self, drain: CancellationToken) -> Result<(), ServerError> {
        let mut connections = JoinSet::new();
        let mut accepting = true;

        loop {
            tokio::select! {
                _ = drain.cancelled() => break,
                conn = self.incoming.recv(), if accepting => match conn {
                    Some(conn) => {
                        connections.spawn(serve_connection(
                            self.protocol,
                            self.builder.clone(),
                            Arc::clone(&self.handler),
                            self.policy,
                            conn,
                            drain.clone(),
                        ));
                    }
                    None => accepting = false,
                },
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }

        self.incoming.close();
        tracing::debug!(
            protocol = self.protocol,
            open_connections = connections.len(),
            "Draining connections"
        );
        while connections.join_next().await.is_some() {}
        Err(ServerError::Closed)
    }
}

async fn serve_connection(
    protocol: &'static str,
    builder: auto::Builder<TokioExecutor>,
    handler: Handler,
    policy: ConnectionPolicy,
    conn: Connection,
    drain: CancellationToken,
) {
    let info = conn.info().clone();
    let conn_id = info.id.as_u64();
    let remote_addr: SocketAddr = info.remote_addr;
    tracing::trace!(protocol, conn_id, peer_addr = %remote_addr, tls = info.tls, "Connection open");

    let activity = Arc::new(Activity::new());
    let service = {
        let info = info.clone();
        let activity = Arc::clone(&activity);
        hyper::service::service_fn(move |req: http::Request<Incoming>| {
            let active = Activity::begin(&activity);
            let mut req = req.map(Body::new);
            req.extensions_mut().insert(ConnectInfo(remote_addr));
            req.extensions_mut().insert(info.clone());
            let response = handler(req);
            async move {
                let resp = response.await;
                Ok::<_, Infallible>(resp.map(|inner| Body::new(ActiveBody { inner, _active: active })))
            }
        })
    };

    let served = builder.serve_connection_with_upgrades(TokioIo::new(conn), service);
    tokio::pin!(served);

    let age_deadline = policy.max_age.map(|age| Instant::now() + age);
    let mut force_close_at = None;
    let mut closing = false;
    let mut idle_check = tokio::time::interval(idle_check_period(policy.idle_timeout));
    idle_check.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let result = loop {
        tokio::select! {
            result = served.as_mut() => break result,
            _ = drain.cancelled(), if !closing => {
                served.as_mut().graceful_shutdown();
                closing = true;
            }
            _ = sleep_until(age_deadline), if !closing && age_deadline.is_some() => {
                tracing::debug!(protocol, conn_id, peer_addr = %remote_addr, "Connection reached its maximum age");
                served.as_mut().graceful_shutdown();
                closing = true;
                force_close_at = policy.max_age_grace.map(|grace| Instant::now() + grace);
            }
            _ = sleep_until(force_close_at), if force_close_at.is_some() => {
                tracing::debug!(protocol, conn_id, peer_addr = %remote_addr, "Closing connection after its grace period");
                return;
            }
            _ = idle_check.tick(), if !closing && policy.idle_timeout.is_some() => {
                if policy.idle_timeout.is_some_and(|limit| activity.idle_for() >= limit) {
                    tracing::debug!(protocol, conn_id, peer_addr = %remote_addr, "Closing idle connection");
                    served.as_mut().graceful_shutdown();
                    closing = true;
                }
            }
        }
    };

    if let Err(e) = result {
        tracing::debug!(protocol, conn_id, peer_addr = %remote_addr, error = %e, "Connection ended with error");
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn idle_check_period(idle_timeout: Option<Duration>) -> Duration {
    idle_timeout.map_or(Duration::from_secs(3600), |limit| {
        (limit / 4).max(Duration::from_millis(10))
    })
}

/// Requests in flight on one connection and when the last one finished.
#[derive(Debug)]
struct Activity {
    in_flight: AtomicUsize,
    last_active: Mutex<Instant>,
}

impl Activity {
    fn new() -> Self {
        Self {
            in_flight: AtomicUsize::new(0),
            last_active: Mutex::new(Instant::now()),
        }
    }

    fn begin(this: &Arc<Self>) -> ActiveRequest {
        this.in_flight.fetch_add(1, Ordering::SeqCst);
        ActiveRequest(Arc::clone(this))
    }

    fn idle_for(&self) -> Duration {
        if self.in_flight.load(Ordering::SeqCst) > 0 {
            return Duration::ZERO;
        }
        self.last_active.lock().elapsed()
    }
}

struct ActiveRequest(Arc<Activity>);

impl Drop for ActiveRequest {
    fn drop(&mut self) {
        *self.0.last_active.lock() = Instant::now();
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Response body that keeps its request in flight until dropped.
struct ActiveBody {
    inner: Body,
    _active: ActiveRequest,
}

impl http_body::Body for ActiveBody {
    type Data = Bytes;
    type Error = axum::Error;

    fn poll_frame(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Result<Frame<Bytes>, axum::Error>>> {
        Pin::new(&mut self.inner).poll_frame(cx)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ListenerConfig;
    use crate::net::incoming;
    use crate::net::Listener;
    use crate::observability::Metrics;
    use futures_util::FutureExt;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    struct Running {
        addr: SocketAddr,
        stop: CancellationToken,
        drain: CancellationToken,
        server: tokio::task::JoinHandle<Result<(), ServerError>>,
    }

    impl Running {
        async fn shutdown(self) {
            self.stop.cancel();
            self.drain.cancel();
            assert!(matches!(self.server.await.unwrap(), Err(ServerError::Closed)));
        }
    }

    async fn run(policy: ConnectionPolicy, delay: Duration) -> Running {
        let config = ListenerConfig {
            address: "127.0.0.1".into(),
            ..ListenerConfig::with_port(0)
        };
        let listener = Listener::bind("http", &config, &Metrics::default()).await.unwrap();
        let addr = listener.local_addr();
        let (tx, rx) = incoming::channel();
        let stop = CancellationToken::new();
        tokio::spawn(incoming::feed(listener, None, tx, stop.clone()));

        let handler: Handler = Arc::new(move |_req| {
            async move {
                tokio::time::sleep(delay).await;
                http::Response::new(Body::from("ok"))
            }
            .boxed()
        });
        let server = ConnectionServer::new("http", auto::Builder::new(TokioExecutor::new()), handler, policy, rx);
        let drain = CancellationToken::new();
        let server = tokio::spawn(server.serve(drain.clone()));
        Running {
            addr,
            stop,
            drain,
            server,
        }
    }

    const REQUEST: &[u8] = b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n";

    /// Everything the server sends until it closes, or `None` if it is
    /// still open after `limit`.
    async fn read_until_closed(stream: &mut TcpStream, limit: Duration) -> Option<Vec<u8>> {
        let mut received = Vec::new();
        match tokio::time::timeout(limit, stream.read_to_end(&mut received)).await {
            Ok(_) => Some(received),
            Err(_) => None,
        }
    }

    #[tokio::test]
    async fn idle_connections_are_closed() {
        let policy = ConnectionPolicy {
            idle_timeout: Some(Duration::from_millis(200)),
            ..ConnectionPolicy::default()
        };
        let running = run(policy, Duration::ZERO).await;

        let mut stream = TcpStream::connect(running.addr).await.unwrap();
        stream.write_all(REQUEST).await.unwrap();
        let received = read_until_closed(&mut stream, Duration::from_secs(3)).await.unwrap();
        assert!(received.starts_with(b"HTTP/1.1 200"));

        running.shutdown().await;
    }

    #[tokio::test]
    async fn busy_connections_are_not_idle() {
        let policy = ConnectionPolicy {
            idle_timeout: Some(Duration::from_millis(100)),
            ..ConnectionPolicy::default()
        };
        let running = run(policy, Duration::from_millis(500)).await;

        let resp = reqwest::Client::builder()
            .no_proxy()
            .build()
            .unwrap()
            .get(format!("http://{}/", running.addr))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(resp.text().await.unwrap(), "ok");

        running.shutdown().await;
    }

    #[tokio::test]
    async fn old_connections_are_closed_after_grace() {
        let policy = ConnectionPolicy {
            max_age: Some(Duration::from_millis(100)),
            max_age_grace: Some(Duration::from_millis(100)),
            ..ConnectionPolicy::default()
        };
        let running = run(policy, Duration::from_secs(30)).await;

        let mut stream = TcpStream::connect(running.addr).await.unwrap();
        stream.write_all(REQUEST).await.unwrap();
        let received = read_until_closed(&mut stream, Duration::from_secs(3)).await;
        assert_eq!(received, Some(Vec::new()));

        running.shutdown().await;
    }

    #[tokio::test]
    async fn drain_lets_requests_finish() {
        let running = run(ConnectionPolicy::default(), Duration::from_millis(200)).await;

        let mut stream = TcpStream::connect(running.addr).await.unwrap();
        stream.write_all(REQUEST).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        running.drain.cancel();

        let received = read_until_closed(&mut stream, Duration::from_secs(3)).await.unwrap();
        assert!(received.starts_with(b"HTTP/1.1 200"));
        running.shutdown().await;
    }

    #[test]
    fn activity_tracks_requests_in_flight() {
        let activity = Arc::new(Activity::new());
        let active = Activity::begin(&activity);
        assert_eq!(activity.idle_for(), Duration::ZERO);
        drop(active);
        assert_eq!(activity.in_flight.load(Ordering::SeqCst), 0);
    }
}
