//! TCP listener implementation with backpressure.
//!
//! # Responsibilities
//! - Bind to the configured address and address family
//! - Accept incoming TCP connections
//! - Enforce conn_limit via semaphore
//! - Publish `tcp_connections` and `tcp_connections_limit`

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;

use crate::config::{ListenerConfig, Network};
use crate::net::connection::{Connection, ConnectionTracker};
use crate::observability::Metrics;

/// Error type for listener operations.
#[derive(Debug, Error)]
pub enum ListenerError {
    /// Failed to bind to address.
    #[error("Failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: io::Error,
    },

    /// The address did not resolve to anything in the requested family.
    #[error("No {network} address found for {address}")]
    NoAddress { address: String, network: &'static str },

    /// Failed to accept connection.
    #[error("Failed to accept: {0}")]
    Accept(#[source] io::Error),
}

impl ListenerError {
    /// True for per-connection failures that leave the listener usable.
    pub fn is_transient(&self) -> bool {
        match self {
            ListenerError::Accept(e) => matches!(
                e.kind(),
                io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionRefused
                    | io::ErrorKind::Interrupted
                    | io::ErrorKind::WouldBlock
            ),
            _ => false,
        }
    }
}

/// A TCP listener that counts, and optionally limits, open connections.
///
/// With a limit, a semaphore permit is acquired before `accept`, so excess
/// clients wait in the kernel backlog until a slot becomes available.
pub struct Listener {
    /// The underlying TCP listener.
    inner: TcpListener,
    local_addr: SocketAddr,
    protocol: &'static str,
    /// Semaphore to limit concurrent connections.
    connection_limit: Option<Arc<Semaphore>>,
    tracker: ConnectionTracker,
}

impl Listener {
    /// Bind `protocol`'s listener as configured.
    pub async fn bind(protocol: &'static str, config: &ListenerConfig, metrics: &Metrics) -> Result<Self, ListenerError> {
        let address = config.bind_address();
        let candidates: Vec<SocketAddr> = tokio::net::lookup_host(&address)
            .await
            .map_err(|source| ListenerError::Bind {
                address: address.clone(),
                source,
            })?
            .filter(|addr| match config.network {
                Network::Tcp => true,
                Network::Tcp4 => addr.is_ipv4(),
                Network::Tcp6 => addr.is_ipv6(),
            })
            .collect();

        let mut last_error = None;
        let mut bound = None;
        for candidate in candidates {
            match TcpListener::bind(candidate).await {
                Ok(listener) => {
                    bound = Some(listener);
                    break;
                }
                Err(e) => last_error = Some(e),
            }
        }
        let listener = match (bound, last_error) {
            (Some(listener), _) => listener,
            (None, Some(source)) => return Err(ListenerError::Bind { address, source }),
            (None, None) => {
                return Err(ListenerError::NoAddress {
                    address,
                    network: config.network.as_str(),
                })
            }
        };

        let local_addr = listener.local_addr().map_err(|source| ListenerError::Bind {
            address: address.clone(),
            source,
        })?;

        metrics.set_tcp_connections_limit(protocol, config.conn_limit);
        let connection_limit = (config.conn_limit > 0).then(|| Arc::new(Semaphore::new(config.conn_limit)));

        tracing::info!(
            protocol,
            address = %local_addr,
            conn_limit = config.conn_limit,
            "Listener bound"
        );

        Ok(Self {
            inner: listener,
            local_addr,
            protocol,
            connection_limit,
            tracker: ConnectionTracker::new(metrics.tcp_connections(protocol)),
        })
    }

    /// Accept a new connection, respecting the connection limit.
    ///
    /// This will wait if the connection limit has been reached.
    pub async fn accept(&self) -> Result<Connection, ListenerError> {
        // Acquire permit first (backpressure)
        let permit = match &self.connection_limit {
            Some(limit) => {
                if limit.available_permits() == 0 {
                    tracing::debug!(protocol = self.protocol, "Connection limit reached, waiting for a slot");
                }
                Some(
                    Arc::clone(limit)
                        .acquire_owned()
                        .await
                        .map_err(|e| ListenerError::Accept(io::Error::other(e)))?,
                )
            }
            None => None,
        };

        // Then accept the connection
        let (stream, addr) = self.inner.accept().await.map_err(ListenerError::Accept)?;
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(peer_addr = %addr, error = %e, "Failed to set TCP_NODELAY");
        }

        let guard = self.tracker.track(permit);
        tracing::debug!(
            protocol = self.protocol,
            peer_addr = %addr,
            connection_id = %guard.id(),
            open_connections = self.tracker.active_count(),
            "Connection accepted"
        );

        Ok(Connection::new(stream, addr, self.local_addr, guard))
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn protocol(&self) -> &'static str {
        self.protocol
    }

    #[cfg(test)]
    fn active_connections(&self) -> u64 {
        self.tracker.active_count()
    }

    #[cfg(test)]
    fn available_permits(&self) -> Option<usize> {
        self.connection_limit.as_ref().map(|s| s.available_permits())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn local(conn_limit: usize) -> ListenerConfig {
        ListenerConfig {
            address: "127.0.0.1".into(),
            conn_limit,
            ..ListenerConfig::with_port(0)
        }
    }

    #[tokio::test]
    async fn limit_blocks_accept_until_a_slot_frees() {
        let listener = Listener::bind("http", &local(1), &Metrics::default()).await.unwrap();
        let addr = listener.local_addr();

        let _c1 = tokio::net::TcpStream::connect(addr).await.unwrap();
        let first = listener.accept().await.unwrap();
        assert_eq!(listener.active_connections(), 1);
        assert_eq!(listener.available_permits(), Some(0));

        let _c2 = tokio::net::TcpStream::connect(addr).await.unwrap();
        let blocked = tokio::time::timeout(Duration::from_millis(100), listener.accept()).await;
        assert!(blocked.is_err());

        drop(first);
        let second = tokio::time::timeout(Duration::from_secs(1), listener.accept()).await;
        assert!(second.unwrap().is_ok());
    }

    #[tokio::test]
    async fn family_filter_rejects_mismatched_addresses() {
        let mut config = local(0);
        config.network = Network::Tcp6;
        let err = Listener::bind("grpc", &config, &Metrics::default()).await.err().unwrap();
        assert!(matches!(err, ListenerError::NoAddress { network: "tcp6", .. }));
    }

    #[tokio::test]
    async fn port_in_use_is_a_bind_error() {
        let first = Listener::bind("http", &local(0), &Metrics::default()).await.unwrap();
        let mut config = local(0);
        config.port = first.local_addr().port();
        let err = Listener::bind("http", &config, &Metrics::default()).await.err().unwrap();
        assert!(matches!(err, ListenerError::Bind { .. }));
    }
}
