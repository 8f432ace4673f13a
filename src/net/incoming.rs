//! Accept loops feeding connections to the protocol servers.
//!
//! # Responsibilities
//! - Pull connections off a [`Listener`] until told to stop
//! - Run TLS handshakes off the accept path
//! - Hand ready connections to a server over a channel
//!
//! # Design Decisions
//! - Per-connection errors (reset, aborted) are logged and skipped; anything
//!   else ends the loop and is reported to the lifecycle controller
//! - Several feeders can share one channel, which is how the multiplexer and a
//!   dedicated gRPC listener reach the same gRPC server

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::net::connection::Connection;
use crate::net::listener::{Listener, ListenerError};
use crate::net::tls::TlsAcceptor;

/// Connections waiting to be picked up by a server.
pub const INCOMING_BUFFER: usize = 128;

/// Sender side of a server's connection channel.
pub type ConnectionSender = mpsc::Sender<Connection>;

/// Receiver side of a server's connection channel.
pub type ConnectionReceiver = mpsc::Receiver<Connection>;

pub fn channel() -> (ConnectionSender, ConnectionReceiver) {
    mpsc::channel(INCOMING_BUFFER)
}

/// Accept from `listener` until `stop` fires or the receiving server is gone.
pub async fn feed(
    listener: Listener,
    tls: Option<TlsAcceptor>,
    tx: ConnectionSender,
    stop: CancellationToken,
) -> Result<(), ListenerError> {
    loop {
        let accepted = tokio::select! {
            _ = stop.cancelled() => return Ok(()),
            accepted = listener.accept() => accepted,
        };

        let conn = match accepted {
            Ok(conn) => conn,
            Err(e) if e.is_transient() => {
                tracing::debug!(protocol = listener.protocol(), error = %e, "Dropping failed connection");
                continue;
            }
            Err(e) => {
                tracing::error!(protocol = listener.protocol(), error = %e, "Accept loop failed");
                return Err(e);
            }
        };

        match &tls {
            Some(acceptor) => {
                let acceptor = acceptor.clone();
                let tx = tx.clone();
                tokio::spawn(async move {
                    let remote = conn.remote_addr();
                    match acceptor.accept(conn).await {
                        Ok(conn) => {
                            let _ = tx.send(conn).await;
                        }
                        Err(e) => {
                            tracing::debug!(peer_addr = %remote, error = %e, "TLS handshake failed");
                        }
                    }
                });
            }
            None => {
                if tx.send(conn).await.is_err() {
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ListenerConfig;
    use crate::observability::Metrics;

    #[tokio::test]
    async fn feeds_connections_until_stopped() {
        let config = ListenerConfig {
            address: "127.0.0.1".into(),
            ..ListenerConfig::with_port(0)
        };
        let listener = Listener::bind("grpc", &config, &Metrics::default()).await.unwrap();
        let addr = listener.local_addr();
        let (tx, mut rx) = channel();
        let stop = CancellationToken::new();
        let task = tokio::spawn(feed(listener, None, tx, stop.clone()));

        let _client = tokio::net::TcpStream::connect(addr).await.unwrap();
        let conn = rx.recv().await.unwrap();
        assert_eq!(conn.info().local_addr, addr);

        stop.cancel();
        assert!(task.await.unwrap().is_ok());
        assert!(rx.recv().await.is_none());
    }
}
