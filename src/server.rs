//! Server lifecycle controller.
//!
//! # Responsibilities
//! - Own the listeners and sub-servers produced by [`ServerBuilder`]
//! - Start every serving routine and report the first one to finish
//! - Shut down in order: HTTP under a deadline, then gRPC without one
//!
//! # Design Decisions
//! - `run` and `shutdown` take `&self`, so a server shared through an `Arc`
//!   can be shut down while another task is blocked in `run`
//! - Completions go through a single-slot channel; the first one wins and
//!   later ones are discarded without blocking
//! - Resources move out of the server as it starts and stops, so each is
//!   released exactly once
//!
//! [`ServerBuilder`]: crate::lifecycle::ServerBuilder

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::loader::join;
use crate::config::ValidationError;
use crate::grpc::GrpcServer;
use crate::http::middleware::SourceIpsError;
use crate::http::HttpServer;
use crate::lifecycle::{Shutdown, SignalHandler};
use crate::net::incoming::{self, ConnectionSender};
use crate::net::mux::Multiplexer;
use crate::net::tls::TlsAcceptor;
use crate::net::{Listener, ListenerError};

/// Errors building or running a [`Server`].
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("at least one of HTTP and gRPC must be enabled")]
    NoProtocolEnabled,

    #[error("routing HTTP to gRPC requires both HTTP and gRPC to be enabled")]
    MuxRequiresBoth,

    #[error("invalid configuration: {}", join(.0))]
    InvalidConfig(Vec<ValidationError>),

    #[error("failed to load {protocol} TLS material: {source}")]
    Tls {
        protocol: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("{0}")]
    Bind(#[source] ListenerError),

    #[error("{0}")]
    Accept(#[source] ListenerError),

    #[error("invalid request logging settings: {0}")]
    RequestLog(#[from] SourceIpsError),

    #[error("server already started")]
    AlreadyStarted,

    /// A sub-server stopped because it was asked to.
    #[error("server closed")]
    Closed,
}

/// An accept loop waiting to be started.
pub(crate) struct Feeder {
    pub(crate) listener: Listener,
    pub(crate) tls: Option<TlsAcceptor>,
    pub(crate) tx: ConnectionSender,
}

impl Feeder {
    async fn run(self, stop: CancellationToken) -> Result<(), ServerError> {
        incoming::feed(self.listener, self.tls, self.tx, stop)
            .await
            .map_err(ServerError::Accept)
    }
}

/// Everything `run` starts.
pub(crate) struct Prepared {
    pub(crate) http_feeder: Option<Feeder>,
    pub(crate) grpc_feeder: Option<Feeder>,
    pub(crate) mux: Option<Multiplexer>,
    pub(crate) http_server: Option<HttpServer>,
    pub(crate) grpc_server: Option<GrpcServer>,
}

struct Running {
    http: Option<JoinHandle<()>>,
    grpc: Option<JoinHandle<()>>,
    background: Vec<JoinHandle<()>>,
}

enum State {
    Ready(Box<Prepared>),
    Running(Running),
    Stopped,
}

/// A dual-protocol server. Build one with
/// [`ServerBuilder`](crate::lifecycle::ServerBuilder).
pub struct Server {
    http_addr: Option<SocketAddr>,
    grpc_addr: Option<SocketAddr>,
    graceful_shutdown_timeout: Duration,
    signals: Arc<dyn SignalHandler>,
    shutdown: Shutdown,
    state: Mutex<State>,
}

impl Server {
    pub(crate) fn new(
        prepared: Prepared,
        http_addr: Option<SocketAddr>,
        grpc_addr: Option<SocketAddr>,
        graceful_shutdown_timeout: Duration,
        signals: Arc<dyn SignalHandler>,
    ) -> Self {
        Self {
            http_addr,
            grpc_addr,
            graceful_shutdown_timeout,
            signals,
            shutdown: Shutdown::new(),
            state: Mutex::new(State::Ready(Box::new(prepared))),
        }
    }

    /// Address the HTTP listener is bound to, if HTTP is enabled.
    pub fn http_listen_addr(&self) -> Option<SocketAddr> {
        self.http_addr
    }

    /// Address the gRPC listener is bound to, if gRPC is enabled.
    pub fn grpc_listen_addr(&self) -> Option<SocketAddr> {
        self.grpc_addr
    }

    /// Start serving and block until a stop signal, [`Server::stop`] or a
    /// fatal serving error.
    ///
    /// Sub-servers keep serving after this returns; call
    /// [`Server::shutdown`] to drain them.
    pub async fn run(&self) -> Result<(), ServerError> {
        let (done_tx, mut done_rx) = mpsc::channel(1);

        {
            let mut state = self.state.lock();
            let prepared = match std::mem::replace(&mut *state, State::Stopped) {
                State::Ready(prepared) => prepared,
                other => {
                    *state = other;
                    return Err(ServerError::AlreadyStarted);
                }
            };
            *state = State::Running(self.start(*prepared, &done_tx));
        }
        drop(done_tx);

        match done_rx.recv().await {
            Some(Err(ServerError::Closed)) | Some(Ok(())) | None => Ok(()),
            Some(Err(e)) => Err(e),
        }
    }

    fn start(&self, prepared: Prepared, done: &mpsc::Sender<Result<(), ServerError>>) -> Running {
        let mut background = Vec::new();

        let signals = Arc::clone(&self.signals);
        background.push(spawn_reporting(done.clone(), async move {
            signals.wait().await;
            tracing::info!("Stop requested");
            Ok(())
        }));

        if let Some(feeder) = prepared.http_feeder {
            background.push(spawn_reporting(done.clone(), feeder.run(self.shutdown.http())));
        }
        if let Some(feeder) = prepared.grpc_feeder {
            background.push(spawn_reporting(done.clone(), feeder.run(self.shutdown.grpc())));
        }
        if let Some(mux) = prepared.mux {
            let stop = self.shutdown.http();
            background.push(spawn_reporting(done.clone(), async move {
                mux.run(stop).await.map_err(ServerError::Accept)
            }));
        }

        let http = prepared
            .http_server
            .map(|server| spawn_reporting(done.clone(), server.serve(self.shutdown.http())));
        let grpc = prepared
            .grpc_server
            .map(|server| spawn_reporting(done.clone(), server.serve(self.shutdown.grpc())));

        Running {
            http,
            grpc,
            background,
        }
    }

    /// Make a pending or future [`Server::run`] return.
    pub fn stop(&self) {
        self.signals.stop();
    }

    /// Stop accepting, drain HTTP within the graceful shutdown timeout, then
    /// let in-flight gRPC calls finish. Later calls do nothing.
    pub async fn shutdown(&self) {
        let previous = std::mem::replace(&mut *self.state.lock(), State::Stopped);
        let running = match previous {
            State::Running(running) => running,
            // Never started: dropping the prepared parts closes the listeners.
            State::Ready(_) | State::Stopped => return,
        };

        self.shutdown.drain_http();
        if let Some(mut http) = running.http {
            let deadline = self.graceful_shutdown_timeout;
            if tokio::time::timeout(deadline, &mut http).await.is_err() {
                tracing::warn!(timeout = ?deadline, "HTTP connections still open at shutdown deadline, closing them");
                http.abort();
            }
        }

        self.shutdown.drain_grpc();
        if let Some(grpc) = running.grpc {
            let _ = grpc.await;
        }

        for task in running.background {
            task.abort();
        }
        tracing::info!("Server shut down");
    }
}

/// Spawn `fut`, offering its result to the completion channel.
fn spawn_reporting<F>(done: mpsc::Sender<Result<(), ServerError>>, fut: F) -> JoinHandle<()>
where
    F: Future<Output = Result<(), ServerError>> + Send + 'static,
{
    tokio::spawn(async move {
        let result = fut.await;
        if let Err(e) = &result {
            if !matches!(e, ServerError::Closed) {
                tracing::error!(error = %e, "Serving routine failed");
            }
        }
        let _ = done.try_send(result);
    })
}
