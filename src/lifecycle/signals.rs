//! Stop signals.
//!
//! # Responsibilities
//! - Define what the server waits on before `run` returns
//! - Provide the default OS handler (SIGINT, SIGTERM) and a manual one
//! - Let `Server::stop` end the wait programmatically
//!
//! # Design Decisions
//! - Uses Tokio's signal handling (async-safe)
//! - Stopping is idempotent and may happen before the wait starts

use std::future::pending;

use futures_util::future::BoxFuture;
use tokio_util::sync::CancellationToken;

/// Something the server waits on before `run` returns.
pub trait SignalHandler: Send + Sync + 'static {
    /// Resolve once the server should stop.
    fn wait(&self) -> BoxFuture<'static, ()>;

    /// End any pending or future `wait`.
    fn stop(&self);
}

/// Stops on SIGINT, SIGTERM or [`SignalHandler::stop`].
#[derive(Debug, Clone, Default)]
pub struct OsSignals {
    stop: CancellationToken,
}

impl OsSignals {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SignalHandler for OsSignals {
    fn wait(&self) -> BoxFuture<'static, ()> {
        let stop = self.stop.clone();
        Box::pin(async move {
            tokio::select! {
                _ = stop.cancelled() => {}
                _ = interrupt() => tracing::info!(signal = "SIGINT", "Received signal, stopping"),
                _ = terminate() => tracing::info!(signal = "SIGTERM", "Received signal, stopping"),
            }
        })
    }

    fn stop(&self) {
        self.stop.cancel();
    }
}

/// Only stops when asked to; no OS signals are installed.
#[derive(Debug, Clone, Default)]
pub struct ManualStop {
    stop: CancellationToken,
}

impl ManualStop {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SignalHandler for ManualStop {
    fn wait(&self) -> BoxFuture<'static, ()> {
        let stop = self.stop.clone();
        Box::pin(async move { stop.cancelled().await })
    }

    fn stop(&self) {
        self.stop.cancel();
    }
}

async fn interrupt() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "Failed to install SIGINT handler");
        pending::<()>().await;
    }
}

#[cfg(unix)]
async fn terminate() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            tracing::warn!(error = %e, "Failed to install SIGTERM handler");
            pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    pending::<()>().await;
}
