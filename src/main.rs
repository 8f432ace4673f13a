//! dual-server
//!
//! Runs a server from a TOML configuration file. Out of the box it serves
//! the instrumentation endpoint over HTTP and the HTTP tunnel over gRPC;
//! applications embed the library to add their own routes and services.
//!
//! # Architecture Overview
//!
//! ```text
//!                     ┌──────────────────────────────────────────────┐
//!                     │                  SERVER                      │
//!   HTTP listener ───▶│  [mux] ──▶ HTTP server ──▶ middleware ──▶ router
//!                     │    │                                   ▲     │
//!                     │    ▼                                   │     │
//!   gRPC listener ───▶│  gRPC server ──▶ interceptors ──▶ tunnel     │
//!                     │                                 └──▶ services│
//!                     └──────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;

use dual_server::config::load_config;
use dual_server::observability::{logging, metrics::DURATION_BUCKETS};
use dual_server::ServerBuilder;

#[derive(Debug, Parser)]
#[command(name = "dual-server", version, about = "HTTP and gRPC server runtime")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long)]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = load_config(&args.config)?;
    logging::init(&config.logging)?;

    tracing::info!(config = %args.config.display(), "dual-server starting");

    let recorder = PrometheusBuilder::new()
        .set_buckets(DURATION_BUCKETS)?
        .build_recorder();
    let handle = recorder.handle();

    let server = ServerBuilder::new(config)
        .metrics_recorder(Arc::new(recorder))
        .prometheus_handle(handle)
        .build()
        .await?;

    let result = server.run().await;
    server.shutdown().await;
    result?;

    tracing::info!("Shutdown complete");
    Ok(())
}
