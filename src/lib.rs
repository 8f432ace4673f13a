//! Dual-protocol server runtime.
//!
//! Serves an axum [`Router`](axum::Router) over HTTP and tonic services over
//! gRPC from one process, with shared logging and metrics, graceful shutdown,
//! optional single-port multiplexing, and an HTTP-over-gRPC tunnel that
//! replays tunneled requests against the same router.

pub mod config;
pub mod grpc;
pub mod http;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod server;
pub mod tunnel;

pub use config::ServerConfig;
pub use lifecycle::ServerBuilder;
pub use server::{Server, ServerError};
pub use tunnel::{TunnelClient, TunnelServer};
