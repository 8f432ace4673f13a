//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     Check protocols → Validate config → Load TLS → Bind listeners → Server
//!
//! Run (server.rs):
//!     Spawn signal watcher, accept loops, multiplexer, sub-servers
//!     → first completion (signal, stop, fatal error) returns
//!
//! Shutdown (shutdown.rs):
//!     Drain HTTP (bounded by deadline) → drain gRPC (unbounded)
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT or Server::stop → run returns
//! ```
//!
//! # Design Decisions
//! - Fail fast: any startup error is returned from `build`
//! - Listeners are bound at build time, so addresses are known before `run`

pub mod shutdown;
pub mod signals;
pub mod startup;

pub use shutdown::Shutdown;
pub use signals::{ManualStop, OsSignals, SignalHandler};
pub use startup::ServerBuilder;
