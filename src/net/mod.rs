//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (accept, connection limits, connection gauge)
//!     → mux.rs (optional: classify HTTP vs gRPC on a shared listener)
//!     → tls.rs (optional TLS handshake, off the accept path)
//!     → incoming.rs (channel to the protocol server)
//!     → serve.rs (hyper connection, idle and age limits, drain)
//!     → connection.rs (stream + lifetime tracking until closed)
//! ```
//!
//! # Design Decisions
//! - Bounded accept via semaphore prevents resource exhaustion
//! - Each connection holds a guard so counts stay correct on every exit path
//! - TLS is optional and handled transparently

pub mod connection;
pub mod incoming;
pub mod listener;
pub mod mux;
pub mod serve;
pub mod tls;

pub use connection::{Connection, ConnectionInfo};
pub use listener::{Listener, ListenerError};
