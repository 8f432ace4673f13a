//! HTTP-over-gRPC tunnel.
//!
//! # Data Flow
//! ```text
//! HTTP request
//!     → client.rs (encode, call httpgrpc.HTTP/Handle)
//!     → codec.rs (prost on the wire)
//!     → server.rs (decode, replay against the Router in memory)
//!     → status.rs (5xx promoted to a status carrying the full response)
//!     → client.rs (decode reply or recover the response from the status)
//! ```
//!
//! # Design Decisions
//! - Response bodies come from pool.rs and go back once encoded (stats.rs)
//! - Error classification lives in error.rs as a closed enum

pub mod client;
pub mod codec;
pub mod error;
pub mod pool;
pub mod resolver;
pub mod server;
pub mod stats;
pub mod status;
pub mod types;

pub use client::TunnelClient;
pub use error::TunnelError;
pub use pool::BufferPool;
pub use server::TunnelServer;
pub use status::{errorf, error_from_http_response, http_response_from_error, http_response_from_status};
pub use types::{Header, HttpRequest, HttpResponse};
