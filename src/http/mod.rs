//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! Connection (feeder or multiplexer)
//!     → server.rs (hyper-util auto connection, connection extensions)
//!     → middleware/ (tracing + request ID, request logging, metrics, user chain)
//!     → write timeout
//!     → user router (nested under the path prefix)
//! ```

pub mod middleware;
pub mod request;
pub mod server;
pub mod websocket;

pub use middleware::Middleware;
pub use request::{RequestIdExt, X_REQUEST_ID};
pub use server::{build_app, build_router, HttpServer};
