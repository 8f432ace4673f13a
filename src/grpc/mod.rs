//! gRPC protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! Connection (feeder or multiplexer)
//!     → server.rs (HTTP/2 connection, server options, connection limits)
//!     → tracing span
//!     → interceptor.rs (logging, instrumentation, user chain)
//!     → registered services (including the HTTP tunnel)
//! ```

pub mod cancel;
pub mod interceptor;
pub mod server;

pub use cancel::{is_canceled, with_cancellation};
pub use interceptor::{CallInfo, CallInterceptor, CallOutcome, CallParts};
pub use server::GrpcServer;
