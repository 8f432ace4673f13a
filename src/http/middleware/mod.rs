//! HTTP middleware chain.
//!
//! # Responsibilities
//! - Define the contract every HTTP middleware implements
//! - Compose an ordered chain around a router
//! - Provide the built-in tracing, logging and instrumentation middleware
//!
//! # Design Decisions
//! - Middleware are applied with `Router::layer`, so route information
//!   (`MatchedPath`) is visible to all of them
//! - The first middleware in the chain wraps outermost

use std::sync::Arc;

use axum::Router;

pub mod instrument;
pub mod logging;
pub mod source_ips;
pub mod trace;

pub use instrument::{make_label_value, Instrument};
pub use logging::RequestLog;
pub use source_ips::{SourceIps, SourceIpsError};
pub use trace::Tracing;

/// Wraps a router with extra behaviour.
pub trait Middleware: Send + Sync + 'static {
    fn wrap(&self, router: Router) -> Router;
}

impl<F> Middleware for F
where
    F: Fn(Router) -> Router + Send + Sync + 'static,
{
    fn wrap(&self, router: Router) -> Router {
        self(router)
    }
}

/// Apply `chain` to `router`; `chain[0]` ends up outermost.
pub fn apply(router: Router, chain: &[Arc<dyn Middleware>]) -> Router {
    chain.iter().rev().fold(router, |router, middleware| middleware.wrap(router))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::routing::get;
    use http::{HeaderValue, Request};
    use tower::ServiceExt;

    fn tag(value: &'static str) -> Arc<dyn Middleware> {
        Arc::new(move |router: Router| {
            router.layer(axum::middleware::map_response(move |mut resp: axum::response::Response| async move {
                resp.headers_mut().append("x-order", HeaderValue::from_static(value));
                resp
            }))
        })
    }

    #[tokio::test]
    async fn first_registered_wraps_outermost() {
        let router = Router::new().route("/", get(|| async { "ok" }));
        let app = apply(router, &[tag("outer"), tag("inner")]);

        let resp = app.oneshot(Request::new(Body::empty())).await.unwrap();
        let order: Vec<_> = resp.headers().get_all("x-order").iter().collect();
        // Responses unwind inside-out.
        assert_eq!(order, vec!["inner", "outer"]);
    }
}
