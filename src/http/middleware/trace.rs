//! Request spans and request IDs.

use axum::body::Body;
use axum::extract::MatchedPath;
use axum::Router;
use http::Request;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use crate::http::middleware::Middleware;
use crate::http::request::{propagate_request_id_layer, set_request_id_layer, RequestIdExt};

/// Opens a span per request carrying method, route and request ID.
#[derive(Debug, Clone, Default)]
pub struct Tracing;

impl Middleware for Tracing {
    fn wrap(&self, router: Router) -> Router {
        let trace = TraceLayer::new_for_http().make_span_with(|req: &Request<Body>| {
            let route = req
                .extensions()
                .get::<MatchedPath>()
                .map(MatchedPath::as_str)
                .unwrap_or_default();
            tracing::debug_span!(
                "http_request",
                method = %req.method(),
                uri = %req.uri(),
                route,
                request_id = req.request_id().unwrap_or_default(),
            )
        });

        router.layer(
            ServiceBuilder::new()
                .layer(set_request_id_layer())
                .layer(trace)
                .layer(propagate_request_id_layer()),
        )
    }
}
