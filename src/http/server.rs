//! HTTP sub-server.
//!
//! # Responsibilities
//! - Assemble the application: user router, instrumentation endpoint, path
//!   prefix, write timeout and the middleware chain
//! - Serve connections handed over by a feeder or the multiplexer
//!
//! # Design Decisions
//! - Connections are served with hyper-util's auto builder, so HTTP/1.1, h2c
//!   and upgrades (WebSocket) share one port
//! - Connection details reach handlers as `ConnectInfo<SocketAddr>` and
//!   `ConnectionInfo` request extensions
//! - Keep-alive connections with nothing in flight are closed after the idle
//!   timeout

use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use futures_util::FutureExt;
use hyper_util::rt::{TokioExecutor, TokioTimer};
use hyper_util::server::conn::auto;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use tower_http::timeout::TimeoutLayer;

use crate::config::{HttpServerConfig, ServerConfig};
use crate::http::middleware::{self, Instrument, Middleware, RequestLog, SourceIpsError, Tracing};
use crate::net::incoming::ConnectionReceiver;
use crate::net::serve::{ConnectionPolicy, ConnectionServer, Handler};
use crate::observability::Metrics;
use crate::server::ServerError;

/// Path of the Prometheus scrape endpoint, relative to the path prefix.
pub const METRICS_PATH: &str = "/metrics";

/// Middleware every server gets unless defaults are disabled.
pub fn default_middleware(config: &ServerConfig, metrics: &Metrics) -> Result<Vec<Arc<dyn Middleware>>, SourceIpsError> {
    Ok(vec![
        Arc::new(Tracing),
        Arc::new(RequestLog::new(&config.logging)?),
        Arc::new(Instrument::new(metrics.clone())),
    ])
}

/// Add the instrumentation endpoint and nest the user router under the path
/// prefix. This is the router the tunnel replays into.
pub fn build_router(router: Router, config: &ServerConfig, prometheus: Option<PrometheusHandle>) -> Router {
    let mut router = router;
    if config.http_server.register_instrumentation {
        if let Some(handle) = prometheus {
            router = router.route(METRICS_PATH, get(move || std::future::ready(handle.render())));
        }
    }

    let prefix = config.http_server.path_prefix.trim_end_matches('/');
    if prefix.is_empty() {
        router
    } else {
        Router::new().nest(prefix, router)
    }
}

/// Wrap a router with the write timeout and the middleware chain, defaults
/// first unless disabled.
#[allow(deprecated)]
pub fn build_app(
    router: Router,
    config: &ServerConfig,
    chain: &[Arc<dyn Middleware>],
    metrics: &Metrics,
) -> Result<Router, SourceIpsError> {
    let router = router.layer(TimeoutLayer::new(config.http_server.write_timeout()));

    let mut full_chain = if config.http_server.do_not_add_default_http_middleware {
        Vec::new()
    } else {
        default_middleware(config, metrics)?
    };
    full_chain.extend(chain.iter().cloned());
    Ok(middleware::apply(router, &full_chain))
}

/// Serves HTTP on every connection it receives.
pub struct HttpServer {
    inner: ConnectionServer,
}

impl HttpServer {
    pub fn new(app: Router, incoming: ConnectionReceiver, options: &HttpServerConfig) -> Self {
        let handler: Handler = Arc::new(move |req| {
            let app = app.clone();
            async move {
                match app.oneshot(req).await {
                    Ok(resp) => resp,
                    Err(infallible) => match infallible {},
                }
            }
            .boxed()
        });

        let mut builder = auto::Builder::new(TokioExecutor::new());
        builder
            .http1()
            .timer(TokioTimer::new())
            .header_read_timeout(options.read_timeout());

        let policy = ConnectionPolicy {
            idle_timeout: options.idle_timeout(),
            ..ConnectionPolicy::default()
        };
        Self {
            inner: ConnectionServer::new("http", builder, handler, policy, incoming),
        }
    }

    /// Serve until `drain` fires, then let open connections finish.
    ///
    /// Always ends with [`ServerError::Closed`]; the caller bounds how long
    /// the drain may take by dropping this future.
    pub async fn serve(self, drain: CancellationToken) -> Result<(), ServerError> {
        self.inner.serve(drain).await
    }
}
