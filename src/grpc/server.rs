//! gRPC sub-server.
//!
//! # Responsibilities
//! - Serve the registered services on every connection it receives
//! - Apply server options (concurrent streams, HTTP/2 keepalive, connection
//!   idle and age limits)
//! - Run the tracing layer and interceptor chain in front of every call
//! - Finish in-flight calls on shutdown
//!
//! # Design Decisions
//! - Connections come from a channel, so the dedicated listener and the
//!   multiplexer feed the same server
//! - Connections are served with hyper directly instead of tonic's
//!   transport, so each one can be sent away when it grows too old or idle
//! - Shutdown has no deadline; calls are always allowed to finish

use std::sync::Arc;

use axum::body::Body;
use futures_util::FutureExt;
use hyper_util::rt::{TokioExecutor, TokioTimer};
use hyper_util::server::conn::auto;
use tokio_util::sync::CancellationToken;
use tonic::service::Routes;
use tonic::transport::server::TcpConnectInfo;
use tonic::Status;
use tower::{ServiceBuilder, ServiceExt};
use tower_http::trace::{MakeSpan, TraceLayer};
use tracing::Span;

use crate::config::GrpcServerConfig;
use crate::grpc::interceptor::{CallInterceptor, InstrumentCalls, InterceptorLayer, LogCalls};
use crate::net::incoming::ConnectionReceiver;
use crate::net::serve::{ConnectionPolicy, ConnectionServer, Handler};
use crate::net::ConnectionInfo;
use crate::observability::Metrics;
use crate::server::ServerError;

/// Interceptors every server gets ahead of the caller's.
pub fn default_interceptors(disable_success_log: bool, metrics: &Metrics) -> Vec<Arc<dyn CallInterceptor>> {
    vec![
        Arc::new(LogCalls { disable_success_log }),
        Arc::new(InstrumentCalls::new(metrics.clone())),
    ]
}

/// Opens a span per call named after the method.
#[derive(Debug, Clone, Copy, Default)]
pub struct CallSpan;

impl<B> MakeSpan<B> for CallSpan {
    fn make_span(&mut self, req: &http::Request<B>) -> Span {
        tracing::debug_span!("grpc_call", method = %req.uri().path())
    }
}

/// Serves gRPC on every connection it receives.
pub struct GrpcServer {
    inner: ConnectionServer,
}

impl GrpcServer {
    pub fn new(
        routes: Routes,
        interceptors: Vec<Arc<dyn CallInterceptor>>,
        options: &GrpcServerConfig,
        incoming: ConnectionReceiver,
    ) -> Self {
        let service = ServiceBuilder::new()
            .layer(TraceLayer::new_for_grpc().make_span_with(CallSpan))
            .layer(InterceptorLayer::new(interceptors))
            .service(routes);

        let handler: Handler = Arc::new(move |req: http::Request<Body>| {
            let service = service.clone();
            async move {
                let mut req = req.map(tonic::body::boxed);
                // Lets services read the peer through `tonic::Request::remote_addr`.
                if let Some(info) = req.extensions().get::<ConnectionInfo>() {
                    let tcp = TcpConnectInfo {
                        local_addr: Some(info.local_addr),
                        remote_addr: Some(info.remote_addr),
                    };
                    req.extensions_mut().insert(tcp);
                }
                match service.oneshot(req).await {
                    Ok(resp) => resp.map(Body::new),
                    Err(e) => {
                        tracing::warn!(error = %e, "gRPC service failed");
                        Status::internal(e.to_string()).into_http().map(Body::new)
                    }
                }
            }
            .boxed()
        });

        let mut builder = auto::Builder::new(TokioExecutor::new()).http2_only();
        builder
            .http2()
            .timer(TokioTimer::new())
            .max_concurrent_streams(options.max_concurrent_streams)
            .keep_alive_interval(options.keepalive_time())
            .keep_alive_timeout(options.keepalive_timeout());

        let policy = ConnectionPolicy {
            idle_timeout: options.max_connection_idle(),
            max_age: options.max_connection_age(),
            max_age_grace: options.max_connection_age_grace(),
        };
        Self {
            inner: ConnectionServer::new("grpc", builder, handler, policy, incoming),
        }
    }

    /// Serve until `drain` fires and every in-flight call has finished.
    pub async fn serve(self, drain: CancellationToken) -> Result<(), ServerError> {
        self.inner.serve(drain).await
    }
}
