//! Startup orchestration.
//!
//! # Responsibilities
//! - Collect the collaborators a server runs with (router, gRPC services,
//!   middleware, interceptors, signal handler, metrics recorder, buffer pool)
//! - Validate configuration and resolve TLS material
//! - Bind listeners and assemble the sub-servers
//!
//! # Design Decisions
//! - Fail fast: every construction error is returned from `build`, never
//!   surfaced later from `run`
//! - Process-wide defaults (global metrics recorder, shared buffer pool, OS
//!   signals) are fallbacks only
//! - The tunnel replays into the router without the middleware chain, so a
//!   tunneled request is not logged or counted twice

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use metrics::Recorder;
use metrics_exporter_prometheus::PrometheusHandle;
use tonic::body::BoxBody;
use tonic::server::NamedService;
use tonic::service::RoutesBuilder;
use tower::Service;

use crate::config::{validate_config, ListenerConfig, ServerConfig};
use crate::grpc::interceptor::CallInterceptor;
use crate::grpc::server::{default_interceptors, GrpcServer};
use crate::http::middleware::Middleware;
use crate::http::server::{build_app, build_router, HttpServer};
use crate::lifecycle::signals::{OsSignals, SignalHandler};
use crate::net::incoming;
use crate::net::mux::Multiplexer;
use crate::net::tls::{load_tls_config, TlsAcceptor};
use crate::net::Listener;
use crate::observability::Metrics;
use crate::server::{Feeder, Prepared, Server, ServerError};
use crate::tunnel::stats::StatsHandler;
use crate::tunnel::{BufferPool, TunnelServer};

/// Configures and builds a [`Server`].
pub struct ServerBuilder {
    config: ServerConfig,
    router: Router,
    grpc_routes: RoutesBuilder,
    http_middleware: Vec<Arc<dyn Middleware>>,
    interceptors: Vec<Arc<dyn CallInterceptor>>,
    signal_handler: Option<Arc<dyn SignalHandler>>,
    recorder: Option<Arc<dyn Recorder + Send + Sync>>,
    prometheus: Option<PrometheusHandle>,
    buffer_pool: Option<Arc<BufferPool>>,
    tunnel_stats: Option<Arc<dyn StatsHandler>>,
}

impl ServerBuilder {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            router: Router::new(),
            grpc_routes: RoutesBuilder::default(),
            http_middleware: Vec::new(),
            interceptors: Vec::new(),
            signal_handler: None,
            recorder: None,
            prometheus: None,
            buffer_pool: None,
            tunnel_stats: None,
        }
    }

    /// Router serving HTTP requests (and tunneled ones).
    pub fn router(mut self, router: Router) -> Self {
        self.router = router;
        self
    }

    /// Register a gRPC service.
    pub fn grpc_service<S>(mut self, service: S) -> Self
    where
        S: Service<http::Request<BoxBody>, Response = http::Response<BoxBody>, Error = Infallible>
            + NamedService
            + Clone
            + Send
            + 'static,
        S::Future: Send + 'static,
    {
        self.grpc_routes.add_service(service);
        self
    }

    /// Append an HTTP middleware; earlier ones wrap later ones.
    pub fn http_middleware(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.http_middleware.push(middleware);
        self
    }

    /// Append a gRPC interceptor; `before` hooks run in registration order.
    pub fn grpc_interceptor(mut self, interceptor: Arc<dyn CallInterceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    /// Replace the default SIGINT/SIGTERM handler.
    pub fn signal_handler(mut self, handler: Arc<dyn SignalHandler>) -> Self {
        self.signal_handler = Some(handler);
        self
    }

    /// Send metrics here instead of the process-wide recorder.
    pub fn metrics_recorder(mut self, recorder: Arc<dyn Recorder + Send + Sync>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    /// Handle rendered by the instrumentation endpoint.
    pub fn prometheus_handle(mut self, handle: PrometheusHandle) -> Self {
        self.prometheus = Some(handle);
        self
    }

    /// Pool the tunnel takes response buffers from.
    pub fn buffer_pool(mut self, pool: Arc<BufferPool>) -> Self {
        self.buffer_pool = Some(pool);
        self
    }

    /// Observe the tunnel's call events.
    pub fn tunnel_stats_handler(mut self, stats: Arc<dyn StatsHandler>) -> Self {
        self.tunnel_stats = Some(stats);
        self
    }

    /// Validate, bind and assemble.
    pub async fn build(self) -> Result<Server, ServerError> {
        let config = self.config;
        if !config.http.enabled && !config.grpc.enabled {
            return Err(ServerError::NoProtocolEnabled);
        }
        if config.route_http_to_grpc && !(config.http.enabled && config.grpc.enabled) {
            return Err(ServerError::MuxRequiresBoth);
        }
        validate_config(&config).map_err(ServerError::InvalidConfig)?;

        let metrics = Metrics::new(&config.metrics_namespace, self.recorder);
        let http_tls = load_acceptor("http", &config.http).await?;
        let grpc_tls = load_acceptor("grpc", &config.grpc).await?;
        let http_listener = bind("http", &config.http, &metrics).await?;
        let grpc_listener = bind("grpc", &config.grpc, &metrics).await?;
        let http_addr = http_listener.as_ref().map(Listener::local_addr);
        let grpc_addr = grpc_listener.as_ref().map(Listener::local_addr);

        let (grpc_tx, grpc_rx) = incoming::channel();
        let mut grpc_routes = self.grpc_routes;
        let mut prepared = Prepared {
            http_feeder: None,
            grpc_feeder: None,
            mux: None,
            http_server: None,
            grpc_server: None,
        };

        if let Some(listener) = http_listener {
            let router = build_router(self.router, &config, self.prometheus);
            let app = build_app(router.clone(), &config, &self.http_middleware, &metrics)?;
            let (http_tx, http_rx) = incoming::channel();
            prepared.http_server = Some(HttpServer::new(app, http_rx, &config.http_server));

            if config.multiplexing() {
                prepared.mux = Some(Multiplexer::new(
                    listener,
                    http_tx,
                    grpc_tx.clone(),
                    config.mux_classify_timeout(),
                ));
            } else {
                prepared.http_feeder = Some(Feeder {
                    listener,
                    tls: http_tls,
                    tx: http_tx,
                });
            }

            if config.grpc.enabled {
                let mut tunnel = TunnelServer::builder(router)
                    .max_decoding_message_size(config.grpc_server.max_recv_msg_size)
                    .max_encoding_message_size(config.grpc_server.max_send_msg_size);
                if let Some(pool) = self.buffer_pool {
                    tunnel = tunnel.buffer_pool(pool);
                }
                if let Some(stats) = self.tunnel_stats {
                    tunnel = tunnel.stats_handler(stats);
                }
                grpc_routes.add_service(tunnel.build());
            }
        }

        if let Some(listener) = grpc_listener {
            let mut interceptors = default_interceptors(config.logging.disable_request_success_log, &metrics);
            interceptors.extend(self.interceptors);
            prepared.grpc_server = Some(GrpcServer::new(
                grpc_routes.routes(),
                interceptors,
                &config.grpc_server,
                grpc_rx,
            ));
            prepared.grpc_feeder = Some(Feeder {
                listener,
                tls: grpc_tls,
                tx: grpc_tx,
            });
        }

        tracing::info!(
            http = %display_addr(http_addr),
            grpc = %display_addr(grpc_addr),
            "Server listening on addresses"
        );

        let signals = self
            .signal_handler
            .unwrap_or_else(|| Arc::new(OsSignals::new()));
        Ok(Server::new(
            prepared,
            http_addr,
            grpc_addr,
            config.graceful_shutdown_timeout(),
            signals,
        ))
    }
}

async fn load_acceptor(protocol: &'static str, listener: &ListenerConfig) -> Result<Option<TlsAcceptor>, ServerError> {
    match &listener.tls {
        Some(tls) if listener.enabled => {
            let config = load_tls_config(tls)
                .await
                .map_err(|source| ServerError::Tls { protocol, source })?;
            Ok(Some(TlsAcceptor::new(config)))
        }
        _ => Ok(None),
    }
}

async fn bind(protocol: &'static str, listener: &ListenerConfig, metrics: &Metrics) -> Result<Option<Listener>, ServerError> {
    if !listener.enabled {
        return Ok(None);
    }
    Listener::bind(protocol, listener, metrics)
        .await
        .map(Some)
        .map_err(ServerError::Bind)
}

fn display_addr(addr: Option<SocketAddr>) -> String {
    addr.map_or_else(|| "disabled".to_string(), |addr| addr.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ValidationError;
    use crate::lifecycle::ManualStop;

    fn local(port_enabled: bool) -> ListenerConfig {
        ListenerConfig {
            enabled: port_enabled,
            address: "127.0.0.1".into(),
            ..ListenerConfig::with_port(0)
        }
    }

    fn config(http: bool, grpc: bool) -> ServerConfig {
        ServerConfig {
            http: local(http),
            grpc: local(grpc),
            ..ServerConfig::default()
        }
    }

    async fn build(config: ServerConfig) -> Result<Server, ServerError> {
        ServerBuilder::new(config)
            .signal_handler(Arc::new(ManualStop::new()))
            .build()
            .await
    }

    #[tokio::test]
    async fn enabled_protocols_get_addresses() {
        for (http, grpc) in [(true, true), (true, false), (false, true)] {
            let server = build(config(http, grpc)).await.unwrap();
            assert_eq!(server.http_listen_addr().is_some(), http);
            assert_eq!(server.grpc_listen_addr().is_some(), grpc);
        }
    }

    #[tokio::test]
    async fn construction_errors() {
        assert!(matches!(
            build(config(false, false)).await,
            Err(ServerError::NoProtocolEnabled)
        ));

        let mut mux = config(true, false);
        mux.route_http_to_grpc = true;
        assert!(matches!(build(mux).await, Err(ServerError::MuxRequiresBoth)));

        let mut invalid = config(true, true);
        invalid.graceful_shutdown_timeout_secs = 0;
        match build(invalid).await {
            Err(ServerError::InvalidConfig(errors)) => assert_eq!(
                errors,
                vec![ValidationError::Zero {
                    field: "graceful_shutdown_timeout_secs"
                }]
            ),
            other => panic!("unexpected: {:?}", other.err()),
        }
    }

    #[tokio::test]
    async fn bind_and_tls_failures_surface_at_build() {
        let first = build(config(true, false)).await.unwrap();
        let taken = first.http_listen_addr().unwrap();

        let mut clash = config(true, false);
        clash.http.port = taken.port();
        assert!(matches!(build(clash).await, Err(ServerError::Bind(_))));

        let mut tls = config(false, true);
        tls.grpc.tls = Some(crate::config::TlsConfig {
            cert_path: Some("/nonexistent/cert.pem".into()),
            key_path: Some("/nonexistent/key.pem".into()),
            ..Default::default()
        });
        assert!(matches!(
            build(tls).await,
            Err(ServerError::Tls { protocol: "grpc", .. })
        ));
    }
}
