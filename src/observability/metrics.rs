//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Define server metrics (latency, payload sizes, in-flight, connections)
//! - Route every update to the injected recorder, or the global one
//! - Apply the configured namespace prefix
//!
//! # Metrics
//! - `request_duration_seconds` (histogram): method, route, status_code, ws
//! - `request_message_bytes` / `response_message_bytes` (histogram): method, route
//! - `inflight_requests` (gauge): method, route
//! - `tcp_connections` (gauge): protocol
//! - `tcp_connections_limit` (gauge): protocol, 0 meaning unlimited
//!
//! # Design Decisions
//! - Handles are resolved once per label set and updated lock-free
//! - An injected recorder is scoped with `metrics::with_local_recorder`, so
//!   several servers in one process never share series by accident

use std::sync::Arc;
use std::time::Duration;

use metrics::{Gauge, Histogram, Label, Recorder};

pub const REQUEST_DURATION_SECONDS: &str = "request_duration_seconds";
pub const REQUEST_MESSAGE_BYTES: &str = "request_message_bytes";
pub const RESPONSE_MESSAGE_BYTES: &str = "response_message_bytes";
pub const INFLIGHT_REQUESTS: &str = "inflight_requests";
pub const TCP_CONNECTIONS: &str = "tcp_connections";
pub const TCP_CONNECTIONS_LIMIT: &str = "tcp_connections_limit";

/// Bucket boundaries for `request_duration_seconds`.
pub const DURATION_BUCKETS: &[f64] = &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];

/// Entry point for every metric the server emits.
#[derive(Clone, Default)]
pub struct Metrics {
    recorder: Option<Arc<dyn Recorder + Send + Sync>>,
    namespace: Arc<str>,
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics")
            .field("namespace", &self.namespace)
            .field("local_recorder", &self.recorder.is_some())
            .finish()
    }
}

impl Metrics {
    pub fn new(namespace: &str, recorder: Option<Arc<dyn Recorder + Send + Sync>>) -> Self {
        Self {
            recorder,
            namespace: Arc::from(namespace),
        }
    }

    /// Full metric name with the namespace applied.
    pub fn name(&self, base: &str) -> String {
        if self.namespace.is_empty() {
            base.to_string()
        } else {
            format!("{}_{}", self.namespace, base)
        }
    }

    fn scoped<T>(&self, f: impl FnOnce() -> T) -> T {
        match &self.recorder {
            Some(recorder) => metrics::with_local_recorder(recorder.as_ref(), f),
            None => f(),
        }
    }

    pub fn histogram(&self, base: &str, labels: Vec<Label>) -> Histogram {
        let name = self.name(base);
        self.scoped(|| metrics::histogram!(name, labels))
    }

    pub fn gauge(&self, base: &str, labels: Vec<Label>) -> Gauge {
        let name = self.name(base);
        self.scoped(|| metrics::gauge!(name, labels))
    }

    /// Record one finished request.
    pub fn observe_request(&self, method: &str, route: &str, status_code: &str, ws: bool, elapsed: Duration) {
        self.histogram(
            REQUEST_DURATION_SECONDS,
            vec![
                Label::new("method", method.to_string()),
                Label::new("route", route.to_string()),
                Label::new("status_code", status_code.to_string()),
                Label::new("ws", ws.to_string()),
            ],
        )
        .record(elapsed.as_secs_f64());
    }

    pub fn observe_request_bytes(&self, method: &str, route: &str, bytes: u64) {
        self.histogram(REQUEST_MESSAGE_BYTES, route_labels(method, route))
            .record(bytes as f64);
    }

    pub fn observe_response_bytes(&self, method: &str, route: &str, bytes: u64) {
        self.histogram(RESPONSE_MESSAGE_BYTES, route_labels(method, route))
            .record(bytes as f64);
    }

    /// Increment `inflight_requests`; the returned guard decrements it.
    pub fn inflight(&self, method: &str, route: &str) -> InflightGuard {
        let gauge = self.gauge(INFLIGHT_REQUESTS, route_labels(method, route));
        gauge.increment(1.0);
        InflightGuard { gauge }
    }

    /// Gauge counting open connections for `protocol`.
    pub fn tcp_connections(&self, protocol: &str) -> Gauge {
        self.gauge(TCP_CONNECTIONS, vec![Label::new("protocol", protocol.to_string())])
    }

    /// Publish the connection limit for `protocol`.
    pub fn set_tcp_connections_limit(&self, protocol: &str, limit: usize) {
        self.gauge(
            TCP_CONNECTIONS_LIMIT,
            vec![Label::new("protocol", protocol.to_string())],
        )
        .set(limit as f64);
    }
}

fn route_labels(method: &str, route: &str) -> Vec<Label> {
    vec![
        Label::new("method", method.to_string()),
        Label::new("route", route.to_string()),
    ]
}

/// Decrements `inflight_requests` when dropped.
pub struct InflightGuard {
    gauge: Gauge,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.gauge.decrement(1.0);
    }
}
