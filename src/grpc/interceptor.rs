//! gRPC call interceptors.
//!
//! # Responsibilities
//! - Define the contract every call interceptor implements
//! - Run `before` hooks in order ahead of the handler and `after` hooks in
//!   reverse once the call's final status is known
//! - Provide the built-in logging and instrumentation interceptors
//!
//! # Design Decisions
//! - Interceptors sit in a server-level tower layer, so they see unary and
//!   streaming calls alike
//! - The final status is read from the response headers (trailers-only
//!   responses) or from the trailers at the end of the body
//! - A call dropped before its status was sent (client went away) completes
//!   as `Cancelled`

use std::fmt;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures_util::future::BoxFuture;
use http::header::CONTENT_TYPE;
use http::HeaderValue;
use http_body::{Frame, SizeHint};
use metrics::Label;
use tonic::{Code, Status};
use tower::{Layer, Service};

use crate::net::ConnectionInfo;
use crate::observability::metrics::INFLIGHT_REQUESTS;
use crate::observability::Metrics;
use crate::tunnel::http_response_from_status;

/// Method label used for every gRPC series.
pub const GRPC_METHOD_LABEL: &str = "gRPC";

/// The call as seen before the handler runs: URI (the full method path),
/// metadata headers and extensions.
pub type CallParts = http::request::Parts;

/// Observes and optionally rejects gRPC calls.
pub trait CallInterceptor: Send + Sync + 'static {
    /// Inspect or modify the call. Returning an error fails the call without
    /// reaching the handler.
    fn before(&self, call: &mut CallParts) -> Result<(), Status> {
        let _ = call;
        Ok(())
    }

    /// Observe the call's completion.
    fn after(&self, call: &CallInfo, outcome: &CallOutcome) {
        let _ = (call, outcome);
    }
}

/// Identity of a call.
#[derive(Debug, Clone)]
pub struct CallInfo {
    /// Full method path, e.g. `/httpgrpc.HTTP/Handle`.
    pub method: String,
    pub remote_addr: Option<SocketAddr>,
    pub started: Instant,
}

/// How a call ended.
#[derive(Debug, Clone)]
pub struct CallOutcome {
    pub status: Status,
    pub duration: Duration,
}

impl CallOutcome {
    pub fn is_ok(&self) -> bool {
        self.status.code() == Code::Ok
    }

    pub fn is_canceled(&self) -> bool {
        self.status.code() == Code::Cancelled
    }
}

/// Metric label for a call's final status.
pub fn status_label(status: &Status) -> String {
    match status.code() {
        Code::Ok => "success".to_string(),
        Code::Cancelled => "cancel".to_string(),
        code => match http_response_from_status(status) {
            Some(resp) => resp.code.to_string(),
            None if code == Code::Unknown => "error".to_string(),
            None => (code as i32).to_string(),
        },
    }
}

/// Layer running an interceptor chain around every call.
#[derive(Clone)]
pub struct InterceptorLayer {
    chain: Arc<[Arc<dyn CallInterceptor>]>,
}

impl InterceptorLayer {
    pub fn new(chain: Vec<Arc<dyn CallInterceptor>>) -> Self {
        Self { chain: chain.into() }
    }
}

impl<S> Layer<S> for InterceptorLayer {
    type Service = InterceptedService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        InterceptedService {
            inner,
            chain: Arc::clone(&self.chain),
        }
    }
}

#[derive(Clone)]
pub struct InterceptedService<S> {
    inner: S,
    chain: Arc<[Arc<dyn CallInterceptor>]>,
}

impl<S, B, ResBody> Service<http::Request<B>> for InterceptedService<S>
where
    S: Service<http::Request<B>, Response = http::Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
    B: Send + 'static,
    ResBody: Send + 'static,
{
    type Response = http::Response<ObservedBody<ResBody>>;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: http::Request<B>) -> Self::Future {
        // The ready service is the one that must handle this call.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let chain = Arc::clone(&self.chain);

        Box::pin(async move {
            let (mut parts, body) = req.into_parts();
            let info = CallInfo {
                method: parts.uri.path().to_owned(),
                remote_addr: parts.extensions.get::<ConnectionInfo>().map(|c| c.remote_addr),
                started: Instant::now(),
            };
            let mut reporter = Reporter {
                info,
                chain: Arc::clone(&chain),
                entered: 0,
                done: false,
            };

            for interceptor in chain.iter() {
                if let Err(status) = interceptor.before(&mut parts) {
                    let resp = rejection(&status);
                    reporter.finish(status);
                    return Ok(resp);
                }
                reporter.entered += 1;
            }

            let resp = inner.call(http::Request::from_parts(parts, body)).await?;
            let (parts, body) = resp.into_parts();
            if let Some(status) = Status::from_header_map(&parts.headers) {
                reporter.finish(status);
                return Ok(http::Response::from_parts(parts, ObservedBody::new(body, None)));
            }
            Ok(http::Response::from_parts(parts, ObservedBody::new(body, Some(reporter))))
        })
    }
}

/// Trailers-only response carrying `status`.
fn rejection<B>(status: &Status) -> http::Response<ObservedBody<B>> {
    let mut resp = http::Response::new(ObservedBody::empty());
    resp.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/grpc"));
    if let Err(e) = status.add_header(resp.headers_mut()) {
        tracing::warn!(error = %e, "Failed to encode rejection status");
    }
    resp
}

/// Runs the `after` hooks exactly once.
struct Reporter {
    info: CallInfo,
    chain: Arc<[Arc<dyn CallInterceptor>]>,
    /// Interceptors whose `before` hook let the call through.
    entered: usize,
    done: bool,
}

impl Reporter {
    fn finish(&mut self, status: Status) {
        if self.done {
            return;
        }
        self.done = true;
        let outcome = CallOutcome {
            status,
            duration: self.info.started.elapsed(),
        };
        for interceptor in self.chain[..self.entered].iter().rev() {
            interceptor.after(&self.info, &outcome);
        }
    }
}

impl Drop for Reporter {
    fn drop(&mut self) {
        self.finish(Status::cancelled("call dropped before completion"));
    }
}

/// Response body that reports the call's status once its trailers pass.
pub struct ObservedBody<B> {
    inner: Option<B>,
    reporter: Option<Reporter>,
}

impl<B> ObservedBody<B> {
    fn new(inner: B, reporter: Option<Reporter>) -> Self {
        Self {
            inner: Some(inner),
            reporter,
        }
    }

    fn empty() -> Self {
        Self {
            inner: None,
            reporter: None,
        }
    }

    fn finish(&mut self, status: Status) {
        if let Some(mut reporter) = self.reporter.take() {
            reporter.finish(status);
        }
    }
}

impl<B> http_body::Body for ObservedBody<B>
where
    B: http_body::Body<Data = Bytes> + Unpin,
    B::Error: fmt::Display,
{
    type Data = Bytes;
    type Error = B::Error;

    fn poll_frame(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Result<Frame<Bytes>, B::Error>>> {
        let this = &mut *self;
        let Some(inner) = this.inner.as_mut() else {
            return Poll::Ready(None);
        };

        let polled = ready!(Pin::new(inner).poll_frame(cx));
        match &polled {
            Some(Ok(frame)) => {
                if let Some(status) = frame.trailers_ref().and_then(Status::from_header_map) {
                    this.finish(status);
                }
            }
            Some(Err(e)) => this.finish(Status::internal(e.to_string())),
            None => this.finish(Status::unknown("response ended without grpc-status")),
        }
        Poll::Ready(polled)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.as_ref().map_or(true, |body| body.is_end_stream())
    }

    fn size_hint(&self) -> SizeHint {
        self.inner
            .as_ref()
            .map_or_else(|| SizeHint::with_exact(0), |body| body.size_hint())
    }
}

/// Logs failed calls at warn, cancelled and successful ones at debug.
#[derive(Debug, Clone, Default)]
pub struct LogCalls {
    pub disable_success_log: bool,
}

impl CallInterceptor for LogCalls {
    fn after(&self, call: &CallInfo, outcome: &CallOutcome) {
        let method = call.method.as_str();
        let duration = outcome.duration;
        if outcome.is_ok() {
            if !self.disable_success_log {
                tracing::debug!(method, ?duration, "gRPC (success)");
            }
        } else if outcome.is_canceled() {
            tracing::debug!(method, ?duration, err = %outcome.status, "gRPC");
        } else {
            tracing::warn!(method, ?duration, err = %outcome.status, "gRPC");
        }
    }
}

/// Records `request_duration_seconds` and `inflight_requests` per method.
#[derive(Debug, Clone, Default)]
pub struct InstrumentCalls {
    metrics: Metrics,
}

impl InstrumentCalls {
    pub fn new(metrics: Metrics) -> Self {
        Self { metrics }
    }

    fn inflight(&self, method: &str) -> metrics::Gauge {
        self.metrics.gauge(
            INFLIGHT_REQUESTS,
            vec![
                Label::new("method", GRPC_METHOD_LABEL),
                Label::new("route", method.to_string()),
            ],
        )
    }
}

impl CallInterceptor for InstrumentCalls {
    fn before(&self, call: &mut CallParts) -> Result<(), Status> {
        self.inflight(call.uri.path()).increment(1.0);
        Ok(())
    }

    fn after(&self, call: &CallInfo, outcome: &CallOutcome) {
        self.inflight(&call.method).decrement(1.0);
        self.metrics.observe_request(
            GRPC_METHOD_LABEL,
            &call.method,
            &status_label(&outcome.status),
            false,
            outcome.duration,
        );
    }
}
