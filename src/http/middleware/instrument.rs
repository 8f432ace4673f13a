//! Request metrics.
//!
//! Records `request_duration_seconds`, request/response body sizes and the
//! in-flight gauge, labelled by method and route. Routes come from the
//! matched path template, so `/users/{id}` is one series.

use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use axum::body::Body;
use axum::extract::{MatchedPath, State};
use axum::middleware::{from_fn_with_state, Next};
use axum::response::Response;
use axum::Router;
use bytes::Bytes;
use http::Request;
use http_body::{Frame, SizeHint};

use crate::http::middleware::Middleware;
use crate::http::websocket::is_ws_handshake;
use crate::observability::Metrics;

/// Route label for requests no route matched.
pub const UNMATCHED_ROUTE: &str = "other";

/// Records per-request metrics.
#[derive(Clone)]
pub struct Instrument {
    metrics: Metrics,
}

impl Instrument {
    pub fn new(metrics: Metrics) -> Self {
        Self { metrics }
    }
}

impl Middleware for Instrument {
    fn wrap(&self, router: Router) -> Router {
        router.layer(from_fn_with_state(self.metrics.clone(), instrument))
    }
}

async fn instrument(State(metrics): State<Metrics>, req: Request<Body>, next: Next) -> Response {
    let begin = Instant::now();
    let route = req
        .extensions()
        .get::<MatchedPath>()
        .map(|path| make_label_value(path.as_str()))
        .unwrap_or_else(|| UNMATCHED_ROUTE.to_string());
    let method = req.method().as_str().to_owned();
    let ws = is_ws_handshake(req.headers());
    let inflight = metrics.inflight(&method, &route);

    let req = {
        let (metrics, method, route) = (metrics.clone(), method.clone(), route.clone());
        req.map(|body| {
            Body::new(CountingBody::new(body, move |bytes| {
                metrics.observe_request_bytes(&method, &route, bytes)
            }))
        })
    };

    let resp = next.run(req).await;
    metrics.observe_request(&method, &route, resp.status().as_str(), ws, begin.elapsed());

    // The request stays in flight until its response body is finished.
    resp.map(|body| {
        Body::new(CountingBody::new(body, move |bytes| {
            drop(inflight);
            metrics.observe_response_bytes(&method, &route, bytes)
        }))
    })
}

/// Turn a path into a metric label: runs of non-alphanumerics become `_`,
/// outer underscores are trimmed, and the result is lowercased.
pub fn make_label_value(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    let mut pending_underscore = false;
    for c in path.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_underscore && !out.is_empty() {
                out.push('_');
            }
            pending_underscore = false;
            out.push(c.to_ascii_lowercase());
        } else {
            pending_underscore = true;
        }
    }
    if out.is_empty() {
        "root".to_string()
    } else {
        out
    }
}

/// Body wrapper that reports the number of data bytes seen once dropped.
struct CountingBody<B> {
    inner: B,
    bytes: u64,
    on_done: Option<Box<dyn FnOnce(u64) + Send>>,
}

impl<B> CountingBody<B> {
    fn new(inner: B, on_done: impl FnOnce(u64) + Send + 'static) -> Self {
        Self {
            inner,
            bytes: 0,
            on_done: Some(Box::new(on_done)),
        }
    }
}

impl<B> http_body::Body for CountingBody<B>
where
    B: http_body::Body<Data = Bytes> + Unpin,
{
    type Data = Bytes;
    type Error = B::Error;

    fn poll_frame(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Result<Frame<Bytes>, B::Error>>> {
        let this = &mut *self;
        let polled = Pin::new(&mut this.inner).poll_frame(cx);
        if let Poll::Ready(Some(Ok(frame))) = &polled {
            if let Some(data) = frame.data_ref() {
                this.bytes += data.len() as u64;
            }
        }
        polled
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl<B> Drop for CountingBody<B> {
    fn drop(&mut self) {
        if let Some(on_done) = self.on_done.take() {
            on_done(self.bytes);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::{get, post};
    use metrics_exporter_prometheus::PrometheusBuilder;
    use std::sync::Arc;
    use tower::ServiceExt;

    #[test]
    fn label_values() {
        assert_eq!(make_label_value("/"), "root");
        assert_eq!(make_label_value(""), "root");
        assert_eq!(make_label_value("/api/v1/push"), "api_v1_push");
        assert_eq!(make_label_value("/Users/{id}//Items"), "users_id_items");
        assert_eq!(make_label_value("__a-b__"), "a_b");
    }

    #[tokio::test]
    async fn records_route_status_and_sizes() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        let metrics = Metrics::new("", Some(Arc::new(recorder)));

        let router = Router::new()
            .route("/users/{id}", post(|body: String| async move { body.to_uppercase() }))
            .route("/ok", get(|| async { "ok" }));
        let app = Instrument::new(metrics).wrap(router);

        let req = Request::post("/users/42").body(Body::from("hello")).unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert_eq!(body, "HELLO");

        let req = Request::get("/missing").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        drop(resp);

        let rendered = handle.render();
        assert!(rendered.contains(
            r#"request_duration_seconds_count{method="POST",route="users_id",status_code="200",ws="false"} 1"#
        ));
        assert!(rendered.contains(
            r#"request_duration_seconds_count{method="GET",route="other",status_code="404",ws="false"} 1"#
        ));
        assert!(rendered.contains(r#"request_message_bytes_sum{method="POST",route="users_id"} 5"#));
        assert!(rendered.contains(r#"response_message_bytes_sum{method="POST",route="users_id"} 5"#));
        assert!(rendered.contains(r#"inflight_requests{method="POST",route="users_id"} 0"#));
    }

    #[tokio::test]
    async fn streaming_response_stays_in_flight() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        let metrics = Metrics::new("", Some(Arc::new(recorder)));

        let router = Router::new().route(
            "/stream",
            get(|| async {
                let chunks = futures_util::stream::iter(["a", "b"].map(Ok::<_, std::io::Error>));
                Body::from_stream(chunks)
            }),
        );
        let app = Instrument::new(metrics).wrap(router);

        let resp = app.oneshot(Request::get("/stream").body(Body::empty()).unwrap()).await.unwrap();
        let gauge = r#"inflight_requests{method="GET",route="stream"}"#;
        assert!(handle.render().contains(&format!("{gauge} 1")));

        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert_eq!(body, "ab");
        assert!(handle.render().contains(&format!("{gauge} 0")));
    }
}
