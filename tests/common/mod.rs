//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::stream::{BoxStream, StreamExt};
use http::uri::PathAndQuery;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle, PrometheusRecorder};
use tokio::task::JoinHandle;
use tonic::body::BoxBody;
use tonic::codec::{ProstCodec, Streaming};
use tonic::server::{NamedService, ServerStreamingService, UnaryService};
use tonic::transport::{Channel, Endpoint};
use tonic::{Response, Status};
use tower::Service;

use dual_server::config::{ListenerConfig, ServerConfig};
use dual_server::lifecycle::ManualStop;
use dual_server::observability::metrics::DURATION_BUCKETS;
use dual_server::{Server, ServerBuilder, ServerError};

pub const FAKE_SERVICE: &str = "server.FakeServer";

#[derive(Clone, Copy, PartialEq, prost::Message)]
pub struct Empty {}

#[derive(Clone, Copy, PartialEq, prost::Message)]
pub struct FailWithHttpErrorRequest {
    #[prost(int32, tag = "1")]
    pub code: i32,
}

/// Counts handler futures that ended, whether they completed or were dropped.
#[derive(Debug, Default)]
pub struct Calls {
    pub sleeps_started: AtomicUsize,
    pub sleeps_ended: AtomicUsize,
}

struct EndGuard(Arc<Calls>);

impl Drop for EndGuard {
    fn drop(&mut self) {
        self.0.sleeps_ended.fetch_add(1, Ordering::SeqCst);
    }
}

/// gRPC service with one method per outcome the tests care about.
#[derive(Clone, Default)]
pub struct FakeServer {
    pub calls: Arc<Calls>,
}

impl NamedService for FakeServer {
    const NAME: &'static str = FAKE_SERVICE;
}

fn grpc<E, D>() -> tonic::server::Grpc<ProstCodec<E, D>>
where
    E: prost::Message + Send + 'static,
    D: prost::Message + Default + Send + 'static,
{
    tonic::server::Grpc::new(ProstCodec::default())
}

impl<B> Service<http::Request<B>> for FakeServer
where
    B: http_body::Body + Send + 'static,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>> + Send + 'static,
{
    type Response = http::Response<BoxBody>;
    type Error = Infallible;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: http::Request<B>) -> Self::Future {
        let calls = Arc::clone(&self.calls);
        let path = req.uri().path().to_owned();
        Box::pin(async move {
            let resp = match path.as_str() {
                "/server.FakeServer/Succeed" => grpc::<Empty, Empty>().unary(Succeed, req).await,
                "/server.FakeServer/FailWithError" => grpc::<Empty, Empty>().unary(FailWithError, req).await,
                "/server.FakeServer/FailWithHTTPError" => {
                    grpc::<Empty, FailWithHttpErrorRequest>()
                        .unary(FailWithHttpError, req)
                        .await
                }
                "/server.FakeServer/Sleep" => grpc::<Empty, Empty>().unary(Sleep(calls), req).await,
                "/server.FakeServer/StreamSleep" => {
                    grpc::<Empty, Empty>().server_streaming(StreamSleep, req).await
                }
                _ => {
                    let mut resp = http::Response::new(tonic::body::empty_body());
                    resp.headers_mut()
                        .insert("content-type", http::HeaderValue::from_static("application/grpc"));
                    resp.headers_mut()
                        .insert("grpc-status", http::HeaderValue::from_static("12"));
                    resp
                }
            };
            Ok(resp)
        })
    }
}

type UnaryFuture<T> = BoxFuture<'static, Result<Response<T>, Status>>;

struct Succeed;

impl UnaryService<Empty> for Succeed {
    type Response = Empty;
    type Future = UnaryFuture<Empty>;

    fn call(&mut self, _request: tonic::Request<Empty>) -> Self::Future {
        Box::pin(async { Ok(Response::new(Empty {})) })
    }
}

struct FailWithError;

impl UnaryService<Empty> for FailWithError {
    type Response = Empty;
    type Future = UnaryFuture<Empty>;

    fn call(&mut self, _request: tonic::Request<Empty>) -> Self::Future {
        Box::pin(async { Err(Status::unknown("test error")) })
    }
}

struct FailWithHttpError;

impl UnaryService<FailWithHttpErrorRequest> for FailWithHttpError {
    type Response = Empty;
    type Future = UnaryFuture<Empty>;

    fn call(&mut self, request: tonic::Request<FailWithHttpErrorRequest>) -> Self::Future {
        let code = request.into_inner().code as u16;
        Box::pin(async move { Err(dual_server::tunnel::errorf(code, code.to_string())) })
    }
}

struct Sleep(Arc<Calls>);

impl UnaryService<Empty> for Sleep {
    type Response = Empty;
    type Future = UnaryFuture<Empty>;

    fn call(&mut self, _request: tonic::Request<Empty>) -> Self::Future {
        let calls = Arc::clone(&self.0);
        Box::pin(async move {
            calls.sleeps_started.fetch_add(1, Ordering::SeqCst);
            let _ended = EndGuard(calls);
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(Response::new(Empty {}))
        })
    }
}

struct StreamSleep;

impl ServerStreamingService<Empty> for StreamSleep {
    type Response = Empty;
    type ResponseStream = BoxStream<'static, Result<Empty, Status>>;
    type Future = BoxFuture<'static, Result<Response<Self::ResponseStream>, Status>>;

    fn call(&mut self, _request: tonic::Request<Empty>) -> Self::Future {
        let stream = futures_util::stream::unfold(0u32, |sent| async move {
            if sent >= 100 {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            Some((Ok(Empty {}), sent + 1))
        });
        Box::pin(async move { Ok(Response::new(stream.boxed())) })
    }
}

/// Client for [`FakeServer`].
#[derive(Clone)]
pub struct FakeClient {
    grpc: tonic::client::Grpc<Channel>,
}

impl FakeClient {
    pub async fn connect(addr: SocketAddr) -> Self {
        let channel = Endpoint::from_shared(format!("http://{addr}"))
            .unwrap()
            .connect()
            .await
            .unwrap();
        Self {
            grpc: tonic::client::Grpc::new(channel),
        }
    }

    async fn unary<Req, Resp>(&mut self, method: &'static str, request: Req) -> Result<Resp, Status>
    where
        Req: prost::Message + Send + Sync + 'static,
        Resp: prost::Message + Default + Send + Sync + 'static,
    {
        self.grpc
            .ready()
            .await
            .map_err(|e| Status::unavailable(e.to_string()))?;
        let codec = ProstCodec::<Req, Resp>::default();
        self.grpc
            .unary(tonic::Request::new(request), PathAndQuery::from_static(method), codec)
            .await
            .map(Response::into_inner)
    }

    pub async fn succeed(&mut self) -> Result<Empty, Status> {
        self.unary("/server.FakeServer/Succeed", Empty {}).await
    }

    pub async fn fail_with_error(&mut self) -> Result<Empty, Status> {
        self.unary("/server.FakeServer/FailWithError", Empty {}).await
    }

    pub async fn fail_with_http_error(&mut self, code: i32) -> Result<Empty, Status> {
        self.unary("/server.FakeServer/FailWithHTTPError", FailWithHttpErrorRequest { code })
            .await
    }

    pub async fn sleep(&mut self) -> Result<Empty, Status> {
        self.unary("/server.FakeServer/Sleep", Empty {}).await
    }

    pub async fn stream_sleep(&mut self) -> Result<Streaming<Empty>, Status> {
        self.grpc
            .ready()
            .await
            .map_err(|e| Status::unavailable(e.to_string()))?;
        let codec = ProstCodec::<Empty, Empty>::default();
        self.grpc
            .server_streaming(
                tonic::Request::new(Empty {}),
                PathAndQuery::from_static("/server.FakeServer/StreamSleep"),
                codec,
            )
            .await
            .map(Response::into_inner)
    }
}

/// Listener on an ephemeral loopback port.
pub fn local_listener(enabled: bool) -> ListenerConfig {
    ListenerConfig {
        enabled,
        address: "127.0.0.1".into(),
        ..ListenerConfig::with_port(0)
    }
}

/// Both protocols on ephemeral loopback ports.
pub fn local_config() -> ServerConfig {
    ServerConfig {
        http: local_listener(true),
        grpc: local_listener(true),
        ..ServerConfig::default()
    }
}

/// Recorder whose contents can be rendered in assertions.
pub fn prometheus() -> (Arc<PrometheusRecorder>, PrometheusHandle) {
    let recorder = PrometheusBuilder::new()
        .set_buckets(DURATION_BUCKETS)
        .unwrap()
        .build_recorder();
    let handle = recorder.handle();
    (Arc::new(recorder), handle)
}

/// Builder that never installs OS signal handlers.
pub fn builder(config: ServerConfig) -> ServerBuilder {
    ServerBuilder::new(config).signal_handler(Arc::new(ManualStop::new()))
}

/// Build `builder` and run it in the background.
pub async fn start(builder: ServerBuilder) -> (Arc<Server>, JoinHandle<Result<(), ServerError>>) {
    let server = Arc::new(builder.build().await.unwrap());
    let running = Arc::clone(&server);
    let handle = tokio::spawn(async move { running.run().await });
    (server, handle)
}

pub fn http_client() -> reqwest::Client {
    reqwest::Client::builder().no_proxy().build().unwrap()
}

/// Run `call`, cancelling it after `after`.
pub async fn call_then_cancel<T, F>(after: Duration, call: F) -> Result<T, Status>
where
    F: std::future::Future<Output = Result<T, Status>>,
{
    let token = tokio_util::sync::CancellationToken::new();
    let canceler = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(after).await;
        canceler.cancel();
    });
    dual_server::grpc::with_cancellation(&token, call).await
}

/// Poll `check` until it holds or `timeout` passes.
pub async fn eventually(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
