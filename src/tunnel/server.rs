//! Server side of the HTTP-over-gRPC tunnel.
//!
//! # Responsibilities
//! - Expose `httpgrpc.HTTP/Handle` as a gRPC service
//! - Replay each decoded request against an axum [`Router`] in memory
//! - Promote 5xx responses to gRPC errors carrying the full response
//!
//! # Design Decisions
//! - Hand-written service instead of generated code; the protocol has a single
//!   unary method and the codec needs to observe encoded payloads
//! - The caller's extensions travel into the replayed request, so handlers see
//!   the same connection info and deadlines as a direct call
//! - Dropping the call drops the handler future, which is how cancellation
//!   reaches the router

use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::Router;
use http_body_util::BodyExt;
use tonic::body::BoxBody;
use tonic::server::{NamedService, UnaryService};
use tonic::Status;
use tower::{Service, ServiceExt};

use crate::tunnel::codec::TunnelCodec;
use crate::tunnel::pool::{default_pool, BufferPool};
use crate::tunnel::stats::{BufferRecycler, RpcStats, StatsHandler};
use crate::tunnel::status::error_from_http_response;
use crate::tunnel::types::{extend_map, headers_from_map, HttpRequest, HttpResponse, HANDLE_PATH, SERVICE_NAME};

/// Default cap on gRPC message sizes, in bytes.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

type BoxFuture<T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'static>>;

struct Inner {
    router: Router,
    pool: Arc<BufferPool>,
    stats: Arc<dyn StatsHandler>,
    max_decoding_message_size: usize,
    max_encoding_message_size: usize,
}

/// gRPC service answering `Handle` calls from an axum [`Router`].
#[derive(Clone)]
pub struct TunnelServer {
    inner: Arc<Inner>,
}

impl TunnelServer {
    /// Serve `router` using the process-wide buffer pool.
    pub fn new(router: Router) -> Self {
        TunnelServerBuilder::new(router).build()
    }

    pub fn builder(router: Router) -> TunnelServerBuilder {
        TunnelServerBuilder::new(router)
    }

    /// Run one tunneled request through the router.
    pub async fn handle(&self, request: tonic::Request<HttpRequest>) -> Result<tonic::Response<HttpResponse>, Status> {
        self.inner.handle(request).await
    }
}

/// Options for [`TunnelServer`].
pub struct TunnelServerBuilder {
    router: Router,
    pool: Option<Arc<BufferPool>>,
    stats: Option<Arc<dyn StatsHandler>>,
    max_decoding_message_size: usize,
    max_encoding_message_size: usize,
}

impl TunnelServerBuilder {
    pub fn new(router: Router) -> Self {
        Self {
            router,
            pool: None,
            stats: None,
            max_decoding_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            max_encoding_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }

    /// Use a dedicated buffer pool instead of the process-wide one.
    pub fn buffer_pool(mut self, pool: Arc<BufferPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Observe call events. The handler is wrapped, never replaced, by the
    /// buffer recycler.
    pub fn stats_handler(mut self, stats: Arc<dyn StatsHandler>) -> Self {
        self.stats = Some(stats);
        self
    }

    pub fn max_decoding_message_size(mut self, limit: usize) -> Self {
        self.max_decoding_message_size = limit;
        self
    }

    /// Also caps the size of a collected response body.
    pub fn max_encoding_message_size(mut self, limit: usize) -> Self {
        self.max_encoding_message_size = limit;
        self
    }

    pub fn build(self) -> TunnelServer {
        let pool = self.pool.unwrap_or_else(default_pool);
        let stats: Arc<dyn StatsHandler> = Arc::new(BufferRecycler::new(self.stats, Arc::clone(&pool)));
        TunnelServer {
            inner: Arc::new(Inner {
                router: self.router,
                pool,
                stats,
                max_decoding_message_size: self.max_decoding_message_size,
                max_encoding_message_size: self.max_encoding_message_size,
            }),
        }
    }
}

impl Inner {
    async fn handle(&self, request: tonic::Request<HttpRequest>) -> Result<tonic::Response<HttpResponse>, Status> {
        self.stats.handle_rpc(&mut RpcStats::Begin { method: HANDLE_PATH });
        let result = self.replay(request).await;
        self.stats.handle_rpc(&mut RpcStats::End {
            method: HANDLE_PATH,
            error: result.as_ref().err(),
        });
        result.map(tonic::Response::new)
    }

    async fn replay(&self, request: tonic::Request<HttpRequest>) -> Result<HttpResponse, Status> {
        let (_metadata, extensions, msg) = request.into_parts();

        let method = http::Method::from_bytes(msg.method.as_bytes())
            .map_err(|e| Status::invalid_argument(format!("invalid method {:?}: {e}", msg.method)))?;
        let uri: http::Uri = msg
            .url
            .parse()
            .map_err(|e| Status::invalid_argument(format!("invalid url {:?}: {e}", msg.url)))?;

        let mut req = http::Request::new(Body::from(msg.body));
        *req.method_mut() = method;
        *req.uri_mut() = uri;
        extend_map(req.headers_mut(), &msg.headers);
        *req.extensions_mut() = extensions;

        let resp = match self.router.clone().oneshot(req).await {
            Ok(resp) => resp,
            Err(never) => match never {},
        };
        let (parts, body) = resp.into_parts();

        let body = self.collect_body(body).await?;
        let response = HttpResponse {
            code: i32::from(parts.status.as_u16()),
            headers: headers_from_map(&parts.headers),
            body,
        };

        if response.is_server_error() {
            let status = error_from_http_response(&response);
            self.pool.put(response.body);
            return Err(status);
        }
        Ok(response)
    }

    async fn collect_body(&self, mut body: Body) -> Result<Vec<u8>, Status> {
        let mut buf = self.pool.get();
        while let Some(frame) = body.frame().await {
            let frame = match frame {
                Ok(frame) => frame,
                Err(e) => {
                    self.pool.put(buf);
                    return Err(Status::internal(format!("reading response body: {e}")));
                }
            };
            if let Ok(data) = frame.into_data() {
                if buf.len() + data.len() > self.max_encoding_message_size {
                    self.pool.put(buf);
                    let resp = HttpResponse::new(
                        http::StatusCode::INTERNAL_SERVER_ERROR.as_u16(),
                        format!(
                            "response body exceeds {} bytes",
                            self.max_encoding_message_size
                        ),
                    );
                    return Err(error_from_http_response(&resp));
                }
                buf.extend_from_slice(&data);
            }
        }
        Ok(buf)
    }
}

struct HandleSvc(Arc<Inner>);

impl UnaryService<HttpRequest> for HandleSvc {
    type Response = HttpResponse;
    type Future = BoxFuture<tonic::Response<Self::Response>, Status>;

    fn call(&mut self, request: tonic::Request<HttpRequest>) -> Self::Future {
        let inner = Arc::clone(&self.0);
        Box::pin(async move { inner.handle(request).await })
    }
}

impl<B> Service<http::Request<B>> for TunnelServer
where
    B: http_body::Body + Send + 'static,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>> + Send + 'static,
{
    type Response = http::Response<BoxBody>;
    type Error = Infallible;
    type Future = BoxFuture<Self::Response, Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: http::Request<B>) -> Self::Future {
        if req.uri().path() != HANDLE_PATH {
            let path = req.uri().path().to_owned();
            return Box::pin(async move { Ok(status_response(Status::unimplemented(format!("unknown method {path}")))) });
        }

        let inner = Arc::clone(&self.inner);
        Box::pin(async move {
            let codec = TunnelCodec::new(HANDLE_PATH, Arc::clone(&inner.stats));
            let mut grpc = tonic::server::Grpc::new(codec).apply_max_message_size_config(
                Some(inner.max_decoding_message_size),
                Some(inner.max_encoding_message_size),
            );
            Ok(grpc.unary(HandleSvc(inner), req).await)
        })
    }
}

/// A trailers-only gRPC response carrying `status`.
fn status_response(status: Status) -> http::Response<BoxBody> {
    let mut response = http::Response::new(tonic::body::empty_body());
    response.headers_mut().insert(
        http::header::CONTENT_TYPE,
        http::HeaderValue::from_static("application/grpc"),
    );
    if let Err(e) = status.add_header(response.headers_mut()) {
        tracing::error!(error = %e, "Failed to encode status headers");
    }
    response
}

impl NamedService for TunnelServer {
    const NAME: &'static str = SERVICE_NAME;
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::get;
    use http::StatusCode;

    use crate::tunnel::status::http_response_from_status;
    use crate::tunnel::types::Header;

    fn router() -> Router {
        Router::new()
            .route("/hello", get(|| async { "world" }))
            .route("/boom", get(|| async { (StatusCode::SERVICE_UNAVAILABLE, "down") }))
            .route(
                "/echo-header",
                get(|headers: http::HeaderMap| async move {
                    headers
                        .get("x-thing")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or_default()
                        .to_owned()
                }),
            )
            .route("/big", get(|| async { vec![b'x'; 64] }))
    }

    fn request(url: &str) -> tonic::Request<HttpRequest> {
        tonic::Request::new(HttpRequest {
            method: "GET".into(),
            url: url.into(),
            headers: vec![Header {
                key: "X-Thing".into(),
                values: vec!["value".into()],
            }],
            body: Vec::new(),
        })
    }

    #[tokio::test]
    async fn replays_request_against_router() {
        let server = TunnelServer::builder(router())
            .buffer_pool(Arc::new(BufferPool::new(4)))
            .build();
        let resp = server.handle(request("/hello")).await.unwrap().into_inner();
        assert_eq!(resp.code, 200);
        assert_eq!(resp.body, b"world");

        let resp = server.handle(request("/echo-header")).await.unwrap().into_inner();
        assert_eq!(resp.body, b"value");
    }

    #[tokio::test]
    async fn server_errors_become_status_details() {
        let pool = Arc::new(BufferPool::new(4));
        let server = TunnelServer::builder(router()).buffer_pool(pool.clone()).build();

        let status = server.handle(request("/boom")).await.unwrap_err();
        assert_eq!(status.code(), tonic::Code::Unavailable);
        let resp = http_response_from_status(&status).unwrap();
        assert_eq!(resp.code, 503);
        assert_eq!(resp.body, b"down");
        assert_eq!(pool.len(), 1);
    }

    #[tokio::test]
    async fn oversized_bodies_are_rejected() {
        let server = TunnelServer::builder(router())
            .buffer_pool(Arc::new(BufferPool::new(4)))
            .max_encoding_message_size(16)
            .build();
        let status = server.handle(request("/big")).await.unwrap_err();
        assert_eq!(http_response_from_status(&status).unwrap().code, 500);
    }

    #[tokio::test]
    async fn invalid_urls_are_rejected() {
        let server = TunnelServer::new(router());
        let status = server.handle(request("http://[bad")).await.unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
    }
}
