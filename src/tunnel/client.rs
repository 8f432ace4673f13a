//! Client side of the HTTP-over-gRPC tunnel.
//!
//! # Responsibilities
//! - Encode an inbound HTTP request and forward it over `Handle`
//! - Turn the reply, or a tunneled error, back into an HTTP response
//! - Dial direct addresses or balance across a resolved service
//!
//! # Design Decisions
//! - A tonic `Channel` is cheap to clone and multiplexes concurrent calls, so
//!   the client holds no locks
//! - Errors without an embedded response become a 500 with the error text

use std::convert::Infallible;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::body::Body;
use futures_util::future::BoxFuture;
use http::uri::PathAndQuery;
use http::{Request, Response, StatusCode};
use http_body_util::BodyExt;
use tokio_util::sync::{CancellationToken, DropGuard};
use tonic::codec::ProstCodec;
use tonic::transport::{Channel, Endpoint};
use tower::Service;

use crate::tunnel::error::TunnelError;
use crate::tunnel::resolver::{watch_endpoints, DnsResolver, EndpointResolver, Target, DEFAULT_RESOLVE_INTERVAL};
use crate::tunnel::status::http_response_from_error;
use crate::tunnel::types::{extend_map, headers_from_map, HttpRequest, HttpResponse, HANDLE_PATH};

/// Capacity of the membership-change channel feeding a balanced channel.
const CHANGE_BUFFER: usize = 64;

/// Forwards HTTP requests to a remote `httpgrpc.HTTP` service.
///
/// Must be created inside a tokio runtime: connections are established lazily
/// and service targets spawn a background resolver task, which stops once
/// every clone of the client is dropped.
#[derive(Clone)]
pub struct TunnelClient {
    grpc: tonic::client::Grpc<Channel>,
    _watch: Option<Arc<DropGuard>>,
}

impl TunnelClient {
    /// Connect to `address`, resolving services through cluster DNS.
    pub fn new(address: &str) -> Result<Self, TunnelError> {
        Self::with_resolver(address, Arc::new(DnsResolver), DEFAULT_RESOLVE_INTERVAL)
    }

    /// Connect to `address` with a custom endpoint source.
    pub fn with_resolver(
        address: &str,
        resolver: Arc<dyn EndpointResolver>,
        resolve_interval: Duration,
    ) -> Result<Self, TunnelError> {
        match Target::parse(address)? {
            Target::Direct(authority) => {
                let channel = Endpoint::from_shared(format!("http://{authority}"))?.connect_lazy();
                tracing::debug!(address = %authority, "Tunnel client dialling directly");
                Ok(Self::from_channel(channel))
            }
            Target::Service(target) => {
                let (channel, changes) = Channel::balance_channel(CHANGE_BUFFER);
                let cancel = CancellationToken::new();
                tracing::debug!(target = %target, "Tunnel client balancing across service");
                tokio::spawn(watch_endpoints(
                    resolver,
                    target,
                    changes,
                    resolve_interval,
                    cancel.clone(),
                ));
                Ok(Self {
                    grpc: tonic::client::Grpc::new(channel),
                    _watch: Some(Arc::new(cancel.drop_guard())),
                })
            }
        }
    }

    /// Use an existing channel.
    pub fn from_channel(channel: Channel) -> Self {
        Self {
            grpc: tonic::client::Grpc::new(channel),
            _watch: None,
        }
    }

    pub fn max_decoding_message_size(mut self, limit: usize) -> Self {
        self.grpc = self.grpc.max_decoding_message_size(limit);
        self
    }

    pub fn max_encoding_message_size(mut self, limit: usize) -> Self {
        self.grpc = self.grpc.max_encoding_message_size(limit);
        self
    }

    /// Issue a raw `Handle` call.
    pub async fn call(&self, request: tonic::Request<HttpRequest>) -> Result<HttpResponse, TunnelError> {
        let mut grpc = self.grpc.clone();
        grpc.ready()
            .await
            .map_err(|e| TunnelError::from(e).context("service was not ready"))?;
        let resp = grpc
            .unary(
                request,
                PathAndQuery::from_static(HANDLE_PATH),
                ProstCodec::<HttpRequest, HttpResponse>::default(),
            )
            .await?;
        Ok(resp.into_inner())
    }

    /// Forward `req` and return the remote response. Never fails: transport
    /// and remote errors are rendered as HTTP responses.
    pub async fn handle(&self, req: Request<Body>) -> Response<Body> {
        let resp = match self.forward(req).await {
            Ok(resp) => resp,
            Err(err) => match http_response_from_error(&err) {
                Some(resp) => resp,
                None => {
                    tracing::debug!(error = %err, "Tunneled request failed");
                    let mut resp = Response::new(Body::from(err.to_string()));
                    *resp.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                    return resp;
                }
            },
        };
        into_http(resp)
    }

    async fn forward(&self, req: Request<Body>) -> Result<HttpResponse, TunnelError> {
        let (parts, body) = req.into_parts();
        let body = body.collect().await.map_err(request_body_error)?.to_bytes();

        let url = parts
            .uri
            .path_and_query()
            .map(PathAndQuery::as_str)
            .unwrap_or("/")
            .to_owned();
        let msg = HttpRequest {
            method: parts.method.as_str().to_owned(),
            url,
            headers: headers_from_map(&parts.headers),
            body: body.to_vec(),
        };
        self.call(tonic::Request::new(msg)).await
    }
}

fn into_http(resp: HttpResponse) -> Response<Body> {
    let status = u16::try_from(resp.code)
        .ok()
        .and_then(|code| StatusCode::from_u16(code).ok())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut out = Response::new(Body::from(resp.body));
    *out.status_mut() = status;
    extend_map(out.headers_mut(), &resp.headers);
    out
}

impl Service<Request<Body>> for TunnelClient {
    type Response = Response<Body>;
    type Error = Infallible;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let client = self.clone();
        Box::pin(async move { Ok(client.handle(req).await) })
    }
}

/// A body over the size limit is the request's fault; any other read
/// failure means the caller went away mid-request.
fn request_body_error(err: axum::Error) -> TunnelError {
    let err = err.into_inner();
    let kind = if is_length_limit(&*err) {
        TunnelError::InvalidRequest(err.to_string())
    } else {
        tracing::debug!(error = %err, "Request body ended early");
        TunnelError::Canceled
    };
    kind.context("reading request body")
}

fn is_length_limit(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(err) = current {
        if err.is::<http_body_util::LengthLimitError>() {
            return true;
        }
        current = err.source();
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::status::STATUS_CLIENT_CLOSED_REQUEST;

    #[tokio::test]
    async fn unsupported_scheme_fails_at_construction() {
        assert!(matches!(
            TunnelClient::new("consul://svc:80"),
            Err(TunnelError::UnsupportedScheme(_))
        ));
    }

    #[tokio::test]
    async fn unreachable_backend_answers_500() {
        // Port 1 is never listening in the test environment.
        let client = TunnelClient::new("direct://127.0.0.1:1").unwrap();
        let resp = client.handle(Request::new(Body::empty())).await;
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn aborted_request_body_answers_499() {
        let client = TunnelClient::new("direct://127.0.0.1:1").unwrap();
        let chunks = futures_util::stream::iter(vec![
            Ok(bytes::Bytes::from_static(b"part")),
            Err(std::io::Error::from(std::io::ErrorKind::ConnectionReset)),
        ]);
        let req = Request::post("/upload").body(Body::from_stream(chunks)).unwrap();

        let resp = client.handle(req).await;
        assert_eq!(resp.status().as_u16(), STATUS_CLIENT_CLOSED_REQUEST);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body, "reading request body: context canceled");
    }

    #[tokio::test]
    async fn oversized_request_body_is_not_a_cancellation() {
        let client = TunnelClient::new("direct://127.0.0.1:1").unwrap();
        let limited = http_body_util::Limited::new(Body::from("too long"), 3);
        let req = Request::post("/upload").body(Body::new(limited)).unwrap();

        let err = client.forward(req).await.unwrap_err();
        assert!(!err.is_canceled());
        assert!(matches!(err.root(), TunnelError::InvalidRequest(_)));
    }

    #[test]
    fn invalid_codes_fall_back_to_500() {
        let resp = into_http(HttpResponse::new(0, Vec::new()));
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let resp = into_http(HttpResponse::new(402, b"402".to_vec()));
        assert_eq!(resp.status(), StatusCode::PAYMENT_REQUIRED);
    }
}
