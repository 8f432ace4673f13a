//! HTTP-over-gRPC tunnel against a running server.

mod common;

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::routing::{get, post};
use axum::Router;
use http_body_util::BodyExt;
use parking_lot::Mutex;

use common::*;
use dual_server::tunnel::stats::{RpcStats, StatsHandler};
use dual_server::tunnel::{http_response_from_error, HttpRequest, TunnelClient};

fn router() -> Router {
    Router::new()
        .route(
            "/payment",
            get(|| async { (StatusCode::PAYMENT_REQUIRED, [("x-reason", "quota")], "402") }),
        )
        .route("/echo", post(|body: String| async move { body.to_uppercase() }))
        .route(
            "/broken",
            get(|| async { (StatusCode::SERVICE_UNAVAILABLE, "down") }),
        )
}

async fn body_text(resp: axum::response::Response) -> String {
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[tokio::test]
async fn forwards_requests_to_the_router() {
    let mut config = local_config();
    config.http_server.path_prefix = "/api".into();
    let (server, running) = start(builder(config).router(router())).await;

    let client = TunnelClient::new(&format!("direct://{}", server.grpc_listen_addr().unwrap())).unwrap();

    let resp = client
        .handle(Request::get("/api/payment").body(Body::empty()).unwrap())
        .await;
    assert_eq!(resp.status(), StatusCode::PAYMENT_REQUIRED);
    assert_eq!(resp.headers()["x-reason"], "quota");
    assert_eq!(body_text(resp).await, "402");

    let resp = client
        .handle(Request::post("/api/echo").body(Body::from("tunnel")).unwrap())
        .await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_text(resp).await, "TUNNEL");

    server.stop();
    running.await.unwrap().unwrap();
    server.shutdown().await;
}

#[tokio::test]
async fn server_errors_travel_as_statuses() {
    let (server, running) = start(builder(local_config()).router(router())).await;
    let client = TunnelClient::new(&format!("direct://{}", server.grpc_listen_addr().unwrap())).unwrap();

    let request = HttpRequest {
        method: "GET".into(),
        url: "/broken".into(),
        headers: Vec::new(),
        body: Vec::new(),
    };
    let err = client.call(tonic::Request::new(request)).await.unwrap_err();
    let embedded = http_response_from_error(&err).unwrap();
    assert_eq!(embedded.code, 503);
    assert_eq!(embedded.body, b"down");

    let resp = client
        .handle(Request::get("/broken").body(Body::empty()).unwrap())
        .await;
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body_text(resp).await, "down");

    server.stop();
    running.await.unwrap().unwrap();
    server.shutdown().await;
}

#[derive(Default)]
struct Events(Mutex<Vec<String>>);

impl StatsHandler for Events {
    fn handle_rpc(&self, stats: &mut RpcStats<'_>) {
        let event = match stats {
            RpcStats::Begin { .. } => "begin",
            RpcStats::End { .. } => "end",
            _ => return,
        };
        self.0.lock().push(event.to_string());
    }
}

#[tokio::test]
async fn stats_handler_sees_tunnel_calls() {
    let events = Arc::new(Events::default());
    let (server, running) = start(
        builder(local_config())
            .router(router())
            .tunnel_stats_handler(events.clone()),
    )
    .await;

    let client = TunnelClient::new(&format!("direct://{}", server.grpc_listen_addr().unwrap())).unwrap();
    let resp = client
        .handle(Request::post("/echo").body(Body::from("x")).unwrap())
        .await;
    assert_eq!(resp.status(), StatusCode::OK);

    assert_eq!(*events.0.lock(), vec!["begin".to_string(), "end".to_string()]);

    server.stop();
    running.await.unwrap().unwrap();
    server.shutdown().await;
}
