// tests/common/mod.rs
//
// Shared helpers: build the router in-process and drive it with `oneshot`.
#![allow(dead_code)]

use axum::{
    body::{self, Body},
    http::{HeaderMap, Request, StatusCode},
    Router,
};
use serde_json::Value;
use tower::ServiceExt as _;

use nudge_pipeline::{api, services::Services, AppState, GatewayConfig};

pub const BODY_LIMIT: usize = 1024 * 1024;

pub fn config() -> GatewayConfig {
    GatewayConfig::default()
}

pub fn app(cfg: GatewayConfig) -> Router {
    nudge_pipeline::build_app(cfg).expect("router builds")
}

pub fn app_with_services(cfg: GatewayConfig, services: Services) -> Router {
    let state = AppState::with_services(cfg, services).expect("state builds");
    api::router(state)
}

pub struct Reply {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub json: Value,
}

pub async fn send(app: &Router, req: Request<Body>) -> Reply {
    let resp = app.clone().oneshot(req).await.expect("oneshot");
    let status = resp.status();
    let headers = resp.headers().clone();
    let bytes = body::to_bytes(resp.into_body(), BODY_LIMIT)
        .await
        .expect("read body");
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or_else(|_| {
            Value::String(String::from_utf8_lossy(&bytes).into_owned())
        })
    };
    Reply {
        status,
        headers,
        json,
    }
}

pub fn post_json(uri: &str, payload: &Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(payload.to_string()))
        .expect("build POST")
}

pub fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(uri)
        .body(Body::empty())
        .expect("build GET")
}

pub async fn serve(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("serve");
    });
    format!("http://{addr}")
}
