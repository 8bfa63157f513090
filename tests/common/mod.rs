//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    http::{header, HeaderMap, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::{any, get},
    Json, Router,
};
use h2_bridge::config::{ProxyConfig, RouteConfig};
use h2_bridge::{HttpServer, ProxyEngine, Shutdown};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use hyper_util::service::TowerToHyperService;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

/// Start an upstream that speaks HTTP/1.1 and h2c (prior knowledge) and
/// advertises `max_concurrent_streams` to HTTP/2 clients.
pub async fn start_upstream(max_concurrent_streams: u32) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = upstream_router(addr);

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let service = TowerToHyperService::new(app.clone());
            tokio::spawn(async move {
                let mut builder = auto::Builder::new(TokioExecutor::new());
                builder.http2().max_concurrent_streams(max_concurrent_streams);
                let _ = builder
                    .serve_connection_with_upgrades(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    addr
}

fn upstream_router(addr: SocketAddr) -> Router {
    Router::new()
        .route("/echo", any(echo))
        .route("/echo/{*rest}", any(echo))
        .route("/cookie", get(cookie))
        .route("/sse", get(sse))
        .route("/slow", get(slow))
        .route("/ws", get(ws_echo))
        .route(
            "/redirect",
            get(move || async move {
                (
                    StatusCode::FOUND,
                    [(header::LOCATION, format!("http://{}/echo?from=redirect", addr))],
                )
            }),
        )
}

async fn echo(method: Method, uri: Uri, headers: HeaderMap, body: Bytes) -> Json<Value> {
    let headers: BTreeMap<String, String> = headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                value.to_str().unwrap_or_default().to_string(),
            )
        })
        .collect();
    Json(json!({
        "method": method.as_str(),
        "path": uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/"),
        "headers": headers,
        "body": String::from_utf8_lossy(&body),
    }))
}

async fn cookie() -> Response {
    (
        [
            (header::SET_COOKIE, "sid=abc; Domain=backend.local; Path=/app; HttpOnly"),
            (header::CONTENT_TYPE, "text/plain"),
        ],
        "cookie set",
    )
        .into_response()
}

async fn sse() -> Response {
    (
        [(header::CONTENT_TYPE, "text/event-stream")],
        "data: one\n\ndata: two\n\n",
    )
        .into_response()
}

async fn slow() -> &'static str {
    tokio::time::sleep(Duration::from_millis(1000)).await;
    "slow"
}

async fn ws_echo(ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(|mut socket: WebSocket| async move {
        while let Some(Ok(message)) = socket.recv().await {
            match message {
                Message::Text(text) => {
                    if socket.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    })
}

/// Running proxy under test.
pub struct TestProxy {
    pub addr: SocketAddr,
    pub engine: Arc<ProxyEngine>,
    pub shutdown: Shutdown,
}

impl TestProxy {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }
}

pub fn proxy_config(routes: Vec<RouteConfig>) -> ProxyConfig {
    let mut config = ProxyConfig::default();
    config.listener.bind_address = "127.0.0.1:0".to_string();
    config.routes = routes;
    config
}

pub async fn start_proxy(config: ProxyConfig) -> TestProxy {
    start_server(HttpServer::new(config).unwrap()).await
}

pub async fn start_server(server: HttpServer) -> TestProxy {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let engine = server.engine().clone();
    let shutdown = Shutdown::new();
    let stop = shutdown.subscribe();
    let (_updates_tx, updates) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let _ = server.run(listener, updates, stop).await;
    });
    tokio::time::sleep(Duration::from_millis(20)).await;

    TestProxy {
        addr,
        engine,
        shutdown,
    }
}

pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .timeout(Duration::from_secs(10))
        .build()
        .unwrap()
}
