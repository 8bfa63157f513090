//! End-to-end tests: client → proxy → upstream over every forwarding path.

mod common;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use axum::{routing::get, Router};
use common::{client, proxy_config, start_proxy, start_server, start_upstream};
use futures_util::{SinkExt, StreamExt};
use h2_bridge::config::{CookieRewriteConfig, RouteConfig};
use h2_bridge::{Bypass, HttpServer, NormalizedRoute, RouteTable};
use serde_json::Value;
use tokio_tungstenite::tungstenite::Message;

fn api_route(upstream: std::net::SocketAddr) -> RouteConfig {
    let mut route = RouteConfig::new("api", "/api", format!("http://{}", upstream));
    route.path_rewrite = vec![("^/api".to_string(), String::new())];
    route
}

#[tokio::test]
async fn forwards_over_pooled_h2_session() {
    let upstream = start_upstream(100).await;
    let proxy = start_proxy(proxy_config(vec![api_route(upstream)])).await;

    let response = client()
        .get(proxy.url("/api/echo?x=1"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["method"], "GET");
    assert_eq!(body["path"], "/echo?x=1");
    assert_eq!(body["headers"]["x-forwarded-for"], "127.0.0.1");
    assert_eq!(body["headers"]["x-forwarded-proto"], "http");

    // Second request reuses the same session.
    client().get(proxy.url("/api/echo")).send().await.unwrap();
    assert_eq!(proxy.engine.pool().len(), 1);
    proxy.shutdown.trigger();
}

#[tokio::test]
async fn streams_request_body_upstream() {
    let upstream = start_upstream(100).await;
    let proxy = start_proxy(proxy_config(vec![api_route(upstream)])).await;

    let payload = serde_json::json!({"name": "bridge", "items": [1, 2, 3]});
    let response = client()
        .post(proxy.url("/api/echo"))
        .json(&payload)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["method"], "POST");
    assert_eq!(body["headers"]["content-type"], "application/json");
    let echoed: Value = serde_json::from_str(body["body"].as_str().unwrap()).unwrap();
    assert_eq!(echoed, payload);
}

#[tokio::test]
async fn forced_http1_bypasses_the_pool() {
    let upstream = start_upstream(100).await;
    let mut route = api_route(upstream);
    route.force_http1 = true;
    route.headers = BTreeMap::from([("x-route".to_string(), "api".to_string())]);
    let proxy = start_proxy(proxy_config(vec![route])).await;

    let response = client()
        .post(proxy.url("/api/echo/deep"))
        .body("payload")
        .send()
        .await
        .unwrap();
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["path"], "/echo/deep");
    assert_eq!(body["body"], "payload");
    assert_eq!(body["headers"]["x-route"], "api");
    assert_eq!(body["headers"]["host"], upstream.to_string());
    assert!(proxy.engine.pool().is_empty());
}

#[tokio::test]
async fn auto_detect_uses_h2_when_supported() {
    let upstream = start_upstream(100).await;
    let mut route = api_route(upstream);
    route.auto_detect_protocol = true;
    let proxy = start_proxy(proxy_config(vec![route])).await;

    let response = client().get(proxy.url("/api/echo")).send().await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(proxy.engine.pool().len(), 1);
    assert_eq!(proxy.engine.protocol_support().len(), 1);
}

#[tokio::test]
async fn rewrites_set_cookie_attributes() {
    let upstream = start_upstream(100).await;
    let mut route = api_route(upstream);
    route.cookie_domain_rewrite = Some(CookieRewriteConfig::Map(BTreeMap::from([(
        "backend.local".to_string(),
        "proxy.local".to_string(),
    )])));
    route.cookie_path_rewrite = Some(CookieRewriteConfig::All("/".to_string()));
    let proxy = start_proxy(proxy_config(vec![route])).await;

    let response = client().get(proxy.url("/api/cookie")).send().await.unwrap();
    let cookie = response.headers().get("set-cookie").unwrap().to_str().unwrap();
    assert_eq!(cookie, "sid=abc; Domain=proxy.local; Path=/; HttpOnly");
}

#[tokio::test]
async fn sse_route_sets_streaming_headers() {
    let upstream = start_upstream(100).await;
    let mut route = api_route(upstream);
    route.sse = true;
    let proxy = start_proxy(proxy_config(vec![route])).await;

    let response = client().get(proxy.url("/api/sse")).send().await.unwrap();
    assert_eq!(response.headers()["content-type"], "text/event-stream");
    assert_eq!(response.headers()["cache-control"], "no-cache");
    assert_eq!(response.headers()["x-accel-buffering"], "no");
    assert_eq!(response.text().await.unwrap(), "data: one\n\ndata: two\n\n");
}

#[tokio::test]
async fn follow_redirects_makes_location_relative() {
    let upstream = start_upstream(100).await;
    let mut route = api_route(upstream);
    route.follow_redirects = true;
    let proxy = start_proxy(proxy_config(vec![route])).await;

    let response = client().get(proxy.url("/api/redirect")).send().await.unwrap();
    assert_eq!(response.status(), 302);
    assert_eq!(response.headers()["location"], "/echo?from=redirect");
}

#[tokio::test]
async fn slow_upstream_times_out() {
    let upstream = start_upstream(100).await;
    let mut route = api_route(upstream);
    route.proxy_timeout_ms = Some(200);
    let proxy = start_proxy(proxy_config(vec![route])).await;

    let response = client().get(proxy.url("/api/slow")).send().await.unwrap();
    assert_eq!(response.status(), 504);
}

#[tokio::test]
async fn requests_beyond_stream_limit_wait_their_turn() {
    let upstream = start_upstream(1).await;
    let proxy = start_proxy(proxy_config(vec![api_route(upstream)])).await;
    client().get(proxy.url("/api/echo")).send().await.unwrap();

    let started = std::time::Instant::now();
    let (a, b) = tokio::join!(
        client().get(proxy.url("/api/slow")).send(),
        client().get(proxy.url("/api/slow")).send(),
    );
    assert_eq!(a.unwrap().status(), 200);
    assert_eq!(b.unwrap().status(), 200);
    assert!(started.elapsed() >= Duration::from_millis(1900));
    assert!(proxy.engine.queue().is_empty());
}

#[tokio::test]
async fn queued_request_times_out() {
    let upstream = start_upstream(1).await;
    let mut config = proxy_config(vec![api_route(upstream)]);
    config.queue.timeout_ms = 100;
    let proxy = start_proxy(config).await;
    client().get(proxy.url("/api/echo")).send().await.unwrap();

    let slow = tokio::spawn(client().get(proxy.url("/api/slow")).send());
    tokio::time::sleep(Duration::from_millis(150)).await;
    let queued = client().get(proxy.url("/api/echo")).send().await.unwrap();

    assert_eq!(queued.status(), 503);
    assert_eq!(slow.await.unwrap().unwrap().status(), 200);
}

#[tokio::test]
async fn tunnels_websocket_frames() {
    let upstream = start_upstream(100).await;
    let mut route = RouteConfig::new("ws", "/ws", format!("http://{}", upstream));
    route.ws = true;
    let proxy = start_proxy(proxy_config(vec![route])).await;

    let (mut socket, response) = tokio_tungstenite::connect_async(format!("ws://{}/ws", proxy.addr))
        .await
        .unwrap();
    assert_eq!(response.status(), 101);

    socket.send(Message::text("ping")).await.unwrap();
    let reply = socket.next().await.unwrap().unwrap();
    assert_eq!(reply.into_text().unwrap().as_str(), "ping");
    socket.close(None).await.unwrap();
}

#[tokio::test]
async fn unmatched_path_is_not_found() {
    let upstream = start_upstream(100).await;
    let proxy = start_proxy(proxy_config(vec![api_route(upstream)])).await;

    let response = client().get(proxy.url("/elsewhere")).send().await.unwrap();
    assert_eq!(response.status(), 404);
    assert_eq!(response.text().await.unwrap(), "No matching route found");
}

#[tokio::test]
async fn unreachable_upstream_is_bad_gateway() {
    let route = RouteConfig::new("dead", "/", "http://127.0.0.1:1");
    let proxy = start_proxy(proxy_config(vec![route])).await;

    let response = client().get(proxy.url("/anything")).send().await.unwrap();
    assert_eq!(response.status(), 502);
    assert!(proxy.engine.pool().is_empty());
}

#[tokio::test]
async fn bypass_hands_request_to_local_router() {
    let upstream = start_upstream(100).await;
    let route = NormalizedRoute::builder(api_route(upstream))
        .bypass(|req| {
            if req.uri().path().ends_with("/local") {
                Bypass::Skip
            } else {
                Bypass::Proxy
            }
        })
        .build()
        .unwrap();

    let server = HttpServer::new(proxy_config(Vec::new()))
        .unwrap()
        .with_routes(RouteTable::new(vec![Arc::new(route)]))
        .with_local(Router::new().route("/api/local", get(|| async { "handled locally" })));
    let proxy = start_server(server).await;

    let local = client().get(proxy.url("/api/local")).send().await.unwrap();
    assert_eq!(local.text().await.unwrap(), "handled locally");

    let proxied = client().get(proxy.url("/api/echo")).send().await.unwrap();
    let body: Value = proxied.json().await.unwrap();
    assert_eq!(body["path"], "/echo");
}

#[tokio::test]
async fn shutdown_closes_pooled_sessions() {
    let upstream = start_upstream(100).await;
    let proxy = start_proxy(proxy_config(vec![api_route(upstream)])).await;
    client().get(proxy.url("/api/echo")).send().await.unwrap();
    assert_eq!(proxy.engine.pool().len(), 1);

    proxy.shutdown.trigger();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(proxy.engine.pool().is_empty());
}
