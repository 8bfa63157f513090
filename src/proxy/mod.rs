//! Forwarding engine.
//!
//! # Data Flow
//! ```text
//! handle_request(req, route, next)
//!     → bypass hook: Skip / Rewrite → next handler
//!     → target (router or static) → path rewrite
//!     → protocol selection
//!         → WebSocket: websocket.rs raw tunnel
//!         → HTTP/2:    headers.rs → h2_forward.rs (pool + queue)
//!         → HTTP/1.1:  headers.rs → h1_forward.rs (single-use connection)
//!     → response.rs (redirects, cookies, SSE, hooks) → client
//! ```
//!
//! # Design Decisions
//! - Pool, queue and support cache belong to the engine; nothing is global
//! - Every failure becomes a `ProxyError` response; nothing panics
//! - Stream slots are released by RAII, so every exit path drains the queue

pub mod cookies;
pub mod h1_forward;
pub mod h2_forward;
pub mod headers;
pub mod response;
pub mod route;
pub mod websocket;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{request, Request, StatusCode, Uri};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use url::Url;

use crate::config::EngineConfig;
use crate::error::ProxyError;
use crate::net::UpstreamTls;
use crate::observability::metrics;
use crate::pool::{ConnectionPool, Origin};
use crate::protocol::{select_protocol, Http1Reason, Protocol, ProtocolSupportCache};

use h2_forward::{AdmissionQueue, H2Request};
use headers::{translate_request_headers, ClientInfo, ClientTls};
use response::relay_response;
use route::{Bypass, NormalizedRoute};

/// Translates inbound requests onto pooled HTTP/2, direct HTTP/1.1 or a
/// WebSocket tunnel.
pub struct ProxyEngine {
    pool: Arc<ConnectionPool>,
    queue: AdmissionQueue,
    support: ProtocolSupportCache,
    tls: UpstreamTls,
    connect_timeout: Duration,
}

impl ProxyEngine {
    pub fn new(config: EngineConfig) -> Result<Self, ProxyError> {
        let tls = UpstreamTls::new()?;
        let connect_timeout = config.pool.connect_timeout();
        Ok(Self {
            pool: Arc::new(ConnectionPool::new(config.pool, tls.clone())),
            queue: AdmissionQueue::new(&config.queue),
            support: ProtocolSupportCache::new(&config.protocol, tls.clone()),
            tls,
            connect_timeout,
        })
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn queue(&self) -> &AdmissionQueue {
        &self.queue
    }

    pub fn protocol_support(&self) -> &ProtocolSupportCache {
        &self.support
    }

    /// Proxy an ordinary request, or hand it to `next` when the route's
    /// bypass hook declines it.
    pub async fn handle_request(&self, mut req: Request<Body>, route: &NormalizedRoute, next: Next) -> Response {
        if let Some(bypass) = &route.bypass {
            match bypass(&req) {
                Bypass::Proxy => {}
                Bypass::Skip => {
                    tracing::debug!(route = %route.name, path = %req.uri().path(), "Bypassing proxy");
                    return next.run(req).await;
                }
                Bypass::Rewrite(target) => {
                    match target.parse::<Uri>() {
                        Ok(uri) => *req.uri_mut() = uri,
                        Err(e) => tracing::warn!(route = %route.name, target = %target, error = %e, "Ignoring invalid bypass rewrite"),
                    }
                    return next.run(req).await;
                }
            }
        }

        self.forward(req, route, None).await
    }

    /// Tunnel a WebSocket upgrade.
    pub async fn handle_upgrade(&self, req: Request<Body>, route: &NormalizedRoute) -> Response {
        self.forward(req, route, Some(Protocol::WebSocket)).await
    }

    /// Reject queued requests, close upstream sessions and forget probe
    /// results. Safe to call more than once.
    pub fn shutdown(&self) {
        tracing::info!(
            queued = self.queue.len(),
            sessions = self.pool.len(),
            "Shutting down proxy engine"
        );
        self.queue.clear();
        self.pool.close_all();
        self.support.clear();
    }

    async fn forward(&self, req: Request<Body>, route: &NormalizedRoute, forced: Option<Protocol>) -> Response {
        let start = Instant::now();
        let method = req.method().to_string();
        let path = req.uri().path().to_string();
        let mut chosen = None;

        let result = self.dispatch(req, route, forced, &mut chosen).await;
        let protocol = chosen.map_or("none", |p: Protocol| p.as_str());
        let duration_ms = start.elapsed().as_millis() as u64;

        match result {
            Ok(response) => {
                let status = response.status();
                tracing::info!(
                    route = %route.name,
                    method = %method,
                    path = %path,
                    status = status.as_u16(),
                    protocol,
                    duration_ms,
                    "Proxied request"
                );
                metrics::record_request(&method, status.as_u16(), protocol, start);
                response
            }
            Err(e) => {
                if e.is_configuration_error() {
                    tracing::error!(route = %route.name, method = %method, path = %path, error = %e, "Route misconfigured");
                } else {
                    tracing::warn!(
                        route = %route.name,
                        method = %method,
                        path = %path,
                        protocol,
                        duration_ms,
                        error = %e,
                        "Proxy request failed"
                    );
                }
                metrics::record_request(&method, e.status().as_u16(), protocol, start);
                e.into_response()
            }
        }
    }

    async fn dispatch(
        &self,
        req: Request<Body>,
        route: &NormalizedRoute,
        forced: Option<Protocol>,
        chosen: &mut Option<Protocol>,
    ) -> Result<Response, ProxyError> {
        let (mut parts, body) = req.into_parts();

        let target = route.resolve_target(&parts)?;
        let origin = Origin::from_url(&target)
            .ok_or_else(|| ProxyError::InvalidProxyTarget(target.to_string()))?;
        let path_and_query = outbound_path(route, &target, &parts.uri)?;

        let protocol = match forced {
            Some(protocol) => protocol,
            None => select_protocol(route, &parts.headers, &origin, &self.support).await,
        };
        *chosen = Some(protocol);
        tracing::debug!(
            route = %route.name,
            origin = %origin,
            path = %path_and_query,
            protocol = protocol.as_str(),
            "Forwarding request"
        );

        if protocol == Protocol::WebSocket {
            let req = Request::from_parts(parts, body);
            let response =
                websocket::tunnel(&self.tls, self.connect_timeout, route, &origin, &path_and_query, req).await?;
            return Ok(if response.status() == StatusCode::SWITCHING_PROTOCOLS {
                response
            } else {
                relay_response(route, response).await
            });
        }

        let client = client_info(&parts);
        let websocket_route = protocol == Protocol::Http1(Http1Reason::WebSocketRoute);
        parts.headers = translate_request_headers(&parts.headers, route, client, websocket_route)?;
        parts.uri = path_and_query
            .parse()
            .map_err(|_| ProxyError::MissingRequestUrl)?;
        if let Some(hooks) = &route.hooks {
            hooks.on_proxy_request(&mut parts, route);
        }

        let response = match protocol {
            Protocol::Http2 => {
                let request = H2Request {
                    path_and_query: parts
                        .uri
                        .path_and_query()
                        .map_or_else(|| path_and_query.clone(), |pq| pq.as_str().to_string()),
                    method: parts.method,
                    headers: parts.headers,
                };
                h2_forward::forward(&self.pool, &self.queue, route, &origin, request, body).await?
            }
            _ => h1_forward::forward(&self.tls, self.connect_timeout, route, &origin, parts, body).await?,
        };

        Ok(relay_response(route, response).await)
    }
}

/// Rewritten path under the target's base path, query preserved.
fn outbound_path(route: &NormalizedRoute, target: &Url, inbound: &Uri) -> Result<String, ProxyError> {
    let path = inbound.path();
    if path.is_empty() {
        return Err(ProxyError::MissingRequestUrl);
    }

    let rewritten = route.rewrite_path(path);
    let base = target.path().trim_end_matches('/');
    let mut outbound = String::with_capacity(base.len() + rewritten.len() + 16);
    outbound.push_str(base);
    if !rewritten.starts_with('/') {
        outbound.push('/');
    }
    outbound.push_str(&rewritten);
    if let Some(query) = inbound.query() {
        outbound.push('?');
        outbound.push_str(query);
    }
    Ok(outbound)
}

fn client_info(parts: &request::Parts) -> ClientInfo {
    ClientInfo {
        addr: parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr),
        tls: parts.extensions.get::<ClientTls>().is_some(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RouteConfig;

    fn route(target: &str, rules: Vec<(&str, &str)>) -> NormalizedRoute {
        let mut config = RouteConfig::new("r", "/", target);
        config.path_rewrite = rules
            .into_iter()
            .map(|(from, to)| (from.to_string(), to.to_string()))
            .collect();
        NormalizedRoute::from_config(&config).unwrap()
    }

    #[test]
    fn outbound_path_joins_base_and_keeps_query() {
        let r = route("http://upstream.test/base/", vec![("^/api", "")]);
        let uri: Uri = "/api/items?page=2".parse().unwrap();
        assert_eq!(
            outbound_path(&r, &r.target, &uri).unwrap(),
            "/base/items?page=2"
        );
    }

    #[test]
    fn outbound_path_rewrite_to_empty_becomes_root() {
        let r = route("http://upstream.test", vec![("^/api", "")]);
        let uri: Uri = "/api".parse().unwrap();
        assert_eq!(outbound_path(&r, &r.target, &uri).unwrap(), "/");
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let engine = ProxyEngine::new(EngineConfig::default()).unwrap();
        engine.shutdown();
        engine.shutdown();
        assert!(engine.pool().is_empty());
        assert!(engine.queue().is_empty());
        assert!(engine.protocol_support().is_empty());
    }

    #[tokio::test]
    async fn shutdown_rejects_queued_requests() {
        let engine = ProxyEngine::new(EngineConfig::default()).unwrap();
        let origin = Origin::parse("http://127.0.0.1:9").unwrap();
        let ticket = engine.queue().enqueue(&origin).unwrap();

        engine.shutdown();
        assert!(matches!(ticket.await, Err(ProxyError::ShuttingDown)));
    }
}
