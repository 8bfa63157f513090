//! Direct HTTP/1.1 forwarding over a single-use connection.

use std::time::Duration;

use axum::body::Body;
use axum::http::{header, request, HeaderValue, Request, Response, Version};
use hyper_util::rt::TokioIo;

use crate::error::ProxyError;
use crate::net::{dial, Alpn, UpstreamTls};
use crate::pool::Origin;
use crate::proxy::route::NormalizedRoute;

/// Send one request on a fresh connection and return the streaming response.
///
/// `parts` carries translated headers and an origin-form URI.
pub(crate) async fn forward(
    tls: &UpstreamTls,
    connect_timeout: Duration,
    route: &NormalizedRoute,
    origin: &Origin,
    mut parts: request::Parts,
    body: Body,
) -> Result<Response<Body>, ProxyError> {
    parts.version = Version::HTTP_11;
    if route.change_origin || !parts.headers.contains_key(header::HOST) {
        let host = HeaderValue::from_str(&origin.authority())
            .map_err(|e| ProxyError::InvalidProxyTarget(e.to_string()))?;
        parts.headers.insert(header::HOST, host);
    }

    let io = dial(origin, tls, route.secure, Alpn::Http1, connect_timeout)
        .await
        .map_err(|e| ProxyError::connection(origin, e))?;

    let (mut sender, connection) = hyper::client::conn::http1::Builder::new()
        .preserve_header_case(route.preserve_header_key_case)
        .handshake::<_, Body>(TokioIo::new(io))
        .await
        .map_err(|e| ProxyError::connection(origin, e))?;

    let conn_origin = origin.clone();
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::debug!(origin = %conn_origin, error = %e, "HTTP/1.1 upstream connection ended with error");
        }
    });

    let timeout = route.response_timeout();
    let response = match tokio::time::timeout(timeout, sender.send_request(Request::from_parts(parts, body))).await {
        Ok(Ok(response)) => response,
        Ok(Err(e)) => return Err(ProxyError::UpstreamStream(e.to_string())),
        Err(_) => {
            tracing::warn!(origin = %origin, timeout_ms = timeout.as_millis() as u64, "Upstream response timed out");
            return Err(ProxyError::GatewayTimeout(timeout.as_millis() as u64));
        }
    };

    let (parts, incoming) = response.into_parts();
    Ok(Response::from_parts(parts, Body::new(incoming)))
}
