//! WebSocket upgrade tunnel.
//!
//! # Data Flow
//! ```text
//! Client ── upgrade request ──→ Proxy ── hand-written GET + headers ──→ Backend
//! Client ←─ 101 + headers ───── Proxy ←─ 101 head (httparse) ────────── Backend
//! Client ←────────────── raw bytes, both directions ─────────────────→ Backend
//! ```
//!
//! # Design Decisions
//! - No frame parsing: after the handshake the proxy is a byte pipe
//! - Either side closing tears down the other
//! - A non-101 answer is relayed as an ordinary response

use std::io;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Request, Response, StatusCode};
use bytes::{Bytes, BytesMut};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::error::ProxyError;
use crate::net::{dial, Alpn, UpstreamIo, UpstreamTls};
use crate::pool::Origin;
use crate::proxy::route::NormalizedRoute;

const MAX_HEAD_BYTES: usize = 64 * 1024;
const MAX_HEADERS: usize = 100;

/// Open the upstream side of an upgrade and splice the two connections.
pub(crate) async fn tunnel(
    tls: &UpstreamTls,
    connect_timeout: Duration,
    route: &NormalizedRoute,
    origin: &Origin,
    path_and_query: &str,
    mut req: Request<Body>,
) -> Result<Response<Body>, ProxyError> {
    let mut upstream = dial(origin, tls, route.secure, Alpn::Http1, connect_timeout)
        .await
        .map_err(|e| ProxyError::connection(origin, e))?;

    let head = upgrade_request_head(route, origin, path_and_query, req.headers());
    upstream
        .write_all(&head)
        .await
        .map_err(|e| ProxyError::connection(origin, e))?;
    upstream.flush().await.map_err(|e| ProxyError::connection(origin, e))?;

    let timeout = route.response_timeout();
    let (status, headers, leftover) = match tokio::time::timeout(timeout, read_response_head(&mut upstream)).await {
        Ok(head) => head?,
        Err(_) => return Err(ProxyError::GatewayTimeout(timeout.as_millis() as u64)),
    };

    if status != StatusCode::SWITCHING_PROTOCOLS {
        tracing::debug!(origin = %origin, status = status.as_u16(), "Upstream declined the upgrade");
        return Ok(declined_response(status, headers, upstream, leftover));
    }

    let on_upgrade = hyper::upgrade::on(&mut req);
    let tunnel_origin = origin.clone();
    tokio::spawn(async move {
        let upgraded = match on_upgrade.await {
            Ok(upgraded) => upgraded,
            Err(e) => {
                tracing::warn!(origin = %tunnel_origin, error = %e, "Client upgrade failed");
                return;
            }
        };
        let mut client = TokioIo::new(upgraded);
        if !leftover.is_empty() {
            if let Err(e) = client.write_all(&leftover).await {
                tracing::debug!(origin = %tunnel_origin, error = %e, "Client closed during upgrade");
                return;
            }
        }
        match tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
            Ok((to_upstream, to_client)) => {
                tracing::debug!(origin = %tunnel_origin, to_upstream, to_client, "WebSocket tunnel closed")
            }
            Err(e) => tracing::debug!(origin = %tunnel_origin, error = %e, "WebSocket tunnel ended with error"),
        }
    });

    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
    *response.headers_mut() = headers;
    Ok(response)
}

/// `GET` line, the target host, then every other inbound header verbatim
/// (route headers replace inbound ones of the same name).
fn upgrade_request_head(route: &NormalizedRoute, origin: &Origin, path_and_query: &str, inbound: &HeaderMap) -> Vec<u8> {
    let host = match inbound.get(header::HOST) {
        Some(host) if !route.change_origin => host.as_bytes().to_vec(),
        _ => origin.authority().into_bytes(),
    };

    let mut head = Vec::with_capacity(512);
    head.extend_from_slice(format!("GET {} HTTP/1.1\r\n", path_and_query).as_bytes());
    head.extend_from_slice(b"host: ");
    head.extend_from_slice(&host);
    head.extend_from_slice(b"\r\n");
    for (name, value) in inbound {
        if name == header::HOST || route.headers.iter().any(|(configured, _)| configured == name) {
            continue;
        }
        head.extend_from_slice(name.as_str().as_bytes());
        head.extend_from_slice(b": ");
        head.extend_from_slice(value.as_bytes());
        head.extend_from_slice(b"\r\n");
    }
    for (name, value) in &route.headers {
        head.extend_from_slice(name.as_str().as_bytes());
        head.extend_from_slice(b": ");
        head.extend_from_slice(value.as_bytes());
        head.extend_from_slice(b"\r\n");
    }
    head.extend_from_slice(b"\r\n");
    head
}

async fn read_response_head(upstream: &mut UpstreamIo) -> Result<(StatusCode, HeaderMap, Bytes), ProxyError> {
    let mut buf = BytesMut::with_capacity(4096);
    loop {
        let read = upstream
            .read_buf(&mut buf)
            .await
            .map_err(|e| ProxyError::UpstreamStream(e.to_string()))?;
        if read == 0 {
            return Err(ProxyError::UpstreamStream("connection closed before response head".into()));
        }

        if let Some((status, headers, len)) = parse_head(&buf)? {
            let _ = buf.split_to(len);
            return Ok((status, headers, buf.freeze()));
        }
        if buf.len() > MAX_HEAD_BYTES {
            return Err(ProxyError::UpstreamStream("response head too large".into()));
        }
    }
}

/// `Ok(None)` until the whole head has arrived.
fn parse_head(buf: &[u8]) -> Result<Option<(StatusCode, HeaderMap, usize)>, ProxyError> {
    let mut slots = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut response = httparse::Response::new(&mut slots);
    let len = match response.parse(buf) {
        Ok(httparse::Status::Complete(len)) => len,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(e) => return Err(ProxyError::UpstreamStream(format!("malformed response head: {}", e))),
    };

    let status = response
        .code
        .and_then(|code| StatusCode::from_u16(code).ok())
        .ok_or_else(|| ProxyError::UpstreamStream("missing status code".into()))?;

    let mut headers = HeaderMap::with_capacity(response.headers.len());
    for parsed in response.headers.iter() {
        let name = HeaderName::from_bytes(parsed.name.as_bytes());
        let value = HeaderValue::from_bytes(parsed.value);
        if let (Ok(name), Ok(value)) = (name, value) {
            headers.append(name, value);
        }
    }
    Ok(Some((status, headers, len)))
}

fn declined_response(status: StatusCode, mut headers: HeaderMap, upstream: UpstreamIo, leftover: Bytes) -> Response<Body> {
    let chunked = headers
        .get(header::TRANSFER_ENCODING)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|te| te.to_ascii_lowercase().contains("chunked"));
    let limit = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok());

    let body = if chunked {
        // Raw chunked framing cannot be re-emitted as a body
        headers.remove(header::TRANSFER_ENCODING);
        Body::empty()
    } else {
        raw_body(upstream, leftover, limit)
    };

    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

/// Bytes already read past the head, then the rest of the socket.
fn raw_body(upstream: UpstreamIo, leftover: Bytes, limit: Option<u64>) -> Body {
    let state = (upstream, Some(leftover), limit);
    let chunks = futures_util::stream::unfold(state, |(mut upstream, pending, remaining)| async move {
        if remaining == Some(0) {
            return None;
        }
        let chunk = match pending.filter(|bytes| !bytes.is_empty()) {
            Some(bytes) => bytes,
            None => {
                let mut buf = BytesMut::with_capacity(8192);
                match upstream.read_buf(&mut buf).await {
                    Ok(0) => return None,
                    Ok(_) => buf.freeze(),
                    Err(e) => return Some((Err(e), (upstream, None, Some(0)))),
                }
            }
        };
        let (chunk, remaining) = match remaining {
            Some(left) => {
                let take = (chunk.len() as u64).min(left) as usize;
                (chunk.slice(..take), Some(left - take as u64))
            }
            None => (chunk, None),
        };
        Some((Ok::<_, io::Error>(chunk), (upstream, None, remaining)))
    });
    Body::from_stream(chunks)
}
