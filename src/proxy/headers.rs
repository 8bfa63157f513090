//! Outbound header translation.
//!
//! # Design Decisions
//! - Hop-by-hop headers never cross the proxy, except that a WebSocket
//!   handshake keeps `connection`/`upgrade`
//! - Precedence, lowest to highest: inbound, x-forwarded-*, `auth`
//!   (only when the client sent no authorization), route `headers`

use std::net::SocketAddr;

use axum::http::{header, HeaderMap, HeaderName, HeaderValue};

use crate::error::ProxyError;
use crate::pool::Credentials;
use crate::proxy::route::NormalizedRoute;

const HOP_BY_HOP: [&str; 7] = [
    "connection",
    "upgrade",
    "keep-alive",
    "transfer-encoding",
    "proxy-connection",
    "te",
    "trailer",
];

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";
const X_FORWARDED_HOST: &str = "x-forwarded-host";
const X_FORWARDED_PORT: &str = "x-forwarded-port";

/// Request extension set by a TLS listener so forwarded headers report `https`.
#[derive(Debug, Clone, Copy)]
pub struct ClientTls;

/// Whether an inbound header may be copied to the upstream request.
pub fn is_forwardable(name: &str, websocket: bool) -> bool {
    if name.starts_with(':') {
        return false;
    }
    let name = name.to_ascii_lowercase();
    if websocket && (name == "connection" || name == "upgrade") {
        return true;
    }
    !HOP_BY_HOP.contains(&name.as_str())
}

/// Who the inbound request came from.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClientInfo {
    pub addr: Option<SocketAddr>,
    pub tls: bool,
}

/// Build the outbound header set for `route`.
///
/// `host` is only kept when `change_origin` is off; otherwise the forwarding
/// path derives it from the target.
pub fn translate_request_headers(
    inbound: &HeaderMap,
    route: &NormalizedRoute,
    client: ClientInfo,
    websocket: bool,
) -> Result<HeaderMap, ProxyError> {
    let mut outbound = HeaderMap::with_capacity(inbound.len() + route.headers.len() + 4);
    for (name, value) in inbound {
        if !is_forwardable(name.as_str(), websocket) {
            continue;
        }
        if name == header::HOST && route.change_origin {
            continue;
        }
        outbound.append(name.clone(), value.clone());
    }

    if route.xfwd {
        add_forwarded_headers(&mut outbound, inbound, client);
    }

    if let Some(auth) = &route.auth {
        let credentials = Credentials::parse(auth)?;
        if !outbound.contains_key(header::AUTHORIZATION) {
            if let Ok(value) = HeaderValue::from_str(&credentials.basic_header()) {
                outbound.insert(header::AUTHORIZATION, value);
            }
        }
    }

    for (name, value) in &route.headers {
        outbound.insert(name.clone(), value.clone());
    }

    Ok(outbound)
}

fn add_forwarded_headers(outbound: &mut HeaderMap, inbound: &HeaderMap, client: ClientInfo) {
    let proto = if client.tls { "https" } else { "http" };
    let host = inbound
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    if let Some(addr) = client.addr {
        let ip = addr.ip().to_string();
        let value = match outbound.get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
            Some(existing) => format!("{}, {}", existing, ip),
            None => ip,
        };
        set(outbound, X_FORWARDED_FOR, &value);
    }

    if !outbound.contains_key(X_FORWARDED_PROTO) {
        set(outbound, X_FORWARDED_PROTO, proto);
    }

    if let Some(host) = &host {
        if !outbound.contains_key(X_FORWARDED_HOST) {
            set(outbound, X_FORWARDED_HOST, host);
        }
    }

    if !outbound.contains_key(X_FORWARDED_PORT) {
        let port = host
            .as_deref()
            .and_then(port_of)
            .unwrap_or(if client.tls { "443" } else { "80" })
            .to_string();
        set(outbound, X_FORWARDED_PORT, &port);
    }
}

/// Port part of a host header value, if explicit.
fn port_of(host: &str) -> Option<&str> {
    let (head, port) = host.rsplit_once(':')?;
    // `[::1]` alone has a colon but no port
    if head.ends_with(']') || !head.contains(':') {
        Some(port).filter(|p| !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit()))
    } else {
        None
    }
}

fn set(headers: &mut HeaderMap, name: &'static str, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(HeaderName::from_static(name), value);
    }
}

/// Remove hop-by-hop headers from an upstream response.
pub fn strip_response_headers(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}
