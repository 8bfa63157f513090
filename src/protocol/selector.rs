//! Per-request choice between the pooled HTTP/2 path, direct HTTP/1.1 and
//! the WebSocket tunnel.

use axum::http::{header, HeaderMap};

use crate::pool::Origin;
use crate::protocol::{Http1Reason, Protocol, ProtocolSupportCache};
use crate::proxy::route::NormalizedRoute;

/// Any sign that the client wants a connection upgrade.
pub fn looks_like_upgrade(headers: &HeaderMap) -> bool {
    headers.contains_key(header::UPGRADE)
        || headers.contains_key(header::SEC_WEBSOCKET_KEY)
        || headers.contains_key(header::SEC_WEBSOCKET_VERSION)
}

pub async fn select_protocol(
    route: &NormalizedRoute,
    headers: &HeaderMap,
    origin: &Origin,
    support: &ProtocolSupportCache,
) -> Protocol {
    let upgrade = looks_like_upgrade(headers);

    if route.ws {
        return if upgrade {
            Protocol::WebSocket
        } else {
            Protocol::Http1(Http1Reason::WebSocketRoute)
        };
    }

    if upgrade {
        tracing::debug!(route = %route.name, "Upgrade request on non-ws route, tunnelling");
        return Protocol::WebSocket;
    }

    if route.force_http1 {
        return Protocol::Http1(Http1Reason::Forced);
    }

    if route.auto_detect_protocol && !support.supports_h2(origin, route.secure).await {
        return Protocol::Http1(Http1Reason::Unsupported);
    }

    Protocol::Http2
}
