//! Upstream response relay.
//!
//! # Responsibilities
//! - Strip hop-by-hop headers
//! - Make 3xx `location` origin-relative when the route follows redirects
//! - Rewrite `set-cookie` domain/path
//! - Keep server-sent event streams unbuffered
//! - Hand the response to the route's hooks when it handles responses itself

use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderValue, Response, Version};
use url::Url;

use crate::proxy::cookies::rewrite_set_cookies;
use crate::proxy::headers::strip_response_headers;
use crate::proxy::route::NormalizedRoute;

/// Turn an upstream response into the client response.
pub async fn relay_response(route: &NormalizedRoute, mut response: Response<Body>) -> Response<Body> {
    *response.version_mut() = Version::HTTP_11;
    let status = response.status();
    let headers = response.headers_mut();

    strip_response_headers(headers);

    if route.follow_redirects && status.is_redirection() {
        make_location_relative(headers);
    }

    rewrite_set_cookies(
        headers,
        route.cookie_domain_rewrite.as_ref(),
        route.cookie_path_rewrite.as_ref(),
    );

    if route.sse && is_event_stream(headers) {
        apply_sse_headers(headers);
    }

    match (&route.hooks, route.self_handle_response) {
        (Some(hooks), true) => hooks.on_proxy_response(response).await,
        _ => response,
    }
}

/// `https://host/a?b#c` → `/a?b#c`. Relative locations are left alone.
pub fn make_location_relative(headers: &mut HeaderMap) {
    let Some(location) = headers.get(header::LOCATION).and_then(|v| v.to_str().ok()) else {
        return;
    };
    let Ok(url) = Url::parse(location) else {
        return;
    };
    if url.cannot_be_a_base() {
        return;
    }

    let mut relative = url.path().to_string();
    if let Some(query) = url.query() {
        relative.push('?');
        relative.push_str(query);
    }
    if let Some(fragment) = url.fragment() {
        relative.push('#');
        relative.push_str(fragment);
    }
    if let Ok(value) = HeaderValue::from_str(&relative) {
        headers.insert(header::LOCATION, value);
    }
}

pub fn is_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.trim_start().to_ascii_lowercase().starts_with("text/event-stream"))
}

pub fn apply_sse_headers(headers: &mut HeaderMap) {
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
    headers.remove(header::CONTENT_LENGTH);
}
