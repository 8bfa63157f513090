//! Error taxonomy for the proxy core.
//!
//! # Design Decisions
//! - Configuration-shape errors (bad auth, bad target, missing URL) and
//!   transient upstream errors share one enum so every failure path ends in
//!   the same `IntoResponse` mapping
//! - `StreamCapacityExhausted` is recoverable: the forwarding engine turns it
//!   into a queue admission and it never reaches a client
//! - Bodies are short plain-text descriptions

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};

/// Every failure the proxy core can surface.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// `auth` is not a `username:password` pair.
    #[error("Invalid auth format. {0}")]
    InvalidAuthFormat(&'static str),

    /// Static or router-returned target is not an absolute URL.
    #[error("Invalid proxy target: {0}")]
    InvalidProxyTarget(String),

    /// The inbound request carries no path to forward.
    #[error("Missing request URL")]
    MissingRequestUrl,

    /// Connecting or handshaking with the upstream failed.
    #[error("Upstream connection to {origin} failed: {reason}")]
    UpstreamConnection { origin: String, reason: String },

    /// A single request/response exchange failed.
    #[error("Upstream request failed: {0}")]
    UpstreamStream(String),

    /// The upstream refused a new stream; handled by queueing.
    #[error("Stream capacity exhausted for {0}")]
    StreamCapacityExhausted(String),

    #[error("Request queue is full")]
    QueueFull,

    #[error("Request timed out waiting in queue")]
    QueueTimeout,

    #[error("Proxy is shutting down")]
    ShuttingDown,

    #[error("Upstream did not respond within {0} ms")]
    GatewayTimeout(u64),

    /// Client TLS configuration could not be built.
    #[error("TLS configuration error: {0}")]
    Tls(#[from] rustls::Error),
}

impl ProxyError {
    pub(crate) fn connection(origin: impl ToString, reason: impl ToString) -> Self {
        ProxyError::UpstreamConnection {
            origin: origin.to_string(),
            reason: reason.to_string(),
        }
    }

    /// HTTP status returned to the client for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::InvalidAuthFormat(_) | ProxyError::Tls(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            ProxyError::InvalidProxyTarget(_)
            | ProxyError::UpstreamConnection { .. }
            | ProxyError::UpstreamStream(_) => StatusCode::BAD_GATEWAY,
            ProxyError::MissingRequestUrl => StatusCode::BAD_REQUEST,
            ProxyError::StreamCapacityExhausted(_)
            | ProxyError::QueueFull
            | ProxyError::QueueTimeout
            | ProxyError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::GatewayTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    /// True for errors caused by route configuration rather than the upstream.
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            ProxyError::InvalidAuthFormat(_)
                | ProxyError::InvalidProxyTarget(_)
                | ProxyError::Tls(_)
        )
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        (self.status(), self.to_string()).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(ProxyError::QueueFull.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(ProxyError::QueueTimeout.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(ProxyError::GatewayTimeout(10).status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            ProxyError::InvalidProxyTarget("nope".into()).status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(ProxyError::MissingRequestUrl.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            ProxyError::connection("http://a:80", "refused").status(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn auth_message_is_descriptive() {
        let err = ProxyError::InvalidAuthFormat("Expected 'username:password'");
        assert_eq!(
            err.to_string(),
            "Invalid auth format. Expected 'username:password'"
        );
        assert!(err.is_configuration_error());
    }
}
