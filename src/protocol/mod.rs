//! Protocol selection.
//!
//! # Data Flow
//! ```text
//! resolved route + request headers + target origin
//!     → selector.rs: ws route / upgrade request / force_http1 / auto-detect
//!     → probe.rs (auto-detect only): cached answer, or one probe per miss
//!     → Protocol::{Http2, Http1, WebSocket}
//! ```
//!
//! # Design Decisions
//! - WebSocket intent beats every other preference; a forced HTTP/1.1
//!   beats auto-detection
//! - Only definitive probe answers are cached; a timed-out probe is retried
//!   on the next request

pub mod probe;
pub mod selector;

pub use probe::ProtocolSupportCache;
pub use selector::{looks_like_upgrade, select_protocol};

/// Why a request takes the direct HTTP/1.1 path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Http1Reason {
    /// `ws` route, non-upgrade request.
    WebSocketRoute,
    Forced,
    /// Auto-detection found no HTTP/2 support.
    Unsupported,
}

/// Forwarding path chosen for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// Pooled, multiplexed HTTP/2.
    Http2,
    /// Single-use HTTP/1.1 connection.
    Http1(Http1Reason),
    /// Raw HTTP/1.1 upgrade tunnel.
    WebSocket,
}

impl Protocol {
    /// Label for logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http2 => "h2",
            Protocol::Http1(_) => "http1",
            Protocol::WebSocket => "websocket",
        }
    }
}
