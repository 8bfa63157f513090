//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Upstream connection request (origin, secure, ALPN)
//!     → connect.rs (TCP connect under the connect deadline)
//!     → tls.rs (optional TLS handshake, certificate policy, ALPN)
//!     → UpstreamIo handed to the h2 session, the HTTP/1.1 client,
//!       or the raw WebSocket tunnel
//!
//! Inbound TLS:
//!     tls.rs loads the listener certificate for axum-server
//! ```
//!
//! # Design Decisions
//! - Client TLS configs are built once per (verification, ALPN) pair
//! - The ring provider is passed explicitly; nothing relies on a process default

pub mod connect;
pub mod tls;

pub use connect::{dial, UpstreamIo};
pub use tls::{Alpn, UpstreamTls};
