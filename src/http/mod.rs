//! Inbound HTTP subsystem.
//!
//! # Data Flow
//! ```text
//! TCP/TLS connection
//!     → server.rs (Axum setup, HTTP/1.1 + h2 via hyper-util auto)
//!     → request.rs (x-request-id assigned or kept)
//!     → route table match (routing/)
//!     → proxy::ProxyEngine (forward or tunnel)
//!     → response streamed back to the client
//! ```

pub mod request;
pub mod server;

pub use request::{RequestIdExt, X_REQUEST_ID};
pub use server::{HttpServer, ServerError};
