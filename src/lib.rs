//! HTTP/2 bridging reverse proxy library.
//!
//! Accepts HTTP/1.1 and HTTP/2 clients and forwards to upstreams over pooled
//! HTTP/2 sessions, direct HTTP/1.1 connections or raw WebSocket tunnels.

pub mod config;
pub mod error;
pub mod http;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod pool;
pub mod protocol;
pub mod proxy;
pub mod queue;
pub mod routing;

pub use config::ProxyConfig;
pub use error::ProxyError;
pub use http::HttpServer;
pub use lifecycle::Shutdown;
pub use pool::{ConnectionPool, Origin};
pub use proxy::route::{Bypass, NormalizedRoute, ProxyHooks};
pub use proxy::ProxyEngine;
pub use queue::RequestQueue;
pub use routing::RouteTable;
