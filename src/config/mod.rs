//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → ProxyConfig (validated, immutable)
//!     → routes normalized once into Arc<NormalizedRoute>
//!
//! On file change:
//!     watcher.rs detects change
//!     → loader.rs loads new config
//!     → validation.rs validates
//!     → HttpServer swaps its route table
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; changes require full reload
//! - All fields have defaults to allow minimal configs
//! - Pool and queue limits are read once at engine construction; reloads
//!   only replace routes

pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use loader::{load_config, ConfigError};
pub use schema::{
    CookieRewriteConfig, EngineConfig, ListenerConfig, LogFormat, ObservabilityConfig,
    PoolConfig, ProtocolConfig, ProxyConfig, QueueConfig, RouteConfig, TargetConfig, TlsConfig,
};
