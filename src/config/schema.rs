//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the proxy.
//! All types derive Serde traits for deserialization from config files.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration for the reverse proxy.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ProxyConfig {
    /// Listener configuration (bind address, TLS).
    pub listener: ListenerConfig,

    /// Upstream session pool tuning.
    pub pool: PoolConfig,

    /// Pending-request queue tuning.
    pub queue: QueueConfig,

    /// Protocol auto-detection settings.
    pub protocol: ProtocolConfig,

    /// Route definitions, matched in order.
    pub routes: Vec<RouteConfig>,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

impl ProxyConfig {
    /// The subset of settings consumed by the proxy engine.
    pub fn engine(&self) -> EngineConfig {
        EngineConfig {
            pool: self.pool.clone(),
            queue: self.queue.clone(),
            protocol: self.protocol.clone(),
        }
    }
}

/// Global tuning handed to `ProxyEngine::new`.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub pool: PoolConfig,
    pub queue: QueueConfig,
    pub protocol: ProtocolConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,

    /// Optional TLS configuration.
    pub tls: Option<TlsConfig>,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            tls: None,
        }
    }
}

/// TLS configuration for the listener.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TlsConfig {
    /// Path to certificate file (PEM).
    pub cert_path: String,

    /// Path to private key file (PEM).
    pub key_path: String,
}

/// Upstream connection pool settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum number of pooled sessions (one per origin).
    pub max_sessions: usize,

    /// Sessions idle longer than this are closed on the next acquire.
    pub session_max_age_ms: u64,

    /// TCP + TLS + HTTP/2 handshake deadline.
    pub connect_timeout_ms: u64,

    /// Concurrent streams assumed until the peer advertises its limit.
    pub default_max_concurrent_streams: usize,
}

impl PoolConfig {
    pub fn session_max_age(&self) -> Duration {
        Duration::from_millis(self.session_max_age_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_sessions: 100,
            session_max_age_ms: 300_000,
            connect_timeout_ms: 10_000,
            default_max_concurrent_streams: 100,
        }
    }
}

/// Request queue settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Maximum queued requests across all origins.
    pub max_size: usize,

    /// How long a queued request may wait for capacity.
    pub timeout_ms: u64,
}

impl QueueConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_size: 512,
            timeout_ms: 30_000,
        }
    }
}

/// HTTP/2 support probing.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Deadline for a single support probe.
    pub probe_timeout_ms: u64,
}

impl ProtocolConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            probe_timeout_ms: 2_000,
        }
    }
}

/// Proxy target as written in configuration.
///
/// Resolved once into a canonical absolute URL when the route is built.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum TargetConfig {
    /// `"https://api.example.com:8443"`
    Url(String),
    /// `{ protocol = "https", host = "api.example.com", port = 8443 }`
    Parts {
        #[serde(default = "default_protocol")]
        protocol: String,
        host: String,
        port: Option<u16>,
    },
}

fn default_protocol() -> String {
    "http".to_string()
}

/// Cookie attribute rewrite rule.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum CookieRewriteConfig {
    /// Replace every value with this one.
    All(String),
    /// Replace exact old values; `*` matches anything else.
    Map(BTreeMap<String, String>),
}

/// A single route definition.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RouteConfig {
    /// Route identifier for logging/metrics.
    pub name: String,

    /// Path prefix, or a regular expression when it starts with `^`.
    pub pattern: String,

    /// Upstream target.
    pub target: TargetConfig,

    /// Static router override, takes precedence over `target`.
    #[serde(default)]
    pub router: Option<String>,

    /// Rewrite the host/authority to the target's.
    #[serde(default = "default_true")]
    pub change_origin: bool,

    /// Proxy WebSocket upgrades (forces HTTP/1.1).
    #[serde(default)]
    pub ws: bool,

    /// Ordered `regex -> replacement` rules applied to the path.
    #[serde(default)]
    pub path_rewrite: Vec<(String, String)>,

    /// Verify upstream TLS certificates.
    #[serde(default = "default_true")]
    pub secure: bool,

    /// `username:password` for Basic authentication upstream.
    #[serde(default)]
    pub auth: Option<String>,

    /// Extra request headers, applied last.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    /// Add `x-forwarded-*` headers.
    #[serde(default = "default_true")]
    pub xfwd: bool,

    #[serde(default)]
    pub preserve_header_key_case: bool,

    #[serde(default)]
    pub cookie_domain_rewrite: Option<CookieRewriteConfig>,

    #[serde(default)]
    pub cookie_path_rewrite: Option<CookieRewriteConfig>,

    /// Fallback request timeout in milliseconds.
    #[serde(default)]
    pub timeout_ms: Option<u64>,

    /// Upstream response timeout in milliseconds (wins over `timeout_ms`).
    #[serde(default)]
    pub proxy_timeout_ms: Option<u64>,

    #[serde(default)]
    pub self_handle_response: bool,

    /// Rewrite 3xx `location` headers to be origin-relative.
    #[serde(default)]
    pub follow_redirects: bool,

    /// Server-sent events passthrough.
    #[serde(default)]
    pub sse: bool,

    #[serde(default)]
    pub force_http1: bool,

    #[serde(default)]
    pub auto_detect_protocol: bool,
}

impl RouteConfig {
    /// Minimal route forwarding `pattern` to `target`.
    pub fn new(name: impl Into<String>, pattern: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pattern: pattern.into(),
            target: TargetConfig::Url(target.into()),
            router: None,
            change_origin: true,
            ws: false,
            path_rewrite: Vec::new(),
            secure: true,
            auth: None,
            headers: BTreeMap::new(),
            xfwd: true,
            preserve_header_key_case: false,
            cookie_domain_rewrite: None,
            cookie_path_rewrite: None,
            timeout_ms: None,
            proxy_timeout_ms: None,
            self_handle_response: false,
            follow_redirects: false,
            sse: false,
            force_http1: false,
            auto_detect_protocol: false,
        }
    }
}

fn default_true() -> bool {
    true
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log filter directive used when `RUST_LOG` is unset.
    pub log_level: String,

    pub log_format: LogFormat,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "h2_bridge=info,tower_http=info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = ProxyConfig::default();
        assert_eq!(config.pool.max_sessions, 100);
        assert_eq!(config.pool.session_max_age_ms, 300_000);
        assert_eq!(config.pool.connect_timeout_ms, 10_000);
        assert_eq!(config.queue.max_size, 512);
        assert_eq!(config.queue.timeout_ms, 30_000);
        assert_eq!(config.protocol.probe_timeout_ms, 2_000);
    }

    #[test]
    fn route_from_toml() {
        let route: RouteConfig = toml::from_str(
            r#"
            name = "api"
            pattern = "/api"
            target = { protocol = "https", host = "api.example.com" }
            cookie_domain_rewrite = "localhost"
            cookie_path_rewrite = { "/api" = "/" }
            path_rewrite = [["^/api", ""]]
            "#,
        )
        .unwrap();

        assert!(route.change_origin);
        assert!(route.secure);
        assert!(route.xfwd);
        assert_eq!(
            route.target,
            TargetConfig::Parts {
                protocol: "https".into(),
                host: "api.example.com".into(),
                port: None
            }
        );
        assert_eq!(
            route.cookie_domain_rewrite,
            Some(CookieRewriteConfig::All("localhost".into()))
        );
        assert!(matches!(route.cookie_path_rewrite, Some(CookieRewriteConfig::Map(_))));
        assert_eq!(route.path_rewrite, vec![("^/api".to_string(), String::new())]);
    }
}
