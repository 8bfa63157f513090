//! Normalized per-route configuration.
//!
//! A `RouteConfig` is resolved once into an immutable `NormalizedRoute`:
//! the pattern is compiled, the target becomes a canonical `Url`, header
//! and rewrite rules are parsed. Hooks that cannot come from a config file
//! (bypass, router function, custom path rewrite, request/response
//! configuration) are attached through [`NormalizedRouteBuilder`].

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{request, HeaderName, HeaderValue, Request, Response};
use futures_util::future::BoxFuture;
use regex::Regex;
use url::Url;

use crate::config::{CookieRewriteConfig, RouteConfig, TargetConfig};
use crate::error::ProxyError;
use crate::pool::Origin;
use crate::routing::RoutePattern;

/// Used when neither `proxy_timeout_ms` nor `timeout_ms` is set.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(120);

/// Outcome of a route's bypass hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Bypass {
    /// Proxy the request.
    Proxy,
    /// Rewrite the inbound URI and hand the request to the next handler.
    Rewrite(String),
    /// Hand the request to the next handler unchanged.
    Skip,
}

pub type BypassFn = Arc<dyn Fn(&Request<Body>) -> Bypass + Send + Sync>;
pub type RouterFn = Arc<dyn Fn(&request::Parts) -> String + Send + Sync>;
pub type PathRewriteFn = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// Where requests on a route are sent, overriding the static target.
#[derive(Clone)]
pub enum RouterTarget {
    Static(Url),
    /// Called per request; must return an absolute URL.
    Dynamic(RouterFn),
}

#[derive(Clone)]
pub enum PathRewrite {
    /// `regex → replacement`, each applied in order.
    Rules(Vec<(Regex, String)>),
    Custom(PathRewriteFn),
}

/// Rewrite rule for one `set-cookie` attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CookieRewrite {
    /// Every value becomes this one.
    All(String),
    /// Exact old value → new value; `*` matches anything unlisted.
    Map(Vec<(String, String)>),
}

impl CookieRewrite {
    /// Replacement for `value`, or `None` to leave it as is.
    pub fn replacement(&self, value: &str) -> Option<&str> {
        match self {
            CookieRewrite::All(new) => Some(new),
            CookieRewrite::Map(rules) => rules
                .iter()
                .find(|(old, _)| old == value)
                .or_else(|| rules.iter().find(|(old, _)| old == "*"))
                .map(|(_, new)| new.as_str()),
        }
    }
}

impl From<&CookieRewriteConfig> for CookieRewrite {
    fn from(config: &CookieRewriteConfig) -> Self {
        match config {
            CookieRewriteConfig::All(value) => CookieRewrite::All(value.clone()),
            CookieRewriteConfig::Map(map) => CookieRewrite::Map(
                map.iter().map(|(old, new)| (old.clone(), new.clone())).collect(),
            ),
        }
    }
}

/// Adjust outbound requests and take over upstream responses.
pub trait ProxyHooks: Send + Sync {
    /// Called after header translation, before the request is sent.
    fn on_proxy_request(&self, _parts: &mut request::Parts, _route: &NormalizedRoute) {}

    /// Called with the open upstream response when the route sets
    /// `self_handle_response`; the result is sent to the client.
    fn on_proxy_response(&self, response: Response<Body>) -> BoxFuture<'static, Response<Body>> {
        Box::pin(async move { response })
    }
}

/// A route that failed to normalize.
#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("route '{route}': invalid pattern: {source}")]
    Pattern { route: String, source: regex::Error },

    #[error("route '{route}': {source}")]
    Target { route: String, source: ProxyError },

    #[error("route '{route}': invalid header '{name}'")]
    Header { route: String, name: String },

    #[error("route '{route}': invalid path rewrite: {source}")]
    PathRewrite { route: String, source: regex::Error },
}

/// Immutable view of one route, shared by every request it serves.
#[derive(Clone)]
pub struct NormalizedRoute {
    pub name: String,
    pub pattern: RoutePattern,
    pub target: Url,
    pub router: Option<RouterTarget>,
    pub change_origin: bool,
    pub ws: bool,
    pub secure: bool,
    pub auth: Option<String>,
    pub headers: Vec<(HeaderName, HeaderValue)>,
    pub xfwd: bool,
    pub preserve_header_key_case: bool,
    pub cookie_domain_rewrite: Option<CookieRewrite>,
    pub cookie_path_rewrite: Option<CookieRewrite>,
    pub timeout: Option<Duration>,
    pub proxy_timeout: Option<Duration>,
    pub self_handle_response: bool,
    pub follow_redirects: bool,
    pub sse: bool,
    pub force_http1: bool,
    pub auto_detect_protocol: bool,
    pub path_rewrite: Option<PathRewrite>,
    pub bypass: Option<BypassFn>,
    pub hooks: Option<Arc<dyn ProxyHooks>>,
}

impl NormalizedRoute {
    pub fn from_config(config: &RouteConfig) -> Result<Self, RouteError> {
        NormalizedRouteBuilder::new(config.clone()).build()
    }

    pub fn builder(config: RouteConfig) -> NormalizedRouteBuilder {
        NormalizedRouteBuilder::new(config)
    }

    pub fn matches(&self, path: &str) -> bool {
        self.pattern.matches(path)
    }

    /// How long to wait for upstream response headers.
    pub fn response_timeout(&self) -> Duration {
        self.proxy_timeout
            .or(self.timeout)
            .unwrap_or(DEFAULT_RESPONSE_TIMEOUT)
    }

    /// Target URL for this request: router first, then the static target.
    pub fn resolve_target(&self, parts: &request::Parts) -> Result<Url, ProxyError> {
        match &self.router {
            Some(RouterTarget::Static(url)) => Ok(url.clone()),
            Some(RouterTarget::Dynamic(router)) => parse_target(&router(parts)),
            None => Ok(self.target.clone()),
        }
    }

    pub fn rewrite_path(&self, path: &str) -> String {
        match &self.path_rewrite {
            None => path.to_string(),
            Some(PathRewrite::Custom(rewrite)) => rewrite(path),
            Some(PathRewrite::Rules(rules)) => rules.iter().fold(path.to_string(), |path, (regex, replacement)| {
                regex.replace(&path, replacement.as_str()).into_owned()
            }),
        }
    }
}

impl fmt::Debug for NormalizedRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NormalizedRoute")
            .field("name", &self.name)
            .field("pattern", &self.pattern.as_str())
            .field("target", &self.target.as_str())
            .field("ws", &self.ws)
            .field("sse", &self.sse)
            .field("force_http1", &self.force_http1)
            .field("auto_detect_protocol", &self.auto_detect_protocol)
            .field("has_router", &self.router.is_some())
            .field("has_hooks", &self.hooks.is_some())
            .finish_non_exhaustive()
    }
}

/// Builds a [`NormalizedRoute`] from config plus programmatic hooks.
pub struct NormalizedRouteBuilder {
    config: RouteConfig,
    bypass: Option<BypassFn>,
    router: Option<RouterFn>,
    path_rewrite: Option<PathRewriteFn>,
    hooks: Option<Arc<dyn ProxyHooks>>,
}

impl NormalizedRouteBuilder {
    pub fn new(config: RouteConfig) -> Self {
        Self {
            config,
            bypass: None,
            router: None,
            path_rewrite: None,
            hooks: None,
        }
    }

    pub fn bypass(mut self, bypass: impl Fn(&Request<Body>) -> Bypass + Send + Sync + 'static) -> Self {
        self.bypass = Some(Arc::new(bypass));
        self
    }

    /// Per-request target selection; wins over `router` and `target` in config.
    pub fn router(mut self, router: impl Fn(&request::Parts) -> String + Send + Sync + 'static) -> Self {
        self.router = Some(Arc::new(router));
        self
    }

    /// Custom path rewrite; replaces configured rules.
    pub fn path_rewrite(mut self, rewrite: impl Fn(&str) -> String + Send + Sync + 'static) -> Self {
        self.path_rewrite = Some(Arc::new(rewrite));
        self
    }

    pub fn hooks(mut self, hooks: Arc<dyn ProxyHooks>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    pub fn build(self) -> Result<NormalizedRoute, RouteError> {
        let config = self.config;
        let name = config.name.clone();

        let pattern = RoutePattern::parse(&config.pattern).map_err(|source| RouteError::Pattern {
            route: name.clone(),
            source,
        })?;

        let target = resolve_target(&config.target).map_err(|source| RouteError::Target {
            route: name.clone(),
            source,
        })?;

        let router = match (self.router, &config.router) {
            (Some(router), _) => Some(RouterTarget::Dynamic(router)),
            (None, Some(url)) => Some(RouterTarget::Static(parse_target(url).map_err(|source| {
                RouteError::Target {
                    route: name.clone(),
                    source,
                }
            })?)),
            (None, None) => None,
        };

        let path_rewrite = match self.path_rewrite {
            Some(rewrite) => Some(PathRewrite::Custom(rewrite)),
            None if config.path_rewrite.is_empty() => None,
            None => {
                let rules = config
                    .path_rewrite
                    .iter()
                    .map(|(pattern, replacement)| Regex::new(pattern).map(|regex| (regex, replacement.clone())))
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|source| RouteError::PathRewrite {
                        route: name.clone(),
                        source,
                    })?;
                Some(PathRewrite::Rules(rules))
            }
        };

        let headers = config
            .headers
            .iter()
            .map(|(key, value)| {
                let header = HeaderName::from_bytes(key.as_bytes()).ok();
                let value = HeaderValue::from_str(value).ok();
                header.zip(value).ok_or_else(|| RouteError::Header {
                    route: name.clone(),
                    name: key.clone(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(NormalizedRoute {
            name,
            pattern,
            target,
            router,
            change_origin: config.change_origin,
            ws: config.ws,
            secure: config.secure,
            auth: config.auth,
            headers,
            xfwd: config.xfwd,
            preserve_header_key_case: config.preserve_header_key_case,
            cookie_domain_rewrite: config.cookie_domain_rewrite.as_ref().map(CookieRewrite::from),
            cookie_path_rewrite: config.cookie_path_rewrite.as_ref().map(CookieRewrite::from),
            timeout: config.timeout_ms.map(Duration::from_millis),
            proxy_timeout: config.proxy_timeout_ms.map(Duration::from_millis),
            self_handle_response: config.self_handle_response,
            follow_redirects: config.follow_redirects,
            sse: config.sse,
            force_http1: config.force_http1,
            auto_detect_protocol: config.auto_detect_protocol,
            path_rewrite,
            bypass: self.bypass,
            hooks: self.hooks,
        })
    }
}

/// Canonical URL for a configured target.
pub fn resolve_target(target: &TargetConfig) -> Result<Url, ProxyError> {
    match target {
        TargetConfig::Url(url) => parse_target(url),
        TargetConfig::Parts { protocol, host, port } => {
            let scheme = protocol.trim_end_matches(':');
            let url = match port {
                Some(port) => format!("{}://{}:{}", scheme, host, port),
                None => format!("{}://{}", scheme, host),
            };
            parse_target(&url)
        }
    }
}

/// Parse an absolute http(s)/ws(s) URL with a host.
pub fn parse_target(input: &str) -> Result<Url, ProxyError> {
    let url = Url::parse(input).map_err(|e| ProxyError::InvalidProxyTarget(format!("'{}': {}", input, e)))?;
    if Origin::from_url(&url).is_none() {
        return Err(ProxyError::InvalidProxyTarget(format!(
            "'{}': expected an absolute http, https, ws or wss URL",
            input
        )));
    }
    Ok(url)
}
