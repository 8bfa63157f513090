//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (limits > 0, bind address parses)
//! - Check every route resolves: target, pattern, auth, rewrite rules
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ProxyConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::SocketAddr;

use crate::config::schema::{ProxyConfig, RouteConfig};
use crate::pool::auth::Credentials;
use crate::proxy::route::resolve_target;
use crate::routing::RoutePattern;

/// A single semantic problem in the configuration.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("invalid bind address '{0}'")]
    BindAddress(String),

    #[error("{0} must be greater than zero")]
    ZeroLimit(&'static str),

    #[error("route '{route}': {reason}")]
    Route { route: String, reason: String },
}

impl ValidationError {
    fn route(route: &RouteConfig, reason: impl ToString) -> Self {
        ValidationError::Route {
            route: route.name.clone(),
            reason: reason.to_string(),
        }
    }
}

/// Check a configuration, collecting every error.
pub fn validate_config(config: &ProxyConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::BindAddress(config.listener.bind_address.clone()));
    }

    let limits = [
        ("pool.max_sessions", config.pool.max_sessions as u64),
        ("pool.connect_timeout_ms", config.pool.connect_timeout_ms),
        (
            "pool.default_max_concurrent_streams",
            config.pool.default_max_concurrent_streams as u64,
        ),
        ("queue.max_size", config.queue.max_size as u64),
        ("queue.timeout_ms", config.queue.timeout_ms),
        ("protocol.probe_timeout_ms", config.protocol.probe_timeout_ms),
    ];
    for (name, value) in limits {
        if value == 0 {
            errors.push(ValidationError::ZeroLimit(name));
        }
    }

    for route in &config.routes {
        validate_route(route, &mut errors);
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn validate_route(route: &RouteConfig, errors: &mut Vec<ValidationError>) {
    if let Err(e) = RoutePattern::parse(&route.pattern) {
        errors.push(ValidationError::route(route, e));
    }
    if let Err(e) = resolve_target(&route.target) {
        errors.push(ValidationError::route(route, e));
    }
    if let Some(router) = &route.router {
        if let Err(e) = resolve_target(&crate::config::TargetConfig::Url(router.clone())) {
            errors.push(ValidationError::route(route, e));
        }
    }
    if let Some(auth) = &route.auth {
        if let Err(e) = Credentials::parse(auth) {
            errors.push(ValidationError::route(route, e));
        }
    }
    for (pattern, _) in &route.path_rewrite {
        if let Err(e) = regex::Regex::new(pattern) {
            errors.push(ValidationError::route(route, e));
        }
    }
}
