//! Route pattern matching.
//!
//! # Design Decisions
//! - A pattern starting with `^` is a regular expression over the path
//! - Anything else is a literal, case-sensitive path prefix
//! - Empty prefix matches everything

use regex::Regex;

/// Compiled route pattern.
#[derive(Debug, Clone)]
pub enum RoutePattern {
    Prefix(String),
    Regex(Regex),
}

impl RoutePattern {
    pub fn parse(pattern: &str) -> Result<Self, regex::Error> {
        if pattern.starts_with('^') {
            Ok(RoutePattern::Regex(Regex::new(pattern)?))
        } else {
            Ok(RoutePattern::Prefix(pattern.to_string()))
        }
    }

    pub fn matches(&self, path: &str) -> bool {
        match self {
            RoutePattern::Prefix(prefix) => path.starts_with(prefix.as_str()),
            RoutePattern::Regex(regex) => regex.is_match(path),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            RoutePattern::Prefix(prefix) => prefix,
            RoutePattern::Regex(regex) => regex.as_str(),
        }
    }
}
