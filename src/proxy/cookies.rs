//! `set-cookie` domain/path rewriting.

use std::sync::OnceLock;

use axum::http::{header, HeaderMap, HeaderValue};
use regex::{Captures, Regex};

use crate::proxy::route::CookieRewrite;

fn domain_attribute() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)(;\s*domain=)([^;]+)").expect("valid domain regex"))
}

fn path_attribute() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)(;\s*path=)([^;]+)").expect("valid path regex"))
}

/// Rewrite one attribute of a single cookie string.
///
/// An empty replacement removes the attribute entirely.
pub fn rewrite_attribute(cookie: &str, attribute: &Regex, rule: &CookieRewrite) -> String {
    attribute
        .replace_all(cookie, |caps: &Captures| match rule.replacement(caps[2].trim()) {
            Some("") => String::new(),
            Some(new) => format!("{}{}", &caps[1], new),
            None => caps[0].to_string(),
        })
        .into_owned()
}

/// Apply domain and path rules to a single `set-cookie` value.
pub fn rewrite_cookie(cookie: &str, domain: Option<&CookieRewrite>, path: Option<&CookieRewrite>) -> String {
    let mut cookie = cookie.to_string();
    if let Some(rule) = domain {
        cookie = rewrite_attribute(&cookie, domain_attribute(), rule);
    }
    if let Some(rule) = path {
        cookie = rewrite_attribute(&cookie, path_attribute(), rule);
    }
    cookie
}

/// Rewrite every `set-cookie` header in place. Non-UTF-8 values pass through.
pub fn rewrite_set_cookies(headers: &mut HeaderMap, domain: Option<&CookieRewrite>, path: Option<&CookieRewrite>) {
    if domain.is_none() && path.is_none() {
        return;
    }

    let cookies: Vec<HeaderValue> = headers.get_all(header::SET_COOKIE).iter().cloned().collect();
    if cookies.is_empty() {
        return;
    }

    headers.remove(header::SET_COOKIE);
    for original in cookies {
        let rewritten = original
            .to_str()
            .ok()
            .map(|cookie| rewrite_cookie(cookie, domain, path))
            .and_then(|cookie| HeaderValue::from_str(&cookie).ok())
            .unwrap_or(original);
        headers.append(header::SET_COOKIE, rewritten);
    }
}
