//! Origin key shared by the pool, the queue and the support cache.

use std::fmt;

use url::{Host, Url};

/// `scheme://host:port` identifying one upstream endpoint.
///
/// WebSocket schemes are folded into their HTTP equivalents and default ports
/// are made explicit, so `ws://a` and `http://a:80` are the same origin.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Origin {
    tls: bool,
    host: String,
    port: u16,
}

impl Origin {
    /// Derive the origin of an absolute URL.
    pub fn from_url(url: &Url) -> Option<Self> {
        let tls = match url.scheme() {
            "http" | "ws" => false,
            "https" | "wss" => true,
            _ => return None,
        };
        let host = match url.host()? {
            Host::Domain(d) => d.to_ascii_lowercase(),
            Host::Ipv4(ip) => ip.to_string(),
            Host::Ipv6(ip) => ip.to_string(),
        };
        let port = url.port().unwrap_or(if tls { 443 } else { 80 });
        Some(Self { tls, host, port })
    }

    /// Parse a URL string and take its origin.
    pub fn parse(input: &str) -> Option<Self> {
        Url::parse(input).ok().as_ref().and_then(Self::from_url)
    }

    pub fn is_tls(&self) -> bool {
        self.tls
    }

    pub fn scheme(&self) -> &'static str {
        if self.tls {
            "https"
        } else {
            "http"
        }
    }

    /// Host without IPv6 brackets, suitable for connecting.
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// `host[:port]` as written in a `host` header or `:authority`;
    /// default ports are omitted.
    pub fn authority(&self) -> String {
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        let default_port = if self.tls { 443 } else { 80 };
        if self.port == default_port {
            host
        } else {
            format!("{}:{}", host, self.port)
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "{}://[{}]:{}", self.scheme(), self.host, self.port)
        } else {
            write!(f, "{}://{}:{}", self.scheme(), self.host, self.port)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_ports_are_explicit() {
        let a = Origin::parse("http://Example.com/path").unwrap();
        let b = Origin::parse("ws://example.com:80").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "http://example.com:80");
        assert_eq!(a.authority(), "example.com");
    }

    #[test]
    fn tls_schemes() {
        let origin = Origin::parse("wss://api.example.com:8443/socket").unwrap();
        assert!(origin.is_tls());
        assert_eq!(origin.to_string(), "https://api.example.com:8443");
        assert_eq!(origin.authority(), "api.example.com:8443");
    }

    #[test]
    fn ipv6_host() {
        let origin = Origin::parse("http://[::1]:3000").unwrap();
        assert_eq!(origin.host(), "::1");
        assert_eq!(origin.authority(), "[::1]:3000");
        assert_eq!(origin.to_string(), "http://[::1]:3000");
    }

    #[test]
    fn unsupported_scheme() {
        assert!(Origin::parse("ftp://example.com").is_none());
    }
}
