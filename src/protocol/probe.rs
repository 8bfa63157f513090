//! Per-origin HTTP/2 support cache.
//!
//! # Responsibilities
//! - Answer "does this origin speak HTTP/2?" for auto-detecting routes
//! - Probe at most once per definitive answer; concurrent misses for one
//!   origin wait for a single probe
//!
//! # Design Decisions
//! - TLS origins: the ALPN result of a handshake offering `h2, http/1.1`
//! - Plain origins: prior-knowledge h2 handshake plus `HEAD /`
//! - Timeouts and refused connections count as unsupported for the current
//!   request but are not cached

use std::sync::Arc;
use std::time::Duration;

use axum::http::{Method, Request};
use bytes::Bytes;
use dashmap::DashMap;

use crate::config::ProtocolConfig;
use crate::net::{dial, Alpn, UpstreamIo, UpstreamTls};
use crate::observability::metrics;
use crate::pool::Origin;

#[derive(Debug, Clone, PartialEq, Eq)]
enum ProbeOutcome {
    Supported,
    Unsupported,
    Inconclusive(String),
}

/// Memoized HTTP/2 support per origin.
pub struct ProtocolSupportCache {
    entries: DashMap<Origin, bool>,
    probing: DashMap<Origin, Arc<tokio::sync::Mutex<()>>>,
    tls: UpstreamTls,
    timeout: Duration,
}

impl ProtocolSupportCache {
    pub fn new(config: &ProtocolConfig, tls: UpstreamTls) -> Self {
        Self {
            entries: DashMap::new(),
            probing: DashMap::new(),
            tls,
            timeout: config.probe_timeout(),
        }
    }

    pub fn get(&self, origin: &Origin) -> Option<bool> {
        self.entries.get(origin).map(|entry| *entry)
    }

    /// Record a known answer without probing.
    pub fn insert(&self, origin: &Origin, supported: bool) {
        self.entries.insert(origin.clone(), supported);
    }

    /// Cached answer, probing on a miss.
    pub async fn supports_h2(&self, origin: &Origin, secure: bool) -> bool {
        if let Some(supported) = self.get(origin) {
            return supported;
        }

        let gate = self.probing.entry(origin.clone()).or_default().clone();
        let _probing = gate.lock().await;
        if let Some(supported) = self.get(origin) {
            return supported;
        }

        match self.probe(origin, secure).await {
            ProbeOutcome::Supported => {
                tracing::info!(origin = %origin, "Origin supports HTTP/2");
                metrics::record_probe("supported");
                self.insert(origin, true);
                true
            }
            ProbeOutcome::Unsupported => {
                tracing::info!(origin = %origin, "Origin does not support HTTP/2, using HTTP/1.1");
                metrics::record_probe("unsupported");
                self.insert(origin, false);
                false
            }
            ProbeOutcome::Inconclusive(reason) => {
                tracing::warn!(origin = %origin, reason = %reason, "HTTP/2 probe inconclusive, using HTTP/1.1");
                metrics::record_probe("inconclusive");
                false
            }
        }
    }

    async fn probe(&self, origin: &Origin, secure: bool) -> ProbeOutcome {
        let io = match dial(origin, &self.tls, secure, Alpn::Negotiate, self.timeout).await {
            Ok(io) => io,
            Err(e) => return ProbeOutcome::Inconclusive(e.to_string()),
        };

        if origin.is_tls() {
            return if io.alpn_protocol() == Some(&b"h2"[..]) {
                ProbeOutcome::Supported
            } else {
                ProbeOutcome::Unsupported
            };
        }

        match tokio::time::timeout(self.timeout, probe_prior_knowledge(io, origin)).await {
            Ok(outcome) => outcome,
            Err(_) => ProbeOutcome::Inconclusive(format!("no answer within {:?}", self.timeout)),
        }
    }

    /// Forget every answer.
    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

async fn probe_prior_knowledge(io: UpstreamIo, origin: &Origin) -> ProbeOutcome {
    let (client, connection) = match h2::client::handshake(io).await {
        Ok(pair) => pair,
        Err(e) => {
            tracing::debug!(origin = %origin, error = %e, "h2 handshake rejected");
            return ProbeOutcome::Unsupported;
        }
    };
    let driver = tokio::spawn(connection);

    let request = Request::builder()
        .method(Method::HEAD)
        .uri(format!("{}://{}/", origin.scheme(), origin.authority()))
        .body(());
    let outcome = match request {
        Ok(request) => send_probe(client, request).await,
        Err(e) => ProbeOutcome::Inconclusive(e.to_string()),
    };

    driver.abort();
    outcome
}

async fn send_probe(client: h2::client::SendRequest<Bytes>, request: Request<()>) -> ProbeOutcome {
    let mut client = match client.ready().await {
        Ok(client) => client,
        Err(_) => return ProbeOutcome::Unsupported,
    };
    let response = match client.send_request(request, true) {
        Ok((response, _)) => response,
        Err(_) => return ProbeOutcome::Unsupported,
    };
    match response.await {
        Ok(_) => ProbeOutcome::Supported,
        Err(_) => ProbeOutcome::Unsupported,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(timeout_ms: u64) -> ProtocolSupportCache {
        ProtocolSupportCache::new(
            &ProtocolConfig {
                probe_timeout_ms: timeout_ms,
            },
            UpstreamTls::new().unwrap(),
        )
    }

    #[tokio::test]
    async fn connection_errors_are_not_cached() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let origin = Origin::parse(&format!("http://127.0.0.1:{}", port)).unwrap();
        let support = cache(500);
        assert!(!support.supports_h2(&origin, true).await);
        assert_eq!(support.get(&origin), None);
    }

    #[tokio::test]
    async fn http1_only_server_is_cached_as_unsupported() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    let _ = socket.read(&mut buf).await;
                    let _ = socket
                        .write_all(b"HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
                        .await;
                });
            }
        });

        let origin = Origin::parse(&format!("http://{}", addr)).unwrap();
        let support = cache(2_000);
        assert!(!support.supports_h2(&origin, true).await);
        assert_eq!(support.get(&origin), Some(false));

        support.clear();
        assert!(support.is_empty());
    }

    #[tokio::test]
    async fn concurrent_misses_share_one_probe() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connections = Arc::new(AtomicUsize::new(0));
        let accepted = connections.clone();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                accepted.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    let Ok(mut connection) = h2::server::handshake(socket).await else {
                        return;
                    };
                    while let Some(Ok((_, mut respond))) = connection.accept().await {
                        let _ = respond.send_response(axum::http::Response::new(()), true);
                    }
                });
            }
        });

        let origin = Origin::parse(&format!("http://{}", addr)).unwrap();
        let support = cache(2_000);
        let answers = futures_util::future::join_all((0..8).map(|_| support.supports_h2(&origin, true))).await;

        assert!(answers.iter().all(|supported| *supported));
        assert_eq!(connections.load(Ordering::SeqCst), 1);
        assert_eq!(support.get(&origin), Some(true));
    }
}
