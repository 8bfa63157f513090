//! A pooled multiplexed upstream session.
//!
//! # Responsibilities
//! - Hold the h2 request handle for one origin
//! - Track active streams against the negotiated concurrency limit
//! - Track last use for idle expiry and LRU eviction

use std::time::{Duration, Instant};

use bytes::Bytes;
use h2::client::SendRequest;

use crate::pool::Origin;

/// Pool-owned state for one live HTTP/2 connection.
pub(crate) struct Session {
    pub(crate) id: u64,
    sender: SendRequest<Bytes>,
    /// The peer certificate was checked (always true for cleartext).
    pub(crate) verified: bool,
    created_at: Instant,
    pub(crate) last_used: Instant,
    pub(crate) active_streams: usize,
    pub(crate) max_concurrent_streams: usize,
    /// Ceiling learned from a refused stream; outlives SETTINGS updates.
    refused_at: Option<usize>,
}

impl Session {
    pub(crate) fn new(id: u64, sender: SendRequest<Bytes>, verified: bool, default_limit: usize) -> Self {
        let now = Instant::now();
        Self {
            id,
            sender,
            verified,
            created_at: now,
            last_used: now,
            active_streams: 0,
            max_concurrent_streams: default_limit,
            refused_at: None,
        }
    }

    /// Re-read the peer's advertised limit.
    ///
    /// h2 reports the configured initial value until the peer's SETTINGS
    /// arrive, and `usize::MAX` when the peer sets no limit at all.
    pub(crate) fn refresh_limit(&mut self, default_limit: usize) {
        let advertised = self.sender.current_max_send_streams();
        let limit = if advertised == usize::MAX {
            default_limit
        } else {
            advertised
        };
        self.max_concurrent_streams = match self.refused_at {
            Some(ceiling) => limit.min(ceiling),
            None => limit,
        };
    }

    pub(crate) fn has_capacity(&self) -> bool {
        self.active_streams < self.max_concurrent_streams
    }

    pub(crate) fn touch(&mut self) {
        self.last_used = Instant::now();
    }

    pub(crate) fn idle_for(&self) -> Duration {
        self.last_used.elapsed()
    }

    /// Whether this session may carry a request with these options.
    pub(crate) fn serves(&self, verify: bool) -> bool {
        self.verified || !verify
    }

    /// The peer refused a stream while `active_streams` were open (the refused
    /// one included).
    pub(crate) fn clamp_to_active(&mut self) {
        let ceiling = self.active_streams.saturating_sub(1).max(1);
        self.refused_at = Some(ceiling);
        self.max_concurrent_streams = self.max_concurrent_streams.min(ceiling);
    }

    pub(crate) fn handle(&self, origin: &Origin) -> SessionHandle {
        SessionHandle {
            origin: origin.clone(),
            session_id: self.id,
            verified: self.verified,
            sender: self.sender.clone(),
        }
    }

    pub(crate) fn stats(&self, origin: &Origin) -> SessionStats {
        SessionStats {
            origin: origin.clone(),
            session_id: self.id,
            verified: self.verified,
            active_streams: self.active_streams,
            max_concurrent_streams: self.max_concurrent_streams,
            age: self.created_at.elapsed(),
            idle: self.idle_for(),
        }
    }
}

/// A caller's reference to a pooled session.
///
/// Cloning the h2 handle keeps in-flight streams alive even if the pool
/// drops the session in the meantime.
#[derive(Clone)]
pub struct SessionHandle {
    pub origin: Origin,
    pub session_id: u64,
    /// Whether the session's certificate was verified.
    pub verified: bool,
    pub sender: SendRequest<Bytes>,
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("origin", &self.origin)
            .field("session_id", &self.session_id)
            .field("verified", &self.verified)
            .finish()
    }
}

/// Point-in-time view of a session.
#[derive(Debug, Clone)]
pub struct SessionStats {
    pub origin: Origin,
    pub session_id: u64,
    pub verified: bool,
    pub active_streams: usize,
    pub max_concurrent_streams: usize,
    pub age: Duration,
    pub idle: Duration,
}
