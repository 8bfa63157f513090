//! Upstream connection pool.
//!
//! # Data Flow
//! ```text
//! acquire / acquire_if_capacity(origin)
//!     → expire sessions idle past max-age
//!     → existing session? refresh its stream limit, reserve a stream
//!     → none (or unverified for a verifying route): per-origin connect gate
//!         → evict LRU session at the session cap
//!         → net::dial (TLS, ALPN h2) → h2 handshake
//!         → spawn connection driver; its exit removes the session
//! ```
//!
//! # Design Decisions
//! - One session per origin; creation is serialized per origin by a gate
//!   that lives as long as the pool
//! - A session remembers whether its certificate was verified; a route with
//!   `secure` never rides an unverified session, it replaces it instead
//! - Counters and presence are read-modify-written under one mutex
//! - Stream accounting carries the session id, so a replaced session's late
//!   releases never touch its successor
//! - No retries here: a failed connect surfaces to the forwarding engine

pub mod auth;
pub mod origin;
pub mod session;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use dashmap::DashMap;
use h2::client::SendRequest;

use crate::config::PoolConfig;
use crate::error::ProxyError;
use crate::net::{dial, Alpn, UpstreamTls};
use crate::observability::metrics;

pub use auth::Credentials;
pub use origin::Origin;
pub use session::{SessionHandle, SessionStats};

use session::Session;

type SessionMap = Arc<Mutex<HashMap<Origin, Session>>>;

/// Per-connection options taken from the route.
#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    /// Verify the upstream certificate.
    pub secure: bool,
    /// `username:password`, validated before connecting.
    pub auth: Option<String>,
}

impl ConnectOptions {
    pub fn new(secure: bool, auth: Option<String>) -> Self {
        Self { secure, auth }
    }

    /// Whether a session for `origin` must have a verified certificate.
    pub fn requires_verified(&self, origin: &Origin) -> bool {
        self.secure && origin.is_tls()
    }
}

/// Outcome of [`ConnectionPool::reserve`].
#[derive(Debug)]
pub enum Reservation {
    Reserved(SessionHandle),
    /// The session is at its concurrency limit.
    Full,
    /// No session serves the origin.
    Missing,
}

/// Pool of multiplexed HTTP/2 sessions keyed by origin.
pub struct ConnectionPool {
    sessions: SessionMap,
    connecting: DashMap<Origin, Arc<tokio::sync::Mutex<()>>>,
    config: PoolConfig,
    tls: UpstreamTls,
    next_id: AtomicU64,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig, tls: UpstreamTls) -> Self {
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            connecting: DashMap::new(),
            config,
            tls,
            next_id: AtomicU64::new(1),
        }
    }

    /// Return the origin's session, creating it when absent.
    pub async fn acquire(&self, origin: &Origin, options: &ConnectOptions) -> Result<SessionHandle, ProxyError> {
        match self.checkout(origin, options, false).await? {
            Some(handle) => Ok(handle),
            // checkout only reports a full session when reserving
            None => Err(ProxyError::StreamCapacityExhausted(origin.to_string())),
        }
    }

    /// Like [`acquire`](Self::acquire), but also reserves one stream.
    ///
    /// Returns `None` when the origin's session is at its concurrency limit;
    /// the caller should queue. The reservation must be given back with
    /// [`mark_stream_ended`](Self::mark_stream_ended).
    pub async fn acquire_if_capacity(
        &self,
        origin: &Origin,
        options: &ConnectOptions,
    ) -> Result<Option<SessionHandle>, ProxyError> {
        self.checkout(origin, options, true).await
    }

    async fn checkout(
        &self,
        origin: &Origin,
        options: &ConnectOptions,
        reserve: bool,
    ) -> Result<Option<SessionHandle>, ProxyError> {
        if let Some(auth) = &options.auth {
            Credentials::parse(auth)?;
        }
        let verify = options.requires_verified(origin);

        self.expire_idle();
        if let Some(outcome) = self.checkout_existing(origin, verify, reserve) {
            return Ok(outcome);
        }

        let gate = self.connecting.entry(origin.clone()).or_default().clone();
        let _creating = gate.lock().await;
        if let Some(outcome) = self.checkout_existing(origin, verify, reserve) {
            return Ok(outcome);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let sender = self.connect(origin, options, id).await?;

        let mut sessions = self.sessions.lock().expect("pool mutex poisoned");
        let default_limit = self.config.default_max_concurrent_streams;
        if let Some(outcome) = take_stream(&mut sessions, origin, verify, reserve, default_limit) {
            // Dropping `sender` lets the new connection's driver wind down.
            tracing::debug!(origin = %origin, session_id = id, "Session appeared while connecting, discarding new connection");
            return Ok(outcome);
        }

        match sessions.remove(origin) {
            Some(unverified) => tracing::info!(
                origin = %origin,
                session_id = unverified.id,
                active_streams = unverified.active_streams,
                "Replacing unverified session with a verified one"
            ),
            None if sessions.len() >= self.config.max_sessions => evict_lru(&mut sessions),
            None => {}
        }

        let verified = options.secure || !origin.is_tls();
        let mut session = Session::new(id, sender, verified, default_limit);
        if reserve {
            session.active_streams = 1;
        }
        let handle = session.handle(origin);
        sessions.insert(origin.clone(), session);
        metrics::set_pool_sessions(sessions.len());
        tracing::debug!(origin = %origin, session_id = id, verified, pool_size = sessions.len(), "Upstream session created");
        Ok(Some(handle))
    }

    /// `Some(None)`: session exists but is full. `None`: no usable session.
    fn checkout_existing(&self, origin: &Origin, verify: bool, reserve: bool) -> Option<Option<SessionHandle>> {
        let mut sessions = self.sessions.lock().expect("pool mutex poisoned");
        take_stream(
            &mut sessions,
            origin,
            verify,
            reserve,
            self.config.default_max_concurrent_streams,
        )
    }

    async fn connect(&self, origin: &Origin, options: &ConnectOptions, id: u64) -> Result<SendRequest<Bytes>, ProxyError> {
        let deadline = self.config.connect_timeout();
        let io = dial(origin, &self.tls, options.secure, Alpn::H2, deadline)
            .await
            .map_err(|e| ProxyError::connection(origin, e))?;

        if origin.is_tls() && io.alpn_protocol() != Some(&b"h2"[..]) {
            return Err(ProxyError::connection(origin, "upstream did not negotiate h2"));
        }

        let mut builder = h2::client::Builder::new();
        builder.initial_max_send_streams(self.config.default_max_concurrent_streams);
        let (sender, connection) = tokio::time::timeout(deadline, builder.handshake::<_, Bytes>(io))
            .await
            .map_err(|_| ProxyError::connection(origin, "HTTP/2 handshake timed out"))?
            .map_err(|e| ProxyError::connection(origin, e))?;

        let sessions = self.sessions.clone();
        let origin = origin.clone();
        tokio::spawn(async move {
            match connection.await {
                Ok(()) => tracing::debug!(origin = %origin, session_id = id, "Upstream session closed"),
                Err(e) => tracing::warn!(origin = %origin, session_id = id, error = %e, "Upstream session failed"),
            }
            remove_session(&sessions, &origin, id);
        });

        Ok(sender)
    }

    /// Close sessions idle (no active streams) for longer than the max age.
    pub fn expire_idle(&self) {
        let max_age = self.config.session_max_age();
        let mut sessions = self.sessions.lock().expect("pool mutex poisoned");
        let before = sessions.len();
        sessions.retain(|origin, session| {
            let expired = session.active_streams == 0 && session.idle_for() > max_age;
            if expired {
                tracing::debug!(origin = %origin, session_id = session.id, "Closing idle session");
            }
            !expired
        });
        if sessions.len() != before {
            metrics::set_pool_sessions(sessions.len());
        }
    }

    /// Whether a reservation for `origin` could succeed right now.
    pub fn has_capacity(&self, origin: &Origin) -> bool {
        let sessions = self.sessions.lock().expect("pool mutex poisoned");
        sessions.get(origin).map_or(true, |session| session.has_capacity())
    }

    /// Reserve a stream on the origin's current session without connecting.
    pub fn reserve(&self, origin: &Origin) -> Reservation {
        let mut sessions = self.sessions.lock().expect("pool mutex poisoned");
        let Some(session) = sessions.get_mut(origin) else {
            return Reservation::Missing;
        };
        session.refresh_limit(self.config.default_max_concurrent_streams);
        if !session.has_capacity() {
            return Reservation::Full;
        }
        session.active_streams += 1;
        session.touch();
        Reservation::Reserved(session.handle(origin))
    }

    /// Count one more stream on session `session_id`.
    ///
    /// Returns false when that session no longer serves the origin.
    pub fn mark_stream_started(&self, origin: &Origin, session_id: u64) -> bool {
        let mut sessions = self.sessions.lock().expect("pool mutex poisoned");
        match sessions.get_mut(origin).filter(|s| s.id == session_id) {
            Some(session) => {
                session.active_streams += 1;
                session.touch();
                true
            }
            None => false,
        }
    }

    /// Give back a stream counted on session `session_id`. Never goes
    /// below zero; ignored once that session is gone.
    pub fn mark_stream_ended(&self, origin: &Origin, session_id: u64) {
        let mut sessions = self.sessions.lock().expect("pool mutex poisoned");
        if let Some(session) = sessions.get_mut(origin).filter(|s| s.id == session_id) {
            session.active_streams = session.active_streams.saturating_sub(1);
            session.touch();
        }
    }

    /// The peer refused a stream: stop counting on more than it accepted.
    pub fn mark_refused(&self, origin: &Origin, session_id: u64) {
        let mut sessions = self.sessions.lock().expect("pool mutex poisoned");
        if let Some(session) = sessions.get_mut(origin).filter(|s| s.id == session_id) {
            session.clamp_to_active();
            tracing::warn!(
                origin = %origin,
                max_concurrent_streams = session.max_concurrent_streams,
                "Upstream refused stream, lowering session capacity"
            );
        }
    }

    /// Close every session. Safe to call repeatedly.
    pub fn close_all(&self) {
        let mut sessions = self.sessions.lock().expect("pool mutex poisoned");
        if !sessions.is_empty() {
            tracing::info!(sessions = sessions.len(), "Closing all upstream sessions");
        }
        sessions.clear();
        metrics::set_pool_sessions(0);
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().expect("pool mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, origin: &Origin) -> bool {
        self.sessions
            .lock()
            .expect("pool mutex poisoned")
            .contains_key(origin)
    }

    pub fn stats(&self) -> Vec<SessionStats> {
        self.sessions
            .lock()
            .expect("pool mutex poisoned")
            .iter()
            .map(|(origin, session)| session.stats(origin))
            .collect()
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn tls(&self) -> &UpstreamTls {
        &self.tls
    }
}

/// Reserve (or just touch) a stream on a session that may serve `verify`.
fn take_stream(
    sessions: &mut HashMap<Origin, Session>,
    origin: &Origin,
    verify: bool,
    reserve: bool,
    default_limit: usize,
) -> Option<Option<SessionHandle>> {
    let session = sessions.get_mut(origin).filter(|s| s.serves(verify))?;
    session.refresh_limit(default_limit);
    if reserve {
        if !session.has_capacity() {
            tracing::debug!(
                origin = %origin,
                active_streams = session.active_streams,
                max_concurrent_streams = session.max_concurrent_streams,
                "Session at stream capacity"
            );
            return Some(None);
        }
        session.active_streams += 1;
    }
    session.touch();
    Some(Some(session.handle(origin)))
}

fn evict_lru(sessions: &mut HashMap<Origin, Session>) {
    let oldest = sessions
        .iter()
        .min_by_key(|(_, session)| session.last_used)
        .map(|(origin, _)| origin.clone());
    if let Some(origin) = oldest {
        if let Some(session) = sessions.remove(&origin) {
            tracing::info!(
                origin = %origin,
                session_id = session.id,
                active_streams = session.active_streams,
                "Evicting least recently used session"
            );
        }
    }
}

fn remove_session(sessions: &SessionMap, origin: &Origin, id: u64) {
    let mut sessions = sessions.lock().expect("pool mutex poisoned");
    if sessions.get(origin).is_some_and(|s| s.id == id) {
        sessions.remove(origin);
        metrics::set_pool_sessions(sessions.len());
    }
}
