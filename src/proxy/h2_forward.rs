//! Pooled HTTP/2 forwarding.
//!
//! # Data Flow
//! ```text
//! admit(origin)
//!     → nobody queued for the origin: acquire_if_capacity
//!         → Some(session): StreamSlot reserved
//!         → None: enqueue, await ticket
//!     → ticket resolves with a StreamSlot already reserved for us, or with
//!       Retry when the session went away (back to the head of the line)
//! send(slot)
//!     → send_request (headers), spawn body pump
//!     → await response headers (route timeout)
//!     → response body streams to the client; the slot rides along
//! StreamSlot dropped
//!     → stream counted off, the freed stream goes straight to the oldest
//!       queued request
//! ```
//!
//! # Design Decisions
//! - A freed stream is handed over through the queue rather than released
//!   for anyone to grab, so newcomers cannot overtake queued requests
//! - REFUSED_STREAM lowers the session's limit and sends the request back
//!   through the queue once, as long as no body bytes were consumed; a
//!   second refusal is a 502
//! - A timeout drops both stream halves, which resets the stream (CANCEL)

use std::future::poll_fn;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, HeaderMap, Method, Request, Response, Uri, Version};
use bytes::Bytes;
use h2::{Reason, RecvStream, SendStream};
use http_body_util::{BodyExt, StreamBody};
use hyper::body::{Body as _, Frame};

use crate::error::ProxyError;
use crate::pool::{ConnectOptions, ConnectionPool, Origin, Reservation, SessionHandle};
use crate::proxy::route::NormalizedRoute;
use crate::queue::RequestQueue;

/// Queue of requests waiting for a stream on a pooled session.
pub type AdmissionQueue = RequestQueue<Admission>;

/// What a queued request is resumed with.
pub enum Admission {
    /// A stream reserved on the origin's session.
    Granted(StreamSlot),
    /// The origin has no session left to wait on; connect a new one.
    Retry,
}

/// One reserved stream on a pooled session.
///
/// Dropping it counts the stream off and hands the capacity to the next
/// queued request.
pub struct StreamSlot {
    pool: Arc<ConnectionPool>,
    queue: AdmissionQueue,
    origin: Origin,
    handle: SessionHandle,
}

impl StreamSlot {
    fn new(pool: Arc<ConnectionPool>, queue: AdmissionQueue, origin: Origin, handle: SessionHandle) -> Self {
        Self {
            pool,
            queue,
            origin,
            handle,
        }
    }

    pub fn session_id(&self) -> u64 {
        self.handle.session_id
    }

    /// Whether the slot's session may carry a request that needs a
    /// verified certificate when `verify` is set.
    fn serves(&self, verify: bool) -> bool {
        self.handle.verified || !verify
    }
}

impl Drop for StreamSlot {
    fn drop(&mut self) {
        self.pool.mark_stream_ended(&self.origin, self.handle.session_id);
        grant_next(&self.pool, &self.queue, &self.origin);
    }
}

/// Hand free streams on the origin's session to queued requests, oldest
/// first.
fn grant_next(pool: &Arc<ConnectionPool>, queue: &AdmissionQueue, origin: &Origin) {
    while let Some(entry) = queue.dequeue(origin) {
        if entry.is_abandoned() {
            continue;
        }
        match pool.reserve(origin) {
            Reservation::Reserved(handle) => {
                let slot = StreamSlot::new(pool.clone(), queue.clone(), origin.clone(), handle);
                if let Err(unclaimed) = entry.resume(Admission::Granted(slot)) {
                    // Dropping the slot gives the stream back and lands here again.
                    drop(unclaimed);
                    return;
                }
            }
            Reservation::Full => {
                queue.restore(entry);
                return;
            }
            Reservation::Missing => {
                let _ = entry.resume(Admission::Retry);
                return;
            }
        }
    }
}

/// Request head for the pooled path.
pub(crate) struct H2Request {
    pub method: Method,
    pub path_and_query: String,
    pub headers: HeaderMap,
}

enum Attempt {
    Done(Result<Response<Body>, ProxyError>),
    /// Refused before any body was consumed; safe to send again.
    Refused(Body),
}

pub(crate) async fn forward(
    pool: &Arc<ConnectionPool>,
    queue: &AdmissionQueue,
    route: &NormalizedRoute,
    origin: &Origin,
    request: H2Request,
    body: Body,
) -> Result<Response<Body>, ProxyError> {
    let options = ConnectOptions::new(route.secure, route.auth.clone());
    let head = build_head(route, origin, request)?;
    let mut body = body;
    let mut refused = false;

    loop {
        let slot = admit(pool, queue, origin, &options, refused).await?;
        match send(&head, body, slot, route.response_timeout()).await {
            Attempt::Done(result) => return result,
            Attempt::Refused(_) if refused => {
                tracing::warn!(origin = %origin, route = %route.name, "Upstream refused the stream again, giving up");
                return Err(ProxyError::UpstreamStream("upstream refused the stream".into()));
            }
            Attempt::Refused(unsent) => {
                tracing::debug!(origin = %origin, route = %route.name, "Stream refused, re-queueing request");
                refused = true;
                body = unsent;
            }
        }
    }
}

/// Wait until a stream slot is reserved for `origin`.
///
/// With `queue_first` the request goes straight into the queue instead of
/// trying the pool.
async fn admit(
    pool: &Arc<ConnectionPool>,
    queue: &AdmissionQueue,
    origin: &Origin,
    options: &ConnectOptions,
    mut queue_first: bool,
) -> Result<StreamSlot, ProxyError> {
    let verify = options.requires_verified(origin);
    let mut deadline = None;

    loop {
        // Newcomers line up behind requests that are already waiting.
        if !queue_first && (deadline.is_some() || queue.len_for(origin) == 0) {
            if let Some(handle) = pool.acquire_if_capacity(origin, options).await? {
                let slot = StreamSlot::new(pool.clone(), queue.clone(), origin.clone(), handle);
                // A new session may have room for requests queued meanwhile.
                if queue.len_for(origin) > 0 {
                    grant_next(pool, queue, origin);
                }
                return Ok(slot);
            }
        }
        queue_first = false;

        let ticket = match deadline {
            Some(deadline) => queue.requeue(origin, deadline)?,
            None => queue.enqueue(origin)?,
        };
        deadline = Some(ticket.deadline());
        // A stream may have been freed before the ticket existed.
        if pool.has_capacity(origin) {
            grant_next(pool, queue, origin);
        }

        match ticket.await? {
            Admission::Granted(slot) if slot.serves(verify) => return Ok(slot),
            // Unverified session; connect a verified one from the head of the line.
            Admission::Granted(slot) => drop(slot),
            Admission::Retry => {}
        }
    }
}

fn build_head(route: &NormalizedRoute, origin: &Origin, request: H2Request) -> Result<Request<()>, ProxyError> {
    let H2Request {
        method,
        path_and_query,
        mut headers,
    } = request;

    // h2 carries the host as :authority
    let inbound_host = headers
        .remove(header::HOST)
        .and_then(|v| v.to_str().ok().map(str::to_string));
    let authority = match (route.change_origin, inbound_host) {
        (false, Some(host)) => host,
        _ => origin.authority(),
    };

    let uri: Uri = format!("{}://{}{}", origin.scheme(), authority, path_and_query)
        .parse()
        .map_err(|_| ProxyError::MissingRequestUrl)?;

    let mut head = Request::builder()
        .method(method)
        .uri(uri)
        .version(Version::HTTP_2)
        .body(())
        .map_err(|e| ProxyError::UpstreamStream(e.to_string()))?;
    *head.headers_mut() = headers;
    Ok(head)
}

fn clone_head(head: &Request<()>) -> Request<()> {
    let mut request = Request::new(());
    *request.method_mut() = head.method().clone();
    *request.uri_mut() = head.uri().clone();
    *request.version_mut() = head.version();
    *request.headers_mut() = head.headers().clone();
    request
}

fn is_refused(e: &h2::Error) -> bool {
    e.reason() == Some(Reason::REFUSED_STREAM)
}

async fn send(head: &Request<()>, body: Body, slot: StreamSlot, timeout: Duration) -> Attempt {
    let origin = slot.origin.clone();
    let session_id = slot.session_id();
    let pool = slot.pool.clone();

    let mut sender = match slot.handle.sender.clone().ready().await {
        Ok(sender) => sender,
        Err(e) => return Attempt::Done(Err(ProxyError::UpstreamStream(e.to_string()))),
    };

    let bodiless = matches!(*head.method(), Method::GET | Method::HEAD) || body.is_end_stream();
    let (response, stream) = match sender.send_request(clone_head(head), bodiless) {
        Ok(pair) => pair,
        Err(e) if is_refused(&e) => {
            pool.mark_refused(&origin, session_id);
            drop(slot);
            return Attempt::Refused(body);
        }
        Err(e) => return Attempt::Done(Err(ProxyError::UpstreamStream(e.to_string()))),
    };

    let pump = if bodiless {
        drop(stream);
        None
    } else {
        Some(tokio::spawn(pump_body(body, stream)))
    };

    let response = match tokio::time::timeout(timeout, response).await {
        Ok(Ok(response)) => response,
        Ok(Err(e)) if is_refused(&e) && pump.is_none() => {
            pool.mark_refused(&origin, session_id);
            drop(slot);
            return Attempt::Refused(Body::empty());
        }
        Ok(Err(e)) => {
            if let Some(pump) = pump {
                pump.abort();
            }
            if is_refused(&e) {
                pool.mark_refused(&origin, session_id);
            }
            return Attempt::Done(Err(ProxyError::UpstreamStream(e.to_string())));
        }
        Err(_) => {
            if let Some(pump) = pump {
                pump.abort();
            }
            tracing::warn!(origin = %origin, timeout_ms = timeout.as_millis() as u64, "Upstream response timed out");
            return Attempt::Done(Err(ProxyError::GatewayTimeout(timeout.as_millis() as u64)));
        }
    };

    let (parts, recv) = response.into_parts();
    Attempt::Done(Ok(Response::from_parts(parts, response_body(recv, slot))))
}

/// Stream the client body upstream, honouring the peer's flow control.
async fn pump_body(body: Body, mut stream: SendStream<Bytes>) {
    if let Err(e) = pump(body, &mut stream).await {
        tracing::debug!(error = %e, "Request body upload aborted");
        stream.send_reset(Reason::CANCEL);
    }
}

async fn pump(mut body: Body, stream: &mut SendStream<Bytes>) -> Result<(), ProxyError> {
    let upstream = |e: h2::Error| ProxyError::UpstreamStream(e.to_string());

    while let Some(frame) = body.frame().await {
        let frame = frame.map_err(|e| ProxyError::UpstreamStream(format!("client body: {}", e)))?;
        let frame = match frame.into_data() {
            Ok(mut data) => {
                while !data.is_empty() {
                    stream.reserve_capacity(data.len());
                    let granted = match poll_fn(|cx| stream.poll_capacity(cx)).await {
                        Some(granted) => granted.map_err(upstream)?,
                        None => return Err(ProxyError::UpstreamStream("stream closed".into())),
                    };
                    if granted == 0 {
                        continue;
                    }
                    let chunk = data.split_to(granted.min(data.len()));
                    stream.send_data(chunk, false).map_err(upstream)?;
                }
                continue;
            }
            Err(frame) => frame,
        };
        if let Ok(trailers) = frame.into_trailers() {
            return stream.send_trailers(trailers).map_err(upstream);
        }
    }

    stream.send_data(Bytes::new(), true).map_err(upstream)
}

/// Adapt an h2 response stream into a client body that holds `slot`.
fn response_body(recv: RecvStream, slot: StreamSlot) -> Body {
    let frames = futures_util::stream::unfold(Some((recv, slot)), |state| async move {
        let (mut recv, slot) = state?;
        match recv.data().await {
            Some(Ok(data)) => {
                let _ = recv.flow_control().release_capacity(data.len());
                Some((Ok(Frame::data(data)), Some((recv, slot))))
            }
            Some(Err(e)) => Some((Err(io::Error::other(e)), None)),
            None => match recv.trailers().await {
                Ok(Some(trailers)) => Some((Ok(Frame::trailers(trailers)), None)),
                Ok(None) => None,
                Err(e) => Some((Err(io::Error::other(e)), None)),
            },
        }
    });
    Body::new(StreamBody::new(frames))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::config::{PoolConfig, QueueConfig, RouteConfig};
    use crate::net::UpstreamTls;
    use tokio::net::TcpListener;

    /// h2c upstream that answers every stream with an empty 200, or refuses
    /// it when `refuse` is set. Counts the streams it sees.
    async fn start_h2(refuse: bool, hits: Arc<AtomicUsize>) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let hits = hits.clone();
                tokio::spawn(async move {
                    let Ok(mut connection) = h2::server::handshake(socket).await else {
                        return;
                    };
                    while let Some(Ok((_request, mut respond))) = connection.accept().await {
                        hits.fetch_add(1, Ordering::SeqCst);
                        if refuse {
                            respond.send_reset(Reason::REFUSED_STREAM);
                        } else {
                            let _ = respond.send_response(Response::new(()), true);
                        }
                    }
                });
            }
        });
        addr
    }

    fn single_stream_pool() -> Arc<ConnectionPool> {
        Arc::new(ConnectionPool::new(
            PoolConfig {
                default_max_concurrent_streams: 1,
                ..PoolConfig::default()
            },
            UpstreamTls::new().unwrap(),
        ))
    }

    fn admission_queue(timeout_ms: u64) -> AdmissionQueue {
        AdmissionQueue::new(&QueueConfig {
            max_size: 16,
            timeout_ms,
        })
    }

    async fn wait_for_queued(queue: &AdmissionQueue, origin: &Origin, count: usize) {
        for _ in 0..200 {
            if queue.len_for(origin) == count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("expected {count} queued requests");
    }

    fn spawn_admit(
        pool: &Arc<ConnectionPool>,
        queue: &AdmissionQueue,
        origin: &Origin,
    ) -> tokio::task::JoinHandle<Result<StreamSlot, ProxyError>> {
        let (pool, queue, origin) = (pool.clone(), queue.clone(), origin.clone());
        tokio::spawn(async move { admit(&pool, &queue, &origin, &ConnectOptions::default(), false).await })
    }

    #[tokio::test]
    async fn repeated_refusals_end_in_bad_gateway() {
        let hits = Arc::new(AtomicUsize::new(0));
        let addr = start_h2(true, hits.clone()).await;
        let route = NormalizedRoute::from_config(&RouteConfig::new("api", "/", format!("http://{}", addr))).unwrap();
        let origin = Origin::parse(&format!("http://{}", addr)).unwrap();
        let pool = single_stream_pool();
        let queue = admission_queue(5_000);

        let request = H2Request {
            method: Method::GET,
            path_and_query: "/".to_string(),
            headers: HeaderMap::new(),
        };
        let outcome = tokio::time::timeout(
            Duration::from_secs(2),
            forward(&pool, &queue, &route, &origin, request, Body::empty()),
        )
        .await
        .expect("refused requests must not retry forever");

        match outcome {
            Err(e @ ProxyError::UpstreamStream(_)) => {
                assert_eq!(e.status(), axum::http::StatusCode::BAD_GATEWAY)
            }
            Err(other) => panic!("expected a stream error, got {other}"),
            Ok(response) => panic!("expected a stream error, got {}", response.status()),
        }
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert!(queue.is_empty());
        assert_eq!(pool.stats()[0].active_streams, 0);
    }

    #[tokio::test]
    async fn freed_stream_goes_to_the_oldest_waiter() {
        let addr = start_h2(false, Arc::new(AtomicUsize::new(0))).await;
        let origin = Origin::parse(&format!("http://{}", addr)).unwrap();
        let pool = single_stream_pool();
        let queue = admission_queue(5_000);

        let holder = spawn_admit(&pool, &queue, &origin).await.unwrap().unwrap();
        let waiter = spawn_admit(&pool, &queue, &origin);
        wait_for_queued(&queue, &origin, 1).await;

        drop(holder);
        // Reserved for the waiter before anyone else could look.
        assert!(!pool.has_capacity(&origin));
        let newcomer = spawn_admit(&pool, &queue, &origin);

        let granted = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        wait_for_queued(&queue, &origin, 1).await;
        assert!(!newcomer.is_finished());

        drop(granted);
        let next = tokio::time::timeout(Duration::from_secs(1), newcomer)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(queue.is_empty());
        drop(next);
        assert!(pool.has_capacity(&origin));
    }

    #[tokio::test]
    async fn waiter_is_served_first_and_late_arrival_times_out() {
        let addr = start_h2(false, Arc::new(AtomicUsize::new(0))).await;
        let origin = Origin::parse(&format!("http://{}", addr)).unwrap();
        let pool = single_stream_pool();
        let queue = admission_queue(200);

        let holder = spawn_admit(&pool, &queue, &origin).await.unwrap().unwrap();
        let started = std::time::Instant::now();
        let waiter = spawn_admit(&pool, &queue, &origin);
        wait_for_queued(&queue, &origin, 1).await;

        // The waiter holds the stream from the first release on; it never
        // waits past its deadline.
        drop(holder);
        let granted = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(granted.is_ok());
        assert!(started.elapsed() < Duration::from_millis(200));

        let late = spawn_admit(&pool, &queue, &origin);
        let outcome = tokio::time::timeout(Duration::from_secs(2), late).await.unwrap().unwrap();
        assert!(matches!(outcome, Err(ProxyError::QueueTimeout)));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn lost_session_sends_waiters_to_reconnect() {
        let addr = start_h2(false, Arc::new(AtomicUsize::new(0))).await;
        let origin = Origin::parse(&format!("http://{}", addr)).unwrap();
        let pool = single_stream_pool();
        let queue = admission_queue(5_000);

        let holder = spawn_admit(&pool, &queue, &origin).await.unwrap().unwrap();
        let waiter = spawn_admit(&pool, &queue, &origin);
        wait_for_queued(&queue, &origin, 1).await;

        pool.close_all();
        drop(holder);
        let slot = tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.stats()[0].session_id, slot.session_id());
    }
}
