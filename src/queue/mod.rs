//! Per-origin request queue.
//!
//! # Data Flow
//! ```text
//! pool has no stream capacity
//!     → enqueue(origin) → QueueTicket (awaited by the request task)
//!         → timer fires first:  entry removed, ticket → QueueTimeout
//!         → capacity handed on: dequeue(origin) pops the oldest entry,
//!                               cancels its timer, resume(value) → ticket
//!         → ticket dropped:     entry removed, timer cancelled
//!         → shutdown:           clear(), ticket → ShuttingDown
//! ```
//!
//! # Design Decisions
//! - One global bound across all origins, FIFO per origin
//! - Entries are removed under the queue lock; the remover alone delivers
//!   the outcome, so each entry resolves exactly once
//! - Resumption is message passing (oneshot) and carries a payload, so a
//!   waiter can be handed the capacity it waited for
//! - Every entry has a fixed deadline; putting it back at the front keeps it

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tokio::task::AbortHandle;

use crate::config::QueueConfig;
use crate::error::ProxyError;
use crate::observability::metrics;
use crate::pool::Origin;

/// A request waiting for pool capacity.
pub struct QueuedRequest<T> {
    pub id: u64,
    pub origin: Origin,
    pub enqueued_at: Instant,
    pub deadline: Instant,
    resume: oneshot::Sender<Result<T, ProxyError>>,
    timer: Option<AbortHandle>,
}

impl<T> QueuedRequest<T> {
    /// Wake the waiting request with `value`.
    ///
    /// Hands `value` back if the request has already gone away.
    pub fn resume(mut self, value: T) -> Result<(), T> {
        self.cancel_timer();
        match self.resume.send(Ok(value)) {
            Ok(()) => Ok(()),
            Err(Ok(value)) => Err(value),
            Err(Err(_)) => Ok(()),
        }
    }

    /// The waiting request dropped its ticket.
    pub fn is_abandoned(&self) -> bool {
        self.resume.is_closed()
    }

    fn reject(mut self, error: ProxyError) {
        self.cancel_timer();
        let _ = self.resume.send(Err(error));
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

impl<T> std::fmt::Debug for QueuedRequest<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueuedRequest")
            .field("id", &self.id)
            .field("origin", &self.origin)
            .field("enqueued_at", &self.enqueued_at)
            .field("deadline", &self.deadline)
            .finish()
    }
}

/// Resolves once the queued request is resumed, timed out or cleared.
///
/// Dropping an unresolved ticket takes its entry out of the queue.
pub struct QueueTicket<T> {
    id: u64,
    origin: Origin,
    deadline: Instant,
    queue: RequestQueue<T>,
    rx: oneshot::Receiver<Result<T, ProxyError>>,
}

impl<T> QueueTicket<T> {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// When the queue gives up on this request.
    pub fn deadline(&self) -> Instant {
        self.deadline
    }
}

impl<T> Future for QueueTicket<T> {
    type Output = Result<T, ProxyError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            // Sender dropped without an outcome: the queue itself is gone.
            Poll::Ready(Err(_)) => Poll::Ready(Err(ProxyError::ShuttingDown)),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T> Drop for QueueTicket<T> {
    fn drop(&mut self) {
        // Already resolved entries are gone from the queue; this is a no-op.
        if let Some(mut entry) = self.queue.remove(&self.origin, self.id) {
            entry.cancel_timer();
            tracing::debug!(origin = %self.origin, queue_id = self.id, "Queued request abandoned");
        }
    }
}

impl<T> std::fmt::Debug for QueueTicket<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueTicket")
            .field("id", &self.id)
            .field("origin", &self.origin)
            .field("deadline", &self.deadline)
            .finish()
    }
}

struct QueueState<T> {
    origins: HashMap<Origin, VecDeque<QueuedRequest<T>>>,
    total: usize,
    next_id: u64,
}

impl<T> Default for QueueState<T> {
    fn default() -> Self {
        Self {
            origins: HashMap::new(),
            total: 0,
            next_id: 0,
        }
    }
}

impl<T> QueueState<T> {
    fn remove(&mut self, origin: &Origin, id: u64) -> Option<QueuedRequest<T>> {
        let entries = self.origins.get_mut(origin)?;
        let position = entries.iter().position(|e| e.id == id)?;
        let entry = entries.remove(position);
        if entries.is_empty() {
            self.origins.remove(origin);
        }
        if entry.is_some() {
            self.total -= 1;
        }
        entry
    }

    fn pop_front(&mut self, origin: &Origin) -> Option<QueuedRequest<T>> {
        let entries = self.origins.get_mut(origin)?;
        let entry = entries.pop_front();
        if entries.is_empty() {
            self.origins.remove(origin);
        }
        if entry.is_some() {
            self.total -= 1;
        }
        entry
    }
}

/// Where a new entry joins its origin's line.
#[derive(Clone, Copy)]
enum Place {
    Back,
    Front,
}

/// Bounded FIFO of requests waiting for upstream stream capacity.
///
/// `T` is what a resumed request receives.
pub struct RequestQueue<T> {
    state: Arc<Mutex<QueueState<T>>>,
    max_size: usize,
    timeout: Duration,
}

impl<T> Clone for RequestQueue<T> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            max_size: self.max_size,
            timeout: self.timeout,
        }
    }
}

impl<T> RequestQueue<T> {
    pub fn new(config: &QueueConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(QueueState::default())),
            max_size: config.max_size,
            timeout: config.timeout(),
        }
    }

    fn remove(&self, origin: &Origin, id: u64) -> Option<QueuedRequest<T>> {
        let mut state = self.state.lock().expect("queue mutex poisoned");
        let entry = state.remove(origin, id)?;
        metrics::set_queue_depth(state.total);
        Some(entry)
    }

    /// Pop the oldest entry for `origin`, cancelling its timer.
    pub fn dequeue(&self, origin: &Origin) -> Option<QueuedRequest<T>> {
        let mut state = self.state.lock().expect("queue mutex poisoned");
        let mut entry = state.pop_front(origin)?;
        metrics::set_queue_depth(state.total);
        entry.cancel_timer();
        Some(entry)
    }

    /// Reject every queued request; used on shutdown.
    pub fn clear(&self) {
        let drained: Vec<QueuedRequest<T>> = {
            let mut state = self.state.lock().expect("queue mutex poisoned");
            state.total = 0;
            metrics::set_queue_depth(0);
            state.origins.drain().flat_map(|(_, entries)| entries).collect()
        };
        if !drained.is_empty() {
            tracing::info!(rejected = drained.len(), "Clearing request queue");
        }
        for entry in drained {
            entry.reject(ProxyError::ShuttingDown);
        }
    }

    /// Total queued requests.
    pub fn len(&self) -> usize {
        self.state.lock().expect("queue mutex poisoned").total
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn len_for(&self, origin: &Origin) -> usize {
        self.state
            .lock()
            .expect("queue mutex poisoned")
            .origins
            .get(origin)
            .map_or(0, VecDeque::len)
    }
}

impl<T: Send + 'static> RequestQueue<T> {
    /// Admit a request for `origin`, or reject with `QueueFull`.
    ///
    /// Must be called from within a Tokio runtime (the entry's timer is a task).
    pub fn enqueue(&self, origin: &Origin) -> Result<QueueTicket<T>, ProxyError> {
        let deadline = Instant::now() + self.timeout;
        self.insert(origin, deadline, Place::Back)
    }

    /// Put a request that was already admitted back at the head of its
    /// origin's line, keeping its original deadline.
    ///
    /// Not subject to the size bound: the request held a place before.
    pub fn requeue(&self, origin: &Origin, deadline: Instant) -> Result<QueueTicket<T>, ProxyError> {
        self.insert(origin, deadline, Place::Front)
    }

    fn insert(&self, origin: &Origin, deadline: Instant, place: Place) -> Result<QueueTicket<T>, ProxyError> {
        let mut state = self.state.lock().expect("queue mutex poisoned");
        if matches!(place, Place::Back) && state.total >= self.max_size {
            drop(state);
            tracing::warn!(origin = %origin, max_size = self.max_size, "Request queue full, rejecting request");
            metrics::record_queue_rejection("full");
            return Err(ProxyError::QueueFull);
        }

        state.next_id += 1;
        let id = state.next_id;
        let (tx, rx) = oneshot::channel();

        let timer = {
            let queue = self.clone();
            let origin = origin.clone();
            tokio::spawn(async move {
                tokio::time::sleep_until(deadline.into()).await;
                queue.expire(&origin, id);
            })
            .abort_handle()
        };

        let entry = QueuedRequest {
            id,
            origin: origin.clone(),
            enqueued_at: Instant::now(),
            deadline,
            resume: tx,
            timer: Some(timer),
        };
        let line = state.origins.entry(origin.clone()).or_default();
        match place {
            Place::Back => line.push_back(entry),
            Place::Front => line.push_front(entry),
        }
        state.total += 1;
        metrics::set_queue_depth(state.total);
        tracing::debug!(origin = %origin, queue_id = id, queued = state.total, "Request queued for stream capacity");

        Ok(QueueTicket {
            id,
            origin: origin.clone(),
            deadline,
            queue: self.clone(),
            rx,
        })
    }

    /// Put a dequeued entry back at the head of its line, deadline unchanged.
    pub fn restore(&self, mut entry: QueuedRequest<T>) {
        if entry.is_abandoned() {
            return;
        }
        let timer = {
            let queue = self.clone();
            let origin = entry.origin.clone();
            let (id, deadline) = (entry.id, entry.deadline);
            tokio::spawn(async move {
                tokio::time::sleep_until(deadline.into()).await;
                queue.expire(&origin, id);
            })
            .abort_handle()
        };
        entry.timer = Some(timer);

        let mut state = self.state.lock().expect("queue mutex poisoned");
        state.origins.entry(entry.origin.clone()).or_default().push_front(entry);
        state.total += 1;
        metrics::set_queue_depth(state.total);
    }

    fn expire(&self, origin: &Origin, id: u64) {
        if let Some(mut entry) = self.remove(origin, id) {
            // The timer is this task; nothing to abort.
            entry.timer = None;
            tracing::warn!(
                origin = %origin,
                queue_id = id,
                waited_ms = entry.enqueued_at.elapsed().as_millis() as u64,
                "Queued request timed out"
            );
            metrics::record_queue_rejection("timeout");
            entry.reject(ProxyError::QueueTimeout);
        }
    }

    /// Resume the oldest live waiter for `origin` with `value`.
    ///
    /// Entries whose request has already gone away are discarded; `value`
    /// comes back when no waiter takes it.
    pub fn resume_next(&self, origin: &Origin, mut value: T) -> Result<(), T> {
        while let Some(entry) = self.dequeue(origin) {
            let id = entry.id;
            let waited = entry.enqueued_at.elapsed();
            match entry.resume(value) {
                Ok(()) => {
                    tracing::debug!(origin = %origin, queue_id = id, waited_ms = waited.as_millis() as u64, "Resumed queued request");
                    return Ok(());
                }
                Err(returned) => value = returned,
            }
        }
        Err(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue(max_size: usize, timeout_ms: u64) -> RequestQueue<()> {
        RequestQueue::new(&QueueConfig { max_size, timeout_ms })
    }

    fn origin(port: u16) -> Origin {
        Origin::parse(&format!("http://127.0.0.1:{}", port)).unwrap()
    }

    #[tokio::test]
    async fn fifo_per_origin() {
        let q = queue(10, 5_000);
        let a = q.enqueue(&origin(1)).unwrap();
        let b = q.enqueue(&origin(1)).unwrap();
        let _other = q.enqueue(&origin(2)).unwrap();

        let first = q.dequeue(&origin(1)).unwrap();
        assert_eq!(first.id, a.id());
        let second = q.dequeue(&origin(1)).unwrap();
        assert_eq!(second.id, b.id());
        assert!(q.dequeue(&origin(1)).is_none());
        assert_eq!(q.len_for(&origin(2)), 1);

        assert!(first.resume(()).is_ok());
        assert!(a.await.is_ok());
    }

    #[tokio::test]
    async fn rejects_beyond_max_size() {
        let q = queue(2, 5_000);
        let _a = q.enqueue(&origin(1)).unwrap();
        let _b = q.enqueue(&origin(2)).unwrap();
        assert!(matches!(q.enqueue(&origin(1)), Err(ProxyError::QueueFull)));
        assert_eq!(q.len(), 2);
    }

    #[tokio::test]
    async fn times_out_no_earlier_than_configured() {
        let q = queue(10, 100);
        let started = Instant::now();
        let ticket = q.enqueue(&origin(1)).unwrap();

        let outcome = ticket.await;
        let elapsed = started.elapsed();
        assert!(matches!(outcome, Err(ProxyError::QueueTimeout)));
        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed < Duration::from_millis(2_000));
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn dequeued_entry_never_times_out() {
        let q = queue(10, 50);
        let ticket = q.enqueue(&origin(1)).unwrap();
        let entry = q.dequeue(&origin(1)).unwrap();

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(entry.resume(()).is_ok());
        assert!(ticket.await.is_ok());
    }

    #[tokio::test]
    async fn clear_rejects_everything() {
        let q = queue(10, 5_000);
        let a = q.enqueue(&origin(1)).unwrap();
        let b = q.enqueue(&origin(2)).unwrap();

        q.clear();
        assert!(q.is_empty());
        assert!(matches!(a.await, Err(ProxyError::ShuttingDown)));
        assert!(matches!(b.await, Err(ProxyError::ShuttingDown)));
    }

    #[tokio::test]
    async fn dropped_ticket_frees_its_place() {
        let q = queue(1, 5_000);
        let ticket = q.enqueue(&origin(1)).unwrap();
        assert!(matches!(q.enqueue(&origin(1)), Err(ProxyError::QueueFull)));

        drop(ticket);
        assert!(q.is_empty());
        assert_eq!(q.len_for(&origin(1)), 0);
        let _again = q.enqueue(&origin(1)).unwrap();
        assert_eq!(q.len(), 1);
    }

    #[tokio::test]
    async fn dropping_a_resolved_ticket_leaves_others_alone() {
        let q = queue(10, 5_000);
        let first = q.enqueue(&origin(1)).unwrap();
        let _second = q.enqueue(&origin(1)).unwrap();

        assert!(q.resume_next(&origin(1), ()).is_ok());
        assert!(first.await.is_ok());
        assert_eq!(q.len_for(&origin(1)), 1);
    }

    #[tokio::test]
    async fn resume_next_hands_payload_to_oldest_live_waiter() {
        let q: RequestQueue<u32> = RequestQueue::new(&QueueConfig {
            max_size: 10,
            timeout_ms: 5_000,
        });
        let gone = q.enqueue(&origin(1)).unwrap();
        let alive = q.enqueue(&origin(1)).unwrap();
        drop(gone);

        assert_eq!(q.resume_next(&origin(1), 7), Ok(()));
        assert_eq!(alive.await.unwrap(), 7);
        assert_eq!(q.resume_next(&origin(1), 8), Err(8));
    }

    #[tokio::test]
    async fn resume_returns_payload_when_waiter_left() {
        let q: RequestQueue<u32> = RequestQueue::new(&QueueConfig {
            max_size: 10,
            timeout_ms: 5_000,
        });
        let ticket = q.enqueue(&origin(1)).unwrap();
        let entry = q.dequeue(&origin(1)).unwrap();
        assert!(!entry.is_abandoned());

        drop(ticket);
        assert!(entry.is_abandoned());
        assert_eq!(entry.resume(3), Err(3));
    }

    #[tokio::test]
    async fn requeue_goes_first_and_keeps_its_deadline() {
        let q = queue(1, 5_000);
        let waiting = q.enqueue(&origin(1)).unwrap();
        let deadline = Instant::now() + Duration::from_millis(80);

        let started = Instant::now();
        let returning = q.requeue(&origin(1), deadline).unwrap();
        assert_eq!(q.len(), 2);
        assert_eq!(q.dequeue(&origin(1)).unwrap().id, returning.id());
        let back = q.requeue(&origin(1), deadline).unwrap();

        assert!(matches!(back.await, Err(ProxyError::QueueTimeout)));
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(80));
        assert!(elapsed < Duration::from_millis(2_000));
        assert_eq!(q.len_for(&origin(1)), 1);
        drop(waiting);
    }

    #[tokio::test]
    async fn restored_entry_keeps_its_place_and_deadline() {
        let q = queue(10, 100);
        let started = Instant::now();
        let first = q.enqueue(&origin(1)).unwrap();
        let second = q.enqueue(&origin(1)).unwrap();

        let entry = q.dequeue(&origin(1)).unwrap();
        assert_eq!(entry.id, first.id());
        q.restore(entry);
        assert_eq!(q.len(), 2);

        assert!(matches!(first.await, Err(ProxyError::QueueTimeout)));
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed < Duration::from_millis(2_000));
        assert!(matches!(second.await, Err(ProxyError::QueueTimeout)));
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn restoring_an_abandoned_entry_drops_it() {
        let q = queue(10, 5_000);
        let ticket = q.enqueue(&origin(1)).unwrap();
        let entry = q.dequeue(&origin(1)).unwrap();
        drop(ticket);

        q.restore(entry);
        assert!(q.is_empty());
    }
}
