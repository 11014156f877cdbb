//! Telemetry for the dispatcher.
//!
//! The scheduler describes what it does as [`DispatchEvent`]s and hands them to a sink. A sink is
//! any `tower::Service<DispatchEvent>`, so sinks compose with ordinary tower combinators.
//! Delivery is best effort: a sink that is not ready or fails simply loses the event. A slow
//! sink never stalls dispatching; once [`EVENT_BUFFER`] events are waiting for it, new ones are
//! dropped.
//!
//! ```rust
//! use ratelane::telemetry::{DispatchEvent, MemorySink};
//! use ratelane::route::bucket_key;
//! use http::Method;
//! use tower::Service;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let mut sink = MemorySink::new();
//! let key = bucket_key(&Method::GET, "/channels/1/messages");
//! sink.call(DispatchEvent::Queued { key, id: 1 }).await.unwrap();
//! assert_eq!(sink.len(), 1);
//! # }
//! ```

use crate::error::DispatchError;
use crate::executor::LimitScope;
use crate::route::BucketKey;
use std::convert::Infallible;
use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;
use tower::util::BoxCloneService;
use tower::{BoxError, Service, ServiceExt};

/// Events buffered for a slow sink before new ones are dropped.
pub const EVENT_BUFFER: usize = 1024;

/// A telemetry sink that consumes dispatch events.
pub trait TelemetrySink:
    Service<DispatchEvent, Response = (), Error = Self::SinkError> + Clone + Send + 'static
{
    /// The error type for this sink.
    type SinkError: std::error::Error + Send + Sync + 'static;
}

/// Type-erased sink held by the scheduler.
pub type BoxedSink = BoxCloneService<DispatchEvent, (), BoxError>;

/// Erase a sink's type.
pub fn boxed<S>(sink: S) -> BoxedSink
where
    S: TelemetrySink,
    S::Future: Send + 'static,
{
    BoxCloneService::new(sink.map_err(BoxError::from))
}

/// Best-effort emit helper that honors `poll_ready` and swallows errors.
pub async fn emit_best_effort<S>(sink: S, event: DispatchEvent)
where
    S: Service<DispatchEvent, Response = ()> + Send + 'static,
    S::Future: Send + 'static,
{
    if let Ok(mut ready_sink) = sink.ready_oneshot().await {
        let _ = ready_sink.call(event).await;
    }
}

/// Something the scheduler did with a request.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchEvent {
    /// Accepted and appended to its lane.
    Queued { key: BucketKey, id: u64 },
    /// An attempt was started. `attempt` starts at 1.
    Dispatched { key: BucketKey, id: u64, attempt: u32 },
    /// The caller received a response.
    Completed { key: BucketKey, id: u64, status: u16 },
    /// The caller received a terminal error.
    Failed { key: BucketKey, id: u64, error: DispatchError },
    /// The server rejected an attempt with 429; the request was requeued.
    RateLimited { key: BucketKey, id: u64, scope: LimitScope, retry_after: Duration },
    /// Every bucket is frozen for `duration`.
    GlobalLocked { duration: Duration },
    /// A transient failure will be retried after `delay`.
    RetryScheduled { key: BucketKey, id: u64, retry: u32, delay: Duration },
    /// The request waited past its deadline.
    Expired { key: BucketKey, id: u64, waited: Duration },
    /// The caller gave up on the request.
    Cancelled { key: BucketKey, id: u64 },
}

impl fmt::Display for DispatchEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchEvent::Queued { key, id } => write!(f, "Queued({key}, id={id})"),
            DispatchEvent::Dispatched { key, id, attempt } => {
                write!(f, "Dispatched({key}, id={id}, attempt={attempt})")
            }
            DispatchEvent::Completed { key, id, status } => {
                write!(f, "Completed({key}, id={id}, status={status})")
            }
            DispatchEvent::Failed { key, id, error } => {
                write!(f, "Failed({key}, id={id}, error={error})")
            }
            DispatchEvent::RateLimited { key, id, scope, retry_after } => {
                write!(f, "RateLimited({key}, id={id}, scope={scope:?}, retry_after={retry_after:?})")
            }
            DispatchEvent::GlobalLocked { duration } => write!(f, "GlobalLocked({duration:?})"),
            DispatchEvent::RetryScheduled { key, id, retry, delay } => {
                write!(f, "RetryScheduled({key}, id={id}, retry={retry}, delay={delay:?})")
            }
            DispatchEvent::Expired { key, id, waited } => {
                write!(f, "Expired({key}, id={id}, waited={waited:?})")
            }
            DispatchEvent::Cancelled { key, id } => write!(f, "Cancelled({key}, id={id})"),
        }
    }
}

type SinkFuture = Pin<Box<dyn std::future::Future<Output = Result<(), Infallible>> + Send>>;

/// Discards every event.
#[derive(Clone, Debug, Default)]
pub struct NullSink;

impl Service<DispatchEvent> for NullSink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _event: DispatchEvent) -> Self::Future {
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for NullSink {
    type SinkError = Infallible;
}

/// Logs every event through `tracing` at INFO level.
#[derive(Clone, Debug, Default)]
pub struct LogSink;

impl Service<DispatchEvent> for LogSink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: DispatchEvent) -> Self::Future {
        tracing::info!(event = %event, "dispatch_event");
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for LogSink {
    type SinkError = Infallible;
}

/// Keeps events in memory, evicting the oldest past its capacity.
///
/// Meant for tests and debugging.
#[derive(Clone, Debug)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<DispatchEvent>>>,
    capacity: usize,
    evicted: Arc<AtomicU64>,
}

impl MemorySink {
    /// Bounded sink (default cap: 10,000).
    pub fn new() -> Self {
        Self::with_capacity(10_000)
    }

    /// Bounded sink with explicit capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
            capacity: capacity.max(1),
            evicted: Arc::new(AtomicU64::new(0)),
        }
    }

    fn guard(&self) -> MutexGuard<'_, Vec<DispatchEvent>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Snapshot of the stored events.
    pub fn events(&self) -> Vec<DispatchEvent> {
        self.guard().clone()
    }

    /// Drop every stored event.
    pub fn clear(&self) {
        self.guard().clear();
    }

    /// Number of stored events.
    pub fn len(&self) -> usize {
        self.guard().len()
    }

    /// Whether nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.guard().is_empty()
    }

    /// Number of evicted events.
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl Service<DispatchEvent> for MemorySink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: DispatchEvent) -> Self::Future {
        let mut guard = self.guard();
        if guard.len() >= self.capacity {
            guard.remove(0);
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        guard.push(event);
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for MemorySink {
    type SinkError = Infallible;
}
