//! The single owner of all rate-limit state.
//!
//! [`SchedulerCore`] is a synchronous state machine: every method takes the current instant, so
//! admission, completion handling and wakeup computation are tested without a runtime.
//! [`Scheduler::run`] drives it from one tokio task. Commands arrive on an unbounded channel,
//! attempts run in spawned tasks, and their classifications come back on a completion channel.
//! Only admission is serialized; requests on different lanes are on the wire concurrently.
//!
//! A lane is the FIFO queue of one [`BucketKey`]. A lane has at most one attempt in flight, so a
//! request is resolved before the next one in its lane is dispatched.

use crate::backoff::RetryPolicy;
use crate::bucket::{BucketSnapshot, BucketTable};
use crate::error::DispatchError;
use crate::executor::{Classification, HttpExecutor, LimitScope};
use crate::global::GlobalLock;
use crate::headers::RateLimitHeaders;
use crate::request::Request;
use crate::response::Response;
use crate::route::BucketKey;
use crate::telemetry::DispatchEvent;
use std::collections::{HashMap, VecDeque};
use std::mem;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

pub(crate) type Reply = oneshot::Sender<Result<Response, DispatchError>>;

/// A request waiting in its lane.
#[derive(Debug)]
pub(crate) struct Queued {
    pub(crate) id: u64,
    pub(crate) key: BucketKey,
    pub(crate) request: Request,
    pub(crate) reply: Reply,
    pub(crate) submitted_at: Instant,
    pub(crate) deadline: Option<Instant>,
    pub(crate) retries: u32,
    pub(crate) attempts: u32,
}

impl Queued {
    pub(crate) fn new(
        id: u64,
        request: Request,
        reply: Reply,
        submitted_at: Instant,
        deadline: Option<Instant>,
    ) -> Self {
        let key = BucketKey::from(&request);
        Self { id, key, request, reply, submitted_at, deadline, retries: 0, attempts: 0 }
    }

    fn fulfill(self, result: Result<Response, DispatchError>) {
        // the caller may already be gone
        let _ = self.reply.send(result);
    }
}

/// Messages accepted by the scheduler task.
#[derive(Debug)]
pub(crate) enum Command {
    Submit(Queued),
    Cancel { key: BucketKey, id: u64 },
    Bucket { key: BucketKey, reply: oneshot::Sender<Option<BucketSnapshot>> },
    GlobalLock { reply: oneshot::Sender<Option<Instant>> },
}

/// An attempt the run loop must start.
#[derive(Debug)]
pub(crate) struct Attempt {
    pub(crate) key: BucketKey,
    pub(crate) id: u64,
    pub(crate) request: Request,
    pub(crate) attempt: u32,
}

#[derive(Debug)]
struct InFlight {
    queued: Queued,
    cancelled: bool,
}

#[derive(Debug, Default)]
struct Lane {
    pending: VecDeque<Queued>,
    in_flight: Option<InFlight>,
    not_before: Option<Instant>,
}

impl Lane {
    fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.in_flight.is_none()
    }
}

/// Admission, completion and expiry rules.
#[derive(Debug)]
pub(crate) struct SchedulerCore {
    buckets: BucketTable,
    global: GlobalLock,
    lanes: HashMap<BucketKey, Lane>,
    retry: RetryPolicy,
    events: Vec<DispatchEvent>,
}

impl SchedulerCore {
    pub(crate) fn new(retry: RetryPolicy) -> Self {
        Self {
            buckets: BucketTable::new(),
            global: GlobalLock::new(),
            lanes: HashMap::new(),
            retry,
            events: Vec::new(),
        }
    }

    pub(crate) fn handle(&mut self, command: Command, now: Instant) {
        match command {
            Command::Submit(queued) => self.submit(queued),
            Command::Cancel { key, id } => self.cancel(&key, id),
            Command::Bucket { key, reply } => {
                let _ = reply.send(self.buckets.snapshot(&key));
            }
            Command::GlobalLock { reply } => {
                let _ = reply.send(self.global.active_until(now));
            }
        }
    }

    pub(crate) fn submit(&mut self, queued: Queued) {
        if queued.reply.is_closed() {
            return;
        }
        tracing::debug!(key = %queued.key, request_id = queued.id, "request queued");
        self.events.push(DispatchEvent::Queued { key: queued.key.clone(), id: queued.id });
        self.lanes.entry(queued.key.clone()).or_default().pending.push_back(queued);
    }

    pub(crate) fn cancel(&mut self, key: &BucketKey, id: u64) {
        let Some(lane) = self.lanes.get_mut(key) else {
            return;
        };
        if let Some(position) = lane.pending.iter().position(|q| q.id == id) {
            if let Some(queued) = lane.pending.remove(position) {
                tracing::debug!(key = %key, request_id = id, "queued request cancelled");
                queued.fulfill(Err(DispatchError::Cancelled));
                self.events.push(DispatchEvent::Cancelled { key: key.clone(), id });
            }
            return;
        }
        if let Some(in_flight) = lane.in_flight.as_mut().filter(|f| f.queued.id == id) {
            tracing::debug!(key = %key, request_id = id, "in-flight request cancelled");
            in_flight.cancelled = true;
            self.events.push(DispatchEvent::Cancelled { key: key.clone(), id });
        }
    }

    /// Drop abandoned requests and time out those past their deadline.
    pub(crate) fn expire(&mut self, now: Instant) {
        for (key, lane) in self.lanes.iter_mut() {
            let pending = mem::take(&mut lane.pending);
            for queued in pending {
                if queued.reply.is_closed() {
                    self.events.push(DispatchEvent::Cancelled { key: key.clone(), id: queued.id });
                } else if queued.deadline.is_some_and(|deadline| now >= deadline) {
                    let waited = now.saturating_duration_since(queued.submitted_at);
                    tracing::warn!(key = %key, request_id = queued.id, ?waited, "request expired in queue");
                    self.events.push(DispatchEvent::Expired { key: key.clone(), id: queued.id, waited });
                    queued.fulfill(Err(DispatchError::Timeout { waited }));
                } else {
                    lane.pending.push_back(queued);
                }
            }
        }
        self.lanes.retain(|_, lane| !lane.is_idle());
    }

    /// Start every attempt that is admissible at `now`.
    pub(crate) fn dispatch_ready(&mut self, now: Instant) -> Vec<Attempt> {
        let mut attempts = Vec::new();
        if self.global.is_active(now) {
            return attempts;
        }
        for (key, lane) in self.lanes.iter_mut() {
            if lane.in_flight.is_some() || lane.pending.is_empty() {
                continue;
            }
            if lane.not_before.is_some_and(|not_before| now < not_before) {
                continue;
            }
            lane.not_before = None;
            if !self.buckets.has_capacity(key, now) {
                continue;
            }
            let Some(mut queued) = lane.pending.pop_front() else {
                continue;
            };
            self.buckets.consume(key, now);
            queued.attempts += 1;
            tracing::debug!(key = %key, request_id = queued.id, attempt = queued.attempts, "dispatching");
            self.events.push(DispatchEvent::Dispatched {
                key: key.clone(),
                id: queued.id,
                attempt: queued.attempts,
            });
            attempts.push(Attempt {
                key: key.clone(),
                id: queued.id,
                request: queued.request.clone(),
                attempt: queued.attempts,
            });
            lane.in_flight = Some(InFlight { queued, cancelled: false });
        }
        attempts
    }

    /// Apply the outcome of an attempt.
    pub(crate) fn complete(
        &mut self,
        key: &BucketKey,
        id: u64,
        classification: Classification,
        now: Instant,
    ) {
        let Some(lane) = self.lanes.get_mut(key) else {
            tracing::warn!(key = %key, request_id = id, "completion for unknown lane");
            return;
        };
        let in_flight = match lane.in_flight.take() {
            Some(in_flight) if in_flight.queued.id == id => in_flight,
            other => {
                lane.in_flight = other;
                tracing::warn!(key = %key, request_id = id, "completion for request not in flight");
                return;
            }
        };

        if let Some(limits) = classification.limits() {
            apply_limits(&mut self.buckets, key, &limits, now);
        }

        if let Classification::RateLimited { scope, retry_after, .. } = &classification {
            self.hold(key, id, *scope, *retry_after, now);
        }

        let InFlight { queued, cancelled } = in_flight;
        if cancelled {
            queued.fulfill(Err(DispatchError::Cancelled));
            return;
        }

        match classification {
            Classification::Success(response) => {
                let status = response.status().as_u16();
                tracing::debug!(key = %key, request_id = id, status, "request completed");
                self.events.push(DispatchEvent::Completed { key: key.clone(), id, status });
                queued.fulfill(Ok(response));
            }
            Classification::RateLimited { scope, retry_after, .. } => {
                self.events.push(DispatchEvent::RateLimited { key: key.clone(), id, scope, retry_after });
                self.requeue(queued);
            }
            Classification::Invalid { message } => {
                self.fail(queued, DispatchError::InvalidRequest(message));
            }
            Classification::ClientError { status, code, message, .. } => {
                self.fail(queued, DispatchError::ClientError { status: status.as_u16(), code, message });
            }
            Classification::ServerError { status, .. } => {
                let error = DispatchError::ServerError { status: status.as_u16(), attempts: queued.attempts };
                self.retry_or_fail(queued, error, now);
            }
            Classification::TransportError { cause } => {
                let error = DispatchError::Transport { cause, attempts: queued.attempts };
                self.retry_or_fail(queued, error, now);
            }
        }
    }

    /// Apply a 429 to the shared limits. Runs even when the caller already gave up.
    fn hold(
        &mut self,
        key: &BucketKey,
        id: u64,
        scope: LimitScope,
        retry_after: Duration,
        now: Instant,
    ) {
        let retry_after_ms = retry_after.as_millis() as u64;
        match scope {
            LimitScope::Global => {
                self.global.activate(now, retry_after);
                tracing::warn!(key = %key, request_id = id, retry_after_ms, "global rate limit hit");
                self.events.push(DispatchEvent::GlobalLocked { duration: retry_after });
            }
            LimitScope::Bucket => {
                self.buckets.defer(key, now + retry_after, now);
                tracing::warn!(key = %key, request_id = id, retry_after_ms, "bucket rate limit hit");
            }
        }
    }

    fn retry_or_fail(&mut self, mut queued: Queued, error: DispatchError, now: Instant) {
        let retry = queued.retries + 1;
        if !self.retry.allows(retry) {
            self.fail(queued, error);
            return;
        }
        queued.retries = retry;
        let delay = self.retry.delay(retry);
        tracing::warn!(
            key = %queued.key,
            request_id = queued.id,
            retry,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "retrying transient failure"
        );
        self.events.push(DispatchEvent::RetryScheduled {
            key: queued.key.clone(),
            id: queued.id,
            retry,
            delay,
        });
        if let Some(lane) = self.lanes.get_mut(&queued.key) {
            lane.not_before = Some(now + delay);
        }
        self.requeue(queued);
    }

    fn requeue(&mut self, queued: Queued) {
        if queued.reply.is_closed() {
            self.events.push(DispatchEvent::Cancelled { key: queued.key.clone(), id: queued.id });
            return;
        }
        self.lanes.entry(queued.key.clone()).or_default().pending.push_front(queued);
    }

    fn fail(&mut self, queued: Queued, error: DispatchError) {
        tracing::error!(key = %queued.key, request_id = queued.id, status = ?error.status(), error = %error, "request failed");
        self.events.push(DispatchEvent::Failed {
            key: queued.key.clone(),
            id: queued.id,
            error: error.clone(),
        });
        queued.fulfill(Err(error));
    }

    /// Earliest instant at which something may change without outside input.
    pub(crate) fn next_wakeup(&self, now: Instant) -> Option<Instant> {
        let global = self.global.active_until(now);
        let mut next = global;
        for (key, lane) in &self.lanes {
            for deadline in lane.pending.iter().filter_map(|q| q.deadline) {
                next = earliest(next, deadline);
            }
            if global.is_some() || lane.in_flight.is_some() || lane.pending.is_empty() {
                continue;
            }
            if let Some(not_before) = lane.not_before.filter(|t| now < *t) {
                next = earliest(next, not_before);
                continue;
            }
            if let Some(bucket) = self.buckets.get(key) {
                if bucket.remaining() == 0 && bucket.reset_at() > now {
                    next = earliest(next, bucket.reset_at());
                }
            }
        }
        next
    }

    /// Nothing queued and nothing in flight.
    pub(crate) fn is_idle(&self) -> bool {
        self.lanes.values().all(Lane::is_idle)
    }

    pub(crate) fn take_events(&mut self) -> Vec<DispatchEvent> {
        mem::take(&mut self.events)
    }

    #[cfg(test)]
    fn queued_ids(&self, key: &BucketKey) -> Vec<u64> {
        self.lanes.get(key).map(|lane| lane.pending.iter().map(|q| q.id).collect()).unwrap_or_default()
    }

    #[cfg(test)]
    fn buckets(&mut self) -> &mut BucketTable {
        &mut self.buckets
    }
}

fn earliest(current: Option<Instant>, candidate: Instant) -> Option<Instant> {
    Some(current.map_or(candidate, |current| current.min(candidate)))
}

fn apply_limits(buckets: &mut BucketTable, key: &BucketKey, limits: &RateLimitHeaders, now: Instant) {
    if let Some(hash) = &limits.bucket {
        buckets.link(key, hash, now);
    }
    if let Some((limit, remaining, reset_after)) = limits.window() {
        buckets.update_from_headers(key, limit, remaining, reset_after, now);
    }
}

#[derive(Debug)]
struct Completion {
    key: BucketKey,
    id: u64,
    classification: Classification,
}

/// The scheduler task.
#[derive(Debug)]
pub(crate) struct Scheduler {
    core: SchedulerCore,
    executor: HttpExecutor,
    commands: mpsc::UnboundedReceiver<Command>,
    events: Option<mpsc::Sender<DispatchEvent>>,
}

impl Scheduler {
    pub(crate) fn new(
        core: SchedulerCore,
        executor: HttpExecutor,
        commands: mpsc::UnboundedReceiver<Command>,
        events: Option<mpsc::Sender<DispatchEvent>>,
    ) -> Self {
        Self { core, executor, commands, events }
    }

    /// Run until every dispatcher handle is gone and every request has been resolved.
    pub(crate) async fn run(mut self) {
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<Completion>();
        let mut open = true;

        loop {
            let now = Instant::now();
            self.core.expire(now);
            for attempt in self.core.dispatch_ready(now) {
                self.spawn_attempt(attempt, done_tx.clone());
            }
            self.flush_events();

            if !open && self.core.is_idle() {
                tracing::debug!("all dispatcher handles dropped, scheduler exiting");
                break;
            }

            let wakeup = self.core.next_wakeup(now);
            let timer = async move {
                match wakeup {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                command = self.commands.recv(), if open => match command {
                    Some(command) => self.core.handle(command, Instant::now()),
                    None => open = false,
                },
                Some(done) = done_rx.recv() => {
                    self.core.complete(&done.key, done.id, done.classification, Instant::now());
                }
                _ = timer => {}
            }
        }
        self.flush_events();
    }

    fn spawn_attempt(&self, attempt: Attempt, done: mpsc::UnboundedSender<Completion>) {
        let executor = self.executor.clone();
        tokio::spawn(async move {
            let Attempt { key, id, request, attempt } = attempt;
            let classification = executor.execute(&request).await;
            tracing::trace!(key = %key, request_id = id, attempt, transient = classification.is_transient(), "attempt finished");
            let _ = done.send(Completion { key, id, classification });
        });
    }

    fn flush_events(&mut self) {
        let events = self.core.take_events();
        if let Some(sink) = &self.events {
            let dropped = forward_events(sink, events);
            if dropped > 0 {
                tracing::debug!(dropped, "telemetry sink lagging, events dropped");
            }
        }
    }
}

/// Hand `events` to the telemetry forwarder without waiting. Returns how many were dropped
/// because the buffer was full or the forwarder is gone.
fn forward_events(sink: &mpsc::Sender<DispatchEvent>, events: Vec<DispatchEvent>) -> usize {
    let mut dropped = 0;
    for event in events {
        if sink.try_send(event).is_err() {
            dropped += 1;
        }
    }
    dropped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::{Backoff, Jitter};
    use crate::error::{TransportError, TransportErrorKind};
    use crate::response::RawResponse;
    use http::{HeaderMap, Method, StatusCode};
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    type Receiver = oneshot::Receiver<Result<Response, DispatchError>>;

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy::builder()
            .max_retries(max_retries)
            .backoff(Backoff::constant(Duration::from_millis(100)))
            .jitter(Jitter::None)
            .build()
            .unwrap()
    }

    fn queued(id: u64, path: &str, now: Instant) -> (Queued, Receiver) {
        let (tx, rx) = oneshot::channel();
        let request = Request::builder(Method::GET, path).build().unwrap();
        (Queued::new(id, request, tx, now, None), rx)
    }

    fn ok() -> Classification {
        Classification::Success(Response::from_raw(RawResponse::new(
            StatusCode::OK,
            HeaderMap::new(),
            "{}",
        )))
    }

    fn ok_with_window(limit: u32, remaining: u32, reset_after: Duration) -> Classification {
        let mut headers = HeaderMap::new();
        headers.insert(crate::headers::LIMIT, limit.to_string().parse().unwrap());
        headers.insert(crate::headers::REMAINING, remaining.to_string().parse().unwrap());
        headers.insert(
            crate::headers::RESET_AFTER,
            reset_after.as_secs_f64().to_string().parse().unwrap(),
        );
        Classification::Success(Response::from_raw(RawResponse::new(StatusCode::OK, headers, "{}")))
    }

    fn rate_limited(scope: LimitScope, retry_after: Duration) -> Classification {
        Classification::RateLimited { scope, retry_after, limits: RateLimitHeaders::default() }
    }

    fn server_error() -> Classification {
        Classification::ServerError {
            status: StatusCode::SERVICE_UNAVAILABLE,
            limits: RateLimitHeaders::default(),
        }
    }

    fn ids(attempts: &[Attempt]) -> Vec<u64> {
        attempts.iter().map(|a| a.id).collect()
    }

    #[test]
    fn one_attempt_per_lane_in_fifo_order() {
        let now = Instant::now();
        let mut core = SchedulerCore::new(policy(3));
        let (a, mut rx_a) = queued(1, "/channels/1/messages", now);
        let (b, mut rx_b) = queued(2, "/channels/1/messages", now);
        let key = a.key.clone();
        core.submit(a);
        core.submit(b);

        assert_eq!(ids(&core.dispatch_ready(now)), vec![1]);
        assert!(core.dispatch_ready(now).is_empty());

        core.complete(&key, 1, ok(), now);
        assert!(rx_a.try_recv().unwrap().is_ok());
        assert!(rx_b.try_recv().is_err());

        assert_eq!(ids(&core.dispatch_ready(now)), vec![2]);
        core.complete(&key, 2, ok(), now);
        assert!(rx_b.try_recv().unwrap().is_ok());
        assert!(core.is_idle());
    }

    #[test]
    fn different_lanes_dispatch_together() {
        let now = Instant::now();
        let mut core = SchedulerCore::new(policy(3));
        let (a, _rx_a) = queued(1, "/channels/1/messages", now);
        let (b, _rx_b) = queued(2, "/channels/2/messages", now);
        core.submit(a);
        core.submit(b);
        let mut dispatched = ids(&core.dispatch_ready(now));
        dispatched.sort();
        assert_eq!(dispatched, vec![1, 2]);
    }

    #[test]
    fn exhausted_bucket_waits_for_reset() {
        let now = Instant::now();
        let mut core = SchedulerCore::new(policy(3));
        let (a, _rx_a) = queued(1, "/channels/1/messages", now);
        let (b, _rx_b) = queued(2, "/channels/1/messages", now);
        let key = a.key.clone();
        core.submit(a);
        core.submit(b);

        core.dispatch_ready(now);
        core.complete(&key, 1, ok_with_window(5, 0, Duration::from_secs(2)), now);

        assert!(core.dispatch_ready(now).is_empty());
        assert_eq!(core.next_wakeup(now), Some(now + Duration::from_secs(2)));
        assert!(core.dispatch_ready(now + Duration::from_millis(1_999)).is_empty());
        assert_eq!(ids(&core.dispatch_ready(now + Duration::from_secs(2))), vec![2]);
    }

    #[test]
    fn bucket_rate_limit_requeues_at_front() {
        let now = Instant::now();
        let mut core = SchedulerCore::new(policy(3));
        let (a, mut rx_a) = queued(1, "/channels/1/messages", now);
        let (b, _rx_b) = queued(2, "/channels/1/messages", now);
        let key = a.key.clone();
        core.submit(a);
        core.submit(b);

        core.dispatch_ready(now);
        core.complete(&key, 1, rate_limited(LimitScope::Bucket, Duration::from_secs(2)), now);

        assert!(rx_a.try_recv().is_err(), "rate limits never reach the caller");
        assert_eq!(core.queued_ids(&key), vec![1, 2]);
        assert!(core.dispatch_ready(now + Duration::from_secs(1)).is_empty());
        assert_eq!(ids(&core.dispatch_ready(now + Duration::from_secs(2))), vec![1]);
    }

    #[test]
    fn global_rate_limit_holds_every_lane() {
        let now = Instant::now();
        let mut core = SchedulerCore::new(policy(3));
        let (a, _rx_a) = queued(1, "/channels/1/messages", now);
        let (b, _rx_b) = queued(2, "/guilds/9/members", now);
        let key = a.key.clone();
        core.submit(a);
        core.dispatch_ready(now);
        core.submit(b);
        core.complete(&key, 1, rate_limited(LimitScope::Global, Duration::from_secs(1)), now);

        assert!(core.dispatch_ready(now + Duration::from_millis(500)).is_empty());
        assert_eq!(core.next_wakeup(now), Some(now + Duration::from_secs(1)));
        let mut dispatched = ids(&core.dispatch_ready(now + Duration::from_secs(1)));
        dispatched.sort();
        assert_eq!(dispatched, vec![1, 2]);
    }

    #[test]
    fn server_errors_retry_with_backoff_then_fail() {
        let now = Instant::now();
        let mut core = SchedulerCore::new(policy(2));
        let (a, mut rx_a) = queued(1, "/gateway", now);
        let key = a.key.clone();
        core.submit(a);

        let mut t = now;
        for _ in 0..2 {
            assert_eq!(ids(&core.dispatch_ready(t)), vec![1]);
            core.complete(&key, 1, server_error(), t);
            assert!(core.dispatch_ready(t).is_empty(), "lane waits out the backoff");
            assert_eq!(core.next_wakeup(t), Some(t + Duration::from_millis(100)));
            t += Duration::from_millis(100);
        }
        assert_eq!(ids(&core.dispatch_ready(t)), vec![1]);
        core.complete(&key, 1, server_error(), t);

        assert_eq!(
            rx_a.try_recv().unwrap(),
            Err(DispatchError::ServerError { status: 503, attempts: 3 })
        );
    }

    #[test]
    fn transport_errors_report_last_cause() {
        let now = Instant::now();
        let mut core = SchedulerCore::new(policy(0));
        let (a, mut rx_a) = queued(1, "/gateway", now);
        let key = a.key.clone();
        core.submit(a);
        core.dispatch_ready(now);
        let cause = TransportError::new(TransportErrorKind::Connect, "refused");
        core.complete(&key, 1, Classification::TransportError { cause: cause.clone() }, now);
        assert_eq!(rx_a.try_recv().unwrap(), Err(DispatchError::Transport { cause, attempts: 1 }));
    }

    #[test]
    fn client_errors_are_not_retried() {
        let now = Instant::now();
        let mut core = SchedulerCore::new(policy(3));
        let (a, mut rx_a) = queued(1, "/channels/1", now);
        let key = a.key.clone();
        core.submit(a);
        core.dispatch_ready(now);
        core.complete(
            &key,
            1,
            Classification::ClientError {
                status: StatusCode::FORBIDDEN,
                code: Some(50013),
                message: "Missing Permissions".into(),
                limits: RateLimitHeaders::default(),
            },
            now,
        );
        assert!(matches!(
            rx_a.try_recv().unwrap(),
            Err(DispatchError::ClientError { status: 403, code: Some(50013), .. })
        ));
        assert!(core.is_idle());
    }

    #[test]
    fn cancelled_queued_request_is_removed() {
        let now = Instant::now();
        let mut core = SchedulerCore::new(policy(3));
        let (a, _rx_a) = queued(1, "/channels/1/messages", now);
        let (b, mut rx_b) = queued(2, "/channels/1/messages", now);
        let (c, _rx_c) = queued(3, "/channels/1/messages", now);
        let key = a.key.clone();
        core.submit(a);
        core.submit(b);
        core.submit(c);
        core.cancel(&key, 2);

        assert_eq!(core.queued_ids(&key), vec![1, 3]);
        assert_eq!(rx_b.try_recv().unwrap(), Err(DispatchError::Cancelled));
    }

    #[test]
    fn cancelled_in_flight_request_is_not_requeued() {
        let now = Instant::now();
        let mut core = SchedulerCore::new(policy(3));
        let (a, mut rx_a) = queued(1, "/channels/1/messages", now);
        let key = a.key.clone();
        core.submit(a);
        core.dispatch_ready(now);
        core.cancel(&key, 1);
        core.complete(&key, 1, rate_limited(LimitScope::Bucket, Duration::from_secs(1)), now);
        assert_eq!(rx_a.try_recv().unwrap(), Err(DispatchError::Cancelled));
        assert!(core.is_idle());
    }

    #[test]
    fn cancelled_in_flight_bucket_429_still_holds_the_bucket() {
        let now = Instant::now();
        let mut core = SchedulerCore::new(policy(3));
        let (a, _rx_a) = queued(1, "/channels/1/messages", now);
        let (b, _rx_b) = queued(2, "/channels/1/messages", now);
        let key = a.key.clone();
        core.submit(a);
        core.submit(b);
        core.dispatch_ready(now);
        core.cancel(&key, 1);
        core.complete(&key, 1, rate_limited(LimitScope::Bucket, Duration::from_secs(2)), now);

        assert_eq!(core.queued_ids(&key), vec![2]);
        assert!(core.dispatch_ready(now).is_empty());
        assert_eq!(core.next_wakeup(now), Some(now + Duration::from_secs(2)));
        assert!(core.dispatch_ready(now + Duration::from_millis(1_999)).is_empty());
        assert_eq!(ids(&core.dispatch_ready(now + Duration::from_secs(2))), vec![2]);
    }

    #[test]
    fn cancelled_in_flight_global_429_still_locks() {
        let now = Instant::now();
        let mut core = SchedulerCore::new(policy(3));
        let (a, _rx_a) = queued(1, "/channels/1/messages", now);
        let (b, _rx_b) = queued(2, "/guilds/9/members", now);
        let key = a.key.clone();
        core.submit(a);
        core.dispatch_ready(now);
        core.submit(b);
        core.cancel(&key, 1);
        core.complete(&key, 1, rate_limited(LimitScope::Global, Duration::from_secs(1)), now);

        assert_eq!(core.global.active_until(now), Some(now + Duration::from_secs(1)));
        assert!(core.dispatch_ready(now + Duration::from_millis(500)).is_empty());
        assert_eq!(ids(&core.dispatch_ready(now + Duration::from_secs(1))), vec![2]);
    }

    #[test]
    fn invalid_requests_fail_without_retry() {
        let now = Instant::now();
        let mut core = SchedulerCore::new(policy(3));
        let (a, mut rx_a) = queued(1, "/channels/1/messages", now);
        let key = a.key.clone();
        core.submit(a);
        core.dispatch_ready(now);
        core.complete(&key, 1, Classification::Invalid { message: "bad content type".into() }, now);

        assert_eq!(
            rx_a.try_recv().unwrap(),
            Err(DispatchError::InvalidRequest("bad content type".into()))
        );
        assert!(core.is_idle());
        assert!(core.next_wakeup(now).is_none());
    }

    #[test]
    fn dropped_replies_are_skipped() {
        let now = Instant::now();
        let mut core = SchedulerCore::new(policy(3));
        let (a, rx_a) = queued(1, "/channels/1/messages", now);
        let (b, _rx_b) = queued(2, "/channels/1/messages", now);
        let key = a.key.clone();
        core.submit(a);
        core.submit(b);
        drop(rx_a);
        core.expire(now);
        assert_eq!(ids(&core.dispatch_ready(now)), vec![2]);
    }

    #[test]
    fn deadline_expires_queued_requests() {
        let now = Instant::now();
        let mut core = SchedulerCore::new(policy(3));
        let (tx, mut rx) = oneshot::channel();
        let request = Request::builder(Method::GET, "/channels/1/messages").build().unwrap();
        let deadline = now + Duration::from_secs(5);
        let waiting = Queued::new(7, request, tx, now, Some(deadline));
        let key = waiting.key.clone();
        core.buckets().update_from_headers(&key, 1, 0, Duration::from_secs(60), now);
        core.submit(waiting);

        assert!(core.dispatch_ready(now).is_empty());
        assert_eq!(core.next_wakeup(now), Some(deadline));
        core.expire(deadline);
        assert_eq!(rx.try_recv().unwrap(), Err(DispatchError::Timeout { waited: Duration::from_secs(5) }));
        assert!(core.is_idle());
    }

    #[test]
    fn events_describe_the_flow() {
        let now = Instant::now();
        let mut core = SchedulerCore::new(policy(3));
        let (a, _rx) = queued(1, "/channels/1/messages", now);
        let key = a.key.clone();
        core.submit(a);
        core.dispatch_ready(now);
        core.complete(&key, 1, ok(), now);
        assert_eq!(
            core.take_events(),
            vec![
                DispatchEvent::Queued { key: key.clone(), id: 1 },
                DispatchEvent::Dispatched { key: key.clone(), id: 1, attempt: 1 },
                DispatchEvent::Completed { key, id: 1, status: 200 },
            ]
        );
        assert!(core.take_events().is_empty());
    }

    #[test]
    fn stale_completion_is_ignored() {
        let now = Instant::now();
        let mut core = SchedulerCore::new(policy(3));
        let (a, _rx) = queued(1, "/channels/1/messages", now);
        let key = a.key.clone();
        core.submit(a);
        core.dispatch_ready(now);
        core.complete(&key, 99, ok(), now);
        assert!(!core.is_idle());
    }

    #[test]
    fn full_telemetry_buffer_drops_instead_of_blocking() {
        let (tx, mut rx) = mpsc::channel(2);
        let key = crate::route::bucket_key(&Method::GET, "/gateway");
        let events: Vec<_> =
            (1..=5).map(|id| DispatchEvent::Queued { key: key.clone(), id }).collect();

        assert_eq!(forward_events(&tx, events), 3);
        assert_eq!(rx.try_recv().unwrap(), DispatchEvent::Queued { key: key.clone(), id: 1 });
        assert_eq!(rx.try_recv().unwrap(), DispatchEvent::Queued { key, id: 2 });
        assert!(rx.try_recv().is_err());
    }
}
