//! Public entry point: the [`Dispatcher`] handle and its builder.
//!
//! A `Dispatcher` is a cheap, cloneable handle onto one scheduler task. Requests submitted from
//! any task or thread are resolved through a [`PendingReply`]. Rate limits are absorbed; the
//! caller sees either a response or a terminal [`DispatchError`].
//!
//! ```rust,no_run
//! use http::Method;
//! use ratelane::{Dispatcher, Request};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let dispatcher = Dispatcher::builder().authorization("Bot my-token").build()?;
//!
//! let request = Request::builder(Method::POST, "/channels/100/messages")
//!     .json(&serde_json::json!({ "content": "hello" }))
//!     .build()?;
//! let response = dispatcher.submit(request).await?;
//! println!("{}", response.status());
//! # Ok(())
//! # }
//! ```

use crate::backoff::RetryPolicy;
use crate::bucket::BucketSnapshot;
use crate::error::{DispatchError, TransportError};
use crate::executor::HttpExecutor;
use crate::request::{Body, Request};
use crate::response::Response;
use crate::route::{BucketKey, Route};
use crate::scheduler::{Command, Queued, Scheduler, SchedulerCore};
use crate::telemetry::{self, BoxedSink, DispatchEvent, TelemetrySink};
use crate::transport::{ReqwestTransport, Transport};
use http::header::HeaderValue;
use http::{HeaderMap, Method};
use pin_project::{pin_project, pinned_drop};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use url::Url;

/// API base used when none is configured.
pub const DEFAULT_BASE_URL: &str = "https://discord.com/api/v10";

/// `User-Agent` sent when none is configured.
pub fn default_user_agent() -> String {
    format!("ratelane (https://github.com/ratelane/ratelane, {})", env!("CARGO_PKG_VERSION"))
}

/// Errors returned by [`DispatcherBuilder::build`].
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("invalid base url {url:?}: {reason}")]
    InvalidBaseUrl { url: String, reason: String },
    #[error("invalid {name} header value")]
    InvalidHeader { name: &'static str },
    #[error("dispatcher must be built from within a tokio runtime")]
    NoRuntime,
    #[error("failed to build http client: {0}")]
    Client(#[from] TransportError),
}

/// Builder for [`Dispatcher`].
#[derive(Debug)]
pub struct DispatcherBuilder {
    base_url: String,
    authorization: Option<String>,
    user_agent: Option<String>,
    retry: RetryPolicy,
    max_wait: Option<Duration>,
    request_timeout: Option<Duration>,
    transport: Option<Arc<dyn Transport>>,
    telemetry: Option<BoxedSink>,
}

impl Default for DispatcherBuilder {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            authorization: None,
            user_agent: None,
            retry: RetryPolicy::default(),
            max_wait: None,
            request_timeout: None,
            transport: None,
            telemetry: None,
        }
    }
}

impl DispatcherBuilder {
    /// Builder with the defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// API base routes are appended to.
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    /// Value of the `Authorization` header, sent verbatim (e.g. `"Bot <token>"`).
    pub fn authorization(mut self, value: impl Into<String>) -> Self {
        self.authorization = Some(value.into());
        self
    }

    /// Override the `User-Agent`.
    pub fn user_agent(mut self, value: impl Into<String>) -> Self {
        self.user_agent = Some(value.into());
        self
    }

    /// Retry policy for server errors and transport failures.
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    /// Change the retry budget of the configured policy.
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.retry = self.retry.with_max_retries(retries);
        self
    }

    /// Longest a request may wait in its queue before failing with
    /// [`DispatchError::Timeout`].
    ///
    /// Unbounded by default: a request stays queued for as long as the server's limits demand.
    /// Only time spent queued counts; an attempt already on the wire is never interrupted. To bound
    /// the whole wait of one request, await it with [`PendingReply::timeout`]. Durations too large
    /// to represent as an instant mean no deadline.
    pub fn max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = Some(max_wait);
        self
    }

    /// Timeout of a single attempt on the default transport.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Replace the network transport.
    pub fn transport<T: Transport + 'static>(mut self, transport: T) -> Self {
        self.transport = Some(Arc::new(transport));
        self
    }

    /// Deliver [`DispatchEvent`]s to `sink`.
    pub fn telemetry<S>(mut self, sink: S) -> Self
    where
        S: TelemetrySink,
        S::Future: Send + 'static,
    {
        self.telemetry = Some(telemetry::boxed(sink));
        self
    }

    /// Validate the configuration and start the scheduler on the current tokio runtime.
    pub fn build(self) -> Result<Dispatcher, BuildError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| BuildError::NoRuntime)?;

        let base_url = parse_base_url(&self.base_url)?;
        let authorization = self
            .authorization
            .map(|value| {
                HeaderValue::from_str(&value)
                    .map(|mut header| {
                        header.set_sensitive(true);
                        header
                    })
                    .map_err(|_| BuildError::InvalidHeader { name: "authorization" })
            })
            .transpose()?;
        let user_agent = HeaderValue::from_str(&self.user_agent.unwrap_or_else(default_user_agent))
            .map_err(|_| BuildError::InvalidHeader { name: "user-agent" })?;

        let transport: Arc<dyn Transport> = match (self.transport, self.request_timeout) {
            (Some(transport), _) => transport,
            (None, Some(timeout)) => Arc::new(ReqwestTransport::with_timeout(timeout)?),
            (None, None) => Arc::new(ReqwestTransport::default()),
        };
        let executor = HttpExecutor::new(transport, base_url, authorization, user_agent);

        let events = self.telemetry.map(|sink| {
            let (tx, mut rx) = mpsc::channel::<DispatchEvent>(telemetry::EVENT_BUFFER);
            runtime.spawn(async move {
                while let Some(event) = rx.recv().await {
                    telemetry::emit_best_effort(sink.clone(), event).await;
                }
            });
            tx
        });

        let (commands, receiver) = mpsc::unbounded_channel();
        let scheduler = Scheduler::new(SchedulerCore::new(self.retry), executor, receiver, events);
        runtime.spawn(scheduler.run());
        tracing::debug!(base_url = %self.base_url, "dispatcher started");

        Ok(Dispatcher { commands, next_id: Arc::new(AtomicU64::new(1)), max_wait: self.max_wait })
    }
}

fn parse_base_url(raw: &str) -> Result<Url, BuildError> {
    let invalid = |reason: String| BuildError::InvalidBaseUrl { url: raw.to_string(), reason };
    let mut url = Url::parse(raw).map_err(|e| invalid(e.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(invalid(format!("unsupported scheme {}", url.scheme())));
    }
    if url.cannot_be_a_base() {
        return Err(invalid("cannot be a base".into()));
    }
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url.set_query(None);
    Ok(url)
}

/// Handle onto a running scheduler. Clones share the same scheduler.
///
/// The scheduler exits once every handle is dropped and every submitted request is resolved.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    commands: mpsc::UnboundedSender<Command>,
    next_id: Arc<AtomicU64>,
    max_wait: Option<Duration>,
}

impl Dispatcher {
    /// Start configuring a dispatcher.
    pub fn builder() -> DispatcherBuilder {
        DispatcherBuilder::new()
    }

    /// Queue `request` on its bucket's lane.
    pub fn submit(&self, request: Request) -> PendingReply {
        self.enqueue(request, self.max_wait)
    }

    /// Like [`submit`](Self::submit) with a queueing deadline for this request only.
    pub fn submit_with_max_wait(&self, request: Request, max_wait: Duration) -> PendingReply {
        self.enqueue(request, Some(max_wait))
    }

    /// Four-argument form of [`submit`](Self::submit).
    pub fn request(
        &self,
        method: Method,
        route: &str,
        body: Body,
        headers: HeaderMap,
    ) -> PendingReply {
        match Route::new(route) {
            Ok(route) => self.submit(Request::from_parts(method, route, body, headers)),
            Err(e) => PendingReply::failed(DispatchError::InvalidRequest(e.to_string())),
        }
    }

    fn enqueue(&self, request: Request, max_wait: Option<Duration>) -> PendingReply {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (reply, receiver) = oneshot::channel();
        let now = Instant::now();
        // a wait too long to represent never expires
        let deadline = max_wait.and_then(|wait| now.checked_add(wait));
        let queued = Queued::new(id, request, reply, now, deadline);
        let key = queued.key.clone();
        // on a stopped scheduler the reply sender is dropped here and the caller sees Shutdown
        let _ = self.commands.send(Command::Submit(queued));
        PendingReply::new(receiver, CancelHandle { key, id, commands: self.commands.downgrade() })
    }

    /// Current window of `key`, if the scheduler has seen it.
    pub async fn bucket(&self, key: &BucketKey) -> Option<BucketSnapshot> {
        let (reply, receiver) = oneshot::channel();
        self.commands.send(Command::Bucket { key: key.clone(), reply }).ok()?;
        receiver.await.ok().flatten()
    }

    /// Deadline of the global lock while it is active.
    pub async fn global_lock(&self) -> Option<Instant> {
        let (reply, receiver) = oneshot::channel();
        self.commands.send(Command::GlobalLock { reply }).ok()?;
        receiver.await.ok().flatten()
    }

    /// Whether the scheduler is still accepting requests.
    pub fn is_running(&self) -> bool {
        !self.commands.is_closed()
    }
}

impl tower_service::Service<Request> for Dispatcher {
    type Response = Response;
    type Error = DispatchError;
    type Future = PendingReply;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        if self.commands.is_closed() {
            Poll::Ready(Err(DispatchError::Shutdown))
        } else {
            Poll::Ready(Ok(()))
        }
    }

    fn call(&mut self, request: Request) -> Self::Future {
        self.submit(request)
    }
}

#[derive(Debug)]
struct CancelHandle {
    key: BucketKey,
    id: u64,
    commands: mpsc::WeakUnboundedSender<Command>,
}

impl CancelHandle {
    fn cancel(self) {
        if let Some(commands) = self.commands.upgrade() {
            let _ = commands.send(Command::Cancel { key: self.key, id: self.id });
        }
    }
}

/// The eventual result of a submitted request.
///
/// Resolves exactly once. Dropping it before it resolves cancels the request: a queued request
/// is removed, an in-flight one is never retried.
#[pin_project(PinnedDrop)]
#[derive(Debug)]
#[must_use = "dropping a PendingReply cancels the request"]
pub struct PendingReply {
    receiver: Option<oneshot::Receiver<Result<Response, DispatchError>>>,
    handle: Option<CancelHandle>,
}

impl PendingReply {
    fn new(receiver: oneshot::Receiver<Result<Response, DispatchError>>, handle: CancelHandle) -> Self {
        Self { receiver: Some(receiver), handle: Some(handle) }
    }

    fn failed(error: DispatchError) -> Self {
        let (reply, receiver) = oneshot::channel();
        let _ = reply.send(Err(error));
        Self { receiver: Some(receiver), handle: None }
    }

    /// Cancel the request. Awaiting afterwards yields [`DispatchError::Cancelled`].
    pub fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.cancel();
        }
        self.receiver = None;
    }

    /// Wait at most `duration`; on expiry the request is cancelled and
    /// [`DispatchError::Timeout`] returned.
    pub async fn timeout(self, duration: Duration) -> Result<Response, DispatchError> {
        match tokio::time::timeout(duration, self).await {
            Ok(result) => result,
            Err(_) => Err(DispatchError::Timeout { waited: duration }),
        }
    }

    /// Block the current thread until the request resolves.
    ///
    /// For callers outside any async context; panics when called from within a runtime.
    pub fn blocking_wait(mut self) -> Result<Response, DispatchError> {
        let Some(receiver) = self.receiver.take() else {
            return Err(DispatchError::Cancelled);
        };
        let result = receiver.blocking_recv().unwrap_or(Err(DispatchError::Shutdown));
        self.handle = None;
        result
    }
}

impl Future for PendingReply {
    type Output = Result<Response, DispatchError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let Some(receiver) = this.receiver.as_mut() else {
            return Poll::Ready(Err(DispatchError::Cancelled));
        };
        match Pin::new(receiver).poll(cx) {
            Poll::Ready(result) => {
                *this.handle = None;
                Poll::Ready(result.unwrap_or(Err(DispatchError::Shutdown)))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[pinned_drop]
impl PinnedDrop for PendingReply {
    fn drop(self: Pin<&mut Self>) {
        if let Some(handle) = self.project().handle.take() {
            handle.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_requires_runtime() {
        let err = Dispatcher::builder().build().unwrap_err();
        assert!(matches!(err, BuildError::NoRuntime));
    }

    #[test]
    fn base_url_gets_trailing_slash() {
        let url = parse_base_url("https://discord.com/api/v10").unwrap();
        assert_eq!(url.as_str(), "https://discord.com/api/v10/");
        assert!(matches!(parse_base_url("ftp://example.com"), Err(BuildError::InvalidBaseUrl { .. })));
        assert!(matches!(parse_base_url("not a url"), Err(BuildError::InvalidBaseUrl { .. })));
    }

    #[test]
    fn queue_deadline_is_unbounded_by_default() {
        assert_eq!(DispatcherBuilder::default().max_wait, None);
    }

    #[tokio::test]
    async fn unrepresentable_max_wait_means_no_deadline() {
        let (commands, mut rx) = mpsc::unbounded_channel();
        let dispatcher =
            Dispatcher { commands, next_id: Arc::new(AtomicU64::new(1)), max_wait: Some(Duration::MAX) };
        let request = Request::builder(Method::GET, "/gateway").build().unwrap();
        let _pending = dispatcher.submit(request.clone());
        let _explicit = dispatcher.submit_with_max_wait(request.clone(), Duration::MAX);
        let _bounded = dispatcher.submit_with_max_wait(request, Duration::from_secs(5));

        let mut deadlines = Vec::new();
        for _ in 0..3 {
            match rx.recv().await {
                Some(Command::Submit(queued)) => {
                    deadlines.push(queued.deadline.map(|d| d - queued.submitted_at))
                }
                other => panic!("expected submit, got {other:?}"),
            }
        }
        assert_eq!(deadlines, vec![None, None, Some(Duration::from_secs(5))]);
    }

    #[test]
    fn user_agent_names_the_crate() {
        assert!(default_user_agent().starts_with("ratelane (https://github.com/ratelane/ratelane, "));
    }

    #[tokio::test]
    async fn rejects_invalid_authorization() {
        let err = Dispatcher::builder().authorization("Bot \nsecret").build().unwrap_err();
        assert!(matches!(err, BuildError::InvalidHeader { name: "authorization" }));
    }

    #[tokio::test]
    async fn invalid_route_fails_fast() {
        let dispatcher = Dispatcher::builder().build().unwrap();
        let result =
            dispatcher.request(Method::GET, "no-leading-slash", Body::Empty, HeaderMap::new()).await;
        assert!(matches!(result, Err(DispatchError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn cancelled_reply_resolves_to_cancelled() {
        let (_reply, receiver) = oneshot::channel::<Result<Response, DispatchError>>();
        let (commands, _rx) = mpsc::unbounded_channel();
        let key = crate::route::bucket_key(&Method::GET, "/gateway");
        let mut pending =
            PendingReply::new(receiver, CancelHandle { key, id: 1, commands: commands.downgrade() });
        pending.cancel();
        assert_eq!(pending.await, Err(DispatchError::Cancelled));
    }

    #[tokio::test]
    async fn dropped_sender_is_shutdown() {
        let (reply, receiver) = oneshot::channel::<Result<Response, DispatchError>>();
        let (commands, _rx) = mpsc::unbounded_channel();
        let key = crate::route::bucket_key(&Method::GET, "/gateway");
        let pending =
            PendingReply::new(receiver, CancelHandle { key, id: 1, commands: commands.downgrade() });
        drop(reply);
        assert_eq!(pending.await, Err(DispatchError::Shutdown));
    }

    #[tokio::test]
    async fn dropping_pending_reply_sends_cancel() {
        let (_reply, receiver) = oneshot::channel::<Result<Response, DispatchError>>();
        let (commands, mut rx) = mpsc::unbounded_channel();
        let key = crate::route::bucket_key(&Method::GET, "/gateway");
        drop(PendingReply::new(
            receiver,
            CancelHandle { key: key.clone(), id: 4, commands: commands.downgrade() },
        ));
        match rx.recv().await {
            Some(Command::Cancel { key: cancelled, id }) => {
                assert_eq!(cancelled, key);
                assert_eq!(id, 4);
            }
            other => panic!("expected cancel, got {other:?}"),
        }
    }
}
