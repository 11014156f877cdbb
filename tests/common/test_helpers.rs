use async_trait::async_trait;
use http::{HeaderMap, HeaderValue, Method, StatusCode};
use ratelane::{OutgoingRequest, RawResponse, Transport, TransportError, TransportErrorKind};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

/// One scripted exchange.
#[derive(Debug, Clone)]
pub enum Step {
    Respond { status: u16, headers: Vec<(&'static str, String)>, body: String, latency: Duration },
    Fail(TransportErrorKind),
}

impl Step {
    pub fn ok() -> Self {
        Self::status(200)
    }

    pub fn status(status: u16) -> Self {
        Step::Respond { status, headers: Vec::new(), body: "{}".into(), latency: Duration::ZERO }
    }

    pub fn window(limit: u32, remaining: u32, reset_after_secs: f64) -> Self {
        Self::ok()
            .header("x-ratelimit-limit", limit)
            .header("x-ratelimit-remaining", remaining)
            .header("x-ratelimit-reset-after", reset_after_secs)
    }

    pub fn rate_limited(retry_after_secs: f64, global: bool) -> Self {
        let body = format!(
            r#"{{"message": "You are being rate limited.", "retry_after": {retry_after_secs}, "global": {global}}}"#
        );
        let step = Self::status(429).header("retry-after", retry_after_secs).body(body);
        if global {
            step.header("x-ratelimit-global", "true").header("x-ratelimit-scope", "global")
        } else {
            step
        }
    }

    pub fn header(mut self, name: &'static str, value: impl ToString) -> Self {
        if let Step::Respond { headers, .. } = &mut self {
            headers.push((name, value.to_string()));
        }
        self
    }

    pub fn body(mut self, text: impl Into<String>) -> Self {
        if let Step::Respond { body, .. } = &mut self {
            *body = text.into();
        }
        self
    }

    pub fn after(mut self, delay: Duration) -> Self {
        if let Step::Respond { latency, .. } = &mut self {
            *latency = delay;
        }
        self
    }
}

/// A request as seen by the transport.
#[derive(Debug, Clone)]
pub struct Seen {
    pub at: Instant,
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
}

#[derive(Debug, Default)]
struct Script {
    steps: HashMap<String, VecDeque<Step>>,
    seen: Vec<Seen>,
}

/// Transport answering from per-path scripts; unscripted calls get `200 {}`.
#[derive(Debug, Clone, Default)]
pub struct ScriptedTransport {
    inner: Arc<Mutex<Script>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `steps` for requests to `path` (relative to the API base, without query).
    pub fn script(&self, path: &str, steps: impl IntoIterator<Item = Step>) -> &Self {
        self.inner.lock().unwrap().steps.entry(path.to_string()).or_default().extend(steps);
        self
    }

    pub fn seen(&self) -> Vec<Seen> {
        self.inner.lock().unwrap().seen.clone()
    }

    pub fn seen_for(&self, path: &str) -> Vec<Seen> {
        self.seen().into_iter().filter(|s| s.path == path).collect()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, request: OutgoingRequest) -> Result<RawResponse, TransportError> {
        let path = request.url.path().trim_start_matches(BASE_PATH).to_string();
        let step = {
            let mut script = self.inner.lock().unwrap();
            script.seen.push(Seen {
                at: Instant::now(),
                method: request.method.clone(),
                path: path.clone(),
                query: request.url.query().map(str::to_string),
                headers: request.headers.clone(),
            });
            script.steps.get_mut(&path).and_then(VecDeque::pop_front).unwrap_or_else(Step::ok)
        };

        match step {
            Step::Respond { status, headers, body, latency } => {
                if !latency.is_zero() {
                    tokio::time::sleep(latency).await;
                }
                let mut map = HeaderMap::new();
                for (name, value) in headers {
                    map.insert(name, HeaderValue::from_str(&value).unwrap());
                }
                Ok(RawResponse::new(StatusCode::from_u16(status).unwrap(), map, body))
            }
            Step::Fail(kind) => Err(TransportError::new(kind, "scripted failure")),
        }
    }
}

/// Path of the base URL used with [`ScriptedTransport`].
pub const BASE_PATH: &str = "/api/v10";
pub const BASE_URL: &str = "http://scripted.invalid/api/v10";
