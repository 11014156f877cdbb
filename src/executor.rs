//! Single-attempt execution and response classification.
//!
//! [`HttpExecutor::execute`] assembles the outgoing request, sends it through a
//! [`Transport`](crate::transport::Transport) once, and classifies what came back. Retrying is
//! the scheduler's job; nothing here loops.
//!
//! [`classify`] is a pure function of the raw response, so replaying a captured response always
//! yields the same [`Classification`].

use crate::error::{TransportError, TransportErrorKind};
use crate::headers::{seconds_to_duration, HeaderScope, RateLimitHeaders};
use crate::request::{Body, Request};
use crate::response::{RawResponse, Response};
use crate::transport::{OutgoingBody, OutgoingRequest, Transport};
use http::header::{HeaderValue, AUTHORIZATION, CONTENT_TYPE, USER_AGENT};
use http::StatusCode;
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// Header carrying the audit log reason.
pub const AUDIT_LOG_REASON: &str = "x-audit-log-reason";

/// Delay assumed when a 429 carries no usable retry information.
pub const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(1);

/// Scope of a rate-limit rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitScope {
    /// Only the request's bucket is exhausted.
    Bucket,
    /// Every bucket is frozen.
    Global,
}

/// Outcome of one attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Classification {
    /// Any status below 400.
    Success(Response),
    /// 429.
    RateLimited {
        /// Bucket or global. Global wins when both are signalled.
        scope: LimitScope,
        /// How long to hold off.
        retry_after: Duration,
        /// Rate-limit headers of the rejection.
        limits: RateLimitHeaders,
    },
    /// 4xx other than 429.
    ClientError {
        /// Status code.
        status: StatusCode,
        /// API error code, if the body carried one.
        code: Option<u64>,
        /// API error message or raw body.
        message: String,
        /// Rate-limit headers of the rejection.
        limits: RateLimitHeaders,
    },
    /// 5xx.
    ServerError {
        /// Status code.
        status: StatusCode,
        /// Rate-limit headers, if any.
        limits: RateLimitHeaders,
    },
    /// The exchange failed before a response arrived.
    TransportError {
        /// What went wrong.
        cause: TransportError,
    },
    /// The request could not be turned into a wire request. Never retried.
    Invalid {
        /// Why the request was rejected locally.
        message: String,
    },
}

impl Classification {
    /// Rate-limit headers observed in this attempt, if a response arrived.
    pub fn limits(&self) -> Option<RateLimitHeaders> {
        match self {
            Classification::Success(response) => Some(response.rate_limits()),
            Classification::RateLimited { limits, .. }
            | Classification::ClientError { limits, .. }
            | Classification::ServerError { limits, .. } => Some(limits.clone()),
            Classification::TransportError { .. } | Classification::Invalid { .. } => None,
        }
    }

    /// Whether the attempt may be retried after a backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, Classification::ServerError { .. } | Classification::TransportError { .. })
    }
}

#[derive(Debug, Default, Deserialize)]
struct RateLimitBody {
    retry_after: Option<f64>,
    #[serde(default)]
    global: bool,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    code: Option<u64>,
    message: Option<String>,
}

/// Classify a raw response.
pub fn classify(raw: &RawResponse) -> Classification {
    let status = raw.status;
    let limits = RateLimitHeaders::parse(&raw.headers);

    if status == StatusCode::TOO_MANY_REQUESTS {
        let body: RateLimitBody = serde_json::from_slice(&raw.body).unwrap_or_default();
        let global = limits.is_global() || body.global;
        // Shared-scope limits belong to the resource, not to us; they still hold the bucket.
        let scope = if global { LimitScope::Global } else { LimitScope::Bucket };
        let retry_after = limits
            .retry_after
            .or(limits.reset_after.filter(|_| limits.scope != Some(HeaderScope::Global)))
            .or_else(|| body.retry_after.and_then(seconds_to_duration))
            .unwrap_or(DEFAULT_RETRY_AFTER);
        return Classification::RateLimited { scope, retry_after, limits };
    }

    if status.is_client_error() {
        let body: ErrorBody = serde_json::from_slice(&raw.body).unwrap_or_default();
        let message = body
            .message
            .or_else(|| {
                std::str::from_utf8(&raw.body)
                    .ok()
                    .map(str::trim)
                    .filter(|text| !text.is_empty())
                    .map(str::to_string)
            })
            .unwrap_or_else(|| status.canonical_reason().unwrap_or("client error").to_string());
        return Classification::ClientError { status, code: body.code, message, limits };
    }

    if status.is_server_error() {
        return Classification::ServerError { status, limits };
    }

    Classification::Success(Response::from_raw(raw.clone()))
}

/// Builds outgoing requests and runs single attempts.
#[derive(Debug, Clone)]
pub struct HttpExecutor {
    transport: Arc<dyn Transport>,
    base_url: Url,
    authorization: Option<HeaderValue>,
    user_agent: HeaderValue,
}

impl HttpExecutor {
    /// Create an executor. `base_url` must end with a `/` so routes are appended to it.
    pub fn new(
        transport: Arc<dyn Transport>,
        base_url: Url,
        authorization: Option<HeaderValue>,
        user_agent: HeaderValue,
    ) -> Self {
        Self { transport, base_url, authorization, user_agent }
    }

    /// Base URL routes are resolved against.
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Run one attempt of `request`.
    pub async fn execute(&self, request: &Request) -> Classification {
        let outgoing = match self.prepare(request) {
            Ok(outgoing) => outgoing,
            Err(cause) => return failed(cause),
        };
        match self.transport.send(outgoing).await {
            Ok(raw) => classify(&raw),
            Err(cause) => failed(cause),
        }
    }

    /// Assemble the wire request for `request`.
    pub fn prepare(&self, request: &Request) -> Result<OutgoingRequest, TransportError> {
        let relative = request.route().as_str().trim_start_matches('/');
        let url = self.base_url.join(relative).map_err(|e| {
            TransportError::new(
                TransportErrorKind::Invalid,
                format!("cannot resolve route {}: {e}", request.route()),
            )
        })?;

        let mut headers = request.headers().clone();
        headers.insert(USER_AGENT, self.user_agent.clone());
        if let Some(authorization) = &self.authorization {
            headers.insert(AUTHORIZATION, authorization.clone());
        }
        if let Some(reason) = request.reason() {
            let encoded = utf8_percent_encode(reason, NON_ALPHANUMERIC).to_string();
            // percent-encoded output is always a valid header value
            if let Ok(value) = HeaderValue::from_str(&encoded) {
                headers.insert(AUDIT_LOG_REASON, value);
            }
        }

        let body = match request.body() {
            Body::Empty => OutgoingBody::Empty,
            Body::Json(bytes) => {
                headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
                OutgoingBody::Bytes(bytes.clone())
            }
            Body::Multipart(form) => OutgoingBody::Multipart(form.clone()),
        };

        Ok(OutgoingRequest { method: request.method().clone(), url, headers, body })
    }
}

fn failed(cause: TransportError) -> Classification {
    match cause.kind() {
        TransportErrorKind::Invalid => Classification::Invalid { message: cause.message().to_string() },
        _ => Classification::TransportError { cause },
    }
}
