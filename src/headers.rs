//! Parsing of rate-limit response headers.
//!
//! All relative values the server sends (`Retry-After`, `X-RateLimit-Reset-After`) are in
//! **seconds**, possibly fractional. They are converted to [`Duration`] here and nowhere else.
//! `Retry-After` may also be an HTTP date as allowed by
//! [RFC 9110 section 10.2.3](https://www.rfc-editor.org/rfc/rfc9110#section-10.2.3).

use http::{HeaderMap, HeaderValue};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub const BUCKET: &str = "x-ratelimit-bucket";
pub const LIMIT: &str = "x-ratelimit-limit";
pub const REMAINING: &str = "x-ratelimit-remaining";
pub const RESET: &str = "x-ratelimit-reset";
pub const RESET_AFTER: &str = "x-ratelimit-reset-after";
pub const GLOBAL: &str = "x-ratelimit-global";
pub const SCOPE: &str = "x-ratelimit-scope";
pub const RETRY_AFTER: &str = "retry-after";

/// Upper bound applied to any server supplied delay (one day).
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(24 * 60 * 60);

/// Scope reported by `X-RateLimit-Scope`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderScope {
    /// Per-bucket limit of the current credential.
    User,
    /// Limit applying to every bucket.
    Global,
    /// Shared per-resource limit.
    Shared,
}

impl HeaderScope {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "user" => Some(Self::User),
            "global" => Some(Self::Global),
            "shared" => Some(Self::Shared),
            _ => None,
        }
    }
}

/// Rate-limit information carried by a single response.
///
/// Every field is optional: not all routes are limited and not every response carries every
/// header.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RateLimitHeaders {
    /// Server-side bucket hash.
    pub bucket: Option<String>,
    /// Window capacity.
    pub limit: Option<u32>,
    /// Calls left in the current window.
    pub remaining: Option<u32>,
    /// Time until the window refreshes.
    pub reset_after: Option<Duration>,
    /// `X-RateLimit-Global` was present and true.
    pub global: bool,
    /// `X-RateLimit-Scope`, if sent.
    pub scope: Option<HeaderScope>,
    /// `Retry-After`, if sent.
    pub retry_after: Option<Duration>,
}

impl RateLimitHeaders {
    /// Parse every known rate-limit header. Malformed values are ignored.
    pub fn parse(headers: &HeaderMap) -> Self {
        Self::parse_at(headers, SystemTime::now())
    }

    /// Like [`parse`](Self::parse) with an explicit wall clock for absolute reset times.
    pub fn parse_at(headers: &HeaderMap, now: SystemTime) -> Self {
        let reset_after = header_str(headers, RESET_AFTER)
            .and_then(parse_seconds)
            .or_else(|| {
                header_str(headers, RESET)
                    .and_then(|v| v.trim().parse::<f64>().ok())
                    .and_then(|epoch| until_epoch_seconds(epoch, now))
            });

        Self {
            bucket: header_str(headers, BUCKET)
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string),
            limit: header_str(headers, LIMIT).and_then(|v| v.trim().parse().ok()),
            remaining: header_str(headers, REMAINING).and_then(|v| v.trim().parse().ok()),
            reset_after,
            global: header_str(headers, GLOBAL).is_some_and(|v| v.trim().eq_ignore_ascii_case("true")),
            scope: header_str(headers, SCOPE).and_then(HeaderScope::parse),
            retry_after: headers.get(RETRY_AFTER).and_then(|v| parse_retry_after_at(v, now).ok()),
        }
    }

    /// Whether the headers mark the response as globally scoped.
    pub fn is_global(&self) -> bool {
        self.global || self.scope == Some(HeaderScope::Global)
    }

    /// `(limit, remaining, reset_after)` when the window is fully described.
    pub fn window(&self) -> Option<(u32, u32, Duration)> {
        Some((self.limit?, self.remaining?, self.reset_after?))
    }

    /// Whether any rate-limit information was present.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Errors produced while parsing `Retry-After`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RetryAfterParseError {
    #[error("unable to parse value '{0}'")]
    ValueError(String),

    #[error("header value contains invalid chars")]
    HeaderValueError,
}

/// Parse a `Retry-After` header: fractional seconds or an HTTP date.
pub fn parse_retry_after(value: &HeaderValue) -> Result<Duration, RetryAfterParseError> {
    parse_retry_after_at(value, SystemTime::now())
}

fn parse_retry_after_at(value: &HeaderValue, now: SystemTime) -> Result<Duration, RetryAfterParseError> {
    let value = value.to_str().map_err(|_| RetryAfterParseError::HeaderValueError)?;
    if let Some(delay) = parse_seconds(value) {
        return Ok(delay);
    }
    httpdate::parse_http_date(value)
        // a date in the past means "retry now"
        .map(|date| date.duration_since(now).unwrap_or(Duration::ZERO).min(MAX_RETRY_AFTER))
        .map_err(|_| RetryAfterParseError::ValueError(value.into()))
}

/// Parse a non-negative, finite amount of seconds.
pub fn parse_seconds(value: &str) -> Option<Duration> {
    let seconds: f64 = value.trim().parse().ok()?;
    seconds_to_duration(seconds)
}

/// Convert non-negative, finite seconds to a capped [`Duration`].
pub fn seconds_to_duration(seconds: f64) -> Option<Duration> {
    if !seconds.is_finite() || seconds < 0.0 {
        return None;
    }
    Some(Duration::try_from_secs_f64(seconds).map_or(MAX_RETRY_AFTER, |d| d.min(MAX_RETRY_AFTER)))
}

fn until_epoch_seconds(epoch: f64, now: SystemTime) -> Option<Duration> {
    if !epoch.is_finite() || epoch < 0.0 {
        return None;
    }
    let reset = UNIX_EPOCH.checked_add(Duration::try_from_secs_f64(epoch).ok()?)?;
    Some(reset.duration_since(now).unwrap_or(Duration::ZERO).min(MAX_RETRY_AFTER))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}
