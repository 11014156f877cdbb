//! Error types surfaced to callers of the dispatcher.
//!
//! Rate limits never appear here: they are absorbed by the scheduler. A caller only ever sees a
//! successful [`Response`](crate::Response) or one of the terminal errors below.

use std::fmt;
use std::time::Duration;

/// Broad category of a transport failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// Could not connect (DNS, refused connection, TLS handshake).
    Connect,
    /// The attempt exceeded the transport's own timeout.
    Timeout,
    /// The request failed while being sent.
    Request,
    /// The request could not be built (bad URL, header or content type). Never retried.
    Invalid,
    /// The response body could not be read.
    Body,
    /// Anything else.
    Other,
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connect => "connect",
            Self::Timeout => "timeout",
            Self::Request => "request",
            Self::Invalid => "invalid request",
            Self::Body => "body",
            Self::Other => "other",
        };
        f.write_str(name)
    }
}

/// A network-level failure of a single attempt.
///
/// The underlying error is flattened into a message so the value stays `Clone` and comparable;
/// classifications are replayable.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind} error: {message}")]
pub struct TransportError {
    kind: TransportErrorKind,
    message: String,
}

impl TransportError {
    /// Build a transport error.
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }

    /// Category of the failure.
    pub fn kind(&self) -> TransportErrorKind {
        self.kind
    }

    /// Human readable description, including the source chain.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        let kind = if err.is_builder() {
            TransportErrorKind::Invalid
        } else if err.is_timeout() {
            TransportErrorKind::Timeout
        } else if err.is_connect() {
            TransportErrorKind::Connect
        } else if err.is_body() || err.is_decode() {
            TransportErrorKind::Body
        } else if err.is_request() {
            TransportErrorKind::Request
        } else {
            TransportErrorKind::Other
        };
        let mut message = err.to_string();
        let mut source = std::error::Error::source(&err);
        while let Some(cause) = source {
            message.push_str(": ");
            message.push_str(&cause.to_string());
            source = cause.source();
        }
        Self { kind, message }
    }
}

/// Terminal outcome of a dispatched request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    /// Network failure that persisted through every retry.
    #[error("transport failed after {attempts} attempts: {cause}")]
    Transport {
        /// Last failure observed.
        cause: TransportError,
        /// Attempts made, including the first.
        attempts: u32,
    },
    /// The server rejected the request (4xx other than 429). Never retried.
    #[error("request rejected with status {status}: {message}")]
    ClientError {
        /// HTTP status code.
        status: u16,
        /// API error code from the JSON body, if any.
        code: Option<u64>,
        /// API error message, or the raw body.
        message: String,
    },
    /// The server kept failing (5xx) through every retry.
    #[error("server error {status} after {attempts} attempts")]
    ServerError {
        /// Status of the last attempt.
        status: u16,
        /// Attempts made, including the first.
        attempts: u32,
    },
    /// A response body did not have the expected shape.
    #[error("failed to decode response body: {0}")]
    Decode(String),
    /// The request waited longer than allowed.
    #[error("request timed out after waiting {waited:?}")]
    Timeout {
        /// How long the request had been waiting.
        waited: Duration,
    },
    /// The caller cancelled the request.
    #[error("request cancelled")]
    Cancelled,
    /// The dispatcher stopped before the request was resolved.
    #[error("dispatcher shut down before the request completed")]
    Shutdown,
    /// The request could not be turned into an HTTP request.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl DispatchError {
    /// Check if this error is a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Check if the server rejected the request.
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::ClientError { .. })
    }

    /// Check if the retry budget was spent on server errors.
    pub fn is_server_error(&self) -> bool {
        matches!(self, Self::ServerError { .. })
    }

    /// Check if the retry budget was spent on transport failures.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }

    /// HTTP status associated with the error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::ClientError { status, .. } | Self::ServerError { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// "Unwrap or abort" for callers that want failure to end their own flow.
pub trait OrAbort<T> {
    /// Return the success value, or log the error and panic with it.
    fn or_abort(self) -> T;
}

impl<T> OrAbort<T> for Result<T, DispatchError> {
    #[track_caller]
    fn or_abort(self) -> T {
        match self {
            Ok(value) => value,
            Err(err) => {
                tracing::error!(error = %err, "aborting after dispatch failure");
                panic!("dispatch failed: {err}");
            }
        }
    }
}
