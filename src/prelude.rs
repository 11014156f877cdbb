//! Convenient re-exports for common ratelane types.
pub use crate::{
    backoff::{Backoff, Jitter, RetryPolicy},
    dispatcher::{Dispatcher, PendingReply},
    error::{DispatchError, OrAbort},
    request::{Body, MultipartForm, Request},
    response::Response,
    route::BucketKey,
    telemetry::{DispatchEvent, LogSink, MemorySink, NullSink},
};
