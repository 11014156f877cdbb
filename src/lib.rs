#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # ratelane
//!
//! Rate-limit aware request dispatcher for bucketed REST APIs (Discord v10 conventions).
//!
//! Callers submit HTTP-shaped requests from any number of tasks. A single scheduler task owns
//! every rate-limit window and decides when each request may reach the network:
//!
//! - **Per-bucket lanes**: requests sharing a [`BucketKey`] are sent strictly in submission order,
//!   one at a time.
//! - **Bucket windows** learned from `X-RateLimit-*` headers, shared between routes once the
//!   server names their bucket.
//! - **Global lock**: a global 429 freezes every lane until it lifts.
//! - **Bounded retries** with exponential backoff for 5xx and network failures.
//! - **Cancellation and deadlines**: dropping a [`PendingReply`] withdraws the request; an
//!   optional `max_wait` bounds time spent queued.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use http::Method;
//! use ratelane::{Dispatcher, DispatchError, Request};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let dispatcher = Dispatcher::builder()
//!         .authorization("Bot my-token")
//!         .max_wait(Duration::from_secs(60))
//!         .build()?;
//!
//!     let request = Request::builder(Method::GET, "/channels/100/messages?limit=5").build()?;
//!     match dispatcher.submit(request).await {
//!         Ok(response) => println!("{}", response.text()?),
//!         Err(DispatchError::ClientError { status, message, .. }) => eprintln!("{status}: {message}"),
//!         Err(other) => return Err(other.into()),
//!     }
//!     Ok(())
//! }
//! ```

pub mod backoff;
pub mod bucket;
pub mod dispatcher;
pub mod error;
pub mod executor;
pub mod global;
pub mod headers;
pub mod prelude;
pub mod request;
pub mod response;
pub mod route;
mod scheduler;
pub mod telemetry;
pub mod transport;

// Re-exports
pub use backoff::{Backoff, Jitter, RetryPolicy, RetryPolicyBuilder};
pub use bucket::BucketSnapshot;
pub use dispatcher::{BuildError, Dispatcher, DispatcherBuilder, PendingReply};
pub use error::{DispatchError, OrAbort, TransportError, TransportErrorKind};
pub use executor::{classify, Classification, LimitScope};
pub use headers::RateLimitHeaders;
pub use request::{Body, FilePart, MultipartForm, Request, RequestBuilder, RequestError};
pub use response::{RawResponse, Response};
pub use route::{bucket_key, BucketKey, Route};
pub use transport::{OutgoingBody, OutgoingRequest, ReqwestTransport, Transport};
