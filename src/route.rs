//! Routes and bucket key derivation.
//!
//! The remote API groups routes into rate-limit buckets. Before the server has told us which
//! bucket a route belongs to we derive a local [`BucketKey`] from the HTTP method and the route
//! path:
//!
//! - the query string never participates;
//! - ids that follow a *major parameter* resource (`channels`, `guilds`, `webhooks`) are kept,
//!   and so is a webhook's token;
//! - any other numeric (snowflake) segment collapses to `:id`;
//! - an interaction token collapses to `:token`, a reaction emoji to `:emoji`.
//!
//! ```rust
//! use http::Method;
//! use ratelane::route::bucket_key;
//!
//! let a = bucket_key(&Method::GET, "/channels/100/messages/1?limit=5");
//! let b = bucket_key(&Method::GET, "/channels/100/messages/2");
//! assert_eq!(a, b);
//! assert_eq!(a.to_string(), "GET /channels/100/messages/:id");
//! ```

use http::Method;
use std::fmt;

/// Resources whose id is part of bucket identity.
const MAJOR_RESOURCES: [&str; 3] = ["channels", "guilds", "webhooks"];

/// A resolved route path, e.g. `/channels/100/messages?limit=5`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Route(String);

/// Errors produced when parsing a route.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RouteError {
    /// Routes must be absolute paths.
    #[error("route must start with '/' (got {0:?})")]
    NotAbsolute(String),
    /// Routes must not contain whitespace.
    #[error("route contains whitespace: {0:?}")]
    Whitespace(String),
}

impl Route {
    /// Parse a route. The path must be absolute and whitespace free.
    pub fn new(path: impl Into<String>) -> Result<Self, RouteError> {
        let path = path.into();
        if !path.starts_with('/') {
            return Err(RouteError::NotAbsolute(path));
        }
        if path.chars().any(char::is_whitespace) {
            return Err(RouteError::Whitespace(path));
        }
        Ok(Self(path))
    }

    /// Full route including the query string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Path component without the query string.
    pub fn path(&self) -> &str {
        self.0.split_once('?').map_or(self.0.as_str(), |(path, _)| path)
    }

    /// The id of the major parameter this route is scoped to, if any.
    pub fn major_parameter(&self) -> Option<&str> {
        let mut segments = self.path().split('/').filter(|s| !s.is_empty());
        while let Some(segment) = segments.next() {
            if MAJOR_RESOURCES.contains(&segment) {
                return segments.next().filter(|id| is_snowflake(id));
            }
        }
        None
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<&str> for Route {
    type Error = RouteError;

    fn try_from(path: &str) -> Result<Self, Self::Error> {
        Route::new(path)
    }
}

impl TryFrom<String> for Route {
    type Error = RouteError;

    fn try_from(path: String) -> Result<Self, Self::Error> {
        Route::new(path)
    }
}

/// Local identity of a rate-limit bucket: method plus normalized route.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BucketKey {
    method: String,
    route: String,
    major: Option<String>,
}

impl BucketKey {
    /// HTTP method this key was derived for.
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Normalized route, e.g. `/channels/100/messages/:id`.
    pub fn route(&self) -> &str {
        &self.route
    }

    /// Major parameter retained in the key, if any.
    pub fn major_parameter(&self) -> Option<&str> {
        self.major.as_deref()
    }
}

impl fmt::Display for BucketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.route)
    }
}

impl From<&crate::Request> for BucketKey {
    fn from(request: &crate::Request) -> Self {
        bucket_key(request.method(), request.route().as_str())
    }
}

/// Derive the bucket key for `method` and `path`. Pure; no network access.
pub fn bucket_key(method: &Method, path: &str) -> BucketKey {
    let path = path.split_once('?').map_or(path, |(path, _)| path);
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

    let mut normalized: Vec<&str> = Vec::with_capacity(segments.len());
    let mut major: Option<String> = None;
    let mut i = 0;
    while i < segments.len() {
        let segment = segments[i];
        let previous = i.checked_sub(1).map(|p| segments[p]);
        match previous {
            Some(resource) if MAJOR_RESOURCES.contains(&resource) && is_snowflake(segment) => {
                normalized.push(segment);
                let mut id = segment.to_string();
                // A webhook's token is part of its major parameter.
                if resource == "webhooks" {
                    if let Some(token) = segments.get(i + 1).filter(|t| !is_snowflake(t)) {
                        if !is_reserved_word(token) {
                            normalized.push(token);
                            id.push('/');
                            id.push_str(token);
                            i += 1;
                        }
                    }
                }
                major.get_or_insert(id);
            }
            Some("interactions") if is_snowflake(segment) => {
                normalized.push(":id");
                if segments.get(i + 1).is_some() {
                    normalized.push(":token");
                    i += 1;
                }
            }
            Some("reactions") => {
                normalized.push(":emoji");
            }
            _ if is_snowflake(segment) => normalized.push(":id"),
            _ => normalized.push(segment),
        }
        i += 1;
    }

    let mut route = String::with_capacity(path.len());
    for segment in &normalized {
        route.push('/');
        route.push_str(segment);
    }
    if route.is_empty() {
        route.push('/');
    }

    BucketKey { method: method.as_str().to_string(), route, major }
}

fn is_snowflake(segment: &str) -> bool {
    !segment.is_empty() && segment.bytes().all(|b| b.is_ascii_digit())
}

fn is_reserved_word(segment: &str) -> bool {
    matches!(segment, "messages" | "github" | "slack")
}
