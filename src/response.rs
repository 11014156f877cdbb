//! Responses handed back to callers.

use crate::error::DispatchError;
use crate::headers::RateLimitHeaders;
use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use serde::de::DeserializeOwned;

/// A raw HTTP response as produced by a [`Transport`](crate::transport::Transport).
#[derive(Debug, Clone, PartialEq)]
pub struct RawResponse {
    /// Status code.
    pub status: StatusCode,
    /// Response headers.
    pub headers: HeaderMap,
    /// Full response body.
    pub body: Bytes,
}

impl RawResponse {
    /// Build a raw response.
    pub fn new(status: StatusCode, headers: HeaderMap, body: impl Into<Bytes>) -> Self {
        Self { status, headers, body: body.into() }
    }
}

/// A response delivered to the caller: any status below 400.
///
/// 429, other 4xx and 5xx statuses never reach the caller as a `Response`.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
}

impl Response {
    pub(crate) fn from_raw(raw: RawResponse) -> Self {
        Self { status: raw.status, headers: raw.headers, body: raw.body }
    }

    /// Status code.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Response headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Raw body bytes.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Consume the response and return the body.
    pub fn into_body(self) -> Bytes {
        self.body
    }

    /// Body as UTF-8 text.
    pub fn text(&self) -> Result<&str, DispatchError> {
        std::str::from_utf8(&self.body).map_err(|e| DispatchError::Decode(e.to_string()))
    }

    /// Deserialize the JSON body.
    ///
    /// A `204 No Content` body is treated as JSON `null`, so `Option<T>` and `()` decode cleanly.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, DispatchError> {
        let body: &[u8] = if self.body.is_empty() { b"null" } else { &self.body };
        serde_json::from_slice(body).map_err(|e| DispatchError::Decode(e.to_string()))
    }

    /// Rate-limit headers carried by this response.
    pub fn rate_limits(&self) -> RateLimitHeaders {
        RateLimitHeaders::parse(&self.headers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Channel {
        id: String,
        name: String,
    }

    fn ok(body: &'static str) -> Response {
        Response::from_raw(RawResponse::new(StatusCode::OK, HeaderMap::new(), body))
    }

    #[test]
    fn decodes_json() {
        let channel: Channel = ok(r#"{"id":"1","name":"general"}"#).json().unwrap();
        assert_eq!(channel, Channel { id: "1".into(), name: "general".into() });
    }

    #[test]
    fn decode_error_is_surfaced() {
        let err = ok("not json").json::<Channel>().unwrap_err();
        assert!(matches!(err, DispatchError::Decode(_)));
    }

    #[test]
    fn empty_body_decodes_as_null() {
        let empty = Response::from_raw(RawResponse::new(
            StatusCode::NO_CONTENT,
            HeaderMap::new(),
            Bytes::new(),
        ));
        assert_eq!(empty.json::<Option<Channel>>().unwrap(), None);
        empty.json::<()>().unwrap();
    }

    #[test]
    fn text_body() {
        assert_eq!(ok("hello").text().unwrap(), "hello");
    }
}
