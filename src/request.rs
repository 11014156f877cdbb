//! Requests submitted to the dispatcher.

use crate::route::{Route, RouteError};
use bytes::Bytes;
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, Method};
use serde::Serialize;
use std::sync::Arc;

/// Request body.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Body {
    /// No body.
    #[default]
    Empty,
    /// Serialized JSON.
    Json(Bytes),
    /// `multipart/form-data` with optional file parts.
    Multipart(MultipartForm),
}

impl Body {
    /// Serialize `value` as a JSON body.
    pub fn json<T: Serialize + ?Sized>(value: &T) -> Result<Self, serde_json::Error> {
        Ok(Body::Json(Bytes::from(serde_json::to_vec(value)?)))
    }

    /// Whether the body is empty.
    pub fn is_empty(&self) -> bool {
        match self {
            Body::Empty => true,
            Body::Json(bytes) => bytes.is_empty(),
            Body::Multipart(form) => form.is_empty(),
        }
    }
}

/// A binary file part of a multipart body.
#[derive(Debug, Clone, PartialEq)]
pub struct FilePart {
    /// Form field name, e.g. `files[0]`.
    pub field: String,
    /// File name reported to the server.
    pub filename: String,
    /// MIME type, if known.
    pub content_type: Option<String>,
    /// File contents.
    pub data: Bytes,
}

/// Structured `multipart/form-data` body: named text parts, an optional JSON payload, files.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MultipartForm {
    fields: Vec<(String, String)>,
    payload_json: Option<Bytes>,
    files: Vec<FilePart>,
}

impl MultipartForm {
    /// An empty form.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a named text part.
    pub fn text(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.push((name.into(), value.into()));
        self
    }

    /// Attach the JSON payload sent as the `payload_json` part.
    pub fn payload_json<T: Serialize + ?Sized>(mut self, value: &T) -> Result<Self, serde_json::Error> {
        self.payload_json = Some(Bytes::from(serde_json::to_vec(value)?));
        Ok(self)
    }

    /// Attach a file. Field names follow the `files[n]` convention.
    pub fn file(mut self, filename: impl Into<String>, data: impl Into<Bytes>) -> Self {
        let field = format!("files[{}]", self.files.len());
        self.files.push(FilePart { field, filename: filename.into(), content_type: None, data: data.into() });
        self
    }

    /// Attach a file with an explicit content type.
    pub fn file_with_type(
        mut self,
        filename: impl Into<String>,
        content_type: impl Into<String>,
        data: impl Into<Bytes>,
    ) -> Self {
        let field = format!("files[{}]", self.files.len());
        self.files.push(FilePart {
            field,
            filename: filename.into(),
            content_type: Some(content_type.into()),
            data: data.into(),
        });
        self
    }

    /// Named text parts.
    pub fn fields(&self) -> &[(String, String)] {
        &self.fields
    }

    /// JSON payload part, if any.
    pub fn payload(&self) -> Option<&Bytes> {
        self.payload_json.as_ref()
    }

    /// File parts.
    pub fn files(&self) -> &[FilePart] {
        &self.files
    }

    /// Whether the form has no parts at all.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty() && self.payload_json.is_none() && self.files.is_empty()
    }
}

#[derive(Debug, PartialEq)]
struct RequestInner {
    method: Method,
    route: Route,
    body: Body,
    headers: HeaderMap,
    reason: Option<String>,
}

/// An immutable request. Cloning is cheap; retries reuse the same value.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    inner: Arc<RequestInner>,
}

impl Request {
    /// Start building a request.
    pub fn builder(method: Method, route: impl Into<String>) -> RequestBuilder {
        RequestBuilder::new(method, route)
    }

    /// A bodiless request.
    pub fn new(method: Method, route: Route) -> Self {
        Self::from_parts(method, route, Body::Empty, HeaderMap::new())
    }

    /// Build a request from its parts.
    pub fn from_parts(method: Method, route: Route, body: Body, headers: HeaderMap) -> Self {
        Self { inner: Arc::new(RequestInner { method, route, body, headers, reason: None }) }
    }

    /// HTTP method.
    pub fn method(&self) -> &Method {
        &self.inner.method
    }

    /// Route, including any query string.
    pub fn route(&self) -> &Route {
        &self.inner.route
    }

    /// Body.
    pub fn body(&self) -> &Body {
        &self.inner.body
    }

    /// Extra headers sent with the request.
    pub fn headers(&self) -> &HeaderMap {
        &self.inner.headers
    }

    /// Audit log reason, if any.
    pub fn reason(&self) -> Option<&str> {
        self.inner.reason.as_deref()
    }
}

/// Errors produced while building a request.
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error(transparent)]
    Route(#[from] RouteError),
    #[error("failed to serialize body: {0}")]
    Body(#[from] serde_json::Error),
    #[error("invalid header: {0}")]
    Header(String),
}

/// Builder for [`Request`].
#[derive(Debug)]
pub struct RequestBuilder {
    method: Method,
    route: String,
    body: Body,
    headers: HeaderMap,
    reason: Option<String>,
    error: Option<RequestError>,
}

impl RequestBuilder {
    fn new(method: Method, route: impl Into<String>) -> Self {
        Self {
            method,
            route: route.into(),
            body: Body::Empty,
            headers: HeaderMap::new(),
            reason: None,
            error: None,
        }
    }

    /// Serialize `value` as the JSON body.
    pub fn json<T: Serialize + ?Sized>(mut self, value: &T) -> Self {
        match Body::json(value) {
            Ok(body) => self.body = body,
            Err(e) => {
                self.error.get_or_insert(RequestError::Body(e));
            }
        }
        self
    }

    /// Use a multipart body.
    pub fn multipart(mut self, form: MultipartForm) -> Self {
        self.body = Body::Multipart(form);
        self
    }

    /// Use an already built body.
    pub fn body(mut self, body: Body) -> Self {
        self.body = body;
        self
    }

    /// Add an extra header.
    pub fn header(mut self, name: &str, value: &str) -> Self {
        let parsed = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| RequestError::Header(format!("{name}: {e}")))
            .and_then(|name| {
                HeaderValue::from_str(value)
                    .map(|value| (name, value))
                    .map_err(|e| RequestError::Header(format!("{value:?}: {e}")))
            });
        match parsed {
            Ok((name, value)) => {
                self.headers.append(name, value);
            }
            Err(e) => {
                self.error.get_or_insert(e);
            }
        }
        self
    }

    /// Set the audit log reason.
    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Finish the request, reporting the first error encountered.
    pub fn build(self) -> Result<Request, RequestError> {
        if let Some(err) = self.error {
            return Err(err);
        }
        let route = Route::new(self.route)?;
        Ok(Request {
            inner: Arc::new(RequestInner {
                method: self.method,
                route,
                body: self.body,
                headers: self.headers,
                reason: self.reason,
            }),
        })
    }
}
