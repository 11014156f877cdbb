//! The network seam.
//!
//! A [`Transport`] performs exactly one HTTP exchange. It knows nothing about rate limits or
//! retries; it may be called concurrently for different buckets.

use crate::error::{TransportError, TransportErrorKind};
use crate::request::MultipartForm;
use crate::response::RawResponse;
use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, Method};
use std::time::Duration;
use url::Url;

/// Body of an outgoing request, ready for the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum OutgoingBody {
    /// No body.
    Empty,
    /// Raw bytes; the content type is already in the headers.
    Bytes(Bytes),
    /// Multipart form; the transport picks the boundary.
    Multipart(MultipartForm),
}

/// A fully resolved HTTP request.
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingRequest {
    /// HTTP method.
    pub method: Method,
    /// Absolute URL.
    pub url: Url,
    /// Every header to send, including credentials.
    pub headers: HeaderMap,
    /// Body.
    pub body: OutgoingBody,
}

/// One network round trip.
#[async_trait]
pub trait Transport: Send + Sync + std::fmt::Debug {
    /// Send `request` and read the full response.
    async fn send(&self, request: OutgoingRequest) -> Result<RawResponse, TransportError>;
}

/// Production transport backed by a shared, pooled [`reqwest::Client`].
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// Wrap an existing client.
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// Build a client with a per-attempt timeout.
    pub fn with_timeout(timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }

    fn form(form: MultipartForm) -> Result<reqwest::multipart::Form, TransportError> {
        let mut out = reqwest::multipart::Form::new();
        for (name, value) in form.fields() {
            out = out.text(name.clone(), value.clone());
        }
        if let Some(payload) = form.payload() {
            let part = reqwest::multipart::Part::bytes(payload.to_vec())
                .mime_str("application/json")
                .map_err(TransportError::from)?;
            out = out.part("payload_json", part);
        }
        for file in form.files() {
            let mut part =
                reqwest::multipart::Part::bytes(file.data.to_vec()).file_name(file.filename.clone());
            if let Some(content_type) = &file.content_type {
                part = part.mime_str(content_type).map_err(|e| {
                    TransportError::new(
                        TransportErrorKind::Invalid,
                        format!("invalid content type for {}: {e}", file.filename),
                    )
                })?;
            }
            out = out.part(file.field.clone(), part);
        }
        Ok(out)
    }
}

impl Default for ReqwestTransport {
    fn default() -> Self {
        Self::new(reqwest::Client::new())
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: OutgoingRequest) -> Result<RawResponse, TransportError> {
        let mut builder = self.client.request(request.method, request.url).headers(request.headers);
        builder = match request.body {
            OutgoingBody::Empty => builder,
            OutgoingBody::Bytes(bytes) => builder.body(bytes),
            OutgoingBody::Multipart(form) => builder.multipart(Self::form(form)?),
        };

        let response = builder.send().await?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await?;
        Ok(RawResponse { status, headers, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bad_file_content_type_is_invalid() {
        let form = MultipartForm::new().file_with_type("a.bin", "not a mime type", vec![0u8, 1, 2]);
        let err = ReqwestTransport::form(form).unwrap_err();
        assert_eq!(err.kind(), TransportErrorKind::Invalid);
        assert!(err.message().contains("a.bin"));
    }

    #[test]
    fn form_accepts_payload_and_files() {
        let form = MultipartForm::new()
            .payload_json(&serde_json::json!({ "content": "hi" }))
            .unwrap()
            .file_with_type("notes.txt", "text/plain", "remember");
        assert!(ReqwestTransport::form(form).is_ok());
    }
}
