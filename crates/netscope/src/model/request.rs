//! Canonical request and body types.

use super::{Headers, Method};
use crate::error::ConversionError;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use url::Url;

/// Message body plus its declared content type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Body {
    #[serde(serialize_with = "serialize_base64")]
    pub bytes: Bytes,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    /// Original length when the captured bytes were cut short
    #[serde(skip_serializing_if = "Option::is_none")]
    pub truncated_from: Option<usize>,
}

impl Body {
    pub fn new(bytes: impl Into<Bytes>, content_type: Option<String>) -> Self {
        Self {
            bytes: bytes.into(),
            content_type,
            truncated_from: None,
        }
    }

    /// Body whose content type is taken from `headers`.
    pub fn from_headers(bytes: impl Into<Bytes>, headers: &Headers) -> Self {
        Self::new(bytes, headers.get_str("content-type").map(str::to_string))
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated_from.is_some()
    }

    /// Keep at most `limit` bytes. The kept prefix is copied so the full
    /// buffer can be freed.
    pub(crate) fn capped(self, limit: usize) -> Self {
        if self.bytes.len() <= limit {
            return self;
        }
        Self {
            truncated_from: Some(self.bytes.len()),
            bytes: Bytes::copy_from_slice(&self.bytes[..limit]),
            content_type: self.content_type,
        }
    }
}

pub(crate) fn serialize_base64<S: Serializer>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&STANDARD.encode(bytes))
}

/// A library-independent outgoing request. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Request {
    method: Method,
    url: Url,
    headers: Headers,
    #[serde(skip_serializing_if = "Option::is_none")]
    body: Option<Body>,
    library: String,
    created_at: DateTime<Utc>,
}

impl Request {
    pub fn new(method: Method, url: Url, library: impl Into<String>) -> Self {
        Self {
            method,
            url,
            headers: Headers::new(),
            body: None,
            library: library.into(),
            created_at: Utc::now(),
        }
    }

    /// Parse method and URL from text.
    pub fn parse(method: &str, url: &str, library: impl Into<String>) -> Result<Self, ConversionError> {
        let method = method.parse()?;
        let url = Url::parse(url).map_err(|e| ConversionError::InvalidUrl {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self::new(method, url, library))
    }

    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.headers.append(name, value);
        self
    }

    pub fn with_body(mut self, body: Option<Body>) -> Self {
        self.body = body;
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn body(&self) -> Option<&Body> {
        self.body.as_ref()
    }

    /// Body bytes, empty when there is no body.
    pub fn body_bytes(&self) -> &[u8] {
        self.body.as_ref().map(|b| b.bytes.as_ref()).unwrap_or_default()
    }

    /// Name of the adapter that produced this request.
    pub fn library(&self) -> &str {
        &self.library
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub(crate) fn cap_body(&mut self, limit: usize) {
        self.body = self.body.take().map(|body| body.capped(limit));
    }

    /// Lossless-equivalence check used by adapter round trips: method, URL,
    /// headers (as a case-insensitive multimap) and body bytes.
    pub fn same_exchange(&self, other: &Request) -> bool {
        self.method == other.method
            && self.url == other.url
            && self.headers.same_entries(&other.headers)
            && self.body_bytes() == other.body_bytes()
    }
}
