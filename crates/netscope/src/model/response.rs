//! Canonical response type.

use super::{Body, Headers, TransactionId};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;

/// Start/end of a network exchange as seen by the adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Timing {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl Timing {
    pub fn new(started_at: DateTime<Utc>, finished_at: DateTime<Utc>) -> Self {
        Self {
            started_at,
            finished_at,
        }
    }

    /// Timing for an exchange that started at `started_at` and ends now.
    pub fn since(started_at: DateTime<Utc>) -> Self {
        Self::new(started_at, Utc::now())
    }

    pub fn duration(&self) -> Duration {
        (self.finished_at - self.started_at)
            .to_std()
            .unwrap_or_default()
    }
}

impl Default for Timing {
    fn default() -> Self {
        let now = Utc::now();
        Self::new(now, now)
    }
}

/// A library-independent response. `request_id` associates it with the
/// request it answers; it is set by the engine when the response is reported.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Response {
    status: u16,
    headers: Headers,
    #[serde(skip_serializing_if = "Option::is_none")]
    body: Option<Body>,
    timing: Timing,
    #[serde(skip_serializing_if = "Option::is_none")]
    request_id: Option<TransactionId>,
}

impl Response {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Headers::new(),
            body: None,
            timing: Timing::default(),
            request_id: None,
        }
    }

    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_body(mut self, body: Option<Body>) -> Self {
        self.body = body;
        self
    }

    pub fn with_timing(mut self, timing: Timing) -> Self {
        self.timing = timing;
        self
    }

    pub(crate) fn answering(mut self, id: TransactionId) -> Self {
        self.request_id = Some(id);
        self
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn body(&self) -> Option<&Body> {
        self.body.as_ref()
    }

    pub fn body_bytes(&self) -> &[u8] {
        self.body.as_ref().map(|b| b.bytes.as_ref()).unwrap_or_default()
    }

    pub fn timing(&self) -> &Timing {
        &self.timing
    }

    pub fn request_id(&self) -> Option<TransactionId> {
        self.request_id
    }

    pub(crate) fn cap_body(&mut self, limit: usize) {
        self.body = self.body.take().map(|body| body.capped(limit));
    }

    /// Status, headers (case-insensitive multimap) and body bytes match.
    pub fn same_exchange(&self, other: &Response) -> bool {
        self.status == other.status
            && self.headers.same_entries(&other.headers)
            && self.body_bytes() == other.body_bytes()
    }
}
