//! Transactions: a request paired with its eventual outcome.

use super::{Request, Response};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::error::Error as StdError;
use std::fmt;
use std::io;
use url::Url;

/// Unique, monotonically assigned transaction identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct TransactionId(u64);

impl TransactionId {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TransactionId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(Self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportErrorKind {
    Connect,
    Timeout,
    Request,
    Body,
    /// The exchange succeeded but its response could not be converted.
    Conversion,
    Other,
}

impl TransportErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportErrorKind::Connect => "connect",
            TransportErrorKind::Timeout => "timeout",
            TransportErrorKind::Request => "request",
            TransportErrorKind::Body => "body",
            TransportErrorKind::Conversion => "conversion",
            TransportErrorKind::Other => "other",
        }
    }
}

/// Recorded summary of a failed exchange. The library's own error goes back
/// to the caller unchanged; this is what the inspection layer sees.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransportFailure {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportFailure {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Summarize an arbitrary error, classifying it from the `io::Error`
    /// found in its source chain when there is one.
    pub fn from_error(err: &(dyn StdError + 'static)) -> Self {
        let mut kind = TransportErrorKind::Other;
        let mut message = err.to_string();
        let mut source = err.source();
        let mut current: Option<&(dyn StdError + 'static)> = Some(err);

        while let Some(e) = current {
            if let Some(io_err) = e.downcast_ref::<io::Error>() {
                kind = match io_err.kind() {
                    io::ErrorKind::TimedOut => TransportErrorKind::Timeout,
                    io::ErrorKind::ConnectionRefused
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::NotConnected
                    | io::ErrorKind::AddrNotAvailable => TransportErrorKind::Connect,
                    _ => kind,
                };
                break;
            }
            current = e.source();
        }

        while let Some(e) = source {
            message.push_str(": ");
            message.push_str(&e.to_string());
            source = e.source();
        }

        Self { kind, message }
    }
}

impl fmt::Display for TransportFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} error: {}", self.kind.as_str(), self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", content = "value", rename_all = "snake_case")]
pub enum Outcome {
    Pending,
    Response(Response),
    Error(TransportFailure),
}

impl Outcome {
    pub fn is_pending(&self) -> bool {
        matches!(self, Outcome::Pending)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Pending => "pending",
            Outcome::Response(_) => "response",
            Outcome::Error(_) => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MockKind {
    /// The request was dialed at the rule's substitute URL.
    Redirect,
    /// The request was dialed at the local mock endpoint.
    Literal,
}

/// Mock substitution applied to a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MockApplied {
    pub rule_id: String,
    pub kind: MockKind,
    pub dialed_url: Url,
}

/// A request paired with exactly one of pending, response or error.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Transaction {
    pub id: TransactionId,
    pub adapter: String,
    pub request: Request,
    pub outcome: Outcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mock: Option<MockApplied>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Transaction {
    pub fn pending(
        id: TransactionId,
        adapter: impl Into<String>,
        request: Request,
        mock: Option<MockApplied>,
    ) -> Self {
        Self {
            id,
            adapter: adapter.into(),
            request,
            outcome: Outcome::Pending,
            mock,
            completed_at: None,
        }
    }

    pub fn complete(mut self, outcome: Outcome) -> Self {
        self.outcome = outcome;
        self.completed_at = Some(Utc::now());
        self
    }

    /// URL the adapter actually dialed.
    pub fn dialed_url(&self) -> &Url {
        self.mock
            .as_ref()
            .map(|m| &m.dialed_url)
            .unwrap_or_else(|| self.request.url())
    }

    pub fn response(&self) -> Option<&Response> {
        match &self.outcome {
            Outcome::Response(response) => Some(response),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&TransportFailure> {
        match &self.outcome {
            Outcome::Error(failure) => Some(failure),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Wrapped(io::Error);

    impl fmt::Display for Wrapped {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("client error")
        }
    }

    impl StdError for Wrapped {
        fn source(&self) -> Option<&(dyn StdError + 'static)> {
            Some(&self.0)
        }
    }

    #[test]
    fn test_failure_classified_from_source_chain() {
        let err = Wrapped(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"));
        let failure = TransportFailure::from_error(&err);
        assert_eq!(failure.kind, TransportErrorKind::Connect);
        assert_eq!(failure.message, "client error: refused");
    }

    #[test]
    fn test_failure_timeout() {
        let err = io::Error::new(io::ErrorKind::TimedOut, "too slow");
        let failure = TransportFailure::from_error(&err);
        assert_eq!(failure.kind, TransportErrorKind::Timeout);
    }

    #[test]
    fn test_unclassified_failure() {
        let err = std::fmt::Error;
        let failure = TransportFailure::from_error(&err);
        assert_eq!(failure.kind, TransportErrorKind::Other);
    }

    #[test]
    fn test_complete_sets_outcome() {
        let request = Request::parse("GET", "http://localhost/a", "test").unwrap();
        let txn = Transaction::pending(TransactionId::new(1), "test", request, None);
        assert!(txn.outcome.is_pending());
        assert_eq!(txn.dialed_url().as_str(), "http://localhost/a");

        let done = txn.complete(Outcome::Response(Response::new(200)));
        assert_eq!(done.response().map(|r| r.status()), Some(200));
        assert!(done.completed_at.is_some());
        assert!(done.error().is_none());
    }

    #[test]
    fn test_outcome_serialization() {
        let outcome = Outcome::Error(TransportFailure::new(TransportErrorKind::Timeout, "slow"));
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["state"], "error");
        assert_eq!(json["value"]["kind"], "timeout");
    }
}
