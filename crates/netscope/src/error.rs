//! Error taxonomy for the interception pipeline.
//!
//! None of these errors ever reach the host application: adapters recover from
//! [`ConversionError`] by passing the call through, the engine treats
//! [`MockResolutionError`] as "no match", and [`DecisionMisuseError`] only
//! reports a second terminal call on a [`RoutingDecision`](crate::engine::RoutingDecision).
//! Transport errors belong to the client library and are returned to the
//! caller untouched.

use crate::model::TransactionId;
use std::fmt;

/// A native request or response could not be represented canonically.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConversionError {
    #[error("invalid URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("unsupported HTTP method '{0}'")]
    UnsupportedMethod(String),
    #[error("invalid header '{name}': {reason}")]
    InvalidHeader { name: String, reason: String },
    #[error("invalid status code {0}")]
    InvalidStatus(u16),
    #[error("request body is a stream and cannot be observed without consuming it")]
    StreamingBody,
}

/// A mock rule could not produce a usable substitute.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MockResolutionError {
    #[error("rule '{rule_id}': invalid path pattern '{pattern}': {reason}")]
    InvalidPattern {
        rule_id: String,
        pattern: String,
        reason: String,
    },
    #[error("rule '{rule_id}': invalid substitute URL '{url}': {reason}")]
    InvalidUrl {
        rule_id: String,
        url: String,
        reason: String,
    },
    #[error("rule '{rule_id}': invalid method '{method}'")]
    InvalidMethod { rule_id: String, method: String },
    #[error("rule '{rule_id}': invalid mock response: {reason}")]
    InvalidResponse { rule_id: String, reason: String },
    #[error("rule '{rule_id}' serves a literal response but no mock endpoint is running")]
    NoMockEndpoint { rule_id: String },
}

/// Administrative changes to the mock rule set.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RuleSetError {
    #[error("duplicate rule id '{0}'")]
    DuplicateRule(String),
    #[error("rule '{0}' not found")]
    RuleNotFound(String),
    #[error(transparent)]
    Invalid(#[from] MockResolutionError),
}

/// Which terminal callback of a decision was invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalKind {
    Response,
    Error,
}

impl fmt::Display for TerminalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminalKind::Response => f.write_str("on_response"),
            TerminalKind::Error => f.write_str("on_error"),
        }
    }
}

/// A routing decision was completed more than once.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("transaction {id} already completed via {first}; ignoring {attempted}")]
pub struct DecisionMisuseError {
    pub id: TransactionId,
    pub first: TerminalKind,
    pub attempted: TerminalKind,
}
