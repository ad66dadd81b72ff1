//! Canonical transaction model.
//!
//! Library-independent representation of requests, responses and their
//! outcomes. Adapters convert their client library's native types into these
//! and back; the engine, resolver and recorder only ever see this model.
//!
//! # Module Structure
//!
//! - `method` - Request method enum
//! - `headers` - Ordered, case-insensitive header multimap
//! - `request` - Request and body
//! - `response` - Response and timing
//! - `transaction` - Transaction, outcome and transport failure summaries

mod headers;
mod method;
mod request;
mod response;
mod transaction;

pub use headers::Headers;
pub use method::Method;
pub use request::{Body, Request};
pub use response::{Response, Timing};
pub use transaction::{
    MockApplied, MockKind, Outcome, Transaction, TransactionId, TransportErrorKind,
    TransportFailure,
};
