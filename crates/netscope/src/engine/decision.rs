//! Routing decisions and their single-assignment terminal slot.

use crate::error::{DecisionMisuseError, TerminalKind};
use crate::metrics;
use crate::mock_endpoint::MockEndpoint;
use crate::model::{
    MockApplied, Outcome, Request, Response, Transaction, TransactionId, TransportFailure,
};
use crate::recorder::Recorder;
use chrono::Utc;
use parking_lot::Mutex;
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};
use url::Url;

/// Where the engine sent a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    PassThrough,
    Redirect { rule_id: String },
    /// Served by the local mock endpoint
    Literal { rule_id: String },
}

impl Route {
    pub fn as_str(&self) -> &'static str {
        match self {
            Route::PassThrough => "pass_through",
            Route::Redirect { .. } => "redirect",
            Route::Literal { .. } => "literal",
        }
    }

    pub fn rule_id(&self) -> Option<&str> {
        match self {
            Route::PassThrough => None,
            Route::Redirect { rule_id } | Route::Literal { rule_id } => Some(rule_id),
        }
    }
}

/// Everything needed to turn a terminal callback into a recorded transaction.
pub(crate) struct Finalizer {
    pub(crate) adapter: String,
    pub(crate) request: Request,
    pub(crate) mock: Option<MockApplied>,
    pub(crate) recorder: Arc<Recorder>,
    /// Set when a literal response was staged for this transaction
    pub(crate) staged_on: Option<Arc<MockEndpoint>>,
}

impl Finalizer {
    fn finish(self, id: TransactionId, outcome: Outcome) {
        if let Some(endpoint) = &self.staged_on {
            endpoint.release(id);
        }

        let duration_ms = match &outcome {
            Outcome::Response(response) => response.timing().duration().as_secs_f64() * 1000.0,
            _ => (Utc::now() - self.request.created_at())
                .to_std()
                .unwrap_or_default()
                .as_secs_f64()
                * 1000.0,
        };
        metrics::record_transaction(&self.adapter, outcome.label(), Some(duration_ms));

        let transaction = Transaction::pending(id, self.adapter, self.request, self.mock);
        self.recorder.complete(transaction.complete(outcome));
    }
}

enum Slot {
    /// Nothing to record (engine disabled)
    Detached,
    Armed(Box<Finalizer>),
    Done(TerminalKind),
}

/// Produced once per intercepted request.
///
/// The adapter dials [`actual_or_mock_request_url`](Self::actual_or_mock_request_url)
/// and then reports exactly one of [`on_response`](Self::on_response) or
/// [`on_error`](Self::on_error). The first terminal call wins; any later call
/// is logged, counted and returned as [`DecisionMisuseError`] without
/// touching the recorder. Dropping the decision without a terminal call
/// leaves the transaction pending until the reaper evicts it, and releases
/// any staged mock response.
pub struct RoutingDecision {
    id: TransactionId,
    url: Url,
    route: Route,
    slot: Mutex<Slot>,
}

impl RoutingDecision {
    pub(crate) fn armed(id: TransactionId, url: Url, route: Route, finalizer: Finalizer) -> Self {
        Self {
            id,
            url,
            route,
            slot: Mutex::new(Slot::Armed(Box::new(finalizer))),
        }
    }

    pub(crate) fn detached(id: TransactionId, url: Url) -> Self {
        Self {
            id,
            url,
            route: Route::PassThrough,
            slot: Mutex::new(Slot::Detached),
        }
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    /// The URL the adapter must dial: the original one, or a mock substitute.
    pub fn actual_or_mock_request_url(&self) -> &Url {
        &self.url
    }

    pub fn route(&self) -> &Route {
        &self.route
    }

    pub fn is_mocked(&self) -> bool {
        self.route != Route::PassThrough
    }

    pub fn is_completed(&self) -> bool {
        matches!(*self.slot.lock(), Slot::Done(_))
    }

    pub fn on_response(&self, response: Response) -> Result<(), DecisionMisuseError> {
        if let Some(finalizer) = self.take(TerminalKind::Response)? {
            finalizer.finish(self.id, Outcome::Response(response.answering(self.id)));
        }
        Ok(())
    }

    /// Report a transport failure. The error itself stays with the caller.
    pub fn on_error(&self, error: &(dyn StdError + 'static)) -> Result<(), DecisionMisuseError> {
        self.on_failure(TransportFailure::from_error(error))
    }

    /// Report an already-classified transport failure.
    pub fn on_failure(&self, failure: TransportFailure) -> Result<(), DecisionMisuseError> {
        if let Some(finalizer) = self.take(TerminalKind::Error)? {
            finalizer.finish(self.id, Outcome::Error(failure));
        }
        Ok(())
    }

    fn take(&self, attempted: TerminalKind) -> Result<Option<Box<Finalizer>>, DecisionMisuseError> {
        let mut slot = self.slot.lock();
        match std::mem::replace(&mut *slot, Slot::Done(attempted)) {
            Slot::Armed(finalizer) => Ok(Some(finalizer)),
            Slot::Detached => Ok(None),
            Slot::Done(first) => {
                *slot = Slot::Done(first);
                drop(slot);
                let err = DecisionMisuseError {
                    id: self.id,
                    first,
                    attempted,
                };
                warn!("Ignoring repeated terminal callback: {}", err);
                metrics::record_decision_misuse(&attempted.to_string());
                Err(err)
            }
        }
    }
}

impl fmt::Debug for RoutingDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoutingDecision")
            .field("id", &self.id)
            .field("url", &self.url.as_str())
            .field("route", &self.route)
            .field("completed", &self.is_completed())
            .finish()
    }
}

impl Drop for RoutingDecision {
    fn drop(&mut self) {
        if let Slot::Armed(finalizer) = self.slot.get_mut() {
            // Nobody can dial the staged response any more
            if let Some(endpoint) = &finalizer.staged_on {
                endpoint.release(self.id);
            }
            debug!(
                "Transaction {} dropped without a terminal callback; left pending",
                self.id
            );
        }
    }
}
