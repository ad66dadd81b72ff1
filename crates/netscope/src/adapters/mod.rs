//! Client library adapters.
//!
//! Every adapter follows the same contract around one network call:
//!
//! 1. Convert the native request to a canonical [`Request`]. If that fails,
//!    log it and send the original request untouched (no mock, no record).
//! 2. [`Engine::intercept`] and point the native request at
//!    [`RoutingDecision::actual_or_mock_request_url`]. Method, headers and
//!    body stay as they were.
//! 3. Run the real call with the library's own machinery.
//! 4. Report exactly one terminal callback: the converted response, or the
//!    transport failure. Library errors go back to the caller unchanged.
//!
//! # Module Structure
//!
//! - `reqwest` - wrapping client for `reqwest::Client`
//! - `hyper` - `tower::Layer` for hyper / hyper-util client stacks

pub mod hyper;
pub mod reqwest;

use crate::engine::{Engine, InterceptOption, RoutingDecision};
use crate::error::ConversionError;
use crate::metrics;
use crate::model::{Request, Response, Timing, TransportErrorKind, TransportFailure};
use tracing::warn;

/// Conversions between one client library's native types and the
/// canonical model. Implementations must be lossless for method, URL,
/// headers and body.
pub trait LibraryAdapter {
    type NativeRequest;
    /// Response with its body already buffered
    type NativeResponse;

    /// Default adapter name recorded on transactions
    const NAME: &'static str;

    fn request_to_canonical(
        native: &Self::NativeRequest,
        library: &str,
    ) -> Result<Request, ConversionError>;

    fn request_from_canonical(request: &Request) -> Result<Self::NativeRequest, ConversionError>;

    fn response_to_canonical(
        native: &Self::NativeResponse,
        timing: Timing,
    ) -> Result<Response, ConversionError>;

    fn response_from_canonical(response: &Response)
        -> Result<Self::NativeResponse, ConversionError>;
}

/// Enter the engine, or fall back to pass-through when the request could
/// not be converted.
pub(crate) fn begin(
    engine: &Engine,
    name: &str,
    converted: Result<Request, ConversionError>,
) -> Option<RoutingDecision> {
    match converted {
        Ok(request) => Some(engine.intercept(request, InterceptOption::new(name))),
        Err(e) => {
            warn!("{}: request not intercepted, passing through: {}", name, e);
            metrics::record_conversion_error(name);
            None
        }
    }
}

/// Complete `decision` with a buffered native response.
pub(crate) fn report_response<A: LibraryAdapter>(
    decision: &RoutingDecision,
    native: &A::NativeResponse,
    timing: Timing,
) {
    // Misuse is already logged by the decision
    let _ = match A::response_to_canonical(native, timing) {
        Ok(response) => decision.on_response(response),
        Err(e) => {
            warn!(
                "Transaction {}: response could not be converted: {}",
                decision.id(),
                e
            );
            decision.on_failure(TransportFailure::new(
                TransportErrorKind::Conversion,
                e.to_string(),
            ))
        }
    };
}
