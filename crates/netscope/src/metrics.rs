//! Prometheus metrics for the interception pipeline.
//!
//! Tracks routing decisions, recorded outcomes, and the recoverable error
//! paths (conversion fallbacks, decision misuse, unusable mock rules).
use lazy_static::lazy_static;
use prometheus::{register_counter_vec, register_histogram_vec, CounterVec, Encoder, HistogramVec, TextEncoder};

lazy_static! {
    /// Requests that entered the engine, by adapter and route
    pub static ref INTERCEPTED_TOTAL: CounterVec = register_counter_vec!(
        "netscope_intercepted_total",
        "Total number of requests routed by the interception engine",
        &["adapter", "route"]  // route: pass_through|redirect|literal|disabled
    )
    .unwrap();

    /// Finalized transactions by outcome
    pub static ref TRANSACTIONS_TOTAL: CounterVec = register_counter_vec!(
        "netscope_transactions_total",
        "Total number of transactions handed to the recorder",
        &["adapter", "outcome"]  // outcome: response|error
    )
    .unwrap();

    /// Native requests that could not be converted (passed through unobserved)
    pub static ref CONVERSION_ERRORS_TOTAL: CounterVec = register_counter_vec!(
        "netscope_conversion_errors_total",
        "Total number of native request conversions that fell back to pass-through",
        &["adapter"]
    )
    .unwrap();

    /// Terminal callbacks invoked after a decision was already completed
    pub static ref DECISION_MISUSE_TOTAL: CounterVec = register_counter_vec!(
        "netscope_decision_misuse_total",
        "Total number of ignored repeated terminal callbacks",
        &["attempted"]
    )
    .unwrap();

    /// Mock rules that matched but could not produce a substitute
    pub static ref MOCK_RESOLUTION_ERRORS_TOTAL: CounterVec = register_counter_vec!(
        "netscope_mock_resolution_errors_total",
        "Total number of mock resolution failures treated as no match",
        &["adapter"]
    )
    .unwrap();

    /// Transactions dropped from the recorder
    pub static ref EVICTED_TOTAL: CounterVec = register_counter_vec!(
        "netscope_evicted_total",
        "Total number of transactions evicted from the recorder",
        &["reason"]  // reason: capacity|pending_overflow|stale
    )
    .unwrap();

    /// Exchange duration as reported by adapters
    pub static ref EXCHANGE_DURATION_MS: HistogramVec = register_histogram_vec!(
        "netscope_exchange_duration_ms",
        "Duration of intercepted exchanges in milliseconds",
        &["adapter", "outcome"],
        vec![1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0]
    )
    .unwrap();
}

/// Collect and return all metrics in Prometheus text format
pub fn collect_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!("Failed to encode metrics: {}", e);
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

pub fn record_intercepted(adapter: &str, route: &str) {
    INTERCEPTED_TOTAL.with_label_values(&[adapter, route]).inc();
}

pub fn record_transaction(adapter: &str, outcome: &str, duration_ms: Option<f64>) {
    TRANSACTIONS_TOTAL
        .with_label_values(&[adapter, outcome])
        .inc();
    if let Some(ms) = duration_ms {
        EXCHANGE_DURATION_MS
            .with_label_values(&[adapter, outcome])
            .observe(ms);
    }
}

pub fn record_conversion_error(adapter: &str) {
    CONVERSION_ERRORS_TOTAL.with_label_values(&[adapter]).inc();
}

pub fn record_decision_misuse(attempted: &str) {
    DECISION_MISUSE_TOTAL.with_label_values(&[attempted]).inc();
}

pub fn record_mock_resolution_error(adapter: &str) {
    MOCK_RESOLUTION_ERRORS_TOTAL
        .with_label_values(&[adapter])
        .inc();
}

pub fn record_eviction(reason: &str, count: usize) {
    EVICTED_TOTAL
        .with_label_values(&[reason])
        .inc_by(count as f64);
}
