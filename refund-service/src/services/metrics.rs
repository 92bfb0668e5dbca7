//! Prometheus metrics for refund-service.

use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_histogram_vec, CounterVec, HistogramVec, TextEncoder,
};

/// Form decisions by outcome (issued, rejected).
pub static FORMS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "refund_forms_total",
        "Total number of tax-free form decisions",
        &["outcome"]
    )
    .expect("Failed to register forms_total")
});

/// Refund transitions by method and resulting status.
pub static REFUNDS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "refund_refunds_total",
        "Total number of refund status transitions",
        &["method", "status"]
    )
    .expect("Failed to register refunds_total")
});

/// Net refund amount paid out by currency.
pub static REFUND_AMOUNT_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "refund_amount_total",
        "Total refund amount paid by currency",
        &["currency"]
    )
    .expect("Failed to register refund_amount_total")
});

/// Reconciled service gain by currency.
pub static SERVICE_GAIN_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "refund_service_gain_total",
        "Total reconciled service gain by currency",
        &["currency"]
    )
    .expect("Failed to register service_gain_total")
});

/// Payment provider call duration by provider.
pub static PROVIDER_CALL_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "refund_provider_call_duration_seconds",
        "Payment provider call duration in seconds",
        &["provider"],
        vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]
    )
    .expect("Failed to register provider_call_duration")
});

/// Database query duration histogram.
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "refund_db_query_duration_seconds",
        "Database query duration in seconds",
        &["operation"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]
    )
    .expect("Failed to register db_query_duration")
});

/// Retry sweep outcomes (succeeded, failed).
pub static SWEEP_RETRIES_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "refund_sweep_retries_total",
        "Total refunds retried by the background sweep",
        &["outcome"]
    )
    .expect("Failed to register sweep_retries_total")
});

/// Error counter for alerting.
pub static ERRORS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "refund_errors_total",
        "Total number of errors by type",
        &["error_type"]
    )
    .expect("Failed to register errors_total")
});

/// Initialize all metrics (forces lazy initialization).
pub fn init_metrics() {
    Lazy::force(&FORMS_TOTAL);
    Lazy::force(&REFUNDS_TOTAL);
    Lazy::force(&REFUND_AMOUNT_TOTAL);
    Lazy::force(&SERVICE_GAIN_TOTAL);
    Lazy::force(&PROVIDER_CALL_DURATION);
    Lazy::force(&DB_QUERY_DURATION);
    Lazy::force(&SWEEP_RETRIES_TOTAL);
    Lazy::force(&ERRORS_TOTAL);
}

/// Get metrics in Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder
        .encode_to_string(&metric_families)
        .unwrap_or_default()
}
