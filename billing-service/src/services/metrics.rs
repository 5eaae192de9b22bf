//! Prometheus metrics for billing-service.
//!
//! Domain counters live in the default `prometheus` registry. HTTP request
//! metrics come from the shared middleware through the `metrics` facade and
//! are rendered by the installed recorder; `/metrics` serves both.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::{Lazy, OnceCell};
use prometheus::{
    register_counter_vec, register_histogram_vec, register_int_counter_vec, CounterVec,
    HistogramVec, IntCounterVec, TextEncoder,
};

/// Invoice generation outcomes (generated, skipped, failed).
pub static INVOICE_GENERATION_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "billing_invoice_generation_total",
        "Per-client invoice generation outcomes",
        &["outcome"]
    )
    .expect("Failed to register invoice_generation_total")
});

/// Invoiced amount by currency.
pub static INVOICE_AMOUNT_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "billing_invoice_amount_total",
        "Total invoiced amount by currency",
        &["currency"]
    )
    .expect("Failed to register invoice_amount_total")
});

/// Gateway calls by operation and outcome.
pub static GATEWAY_REQUESTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "billing_gateway_requests_total",
        "Payment gateway requests by operation and outcome",
        &["operation", "outcome"]
    )
    .expect("Failed to register gateway_requests_total")
});

/// Webhook events by type and outcome.
pub static WEBHOOK_EVENTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "billing_webhook_events_total",
        "Inbound gateway webhook events by type and outcome",
        &["event_type", "outcome"]
    )
    .expect("Failed to register webhook_events_total")
});

/// Notifications by kind and outcome.
pub static NOTIFICATIONS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "billing_notifications_total",
        "Invoice notifications by kind and outcome",
        &["kind", "outcome"]
    )
    .expect("Failed to register notifications_total")
});

/// Database query duration histogram.
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "billing_db_query_duration_seconds",
        "Database query duration in seconds",
        &["operation"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]
    )
    .expect("Failed to register db_query_duration")
});

static RECORDER_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Initialize all metrics and install the recorder for the `metrics` facade.
///
/// Safe to call more than once; the recorder is installed on the first call.
pub fn init_metrics() {
    if let Err(e) = RECORDER_HANDLE.get_or_try_init(|| PrometheusBuilder::new().install_recorder())
    {
        tracing::warn!(error = %e, "Failed to install metrics recorder");
    }

    Lazy::force(&INVOICE_GENERATION_TOTAL);
    Lazy::force(&INVOICE_AMOUNT_TOTAL);
    Lazy::force(&GATEWAY_REQUESTS_TOTAL);
    Lazy::force(&WEBHOOK_EVENTS_TOTAL);
    Lazy::force(&NOTIFICATIONS_TOTAL);
    Lazy::force(&DB_QUERY_DURATION);
}

/// Get metrics in Prometheus text format.
pub fn get_metrics() -> String {
    let mut output = RECORDER_HANDLE
        .get()
        .map(|handle| handle.render())
        .unwrap_or_default();

    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    if let Ok(registry) = encoder.encode_to_string(&metric_families) {
        output.push_str(&registry);
    }
    output
}

pub fn record_generation(outcome: &str) {
    INVOICE_GENERATION_TOTAL.with_label_values(&[outcome]).inc();
}

pub fn record_invoice_amount(currency: &str, amount: f64) {
    INVOICE_AMOUNT_TOTAL.with_label_values(&[currency]).inc_by(amount);
}

pub fn record_gateway_request(operation: &str, outcome: &str) {
    GATEWAY_REQUESTS_TOTAL
        .with_label_values(&[operation, outcome])
        .inc();
}

pub fn record_webhook_event(event_type: &str, outcome: &str) {
    WEBHOOK_EVENTS_TOTAL
        .with_label_values(&[event_type, outcome])
        .inc();
}

pub fn record_notification(kind: &str, outcome: &str) {
    NOTIFICATIONS_TOTAL.with_label_values(&[kind, outcome]).inc();
}
