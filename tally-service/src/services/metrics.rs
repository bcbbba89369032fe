//! Prometheus metrics for tally-service.
//!
//! Domain counters live in the default `prometheus` registry. HTTP request
//! metrics recorded through the `metrics` facade by the shared middleware are
//! rendered by the `metrics_exporter_prometheus` recorder installed here.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_histogram_vec, CounterVec, Encoder, HistogramVec, TextEncoder,
};
use std::sync::OnceLock;

/// Handle to the recorder behind the HTTP middleware metrics.
pub static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Tally passes by kind and outcome.
pub static TALLY_PASSES: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "tally_passes_total",
        "Total number of tally passes",
        &["kind", "status"]
    )
    .expect("Failed to register TALLY_PASSES")
});

/// Duration of tally passes by kind.
pub static TALLY_PASS_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "tally_pass_duration_seconds",
        "Tally pass duration in seconds",
        &["kind"],
        vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 300.0]
    )
    .expect("Failed to register TALLY_PASS_DURATION")
});

pub static SNAPSHOTS_WRITTEN: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "tally_snapshots_written_total",
        "Total number of snapshots created or updated",
        &["granularity"]
    )
    .expect("Failed to register SNAPSHOTS_WRITTEN")
});

pub static EVENTS_APPLIED: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "tally_events_applied_total",
        "Total number of events folded into hosts and hourly calculations",
        &["result"]
    )
    .expect("Failed to register EVENTS_APPLIED")
});

/// Facts and event measurements that could not be mapped.
pub static FACTS_SKIPPED: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "tally_facts_skipped_total",
        "Total number of facts or measurements skipped",
        &["reason"]
    )
    .expect("Failed to register FACTS_SKIPPED")
});

pub static PUBLISH_ATTEMPTS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "tally_publish_attempts_total",
        "Total number of snapshot publication attempts",
        &["status"]
    )
    .expect("Failed to register PUBLISH_ATTEMPTS")
});

pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "tally_db_query_duration_seconds",
        "Database query duration in seconds",
        &["operation"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]
    )
    .expect("Failed to register DB_QUERY_DURATION")
});

pub static ERRORS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "tally_errors_total",
        "Total number of errors",
        &["error_type"]
    )
    .expect("Failed to register ERRORS")
});

/// Initialize all metrics (forces lazy initialization) and install the HTTP
/// metrics recorder once per process.
pub fn init_metrics() {
    Lazy::force(&TALLY_PASSES);
    Lazy::force(&TALLY_PASS_DURATION);
    Lazy::force(&SNAPSHOTS_WRITTEN);
    Lazy::force(&EVENTS_APPLIED);
    Lazy::force(&FACTS_SKIPPED);
    Lazy::force(&PUBLISH_ATTEMPTS);
    Lazy::force(&DB_QUERY_DURATION);
    Lazy::force(&ERRORS);

    if METRICS_HANDLE.get().is_none() {
        match PrometheusBuilder::new().install_recorder() {
            Ok(handle) => {
                let _ = METRICS_HANDLE.set(handle);
            }
            Err(e) => tracing::debug!(error = %e, "Prometheus recorder already installed"),
        }
    }
}

/// Get all metrics as Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "Failed to encode metrics");
    }
    let mut output = String::from_utf8_lossy(&buffer).into_owned();
    if let Some(handle) = METRICS_HANDLE.get() {
        output.push_str(&handle.render());
    }
    output
}

pub fn record_tally_pass(kind: &str, status: &str, duration_secs: f64) {
    TALLY_PASSES.with_label_values(&[kind, status]).inc();
    TALLY_PASS_DURATION
        .with_label_values(&[kind])
        .observe(duration_secs);
}

pub fn record_snapshots_written(granularity: &str, count: usize) {
    SNAPSHOTS_WRITTEN
        .with_label_values(&[granularity])
        .inc_by(count as f64);
}

/// `result` is `applied`, `late` or `duplicate`.
pub fn record_event(result: &str) {
    EVENTS_APPLIED.with_label_values(&[result]).inc();
}

pub fn record_skipped_fact(reason: &str) {
    FACTS_SKIPPED.with_label_values(&[reason]).inc();
}

pub fn record_publish_attempt(status: &str) {
    PUBLISH_ATTEMPTS.with_label_values(&[status]).inc();
}

/// Record an error.
pub fn record_error(error_type: &str) {
    ERRORS.with_label_values(&[error_type]).inc();
}
