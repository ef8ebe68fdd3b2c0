//! Prometheus metrics for the ReqX engine.
//!
//! Tracks paused-request resolutions, rule matches, injected delays and
//! failed host calls.
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_histogram_vec, CounterVec, Encoder, Gauge,
    HistogramVec, TextEncoder,
};

lazy_static! {
    /// Paused requests handed to the pipeline
    pub static ref PAUSED_REQUESTS_TOTAL: CounterVec = register_counter_vec!(
        "reqx_paused_requests_total",
        "Total number of paused requests evaluated by the pipeline",
        &["method"]
    )
    .unwrap();

    /// Resolution issued per paused request
    pub static ref RESOLUTIONS_TOTAL: CounterVec = register_counter_vec!(
        "reqx_resolutions_total",
        "Total number of paused request resolutions",
        &["kind"]  // kind: continue|fail|fulfill
    )
    .unwrap();

    /// Rule matches by category
    pub static ref RULE_MATCHES_TOTAL: CounterVec = register_counter_vec!(
        "reqx_rule_matches_total",
        "Total number of rule matches",
        &["category", "action"]  // category: intercept|mock|header-override
    )
    .unwrap();

    /// Injected delay in milliseconds
    pub static ref DELAY_INJECTED_MS: HistogramVec = register_histogram_vec!(
        "reqx_delay_injected_ms",
        "Histogram of injected delay in milliseconds",
        &["category"],
        vec![10.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0]
    )
    .unwrap();

    /// Host commands that returned an error
    pub static ref HOST_FAILURES_TOTAL: CounterVec = register_counter_vec!(
        "reqx_host_failures_total",
        "Total number of failed host commands",
        &["command"]
    )
    .unwrap();

    /// Rules installed on the declarative fast path after the last sync
    pub static ref FAST_PATH_RULES: Gauge = register_gauge!(
        "reqx_fast_path_rules",
        "Number of intercept rules currently enforced by the declarative fast path"
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
        return String::new();
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

pub fn record_paused_request(method: &str) {
    PAUSED_REQUESTS_TOTAL.with_label_values(&[method]).inc();
}

/// `kind` is one of `continue`, `fail` or `fulfill`
pub fn record_resolution(kind: &str) {
    RESOLUTIONS_TOTAL.with_label_values(&[kind]).inc();
}

pub fn record_rule_match(category: &str, action: &str) {
    RULE_MATCHES_TOTAL
        .with_label_values(&[category, action])
        .inc();
}

pub fn record_delay(category: &str, delay_ms: u64) {
    DELAY_INJECTED_MS
        .with_label_values(&[category])
        .observe(delay_ms as f64);
}

pub fn record_host_failure(command: &str) {
    HOST_FAILURES_TOTAL.with_label_values(&[command]).inc();
}

pub fn record_fast_path_sync(installed: usize) {
    FAST_PATH_RULES.set(installed as f64);
}
