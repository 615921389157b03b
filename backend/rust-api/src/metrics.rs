use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, register_int_gauge,
    Encoder, HistogramVec, IntCounter, IntCounterVec, IntGauge, TextEncoder,
};

lazy_static! {
    // HTTP
    pub static ref HTTP_REQUESTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "http_requests_total",
        "Total number of HTTP requests",
        &["method", "path", "status"]
    )
    .unwrap();

    pub static ref HTTP_REQUEST_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "http_request_duration_seconds",
        "HTTP request duration in seconds",
        &["method", "path"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]
    )
    .unwrap();

    // Submission store writes
    pub static ref STORE_WRITES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "submission_store_writes_total",
        "Submission store writes by operation and outcome",
        &["operation", "outcome"]
    )
    .unwrap();

    // Grading
    pub static ref GRADINGS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "gradings_total",
        "Completed gradings by verdict",
        &["passed"]
    )
    .unwrap();

    pub static ref GRADING_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "grading_duration_seconds",
        "Time from submit to fully collected feedback",
        &["exercise"],
        vec![0.5, 1.0, 2.5, 5.0, 10.0, 20.0, 30.0, 60.0]
    )
    .unwrap();

    pub static ref COMPLETION_FAILURES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "completion_failures_total",
        "Grading requests whose completion stream failed",
        &["reason"]
    )
    .unwrap();

    pub static ref GRADING_STREAMS_ACTIVE: IntGauge = register_int_gauge!(
        "grading_streams_active",
        "Grading streams currently in flight"
    )
    .unwrap();

    pub static ref SUPERSEDED_RESULTS_TOTAL: IntCounter = register_int_counter!(
        "grading_results_superseded_total",
        "In-flight results discarded because the selection moved on"
    )
    .unwrap();
}

/// Renders all metrics in Prometheus text format
pub fn render_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    String::from_utf8(buffer)
        .map_err(|e| prometheus::Error::Msg(format!("Failed to convert metrics to UTF-8: {}", e)))
}

pub fn record_store_write(operation: &str, outcome: &str) {
    STORE_WRITES_TOTAL
        .with_label_values(&[operation, outcome])
        .inc();
}

pub fn record_grading(exercise: &str, passed: bool, elapsed_secs: f64) {
    let label = if passed { "true" } else { "false" };
    GRADINGS_TOTAL.with_label_values(&[label]).inc();
    GRADING_DURATION_SECONDS
        .with_label_values(&[exercise])
        .observe(elapsed_secs);
}

pub fn record_completion_failure(reason: &str) {
    COMPLETION_FAILURES_TOTAL.with_label_values(&[reason]).inc();
}

pub fn record_superseded_result() {
    SUPERSEDED_RESULTS_TOTAL.inc();
}

/// Keeps `grading_streams_active` accurate even when a grading task bails out early.
pub struct ActiveStreamGuard;

impl ActiveStreamGuard {
    pub fn enter() -> Self {
        GRADING_STREAMS_ACTIVE.inc();
        ActiveStreamGuard
    }
}

impl Drop for ActiveStreamGuard {
    fn drop(&mut self) {
        GRADING_STREAMS_ACTIVE.dec();
    }
}
