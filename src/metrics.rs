//! Prometheus instrumentation for the rollup store
//!
//! Process-wide collectors for persist/find latency, lock contention, the
//! fail-fast breaker, the write buffer and ingestion outcomes.

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_histogram_vec, register_int_counter, register_int_gauge,
    CounterVec, Encoder, HistogramVec, IntCounter, IntGauge, TextEncoder,
};

lazy_static! {
    // === Latency Histograms ===

    /// Persist duration, labelled by outcome
    pub static ref PERSIST_DURATION: HistogramVec = register_histogram_vec!(
        "rollup_persist_duration_seconds",
        "Total persist time across all tiers in seconds",
        &["status"],
        vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]
    ).expect("persist histogram registers once");

    /// Read duration, labelled by read kind
    pub static ref FIND_DURATION: HistogramVec = register_histogram_vec!(
        "rollup_find_duration_seconds",
        "Read latency in seconds",
        &["kind"],
        vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]
    ).expect("find histogram registers once");

    /// Time spent acquiring entity locks
    pub static ref LOCK_ACQUIRE_DURATION: HistogramVec = register_histogram_vec!(
        "rollup_lock_acquire_seconds",
        "Time spent acquiring entity locks, including retries",
        &["lock_type"],
        vec![0.0001, 0.001, 0.01, 0.1, 1.0, 5.0]
    ).expect("lock histogram registers once");

    // === Counters ===

    /// Lock failures by reason
    pub static ref LOCK_FAILURES: CounterVec = register_counter_vec!(
        "rollup_lock_failures_total",
        "Lock acquisition and release failures",
        &["reason"]
    ).expect("lock failure counter registers once");

    /// Backend errors by operation
    pub static ref BACKEND_ERRORS: CounterVec = register_counter_vec!(
        "rollup_backend_errors_total",
        "Errors returned by the bucket store",
        &["operation"]
    ).expect("backend error counter registers once");

    /// Breaker transitions
    pub static ref FAIL_FAST_TRANSITIONS: CounterVec = register_counter_vec!(
        "rollup_fail_fast_transitions_total",
        "Fail-fast breaker state changes",
        &["state"]
    ).expect("fail-fast counter registers once");

    /// Buffer flushes by trigger
    pub static ref BUFFER_FLUSHES: CounterVec = register_counter_vec!(
        "rollup_buffer_flushes_total",
        "Write buffer flushes",
        &["trigger"]
    ).expect("buffer flush counter registers once");

    /// Ingested deliveries by outcome
    pub static ref INGEST_MESSAGES: CounterVec = register_counter_vec!(
        "rollup_ingest_messages_total",
        "Deliveries handled by ingest workers",
        &["outcome"]
    ).expect("ingest counter registers once");

    /// Watchdog ticks by the signal sent to listeners
    pub static ref WATCHDOG_TICKS: CounterVec = register_counter_vec!(
        "rollup_watchdog_ticks_total",
        "Watchdog checks",
        &["signal"]
    ).expect("watchdog counter registers once");

    // === Gauges ===

    /// Buffered entities discarded because the store rejected them
    pub static ref BUFFER_DISCARDED: IntCounter = register_int_counter!(
        "rollup_buffer_discarded_total",
        "Buffered entities dropped at flush after a validation error"
    ).expect("buffer discard counter registers once");

    /// Entities currently held in the write buffer
    pub static ref BUFFERED_ENTITIES: IntGauge = register_int_gauge!(
        "rollup_buffered_entities",
        "Entities with unflushed metrics in the write buffer"
    ).expect("buffer gauge registers once");
}

/// Record a persist
pub fn record_persist(duration_secs: f64, success: bool) {
    let status = if success { "success" } else { "error" };
    PERSIST_DURATION
        .with_label_values(&[status])
        .observe(duration_secs);
}

/// Record a read
pub fn record_find(kind: &str, duration_secs: f64) {
    FIND_DURATION.with_label_values(&[kind]).observe(duration_secs);
}

/// Record a lock failure
pub fn record_lock_failure(reason: &str) {
    LOCK_FAILURES.with_label_values(&[reason]).inc();
}

/// Record a backend error
pub fn record_backend_error(operation: &str) {
    BACKEND_ERRORS.with_label_values(&[operation]).inc();
}

/// Get metrics in Prometheus text format
pub fn gather_text() -> Result<String, String> {
    let encoder = TextEncoder::new();
    let families = prometheus::gather();
    let mut buffer = vec![];

    encoder
        .encode(&families, &mut buffer)
        .map_err(|e| format!("Failed to encode metrics: {}", e))?;

    String::from_utf8(buffer).map_err(|e| format!("Metrics contain invalid UTF-8: {}", e))
}
