//! Metrics and telemetry for the analytics engine
//!
//! Prometheus metrics covering event recording, query evaluation, scratch-key
//! hygiene and user allocation.

use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_gauge, register_histogram_vec, Counter,
    CounterVec, Encoder, Gauge, HistogramVec, TextEncoder,
};

lazy_static! {
    // === Write Path ===

    /// Total record calls
    pub static ref EVENTS_RECORDED: CounterVec = register_counter_vec!(
        "bitesized_events_recorded_total",
        "Total record operations by bit value and status",
        &["value", "status"]
    ).unwrap();

    /// Batches that stopped midway
    pub static ref PARTIAL_WRITES: Counter = register_counter!(
        "bitesized_partial_writes_total",
        "Total record batches that were only partially applied"
    ).unwrap();

    /// Newly allocated user offsets
    pub static ref USERS_ALLOCATED: Counter = register_counter!(
        "bitesized_users_allocated_total",
        "Total user offsets allocated by this process"
    ).unwrap();

    /// Offset cache lookups
    pub static ref OFFSET_CACHE: CounterVec = register_counter_vec!(
        "bitesized_offset_cache_total",
        "User offset cache lookups by result",
        &["result"]
    ).unwrap();

    // === Read Path ===

    /// Total query evaluations
    pub static ref QUERIES_TOTAL: CounterVec = register_counter_vec!(
        "bitesized_queries_total",
        "Total set-algebra evaluations by operator and status",
        &["operator", "status"]
    ).unwrap();

    /// Query evaluation duration
    pub static ref QUERY_DURATION: HistogramVec = register_histogram_vec!(
        "bitesized_query_duration_seconds",
        "Set-algebra evaluation latency in seconds",
        &["operator"],
        vec![0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]
    ).unwrap();

    // === Scratch Keys ===

    /// Scratch keys that could not be deleted after a query
    pub static ref SCRATCH_CLEANUP_FAILURES: Counter = register_counter!(
        "bitesized_scratch_cleanup_failures_total",
        "Total scratch keys left behind by a failed delete"
    ).unwrap();

    /// Stray scratch keys removed by scavenging
    pub static ref SCRATCH_KEYS_SCAVENGED: Counter = register_counter!(
        "bitesized_scratch_keys_scavenged_total",
        "Total stray scratch keys removed"
    ).unwrap();

    // === Errors ===

    /// Total errors by type
    pub static ref ERRORS_TOTAL: CounterVec = register_counter_vec!(
        "bitesized_errors_total",
        "Total errors by type and operation",
        &["error_type", "operation"]
    ).unwrap();

    // === Store Connection ===

    /// Whether the store connection is up (0=down, 1=up)
    pub static ref STORE_CONNECTED: Gauge = register_gauge!(
        "bitesized_store_connected",
        "Store connection state (0=down, 1=up)"
    ).unwrap();
}

/// Initialize metrics system
///
/// Registers the unlabelled metrics so they are exported before first use.
pub fn init() {
    lazy_static::initialize(&STORE_CONNECTED);
    lazy_static::initialize(&PARTIAL_WRITES);
    lazy_static::initialize(&USERS_ALLOCATED);
    lazy_static::initialize(&SCRATCH_CLEANUP_FAILURES);
    lazy_static::initialize(&SCRATCH_KEYS_SCAVENGED);
    tracing::info!("Metrics system initialized");
}

/// Get metrics in Prometheus text format
///
/// # Returns
///
/// Result containing the formatted metrics string, or an error if encoding fails
pub fn gather_metrics() -> Result<String, String> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = vec![];

    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| format!("Failed to encode metrics: {}", e))?;

    String::from_utf8(buffer).map_err(|e| format!("Metrics contain invalid UTF-8: {}", e))
}

/// Record the outcome of a record call
#[inline]
pub fn record_event(set: bool, status: &str) {
    let value = if set { "set" } else { "clear" };
    EVENTS_RECORDED.with_label_values(&[value, status]).inc();
}

/// Record a partially applied batch
#[inline]
pub fn record_partial_write() {
    PARTIAL_WRITES.inc();
}

/// Record a newly allocated user offset
#[inline]
pub fn record_user_allocated() {
    USERS_ALLOCATED.inc();
}

/// Record an offset cache lookup
#[inline]
pub fn record_offset_cache(hit: bool) {
    let result = if hit { "hit" } else { "miss" };
    OFFSET_CACHE.with_label_values(&[result]).inc();
}

/// Record a query evaluation
#[inline]
pub fn record_query(operator: &str, duration_secs: f64, success: bool) {
    let status = if success { "success" } else { "error" };

    QUERIES_TOTAL.with_label_values(&[operator, status]).inc();

    QUERY_DURATION
        .with_label_values(&[operator])
        .observe(duration_secs);
}

/// Record a scratch key that could not be deleted
#[inline]
pub fn record_scratch_cleanup_failure() {
    SCRATCH_CLEANUP_FAILURES.inc();
}

/// Record scratch keys removed by scavenging
#[inline]
pub fn record_scratch_scavenged(count: usize) {
    SCRATCH_KEYS_SCAVENGED.inc_by(count as f64);
}

/// Record the store connection going up or down
#[inline]
pub fn record_store_connection(connected: bool) {
    STORE_CONNECTED.set(if connected { 1.0 } else { 0.0 });
}

/// Record an error
#[inline]
pub fn record_error(error_type: &str, operation: &str) {
    ERRORS_TOTAL.with_label_values(&[error_type, operation]).inc();
}
