//! Metrics module
//!
//! Prometheus metrics for the upload protocol.

pub mod server;

use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_histogram, Counter, CounterVec, Histogram,
};

lazy_static! {
    // Creation metrics
    pub static ref UPLOADS_CREATED: CounterVec = register_counter_vec!(
        "tus_uploads_created_total",
        "Total number of upload resources created",
        &["kind"]  // "sized", "deferred", "partial" or "final"
    ).unwrap();

    pub static ref UPLOADS_COMPLETED: Counter = register_counter!(
        "tus_uploads_completed_total",
        "Uploads whose offset reached their length"
    ).unwrap();

    // Chunk metrics
    pub static ref CHUNKS_TOTAL: CounterVec = register_counter_vec!(
        "tus_chunks_total",
        "PATCH requests by outcome",
        &["status"]
    ).unwrap();

    pub static ref BYTES_RECEIVED: Counter = register_counter!(
        "tus_bytes_received_total",
        "Total bytes persisted from PATCH requests"
    ).unwrap();

    pub static ref CHUNK_DURATION: Histogram = register_histogram!(
        "tus_chunk_duration_seconds",
        "Time to apply a chunk under the upload lock",
        vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]
    ).unwrap();

    // Concatenation metrics
    pub static ref CONCAT_MERGES: CounterVec = register_counter_vec!(
        "tus_concat_merges_total",
        "Final upload merges",
        &["status"]
    ).unwrap();

    // Error metrics
    pub static ref ERRORS_TOTAL: CounterVec = register_counter_vec!(
        "tus_errors_total",
        "Total rejected or failed requests",
        &["type"]
    ).unwrap();
}

/// Record a newly created upload
pub fn record_upload_created(kind: &str) {
    UPLOADS_CREATED.with_label_values(&[kind]).inc();
}

/// Record an upload reaching its full length
pub fn record_upload_completed() {
    UPLOADS_COMPLETED.inc();
}

/// Record a successfully applied chunk
pub fn record_chunk_success(bytes: u64, duration_secs: f64) {
    CHUNKS_TOTAL.with_label_values(&["success"]).inc();
    BYTES_RECEIVED.inc_by(bytes as f64);
    CHUNK_DURATION.observe(duration_secs);
}

/// Record a rejected or failed chunk
pub fn record_chunk_failure() {
    CHUNKS_TOTAL.with_label_values(&["failure"]).inc();
}

/// Record a final upload merge
pub fn record_concat_merge(success: bool) {
    let status = if success { "success" } else { "failure" };
    CONCAT_MERGES.with_label_values(&[status]).inc();
}

/// Record an error
pub fn record_error(error_type: &str) {
    ERRORS_TOTAL.with_label_values(&[error_type]).inc();
}
