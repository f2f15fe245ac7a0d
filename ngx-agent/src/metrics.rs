//! Prometheus metrics for monitoring ngx-agent throughput and errors.
//!
//! All metrics use the default Prometheus registry and follow naming conventions:
//! - Histograms: *_seconds (for latency)
//! - Counters: *_total (for counts)

use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Histogram, IntCounter, IntCounterVec, IntGauge,
};

lazy_static! {
    // ==================== LATENCY METRICS ====================

    pub static ref WRITE_DURATION: Histogram = register_histogram!(
        "ngx_agent_write_duration_seconds",
        "Time spent in one bulk write attempt",
        vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    )
    .unwrap();

    // ==================== ERROR COUNTERS ====================
    pub static ref PARSE_ERRORS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "ngx_agent_parse_errors_total",
        "Lines that could not be parsed, by error kind",
        &["kind"]
    )
    .unwrap();

    // ==================== THROUGHPUT METRICS ====================
    pub static ref LINES_READ_TOTAL: IntCounter = register_int_counter!(
        "ngx_agent_lines_read_total",
        "Lines read from the followed log file"
    )
    .unwrap();
    pub static ref FILE_REOPENS_TOTAL: IntCounter = register_int_counter!(
        "ngx_agent_file_reopens_total",
        "Times the followed file was truncated or replaced and reopened"
    )
    .unwrap();
    pub static ref RECORDS_STORED_TOTAL: IntCounter = register_int_counter!(
        "ngx_agent_records_stored_total",
        "Records durably written to the sink"
    )
    .unwrap();
    pub static ref RECORDS_SKIPPED_TOTAL: IntCounter = register_int_counter!(
        "ngx_agent_records_skipped_total",
        "Records dropped because they are not newer than the high-water mark"
    )
    .unwrap();
    pub static ref BATCHES_WRITTEN_TOTAL: IntCounterVec = register_int_counter_vec!(
        "ngx_agent_batches_written_total",
        "Bulk write attempts by outcome",
        &["status"]
    )
    .unwrap();

    // ==================== GAUGE METRICS ====================
    pub static ref HIGH_WATER_MARK_SECONDS: IntGauge = register_int_gauge!(
        "ngx_agent_high_water_mark_seconds",
        "Unix time of the newest record known to be stored"
    )
    .unwrap();
    pub static ref BUFFERED_RECORDS: IntGauge = register_int_gauge!(
        "ngx_agent_buffered_records",
        "Records waiting in the batch accumulator"
    )
    .unwrap();
}

/// Encodes every registered metric in the Prometheus text exposition format.
pub fn encode_text() -> Result<(Vec<u8>, String), prometheus::Error> {
    use prometheus::Encoder;

    let encoder = prometheus::TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok((buffer, encoder.format_type().to_string()))
}
