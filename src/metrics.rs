use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, HistogramVec,
    IntCounter, IntCounterVec,
};

lazy_static::lazy_static! {
    pub static ref RUNS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "index_builder_runs_total", "Pipeline runs", &["status"]
    ).unwrap();
    pub static ref STAGE_DURATION: HistogramVec = register_histogram_vec!(
        "index_builder_stage_duration_seconds", "Pipeline stage duration", &["stage"],
        vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0, 900.0, 3600.0]
    ).unwrap();
    pub static ref BLOB_BYTES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "index_builder_blob_bytes_total", "Bytes moved to or from the object store", &["direction"]
    ).unwrap();
    pub static ref NATIVE_HANDLES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "index_builder_native_handles_total", "Native index handle lifecycle events", &["event"]
    ).unwrap();
    pub static ref CLEANUP_WARNINGS_TOTAL: IntCounter = register_int_counter!(
        "index_builder_cleanup_warnings_total", "Native structures that failed to release"
    ).unwrap();
}

pub fn init() {
    lazy_static::initialize(&RUNS_TOTAL);
    lazy_static::initialize(&STAGE_DURATION);
    lazy_static::initialize(&BLOB_BYTES_TOTAL);
    lazy_static::initialize(&NATIVE_HANDLES_TOTAL);
    lazy_static::initialize(&CLEANUP_WARNINGS_TOTAL);
}

/// Render the default registry in the Prometheus text format.
pub fn gather_text() -> String {
    use prometheus::Encoder;

    let encoder = prometheus::TextEncoder::new();
    let mut buffer = Vec::new();
    if encoder.encode(&prometheus::gather(), &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
