// ==== Operator metrics ====
/// Counter for rows consumed by a stateful operator
pub const OPERATOR_INPUT_ROWS_COUNTER: &str = "operator_input_rows_total";

/// Counter for rows emitted by a stateful operator
pub const OPERATOR_OUTPUT_ROWS_COUNTER: &str = "operator_output_rows_total";

/// Counter for state entries inserted or updated
pub const OPERATOR_UPDATED_ROWS_COUNTER: &str = "operator_state_updated_rows_total";

/// Counter for state entries evicted by the watermark
pub const OPERATOR_REMOVED_ROWS_COUNTER: &str = "operator_state_removed_rows_total";

/// Counter for rows dropped because they were behind the watermark
pub const OPERATOR_DROPPED_BY_WATERMARK_COUNTER: &str = "operator_dropped_by_watermark_total";

/// Gauge for the number of state entries after the last committed batch
pub const OPERATOR_STATE_ROWS_GAUGE: &str = "operator_state_rows";

// ==== Pipeline metrics ====
/// Histogram for end-to-end batch processing duration
pub const BATCH_PROCESSING_DURATION_HISTOGRAM: &str = "batch_processing_duration_seconds";

/// Histogram for batch size (number of input rows per batch)
pub const BATCH_SIZE_HISTOGRAM: &str = "batch_size_rows";

/// Counter for batch attempts that were retried (label: reason)
pub const BATCH_RETRIES_COUNTER: &str = "batch_retries_total";

/// Counter for batches that exhausted their retries
pub const BATCH_FAILURES_COUNTER: &str = "batch_failures_total";

/// Counter for batches committed
pub const BATCHES_COMMITTED_COUNTER: &str = "batches_committed_total";

/// Gauge for the current event-time watermark in epoch millis
pub const WATERMARK_GAUGE: &str = "event_time_watermark_ms";

// ==== State store metrics ====
/// Histogram for time spent reconstructing a version from the durable medium
pub const STATE_LOAD_DURATION_HISTOGRAM: &str = "state_store_load_duration_seconds";

/// Counter for version loads served by the in-memory arena (label: source)
pub const STATE_LOAD_COUNTER: &str = "state_store_loads_total";

/// Histogram for time spent persisting a committed version
pub const STATE_COMMIT_DURATION_HISTOGRAM: &str = "state_store_commit_duration_seconds";

/// Histogram for compressed bytes written per state file (label: kind)
pub const STATE_FILE_BYTES_HISTOGRAM: &str = "state_store_file_bytes";

/// Counter for state files removed by maintenance
pub const STATE_MAINTENANCE_FILES_DELETED_COUNTER: &str = "state_store_maintenance_files_deleted_total";

/// Counter for maintenance runs that failed (non-fatal)
pub const STATE_MAINTENANCE_FAILURES_COUNTER: &str = "state_store_maintenance_failures_total";
