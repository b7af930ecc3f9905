//! Stateful streaming deduplication.
//!
//! A [`Pipeline`](pipeline::Pipeline) runs a chain of stateful operators
//! (deduplication, windowed aggregation) over numbered micro-batches. Operator
//! state lives in a versioned, partitioned [`StateStore`](store::StateStore);
//! every batch commits one new version per operator partition plus a commit
//! marker, so a restarted pipeline resumes from the last committed batch with
//! no duplicated or lost output. A shared event-time
//! [`WatermarkTracker`](watermark::WatermarkTracker) bounds how long
//! deduplication state is kept.
//!
//! ## Error logging (anyhow)
//!
//! When logging `anyhow::Error` or other error types with a cause chain, use
//! formats that include the full chain so root causes are visible in logs:
//!
//! - **Inline format:** `{e:#}`, the full chain on one line (`outer: middle: root cause`).
//! - **Structured field:** `error = ?e`, the full chain with `Caused by:` sections (Debug).
//!
//! Avoid `{}` / `%e` (Display) for errors, they only show the top-level message.
//!
//! When constructing errors, use `.context()` / `.with_context()` so the original error remains
//! the source. Avoid `anyhow!("...{e}")`, which formats the error into a string and drops the chain.

pub mod config;
pub mod error;
pub mod keys;
pub mod metrics;
pub mod metrics_const;
pub mod operators;
pub mod pipeline;
pub mod row;
pub mod store;
pub mod watermark;

// Re-export commonly used types for convenience
pub use error::{PipelineError, StoreError};
pub use keys::KeyFields;
pub use operators::{
    DeduplicateConfig, LateRowPolicy, OutputMode, StateOperatorMetrics, WindowAggregateConfig,
};
pub use pipeline::{BatchOutput, BatchState, Pipeline, PipelineBuilder, PipelineConfig};
pub use row::{DataType, Field, Row, Schema, Value};
pub use watermark::WatermarkTracker;
