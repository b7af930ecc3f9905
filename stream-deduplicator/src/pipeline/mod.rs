pub mod builder;
pub mod commit_log;
pub mod driver;
pub mod partitioner;

use std::time::Duration;

pub use builder::PipelineBuilder;
pub use commit_log::{CommitEntry, CommitLog};
pub use driver::{BatchOutput, BatchState, Pipeline};
pub use partitioner::Partitioner;

use crate::store::PartitionId;

/// Driver settings shared by every operator of a pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Event-time column of the source rows
    pub event_time_field: Option<String>,
    /// Allowed lateness; `None` disables the watermark
    pub lateness: Option<Duration>,
    pub num_partitions: PartitionId,
    /// Fields rows are partitioned by, required with more than one partition
    pub partition_fields: Vec<String>,
    /// Retries of a batch after retryable store failures
    pub max_batch_retries: u32,
    /// Backoff before retry `n` is `retry_backoff * n`
    pub retry_backoff: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            event_time_field: None,
            lateness: None,
            num_partitions: 1,
            partition_fields: Vec::new(),
            max_batch_retries: 3,
            retry_backoff: Duration::from_millis(100),
        }
    }
}
