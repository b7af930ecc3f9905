use thiserror::Error;

use crate::store::{PartitionId, Version};

/// Errors surfaced by the versioned state store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A store operation was issued for a partition whose working copy was never loaded.
    /// Indicates the driver skipped `load` or is using the wrong version.
    #[error("state store {store_id} has no loaded working copy for partition {partition}")]
    NotInitialized {
        store_id: String,
        partition: PartitionId,
    },

    /// The durable medium rejected a read or a write.
    #[error("state store I/O failed for {store_id} partition {partition} at version {version}")]
    Io {
        store_id: String,
        partition: PartitionId,
        version: Version,
        #[source]
        source: anyhow::Error,
    },

    /// A version could not be reconstructed from the files on the durable medium.
    #[error("version {version} of state store {store_id} partition {partition} is not available")]
    VersionNotFound {
        store_id: String,
        partition: PartitionId,
        version: Version,
    },

    /// A commit was requested for a version other than the one following the loaded version.
    #[error("state store {store_id} partition {partition} loaded version {loaded}, cannot commit version {requested}")]
    VersionMismatch {
        store_id: String,
        partition: PartitionId,
        loaded: Version,
        requested: Version,
    },

    /// State bytes could not be encoded or decoded.
    #[error("state at {location} could not be encoded or decoded")]
    Codec {
        location: String,
        #[source]
        source: anyhow::Error,
    },
}

impl StoreError {
    /// Only failures of the durable medium are worth retrying; everything else
    /// is a sequencing or data defect that a retry would reproduce.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Io { .. })
    }
}

/// Errors surfaced by the pipeline driver and operator construction.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// A configured key field does not exist on the input schema.
    #[error("key field '{field}' does not exist in schema [{available}]")]
    KeyProjection { field: String, available: String },

    #[error("invalid pipeline configuration: {0}")]
    Config(String),

    #[error("row {row_index} of batch {batch_id} has {actual} values, schema has {expected} fields")]
    SchemaMismatch {
        batch_id: u64,
        row_index: usize,
        expected: usize,
        actual: usize,
    },

    #[error("batch {batch_id} is out of sequence, last committed batch is {last_committed}")]
    InvalidBatchSequence { batch_id: u64, last_committed: u64 },

    /// Recovery was requested for a batch that has no commit marker.
    #[error("batch {batch_id} was never committed")]
    NotCommitted { batch_id: u64 },

    #[error(transparent)]
    Store(#[from] StoreError),

    /// The batch could not be committed within the configured number of attempts.
    #[error("batch {batch_id} failed after {attempts} attempts")]
    BatchFailed {
        batch_id: u64,
        attempts: u32,
        #[source]
        source: StoreError,
    },
}

impl PipelineError {
    pub fn is_retryable(&self) -> bool {
        match self {
            PipelineError::Store(e) => e.is_retryable(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_io_errors_are_retryable() {
        let io = StoreError::Io {
            store_id: "0-deduplicate".to_string(),
            partition: 0,
            version: 3,
            source: anyhow::anyhow!("disk full"),
        };
        assert!(io.is_retryable());
        assert!(PipelineError::from(io).is_retryable());

        let not_loaded = StoreError::NotInitialized {
            store_id: "0-deduplicate".to_string(),
            partition: 1,
        };
        assert!(!not_loaded.is_retryable());

        let missing = StoreError::VersionNotFound {
            store_id: "0-deduplicate".to_string(),
            partition: 0,
            version: 7,
        };
        assert!(!PipelineError::from(missing).is_retryable());
    }

    #[test]
    fn test_io_error_keeps_cause_chain() {
        let err = StoreError::Io {
            store_id: "1-aggregate".to_string(),
            partition: 2,
            version: 9,
            source: anyhow::anyhow!("permission denied"),
        };
        let rendered = format!("{:#}", anyhow::Error::from(err));
        assert!(rendered.contains("1-aggregate"));
        assert!(rendered.contains("permission denied"));
    }
}
