//! Stateful operators executed by the pipeline driver.
//!
//! Each operator owns a [`StateStore`] and follows the same per-batch
//! protocol: `load` the previous version, `process_batch` synchronously
//! against the working copy, then `commit` or `abort`.

pub mod aggregate;
pub mod deduplicate;

use std::str::FromStr;

use anyhow::bail;
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, StoreError};
use crate::row::{Row, Schema};
use crate::store::{PartitionId, StateStore, Version};
use crate::watermark::WatermarkTracker;

pub use aggregate::{OutputMode, WindowAggregateConfig, WindowAggregateOperator};
pub use deduplicate::{DeduplicateConfig, DeduplicateOperator};

/// Per-batch row counts of one stateful operator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateOperatorMetrics {
    /// Store id of the operator, e.g. `0-deduplicate`
    pub operator: String,
    pub num_input_rows: u64,
    pub num_output_rows: u64,
    /// State entries after the batch
    pub total_rows: u64,
    /// State entries inserted or updated by the batch
    pub updated_rows: u64,
    /// State entries evicted by the watermark
    pub removed_rows: u64,
    pub dropped_by_watermark: u64,
}

impl StateOperatorMetrics {
    pub fn new(operator: &str) -> Self {
        Self {
            operator: operator.to_string(),
            ..Default::default()
        }
    }

    /// Add the counts of another partition of the same operator.
    pub fn merge(&mut self, other: &StateOperatorMetrics) {
        self.num_input_rows += other.num_input_rows;
        self.num_output_rows += other.num_output_rows;
        self.total_rows += other.total_rows;
        self.updated_rows += other.updated_rows;
        self.removed_rows += other.removed_rows;
        self.dropped_by_watermark += other.dropped_by_watermark;
    }
}

/// Result of one operator over one partition of a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct OperatorOutput {
    pub rows: Vec<Row>,
    pub metrics: StateOperatorMetrics,
}

/// What to do with rows whose event time is behind the watermark.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LateRowPolicy {
    /// Late rows are deduplicated like any other row
    #[default]
    Process,
    /// Late rows are discarded and counted in `dropped_by_watermark`
    Drop,
}

impl FromStr for LateRowPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "process" => Ok(LateRowPolicy::Process),
            "drop" => Ok(LateRowPolicy::Drop),
            other => bail!("unknown late row policy '{other}', expected process or drop"),
        }
    }
}

/// Declarative description of an operator, instantiated once per partition.
#[derive(Debug, Clone, PartialEq)]
pub enum OperatorSpec {
    Deduplicate(DeduplicateConfig),
    Aggregate(WindowAggregateConfig),
}

/// The closed set of stateful operators a pipeline can chain.
#[derive(Debug)]
pub enum StatefulOperator {
    Deduplicate(DeduplicateOperator),
    Aggregate(WindowAggregateOperator),
}

impl StatefulOperator {
    /// Store id of the operator at `index` of a chain.
    pub fn store_id(index: usize, spec: &OperatorSpec) -> String {
        match spec {
            OperatorSpec::Deduplicate(_) => format!("{index}-deduplicate"),
            OperatorSpec::Aggregate(_) => format!("{index}-aggregate"),
        }
    }

    /// Instantiate `spec` over `input_schema`. `event_time_field` names the
    /// event-time column shared by the chain, if any.
    pub fn from_spec(
        spec: &OperatorSpec,
        input_schema: &Schema,
        event_time_field: Option<&str>,
        store: StateStore,
    ) -> Result<Self, PipelineError> {
        Ok(match spec {
            OperatorSpec::Deduplicate(config) => StatefulOperator::Deduplicate(
                DeduplicateOperator::new(config, input_schema, event_time_field, store)?,
            ),
            OperatorSpec::Aggregate(config) => StatefulOperator::Aggregate(
                WindowAggregateOperator::new(config, input_schema, event_time_field, store)?,
            ),
        })
    }

    fn store(&self) -> &StateStore {
        match self {
            StatefulOperator::Deduplicate(op) => op.store(),
            StatefulOperator::Aggregate(op) => op.store(),
        }
    }

    fn store_mut(&mut self) -> &mut StateStore {
        match self {
            StatefulOperator::Deduplicate(op) => op.store_mut(),
            StatefulOperator::Aggregate(op) => op.store_mut(),
        }
    }

    pub fn name(&self) -> &str {
        self.store().store_id()
    }

    pub fn output_schema(&self) -> &Schema {
        match self {
            StatefulOperator::Deduplicate(op) => op.output_schema(),
            StatefulOperator::Aggregate(op) => op.output_schema(),
        }
    }

    /// Input fields whose values fully determine which state entry a row touches.
    pub fn key_field_names(&self) -> Vec<String> {
        match self {
            StatefulOperator::Deduplicate(op) => op.key_field_names(),
            StatefulOperator::Aggregate(op) => op.group_field_names(),
        }
    }

    pub async fn load(&mut self, partition: PartitionId, version: Version) -> Result<(), StoreError> {
        self.store_mut().load(partition, version).await
    }

    pub fn process_batch(
        &mut self,
        partition: PartitionId,
        rows: Vec<Row>,
        watermark: &WatermarkTracker,
    ) -> Result<OperatorOutput, StoreError> {
        match self {
            StatefulOperator::Deduplicate(op) => op.process_batch(partition, rows, watermark),
            StatefulOperator::Aggregate(op) => op.process_batch(partition, rows, watermark),
        }
    }

    pub async fn commit(&mut self, partition: PartitionId, version: Version) -> Result<Version, StoreError> {
        self.store_mut().commit(partition, version).await
    }

    pub fn abort(&mut self, partition: PartitionId) {
        self.store_mut().abort(partition);
    }

    /// Discard any working copy and load the committed `version`.
    pub async fn recover_from(&mut self, partition: PartitionId, version: Version) -> Result<(), StoreError> {
        self.abort(partition);
        self.load(partition, version).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_merge() {
        let mut a = StateOperatorMetrics {
            operator: "0-deduplicate".to_string(),
            num_input_rows: 3,
            num_output_rows: 2,
            total_rows: 4,
            updated_rows: 2,
            removed_rows: 1,
            dropped_by_watermark: 0,
        };
        let b = StateOperatorMetrics {
            operator: "0-deduplicate".to_string(),
            num_input_rows: 1,
            num_output_rows: 1,
            total_rows: 5,
            updated_rows: 1,
            removed_rows: 0,
            dropped_by_watermark: 2,
        };
        a.merge(&b);
        assert_eq!(a.total_rows, 9);
        assert_eq!(a.updated_rows, 3);
        assert_eq!(a.dropped_by_watermark, 2);
        assert_eq!(a.num_input_rows, 4);
    }

    #[test]
    fn test_late_row_policy_parse() {
        assert_eq!("Drop".parse::<LateRowPolicy>().unwrap(), LateRowPolicy::Drop);
        assert_eq!(" process ".parse::<LateRowPolicy>().unwrap(), LateRowPolicy::Process);
        assert!("ignore".parse::<LateRowPolicy>().is_err());
        assert_eq!(LateRowPolicy::default(), LateRowPolicy::Process);
    }

    #[test]
    fn test_store_ids_follow_chain_position() {
        let dedup = OperatorSpec::Deduplicate(DeduplicateConfig::default());
        let agg = OperatorSpec::Aggregate(WindowAggregateConfig::tumbling(5_000));
        assert_eq!(StatefulOperator::store_id(0, &dedup), "0-deduplicate");
        assert_eq!(StatefulOperator::store_id(1, &agg), "1-aggregate");
    }
}
