use std::time::Duration;

use tracing::debug;

use super::{LateRowPolicy, OperatorOutput, StateOperatorMetrics};
use crate::error::{PipelineError, StoreError};
use crate::keys::{KeyFields, KeyProjection};
use crate::row::{Row, Schema};
use crate::store::{PartitionId, StateStore};
use crate::watermark::WatermarkTracker;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeduplicateConfig {
    pub key_fields: KeyFields,
    /// Width of the event-time buckets used for eviction
    pub eviction_granularity: Duration,
    pub late_rows: LateRowPolicy,
}

impl Default for DeduplicateConfig {
    fn default() -> Self {
        Self {
            key_fields: KeyFields::All,
            eviction_granularity: Duration::from_millis(1),
            late_rows: LateRowPolicy::Process,
        }
    }
}

impl DeduplicateConfig {
    pub fn on(key_fields: KeyFields) -> Self {
        Self {
            key_fields,
            ..Self::default()
        }
    }
}

/// Drops every row whose key was already seen, keeping one state entry per
/// key stamped with the event-time bucket of its first occurrence.
#[derive(Debug)]
pub struct DeduplicateOperator {
    schema: Schema,
    key: KeyProjection,
    event_time_index: Option<usize>,
    granularity_ms: i64,
    late_rows: LateRowPolicy,
    store: StateStore,
}

impl DeduplicateOperator {
    pub fn new(
        config: &DeduplicateConfig,
        schema: &Schema,
        event_time_field: Option<&str>,
        store: StateStore,
    ) -> Result<Self, PipelineError> {
        if matches!(&config.key_fields, KeyFields::Named(names) if names.is_empty()) {
            return Err(PipelineError::Config(
                "deduplication needs at least one key field".to_string(),
            ));
        }
        let key = KeyProjection::new(schema, &config.key_fields)?;
        let event_time_index = event_time_field.and_then(|name| schema.index_of(name));
        let granularity_ms = i64::try_from(config.eviction_granularity.as_millis()).unwrap_or(i64::MAX);
        if granularity_ms < 1 {
            return Err(PipelineError::Config(
                "eviction granularity must be at least one millisecond".to_string(),
            ));
        }

        Ok(Self {
            schema: schema.clone(),
            key,
            event_time_index,
            granularity_ms,
            late_rows: config.late_rows,
            store,
        })
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut StateStore {
        &mut self.store
    }

    pub fn output_schema(&self) -> &Schema {
        &self.schema
    }

    pub fn key_field_names(&self) -> Vec<String> {
        self.key
            .ordinals()
            .iter()
            .map(|&i| self.schema.fields()[i].name.clone())
            .collect()
    }

    /// State is only evicted by time when event time is part of the key;
    /// otherwise the same key could reappear with a newer event time.
    pub fn evicts_by_time(&self) -> bool {
        self.event_time_index
            .is_some_and(|index| self.key.contains(index))
    }

    /// Last instant of the granule `event_time` falls in.
    pub fn bucket_of(&self, event_time: i64) -> i64 {
        let g = self.granularity_ms;
        event_time
            .div_euclid(g)
            .saturating_mul(g)
            .saturating_add(g - 1)
    }

    pub fn process_batch(
        &mut self,
        partition: PartitionId,
        rows: Vec<Row>,
        watermark: &WatermarkTracker,
    ) -> Result<OperatorOutput, StoreError> {
        let mut metrics = StateOperatorMetrics::new(self.store.store_id());
        metrics.num_input_rows = rows.len() as u64;
        let mut output = Vec::new();

        for row in rows {
            let event_time = self.event_time_index.and_then(|i| row.event_time(i));
            if self.late_rows == LateRowPolicy::Drop
                && event_time.is_some_and(|t| watermark.is_late(t))
            {
                metrics.dropped_by_watermark += 1;
                continue;
            }

            let key = self.key.encode(&row).map_err(|source| StoreError::Codec {
                location: format!("{}/{partition}", self.store.store_id()),
                source,
            })?;
            if self.store.contains(partition, &key)? {
                continue;
            }

            let bucket = event_time.map(|t| self.bucket_of(t));
            self.store.put_typed(partition, key, &bucket)?;
            metrics.updated_rows += 1;
            output.push(row);
        }

        if self.evicts_by_time() && watermark.current().is_some() {
            metrics.removed_rows = self.evict_expired(partition, watermark)?;
        }

        metrics.num_output_rows = output.len() as u64;
        metrics.total_rows = self.store.len(partition)? as u64;
        debug!(
            store_id = %self.store.store_id(),
            partition,
            watermark = ?watermark.current(),
            input = metrics.num_input_rows,
            output = metrics.num_output_rows,
            removed = metrics.removed_rows,
            "Deduplicated partition batch"
        );

        Ok(OperatorOutput {
            rows: output,
            metrics,
        })
    }

    fn evict_expired(
        &mut self,
        partition: PartitionId,
        watermark: &WatermarkTracker,
    ) -> Result<u64, StoreError> {
        let expired = self
            .store
            .entries_typed::<Option<i64>>(partition)?
            .into_iter()
            .filter(|(_, bucket)| bucket.is_some_and(|b| watermark.is_expired(b)))
            .map(|(key, _)| key)
            .collect::<Vec<_>>();

        for key in &expired {
            self.store.remove(partition, key)?;
        }
        Ok(expired.len() as u64)
    }
}
