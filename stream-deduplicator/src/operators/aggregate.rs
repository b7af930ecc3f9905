use std::collections::BTreeSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{OperatorOutput, StateOperatorMetrics};
use crate::error::{PipelineError, StoreError};
use crate::keys::{decode_values, encode_values, KeyFields, KeyProjection};
use crate::row::{DataType, Field, Row, Schema, Value};
use crate::store::{PartitionId, StateStore};
use crate::watermark::WatermarkTracker;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OutputMode {
    /// Emit each window once, when the watermark passes its end
    #[default]
    Append,
    /// Emit every window updated by the batch
    Update,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowAggregateConfig {
    pub window: Duration,
    pub group_fields: Vec<String>,
    pub output_mode: OutputMode,
}

impl WindowAggregateConfig {
    pub fn tumbling(window_ms: u64) -> Self {
        Self {
            window: Duration::from_millis(window_ms),
            group_fields: Vec::new(),
            output_mode: OutputMode::Append,
        }
    }
}

/// Value stored per (group, window start) key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct WindowState {
    window_end: i64,
    count: i64,
}

/// Counts rows per tumbling event-time window and group.
#[derive(Debug)]
pub struct WindowAggregateOperator {
    input_schema: Schema,
    output_schema: Schema,
    group: KeyProjection,
    event_time_index: usize,
    window_ms: i64,
    output_mode: OutputMode,
    store: StateStore,
}

impl WindowAggregateOperator {
    pub fn new(
        config: &WindowAggregateConfig,
        schema: &Schema,
        event_time_field: Option<&str>,
        store: StateStore,
    ) -> Result<Self, PipelineError> {
        let event_time_field = event_time_field.ok_or_else(|| {
            PipelineError::Config("windowed aggregation requires an event-time field".to_string())
        })?;
        let event_time_index = schema.resolve(event_time_field)?;
        let window_ms = i64::try_from(config.window.as_millis()).unwrap_or(i64::MAX);
        if window_ms < 1 {
            return Err(PipelineError::Config(
                "aggregation window must be at least one millisecond".to_string(),
            ));
        }
        let group = KeyProjection::new(schema, &KeyFields::Named(config.group_fields.clone()))?;

        let mut fields = vec![
            Field::new("window_start", DataType::Timestamp),
            Field::new("window_end", DataType::Timestamp),
        ];
        fields.extend(group.ordinals().iter().map(|&i| schema.fields()[i].clone()));
        fields.push(Field::new("count", DataType::Int));

        Ok(Self {
            input_schema: schema.clone(),
            output_schema: Schema::new(fields),
            group,
            event_time_index,
            window_ms,
            output_mode: config.output_mode,
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
        &self.output_schema
    }

    pub fn group_field_names(&self) -> Vec<String> {
        self.group
            .ordinals()
            .iter()
            .map(|&i| self.input_schema.fields()[i].name.clone())
            .collect()
    }

    pub fn window_start(&self, event_time: i64) -> i64 {
        event_time.div_euclid(self.window_ms).saturating_mul(self.window_ms)
    }

    pub fn process_batch(
        &mut self,
        partition: PartitionId,
        rows: Vec<Row>,
        watermark: &WatermarkTracker,
    ) -> Result<OperatorOutput, StoreError> {
        let mut metrics = StateOperatorMetrics::new(self.store.store_id());
        metrics.num_input_rows = rows.len() as u64;
        let mut touched = BTreeSet::new();

        for row in &rows {
            let Some(event_time) = row.event_time(self.event_time_index) else {
                continue;
            };
            let window_start = self.window_start(event_time);
            let window_end = window_start.saturating_add(self.window_ms);
            if watermark.is_expired(window_end) {
                metrics.dropped_by_watermark += 1;
                continue;
            }

            let mut key_values = self.group.project(row);
            key_values.push(Value::Timestamp(window_start));
            let key = encode_values(&key_values).map_err(|source| StoreError::Codec {
                location: format!("{}/{partition}", self.store.store_id()),
                source,
            })?;

            let mut window = self
                .store
                .get_typed::<WindowState>(partition, &key)?
                .unwrap_or(WindowState {
                    window_end,
                    count: 0,
                });
            window.count += 1;
            self.store.put_typed(partition, key.clone(), &window)?;
            touched.insert(key);
        }
        metrics.updated_rows = touched.len() as u64;

        let mut emitted = Vec::new();
        let mut expired = Vec::new();
        for (key, window) in self.store.entries_typed::<WindowState>(partition)? {
            let is_expired = watermark.is_expired(window.window_end);
            let emit = match self.output_mode {
                OutputMode::Append => is_expired,
                OutputMode::Update => touched.contains(&key),
            };
            if emit {
                emitted.push((key.clone(), window));
            }
            if is_expired {
                expired.push(key);
            }
        }
        for key in &expired {
            self.store.remove(partition, key)?;
        }
        metrics.removed_rows = expired.len() as u64;

        let mut output = emitted
            .into_iter()
            .map(|(key, window)| self.output_row(partition, &key, window))
            .collect::<Result<Vec<_>, _>>()?;
        output.sort_by_key(|row| row.event_time(0));

        metrics.num_output_rows = output.len() as u64;
        metrics.total_rows = self.store.len(partition)? as u64;
        debug!(
            store_id = %self.store.store_id(),
            partition,
            watermark = ?watermark.current(),
            updated = metrics.updated_rows,
            emitted = metrics.num_output_rows,
            "Aggregated partition batch"
        );

        Ok(OperatorOutput {
            rows: output,
            metrics,
        })
    }

    fn output_row(
        &self,
        partition: PartitionId,
        key: &[u8],
        window: WindowState,
    ) -> Result<Row, StoreError> {
        let mut group_values = decode_values(key).map_err(|source| StoreError::Codec {
            location: format!("{}/{partition}", self.store.store_id()),
            source,
        })?;
        let window_start = group_values.pop().unwrap_or(Value::Null);

        let mut values = Vec::with_capacity(group_values.len() + 3);
        values.push(window_start);
        values.push(Value::Timestamp(window.window_end));
        values.extend(group_values);
        values.push(Value::Int(window.count));
        Ok(Row::new(values))
    }
}
