//! Shared helpers for the pipeline integration tests.
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;

use stream_deduplicator::store::{InMemoryStateBackend, StateBackend, StateStoreConfig};
use stream_deduplicator::{
    BatchOutput, DataType, DeduplicateConfig, Field, KeyFields, Pipeline, PipelineBuilder,
    PipelineConfig, Row, Schema, Value, WindowAggregateConfig,
};

/// `value: int, eventTime: timestamp`, the layout used by the event-time scenarios
pub fn event_schema() -> Schema {
    Schema::new(vec![
        Field::new("value", DataType::Int),
        Field::new("eventTime", DataType::Timestamp),
    ])
}

/// An event whose value is its event time in seconds
pub fn event(secs: i64) -> Row {
    Row::new(vec![Value::Int(secs), Value::Timestamp(secs * 1_000)])
}

pub fn events(secs: &[i64]) -> Vec<Row> {
    secs.iter().map(|&s| event(s)).collect()
}

/// Every second of `from..=to`, each repeated `times` times
pub fn repeated_events(from: i64, to: i64, times: usize) -> Vec<Row> {
    (0..times).flat_map(|_| (from..=to).map(event)).collect()
}

pub fn letter_schema() -> Schema {
    Schema::new(vec![Field::new("value", DataType::Str)])
}

pub fn letters(values: &[&str]) -> Vec<Row> {
    values
        .iter()
        .map(|v| Row::new(vec![Value::from(*v)]))
        .collect()
}

pub fn fast_retries(max_batch_retries: u32) -> PipelineConfig {
    PipelineConfig {
        max_batch_retries,
        retry_backoff: Duration::from_millis(1),
        ..PipelineConfig::default()
    }
}

/// Full-row deduplication with a 10 second watermark on `eventTime`
pub fn event_dedup_builder(backend: Arc<dyn StateBackend>) -> PipelineBuilder {
    PipelineBuilder::new(event_schema())
        .config(fast_retries(3))
        .event_time("eventTime", Some(Duration::from_secs(10)))
        .backend(backend)
        .deduplicate(DeduplicateConfig::default())
}

pub async fn event_dedup_pipeline(backend: Arc<dyn StateBackend>) -> Pipeline {
    event_dedup_builder(backend).build().await.unwrap()
}

/// Deduplication followed by a 5 second tumbling count in append mode
pub async fn dedup_then_count_pipeline(backend: Arc<dyn StateBackend>) -> Pipeline {
    event_dedup_builder(backend)
        .aggregate(WindowAggregateConfig::tumbling(5_000))
        .build()
        .await
        .unwrap()
}

pub async fn letter_pipeline(backend: Arc<dyn StateBackend>) -> Pipeline {
    PipelineBuilder::new(letter_schema())
        .config(fast_retries(3))
        .backend(backend)
        .deduplicate(DeduplicateConfig::on(KeyFields::All))
        .build()
        .await
        .unwrap()
}

pub fn in_memory() -> Arc<InMemoryStateBackend> {
    Arc::new(InMemoryStateBackend::new())
}

pub fn small_store_config(snapshot_interval: u64, min_versions_to_retain: u64) -> StateStoreConfig {
    StateStoreConfig {
        snapshot_interval,
        min_versions_to_retain,
        max_versions_in_memory: 2,
    }
}

/// `(total_rows, updated_rows)` per operator
pub fn state_counts(output: &BatchOutput) -> Vec<(u64, u64)> {
    output
        .operator_metrics
        .iter()
        .map(|m| (m.total_rows, m.updated_rows))
        .collect()
}

/// Window rows as `(window start secs, count)`
pub fn windows(output: &BatchOutput) -> Vec<(i64, i64)> {
    output
        .rows
        .iter()
        .map(|row| match (row.get(0), row.get(2)) {
            (Some(Value::Timestamp(start)), Some(Value::Int(count))) => (start / 1_000, *count),
            other => panic!("unexpected window row {other:?}"),
        })
        .collect()
}

/// Feed `batches` as ids `first..` and collect the outputs
pub async fn run_batches(pipeline: &mut Pipeline, first: u64, batches: Vec<Vec<Row>>) -> Vec<BatchOutput> {
    let mut outputs = Vec::new();
    for (offset, rows) in batches.into_iter().enumerate() {
        let batch_id = first + offset as u64;
        outputs.push(pipeline.process_batch(batch_id, rows).await.unwrap());
    }
    outputs
}

/// Backend whose commit marker writes can be made to fail, leaving operator
/// state files written without the marker that commits them.
#[derive(Debug, Default)]
pub struct FlakyCommitBackend {
    inner: InMemoryStateBackend,
    failing_commits: AtomicUsize,
}

impl FlakyCommitBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_commits(&self, count: usize) {
        self.failing_commits.store(count, Ordering::SeqCst);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.contains(key)
    }
}

#[async_trait]
impl StateBackend for FlakyCommitBackend {
    async fn put_object(&self, key: &str, bytes: Vec<u8>) -> Result<()> {
        if key.starts_with("commits/")
            && self
                .failing_commits
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        {
            bail!("simulated crash before writing {key}");
        }
        self.inner.put_object(key, bytes).await
    }

    async fn get_object(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.inner.get_object(key).await
    }

    async fn list_objects(&self, prefix: &str) -> Result<Vec<String>> {
        self.inner.list_objects(prefix).await
    }

    async fn delete_object(&self, key: &str) -> Result<()> {
        self.inner.delete_object(key).await
    }
}
