use std::sync::Arc;
use std::time::Instant;

use futures::future::try_join_all;
use tracing::{error, info, warn};

use super::commit_log::{CommitEntry, CommitLog};
use super::partitioner::Partitioner;
use super::PipelineConfig;
use crate::error::{PipelineError, StoreError};
use crate::metrics::MetricsHelper;
use crate::metrics_const::{
    BATCHES_COMMITTED_COUNTER, BATCH_FAILURES_COUNTER, BATCH_PROCESSING_DURATION_HISTOGRAM,
    BATCH_RETRIES_COUNTER, BATCH_SIZE_HISTOGRAM, OPERATOR_DROPPED_BY_WATERMARK_COUNTER,
    OPERATOR_INPUT_ROWS_COUNTER, OPERATOR_OUTPUT_ROWS_COUNTER, OPERATOR_REMOVED_ROWS_COUNTER,
    OPERATOR_STATE_ROWS_GAUGE, OPERATOR_UPDATED_ROWS_COUNTER, WATERMARK_GAUGE,
};
use crate::operators::{StateOperatorMetrics, StatefulOperator};
use crate::row::{Row, Schema};
use crate::store::provider::log_maintenance_failure;
use crate::store::{PartitionId, StateStoreProvider, Version};
use crate::watermark::WatermarkTracker;

/// Lifecycle of the batch currently owned by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchState {
    Idle,
    Loading,
    Processing,
    Committing,
    /// The last batch exhausted its attempts; only that batch may be retried
    Failed,
}

/// Committed result of one batch.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchOutput {
    pub batch_id: u64,
    pub rows: Vec<Row>,
    /// One entry per operator in chain order, summed over partitions
    pub operator_metrics: Vec<StateOperatorMetrics>,
    /// Watermark after the batch
    pub watermark: Option<i64>,
}

/// The operator chain of one partition.
#[derive(Debug)]
pub(super) struct PartitionChain {
    pub(super) partition: PartitionId,
    pub(super) operators: Vec<StatefulOperator>,
}

impl PartitionChain {
    async fn load(&mut self, version: Version) -> Result<(), StoreError> {
        let partition = self.partition;
        for operator in &mut self.operators {
            operator.load(partition, version).await?;
        }
        Ok(())
    }

    async fn recover_from(&mut self, version: Version) -> Result<(), StoreError> {
        let partition = self.partition;
        for operator in &mut self.operators {
            operator.recover_from(partition, version).await?;
        }
        Ok(())
    }

    /// Run the chain synchronously, feeding each operator's output to the next.
    fn process(
        &mut self,
        rows: Vec<Row>,
        watermark: &WatermarkTracker,
    ) -> Result<(Vec<Row>, Vec<StateOperatorMetrics>), StoreError> {
        let mut rows = rows;
        let mut metrics = Vec::with_capacity(self.operators.len());
        for operator in &mut self.operators {
            let output = operator.process_batch(self.partition, rows, watermark)?;
            rows = output.rows;
            metrics.push(output.metrics);
        }
        Ok((rows, metrics))
    }

    async fn commit(&mut self, version: Version) -> Result<(), StoreError> {
        let partition = self.partition;
        for operator in &mut self.operators {
            operator.commit(partition, version).await?;
        }
        Ok(())
    }

    fn abort(&mut self) {
        let partition = self.partition;
        for operator in &mut self.operators {
            operator.abort(partition);
        }
    }
}

fn commit_log_error(batch_id: u64) -> impl FnOnce(anyhow::Error) -> PipelineError {
    move |source| {
        PipelineError::Store(StoreError::Io {
            store_id: "commits".to_string(),
            partition: 0,
            version: batch_id,
            source,
        })
    }
}

/// Drives a chain of stateful operators one micro-batch at a time.
///
/// Every batch runs against the watermark produced by the batches before it,
/// and only becomes visible once every operator version and the batch's
/// commit marker are durable. Build one with
/// [`PipelineBuilder`](super::PipelineBuilder).
#[derive(Debug)]
pub struct Pipeline {
    pub(super) schema: Schema,
    pub(super) config: PipelineConfig,
    pub(super) provider: Arc<StateStoreProvider>,
    pub(super) commit_log: CommitLog,
    pub(super) partitioner: Partitioner,
    pub(super) chains: Vec<PartitionChain>,
    pub(super) event_time_index: Option<usize>,
    pub(super) watermark: WatermarkTracker,
    pub(super) last_committed: u64,
    pub(super) state: BatchState,
    pub(super) metrics: MetricsHelper,
}

impl Pipeline {
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Schema of the rows emitted by the last operator
    pub fn output_schema(&self) -> &Schema {
        self.chains
            .first()
            .and_then(|chain| chain.operators.last())
            .map(StatefulOperator::output_schema)
            .unwrap_or(&self.schema)
    }

    pub fn operator_names(&self) -> Vec<String> {
        self.chains
            .first()
            .map(|chain| {
                chain
                    .operators
                    .iter()
                    .map(|op| op.name().to_string())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn last_committed(&self) -> u64 {
        self.last_committed
    }

    pub fn watermark(&self) -> Option<i64> {
        self.watermark.current()
    }

    pub fn state(&self) -> BatchState {
        self.state
    }

    pub fn num_partitions(&self) -> PartitionId {
        self.partitioner.num_partitions()
    }

    pub fn commit_log(&self) -> &CommitLog {
        &self.commit_log
    }

    /// Reset every operator and the watermark to what batch `version` committed.
    /// Version 0 is the empty pipeline.
    pub async fn recover_from(&mut self, version: Version) -> Result<(), PipelineError> {
        let watermark = if version == 0 {
            None
        } else {
            self.commit_log
                .read(version)
                .await
                .map_err(commit_log_error(version))?
                .ok_or(PipelineError::NotCommitted { batch_id: version })?
                .watermark
        };

        self.state = BatchState::Loading;
        let loaded = try_join_all(self.chains.iter_mut().map(|chain| chain.recover_from(version))).await;
        if let Err(e) = loaded {
            self.abort_all();
            self.state = BatchState::Failed;
            return Err(e.into());
        }

        self.watermark = WatermarkTracker::restored(self.config.lateness, watermark);
        self.last_committed = version;
        self.state = BatchState::Idle;
        info!(
            version,
            watermark = ?watermark,
            partitions = self.chains.len(),
            "Recovered pipeline state"
        );
        Ok(())
    }

    /// Process and commit batch `batch_id`.
    ///
    /// Accepts the batch after the last committed one, or the last committed
    /// batch again, which is reprocessed from the version before it.
    pub async fn process_batch(
        &mut self,
        batch_id: u64,
        rows: Vec<Row>,
    ) -> Result<BatchOutput, PipelineError> {
        let redelivered = batch_id == self.last_committed && batch_id >= 1;
        if !redelivered && batch_id != self.last_committed + 1 {
            return Err(PipelineError::InvalidBatchSequence {
                batch_id,
                last_committed: self.last_committed,
            });
        }

        // Rejected rows must leave the committed state untouched
        let expected = self.schema.len();
        if let Some((row_index, row)) = rows.iter().enumerate().find(|(_, r)| r.len() != expected) {
            return Err(PipelineError::SchemaMismatch {
                batch_id,
                row_index,
                expected,
                actual: row.len(),
            });
        }

        let start = Instant::now();
        let input_rows = rows.len();
        let partitioned = self.partitioner.split(rows).map_err(|source| StoreError::Codec {
            location: format!("partitioner/batch {batch_id}"),
            source,
        })?;

        if redelivered {
            info!(batch_id, "Re-delivered batch, reprocessing from the previous version");
            self.recover_from(batch_id - 1).await?;
        }

        // Late rows are judged against the watermark the batch runs with
        let batch_max = self.watermark.batch_max_event_time(
            partitioned
                .iter()
                .flatten()
                .map(|row| self.event_time_index.and_then(|i| row.event_time(i))),
        );

        let mut attempt: u32 = 0;
        loop {
            match self.run_attempt(batch_id, &partitioned, batch_max).await {
                Ok(output) => {
                    self.metrics
                        .histogram(BATCH_PROCESSING_DURATION_HISTOGRAM)
                        .record(start.elapsed().as_secs_f64());
                    self.metrics
                        .histogram(BATCH_SIZE_HISTOGRAM)
                        .record(input_rows as f64);
                    self.run_maintenance(batch_id).await;
                    return Ok(output);
                }
                Err(PipelineError::Store(e)) if e.is_retryable() => {
                    self.abort_all();
                    if attempt >= self.config.max_batch_retries {
                        self.state = BatchState::Failed;
                        self.metrics.counter(BATCH_FAILURES_COUNTER).increment(1);
                        error!(
                            batch_id,
                            attempts = attempt + 1,
                            error = ?e,
                            "Batch failed after exhausting retries"
                        );
                        return Err(PipelineError::BatchFailed {
                            batch_id,
                            attempts: attempt + 1,
                            source: e,
                        });
                    }
                    attempt += 1;
                    self.metrics
                        .counter(BATCH_RETRIES_COUNTER)
                        .with_label("reason", "store_io")
                        .increment(1);
                    warn!(
                        batch_id,
                        attempt,
                        error = ?e,
                        "Batch attempt failed, retrying from the previous version"
                    );
                    tokio::time::sleep(self.config.retry_backoff * attempt).await;
                }
                Err(e) => {
                    self.abort_all();
                    self.state = BatchState::Failed;
                    self.metrics.counter(BATCH_FAILURES_COUNTER).increment(1);
                    error!(batch_id, error = ?e, "Batch failed");
                    return Err(e);
                }
            }
        }
    }

    async fn run_attempt(
        &mut self,
        batch_id: u64,
        partitioned: &[Vec<Row>],
        batch_max: Option<i64>,
    ) -> Result<BatchOutput, PipelineError> {
        let previous = batch_id - 1;

        self.state = BatchState::Loading;
        try_join_all(self.chains.iter_mut().map(|chain| chain.load(previous))).await?;

        self.state = BatchState::Processing;
        let mut rows = Vec::new();
        let mut operator_metrics: Vec<StateOperatorMetrics> = Vec::new();
        for (chain, input) in self.chains.iter_mut().zip(partitioned) {
            let (output, metrics) = chain.process(input.clone(), &self.watermark)?;
            rows.extend(output);
            if operator_metrics.is_empty() {
                operator_metrics = metrics;
            } else {
                for (total, partial) in operator_metrics.iter_mut().zip(&metrics) {
                    total.merge(partial);
                }
            }
        }

        self.state = BatchState::Committing;
        try_join_all(self.chains.iter_mut().map(|chain| chain.commit(batch_id))).await?;

        let mut watermark = self.watermark.clone();
        watermark.advance(batch_max);
        let entry = CommitEntry::new(batch_id, watermark.current(), operator_metrics.clone());
        self.commit_log
            .write(&entry)
            .await
            .map_err(commit_log_error(batch_id))?;

        self.watermark = watermark;
        self.last_committed = batch_id;
        self.state = BatchState::Idle;
        self.record_committed(&operator_metrics);
        info!(
            batch_id,
            rows = rows.len(),
            watermark = ?self.watermark.current(),
            "Committed batch"
        );

        Ok(BatchOutput {
            batch_id,
            rows,
            operator_metrics,
            watermark: self.watermark.current(),
        })
    }

    fn abort_all(&mut self) {
        for chain in &mut self.chains {
            chain.abort();
        }
    }

    fn record_committed(&self, operator_metrics: &[StateOperatorMetrics]) {
        self.metrics.counter(BATCHES_COMMITTED_COUNTER).increment(1);
        if let Some(w) = self.watermark.current() {
            self.metrics.gauge(WATERMARK_GAUGE).set(w as f64);
        }
        for m in operator_metrics {
            let operator = self.metrics.clone().with_label("operator", &m.operator);
            operator.counter(OPERATOR_INPUT_ROWS_COUNTER).increment(m.num_input_rows);
            operator.counter(OPERATOR_OUTPUT_ROWS_COUNTER).increment(m.num_output_rows);
            operator.counter(OPERATOR_UPDATED_ROWS_COUNTER).increment(m.updated_rows);
            operator.counter(OPERATOR_REMOVED_ROWS_COUNTER).increment(m.removed_rows);
            operator
                .counter(OPERATOR_DROPPED_BY_WATERMARK_COUNTER)
                .increment(m.dropped_by_watermark);
            operator.gauge(OPERATOR_STATE_ROWS_GAUGE).set(m.total_rows as f64);
        }
    }

    /// Best effort cleanup of files no retained version needs.
    async fn run_maintenance(&self, latest: Version) {
        for chain in &self.chains {
            for operator in &chain.operators {
                if let Err(e) = self
                    .provider
                    .do_maintenance(operator.name(), chain.partition, latest)
                    .await
                {
                    log_maintenance_failure(operator.name(), chain.partition, &e);
                }
            }
        }

        let retain = self.provider.config().min_versions_to_retain;
        if let Some(earliest) = latest.checked_sub(retain) {
            if let Err(e) = self.commit_log.prune_before(earliest).await {
                warn!(error = ?e, earliest, "Failed to prune commit markers");
            }
        }
    }
}
