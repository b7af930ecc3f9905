use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use super::commit_log::CommitLog;
use super::driver::{BatchState, PartitionChain, Pipeline};
use super::partitioner::Partitioner;
use super::PipelineConfig;
use crate::error::{PipelineError, StoreError};
use crate::keys::{KeyFields, KeyProjection};
use crate::metrics::MetricsHelper;
use crate::operators::{
    DeduplicateConfig, OperatorSpec, StatefulOperator, WindowAggregateConfig,
};
use crate::row::Schema;
use crate::store::{
    InMemoryStateBackend, PartitionId, StateBackend, StateStore, StateStoreConfig,
    StateStoreProvider,
};
use crate::watermark::WatermarkTracker;

/// Assembles a [`Pipeline`] and recovers it from the latest committed batch.
#[derive(Debug)]
pub struct PipelineBuilder {
    schema: Schema,
    config: PipelineConfig,
    store_config: StateStoreConfig,
    backend: Option<Arc<dyn StateBackend>>,
    operators: Vec<OperatorSpec>,
}

impl PipelineBuilder {
    pub fn new(schema: Schema) -> Self {
        Self {
            schema,
            config: PipelineConfig::default(),
            store_config: StateStoreConfig::default(),
            backend: None,
            operators: Vec::new(),
        }
    }

    pub fn config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn store_config(mut self, store_config: StateStoreConfig) -> Self {
        self.store_config = store_config;
        self
    }

    /// Durable medium for state and commit markers, in-memory when unset
    pub fn backend(mut self, backend: Arc<dyn StateBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn event_time(mut self, field: &str, lateness: Option<Duration>) -> Self {
        self.config.event_time_field = Some(field.to_string());
        self.config.lateness = lateness;
        self
    }

    pub fn partitions<S: AsRef<str>>(mut self, num_partitions: PartitionId, fields: &[S]) -> Self {
        self.config.num_partitions = num_partitions;
        self.config.partition_fields = fields.iter().map(|f| f.as_ref().to_string()).collect();
        self
    }

    pub fn deduplicate(self, config: DeduplicateConfig) -> Self {
        self.operator(OperatorSpec::Deduplicate(config))
    }

    pub fn aggregate(self, config: WindowAggregateConfig) -> Self {
        self.operator(OperatorSpec::Aggregate(config))
    }

    pub fn operator(mut self, spec: OperatorSpec) -> Self {
        self.operators.push(spec);
        self
    }

    fn build_chain(
        &self,
        partition: PartitionId,
        provider: &Arc<StateStoreProvider>,
    ) -> Result<PartitionChain, PipelineError> {
        let event_time_field = self.config.event_time_field.as_deref();
        let mut input_schema = self.schema.clone();
        let mut operators = Vec::with_capacity(self.operators.len());
        for (index, spec) in self.operators.iter().enumerate() {
            let store = StateStore::new(StatefulOperator::store_id(index, spec), provider.clone());
            let operator = StatefulOperator::from_spec(spec, &input_schema, event_time_field, store)?;
            input_schema = operator.output_schema().clone();
            operators.push(operator);
        }
        Ok(PartitionChain {
            partition,
            operators,
        })
    }

    fn partitioner(&self, chain: &PartitionChain) -> Result<Partitioner, PipelineError> {
        if self.config.num_partitions == 1 {
            return Ok(Partitioner::single());
        }
        if self.config.partition_fields.is_empty() {
            return Err(PipelineError::Config(format!(
                "{} partitions require partition fields",
                self.config.num_partitions
            )));
        }
        let projection = KeyProjection::new(
            &self.schema,
            &KeyFields::Named(self.config.partition_fields.clone()),
        )?;

        for operator in &chain.operators {
            let key_fields = operator.key_field_names();
            if let Some(field) = self
                .config
                .partition_fields
                .iter()
                .find(|f| !key_fields.contains(f))
            {
                return Err(PipelineError::Config(format!(
                    "partition field '{field}' is not a key field of operator {}",
                    operator.name()
                )));
            }
        }
        Ok(Partitioner::hashed(self.config.num_partitions, projection))
    }

    pub async fn build(self) -> Result<Pipeline, PipelineError> {
        if self.operators.is_empty() {
            return Err(PipelineError::Config(
                "a pipeline needs at least one stateful operator".to_string(),
            ));
        }
        if self.config.num_partitions == 0 {
            return Err(PipelineError::Config(
                "the number of partitions must be at least 1".to_string(),
            ));
        }
        if self.store_config.min_versions_to_retain == 0 {
            return Err(PipelineError::Config(
                "at least one previous version must be retained to replay a batch".to_string(),
            ));
        }

        let event_time_index = self
            .config
            .event_time_field
            .as_deref()
            .map(|field| self.schema.resolve(field))
            .transpose()?;

        let backend: Arc<dyn StateBackend> = match &self.backend {
            Some(backend) => backend.clone(),
            None => Arc::new(InMemoryStateBackend::new()),
        };
        let provider = Arc::new(StateStoreProvider::new(
            backend.clone(),
            self.store_config.clone(),
        ));

        let chains = (0..self.config.num_partitions)
            .map(|partition| self.build_chain(partition, &provider))
            .collect::<Result<Vec<_>, _>>()?;
        let partitioner = match chains.first() {
            Some(chain) => self.partitioner(chain)?,
            None => Partitioner::single(),
        };

        let commit_log = CommitLog::new(backend);
        let latest = commit_log
            .latest()
            .await
            .map_err(|source| {
                PipelineError::Store(StoreError::Io {
                    store_id: "commits".to_string(),
                    partition: 0,
                    version: 0,
                    source,
                })
            })?
            .map(|entry| entry.batch_id);

        let mut pipeline = Pipeline {
            watermark: WatermarkTracker::new(self.config.lateness),
            schema: self.schema,
            config: self.config,
            provider,
            commit_log,
            partitioner,
            chains,
            event_time_index,
            last_committed: 0,
            state: BatchState::Idle,
            metrics: MetricsHelper::new().with_label("service", "stream-deduplicator"),
        };

        if let Some(batch_id) = latest {
            pipeline.recover_from(batch_id).await?;
        }
        info!(
            operators = ?pipeline.operator_names(),
            partitions = pipeline.num_partitions(),
            last_committed = pipeline.last_committed(),
            "Built pipeline"
        );
        Ok(pipeline)
    }
}
