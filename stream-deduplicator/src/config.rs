use std::{path::PathBuf, time::Duration};

use anyhow::{Context, Result};
use envconfig::Envconfig;

use crate::keys::KeyFields;
use crate::operators::{DeduplicateConfig, LateRowPolicy};
use crate::pipeline::PipelineConfig;
use crate::row::Schema;
use crate::store::StateStoreConfig;

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    // Input and state locations
    #[envconfig(default = "./state")]
    pub state_dir: String,

    #[envconfig(default = "./batches")]
    pub input_dir: String,

    // Row layout, `name:type` pairs separated by commas
    pub schema: String,

    // Deduplication key, `*` for the full row
    #[envconfig(default = "*")]
    pub key_fields: String,

    pub event_time_field: Option<String>,

    // Unset disables the watermark and time-based eviction
    pub lateness_ms: Option<u64>,

    #[envconfig(default = "1")]
    pub eviction_granularity_ms: u64,

    #[envconfig(default = "process")]
    pub late_row_policy: String,

    // Partitioning
    #[envconfig(default = "1")]
    pub num_partitions: u32,

    #[envconfig(default = "")]
    pub partition_fields: String,

    // State store
    #[envconfig(default = "10")]
    pub snapshot_interval: u64,

    #[envconfig(default = "100")]
    pub min_versions_to_retain: u64,

    #[envconfig(default = "2")]
    pub max_versions_in_memory: usize,

    // Batch retries
    #[envconfig(default = "3")]
    pub max_batch_retries: u32,

    #[envconfig(default = "100")]
    pub retry_backoff_ms: u64,

    // Prometheus exporter, disabled when unset
    pub metrics_bind: Option<String>,
}

impl Config {
    pub fn init_with_defaults() -> Result<Self, envconfig::Error> {
        Config::init_from_env()
    }

    pub fn state_dir_buf(&self) -> PathBuf {
        PathBuf::from(&self.state_dir)
    }

    pub fn input_dir_buf(&self) -> PathBuf {
        PathBuf::from(&self.input_dir)
    }

    pub fn lateness(&self) -> Option<Duration> {
        self.lateness_ms.map(Duration::from_millis)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn schema(&self) -> Result<Schema> {
        Schema::parse(&self.schema).with_context(|| format!("Invalid SCHEMA '{}'", self.schema))
    }

    fn partition_field_list(&self) -> Vec<String> {
        self.partition_fields
            .split(',')
            .map(str::trim)
            .filter(|f| !f.is_empty())
            .map(str::to_string)
            .collect()
    }

    pub fn to_pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            event_time_field: self.event_time_field.clone(),
            lateness: self.lateness(),
            num_partitions: self.num_partitions,
            partition_fields: self.partition_field_list(),
            max_batch_retries: self.max_batch_retries,
            retry_backoff: self.retry_backoff(),
        }
    }

    pub fn to_store_config(&self) -> StateStoreConfig {
        StateStoreConfig {
            snapshot_interval: self.snapshot_interval,
            min_versions_to_retain: self.min_versions_to_retain,
            max_versions_in_memory: self.max_versions_in_memory,
        }
    }

    pub fn to_deduplicate_config(&self) -> Result<DeduplicateConfig> {
        let key_fields = match self.key_fields.parse::<KeyFields>() {
            Ok(fields) => fields,
            Err(never) => match never {},
        };
        let late_rows = self
            .late_row_policy
            .parse::<LateRowPolicy>()
            .context("Invalid LATE_ROW_POLICY")?;
        Ok(DeduplicateConfig {
            key_fields,
            eviction_granularity: Duration::from_millis(self.eviction_granularity_ms),
            late_rows,
        })
    }
}
