use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use tracing::{debug, info, warn};

use super::backend::StateBackend;
use super::files::{self, DeltaOp, StateFile, StateFileKind};
use super::{PartitionId, Version};
use crate::error::StoreError;
use crate::metrics::MetricsHelper;
use crate::metrics_const::{
    STATE_COMMIT_DURATION_HISTOGRAM, STATE_FILE_BYTES_HISTOGRAM, STATE_LOAD_COUNTER,
    STATE_LOAD_DURATION_HISTOGRAM, STATE_MAINTENANCE_FAILURES_COUNTER,
    STATE_MAINTENANCE_FILES_DELETED_COUNTER,
};

/// Materialized key/value content of one partition at one version.
pub type StateMap = BTreeMap<Vec<u8>, Vec<u8>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateStoreConfig {
    /// Write a full snapshot every this many versions
    pub snapshot_interval: u64,
    /// Maintenance keeps every version in `[latest - min_versions_to_retain, latest]` loadable
    pub min_versions_to_retain: u64,
    /// Materialized versions cached per store partition
    pub max_versions_in_memory: usize,
}

impl Default for StateStoreConfig {
    fn default() -> Self {
        Self {
            snapshot_interval: 10,
            min_versions_to_retain: 100,
            max_versions_in_memory: 2,
        }
    }
}

type ArenaKey = (String, PartitionId);

/// Shared owner of the durable medium and of the in-memory version arena.
///
/// Every operator [`StateStore`](super::StateStore) of a pipeline goes through
/// one provider. Committed versions are immutable, so materialized maps are
/// shared as `Arc`s and only cloned when a batch needs a working copy.
#[derive(Debug)]
pub struct StateStoreProvider {
    backend: Arc<dyn StateBackend>,
    config: StateStoreConfig,
    arena: DashMap<ArenaKey, BTreeMap<Version, Arc<StateMap>>>,
}

impl StateStoreProvider {
    pub fn new(backend: Arc<dyn StateBackend>, config: StateStoreConfig) -> Self {
        Self {
            backend,
            config,
            arena: DashMap::new(),
        }
    }

    pub fn backend(&self) -> &Arc<dyn StateBackend> {
        &self.backend
    }

    pub fn config(&self) -> &StateStoreConfig {
        &self.config
    }

    /// Versions currently materialized in memory for a store partition
    pub fn cached_versions(&self, store_id: &str, partition: PartitionId) -> Vec<Version> {
        self.arena
            .get(&(store_id.to_string(), partition))
            .map(|versions| versions.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Drop every cached version, forcing the next loads to hit the backend.
    pub fn clear_cache(&self) {
        self.arena.clear();
    }

    fn cached(
        &self,
        store_id: &str,
        partition: PartitionId,
        version: Version,
    ) -> Option<Arc<StateMap>> {
        self.arena
            .get(&(store_id.to_string(), partition))
            .and_then(|versions| versions.get(&version).cloned())
    }

    /// Newest cached version strictly between `after` and `before`
    fn cached_base(
        &self,
        store_id: &str,
        partition: PartitionId,
        after: Version,
        before: Version,
    ) -> Option<(Version, Arc<StateMap>)> {
        if after + 1 >= before {
            return None;
        }
        let versions = self.arena.get(&(store_id.to_string(), partition))?;
        versions
            .range(after + 1..before)
            .next_back()
            .map(|(v, map)| (*v, map.clone()))
    }

    fn remember(
        &self,
        store_id: &str,
        partition: PartitionId,
        version: Version,
        map: Arc<StateMap>,
    ) {
        let mut versions = self
            .arena
            .entry((store_id.to_string(), partition))
            .or_default();
        versions.insert(version, map);
        let limit = self.config.max_versions_in_memory.max(1);
        while versions.len() > limit {
            versions.pop_first();
        }
    }

    /// Materialize `version` of a store partition.
    pub async fn load_version(
        &self,
        store_id: &str,
        partition: PartitionId,
        version: Version,
    ) -> Result<Arc<StateMap>, StoreError> {
        if version == 0 {
            return Ok(Arc::new(StateMap::new()));
        }
        let metrics = MetricsHelper::with_store_partition(store_id, partition);
        if let Some(map) = self.cached(store_id, partition, version) {
            metrics
                .counter(STATE_LOAD_COUNTER)
                .with_label("source", "memory")
                .increment(1);
            return Ok(map);
        }

        let start = Instant::now();
        let io_error = |source: anyhow::Error| StoreError::Io {
            store_id: store_id.to_string(),
            partition,
            version,
            source,
        };

        let available = self
            .backend
            .list_objects(&files::partition_prefix(store_id, partition))
            .await
            .map_err(io_error)?
            .iter()
            .filter_map(|key| StateFile::parse(key))
            .collect::<Vec<_>>();

        let snapshot_version = available
            .iter()
            .filter(|f| f.kind == StateFileKind::Snapshot && f.version <= version)
            .map(|f| f.version)
            .max()
            .unwrap_or(0);

        let cached_base = self.cached_base(store_id, partition, snapshot_version, version);
        let (mut base_version, mut map) = match cached_base {
            Some((cached_version, cached)) => (cached_version, (*cached).clone()),
            None if snapshot_version > 0 => {
                let file = StateFile::snapshot(snapshot_version);
                let map = self
                    .read_file(store_id, partition, version, file, files::decode_snapshot)
                    .await?;
                (snapshot_version, map)
            }
            None => (0, StateMap::new()),
        };

        while base_version < version {
            base_version += 1;
            let file = StateFile::delta(base_version);
            let ops = self
                .read_file(store_id, partition, version, file, files::decode_delta)
                .await?;
            for op in ops {
                op.apply(&mut map);
            }
        }

        metrics
            .counter(STATE_LOAD_COUNTER)
            .with_label("source", "backend")
            .increment(1);
        metrics
            .histogram(STATE_LOAD_DURATION_HISTOGRAM)
            .record(start.elapsed().as_secs_f64());
        debug!(
            store_id,
            partition,
            version,
            snapshot_version,
            entries = map.len(),
            "Loaded state version from backend"
        );

        let map = Arc::new(map);
        self.remember(store_id, partition, version, map.clone());
        Ok(map)
    }

    async fn read_file<T>(
        &self,
        store_id: &str,
        partition: PartitionId,
        requested: Version,
        file: StateFile,
        decode: fn(&[u8]) -> anyhow::Result<T>,
    ) -> Result<T, StoreError> {
        let key = file.key(store_id, partition);
        let bytes = self
            .backend
            .get_object(&key)
            .await
            .map_err(|source| StoreError::Io {
                store_id: store_id.to_string(),
                partition,
                version: requested,
                source,
            })?
            .ok_or_else(|| StoreError::VersionNotFound {
                store_id: store_id.to_string(),
                partition,
                version: requested,
            })?;
        decode(&bytes).map_err(|source| StoreError::Codec {
            location: key,
            source,
        })
    }

    /// Durably write `version` of a store partition and cache its materialized map.
    pub async fn persist_version(
        &self,
        store_id: &str,
        partition: PartitionId,
        version: Version,
        ops: &[DeltaOp],
        map: StateMap,
    ) -> Result<(), StoreError> {
        let start = Instant::now();
        let metrics = MetricsHelper::with_store_partition(store_id, partition);

        let mut writes = vec![(
            StateFile::delta(version),
            files::encode_delta(ops).map_err(|source| StoreError::Codec {
                location: StateFile::delta(version).key(store_id, partition),
                source,
            })?,
        )];
        if self.config.snapshot_interval > 0 && version % self.config.snapshot_interval == 0 {
            writes.push((
                StateFile::snapshot(version),
                files::encode_snapshot(&map).map_err(|source| StoreError::Codec {
                    location: StateFile::snapshot(version).key(store_id, partition),
                    source,
                })?,
            ));
        }

        for (file, bytes) in writes {
            let kind = match file.kind {
                StateFileKind::Delta => "delta",
                StateFileKind::Snapshot => "snapshot",
            };
            metrics
                .histogram(STATE_FILE_BYTES_HISTOGRAM)
                .with_label("kind", kind)
                .record(bytes.len() as f64);
            self.backend
                .put_object(&file.key(store_id, partition), bytes)
                .await
                .map_err(|source| StoreError::Io {
                    store_id: store_id.to_string(),
                    partition,
                    version,
                    source,
                })?;
        }

        metrics
            .histogram(STATE_COMMIT_DURATION_HISTOGRAM)
            .record(start.elapsed().as_secs_f64());
        debug!(
            store_id,
            partition,
            version,
            ops = ops.len(),
            entries = map.len(),
            "Persisted state version"
        );

        self.remember(store_id, partition, version, Arc::new(map));
        Ok(())
    }

    /// Delete files no longer needed to load any version in
    /// `[latest - min_versions_to_retain, latest]`. Returns the number of files deleted.
    ///
    /// Everything older than the newest snapshot at or below that range goes;
    /// without such a snapshot nothing is deleted.
    pub async fn do_maintenance(
        &self,
        store_id: &str,
        partition: PartitionId,
        latest: Version,
    ) -> Result<usize, StoreError> {
        let Some(earliest) = latest.checked_sub(self.config.min_versions_to_retain) else {
            return Ok(0);
        };
        let io_error = |source: anyhow::Error| StoreError::Io {
            store_id: store_id.to_string(),
            partition,
            version: latest,
            source,
        };

        let available = self
            .backend
            .list_objects(&files::partition_prefix(store_id, partition))
            .await
            .map_err(io_error)?
            .iter()
            .filter_map(|key| StateFile::parse(key))
            .collect::<Vec<_>>();

        let Some(cutoff) = available
            .iter()
            .filter(|f| f.kind == StateFileKind::Snapshot && f.version <= earliest)
            .map(|f| f.version)
            .max()
        else {
            return Ok(0);
        };

        let mut deleted = 0;
        for file in available.iter().filter(|f| f.version < cutoff) {
            self.backend
                .delete_object(&file.key(store_id, partition))
                .await
                .map_err(io_error)?;
            deleted += 1;
        }

        if deleted > 0 {
            MetricsHelper::with_store_partition(store_id, partition)
                .counter(STATE_MAINTENANCE_FILES_DELETED_COUNTER)
                .increment(deleted as u64);
            info!(
                store_id,
                partition,
                latest,
                cutoff,
                deleted,
                "State maintenance removed obsolete files"
            );
        }
        Ok(deleted)
    }
}

/// Log a failed maintenance run; maintenance never fails a batch.
pub(crate) fn log_maintenance_failure(store_id: &str, partition: PartitionId, error: &StoreError) {
    MetricsHelper::with_store_partition(store_id, partition)
        .counter(STATE_MAINTENANCE_FAILURES_COUNTER)
        .increment(1);
    warn!(
        store_id,
        partition,
        error = ?error,
        "State maintenance failed, obsolete files are kept until the next run"
    );
}
