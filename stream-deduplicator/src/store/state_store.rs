use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use super::files::DeltaOp;
use super::provider::{StateMap, StateStoreProvider};
use super::{PartitionId, Version};
use crate::error::StoreError;

/// Uncommitted state of one partition for the batch in flight.
#[derive(Debug)]
struct WorkingCopy {
    base_version: Version,
    map: StateMap,
    /// Final outcome per touched key, `None` for a removal
    changes: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
}

impl WorkingCopy {
    fn delta(&self) -> Vec<DeltaOp> {
        self.changes
            .iter()
            .map(|(key, change)| match change {
                Some(value) => DeltaOp::Put {
                    key: key.clone(),
                    value: value.clone(),
                },
                None => DeltaOp::Remove { key: key.clone() },
            })
            .collect()
    }
}

/// The state of one stateful operator across all of its partitions.
///
/// Reads and writes go to a per-partition working copy created by
/// [`load`](Self::load). Nothing becomes visible to later loads until
/// [`commit`](Self::commit) has persisted the version.
#[derive(Debug)]
pub struct StateStore {
    store_id: String,
    provider: Arc<StateStoreProvider>,
    working: HashMap<PartitionId, WorkingCopy>,
}

impl StateStore {
    pub fn new(store_id: impl Into<String>, provider: Arc<StateStoreProvider>) -> Self {
        Self {
            store_id: store_id.into(),
            provider,
            working: HashMap::new(),
        }
    }

    pub fn store_id(&self) -> &str {
        &self.store_id
    }

    /// Version the working copy of `partition` was loaded from
    pub fn loaded_version(&self, partition: PartitionId) -> Option<Version> {
        self.working.get(&partition).map(|w| w.base_version)
    }

    /// Replace any working copy of `partition` with a fresh copy of `version`.
    pub async fn load(&mut self, partition: PartitionId, version: Version) -> Result<(), StoreError> {
        let base = self
            .provider
            .load_version(&self.store_id, partition, version)
            .await?;
        debug!(
            store_id = %self.store_id,
            partition,
            version,
            entries = base.len(),
            "Loaded working copy"
        );
        self.working.insert(
            partition,
            WorkingCopy {
                base_version: version,
                map: (*base).clone(),
                changes: BTreeMap::new(),
            },
        );
        Ok(())
    }

    fn working(&self, partition: PartitionId) -> Result<&WorkingCopy, StoreError> {
        self.working
            .get(&partition)
            .ok_or_else(|| StoreError::NotInitialized {
                store_id: self.store_id.clone(),
                partition,
            })
    }

    fn working_mut(&mut self, partition: PartitionId) -> Result<&mut WorkingCopy, StoreError> {
        match self.working.get_mut(&partition) {
            Some(working) => Ok(working),
            None => Err(StoreError::NotInitialized {
                store_id: self.store_id.clone(),
                partition,
            }),
        }
    }

    pub fn get(&self, partition: PartitionId, key: &[u8]) -> Result<Option<&[u8]>, StoreError> {
        Ok(self.working(partition)?.map.get(key).map(Vec::as_slice))
    }

    pub fn contains(&self, partition: PartitionId, key: &[u8]) -> Result<bool, StoreError> {
        Ok(self.working(partition)?.map.contains_key(key))
    }

    pub fn put(
        &mut self,
        partition: PartitionId,
        key: Vec<u8>,
        value: Vec<u8>,
    ) -> Result<(), StoreError> {
        let working = self.working_mut(partition)?;
        working.changes.insert(key.clone(), Some(value.clone()));
        working.map.insert(key, value);
        Ok(())
    }

    /// Remove a key, returning its previous value.
    pub fn remove(&mut self, partition: PartitionId, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let working = self.working_mut(partition)?;
        let previous = working.map.remove(key);
        if previous.is_some() {
            working.changes.insert(key.to_vec(), None);
        }
        Ok(previous)
    }

    /// Entries of the working copy in key order. Each call starts from the beginning.
    pub fn iterate(
        &self,
        partition: PartitionId,
    ) -> Result<impl Iterator<Item = (&[u8], &[u8])> + '_, StoreError> {
        Ok(self
            .working(partition)?
            .map
            .iter()
            .map(|(k, v)| (k.as_slice(), v.as_slice())))
    }

    pub fn len(&self, partition: PartitionId) -> Result<usize, StoreError> {
        Ok(self.working(partition)?.map.len())
    }

    pub fn is_empty(&self, partition: PartitionId) -> Result<bool, StoreError> {
        Ok(self.working(partition)?.map.is_empty())
    }

    pub fn get_typed<T: DeserializeOwned>(
        &self,
        partition: PartitionId,
        key: &[u8],
    ) -> Result<Option<T>, StoreError> {
        let Some(bytes) = self.get(partition, key)? else {
            return Ok(None);
        };
        let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::Codec {
                location: format!("{}/{partition}", self.store_id),
                source: e.into(),
            })?;
        Ok(Some(value))
    }

    /// Owned, decoded snapshot of every entry, for scans that mutate afterwards.
    pub fn entries_typed<T: DeserializeOwned>(
        &self,
        partition: PartitionId,
    ) -> Result<Vec<(Vec<u8>, T)>, StoreError> {
        self.iterate(partition)?
            .map(|(key, bytes)| {
                bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                    .map(|(value, _)| (key.to_vec(), value))
                    .map_err(|e| StoreError::Codec {
                        location: format!("{}/{partition}", self.store_id),
                        source: e.into(),
                    })
            })
            .collect()
    }

    pub fn put_typed<T: Serialize>(
        &mut self,
        partition: PartitionId,
        key: Vec<u8>,
        value: &T,
    ) -> Result<(), StoreError> {
        let bytes = bincode::serde::encode_to_vec(value, bincode::config::standard()).map_err(
            |e| StoreError::Codec {
                location: format!("{}/{partition}", self.store_id),
                source: e.into(),
            },
        )?;
        self.put(partition, key, bytes)
    }

    /// Persist the working copy of `partition` as `version`, which must directly
    /// follow the loaded version. The working copy is released whether or not
    /// the write succeeds.
    pub async fn commit(&mut self, partition: PartitionId, version: Version) -> Result<Version, StoreError> {
        let working = self
            .working
            .remove(&partition)
            .ok_or_else(|| StoreError::NotInitialized {
                store_id: self.store_id.clone(),
                partition,
            })?;

        if version != working.base_version + 1 {
            let loaded = working.base_version;
            self.working.insert(partition, working);
            return Err(StoreError::VersionMismatch {
                store_id: self.store_id.clone(),
                partition,
                loaded,
                requested: version,
            });
        }

        let delta = working.delta();
        self.provider
            .persist_version(&self.store_id, partition, version, &delta, working.map)
            .await?;
        Ok(version)
    }

    /// Drop the working copy of `partition` without any I/O.
    pub fn abort(&mut self, partition: PartitionId) {
        if self.working.remove(&partition).is_some() {
            debug!(store_id = %self.store_id, partition, "Aborted working copy");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::backend::InMemoryStateBackend;
    use crate::store::provider::StateStoreConfig;

    fn store() -> (Arc<InMemoryStateBackend>, StateStore) {
        let backend = Arc::new(InMemoryStateBackend::new());
        let provider = Arc::new(StateStoreProvider::new(
            backend.clone(),
            StateStoreConfig::default(),
        ));
        (backend, StateStore::new("0-deduplicate", provider))
    }

    #[tokio::test]
    async fn test_access_before_load_fails() {
        let (_, mut store) = store();
        assert!(matches!(
            store.get(0, b"a"),
            Err(StoreError::NotInitialized { partition: 0, .. })
        ));
        assert!(matches!(
            store.put(1, b"a".to_vec(), Vec::new()),
            Err(StoreError::NotInitialized { partition: 1, .. })
        ));
        assert!(store.iterate(0).is_err());
        assert!(store.commit(0, 1).await.is_err());
    }

    #[tokio::test]
    async fn test_commit_makes_state_visible_to_next_load() {
        let (_, mut store) = store();
        store.load(0, 0).await.unwrap();
        store.put(0, b"a".to_vec(), b"1".to_vec()).unwrap();
        store.put(0, b"b".to_vec(), b"2".to_vec()).unwrap();
        assert_eq!(store.commit(0, 1).await.unwrap(), 1);
        assert!(store.get(0, b"a").is_err());

        store.load(0, 1).await.unwrap();
        assert_eq!(store.get(0, b"a").unwrap(), Some(b"1".as_slice()));
        assert_eq!(store.remove(0, b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(store.remove(0, b"zzz").unwrap(), None);
        store.commit(0, 2).await.unwrap();

        store.load(0, 2).await.unwrap();
        let entries = store
            .iterate(0)
            .unwrap()
            .map(|(k, v)| (k.to_vec(), v.to_vec()))
            .collect::<Vec<_>>();
        assert_eq!(entries, vec![(b"b".to_vec(), b"2".to_vec())]);

        // older versions remain loadable
        store.load(0, 1).await.unwrap();
        assert_eq!(store.len(0).unwrap(), 2);
    }

    #[tokio::test]
    async fn test_abort_discards_mutations() {
        let (backend, mut store) = store();
        store.load(0, 0).await.unwrap();
        store.put(0, b"a".to_vec(), Vec::new()).unwrap();
        store.abort(0);
        assert!(store.get(0, b"a").is_err());
        assert!(backend.keys().is_empty());

        store.load(0, 0).await.unwrap();
        assert!(store.is_empty(0).unwrap());
    }

    #[tokio::test]
    async fn test_commit_requires_next_version() {
        let (_, mut store) = store();
        store.load(0, 0).await.unwrap();
        let err = store.commit(0, 2).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::VersionMismatch {
                loaded: 0,
                requested: 2,
                ..
            }
        ));
        // the working copy survives a rejected commit
        assert_eq!(store.loaded_version(0), Some(0));
        store.commit(0, 1).await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_commit_is_not_visible() {
        let (backend, mut store) = store();
        store.load(0, 0).await.unwrap();
        store.put(0, b"a".to_vec(), Vec::new()).unwrap();
        backend.fail_next_writes(1);

        let err = store.commit(0, 1).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(matches!(
            store.load(0, 1).await,
            Err(StoreError::VersionNotFound { version: 1, .. })
        ));
    }

    #[tokio::test]
    async fn test_partitions_are_independent() {
        let (_, mut store) = store();
        store.load(0, 0).await.unwrap();
        store.load(1, 0).await.unwrap();
        store.put(0, b"a".to_vec(), Vec::new()).unwrap();

        assert!(store.contains(0, b"a").unwrap());
        assert!(!store.contains(1, b"a").unwrap());
        store.commit(0, 1).await.unwrap();
        store.commit(1, 1).await.unwrap();

        store.load(1, 1).await.unwrap();
        assert!(store.is_empty(1).unwrap());
    }

    #[tokio::test]
    async fn test_typed_values() {
        let (_, mut store) = store();
        store.load(0, 0).await.unwrap();
        store.put_typed(0, b"bucket".to_vec(), &Some(19_999i64)).unwrap();
        store.put(0, b"raw".to_vec(), vec![0xff]).unwrap();

        assert_eq!(
            store.get_typed::<Option<i64>>(0, b"bucket").unwrap(),
            Some(Some(19_999))
        );
        assert_eq!(store.get_typed::<Option<i64>>(0, b"missing").unwrap(), None);
        assert!(matches!(
            store.get_typed::<String>(0, b"raw"),
            Err(StoreError::Codec { .. })
        ));
    }
}
