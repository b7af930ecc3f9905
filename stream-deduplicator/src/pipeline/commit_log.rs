use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::operators::StateOperatorMetrics;
use crate::store::StateBackend;

pub const COMMITS_PREFIX: &str = "commits/";

/// Marker that makes a batch committed. Written after every operator
/// version of the batch is durable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitEntry {
    pub batch_id: u64,
    /// Watermark after the batch, `None` while still at negative infinity
    pub watermark: Option<i64>,
    /// Per-operator metrics in chain order
    pub operator_metrics: Vec<StateOperatorMetrics>,
    pub committed_at: DateTime<Utc>,
}

impl CommitEntry {
    pub fn new(
        batch_id: u64,
        watermark: Option<i64>,
        operator_metrics: Vec<StateOperatorMetrics>,
    ) -> Self {
        Self {
            batch_id,
            watermark,
            operator_metrics,
            committed_at: Utc::now(),
        }
    }

    pub fn key(batch_id: u64) -> String {
        format!("{COMMITS_PREFIX}{batch_id}.json")
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize commit entry")
    }

    pub fn from_json_bytes(json: &[u8]) -> Result<Self> {
        serde_json::from_slice(json).context("In CommitEntry::from_json_bytes")
    }
}

/// Batch commit markers stored next to the operator state.
#[derive(Debug, Clone)]
pub struct CommitLog {
    backend: Arc<dyn StateBackend>,
}

impl CommitLog {
    pub fn new(backend: Arc<dyn StateBackend>) -> Self {
        Self { backend }
    }

    pub async fn write(&self, entry: &CommitEntry) -> Result<()> {
        let json = entry.to_json()?;
        self.backend
            .put_object(&CommitEntry::key(entry.batch_id), json.into_bytes())
            .await
            .with_context(|| format!("Failed to write commit marker for batch {}", entry.batch_id))
    }

    pub async fn read(&self, batch_id: u64) -> Result<Option<CommitEntry>> {
        let Some(bytes) = self.backend.get_object(&CommitEntry::key(batch_id)).await? else {
            return Ok(None);
        };
        CommitEntry::from_json_bytes(&bytes)
            .with_context(|| format!("Commit marker for batch {batch_id} is unreadable"))
            .map(Some)
    }

    /// Ids of every committed batch, ascending
    pub async fn committed_batches(&self) -> Result<Vec<u64>> {
        let mut ids = self
            .backend
            .list_objects(COMMITS_PREFIX)
            .await?
            .iter()
            .filter_map(|key| {
                key.strip_prefix(COMMITS_PREFIX)?
                    .strip_suffix(".json")?
                    .parse::<u64>()
                    .ok()
            })
            .collect::<Vec<_>>();
        ids.sort_unstable();
        Ok(ids)
    }

    pub async fn latest(&self) -> Result<Option<CommitEntry>> {
        match self.committed_batches().await?.last() {
            Some(&batch_id) => self.read(batch_id).await,
            None => Ok(None),
        }
    }

    /// Delete markers of batches before `batch_id`. Returns the number removed.
    pub async fn prune_before(&self, batch_id: u64) -> Result<usize> {
        let obsolete = self
            .committed_batches()
            .await?
            .into_iter()
            .filter(|id| *id < batch_id)
            .collect::<Vec<_>>();
        for id in &obsolete {
            self.backend.delete_object(&CommitEntry::key(*id)).await?;
        }
        if !obsolete.is_empty() {
            info!(
                removed = obsolete.len(),
                before = batch_id,
                "Pruned obsolete commit markers"
            );
        }
        Ok(obsolete.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStateBackend;

    fn log() -> (Arc<InMemoryStateBackend>, CommitLog) {
        let backend = Arc::new(InMemoryStateBackend::new());
        (backend.clone(), CommitLog::new(backend))
    }

    #[tokio::test]
    async fn test_write_and_read_marker() {
        let (backend, log) = log();
        let mut metrics = StateOperatorMetrics::new("0-deduplicate");
        metrics.total_rows = 7;
        let entry = CommitEntry::new(2, Some(15_000), vec![metrics]);

        log.write(&entry).await.unwrap();
        assert!(backend.contains("commits/2.json"));
        assert_eq!(log.read(2).await.unwrap(), Some(entry));
        assert_eq!(log.read(3).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_latest_orders_numerically() {
        let (_, log) = log();
        assert!(log.latest().await.unwrap().is_none());
        for id in [1, 2, 9, 10] {
            log.write(&CommitEntry::new(id, None, Vec::new())).await.unwrap();
        }
        assert_eq!(log.committed_batches().await.unwrap(), vec![1, 2, 9, 10]);
        assert_eq!(log.latest().await.unwrap().unwrap().batch_id, 10);

        assert_eq!(log.prune_before(9).await.unwrap(), 2);
        assert_eq!(log.committed_batches().await.unwrap(), vec![9, 10]);
    }

    #[tokio::test]
    async fn test_unreadable_marker_is_an_error() {
        let (backend, log) = log();
        backend
            .put_object("commits/4.json", b"{not json".to_vec())
            .await
            .unwrap();
        let err = log.read(4).await.unwrap_err();
        assert!(format!("{err:#}").contains("batch 4"));
    }
}
