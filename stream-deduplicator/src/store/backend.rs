use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// Durable medium holding state files and commit markers.
///
/// Object keys are `/`-separated relative paths. A key is only visible to
/// readers once `put_object` has returned successfully.
#[async_trait]
pub trait StateBackend: Send + Sync + std::fmt::Debug {
    /// Write an object, replacing any previous content
    async fn put_object(&self, key: &str, bytes: Vec<u8>) -> Result<()>;

    /// Read an object, `None` if it does not exist
    async fn get_object(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Full keys of the objects directly under a directory-like prefix ending in `/`
    async fn list_objects(&self, prefix: &str) -> Result<Vec<String>>;

    /// Delete an object. Deleting a missing object succeeds.
    async fn delete_object(&self, key: &str) -> Result<()>;
}

/// Stores objects as files below a root directory.
#[derive(Debug, Clone)]
pub struct LocalStateBackend {
    root: PathBuf,
}

impl LocalStateBackend {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        key.split('/')
            .filter(|segment| !segment.is_empty())
            .fold(self.root.clone(), |path, segment| path.join(segment))
    }
}

#[async_trait]
impl StateBackend for LocalStateBackend {
    async fn put_object(&self, key: &str, bytes: Vec<u8>) -> Result<()> {
        let path = self.path_for(key);
        let parent = path
            .parent()
            .with_context(|| format!("Object key {key} has no parent directory"))?;
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create directory {}", parent.display()))?;

        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .with_context(|| format!("Object key {key} has no file name"))?;
        let tmp_path = parent.join(format!(".{file_name}.tmp"));

        let mut file = tokio::fs::File::create(&tmp_path)
            .await
            .with_context(|| format!("Failed to create {}", tmp_path.display()))?;
        file.write_all(&bytes)
            .await
            .with_context(|| format!("Failed to write {}", tmp_path.display()))?;
        file.sync_all()
            .await
            .with_context(|| format!("Failed to sync {}", tmp_path.display()))?;
        drop(file);

        tokio::fs::rename(&tmp_path, &path)
            .await
            .with_context(|| format!("Failed to move {} into place", path.display()))?;

        debug!(key, bytes = bytes.len(), "Wrote state object");
        Ok(())
    }

    async fn get_object(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(key);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
        }
    }

    async fn list_objects(&self, prefix: &str) -> Result<Vec<String>> {
        let dir = self.path_for(prefix);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to list {}", dir.display()))
            }
        };

        let prefix = if prefix.is_empty() || prefix.ends_with('/') {
            prefix.to_string()
        } else {
            format!("{prefix}/")
        };
        let mut keys = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("Failed to list {}", dir.display()))?
        {
            let file_type = entry.file_type().await?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            // in-flight temp files are never visible
            if file_type.is_file() && !name.starts_with('.') {
                keys.push(format!("{prefix}{name}"));
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn delete_object(&self, key: &str) -> Result<()> {
        let path = self.path_for(key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to delete {}", path.display())),
        }
    }
}

/// Ephemeral backend for tests and throwaway pipelines.
///
/// Supports injecting write failures to exercise retry and atomicity paths.
#[derive(Debug, Default)]
pub struct InMemoryStateBackend {
    objects: DashMap<String, Vec<u8>>,
    failing_writes: AtomicUsize,
}

impl InMemoryStateBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `count` calls to `put_object` fail without writing anything.
    pub fn fail_next_writes(&self, count: usize) {
        self.failing_writes.store(count, Ordering::SeqCst);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.objects.contains_key(key)
    }

    /// All keys currently stored, sorted
    pub fn keys(&self) -> Vec<String> {
        let mut keys = self
            .objects
            .iter()
            .map(|entry| entry.key().clone())
            .collect::<Vec<_>>();
        keys.sort();
        keys
    }

    fn take_injected_failure(&self) -> bool {
        self.failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl StateBackend for InMemoryStateBackend {
    async fn put_object(&self, key: &str, bytes: Vec<u8>) -> Result<()> {
        if self.take_injected_failure() {
            bail!("injected write failure for {key}");
        }
        self.objects.insert(key.to_string(), bytes);
        Ok(())
    }

    async fn get_object(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.objects.get(key).map(|entry| entry.value().clone()))
    }

    async fn list_objects(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = self
            .objects
            .iter()
            .map(|entry| entry.key().clone())
            .filter(|key| {
                key.strip_prefix(prefix)
                    .is_some_and(|rest| !rest.is_empty() && !rest.contains('/'))
            })
            .collect::<Vec<_>>();
        keys.sort();
        Ok(keys)
    }

    async fn delete_object(&self, key: &str) -> Result<()> {
        self.objects.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_local_backend_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let backend = LocalStateBackend::new(tmp.path());

        backend
            .put_object("state/0-deduplicate/0/1.delta", b"one".to_vec())
            .await
            .unwrap();
        backend
            .put_object("state/0-deduplicate/0/2.delta", b"two".to_vec())
            .await
            .unwrap();

        assert_eq!(
            backend
                .get_object("state/0-deduplicate/0/1.delta")
                .await
                .unwrap(),
            Some(b"one".to_vec())
        );
        assert_eq!(backend.get_object("state/missing").await.unwrap(), None);

        let listed = backend
            .list_objects("state/0-deduplicate/0/")
            .await
            .unwrap();
        assert_eq!(
            listed,
            vec![
                "state/0-deduplicate/0/1.delta".to_string(),
                "state/0-deduplicate/0/2.delta".to_string()
            ]
        );
        assert!(backend.list_objects("nothing/here/").await.unwrap().is_empty());

        backend
            .delete_object("state/0-deduplicate/0/1.delta")
            .await
            .unwrap();
        backend
            .delete_object("state/0-deduplicate/0/1.delta")
            .await
            .unwrap();
        assert_eq!(
            backend
                .list_objects("state/0-deduplicate/0/")
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_local_backend_overwrite_leaves_no_temp_files() {
        let tmp = TempDir::new().unwrap();
        let backend = LocalStateBackend::new(tmp.path());

        backend.put_object("commits/1.json", b"a".to_vec()).await.unwrap();
        backend.put_object("commits/1.json", b"b".to_vec()).await.unwrap();

        assert_eq!(
            backend.get_object("commits/1.json").await.unwrap(),
            Some(b"b".to_vec())
        );
        let names = std::fs::read_dir(tmp.path().join("commits"))
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["1.json".to_string()]);
    }

    #[tokio::test]
    async fn test_in_memory_list_is_not_recursive() {
        let backend = InMemoryStateBackend::new();
        backend.put_object("state/a/0/1.delta", vec![1]).await.unwrap();
        backend.put_object("state/a/1/1.delta", vec![2]).await.unwrap();
        backend.put_object("state/a/0/2.delta", vec![3]).await.unwrap();

        assert_eq!(
            backend.list_objects("state/a/0/").await.unwrap(),
            vec!["state/a/0/1.delta".to_string(), "state/a/0/2.delta".to_string()]
        );
        assert!(backend.list_objects("state/a/").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_in_memory_injected_failures() {
        let backend = InMemoryStateBackend::new();
        backend.fail_next_writes(2);

        assert!(backend.put_object("k", vec![1]).await.is_err());
        assert!(backend.put_object("k", vec![1]).await.is_err());
        assert!(!backend.contains("k"));

        backend.put_object("k", vec![1]).await.unwrap();
        assert!(backend.contains("k"));
        assert_eq!(backend.keys(), vec!["k".to_string()]);
    }
}
