//! JSON file checkpoint store.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use cherry_core::Checkpoint;
use tokio::fs;
use tracing::debug;

use super::{CheckpointStore, Result};

/// Stores the checkpoint as a single pretty-printed JSON document.
///
/// Writes go to a sibling `.tmp` file first and are renamed into place, so
/// a crash mid-write never leaves a partially written checkpoint behind.
pub struct JsonCheckpointStore {
    path: PathBuf,
}

impl JsonCheckpointStore {
    /// Create a store backed by the given file path. Parent directories are
    /// created on the first save.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// The path of the checkpoint document.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl CheckpointStore for JsonCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        let json = serde_json::to_string_pretty(checkpoint)?;
        let tmp = self.tmp_path();
        fs::write(&tmp, json.as_bytes()).await?;
        fs::rename(&tmp, &self.path).await?;

        debug!(path = %self.path.display(), tasks = checkpoint.tasks.len(), "checkpoint written");
        Ok(())
    }

    async fn load(&self) -> Result<Option<Checkpoint>> {
        match fs::read_to_string(&self.path).await {
            Ok(json) => {
                let checkpoint = serde_json::from_str(&json)?;
                Ok(Some(checkpoint))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cherry_core::{MetricsSnapshot, Task, TaskSpec};

    fn sample_checkpoint() -> Checkpoint {
        Checkpoint {
            created_at: chrono::Utc::now(),
            tasks: vec![Task::new(TaskSpec::new("persisted"))],
            edges: vec![],
            metrics: MetricsSnapshot::new(),
        }
    }

    #[tokio::test]
    async fn load_from_missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonCheckpointStore::new(dir.path().join("checkpoint.json"));
        assert!(store.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn save_then_load_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonCheckpointStore::new(dir.path().join("checkpoint.json"));

        let checkpoint = sample_checkpoint();
        store.save(&checkpoint).await.unwrap();

        let loaded = store.load().await.unwrap().unwrap();
        assert_eq!(loaded.tasks.len(), 1);
        assert_eq!(loaded.tasks[0].id, checkpoint.tasks[0].id);
    }

    #[tokio::test]
    async fn save_replaces_previous_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonCheckpointStore::new(dir.path().join("checkpoint.json"));

        store.save(&sample_checkpoint()).await.unwrap();
        let second = sample_checkpoint();
        store.save(&second).await.unwrap();

        let loaded = store.load().await.unwrap().unwrap();
        assert_eq!(loaded.tasks[0].id, second.tasks[0].id);
    }

    #[tokio::test]
    async fn no_temp_file_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoint.json");
        let store = JsonCheckpointStore::new(&path);

        store.save(&sample_checkpoint()).await.unwrap();

        assert!(path.exists());
        assert!(!store.tmp_path().exists());
    }

    #[tokio::test]
    async fn creates_missing_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("deep").join("checkpoint.json");
        let store = JsonCheckpointStore::new(&path);

        store.save(&sample_checkpoint()).await.unwrap();
        assert!(store.load().await.unwrap().is_some());
    }
}
