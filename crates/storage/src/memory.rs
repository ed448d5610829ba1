//! In-memory checkpoint store for tests.

use async_trait::async_trait;
use cherry_core::Checkpoint;
use tokio::sync::Mutex;

use super::{CheckpointStore, Result};

/// Keeps the latest checkpoint in memory. Useful for engine tests and for
/// running the scheduler without durable storage.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    slot: Mutex<Option<Checkpoint>>,
}

impl MemoryCheckpointStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a checkpoint has been saved.
    pub async fn has_checkpoint(&self) -> bool {
        self.slot.lock().await.is_some()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        *self.slot.lock().await = Some(checkpoint.clone());
        Ok(())
    }

    async fn load(&self) -> Result<Option<Checkpoint>> {
        Ok(self.slot.lock().await.clone())
    }
}
