//! Checkpoint persistence for the Cherry orchestration engine.
//!
//! This crate provides a trait-based checkpoint interface with a JSON-file
//! reference implementation and an in-memory implementation for tests.

#![warn(missing_docs)]

pub mod json;
pub mod memory;

use async_trait::async_trait;
use cherry_core::Checkpoint;

pub use json::JsonCheckpointStore;
pub use memory::MemoryCheckpointStore;

/// Error type for checkpoint operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors that can occur while persisting or loading checkpoints.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Durable storage for scheduler checkpoints.
///
/// A store holds at most one checkpoint; each `save` replaces the previous
/// one. Crash recovery loads the latest checkpoint and resumes from it.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Persist a checkpoint, replacing any previous one.
    async fn save(&self, checkpoint: &Checkpoint) -> Result<()>;

    /// Load the most recent checkpoint, if any exists.
    async fn load(&self) -> Result<Option<Checkpoint>>;
}
