//! Cherry core data models.
//!
//! This crate defines the task model, identifiers, and the serializable
//! snapshot documents shared by the orchestration engine and the storage
//! layer.

#![warn(missing_docs)]

mod id;
mod snapshot;
mod task;

pub use id::TaskId;
pub use snapshot::{Checkpoint, Edge, ExecutorStats, GraphSnapshot, MetricsSnapshot};
pub use task::{Task, TaskFilter, TaskSpec, TaskStatus};

/// Timestamp type
pub type Time = chrono::DateTime<chrono::Utc>;
