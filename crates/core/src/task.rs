//! Task model - the unit of work routed through the orchestration engine.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::id::TaskId;
use crate::Time;

/// A task is one schedulable unit of work.
///
/// The engine never interprets `description` or `context`; both are opaque
/// payloads handed to whichever executor the registry resolves for
/// `required_capabilities`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier
    pub id: TaskId,

    /// Opaque payload describing the work
    pub description: String,

    /// Capability tags an executor must advertise to receive this task
    pub required_capabilities: BTreeSet<String>,

    /// Dispatch priority; higher goes first
    pub priority: i32,

    /// Tasks that must complete before this one becomes eligible
    pub prerequisites: BTreeSet<TaskId>,

    /// Current status
    pub status: TaskStatus,

    /// Opaque key/value context passed through to the executor
    pub context: HashMap<String, serde_json::Value>,

    /// Submission sequence number, assigned by the graph.
    /// FIFO tie-break within equal priority; `created_at` alone can collide.
    pub seq: u64,

    /// Submission timestamp
    pub created_at: Time,

    /// First dispatch timestamp
    pub started_at: Option<Time>,

    /// Terminal-state timestamp
    pub completed_at: Option<Time>,

    /// Execution attempts made so far
    pub attempt: u32,

    /// Executor output, populated on completion
    pub result: Option<String>,

    /// Last failure message, populated on failed attempts
    pub last_error: Option<String>,
}

impl Task {
    /// Build a fresh task from a submission spec. The graph assigns `seq`.
    pub fn new(spec: TaskSpec) -> Self {
        Self {
            id: TaskId::new(),
            description: spec.description,
            required_capabilities: spec.required_capabilities,
            priority: spec.priority,
            prerequisites: spec.prerequisites,
            status: TaskStatus::Pending,
            context: spec.context,
            seq: 0,
            created_at: chrono::Utc::now(),
            started_at: None,
            completed_at: None,
            attempt: 0,
            result: None,
            last_error: None,
        }
    }

    /// Whether the task has reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Task lifecycle states.
///
/// Transitions only move forward, with one sanctioned exception:
/// `Running -> Eligible` when a retry is re-queued (the `attempt` counter
/// still increases monotonically).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskStatus {
    /// Submitted, waiting on prerequisites
    Pending,
    /// Every prerequisite completed; ready for dispatch
    Eligible,
    /// Handed to a worker
    Running,
    /// Executor reported success
    Completed,
    /// Permanently failed
    Failed,
    /// Cancelled, directly or through a prerequisite
    Cancelled,
}

impl TaskStatus {
    /// Whether this is a terminal state.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Eligible => "eligible",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Specification for submitting a task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Opaque payload describing the work
    pub description: String,

    /// Dispatch priority; higher goes first
    pub priority: i32,

    /// Tasks that must complete first
    pub prerequisites: BTreeSet<TaskId>,

    /// Capability tags required of the executor
    pub required_capabilities: BTreeSet<String>,

    /// Opaque context passed through to the executor
    pub context: HashMap<String, serde_json::Value>,
}

impl TaskSpec {
    /// Create a spec with the given description.
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            ..Default::default()
        }
    }

    /// Set the priority.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Add a required capability tag.
    pub fn with_capability(mut self, tag: impl Into<String>) -> Self {
        self.required_capabilities.insert(tag.into());
        self
    }

    /// Add a prerequisite task.
    pub fn with_prerequisite(mut self, id: TaskId) -> Self {
        self.prerequisites.insert(id);
        self
    }

    /// Add a context entry.
    pub fn with_context(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }
}

/// Filter for querying tasks.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskFilter {
    /// Filter by status
    pub status: Option<Vec<TaskStatus>>,

    /// Filter by minimum priority
    pub min_priority: Option<i32>,
}

impl TaskFilter {
    /// Whether a task passes this filter.
    pub fn matches(&self, task: &Task) -> bool {
        if let Some(statuses) = &self.status {
            if !statuses.contains(&task.status) {
                return false;
            }
        }
        if let Some(min) = self.min_priority {
            if task.priority < min {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_builder_collects_fields() {
        let dep = TaskId::new();
        let spec = TaskSpec::new("scrape the docs")
            .with_priority(7)
            .with_capability("web")
            .with_prerequisite(dep)
            .with_context("depth", serde_json::json!(2));

        assert_eq!(spec.priority, 7);
        assert!(spec.required_capabilities.contains("web"));
        assert!(spec.prerequisites.contains(&dep));
        assert_eq!(spec.context["depth"], serde_json::json!(2));
    }

    #[test]
    fn terminal_states() {
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Eligible.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
    }

    #[test]
    fn filter_matches_status_and_priority() {
        let mut task = Task::new(TaskSpec::new("x").with_priority(5));
        task.status = TaskStatus::Eligible;

        let filter = TaskFilter {
            status: Some(vec![TaskStatus::Eligible]),
            min_priority: Some(3),
        };
        assert!(filter.matches(&task));

        let filter = TaskFilter {
            status: Some(vec![TaskStatus::Running]),
            min_priority: None,
        };
        assert!(!filter.matches(&task));

        let filter = TaskFilter {
            status: None,
            min_priority: Some(9),
        };
        assert!(!filter.matches(&task));
    }
}
