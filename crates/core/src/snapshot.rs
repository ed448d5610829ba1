//! Serializable snapshot and checkpoint documents.
//!
//! These types are shared by the engine (which produces them) and the
//! storage layer (which persists them), so they live in core.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::id::TaskId;
use crate::task::Task;
use crate::Time;

/// A prerequisite edge: `from` must complete before `to` may run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    /// The prerequisite task
    pub from: TaskId,
    /// The dependent task
    pub to: TaskId,
}

/// Immutable view of the task graph.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphSnapshot {
    /// All tasks at the time of the snapshot
    pub tasks: Vec<Task>,
    /// All prerequisite edges
    pub edges: Vec<Edge>,
}

/// Aggregate execution statistics for one executor.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ExecutorStats {
    /// Attempts dispatched to this executor
    pub attempts: u64,
    /// Attempts that succeeded
    pub successes: u64,
    /// Attempts that failed
    pub failures: u64,
    /// Total wall-clock time across attempts
    pub total_duration_ms: u64,
}

impl ExecutorStats {
    /// Success rate over recorded attempts.
    ///
    /// An executor with no history reports 1.0 so fresh registrations are
    /// not ranked below executors that have already been exercised.
    pub fn success_rate(&self) -> f64 {
        if self.attempts == 0 {
            1.0
        } else {
            self.successes as f64 / self.attempts as f64
        }
    }

    /// Mean attempt latency in milliseconds.
    pub fn avg_duration_ms(&self) -> u64 {
        if self.attempts == 0 {
            0
        } else {
            self.total_duration_ms / self.attempts
        }
    }
}

/// Per-executor statistics keyed by executor name.
pub type MetricsSnapshot = BTreeMap<String, ExecutorStats>;

/// Durable snapshot of graph and metrics state, used for crash recovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    /// When the checkpoint was taken
    pub created_at: Time,
    /// All tasks
    pub tasks: Vec<Task>,
    /// All prerequisite edges
    pub edges: Vec<Edge>,
    /// Per-executor statistics
    pub metrics: MetricsSnapshot,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unobserved_executor_rate_is_one() {
        let stats = ExecutorStats::default();
        assert_eq!(stats.success_rate(), 1.0);
        assert_eq!(stats.avg_duration_ms(), 0);
    }

    #[test]
    fn rates_follow_recorded_outcomes() {
        let stats = ExecutorStats {
            attempts: 4,
            successes: 3,
            failures: 1,
            total_duration_ms: 200,
        };
        assert_eq!(stats.success_rate(), 0.75);
        assert_eq!(stats.avg_duration_ms(), 50);
    }

    #[test]
    fn checkpoint_roundtrips_through_json() {
        use crate::task::{Task, TaskSpec};

        let task = Task::new(TaskSpec::new("roundtrip"));
        let checkpoint = Checkpoint {
            created_at: chrono::Utc::now(),
            tasks: vec![task.clone()],
            edges: vec![],
            metrics: MetricsSnapshot::new(),
        };

        let json = serde_json::to_string(&checkpoint).unwrap();
        let restored: Checkpoint = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.tasks.len(), 1);
        assert_eq!(restored.tasks[0].id, task.id);
    }
}
