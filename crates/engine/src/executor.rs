//! Executor contract.
//!
//! Executors are the pluggable handlers that perform the actual work for a
//! task's required capabilities. The engine routes tasks to them and never
//! looks inside the payload.

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use cherry_core::{Task, TaskId};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Typed failure raised by an executor (or by the scheduler's timeout).
#[derive(Debug, Clone, thiserror::Error)]
pub enum ExecutionError {
    /// The invocation exceeded the scheduler's per-task timeout.
    #[error("execution timed out after {timeout:?}")]
    Timeout {
        /// The configured bound that was exceeded
        timeout: Duration,
    },

    /// The executor failed; retrying may succeed.
    #[error("execution failed: {0}")]
    Failed(String),

    /// Retrying is pointless (e.g. malformed payload). Never retried.
    #[error("unrecoverable: {0}")]
    Unrecoverable(String),
}

impl ExecutionError {
    /// The error-kind bucket used by the monitor and recovery policy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Failed(_) => ErrorKind::Execution,
            Self::Unrecoverable(_) => ErrorKind::Unrecoverable,
        }
    }
}

/// Coarse classification of execution failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Invocation exceeded its time bound
    Timeout,
    /// Executor reported a retryable failure
    Execution,
    /// Executor signalled that retrying is pointless
    Unrecoverable,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Timeout => "timeout",
            Self::Execution => "execution",
            Self::Unrecoverable => "unrecoverable",
        };
        f.write_str(s)
    }
}

/// Everything an executor receives for one attempt.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    /// The task being executed (a clone; the graph owns the original)
    pub task: Task,

    /// 1-based attempt number for this invocation
    pub attempt: u32,

    cancelled: watch::Receiver<bool>,
}

impl ExecutionContext {
    /// Build a context around a task clone and a cancellation signal.
    pub fn new(task: Task, attempt: u32, cancelled: watch::Receiver<bool>) -> Self {
        Self {
            task,
            attempt,
            cancelled,
        }
    }

    /// The id of the task being executed.
    pub fn task_id(&self) -> TaskId {
        self.task.id
    }

    /// Whether cancellation has been requested. Cancellation is cooperative:
    /// the executor is expected to return promptly but is never force-killed.
    pub fn is_cancelled(&self) -> bool {
        *self.cancelled.borrow()
    }

    /// Wait until cancellation is requested.
    pub async fn cancelled(&mut self) {
        while !*self.cancelled.borrow_and_update() {
            if self.cancelled.changed().await.is_err() {
                // Sender dropped; the attempt is being torn down anyway.
                return;
            }
        }
    }
}

/// A pluggable handler that performs the work for matching tasks.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Stable name, used for metrics and error attribution.
    fn name(&self) -> &str;

    /// Capability tags this executor advertises. A task is routable here
    /// only if this set is a superset of the task's requirements.
    fn capabilities(&self) -> &BTreeSet<String>;

    /// Perform the work for one attempt.
    async fn execute(&self, ctx: ExecutionContext) -> Result<String, ExecutionError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use cherry_core::TaskSpec;

    #[test]
    fn error_kinds_map_to_buckets() {
        let timeout = ExecutionError::Timeout {
            timeout: Duration::from_secs(5),
        };
        assert_eq!(timeout.kind(), ErrorKind::Timeout);
        assert_eq!(
            ExecutionError::Failed("boom".into()).kind(),
            ErrorKind::Execution
        );
        assert_eq!(
            ExecutionError::Unrecoverable("bad payload".into()).kind(),
            ErrorKind::Unrecoverable
        );
    }

    #[tokio::test]
    async fn context_observes_cancellation() {
        let (tx, rx) = watch::channel(false);
        let task = Task::new(TaskSpec::new("cancellable"));
        let mut ctx = ExecutionContext::new(task, 1, rx);

        assert!(!ctx.is_cancelled());
        tx.send(true).unwrap();
        ctx.cancelled().await;
        assert!(ctx.is_cancelled());
    }
}
