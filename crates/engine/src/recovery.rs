//! Failure recovery: fallback chain first, backoff second.
//!
//! The two-level strategy — try sibling executors before re-trying the same
//! implementation — is why the registry's fallback chain and the retry
//! policy stay separate collaborators instead of one retry loop.

use std::collections::VecDeque;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use cherry_core::Task;
use tracing::{debug, warn};

use crate::executor::{ErrorKind, ExecutionError, Executor};
use crate::monitor::{ErrorMonitor, ErrorRecord};
use crate::retry::RetryPolicy;

/// What to do about one failed attempt.
pub enum RecoveryDecision {
    /// Dispatch the next fallback executor immediately, without backoff —
    /// a different executor is not assumed to share the fault.
    UseFallback(Arc<dyn Executor>),

    /// Wait out the backoff delay, then re-attempt with the original
    /// primary executor.
    RetryAfter(Duration),

    /// Permanently fail the task and surface the error to the caller.
    Fail,
}

/// Decides between retry, fallback, and permanent failure.
pub struct RecoveryManager {
    monitor: Arc<ErrorMonitor>,
    policy: RwLock<RetryPolicy>,
    max_attempts: u32,
}

impl RecoveryManager {
    /// Default cap on attempts per task.
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

    /// Create a manager around a shared error monitor.
    pub fn new(monitor: Arc<ErrorMonitor>) -> Self {
        Self {
            monitor,
            policy: RwLock::new(RetryPolicy::default()),
            max_attempts: Self::DEFAULT_MAX_ATTEMPTS,
        }
    }

    /// Set the attempt cap.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Set the backoff policy at construction.
    pub fn with_policy(self, policy: RetryPolicy) -> Self {
        self.set_policy(policy);
        self
    }

    /// Swap the backoff policy at runtime.
    pub fn set_policy(&self, policy: RetryPolicy) {
        *self.policy.write().expect("retry policy poisoned") = policy;
    }

    /// The configured attempt cap.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Decide the fate of a failed attempt.
    ///
    /// Records the error, then walks the ladder: unrecoverable errors and
    /// exhausted attempt budgets fail immediately; a crossed error-rate
    /// threshold fails unless a fallback is still available; otherwise the
    /// fallback chain advances, and only once it is empty does the retry
    /// policy's delay apply.
    pub fn decide(
        &self,
        task: &Task,
        error: &ExecutionError,
        executor: &str,
        fallbacks: &mut VecDeque<Arc<dyn Executor>>,
    ) -> RecoveryDecision {
        let kind = error.kind();
        self.monitor.record(ErrorRecord::new(
            kind,
            task.id,
            Some(executor.to_string()),
            error.to_string(),
        ));

        if kind == ErrorKind::Unrecoverable {
            warn!(task = %task.id, %executor, "unrecoverable failure");
            return RecoveryDecision::Fail;
        }

        if task.attempt >= self.max_attempts {
            warn!(
                task = %task.id,
                attempt = task.attempt,
                max = self.max_attempts,
                "attempt budget exhausted"
            );
            return RecoveryDecision::Fail;
        }

        if self.monitor.is_over_threshold(kind) && fallbacks.is_empty() {
            warn!(task = %task.id, %kind, "error rate over threshold with no fallback");
            return RecoveryDecision::Fail;
        }

        if let Some(fallback) = fallbacks.pop_front() {
            debug!(task = %task.id, fallback = fallback.name(), "advancing fallback chain");
            return RecoveryDecision::UseFallback(fallback);
        }

        let delay = self
            .policy
            .read()
            .expect("retry policy poisoned")
            .delay_for(task.attempt);
        debug!(task = %task.id, ?delay, attempt = task.attempt, "scheduling retry");
        RecoveryDecision::RetryAfter(delay)
    }
}
