//! Per-executor execution statistics.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use cherry_core::{ExecutorStats, MetricsSnapshot};

/// Collects attempt outcomes per executor.
///
/// Mutation is serialized behind one lock; readers get clones. The registry
/// consults `success_rate` when ranking candidate executors, so persistently
/// failing primaries naturally lose resolve priority.
pub struct MetricsCollector {
    stats: RwLock<HashMap<String, ExecutorStats>>,
}

impl MetricsCollector {
    /// Create an empty collector.
    pub fn new() -> Self {
        Self {
            stats: RwLock::new(HashMap::new()),
        }
    }

    /// Record a successful attempt against the executor actually used.
    pub fn record_success(&self, executor: &str, elapsed: Duration) {
        let mut stats = self.stats.write().expect("metrics poisoned");
        let entry = stats.entry(executor.to_string()).or_default();
        entry.attempts += 1;
        entry.successes += 1;
        entry.total_duration_ms += elapsed.as_millis() as u64;
    }

    /// Record a failed attempt against the executor actually used.
    pub fn record_failure(&self, executor: &str, elapsed: Duration) {
        let mut stats = self.stats.write().expect("metrics poisoned");
        let entry = stats.entry(executor.to_string()).or_default();
        entry.attempts += 1;
        entry.failures += 1;
        entry.total_duration_ms += elapsed.as_millis() as u64;
    }

    /// Stats for one executor, if any attempts were recorded.
    pub fn stats(&self, executor: &str) -> Option<ExecutorStats> {
        self.stats
            .read()
            .expect("metrics poisoned")
            .get(executor)
            .copied()
    }

    /// Success rate for an executor; 1.0 when unobserved.
    pub fn success_rate(&self, executor: &str) -> f64 {
        self.stats(executor).map_or(1.0, |s| s.success_rate())
    }

    /// Clone out all stats for checkpointing or reporting.
    pub fn snapshot(&self) -> MetricsSnapshot {
        self.stats
            .read()
            .expect("metrics poisoned")
            .iter()
            .map(|(name, stats)| (name.clone(), *stats))
            .collect()
    }

    /// Replace all stats from a checkpoint.
    pub fn restore(&self, snapshot: MetricsSnapshot) {
        let mut stats = self.stats.write().expect("metrics poisoned");
        *stats = snapshot.into_iter().collect();
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}
