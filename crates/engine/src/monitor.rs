//! Error-rate monitoring.
//!
//! The monitor only detects; what to do when a threshold is crossed is the
//! recovery manager's and the scheduler's decision, which keeps detection
//! and policy separately testable.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use cherry_core::{TaskId, Time};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::executor::ErrorKind;

/// One recorded execution failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// Failure classification
    pub kind: ErrorKind,
    /// The task whose attempt failed
    pub task_id: TaskId,
    /// The executor that raised the failure, when known
    pub executor: Option<String>,
    /// When the failure was recorded
    pub timestamp: Time,
    /// Human-readable detail
    pub message: String,
}

impl ErrorRecord {
    /// Build a record stamped with the current time.
    pub fn new(
        kind: ErrorKind,
        task_id: TaskId,
        executor: Option<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            task_id,
            executor,
            timestamp: chrono::Utc::now(),
            message: message.into(),
        }
    }
}

/// Rolling per-kind failure counters with configurable thresholds.
///
/// Memory is bounded two ways: a ring-buffer capacity on raw records and a
/// time window outside which records are pruned.
pub struct ErrorMonitor {
    inner: Mutex<Inner>,
    capacity: usize,
    window: chrono::Duration,
}

struct Inner {
    records: VecDeque<ErrorRecord>,
    thresholds: HashMap<ErrorKind, usize>,
}

impl ErrorMonitor {
    /// Default ring capacity.
    pub const DEFAULT_CAPACITY: usize = 1024;

    /// Default rolling window.
    pub const DEFAULT_WINDOW: Duration = Duration::from_secs(15 * 60);

    /// Create a monitor with the default capacity and window.
    pub fn new() -> Self {
        Self::with_bounds(Self::DEFAULT_CAPACITY, Self::DEFAULT_WINDOW)
    }

    /// Create a monitor with explicit bounds.
    pub fn with_bounds(capacity: usize, window: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                records: VecDeque::with_capacity(capacity.min(64)),
                thresholds: HashMap::new(),
            }),
            capacity: capacity.max(1),
            window: chrono::Duration::from_std(window)
                .unwrap_or_else(|_| chrono::Duration::seconds(15 * 60)),
        }
    }

    /// Set the rolling-count threshold for an error kind.
    pub fn set_threshold(&self, kind: ErrorKind, n: usize) {
        let mut inner = self.inner.lock().expect("error monitor poisoned");
        inner.thresholds.insert(kind, n);
    }

    /// Append a failure record.
    pub fn record(&self, record: ErrorRecord) {
        let mut inner = self.inner.lock().expect("error monitor poisoned");
        inner.records.push_back(record);
        while inner.records.len() > self.capacity {
            inner.records.pop_front();
        }
        self.prune(&mut inner);

        let kind = inner.records.back().map(|r| r.kind);
        if let Some(kind) = kind {
            let count = inner.records.iter().filter(|r| r.kind == kind).count();
            if let Some(&threshold) = inner.thresholds.get(&kind) {
                if count >= threshold {
                    warn!(%kind, count, threshold, "error threshold reached");
                }
            }
        }
    }

    /// Failures of `kind` within the current window.
    pub fn count(&self, kind: ErrorKind) -> usize {
        let mut inner = self.inner.lock().expect("error monitor poisoned");
        self.prune(&mut inner);
        inner.records.iter().filter(|r| r.kind == kind).count()
    }

    /// Whether the rolling count for `kind` has reached its threshold.
    /// Always false for kinds without a configured threshold.
    pub fn is_over_threshold(&self, kind: ErrorKind) -> bool {
        let mut inner = self.inner.lock().expect("error monitor poisoned");
        self.prune(&mut inner);
        match inner.thresholds.get(&kind) {
            Some(&threshold) => {
                inner.records.iter().filter(|r| r.kind == kind).count() >= threshold
            }
            None => false,
        }
    }

    /// Per-kind counts within the current window, for health reporting.
    pub fn summary(&self) -> BTreeMap<ErrorKind, usize> {
        let mut inner = self.inner.lock().expect("error monitor poisoned");
        self.prune(&mut inner);
        let mut summary = BTreeMap::new();
        for record in &inner.records {
            *summary.entry(record.kind).or_insert(0) += 1;
        }
        summary
    }

    fn prune(&self, inner: &mut Inner) {
        let cutoff = chrono::Utc::now() - self.window;
        while let Some(front) = inner.records.front() {
            if front.timestamp < cutoff {
                inner.records.pop_front();
            } else {
                break;
            }
        }
    }
}

impl Default for ErrorMonitor {
    fn default() -> Self {
        Self::new()
    }
}
