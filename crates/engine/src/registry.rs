//! Executor registration and capability-based routing.

use std::collections::{BTreeSet, VecDeque};
use std::sync::{Arc, RwLock};

use tracing::debug;

use crate::executor::Executor;
use crate::metrics::MetricsCollector;

/// Errors raised while registering executors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RegistryError {
    /// A fallback was registered for a tag with no primary executor.
    #[error("no primary executor registered for tag '{0}'")]
    UnknownTag(String),
}

/// Error raised when no registration can satisfy a task's requirements.
///
/// This is a routing-time condition, not an execution failure: the task
/// fails immediately without consuming an attempt or entering retry policy.
#[derive(Debug, Clone, thiserror::Error)]
#[error("no capable executor for capabilities {required:?}")]
pub struct NoCapableExecutor {
    /// The capability set nothing could satisfy
    pub required: BTreeSet<String>,
}

/// The executor chosen for a task plus the rest of its fallback chain.
///
/// The chain is handed to the recovery manager so it can advance through
/// the siblings without re-resolving from scratch.
pub struct Resolved {
    /// The selected primary executor
    pub executor: Arc<dyn Executor>,
    /// Remaining fallbacks, in registration order
    pub fallbacks: VecDeque<Arc<dyn Executor>>,
}

impl std::fmt::Debug for Resolved {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resolved")
            .field("executor", &self.executor.name())
            .field(
                "fallbacks",
                &self.fallbacks.iter().map(|e| e.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

struct Registration {
    tag: String,
    primary: Arc<dyn Executor>,
    fallbacks: Vec<Arc<dyn Executor>>,
}

/// Maps capability tags to executors with ordered fallback chains.
///
/// Read-mostly: resolution takes a read lock; registration is
/// administrative and rare.
#[derive(Default)]
pub struct ExecutorRegistry {
    entries: RwLock<Vec<Registration>>,
}

impl ExecutorRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the primary executor for a capability tag. Registering the
    /// same tag again replaces the primary and keeps its fallbacks.
    pub fn register(&self, tag: impl Into<String>, executor: Arc<dyn Executor>) {
        let tag = tag.into();
        let mut entries = self.entries.write().expect("registry poisoned");
        if let Some(entry) = entries.iter_mut().find(|e| e.tag == tag) {
            entry.primary = executor;
        } else {
            debug!(%tag, executor = executor.name(), "executor registered");
            entries.push(Registration {
                tag,
                primary: executor,
                fallbacks: Vec::new(),
            });
        }
    }

    /// Append a fallback executor to a tag's ordered chain.
    pub fn register_fallback(
        &self,
        tag: &str,
        executor: Arc<dyn Executor>,
    ) -> Result<(), RegistryError> {
        let mut entries = self.entries.write().expect("registry poisoned");
        let entry = entries
            .iter_mut()
            .find(|e| e.tag == tag)
            .ok_or_else(|| RegistryError::UnknownTag(tag.to_string()))?;
        debug!(%tag, executor = executor.name(), "fallback registered");
        entry.fallbacks.push(executor);
        Ok(())
    }

    /// Remove a tag's registration entirely. Returns whether it existed.
    pub fn deregister(&self, tag: &str) -> bool {
        let mut entries = self.entries.write().expect("registry poisoned");
        let before = entries.len();
        entries.retain(|e| e.tag != tag);
        entries.len() != before
    }

    /// Select an executor for the required capability set.
    ///
    /// Candidates are primaries whose advertised capabilities are a
    /// superset of `required`. Among several, the highest current success
    /// rate wins; ties keep the earliest registration.
    pub fn resolve(
        &self,
        required: &BTreeSet<String>,
        metrics: &MetricsCollector,
    ) -> Result<Resolved, NoCapableExecutor> {
        let entries = self.entries.read().expect("registry poisoned");

        let mut best: Option<(&Registration, f64)> = None;
        for entry in entries.iter() {
            if !required
                .iter()
                .all(|cap| entry.primary.capabilities().contains(cap))
            {
                continue;
            }
            let rate = metrics.success_rate(entry.primary.name());
            match best {
                Some((_, best_rate)) if rate <= best_rate => {}
                _ => best = Some((entry, rate)),
            }
        }

        let (entry, rate) = best.ok_or_else(|| NoCapableExecutor {
            required: required.clone(),
        })?;
        debug!(
            tag = %entry.tag,
            executor = entry.primary.name(),
            success_rate = rate,
            "executor resolved"
        );
        Ok(Resolved {
            executor: Arc::clone(&entry.primary),
            fallbacks: entry.fallbacks.iter().map(Arc::clone).collect(),
        })
    }

    /// Registered tags, in registration order.
    pub fn tags(&self) -> Vec<String> {
        self.entries
            .read()
            .expect("registry poisoned")
            .iter()
            .map(|e| e.tag.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{ExecutionContext, ExecutionError};
    use async_trait::async_trait;
    use std::time::Duration;

    struct StubExecutor {
        name: String,
        capabilities: BTreeSet<String>,
    }

    impl StubExecutor {
        fn new(name: &str, caps: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                capabilities: caps.iter().map(|c| c.to_string()).collect(),
            })
        }
    }

    #[async_trait]
    impl Executor for StubExecutor {
        fn name(&self) -> &str {
            &self.name
        }

        fn capabilities(&self) -> &BTreeSet<String> {
            &self.capabilities
        }

        async fn execute(&self, _ctx: ExecutionContext) -> Result<String, ExecutionError> {
            Ok("done".into())
        }
    }

    fn required(caps: &[&str]) -> BTreeSet<String> {
        caps.iter().map(|c| c.to_string()).collect()
    }

    #[test]
    fn resolve_requires_capability_superset() {
        let registry = ExecutorRegistry::new();
        let metrics = MetricsCollector::new();
        registry.register("research", StubExecutor::new("researcher", &["search", "summarize"]));

        assert!(registry.resolve(&required(&["search"]), &metrics).is_ok());
        assert!(registry
            .resolve(&required(&["search", "summarize"]), &metrics)
            .is_ok());

        let err = registry
            .resolve(&required(&["search", "code"]), &metrics)
            .unwrap_err();
        assert!(err.required.contains("code"));
    }

    #[test]
    fn higher_success_rate_wins() {
        let registry = ExecutorRegistry::new();
        let metrics = MetricsCollector::new();
        registry.register("a", StubExecutor::new("flaky", &["work"]));
        registry.register("b", StubExecutor::new("steady", &["work"]));

        metrics.record_failure("flaky", Duration::from_millis(10));
        metrics.record_success("steady", Duration::from_millis(10));

        let resolved = registry.resolve(&required(&["work"]), &metrics).unwrap();
        assert_eq!(resolved.executor.name(), "steady");
    }

    #[test]
    fn ties_break_by_registration_order() {
        let registry = ExecutorRegistry::new();
        let metrics = MetricsCollector::new();
        registry.register("a", StubExecutor::new("first", &["work"]));
        registry.register("b", StubExecutor::new("second", &["work"]));

        let resolved = registry.resolve(&required(&["work"]), &metrics).unwrap();
        assert_eq!(resolved.executor.name(), "first");
    }

    #[test]
    fn fallback_chain_returned_in_order() {
        let registry = ExecutorRegistry::new();
        let metrics = MetricsCollector::new();
        registry.register("work", StubExecutor::new("primary", &["work"]));
        registry
            .register_fallback("work", StubExecutor::new("backup-1", &["work"]))
            .unwrap();
        registry
            .register_fallback("work", StubExecutor::new("backup-2", &["work"]))
            .unwrap();

        let mut resolved = registry.resolve(&required(&["work"]), &metrics).unwrap();
        assert_eq!(resolved.executor.name(), "primary");
        assert_eq!(resolved.fallbacks.pop_front().unwrap().name(), "backup-1");
        assert_eq!(resolved.fallbacks.pop_front().unwrap().name(), "backup-2");
        assert!(resolved.fallbacks.is_empty());
    }

    #[test]
    fn fallback_for_unknown_tag_rejected() {
        let registry = ExecutorRegistry::new();
        let err = registry
            .register_fallback("ghost", StubExecutor::new("x", &["work"]))
            .unwrap_err();
        assert!(matches!(err, RegistryError::UnknownTag(tag) if tag == "ghost"));
    }

    #[test]
    fn deregistration_removes_tag() {
        let registry = ExecutorRegistry::new();
        let metrics = MetricsCollector::new();
        registry.register("work", StubExecutor::new("primary", &["work"]));

        assert!(registry.deregister("work"));
        assert!(!registry.deregister("work"));
        assert!(registry.resolve(&required(&["work"]), &metrics).is_err());
    }
}
