//! The scheduler: one coordinating control loop plus bounded workers.
//!
//! The coordinator polls the graph for eligible tasks, dispatches them to
//! spawned workers up to the configured capacity, and applies outcomes as
//! they arrive over the event channel. Workers block only inside the
//! executor invocation (bounded by the per-task timeout); retry delays are
//! scheduled re-insertions, never a worker held asleep.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use cherry_core::{Checkpoint, Task, TaskFilter, TaskId, TaskSpec, TaskStatus};
use cherry_storage::CheckpointStore;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::executor::{ErrorKind, ExecutionContext, ExecutionError, Executor};
use crate::graph::{GraphError, TaskGraph};
use crate::metrics::MetricsCollector;
use crate::monitor::ErrorMonitor;
use crate::recovery::{RecoveryDecision, RecoveryManager};
use crate::registry::{ExecutorRegistry, RegistryError};
use crate::retry::RetryPolicy;

/// Errors surfaced by scheduler operations.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// Graph mutation failed
    #[error(transparent)]
    Graph(#[from] GraphError),

    /// Checkpoint persistence failed
    #[error(transparent)]
    Storage(#[from] cherry_storage::StorageError),

    /// Executor registration failed
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// A checkpoint operation was requested without a configured store
    #[error("no checkpoint store configured")]
    NoCheckpointStore,
}

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Cap on simultaneously running tasks
    pub max_concurrent_tasks: usize,
    /// Upper bound on a single executor invocation
    pub task_timeout: Duration,
    /// Cap on attempts per task
    pub max_attempts: u32,
    /// Write a checkpoint on this interval while running
    pub checkpoint_interval: Option<Duration>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 4,
            task_timeout: Duration::from_secs(300),
            max_attempts: RecoveryManager::DEFAULT_MAX_ATTEMPTS,
            checkpoint_interval: None,
        }
    }
}

impl SchedulerConfig {
    /// Create the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the concurrency cap.
    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent_tasks = max.max(1);
        self
    }

    /// Set the per-task timeout.
    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = timeout;
        self
    }

    /// Set the attempt cap.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Enable periodic checkpointing.
    pub fn with_checkpoint_interval(mut self, interval: Duration) -> Self {
        self.checkpoint_interval = Some(interval);
        self
    }
}

/// Engine health, for the health endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    /// No error kind is over its threshold
    Healthy,
    /// At least one error kind is over its threshold
    Degraded,
}

/// Health report consumed by external reporting layers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    /// Overall status
    pub status: HealthStatus,
    /// Rolling error counts per kind
    pub errors: std::collections::BTreeMap<ErrorKind, usize>,
    /// Tasks currently running
    pub active_tasks: usize,
}

/// Terminal tallies after a run.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct RunSummary {
    /// Tasks that completed
    pub completed: usize,
    /// Tasks that failed permanently
    pub failed: usize,
    /// Tasks cancelled directly or through a prerequisite
    pub cancelled: usize,
}

/// Routing state for one task across its attempts: the primary chosen at
/// first resolve, the remaining fallback chain, and the executor the next
/// attempt will use.
struct Route {
    primary: Arc<dyn Executor>,
    fallbacks: VecDeque<Arc<dyn Executor>>,
    next: Arc<dyn Executor>,
}

enum Event {
    /// Wake the loop to dispatch or re-check idleness
    Poke,
    /// A retry delay elapsed
    RetryDue(TaskId),
    /// A worker finished an attempt
    Finished {
        task_id: TaskId,
        executor: String,
        outcome: Result<String, ExecutionError>,
        elapsed: Duration,
    },
}

/// The orchestration scheduler.
///
/// Construct one per process, register executors, submit tasks, then
/// `run()` until the graph settles. Submission, queries, cancellation, and
/// the admin surface take `&self` and are safe to call while `run()` is in
/// flight.
pub struct Scheduler {
    config: SchedulerConfig,
    graph: Mutex<TaskGraph>,
    registry: Arc<ExecutorRegistry>,
    metrics: Arc<MetricsCollector>,
    monitor: Arc<ErrorMonitor>,
    recovery: RecoveryManager,
    store: Option<Arc<dyn CheckpointStore>>,
    routes: Mutex<HashMap<TaskId, Route>>,
    running: Mutex<HashMap<TaskId, watch::Sender<bool>>>,
    pending_retries: AtomicUsize,
    events_tx: mpsc::UnboundedSender<Event>,
    events_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Event>>,
    stop_tx: watch::Sender<bool>,
}

impl Scheduler {
    /// Create a scheduler with its own registry, metrics, and monitor.
    pub fn new(config: SchedulerConfig) -> Self {
        let monitor = Arc::new(ErrorMonitor::new());
        let recovery =
            RecoveryManager::new(Arc::clone(&monitor)).with_max_attempts(config.max_attempts);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (stop_tx, _) = watch::channel(false);

        Self {
            config,
            graph: Mutex::new(TaskGraph::new()),
            registry: Arc::new(ExecutorRegistry::new()),
            metrics: Arc::new(MetricsCollector::new()),
            monitor,
            recovery,
            store: None,
            routes: Mutex::new(HashMap::new()),
            running: Mutex::new(HashMap::new()),
            pending_retries: AtomicUsize::new(0),
            events_tx,
            events_rx: tokio::sync::Mutex::new(events_rx),
            stop_tx,
        }
    }

    /// Attach a checkpoint store.
    pub fn with_checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the initial retry policy.
    pub fn with_retry_policy(self, policy: RetryPolicy) -> Self {
        self.recovery.set_policy(policy);
        self
    }

    // === Submission API ===

    /// Submit a task. Fails synchronously on unknown prerequisites or a
    /// prerequisite cycle.
    pub fn submit(&self, spec: TaskSpec) -> Result<TaskId, GraphError> {
        let id = self.graph.lock().expect("graph poisoned").insert(spec)?;
        info!(task = %id, "task submitted");
        let _ = self.events_tx.send(Event::Poke);
        Ok(id)
    }

    /// Cancel a task and, transitively, its dependents. Running tasks get
    /// their cancellation signal flipped; their executors are expected to
    /// return promptly but are not force-killed.
    pub fn cancel(&self, id: TaskId) -> Result<(), GraphError> {
        let cancelled = self
            .graph
            .lock()
            .expect("graph poisoned")
            .cancel(id, "cancelled by caller")?;

        let running = self.running.lock().expect("running poisoned");
        for task_id in &cancelled {
            if let Some(signal) = running.get(task_id) {
                let _ = signal.send(true);
            }
        }
        drop(running);

        if !cancelled.is_empty() {
            info!(task = %id, cascade = cancelled.len(), "cancelled");
        }
        let _ = self.events_tx.send(Event::Poke);
        Ok(())
    }

    // === Query API ===

    /// Look up one task.
    pub fn task(&self, id: TaskId) -> Option<Task> {
        self.graph.lock().expect("graph poisoned").task(id).cloned()
    }

    /// List tasks matching a filter.
    pub fn tasks(&self, filter: &TaskFilter) -> Vec<Task> {
        self.graph.lock().expect("graph poisoned").tasks(filter)
    }

    // === Administrative API ===

    /// Register an executor for a capability tag, as primary or fallback.
    pub fn register_executor(
        &self,
        tag: &str,
        executor: Arc<dyn Executor>,
        as_fallback: bool,
    ) -> Result<(), SchedulerError> {
        if as_fallback {
            self.registry.register_fallback(tag, executor)?;
        } else {
            self.registry.register(tag, executor);
        }
        Ok(())
    }

    /// Swap the retry policy.
    pub fn set_retry_policy(&self, policy: RetryPolicy) {
        self.recovery.set_policy(policy);
    }

    /// Set the rolling error threshold for a kind.
    pub fn set_error_threshold(&self, kind: ErrorKind, n: usize) {
        self.monitor.set_threshold(kind, n);
    }

    /// Current health: degraded whenever any error kind is over threshold.
    pub fn health_report(&self) -> HealthReport {
        let errors = self.monitor.summary();
        let degraded = errors
            .keys()
            .any(|&kind| self.monitor.is_over_threshold(kind));
        HealthReport {
            status: if degraded {
                HealthStatus::Degraded
            } else {
                HealthStatus::Healthy
            },
            errors,
            active_tasks: self.graph.lock().expect("graph poisoned").active_count(),
        }
    }

    /// Shared executor registry.
    pub fn registry(&self) -> &Arc<ExecutorRegistry> {
        &self.registry
    }

    /// Shared metrics collector.
    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    /// Request the run loop to stop after the current event.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    // === Checkpointing ===

    /// Write a checkpoint now.
    pub async fn checkpoint(&self) -> Result<(), SchedulerError> {
        let store = self.store.as_ref().ok_or(SchedulerError::NoCheckpointStore)?;
        // Clone out under the lock, serialize without it.
        let snapshot = self.graph.lock().expect("graph poisoned").snapshot();
        let checkpoint = Checkpoint {
            created_at: chrono::Utc::now(),
            tasks: snapshot.tasks,
            edges: snapshot.edges,
            metrics: self.metrics.snapshot(),
        };
        store.save(&checkpoint).await?;
        Ok(())
    }

    /// Load the latest checkpoint, replacing graph and metrics state.
    /// Tasks that were running when the checkpoint was taken are re-queued
    /// as eligible. Returns whether a checkpoint was found.
    pub async fn restore(&self) -> Result<bool, SchedulerError> {
        let store = self.store.as_ref().ok_or(SchedulerError::NoCheckpointStore)?;
        let Some(checkpoint) = store.load().await? else {
            return Ok(false);
        };
        let graph = TaskGraph::from_snapshot(cherry_core::GraphSnapshot {
            tasks: checkpoint.tasks,
            edges: checkpoint.edges,
        })?;
        *self.graph.lock().expect("graph poisoned") = graph;
        self.metrics.restore(checkpoint.metrics);
        info!("state restored from checkpoint");
        Ok(true)
    }

    // === Control loop ===

    /// Run until no pending, eligible, or running tasks remain (and no
    /// retries are scheduled), or until `stop()` is called. A single task
    /// failure never aborts the loop; failures stay local to that task's
    /// subgraph.
    pub async fn run(&self) -> Result<RunSummary, SchedulerError> {
        let mut events = self.events_rx.lock().await;
        let mut stop_rx = self.stop_tx.subscribe();
        let mut ticker = self
            .config
            .checkpoint_interval
            .map(tokio::time::interval);
        if let Some(t) = ticker.as_mut() {
            // The first tick of a tokio interval fires immediately.
            t.tick().await;
        }

        loop {
            if *stop_rx.borrow_and_update() {
                info!("scheduler stop requested");
                break;
            }
            self.dispatch_ready();
            if self.is_idle() {
                break;
            }

            tokio::select! {
                Some(event) = events.recv() => self.handle_event(event),
                _ = tick(&mut ticker) => {
                    if let Err(e) = self.checkpoint().await {
                        error!(error = %e, "periodic checkpoint failed");
                    }
                }
                _ = stop_rx.changed() => {
                    info!("scheduler stop requested");
                    break;
                }
            }
        }

        if self.store.is_some() {
            self.checkpoint().await?;
        }

        let summary = self.summary();
        info!(
            completed = summary.completed,
            failed = summary.failed,
            cancelled = summary.cancelled,
            "run finished"
        );
        Ok(summary)
    }

    /// Terminal tallies so far.
    pub fn summary(&self) -> RunSummary {
        let graph = self.graph.lock().expect("graph poisoned");
        RunSummary {
            completed: graph.count_status(TaskStatus::Completed),
            failed: graph.count_status(TaskStatus::Failed),
            cancelled: graph.count_status(TaskStatus::Cancelled),
        }
    }

    fn is_idle(&self) -> bool {
        self.pending_retries.load(Ordering::SeqCst) == 0
            && self.running.lock().expect("running poisoned").is_empty()
            && self.graph.lock().expect("graph poisoned").is_settled()
    }

    /// Dispatch eligible tasks until capacity is exhausted or none remain.
    fn dispatch_ready(&self) {
        loop {
            if self.running.lock().expect("running poisoned").len()
                >= self.config.max_concurrent_tasks
            {
                return;
            }

            let Some(task) = self
                .graph
                .lock()
                .expect("graph poisoned")
                .eligible_tasks()
                .first()
                .map(|t| (*t).clone())
            else {
                return;
            };

            match self.route_for(&task) {
                Ok(executor) => self.spawn_worker(task.id, executor),
                Err(err) => {
                    // Routing failure is non-retryable and consumes no attempt.
                    warn!(task = %task.id, error = %err, "no capable executor");
                    if let Err(e) = self
                        .graph
                        .lock()
                        .expect("graph poisoned")
                        .mark_failed(task.id, err.to_string())
                    {
                        error!(task = %task.id, error = %e, "failed to mark task failed");
                    }
                }
            }
        }
    }

    /// The executor for a task's next attempt: the stored route if one
    /// exists, otherwise a fresh registry resolution.
    fn route_for(
        &self,
        task: &Task,
    ) -> Result<Arc<dyn Executor>, crate::registry::NoCapableExecutor> {
        let mut routes = self.routes.lock().expect("routes poisoned");
        if let Some(route) = routes.get(&task.id) {
            return Ok(Arc::clone(&route.next));
        }
        let resolved = self
            .registry
            .resolve(&task.required_capabilities, &self.metrics)?;
        let next = Arc::clone(&resolved.executor);
        routes.insert(
            task.id,
            Route {
                primary: resolved.executor,
                fallbacks: resolved.fallbacks,
                next: Arc::clone(&next),
            },
        );
        Ok(next)
    }

    fn spawn_worker(&self, task_id: TaskId, executor: Arc<dyn Executor>) {
        if let Err(e) = self
            .graph
            .lock()
            .expect("graph poisoned")
            .mark_running(task_id)
        {
            error!(task = %task_id, error = %e, "dispatch aborted");
            return;
        }
        let task = self
            .graph
            .lock()
            .expect("graph poisoned")
            .task(task_id)
            .cloned()
            .expect("just marked running");

        let (cancel_tx, cancel_rx) = watch::channel(false);
        self.running
            .lock()
            .expect("running poisoned")
            .insert(task_id, cancel_tx);

        let name = executor.name().to_string();
        let attempt = task.attempt;
        let ctx = ExecutionContext::new(task, attempt, cancel_rx);
        let timeout = self.config.task_timeout;
        let tx = self.events_tx.clone();

        debug!(task = %task_id, executor = %name, attempt, "dispatching");
        tokio::spawn(async move {
            let started = Instant::now();
            let outcome = match tokio::time::timeout(timeout, executor.execute(ctx)).await {
                Ok(result) => result,
                Err(_) => Err(ExecutionError::Timeout { timeout }),
            };
            let _ = tx.send(Event::Finished {
                task_id,
                executor: name,
                outcome,
                elapsed: started.elapsed(),
            });
        });
    }

    fn handle_event(&self, event: Event) {
        match event {
            Event::Poke => {}
            Event::RetryDue(task_id) => {
                self.pending_retries.fetch_sub(1, Ordering::SeqCst);
                let mut graph = self.graph.lock().expect("graph poisoned");
                match graph.task(task_id).map(|t| t.status) {
                    Some(TaskStatus::Running) => {
                        if let Err(e) = graph.requeue(task_id) {
                            error!(task = %task_id, error = %e, "retry re-queue failed");
                        }
                    }
                    _ => {
                        // Cancelled (or gone) while waiting out the delay.
                        drop(graph);
                        self.routes.lock().expect("routes poisoned").remove(&task_id);
                    }
                }
            }
            Event::Finished {
                task_id,
                executor,
                outcome,
                elapsed,
            } => self.apply_outcome(task_id, &executor, outcome, elapsed),
        }
    }

    fn apply_outcome(
        &self,
        task_id: TaskId,
        executor: &str,
        outcome: Result<String, ExecutionError>,
        elapsed: Duration,
    ) {
        self.running
            .lock()
            .expect("running poisoned")
            .remove(&task_id);

        let status = self
            .graph
            .lock()
            .expect("graph poisoned")
            .task(task_id)
            .map(|t| t.status);
        if status != Some(TaskStatus::Running) {
            // Cancelled mid-flight; the outcome no longer matters.
            debug!(task = %task_id, "discarding outcome of cancelled task");
            self.routes.lock().expect("routes poisoned").remove(&task_id);
            return;
        }

        match outcome {
            Ok(result) => {
                self.metrics.record_success(executor, elapsed);
                self.routes.lock().expect("routes poisoned").remove(&task_id);
                if let Err(e) = self
                    .graph
                    .lock()
                    .expect("graph poisoned")
                    .mark_completed(task_id, result)
                {
                    error!(task = %task_id, error = %e, "completion transition failed");
                } else {
                    info!(task = %task_id, executor, ?elapsed, "task completed");
                }
            }
            Err(error) => {
                self.metrics.record_failure(executor, elapsed);
                let task = self
                    .graph
                    .lock()
                    .expect("graph poisoned")
                    .task(task_id)
                    .cloned()
                    .expect("status checked above");
                warn!(
                    task = %task_id,
                    executor,
                    attempt = task.attempt,
                    error = %error,
                    "attempt failed"
                );
                self.recover(task, &error, executor);
            }
        }
    }

    fn recover(&self, task: Task, error: &ExecutionError, executor: &str) {
        let task_id = task.id;
        let decision = {
            let mut routes = self.routes.lock().expect("routes poisoned");
            let Some(route) = routes.get_mut(&task_id) else {
                error!(task = %task_id, "no route for failed task");
                return;
            };
            let decision = self
                .recovery
                .decide(&task, error, executor, &mut route.fallbacks);
            match &decision {
                RecoveryDecision::UseFallback(fallback) => {
                    route.next = Arc::clone(fallback);
                }
                RecoveryDecision::RetryAfter(_) => {
                    route.next = Arc::clone(&route.primary);
                }
                RecoveryDecision::Fail => {
                    routes.remove(&task_id);
                }
            }
            decision
        };

        match decision {
            RecoveryDecision::UseFallback(_) => {
                // No delay: a different executor gets the very next attempt.
                if let Err(e) = self.graph.lock().expect("graph poisoned").requeue(task_id) {
                    error!(task = %task_id, error = %e, "fallback re-queue failed");
                }
            }
            RecoveryDecision::RetryAfter(delay) => {
                self.pending_retries.fetch_add(1, Ordering::SeqCst);
                let tx = self.events_tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = tx.send(Event::RetryDue(task_id));
                });
            }
            RecoveryDecision::Fail => {
                if let Err(e) = self
                    .graph
                    .lock()
                    .expect("graph poisoned")
                    .mark_failed(task_id, error.to_string())
                {
                    error!(task = %task_id, error = %e, "failure transition failed");
                }
            }
        }
    }
}

async fn tick(ticker: &mut Option<tokio::time::Interval>) {
    match ticker {
        Some(t) => {
            t.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
