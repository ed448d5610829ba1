//! Dependency-aware task graph.
//!
//! The graph owns every task and the prerequisite→dependent edge index. It
//! is deliberately not locked internally: the scheduler serializes all
//! access behind a single mutex, and every mutation goes through graph
//! methods so the acyclicity invariant holds continuously, not just at
//! submission time.

use std::collections::{HashMap, HashSet};

use cherry_core::{Edge, GraphSnapshot, Task, TaskFilter, TaskId, TaskSpec, TaskStatus};
use tracing::debug;

/// Errors raised by graph mutations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum GraphError {
    /// Adding the requested edges would create a prerequisite cycle.
    #[error("prerequisite cycle through {path:?}")]
    CycleDetected {
        /// The tasks along the offending cycle
        path: Vec<TaskId>,
    },

    /// A listed prerequisite id does not exist in the graph.
    #[error("unknown prerequisite task {0}")]
    UnknownPrerequisite(TaskId),

    /// The referenced task does not exist.
    #[error("task {0} not found")]
    NotFound(TaskId),

    /// The task is not in a state that permits the requested transition.
    #[error("task {id} cannot transition from {status}")]
    InvalidTransition {
        /// The task whose transition was rejected
        id: TaskId,
        /// Its current status
        status: TaskStatus,
    },
}

/// The task graph.
#[derive(Debug, Default)]
pub struct TaskGraph {
    tasks: HashMap<TaskId, Task>,
    /// prerequisite -> tasks that depend on it
    dependents: HashMap<TaskId, Vec<TaskId>>,
    next_seq: u64,
}

impl TaskGraph {
    /// Create an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Submit a new task.
    ///
    /// Fails with `UnknownPrerequisite` if any listed prerequisite does not
    /// exist and with `CycleDetected` if the new edges would close a cycle;
    /// in both cases the graph is left unchanged. The task starts `Pending`
    /// and is promoted to `Eligible` immediately when every prerequisite is
    /// already `Completed` (or it has none).
    pub fn insert(&mut self, spec: TaskSpec) -> Result<TaskId, GraphError> {
        let mut task = Task::new(spec);
        let id = task.id;

        for prereq in &task.prerequisites {
            if *prereq == id {
                return Err(GraphError::CycleDetected { path: vec![id] });
            }
            if !self.tasks.contains_key(prereq) {
                return Err(GraphError::UnknownPrerequisite(*prereq));
            }
            // A fresh id has no dependents, so the only way these edges
            // could close a cycle is through the id itself.
            if let Some(mut path) = self.prerequisite_path(*prereq, id) {
                path.push(id);
                return Err(GraphError::CycleDetected { path });
            }
        }

        task.seq = self.next_seq;
        self.next_seq += 1;

        for prereq in task.prerequisites.clone() {
            self.dependents.entry(prereq).or_default().push(id);
        }

        self.tasks.insert(id, task);
        self.promote_if_ready(id);
        debug!(task = %id, "task inserted");
        Ok(id)
    }

    /// Add a prerequisite edge between two existing tasks.
    ///
    /// Rejected with `CycleDetected` when `on` is already reachable from
    /// `task` through prerequisite edges, and with `InvalidTransition` when
    /// either endpoint is terminal or `task` has already been dispatched.
    pub fn add_prerequisite(&mut self, task: TaskId, on: TaskId) -> Result<(), GraphError> {
        if !self.tasks.contains_key(&on) {
            return Err(GraphError::UnknownPrerequisite(on));
        }
        let entry = self.tasks.get(&task).ok_or(GraphError::NotFound(task))?;
        if !matches!(entry.status, TaskStatus::Pending | TaskStatus::Eligible) {
            return Err(GraphError::InvalidTransition {
                id: task,
                status: entry.status,
            });
        }
        if task == on {
            return Err(GraphError::CycleDetected { path: vec![task] });
        }
        if let Some(mut path) = self.prerequisite_path(on, task) {
            path.push(task);
            return Err(GraphError::CycleDetected { path });
        }

        let entry = self.tasks.get_mut(&task).expect("checked above");
        if entry.prerequisites.insert(on) {
            self.dependents.entry(on).or_default().push(task);
        }
        // A previously eligible task may have to wait again.
        self.refresh_eligibility(task);
        Ok(())
    }

    /// Dispatch transition: `Eligible -> Running`. Stamps `started_at` on
    /// the first attempt and increments the attempt counter.
    pub fn mark_running(&mut self, id: TaskId) -> Result<(), GraphError> {
        let task = self.tasks.get_mut(&id).ok_or(GraphError::NotFound(id))?;
        if task.status != TaskStatus::Eligible {
            return Err(GraphError::InvalidTransition {
                id,
                status: task.status,
            });
        }
        task.status = TaskStatus::Running;
        task.attempt += 1;
        if task.started_at.is_none() {
            task.started_at = Some(chrono::Utc::now());
        }
        Ok(())
    }

    /// Terminal success. Re-evaluates direct dependents; each becomes
    /// `Eligible` once all of its prerequisites are `Completed`.
    pub fn mark_completed(
        &mut self,
        id: TaskId,
        result: impl Into<String>,
    ) -> Result<(), GraphError> {
        let task = self.tasks.get_mut(&id).ok_or(GraphError::NotFound(id))?;
        if task.status != TaskStatus::Running {
            return Err(GraphError::InvalidTransition {
                id,
                status: task.status,
            });
        }
        task.status = TaskStatus::Completed;
        task.completed_at = Some(chrono::Utc::now());
        task.result = Some(result.into());

        for dependent in self.dependents.get(&id).cloned().unwrap_or_default() {
            self.promote_if_ready(dependent);
        }
        Ok(())
    }

    /// Terminal failure. Dependents can never become eligible, so they are
    /// transitively cancelled. Returns every task newly cancelled by the
    /// cascade.
    pub fn mark_failed(
        &mut self,
        id: TaskId,
        error: impl Into<String>,
    ) -> Result<Vec<TaskId>, GraphError> {
        let task = self.tasks.get_mut(&id).ok_or(GraphError::NotFound(id))?;
        if !matches!(task.status, TaskStatus::Running | TaskStatus::Eligible) {
            return Err(GraphError::InvalidTransition {
                id,
                status: task.status,
            });
        }
        task.status = TaskStatus::Failed;
        task.completed_at = Some(chrono::Utc::now());
        task.last_error = Some(error.into());

        Ok(self.cancel_dependents(id, "prerequisite failed"))
    }

    /// Retry re-queue: `Running -> Eligible`. The attempt counter keeps its
    /// value; the next dispatch increments it again.
    pub fn requeue(&mut self, id: TaskId) -> Result<(), GraphError> {
        let task = self.tasks.get_mut(&id).ok_or(GraphError::NotFound(id))?;
        if task.status != TaskStatus::Running {
            return Err(GraphError::InvalidTransition {
                id,
                status: task.status,
            });
        }
        task.status = TaskStatus::Eligible;
        Ok(())
    }

    /// Cancel a task and, transitively, everything that depends on it.
    /// Terminal tasks are left untouched (cancel is idempotent). Returns
    /// every task that moved to `Cancelled`, so the scheduler can signal
    /// the ones that were running.
    pub fn cancel(&mut self, id: TaskId, reason: &str) -> Result<Vec<TaskId>, GraphError> {
        let task = self.tasks.get_mut(&id).ok_or(GraphError::NotFound(id))?;
        if task.is_terminal() {
            return Ok(Vec::new());
        }
        task.status = TaskStatus::Cancelled;
        task.completed_at = Some(chrono::Utc::now());
        task.last_error = Some(reason.to_string());

        let mut cancelled = vec![id];
        cancelled.extend(self.cancel_dependents(id, "prerequisite cancelled"));
        Ok(cancelled)
    }

    fn cancel_dependents(&mut self, id: TaskId, reason: &str) -> Vec<TaskId> {
        let mut cancelled = Vec::new();
        let mut stack = self.dependents.get(&id).cloned().unwrap_or_default();
        while let Some(next) = stack.pop() {
            let Some(task) = self.tasks.get_mut(&next) else {
                continue;
            };
            if task.is_terminal() {
                continue;
            }
            task.status = TaskStatus::Cancelled;
            task.completed_at = Some(chrono::Utc::now());
            task.last_error = Some(reason.to_string());
            cancelled.push(next);
            stack.extend(self.dependents.get(&next).cloned().unwrap_or_default());
        }
        cancelled
    }

    /// All `Eligible` tasks ordered by `(priority desc, seq asc)` —
    /// deterministic and starvation-free within a priority band.
    pub fn eligible_tasks(&self) -> Vec<&Task> {
        let mut eligible: Vec<&Task> = self
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Eligible)
            .collect();
        eligible.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.seq.cmp(&b.seq)));
        eligible
    }

    /// Look up one task.
    pub fn task(&self, id: TaskId) -> Option<&Task> {
        self.tasks.get(&id)
    }

    /// All tasks matching the filter, in submission order.
    pub fn tasks(&self, filter: &TaskFilter) -> Vec<Task> {
        let mut matching: Vec<Task> = self
            .tasks
            .values()
            .filter(|t| filter.matches(t))
            .cloned()
            .collect();
        matching.sort_by_key(|t| t.seq);
        matching
    }

    /// Number of tasks currently `Running`.
    pub fn active_count(&self) -> usize {
        self.count_status(TaskStatus::Running)
    }

    /// Number of tasks with the given status.
    pub fn count_status(&self, status: TaskStatus) -> usize {
        self.tasks.values().filter(|t| t.status == status).count()
    }

    /// Whether no `Pending`, `Eligible`, or `Running` tasks remain.
    pub fn is_settled(&self) -> bool {
        self.tasks.values().all(|t| t.is_terminal())
    }

    /// Clone out an immutable view for checkpointing and reporting. The
    /// caller serializes the clone without holding the graph lock.
    pub fn snapshot(&self) -> GraphSnapshot {
        let mut tasks: Vec<Task> = self.tasks.values().cloned().collect();
        tasks.sort_by_key(|t| t.seq);

        let mut edges = Vec::new();
        for task in &tasks {
            for prereq in &task.prerequisites {
                edges.push(Edge {
                    from: *prereq,
                    to: task.id,
                });
            }
        }
        GraphSnapshot { tasks, edges }
    }

    /// Rebuild a graph from a checkpoint snapshot.
    ///
    /// Tasks that were `Running` when the snapshot was taken resume as
    /// `Eligible`: their outcome is unknown, so they are re-attempted
    /// (at-least-once semantics). The tasks' own prerequisite sets are
    /// authoritative; the snapshot is validated for unknown references and
    /// cycles before anything is accepted.
    pub fn from_snapshot(snapshot: GraphSnapshot) -> Result<Self, GraphError> {
        let mut graph = Self::new();
        for mut task in snapshot.tasks {
            if task.status == TaskStatus::Running {
                task.status = TaskStatus::Eligible;
            }
            graph.next_seq = graph.next_seq.max(task.seq + 1);
            graph.tasks.insert(task.id, task);
        }

        let ids: Vec<TaskId> = graph.tasks.keys().copied().collect();
        for id in &ids {
            let prereqs = graph.tasks[id].prerequisites.clone();
            for prereq in prereqs {
                if !graph.tasks.contains_key(&prereq) {
                    return Err(GraphError::UnknownPrerequisite(prereq));
                }
                graph.dependents.entry(prereq).or_default().push(*id);
            }
        }

        graph.validate_acyclic()?;
        Ok(graph)
    }

    /// Promote a `Pending` task to `Eligible` when every prerequisite is
    /// `Completed`.
    fn promote_if_ready(&mut self, id: TaskId) {
        let Some(task) = self.tasks.get(&id) else {
            return;
        };
        if task.status != TaskStatus::Pending {
            return;
        }
        let ready = task
            .prerequisites
            .iter()
            .all(|p| matches!(self.tasks.get(p).map(|t| t.status), Some(TaskStatus::Completed)));
        if ready {
            let task = self.tasks.get_mut(&id).expect("present above");
            task.status = TaskStatus::Eligible;
            debug!(task = %id, "task eligible");
        }
    }

    /// Demote an `Eligible` task back to `Pending` if a new prerequisite is
    /// not yet complete.
    fn refresh_eligibility(&mut self, id: TaskId) {
        let Some(task) = self.tasks.get(&id) else {
            return;
        };
        if task.status != TaskStatus::Eligible {
            return;
        }
        let ready = task
            .prerequisites
            .iter()
            .all(|p| matches!(self.tasks.get(p).map(|t| t.status), Some(TaskStatus::Completed)));
        if !ready {
            let task = self.tasks.get_mut(&id).expect("present above");
            task.status = TaskStatus::Pending;
        }
    }

    /// Iterative DFS along prerequisite edges from `from`, looking for
    /// `target`. Returns the path `[from, ..., target]` when reachable.
    fn prerequisite_path(&self, from: TaskId, target: TaskId) -> Option<Vec<TaskId>> {
        if from == target {
            return Some(vec![from]);
        }
        let mut parent: HashMap<TaskId, TaskId> = HashMap::new();
        let mut visited: HashSet<TaskId> = HashSet::new();
        let mut stack = vec![from];
        visited.insert(from);

        while let Some(node) = stack.pop() {
            let Some(task) = self.tasks.get(&node) else {
                continue;
            };
            for prereq in &task.prerequisites {
                if visited.insert(*prereq) {
                    parent.insert(*prereq, node);
                    if *prereq == target {
                        let mut path = vec![target];
                        let mut cursor = target;
                        while let Some(&p) = parent.get(&cursor) {
                            path.push(p);
                            cursor = p;
                        }
                        path.reverse();
                        return Some(path);
                    }
                    stack.push(*prereq);
                }
            }
        }
        None
    }

    /// Full-graph cycle check: iterative DFS with a visited set and an
    /// in-progress set; revisiting an in-progress node signals a cycle.
    fn validate_acyclic(&self) -> Result<(), GraphError> {
        let mut visited: HashSet<TaskId> = HashSet::new();
        let mut in_progress: HashSet<TaskId> = HashSet::new();

        for &start in self.tasks.keys() {
            if visited.contains(&start) {
                continue;
            }
            // Stack of (node, entered). A node is pushed once to enter and
            // once more to leave the in-progress set on the way back up.
            let mut stack = vec![(start, false)];
            let mut path: Vec<TaskId> = Vec::new();

            while let Some((node, entered)) = stack.pop() {
                if entered {
                    in_progress.remove(&node);
                    path.pop();
                    continue;
                }
                if in_progress.contains(&node) {
                    let cycle_start = path.iter().position(|&p| p == node).unwrap_or(0);
                    return Err(GraphError::CycleDetected {
                        path: path[cycle_start..].to_vec(),
                    });
                }
                if !visited.insert(node) {
                    continue;
                }
                in_progress.insert(node);
                path.push(node);
                stack.push((node, true));
                if let Some(task) = self.tasks.get(&node) {
                    for prereq in &task.prerequisites {
                        if in_progress.contains(prereq) {
                            let cycle_start =
                                path.iter().position(|p| p == prereq).unwrap_or(0);
                            let mut cycle = path[cycle_start..].to_vec();
                            cycle.push(*prereq);
                            return Err(GraphError::CycleDetected { path: cycle });
                        }
                        if !visited.contains(prereq) {
                            stack.push((*prereq, false));
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(priority: i32) -> TaskSpec {
        TaskSpec::new("work").with_priority(priority)
    }

    fn complete(graph: &mut TaskGraph, id: TaskId) {
        graph.mark_running(id).unwrap();
        graph.mark_completed(id, "ok").unwrap();
    }

    #[test]
    fn tasks_without_prerequisites_start_eligible() {
        let mut graph = TaskGraph::new();
        let id = graph.insert(spec(0)).unwrap();
        assert_eq!(graph.task(id).unwrap().status, TaskStatus::Eligible);
    }

    #[test]
    fn unknown_prerequisite_rejected() {
        let mut graph = TaskGraph::new();
        let ghost = TaskId::new();
        let err = graph
            .insert(TaskSpec::new("x").with_prerequisite(ghost))
            .unwrap_err();
        assert!(matches!(err, GraphError::UnknownPrerequisite(id) if id == ghost));
        assert_eq!(graph.tasks(&TaskFilter::default()).len(), 0);
    }

    #[test]
    fn cycle_via_added_edge_rejected_and_graph_unchanged() {
        let mut graph = TaskGraph::new();
        let a = graph.insert(spec(0)).unwrap();
        let b = graph.insert(TaskSpec::new("b").with_prerequisite(a)).unwrap();
        let c = graph.insert(TaskSpec::new("c").with_prerequisite(b)).unwrap();

        let err = graph.add_prerequisite(a, c).unwrap_err();
        assert!(matches!(err, GraphError::CycleDetected { .. }));

        // No partial edge persisted: completing the chain still works.
        assert!(graph.task(a).unwrap().prerequisites.is_empty());
        complete(&mut graph, a);
        assert_eq!(graph.task(b).unwrap().status, TaskStatus::Eligible);
    }

    #[test]
    fn self_prerequisite_rejected() {
        let mut graph = TaskGraph::new();
        let a = graph.insert(spec(0)).unwrap();
        let err = graph.add_prerequisite(a, a).unwrap_err();
        assert!(matches!(err, GraphError::CycleDetected { .. }));
    }

    #[test]
    fn dependents_become_eligible_when_all_prerequisites_complete() {
        let mut graph = TaskGraph::new();
        let a = graph.insert(spec(0)).unwrap();
        let b = graph.insert(spec(0)).unwrap();
        let d = graph
            .insert(TaskSpec::new("d").with_prerequisite(a).with_prerequisite(b))
            .unwrap();

        complete(&mut graph, a);
        assert_eq!(graph.task(d).unwrap().status, TaskStatus::Pending);

        complete(&mut graph, b);
        assert_eq!(graph.task(d).unwrap().status, TaskStatus::Eligible);
    }

    #[test]
    fn diamond_resolves_in_dependency_order() {
        // a -> b, a -> c, b -> d, c -> d
        let mut graph = TaskGraph::new();
        let a = graph.insert(spec(0)).unwrap();
        let b = graph.insert(TaskSpec::new("b").with_prerequisite(a)).unwrap();
        let c = graph.insert(TaskSpec::new("c").with_prerequisite(a)).unwrap();
        let d = graph
            .insert(TaskSpec::new("d").with_prerequisite(b).with_prerequisite(c))
            .unwrap();

        assert_eq!(graph.eligible_tasks().len(), 1);
        complete(&mut graph, a);

        let eligible: Vec<TaskId> = graph.eligible_tasks().iter().map(|t| t.id).collect();
        assert!(eligible.contains(&b) && eligible.contains(&c));
        assert!(!eligible.contains(&d));

        complete(&mut graph, b);
        assert_eq!(graph.task(d).unwrap().status, TaskStatus::Pending);
        complete(&mut graph, c);
        assert_eq!(graph.task(d).unwrap().status, TaskStatus::Eligible);
    }

    #[test]
    fn eligibility_order_is_priority_then_submission() {
        let mut graph = TaskGraph::new();
        let low = graph.insert(spec(1)).unwrap();
        let high_first = graph.insert(spec(5)).unwrap();
        let high_second = graph.insert(spec(5)).unwrap();

        let order: Vec<TaskId> = graph.eligible_tasks().iter().map(|t| t.id).collect();
        assert_eq!(order, vec![high_first, high_second, low]);
    }

    #[test]
    fn failure_cancels_dependents_transitively() {
        let mut graph = TaskGraph::new();
        let a = graph.insert(spec(0)).unwrap();
        let b = graph.insert(TaskSpec::new("b").with_prerequisite(a)).unwrap();
        let c = graph.insert(TaskSpec::new("c").with_prerequisite(b)).unwrap();

        graph.mark_running(a).unwrap();
        let cancelled = graph.mark_failed(a, "boom").unwrap();

        assert_eq!(graph.task(a).unwrap().status, TaskStatus::Failed);
        assert_eq!(graph.task(b).unwrap().status, TaskStatus::Cancelled);
        assert_eq!(graph.task(c).unwrap().status, TaskStatus::Cancelled);
        assert_eq!(cancelled.len(), 2);
        assert!(graph.is_settled());
    }

    #[test]
    fn cancel_cascades_and_is_idempotent() {
        let mut graph = TaskGraph::new();
        let a = graph.insert(spec(0)).unwrap();
        let b = graph.insert(TaskSpec::new("b").with_prerequisite(a)).unwrap();

        let cancelled = graph.cancel(a, "operator request").unwrap();
        assert_eq!(cancelled.len(), 2);
        assert_eq!(graph.task(b).unwrap().status, TaskStatus::Cancelled);

        // Cancelling again changes nothing.
        assert!(graph.cancel(a, "again").unwrap().is_empty());
    }

    #[test]
    fn requeue_returns_running_task_to_eligible() {
        let mut graph = TaskGraph::new();
        let a = graph.insert(spec(0)).unwrap();
        graph.mark_running(a).unwrap();
        assert_eq!(graph.task(a).unwrap().attempt, 1);

        graph.requeue(a).unwrap();
        assert_eq!(graph.task(a).unwrap().status, TaskStatus::Eligible);

        graph.mark_running(a).unwrap();
        assert_eq!(graph.task(a).unwrap().attempt, 2);
    }

    #[test]
    fn invalid_transitions_rejected() {
        let mut graph = TaskGraph::new();
        let a = graph.insert(spec(0)).unwrap();

        // Not running yet.
        assert!(matches!(
            graph.mark_completed(a, "ok"),
            Err(GraphError::InvalidTransition { .. })
        ));

        complete(&mut graph, a);
        assert!(matches!(
            graph.mark_running(a),
            Err(GraphError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn snapshot_restore_requeues_running_tasks() {
        let mut graph = TaskGraph::new();
        let a = graph.insert(spec(0)).unwrap();
        let b = graph.insert(TaskSpec::new("b").with_prerequisite(a)).unwrap();
        graph.mark_running(a).unwrap();

        let snapshot = graph.snapshot();
        assert_eq!(snapshot.edges.len(), 1);
        assert_eq!(snapshot.edges[0].from, a);
        assert_eq!(snapshot.edges[0].to, b);

        let restored = TaskGraph::from_snapshot(snapshot).unwrap();
        // In-flight work is re-attempted after a crash.
        assert_eq!(restored.task(a).unwrap().status, TaskStatus::Eligible);
        assert_eq!(restored.task(a).unwrap().attempt, 1);
        assert_eq!(restored.task(b).unwrap().status, TaskStatus::Pending);
    }

    #[test]
    fn corrupt_snapshot_with_cycle_rejected() {
        let mut graph = TaskGraph::new();
        let a = graph.insert(spec(0)).unwrap();
        let b = graph.insert(TaskSpec::new("b").with_prerequisite(a)).unwrap();

        let mut snapshot = graph.snapshot();
        for task in &mut snapshot.tasks {
            if task.id == a {
                task.prerequisites.insert(b);
            }
        }

        assert!(matches!(
            TaskGraph::from_snapshot(snapshot),
            Err(GraphError::CycleDetected { .. })
        ));
    }

    #[test]
    fn new_prerequisite_demotes_eligible_task() {
        let mut graph = TaskGraph::new();
        let a = graph.insert(spec(0)).unwrap();
        let b = graph.insert(spec(0)).unwrap();
        assert_eq!(graph.task(b).unwrap().status, TaskStatus::Eligible);

        graph.add_prerequisite(b, a).unwrap();
        assert_eq!(graph.task(b).unwrap().status, TaskStatus::Pending);

        complete(&mut graph, a);
        assert_eq!(graph.task(b).unwrap().status, TaskStatus::Eligible);
    }
}
