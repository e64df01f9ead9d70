//! Lifecycle Service: the authoritative state machine for task status,
//! dependency-ready gating, and cascade propagation in both directions (a
//! task's failure blocking its dependents, a task's completion promoting
//! them). Guards every transition against a fixed table instead of
//! trusting callers, the way `copilot-workflow::step::StepResult`'s
//! terminal-state helpers guard against illegal reuse of a finished step.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{info, instrument};

use vibe_core::{EventBus, OrchestratorError, OrchestratorEvent, OrchestratorResult, TaskId, TaskStatus, TransitionRecord};

use crate::graph::DependencyGraph;

/// Transition history is capped per task so a long-running process doesn't
/// accumulate an unbounded audit log for a task that keeps retrying.
const MAX_HISTORY_ENTRIES: usize = 50;

/// Returns the set of statuses `from` may legally transition into.
pub fn allowed_transitions(from: TaskStatus) -> &'static [TaskStatus] {
    use TaskStatus::*;
    match from {
        Pending => &[InProgress, Blocked, Cancelled],
        InProgress => &[Completed, Failed, Blocked, Cancelled],
        Blocked => &[InProgress, Failed, Cancelled],
        Failed => &[Pending, Cancelled],
        Cancelled => &[Pending],
        Completed => &[Cancelled],
    }
}

pub fn is_transition_allowed(from: TaskStatus, to: TaskStatus) -> bool {
    allowed_transitions(from).contains(&to)
}

/// Summary of one pass of `process_automated_transitions`: how many tasks
/// were scanned and how many transitions actually happened.
#[derive(Debug, Clone, Copy, Default)]
pub struct AutomationReport {
    pub tasks_scanned: usize,
    pub transitions_triggered: usize,
}

/// Tracks the live status of every task in a project and enforces the
/// transition table above. One lock per task avoids a single global mutex
/// serializing unrelated tasks' transitions.
pub struct LifecycleService {
    statuses: DashMap<TaskId, Arc<Mutex<TaskStatus>>>,
    history: DashMap<TaskId, Vec<TransitionRecord>>,
    events: EventBus,
}

impl LifecycleService {
    pub fn new(events: EventBus) -> Self {
        Self {
            statuses: DashMap::new(),
            history: DashMap::new(),
            events,
        }
    }

    pub fn register(&self, task_id: impl Into<TaskId>, initial: TaskStatus) {
        let task_id = task_id.into();
        self.statuses
            .entry(task_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(initial)));
        self.history.entry(task_id).or_insert_with(Vec::new);
    }

    pub fn status_of(&self, task_id: &str) -> OrchestratorResult<TaskStatus> {
        self.statuses
            .get(task_id)
            .map(|lock| *lock.lock())
            .ok_or_else(|| OrchestratorError::unknown_task(task_id))
    }

    /// Attempts a single transition. Fails with `InvalidTransition` if the
    /// table above doesn't allow `to` from the task's current status, or
    /// with `DependencyNotReady` if `to` is `InProgress` and `graph` shows
    /// an incomplete dependency. Resetting a retried task's `started_at`
    /// (`Failed` -> `Pending`) is the coordinator's responsibility, since
    /// this service tracks status only and has no access to the task
    /// record itself.
    #[instrument(skip(self, graph))]
    pub fn transition(
        &self,
        task_id: &str,
        to: TaskStatus,
        graph: &DependencyGraph,
        reason: Option<String>,
    ) -> OrchestratorResult<TransitionRecord> {
        let lock = self
            .statuses
            .get(task_id)
            .ok_or_else(|| OrchestratorError::unknown_task(task_id))?
            .clone();

        let mut current = lock.lock();
        if !is_transition_allowed(*current, to) {
            return Err(OrchestratorError::invalid_transition(
                task_id,
                current.to_string(),
                to.to_string(),
            ));
        }

        if to == TaskStatus::InProgress {
            let pending: Vec<TaskId> = graph
                .dependencies_of(task_id)
                .into_iter()
                .filter(|dep| !matches!(self.status_of(dep), Ok(TaskStatus::Completed)))
                .collect();
            if !pending.is_empty() {
                return Err(OrchestratorError::dependency_not_ready(task_id, pending));
            }
        }

        let from = *current;
        *current = to;
        drop(current);

        let mut record = TransitionRecord::new(task_id.to_string(), from, to);
        if let Some(reason) = reason {
            record = record.with_reason(reason);
        }

        self.history
            .entry(task_id.to_string())
            .or_insert_with(Vec::new)
            .push(record.clone());
        if let Some(mut entries) = self.history.get_mut(task_id) {
            let overflow = entries.len().saturating_sub(MAX_HISTORY_ENTRIES);
            if overflow > 0 {
                entries.drain(0..overflow);
            }
        }

        info!(task_id, %from, %to, "task transitioned");
        self.events.publish(OrchestratorEvent::TaskTransitioned {
            task_id: task_id.to_string(),
            from,
            to,
        });

        Ok(record)
    }

    pub fn history_of(&self, task_id: &str) -> Vec<TransitionRecord> {
        self.history
            .get(task_id)
            .map(|h| h.clone())
            .unwrap_or_default()
    }

    /// Propagates a terminal failure or cancellation to every downstream
    /// task in `graph` that depends (transitively) on `task_id`, blocking
    /// each one in turn. Tasks already in a terminal state are left alone.
    #[instrument(skip(self, graph))]
    pub fn cascade(
        &self,
        task_id: &str,
        graph: &DependencyGraph,
        reason: &str,
    ) -> OrchestratorResult<Vec<TaskId>> {
        let mut affected = Vec::new();
        let mut frontier = vec![task_id.to_string()];
        let mut seen: HashMap<TaskId, ()> = HashMap::new();
        seen.insert(task_id.to_string(), ());

        while let Some(current) = frontier.pop() {
            for dependent in graph.dependents_of(&current) {
                if seen.insert(dependent.clone(), ()).is_some() {
                    continue;
                }
                if let Ok(status) = self.status_of(&dependent) {
                    if matches!(status, TaskStatus::Pending | TaskStatus::InProgress) {
                        self.transition(&dependent, TaskStatus::Blocked, graph, Some(reason.to_string()))?;
                        affected.push(dependent.clone());
                    }
                }
                frontier.push(dependent);
            }
        }

        if !affected.is_empty() {
            self.events.publish(OrchestratorEvent::CascadeTriggered {
                root_task_id: task_id.to_string(),
                affected_task_ids: affected.clone(),
            });
        }

        Ok(affected)
    }

    /// Promotes every pending dependent of `completed_task_id` whose full
    /// set of dependencies has now completed to `in_progress`. The
    /// push-based counterpart to `process_automated_transitions`'s
    /// periodic pull — call it right after a task transitions to
    /// `completed` so dependents unblock without waiting for the next
    /// automation tick.
    #[instrument(skip(self, graph))]
    pub fn promote_ready_dependents(
        &self,
        completed_task_id: &str,
        graph: &DependencyGraph,
    ) -> OrchestratorResult<Vec<TaskId>> {
        let mut promoted = Vec::new();
        for dependent in graph.dependents_of(completed_task_id) {
            if !matches!(self.status_of(&dependent), Ok(TaskStatus::Pending)) {
                continue;
            }
            if self
                .transition(
                    &dependent,
                    TaskStatus::InProgress,
                    graph,
                    Some("dependency_cascade".to_string()),
                )
                .is_ok()
            {
                promoted.push(dependent);
            }
        }
        Ok(promoted)
    }

    /// The set of pending tasks among `tasks` whose dependencies have all
    /// completed — ready to run right now.
    pub fn ready_tasks(&self, tasks: &[TaskId], graph: &DependencyGraph) -> Vec<TaskId> {
        tasks
            .iter()
            .filter(|task_id| matches!(self.status_of(task_id), Ok(TaskStatus::Pending)))
            .filter(|task_id| {
                graph
                    .dependencies_of(task_id)
                    .iter()
                    .all(|dep| matches!(self.status_of(dep), Ok(TaskStatus::Completed)))
            })
            .cloned()
            .collect()
    }

    /// One automation tick over `tasks`: promotes every ready pending task
    /// to `in_progress`, then blocks any `in_progress` task that has run
    /// longer than `timeout_threshold` since `started_at`. `started_at` is
    /// supplied by the caller (the Execution Coordinator owns task
    /// records; this service tracks status only).
    #[instrument(skip(self, graph, started_at))]
    pub fn process_automated_transitions(
        &self,
        tasks: &[TaskId],
        graph: &DependencyGraph,
        started_at: &HashMap<TaskId, DateTime<Utc>>,
        timeout_threshold: Duration,
    ) -> AutomationReport {
        let mut transitions_triggered = 0;

        for task_id in self.ready_tasks(tasks, graph) {
            if self
                .transition(&task_id, TaskStatus::InProgress, graph, Some("automation".to_string()))
                .is_ok()
            {
                transitions_triggered += 1;
            }
        }

        transitions_triggered += self.check_timeout_transitions(tasks, graph, started_at, timeout_threshold);

        AutomationReport {
            tasks_scanned: tasks.len(),
            transitions_triggered,
        }
    }

    /// Blocks any `in_progress` task in `tasks` whose elapsed time since
    /// `started_at` exceeds `timeout_threshold`. Returns how many tasks
    /// were blocked.
    pub fn check_timeout_transitions(
        &self,
        tasks: &[TaskId],
        graph: &DependencyGraph,
        started_at: &HashMap<TaskId, DateTime<Utc>>,
        timeout_threshold: Duration,
    ) -> usize {
        let threshold = chrono::Duration::from_std(timeout_threshold).unwrap_or(chrono::Duration::zero());
        let mut blocked = 0;

        for task_id in tasks {
            if !matches!(self.status_of(task_id), Ok(TaskStatus::InProgress)) {
                continue;
            }
            let Some(start) = started_at.get(task_id) else {
                continue;
            };
            if Utc::now() - *start > threshold {
                let elapsed_ms = (Utc::now() - *start).num_milliseconds();
                if self
                    .transition(
                        task_id,
                        TaskStatus::Blocked,
                        graph,
                        Some(format!("timed out after {elapsed_ms}ms")),
                    )
                    .is_ok()
                {
                    blocked += 1;
                }
            }
        }

        blocked
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vibe_core::DependencyEdge;

    fn edge(from: &str, to: &str) -> DependencyEdge {
        DependencyEdge {
            from: from.to_string(),
            to: to.to_string(),
            kind: vibe_core::DependencyKind::Explicit,
            confidence: 1.0,
            reason: "test".to_string(),
        }
    }

    #[test]
    fn pending_to_in_progress_is_allowed() {
        assert!(is_transition_allowed(TaskStatus::Pending, TaskStatus::InProgress));
    }

    #[test]
    fn completed_to_in_progress_is_rejected() {
        assert!(!is_transition_allowed(TaskStatus::Completed, TaskStatus::InProgress));
    }

    #[test]
    fn cancelled_can_only_return_to_pending() {
        assert_eq!(allowed_transitions(TaskStatus::Cancelled), &[TaskStatus::Pending]);
    }

    #[test]
    fn transition_updates_status_and_records_history() {
        let service = LifecycleService::new(EventBus::new());
        service.register("t1", TaskStatus::Pending);
        let graph = DependencyGraph::new();

        service.transition("t1", TaskStatus::InProgress, &graph, None).unwrap();
        assert_eq!(service.status_of("t1").unwrap(), TaskStatus::InProgress);
        assert_eq!(service.history_of("t1").len(), 1);
    }

    #[test]
    fn illegal_transition_is_rejected_and_status_unchanged() {
        let service = LifecycleService::new(EventBus::new());
        service.register("t1", TaskStatus::Completed);
        let graph = DependencyGraph::new();

        let result = service.transition("t1", TaskStatus::InProgress, &graph, None);
        assert!(result.is_err());
        assert_eq!(service.status_of("t1").unwrap(), TaskStatus::Completed);
    }

    #[test]
    fn unknown_task_status_lookup_fails() {
        let service = LifecycleService::new(EventBus::new());
        assert!(service.status_of("ghost").is_err());
    }

    #[test]
    fn in_progress_requires_completed_dependencies() {
        let service = LifecycleService::new(EventBus::new());
        service.register("A", TaskStatus::Pending);
        service.register("B", TaskStatus::Pending);

        let mut graph = DependencyGraph::new();
        graph.add_dependency(edge("A", "B")).unwrap();

        let result = service.transition("B", TaskStatus::InProgress, &graph, None);
        assert!(matches!(result, Err(OrchestratorError::DependencyNotReady { .. })));
    }

    #[test]
    fn in_progress_succeeds_once_dependencies_complete() {
        let service = LifecycleService::new(EventBus::new());
        service.register("A", TaskStatus::Pending);
        service.register("B", TaskStatus::Pending);

        let mut graph = DependencyGraph::new();
        graph.add_dependency(edge("A", "B")).unwrap();

        service.transition("A", TaskStatus::InProgress, &graph, None).unwrap();
        service.transition("A", TaskStatus::Completed, &graph, None).unwrap();

        service.transition("B", TaskStatus::InProgress, &graph, None).unwrap();
        assert_eq!(service.status_of("B").unwrap(), TaskStatus::InProgress);
    }

    #[test]
    fn cascade_blocks_downstream_pending_tasks() {
        let service = LifecycleService::new(EventBus::new());
        service.register("A", TaskStatus::Failed);
        service.register("B", TaskStatus::Pending);
        service.register("C", TaskStatus::Pending);

        let mut graph = DependencyGraph::new();
        graph.add_dependency(edge("A", "B")).unwrap();
        graph.add_dependency(edge("B", "C")).unwrap();

        let affected = service.cascade("A", &graph, "upstream task failed").unwrap();
        assert_eq!(affected.len(), 2);
        assert_eq!(service.status_of("B").unwrap(), TaskStatus::Blocked);
        assert_eq!(service.status_of("C").unwrap(), TaskStatus::Blocked);
    }

    #[test]
    fn cascade_skips_already_terminal_dependents() {
        let service = LifecycleService::new(EventBus::new());
        service.register("A", TaskStatus::Failed);
        service.register("B", TaskStatus::Completed);

        let mut graph = DependencyGraph::new();
        graph.add_dependency(edge("A", "B")).unwrap();

        let affected = service.cascade("A", &graph, "upstream task failed").unwrap();
        assert!(affected.is_empty());
        assert_eq!(service.status_of("B").unwrap(), TaskStatus::Completed);
    }

    #[test]
    fn promote_ready_dependents_promotes_only_fully_satisfied_tasks() {
        let service = LifecycleService::new(EventBus::new());
        service.register("A", TaskStatus::Completed);
        service.register("B", TaskStatus::Pending);
        service.register("C", TaskStatus::Pending);

        let mut graph = DependencyGraph::new();
        graph.add_dependency(edge("A", "B")).unwrap();
        graph.add_dependency(edge("A", "C")).unwrap();
        graph.add_dependency(edge("B", "C")).unwrap();

        let promoted = service.promote_ready_dependents("A", &graph).unwrap();
        assert_eq!(promoted, vec!["B".to_string()]);
        assert_eq!(service.status_of("B").unwrap(), TaskStatus::InProgress);
        // C still waits on B, which hasn't completed yet.
        assert_eq!(service.status_of("C").unwrap(), TaskStatus::Pending);
    }

    #[test]
    fn completion_cascades_through_a_three_task_chain() {
        // T1 -> T2 -> T3, all pending. Completing T1 and re-running
        // automation should promote T2 but not T3; completing T2 then
        // promotes T3.
        let service = LifecycleService::new(EventBus::new());
        service.register("T1", TaskStatus::Pending);
        service.register("T2", TaskStatus::Pending);
        service.register("T3", TaskStatus::Pending);

        let mut graph = DependencyGraph::new();
        graph.add_dependency(edge("T1", "T2")).unwrap();
        graph.add_dependency(edge("T2", "T3")).unwrap();

        let tasks = vec!["T1".to_string(), "T2".to_string(), "T3".to_string()];
        let started_at = HashMap::new();

        let report = service.process_automated_transitions(&tasks, &graph, &started_at, Duration::from_secs(900));
        assert_eq!(report.transitions_triggered, 1);
        assert_eq!(service.status_of("T1").unwrap(), TaskStatus::InProgress);

        service.transition("T1", TaskStatus::Completed, &graph, None).unwrap();
        let report = service.process_automated_transitions(&tasks, &graph, &started_at, Duration::from_secs(900));
        assert_eq!(report.transitions_triggered, 1);
        assert_eq!(service.status_of("T2").unwrap(), TaskStatus::InProgress);
        assert_eq!(service.status_of("T3").unwrap(), TaskStatus::Pending);

        service.transition("T2", TaskStatus::Completed, &graph, None).unwrap();
        let report = service.process_automated_transitions(&tasks, &graph, &started_at, Duration::from_secs(900));
        assert_eq!(report.transitions_triggered, 1);
        assert_eq!(service.status_of("T3").unwrap(), TaskStatus::InProgress);
    }

    #[test]
    fn stuck_in_progress_task_is_blocked_by_timeout_check() {
        let service = LifecycleService::new(EventBus::new());
        service.register("A", TaskStatus::Pending);
        let graph = DependencyGraph::new();
        service.transition("A", TaskStatus::InProgress, &graph, None).unwrap();

        let mut started_at = HashMap::new();
        started_at.insert("A".to_string(), Utc::now() - chrono::Duration::minutes(30));

        let blocked = service.check_timeout_transitions(
            &["A".to_string()],
            &graph,
            &started_at,
            Duration::from_secs(60),
        );
        assert_eq!(blocked, 1);
        assert_eq!(service.status_of("A").unwrap(), TaskStatus::Blocked);
    }
}
