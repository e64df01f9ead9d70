//! Execution Coordinator: walks a `Schedule` batch by batch, dispatches
//! each atomic task to an `AgentAdapter`, and drives the task through the
//! Lifecycle Service as it goes. Retries follow the Adaptive Timeout
//! Manager's backoff schedule, and a failed retry resets `started_at` so
//! the next attempt's duration is measured cleanly.
//!
//! The retry-then-give-up shape follows
//! `copilot-workflow::execution::DefaultStepExecutor::execute_with_retry`.
//! An agent timeout is not treated as a retryable transport error: it
//! blocks the task outright so a human (or the automation pass) decides
//! whether to unblock it, rather than burning retries against an agent
//! that may already be wedged on the same work.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, instrument, warn};

use vibe_core::{
    AgentAdapter, AgentDispatchRequest, HealthCheck, HealthStatus, OrchestratorError,
    OrchestratorResult, Schedule, Task, TaskStatus,
};

use crate::graph::DependencyGraph;
use crate::lifecycle::LifecycleService;
use crate::timeout::AdaptiveTimeoutManager;

pub struct ExecutionCoordinator {
    agent: Arc<dyn AgentAdapter>,
    lifecycle: Arc<LifecycleService>,
    timeouts: Arc<AdaptiveTimeoutManager>,
}

pub struct BatchExecutionReport {
    pub completed: Vec<String>,
    pub failed: Vec<String>,
}

impl ExecutionCoordinator {
    pub fn new(
        agent: Arc<dyn AgentAdapter>,
        lifecycle: Arc<LifecycleService>,
        timeouts: Arc<AdaptiveTimeoutManager>,
    ) -> Self {
        Self {
            agent,
            lifecycle,
            timeouts,
        }
    }

    /// Runs every batch in `schedule` in order, and every task within a
    /// batch concurrently (`tokio::spawn` per task, matching
    /// `copilot-workflow::execution::execute_parallel_steps`). A task that
    /// exhausts its retries blocks its dependents via the Lifecycle
    /// Service's cascade before the coordinator moves to the next batch; a
    /// task that completes promotes any dependents whose other
    /// dependencies are already satisfied.
    #[instrument(skip(self, schedule, tasks_by_id, graph))]
    pub async fn run_schedule(
        &self,
        schedule: &Schedule,
        tasks_by_id: &std::collections::HashMap<String, Task>,
        graph: Arc<DependencyGraph>,
    ) -> OrchestratorResult<BatchExecutionReport> {
        let mut completed = Vec::new();
        let mut failed = Vec::new();

        for batch in &schedule.batches {
            let mut handles = Vec::new();
            for task_id in &batch.task_ids {
                let Some(task) = tasks_by_id.get(task_id).cloned() else {
                    return Err(OrchestratorError::unknown_task(task_id.clone()));
                };
                let agent = self.agent.clone();
                let lifecycle = self.lifecycle.clone();
                let timeouts = self.timeouts.clone();
                let graph = graph.clone();
                handles.push(tokio::spawn(Self::run_one(agent, lifecycle, timeouts, graph, task)));
            }

            for handle in handles {
                match handle.await {
                    Ok(Ok(task_id)) => {
                        if let Err(promote_err) = self.lifecycle.promote_ready_dependents(&task_id, &graph) {
                            warn!(task_id, error = %promote_err, "dependency promotion after completion failed");
                        }
                        completed.push(task_id);
                    }
                    Ok(Err((task_id, err))) => {
                        warn!(task_id, error = %err, "task execution failed permanently");
                        if let Err(cascade_err) =
                            self.lifecycle.cascade(&task_id, &graph, &err.to_string())
                        {
                            warn!(task_id, error = %cascade_err, "cascade after failure also failed");
                        }
                        failed.push(task_id);
                    }
                    Err(join_err) => {
                        warn!(error = %join_err, "task execution panicked");
                    }
                }
            }
        }

        Ok(BatchExecutionReport { completed, failed })
    }

    async fn run_one(
        agent: Arc<dyn AgentAdapter>,
        lifecycle: Arc<LifecycleService>,
        timeouts: Arc<AdaptiveTimeoutManager>,
        graph: Arc<DependencyGraph>,
        mut task: Task,
    ) -> Result<String, (String, OrchestratorError)> {
        lifecycle
            .transition(&task.id, TaskStatus::InProgress, &graph, None)
            .map_err(|e| (task.id.clone(), e))?;
        task.started_at = Some(chrono::Utc::now());

        let mut attempt = 0;
        loop {
            let dispatch_result = timeouts
                .run_with_timeout(&task.id, attempt, agent.dispatch(AgentDispatchRequest {
                    task: task.clone(),
                    timeout_ms: 0,
                }))
                .await;

            match dispatch_result {
                Ok(response) if response.succeeded => {
                    lifecycle
                        .transition(&task.id, TaskStatus::Completed, &graph, None)
                        .map_err(|e| (task.id.clone(), e))?;
                    info!(task_id = %task.id, attempt, "task completed");
                    return Ok(task.id.clone());
                }
                Ok(response) => {
                    // The agent ran and reported failure on its own terms;
                    // that's a definitive verdict on this task, not a
                    // transport hiccup, so there's nothing to gain from
                    // retrying against the same input.
                    let message = response.error_message.unwrap_or_else(|| "agent reported failure".to_string());
                    lifecycle
                        .transition(&task.id, TaskStatus::Failed, &graph, Some(message.clone()))
                        .map_err(|e| (task.id.clone(), e))?;
                    return Err((
                        task.id.clone(),
                        OrchestratorError::AgentDispatchError {
                            task_id: task.id.clone(),
                            message,
                        },
                    ));
                }
                Err(err @ OrchestratorError::AgentTimeout { .. }) => {
                    let _ = lifecycle.transition(&task.id, TaskStatus::Blocked, &graph, Some(err.to_string()));
                    warn!(task_id = %task.id, attempt, error = %err, "agent timed out, blocking task");
                    return Err((task.id.clone(), err));
                }
                Err(err) => {
                    if !timeouts.should_retry(attempt) {
                        let _ = lifecycle.transition(&task.id, TaskStatus::Failed, &graph, Some(err.to_string()));
                        return Err((task.id.clone(), err));
                    }
                    warn!(task_id = %task.id, attempt, error = %err, "retrying after dispatch error");
                    let _ = lifecycle.transition(&task.id, TaskStatus::Failed, &graph, Some(err.to_string()));
                    lifecycle
                        .transition(&task.id, TaskStatus::Pending, &graph, None)
                        .map_err(|e| (task.id.clone(), e))?;
                    task.started_at = None;
                    attempt += 1;
                }
            }
        }
    }
}

#[async_trait]
impl HealthCheck for ExecutionCoordinator {
    async fn check(&self) -> OrchestratorResult<HealthStatus> {
        let in_flight = self.timeouts.active_operation_count();
        Ok(HealthStatus::healthy().with_details(serde_json::json!({
            "in_flight_operations": in_flight,
        })))
    }

    fn name(&self) -> &str {
        "execution_coordinator"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::DependencyGraph;
    use crate::timeout::BackoffPolicy;
    use vibe_core::{AgentDispatchResponse, EventBus};

    struct AlwaysSucceedsAgent;

    #[async_trait]
    impl AgentAdapter for AlwaysSucceedsAgent {
        async fn dispatch(&self, request: AgentDispatchRequest) -> OrchestratorResult<AgentDispatchResponse> {
            Ok(AgentDispatchResponse {
                task_id: request.task.id,
                succeeded: true,
                output: Some("done".to_string()),
                error_message: None,
            })
        }

        fn name(&self) -> &str {
            "always-succeeds"
        }
    }

    struct AlwaysFailsAgent;

    #[async_trait]
    impl AgentAdapter for AlwaysFailsAgent {
        async fn dispatch(&self, request: AgentDispatchRequest) -> OrchestratorResult<AgentDispatchResponse> {
            Ok(AgentDispatchResponse {
                task_id: request.task.id,
                succeeded: false,
                output: None,
                error_message: Some("agent refused".to_string()),
            })
        }

        fn name(&self) -> &str {
            "always-fails"
        }
    }

    struct AlwaysTimesOutAgent;

    #[async_trait]
    impl AgentAdapter for AlwaysTimesOutAgent {
        async fn dispatch(&self, _request: AgentDispatchRequest) -> OrchestratorResult<AgentDispatchResponse> {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            unreachable!("timeout manager should have already returned AgentTimeout")
        }

        fn name(&self) -> &str {
            "always-times-out"
        }
    }

    fn policy() -> BackoffPolicy {
        BackoffPolicy {
            base_timeout_ms: 5_000,
            max_timeout_ms: 20_000,
            backoff_factor: 2.0,
            max_retries: 1,
        }
    }

    fn short_timeout_policy() -> BackoffPolicy {
        BackoffPolicy {
            base_timeout_ms: 5,
            max_timeout_ms: 10,
            backoff_factor: 2.0,
            max_retries: 2,
        }
    }

    #[tokio::test]
    async fn successful_schedule_marks_tasks_completed() {
        let events = EventBus::new();
        let lifecycle = Arc::new(LifecycleService::new(events.clone()));
        let timeouts = Arc::new(AdaptiveTimeoutManager::new(policy(), events));
        let coordinator = ExecutionCoordinator::new(Arc::new(AlwaysSucceedsAgent), lifecycle.clone(), timeouts);

        let task = Task::new("proj-1", "Do thing", 0);
        lifecycle.register(&task.id, TaskStatus::Pending);

        let mut tasks_by_id = std::collections::HashMap::new();
        tasks_by_id.insert(task.id.clone(), task.clone());

        let mut graph = DependencyGraph::new();
        graph.add_task(task.id.clone());
        let graph = Arc::new(graph);

        let schedule = Schedule {
            project_id: "proj-1".to_string(),
            batches: vec![vibe_core::ExecutionBatch {
                index: 0,
                task_ids: vec![task.id.clone()],
                estimated_duration_minutes: 10.0,
            }],
            scheduled_tasks: vec![],
            critical_path: vec![],
            critical_path_duration_minutes: 0.0,
            parallelism_factor: 1.0,
            generated_at: chrono::Utc::now(),
        };

        let report = coordinator.run_schedule(&schedule, &tasks_by_id, graph).await.unwrap();
        assert_eq!(report.completed, vec![task.id.clone()]);
        assert!(report.failed.is_empty());
        assert_eq!(lifecycle.status_of(&task.id).unwrap(), TaskStatus::Completed);
    }

    #[tokio::test]
    async fn exhausted_retries_mark_task_failed_and_cascade() {
        let events = EventBus::new();
        let lifecycle = Arc::new(LifecycleService::new(events.clone()));
        let timeouts = Arc::new(AdaptiveTimeoutManager::new(policy(), events));
        let coordinator = ExecutionCoordinator::new(Arc::new(AlwaysFailsAgent), lifecycle.clone(), timeouts);

        let root = Task::new("proj-1", "Root", 0);
        let mut dependent = Task::new("proj-1", "Dependent", 0);
        dependent.parent_id = None;
        lifecycle.register(&root.id, TaskStatus::Pending);
        lifecycle.register(&dependent.id, TaskStatus::Pending);

        let mut graph = DependencyGraph::new();
        graph
            .add_dependency(vibe_core::DependencyEdge {
                from: root.id.clone(),
                to: dependent.id.clone(),
                kind: vibe_core::DependencyKind::Explicit,
                confidence: 1.0,
                reason: "test".to_string(),
            })
            .unwrap();
        let graph = Arc::new(graph);

        let mut tasks_by_id = std::collections::HashMap::new();
        tasks_by_id.insert(root.id.clone(), root.clone());

        let schedule = Schedule {
            project_id: "proj-1".to_string(),
            batches: vec![vibe_core::ExecutionBatch {
                index: 0,
                task_ids: vec![root.id.clone()],
                estimated_duration_minutes: 10.0,
            }],
            scheduled_tasks: vec![],
            critical_path: vec![],
            critical_path_duration_minutes: 0.0,
            parallelism_factor: 1.0,
            generated_at: chrono::Utc::now(),
        };

        // An agent-reported failure is terminal immediately: no retries,
        // even though the configured policy allows one.
        let report = coordinator.run_schedule(&schedule, &tasks_by_id, graph).await.unwrap();
        assert_eq!(report.failed, vec![root.id.clone()]);
        assert_eq!(lifecycle.status_of(&dependent.id).unwrap(), TaskStatus::Blocked);
    }

    #[tokio::test]
    async fn agent_timeout_blocks_task_without_retry() {
        let events = EventBus::new();
        let lifecycle = Arc::new(LifecycleService::new(events.clone()));
        let timeouts = Arc::new(AdaptiveTimeoutManager::new(short_timeout_policy(), events));
        let coordinator = ExecutionCoordinator::new(Arc::new(AlwaysTimesOutAgent), lifecycle.clone(), timeouts);

        let task = Task::new("proj-1", "Slow task", 0);
        lifecycle.register(&task.id, TaskStatus::Pending);

        let mut tasks_by_id = std::collections::HashMap::new();
        tasks_by_id.insert(task.id.clone(), task.clone());

        let mut graph = DependencyGraph::new();
        graph.add_task(task.id.clone());
        let graph = Arc::new(graph);

        let schedule = Schedule {
            project_id: "proj-1".to_string(),
            batches: vec![vibe_core::ExecutionBatch {
                index: 0,
                task_ids: vec![task.id.clone()],
                estimated_duration_minutes: 10.0,
            }],
            scheduled_tasks: vec![],
            critical_path: vec![],
            critical_path_duration_minutes: 0.0,
            parallelism_factor: 1.0,
            generated_at: chrono::Utc::now(),
        };

        let report = coordinator.run_schedule(&schedule, &tasks_by_id, graph).await.unwrap();
        assert_eq!(report.failed, vec![task.id.clone()]);
        assert_eq!(lifecycle.status_of(&task.id).unwrap(), TaskStatus::Blocked);
    }

    #[tokio::test]
    async fn health_check_reports_healthy_when_idle() {
        let events = EventBus::new();
        let lifecycle = Arc::new(LifecycleService::new(events.clone()));
        let timeouts = Arc::new(AdaptiveTimeoutManager::new(policy(), events));
        let coordinator = ExecutionCoordinator::new(Arc::new(AlwaysSucceedsAgent), lifecycle, timeouts);

        let status = coordinator.check().await.unwrap();
        assert!(status.healthy);
    }
}
