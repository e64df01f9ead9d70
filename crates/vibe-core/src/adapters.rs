//! External interfaces the engine consumes but does not implement: the LLM
//! backend, the agent runtime that actually executes atomic tasks, and the
//! persistence layer tasks are stored in. Shaped after the request/response
//! trait pairs in `copilot-adapters::traits` (`TestBenchAdapter`,
//! `ObservatoryAdapter`, ...), generalized to this engine's three external
//! dependencies.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::OrchestratorResult;
use crate::types::{Task, TaskId, TaskStatus};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmCompletionRequest {
    pub prompt: String,
    pub model: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmCompletionResponse {
    pub text: String,
    pub model_used: String,
    pub tokens_used: Option<u32>,
}

/// The one seam through which this engine talks to a language model —
/// used by the Recursive Decomposition Engine and, optionally, the
/// Atomicity Detector for borderline classifications. Transport, retries
/// against the provider, and prompt templates are the adapter's concern,
/// not this crate's.
#[async_trait]
pub trait LlmAdapter: Send + Sync {
    async fn complete(&self, request: LlmCompletionRequest) -> OrchestratorResult<LlmCompletionResponse>;

    fn name(&self) -> &str;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDispatchRequest {
    pub task: Task,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDispatchResponse {
    pub task_id: TaskId,
    pub succeeded: bool,
    pub output: Option<String>,
    pub error_message: Option<String>,
}

/// The seam through which the Execution Coordinator hands an atomic task
/// to whatever actually does the work (a coding agent, a CI job, a human
/// queue). The engine only needs to know whether the dispatch eventually
/// succeeds, fails, or times out.
#[async_trait]
pub trait AgentAdapter: Send + Sync {
    async fn dispatch(
        &self,
        request: AgentDispatchRequest,
    ) -> OrchestratorResult<AgentDispatchResponse>;

    fn name(&self) -> &str;
}

/// Persistence seam for tasks and their lifecycle state. The engine never
/// assumes a particular storage format — this trait is the entire contract.
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn get(&self, task_id: &TaskId) -> OrchestratorResult<Option<Task>>;

    async fn list_by_project(&self, project_id: &str) -> OrchestratorResult<Vec<Task>>;

    async fn upsert(&self, task: &Task) -> OrchestratorResult<()>;

    async fn update_status(&self, task_id: &TaskId, status: TaskStatus) -> OrchestratorResult<()>;

    async fn delete(&self, task_id: &TaskId) -> OrchestratorResult<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tokio::sync::Mutex;

    /// An in-memory `TaskStore` used only to exercise the trait contract in
    /// tests elsewhere in the workspace.
    #[derive(Default)]
    pub struct InMemoryTaskStore {
        tasks: Mutex<HashMap<TaskId, Task>>,
    }

    #[async_trait]
    impl TaskStore for InMemoryTaskStore {
        async fn get(&self, task_id: &TaskId) -> OrchestratorResult<Option<Task>> {
            Ok(self.tasks.lock().await.get(task_id).cloned())
        }

        async fn list_by_project(&self, project_id: &str) -> OrchestratorResult<Vec<Task>> {
            Ok(self
                .tasks
                .lock()
                .await
                .values()
                .filter(|t| t.project_id == project_id)
                .cloned()
                .collect())
        }

        async fn upsert(&self, task: &Task) -> OrchestratorResult<()> {
            self.tasks.lock().await.insert(task.id.clone(), task.clone());
            Ok(())
        }

        async fn update_status(&self, task_id: &TaskId, status: TaskStatus) -> OrchestratorResult<()> {
            if let Some(task) = self.tasks.lock().await.get_mut(task_id) {
                task.status = status;
            }
            Ok(())
        }

        async fn delete(&self, task_id: &TaskId) -> OrchestratorResult<bool> {
            Ok(self.tasks.lock().await.remove(task_id).is_some())
        }
    }

    #[tokio::test]
    async fn upsert_then_get_round_trips() {
        let store = InMemoryTaskStore::default();
        let task = Task::new("proj-1", "Example", 0);
        store.upsert(&task).await.unwrap();

        let fetched = store.get(&task.id).await.unwrap();
        assert_eq!(fetched.unwrap().id, task.id);
    }

    #[tokio::test]
    async fn update_status_changes_stored_task() {
        let store = InMemoryTaskStore::default();
        let task = Task::new("proj-1", "Example", 0);
        store.upsert(&task).await.unwrap();

        store
            .update_status(&task.id, TaskStatus::InProgress)
            .await
            .unwrap();

        let fetched = store.get(&task.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, TaskStatus::InProgress);
    }

    #[tokio::test]
    async fn list_by_project_filters_correctly() {
        let store = InMemoryTaskStore::default();
        store.upsert(&Task::new("proj-1", "A", 0)).await.unwrap();
        store.upsert(&Task::new("proj-2", "B", 0)).await.unwrap();

        let tasks = store.list_by_project("proj-1").await.unwrap();
        assert_eq!(tasks.len(), 1);
    }
}
