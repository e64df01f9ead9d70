//! Core data model: tasks, dependency edges, atomicity analyses,
//! decomposition sessions, schedules, and lifecycle transition records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

pub type TaskId = String;

fn new_id(prefix: &str) -> TaskId {
    format!("{prefix}-{}", Uuid::new_v4())
}

/// A unit of work in the decomposition tree. Epics are tasks with
/// `subtask_ids` populated; atomic tasks are leaves.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub project_id: String,
    pub title: String,
    pub description: String,
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub priority: Priority,
    pub depth: u32,
    pub parent_id: Option<TaskId>,
    #[serde(default)]
    pub subtask_ids: Vec<TaskId>,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    #[serde(default)]
    pub affected_files: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub estimated_minutes: Option<u32>,
    pub confidence: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Task {
    pub fn new(project_id: impl Into<String>, title: impl Into<String>, depth: u32) -> Self {
        let now = Utc::now();
        Self {
            id: new_id("task"),
            project_id: project_id.into(),
            title: title.into(),
            description: String::new(),
            task_type: TaskType::Task,
            status: TaskStatus::Pending,
            priority: Priority::Medium,
            depth,
            parent_id: None,
            subtask_ids: Vec::new(),
            acceptance_criteria: Vec::new(),
            affected_files: Vec::new(),
            tags: Vec::new(),
            estimated_minutes: None,
            confidence: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            metadata: HashMap::new(),
        }
    }

    pub fn is_epic(&self) -> bool {
        !self.subtask_ids.is_empty()
    }

    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn with_acceptance_criteria(mut self, criteria: Vec<String>) -> Self {
        self.acceptance_criteria = criteria;
        self
    }

    pub fn with_affected_files(mut self, files: Vec<String>) -> Self {
        self.affected_files = files;
        self
    }

    pub fn with_estimated_minutes(mut self, minutes: u32) -> Self {
        self.estimated_minutes = Some(minutes);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Epic,
    Task,
    Subtask,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

/// Lifecycle state of a task. Transitions are enforced by
/// `vibe_engine::lifecycle` against a fixed table:
///
/// - `Pending` -> `InProgress` | `Blocked` | `Cancelled`
/// - `InProgress` -> `Completed` | `Failed` | `Blocked` | `Cancelled`
/// - `Blocked` -> `InProgress` | `Failed` | `Cancelled`
/// - `Failed` -> `Pending` | `Cancelled`
/// - `Cancelled` -> `Pending`
/// - `Completed` -> `Cancelled`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Blocked,
    Completed,
    Failed,
    Cancelled,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Blocked => "blocked",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// Context handed to the decomposition and atomicity-detection pipeline:
/// everything known about the surrounding project that isn't part of the
/// task text itself.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectContext {
    pub project_id: String,
    #[serde(default)]
    pub tech_stack: Vec<String>,
    #[serde(default)]
    pub existing_files: Vec<String>,
    #[serde(default)]
    pub conventions: HashMap<String, String>,
    #[serde(default)]
    pub complexity: ComplexityLevel,
}

/// A coarse signal about how involved the surrounding project is, folded
/// into the Atomicity Detector's critical-priority rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComplexityLevel {
    Low,
    #[default]
    Medium,
    High,
}

/// A directed edge in the dependency graph. `kind` distinguishes explicit
/// author-declared edges from edges the graph inferred (shared file
/// overlap, parent/child containment, matching input/output names).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencyEdge {
    pub from: TaskId,
    pub to: TaskId,
    pub kind: DependencyKind,
    pub confidence: f64,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyKind {
    Explicit,
    ParentChild,
    FileOverlap,
    DataFlow,
}

/// The outcome of running the Atomicity Detector against a single task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AtomicityAnalysis {
    pub task_id: TaskId,
    pub is_atomic: bool,
    pub confidence: f64,
    pub reasoning: String,
    pub estimated_hours: Option<f64>,
    #[serde(default)]
    pub complexity_factors: Vec<String>,
    #[serde(default)]
    pub recommendations: Vec<String>,
    pub analyzed_at: DateTime<Utc>,
}

/// One run of the Recursive Decomposition Engine against a root task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecompositionSession {
    pub session_id: String,
    pub project_id: String,
    pub root_task_id: TaskId,
    pub status: DecompositionSessionStatus,
    #[serde(default)]
    pub persisted_task_ids: Vec<TaskId>,
    #[serde(default)]
    pub analyses: Vec<AtomicityAnalysis>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl DecompositionSession {
    pub fn new(project_id: impl Into<String>, root_task_id: impl Into<String>) -> Self {
        Self {
            session_id: new_id("session"),
            project_id: project_id.into(),
            root_task_id: root_task_id.into(),
            status: DecompositionSessionStatus::Running,
            persisted_task_ids: Vec::new(),
            analyses: Vec::new(),
            started_at: Utc::now(),
            completed_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecompositionSessionStatus {
    Running,
    Completed,
    Failed,
}

/// A serializable snapshot of a `DecompositionSession`, used for
/// export/import round-trips between runs of the same session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session: DecompositionSession,
    pub tasks: Vec<Task>,
    pub edges: Vec<DependencyEdge>,
}

/// A task as placed by the Scheduler: which parallel batch it landed in and
/// what resources it reserved.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub task_id: TaskId,
    pub batch_index: usize,
    pub estimated_start_offset_minutes: f64,
    pub estimated_duration_minutes: f64,
    pub reserved_cpu_cores: f64,
    pub reserved_memory_mb: f64,
}

/// A group of tasks the Scheduler considers safe to run in parallel: no
/// task in the batch depends on another task in the same batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionBatch {
    pub index: usize,
    pub task_ids: Vec<TaskId>,
    pub estimated_duration_minutes: f64,
}

/// The full output of a scheduling pass over a project's task set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    pub project_id: String,
    pub batches: Vec<ExecutionBatch>,
    pub scheduled_tasks: Vec<ScheduledTask>,
    pub critical_path: Vec<TaskId>,
    pub critical_path_duration_minutes: f64,
    pub parallelism_factor: f64,
    pub generated_at: DateTime<Utc>,
}

/// An audit record of a single lifecycle transition, kept for debugging
/// cascades and for the Execution Coordinator's progress stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub task_id: TaskId,
    pub from: TaskStatus,
    pub to: TaskStatus,
    pub reason: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

impl TransitionRecord {
    pub fn new(task_id: impl Into<String>, from: TaskStatus, to: TaskStatus) -> Self {
        Self {
            task_id: task_id.into(),
            from,
            to,
            reason: None,
            occurred_at: Utc::now(),
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}
