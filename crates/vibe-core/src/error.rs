//! Error taxonomy for the orchestration engine.
//!
//! A single flat enum carries every failure mode the engine needs to
//! distinguish. Each variant exposes `recoverable()`, `severity()`, and
//! `recovery_hint()` so callers can decide whether to retry, fall back, or
//! surface the failure to an operator without matching on variants
//! themselves.

use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

/// Severity classification for an `OrchestratorError`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Low => write!(f, "low"),
            Severity::Medium => write!(f, "medium"),
            Severity::High => write!(f, "high"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("validation failed in {operation}: {message}")]
    Validation { operation: String, message: String },

    #[error("dependency cycle detected while adding {from} -> {to}")]
    DependencyCycle { from: String, to: String },

    #[error("dependency not ready for task {task_id}: {pending_deps:?}")]
    DependencyNotReady {
        task_id: String,
        pending_deps: Vec<String>,
    },

    #[error("unknown task referenced: {task_id}")]
    UnknownTask { task_id: String },

    #[error("invalid transition for task {task_id}: {from} -> {to}")]
    InvalidTransition {
        task_id: String,
        from: String,
        to: String,
    },

    #[error("cannot schedule an empty task set for project {project_id}")]
    EmptySchedule { project_id: String },

    #[error("resource overcommit: {resource} requested {requested}, cap {cap}")]
    ResourceOvercommit {
        resource: String,
        requested: f64,
        cap: f64,
    },

    #[error("LLM adapter unavailable: {message}")]
    LlmUnavailable { message: String },

    #[error("failed to parse LLM response for {operation}: {message}")]
    ParseFailure { operation: String, message: String },

    #[error("agent dispatch error for task {task_id}: {message}")]
    AgentDispatchError { task_id: String, message: String },

    #[error("agent timed out for task {task_id} after {elapsed_ms}ms")]
    AgentTimeout { task_id: String, elapsed_ms: u64 },

    #[error("configuration error: {message}")]
    ConfigError { message: String },

    #[error("operation {operation} was cancelled")]
    Cancelled { operation: String },
}

impl OrchestratorError {
    pub fn validation(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn dependency_cycle(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self::DependencyCycle {
            from: from.into(),
            to: to.into(),
        }
    }

    pub fn dependency_not_ready(task_id: impl Into<String>, pending_deps: Vec<String>) -> Self {
        Self::DependencyNotReady {
            task_id: task_id.into(),
            pending_deps,
        }
    }

    pub fn unknown_task(task_id: impl Into<String>) -> Self {
        Self::UnknownTask {
            task_id: task_id.into(),
        }
    }

    pub fn invalid_transition(
        task_id: impl Into<String>,
        from: impl Into<String>,
        to: impl Into<String>,
    ) -> Self {
        Self::InvalidTransition {
            task_id: task_id.into(),
            from: from.into(),
            to: to.into(),
        }
    }

    pub fn empty_schedule(project_id: impl Into<String>) -> Self {
        Self::EmptySchedule {
            project_id: project_id.into(),
        }
    }

    pub fn resource_overcommit(resource: impl Into<String>, requested: f64, cap: f64) -> Self {
        Self::ResourceOvercommit {
            resource: resource.into(),
            requested,
            cap,
        }
    }

    pub fn config_error(message: impl Into<String>) -> Self {
        Self::ConfigError {
            message: message.into(),
        }
    }

    pub fn cancelled(operation: impl Into<String>) -> Self {
        Self::Cancelled {
            operation: operation.into(),
        }
    }

    /// Whether the caller can reasonably retry or fall back instead of
    /// aborting the containing operation.
    pub fn recoverable(&self) -> bool {
        matches!(
            self,
            OrchestratorError::LlmUnavailable { .. }
                | OrchestratorError::ParseFailure { .. }
                | OrchestratorError::AgentTimeout { .. }
                | OrchestratorError::AgentDispatchError { .. }
        )
    }

    pub fn severity(&self) -> Severity {
        match self {
            OrchestratorError::Validation { .. } => Severity::Medium,
            OrchestratorError::DependencyCycle { .. } => Severity::High,
            OrchestratorError::DependencyNotReady { .. } => Severity::Low,
            OrchestratorError::UnknownTask { .. } => Severity::Medium,
            OrchestratorError::InvalidTransition { .. } => Severity::Medium,
            OrchestratorError::EmptySchedule { .. } => Severity::Medium,
            OrchestratorError::ResourceOvercommit { .. } => Severity::High,
            OrchestratorError::LlmUnavailable { .. } => Severity::Low,
            OrchestratorError::ParseFailure { .. } => Severity::Low,
            OrchestratorError::AgentDispatchError { .. } => Severity::Medium,
            OrchestratorError::AgentTimeout { .. } => Severity::Medium,
            OrchestratorError::ConfigError { .. } => Severity::Critical,
            OrchestratorError::Cancelled { .. } => Severity::Low,
        }
    }

    pub fn operation(&self) -> &'static str {
        match self {
            OrchestratorError::Validation { .. } => "validation",
            OrchestratorError::DependencyCycle { .. } => "dependency_graph.add_dependency",
            OrchestratorError::DependencyNotReady { .. } => "lifecycle.transition",
            OrchestratorError::UnknownTask { .. } => "dependency_graph.lookup",
            OrchestratorError::InvalidTransition { .. } => "lifecycle.transition",
            OrchestratorError::EmptySchedule { .. } => "scheduler.generate_schedule",
            OrchestratorError::ResourceOvercommit { .. } => "scheduler.allocate",
            OrchestratorError::LlmUnavailable { .. } => "atomicity_detector.analyze",
            OrchestratorError::ParseFailure { .. } => "rdd.decompose",
            OrchestratorError::AgentDispatchError { .. } => "coordinator.dispatch",
            OrchestratorError::AgentTimeout { .. } => "coordinator.dispatch",
            OrchestratorError::ConfigError { .. } => "config.load",
            OrchestratorError::Cancelled { .. } => "cancellation",
        }
    }

    /// A human-readable recovery hint: reason plus a concrete next step,
    /// suitable for surfacing directly to an operator.
    pub fn recovery_hint(&self) -> String {
        match self {
            OrchestratorError::DependencyNotReady {
                task_id,
                pending_deps,
            } => format!(
                "dependencies not completed for {task_id}: {}",
                pending_deps.join(", ")
            ),
            OrchestratorError::DependencyCycle { from, to } => format!(
                "adding {from} -> {to} would create a cycle; remove a conflicting edge first"
            ),
            OrchestratorError::ResourceOvercommit { resource, .. } => {
                format!("reduce concurrent {resource} usage or raise the configured cap")
            }
            OrchestratorError::LlmUnavailable { .. } => {
                "LLM provider unavailable; caller should apply a deterministic fallback"
                    .to_string()
            }
            OrchestratorError::ConfigError { message } => {
                format!("fix the configuration and reload: {message}")
            }
            other => other.to_string(),
        }
    }

    /// Structured context for logging/telemetry sinks.
    pub fn context(&self) -> HashMap<String, String> {
        let mut ctx = HashMap::new();
        ctx.insert("operation".to_string(), self.operation().to_string());
        ctx.insert("severity".to_string(), self.severity().to_string());
        ctx.insert("recoverable".to_string(), self.recoverable().to_string());
        ctx
    }
}

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;
