//! Core types, configuration, error taxonomy, and the atomicity detector
//! for the Vibe task orchestration engine. `vibe-engine` builds the
//! stateful subsystems (dependency graph, decomposition, lifecycle,
//! scheduling, execution coordination) on top of what's defined here.

pub mod adapters;
pub mod atomicity;
pub mod config;
pub mod error;
pub mod events;
pub mod traits;
pub mod types;

pub use adapters::{
    AgentAdapter, AgentDispatchRequest, AgentDispatchResponse, LlmAdapter, LlmCompletionRequest,
    LlmCompletionResponse, TaskStore,
};
pub use atomicity::{AtomicityDetector, AtomicityThresholds};
pub use config::{AutomationConfig, OrchestratorConfig, RddConfig, SchedulerConfig, TimeoutConfig};
pub use error::{OrchestratorError, OrchestratorResult, Severity};
pub use events::{EventBus, OrchestratorEvent};
pub use traits::{HealthCheck, HealthStatus};
pub use types::{
    AtomicityAnalysis, ComplexityLevel, DecompositionSession, DecompositionSessionStatus,
    DependencyEdge, DependencyKind, ExecutionBatch, Priority, ProjectContext, Schedule,
    ScheduledTask, SessionSnapshot, Task, TaskId, TaskStatus, TaskType, TransitionRecord,
};
