//! Dependency graph, recursive decomposition, lifecycle, scheduling, and
//! execution coordination for the Vibe task orchestration engine. Built on
//! the types and error taxonomy in `vibe_core`.

pub mod coordinator;
pub mod decomposition_service;
pub mod graph;
pub mod lifecycle;
pub mod rdd;
pub mod scheduler;
pub mod timeout;

pub use coordinator::{BatchExecutionReport, ExecutionCoordinator};
pub use decomposition_service::DecompositionService;
pub use graph::DependencyGraph;
pub use lifecycle::{allowed_transitions, is_transition_allowed, AutomationReport, LifecycleService};
pub use rdd::{DecompositionOutcome, RddEngine};
pub use scheduler::{ResourceEstimate, Scheduler};
pub use timeout::{AdaptiveTimeoutManager, BackoffPolicy};
