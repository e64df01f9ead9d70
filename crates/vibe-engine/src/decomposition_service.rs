//! Decomposition Service: the application-facing entry point that wraps
//! the Recursive Decomposition Engine with persistence. Runs a
//! decomposition, writes every resulting task to the configured
//! `TaskStore`, and can export or re-import a session as a
//! `SessionSnapshot` so a caller can resume work against the same task set
//! later without re-running the LLM.

use std::sync::Arc;

use tracing::instrument;
use vibe_core::{
    DecompositionSession, OrchestratorResult, ProjectContext, SessionSnapshot, Task, TaskStore,
};

use crate::rdd::RddEngine;

pub struct DecompositionService {
    engine: RddEngine,
    store: Arc<dyn TaskStore>,
}

impl DecompositionService {
    pub fn new(engine: RddEngine, store: Arc<dyn TaskStore>) -> Self {
        Self { engine, store }
    }

    /// Decomposes `root`, persists every produced task to the store, and
    /// returns the session record plus the inferred dependency edges (the
    /// caller hands those to the `DependencyGraph` directly, since this
    /// service only owns task persistence).
    #[instrument(skip(self, ctx))]
    pub async fn run_decomposition(
        &self,
        root: Task,
        ctx: &ProjectContext,
    ) -> OrchestratorResult<(DecompositionSession, Vec<vibe_core::DependencyEdge>)> {
        let outcome = self.engine.decompose(root, ctx).await?;

        for task in &outcome.tasks {
            self.store.upsert(task).await?;
        }

        Ok((outcome.session, outcome.edges))
    }

    /// Addresses the divergence between a session's in-memory `results`
    /// and whatever subset of tasks actually made it to the store: the
    /// snapshot always re-reads from the store rather than trusting the
    /// session's own `persisted_task_ids`, so a caller importing it later
    /// sees exactly what's durable.
    pub async fn export_session(
        &self,
        session: &DecompositionSession,
    ) -> OrchestratorResult<SessionSnapshot> {
        let tasks = self.store.list_by_project(&session.project_id).await?;
        let edges = crate::graph::DependencyGraph::infer_dependencies(&tasks);

        Ok(SessionSnapshot {
            session: session.clone(),
            tasks,
            edges,
        })
    }

    pub async fn import_session(&self, snapshot: SessionSnapshot) -> OrchestratorResult<()> {
        for task in &snapshot.tasks {
            self.store.upsert(task).await?;
        }
        Ok(())
    }
}
