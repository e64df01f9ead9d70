//! Scheduler: turns a dependency graph plus per-task duration estimates
//! into a `Schedule` — ordered parallel batches, a critical path, and a
//! parallelism factor. The batching and critical-path math mirror
//! `terraphim_task_decomposition::planning::KnowledgeGraphExecutionPlanner`
//! (`topological_sort`, `find_critical_path`, `calculate_parallelism_factor`),
//! adapted to this engine's `Task`/`Schedule` types and its resource-cap
//! based batch splitting. Within a topological batch, task order (and
//! therefore which sub-batch a task lands in once the resource cap
//! splits it) is decided by `SchedulerConfig.algorithm`.

use std::collections::{HashMap, HashSet};

use tracing::instrument;
use vibe_core::{
    ExecutionBatch, OrchestratorError, OrchestratorResult, Priority, Schedule, ScheduledTask,
    SchedulerConfig, Task, TaskId, TaskStatus,
};

use crate::graph::DependencyGraph;

pub struct Scheduler {
    config: SchedulerConfig,
}

/// Per-task resource reservation used when splitting a topological batch
/// that would otherwise exceed the configured caps. Development-shaped
/// tasks (the common case) get the default; testing tasks are lighter,
/// deployment tasks heavier and harder to parallelize.
#[derive(Debug, Clone, Copy)]
pub struct ResourceEstimate {
    pub cpu_cores: f64,
    pub memory_mb: f64,
}

impl Default for ResourceEstimate {
    fn default() -> Self {
        Self {
            cpu_cores: 0.7,
            memory_mb: 512.0,
        }
    }
}

impl ResourceEstimate {
    fn testing() -> Self {
        Self {
            cpu_cores: 0.5,
            memory_mb: 256.0,
        }
    }

    fn deployment() -> Self {
        Self {
            cpu_cores: 0.9,
            memory_mb: 1024.0,
        }
    }
}

/// Combined score weights for the `hybrid_optimal` algorithm (the
/// default): priority dominates, deadline urgency next, raw resource
/// cheapness last.
const HYBRID_PRIORITY_WEIGHT: f64 = 0.45;
const HYBRID_RESOURCE_WEIGHT: f64 = 0.25;
const HYBRID_DEADLINE_WEIGHT: f64 = 0.30;

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self { config }
    }

    #[instrument(skip(self, graph, tasks))]
    pub fn generate_schedule(
        &self,
        project_id: &str,
        graph: &DependencyGraph,
        tasks: &[Task],
    ) -> OrchestratorResult<Schedule> {
        if tasks.is_empty() {
            return Err(OrchestratorError::empty_schedule(project_id));
        }

        let durations: HashMap<TaskId, f64> = tasks
            .iter()
            .map(|t| (t.id.clone(), t.estimated_minutes.unwrap_or(30) as f64))
            .collect();

        let by_id: HashMap<&TaskId, &Task> = tasks.iter().map(|t| (&t.id, t)).collect();
        let (critical_path, critical_path_duration_minutes) = graph.critical_path(&durations);

        let mut downstream_memo: HashMap<TaskId, f64> = HashMap::new();
        for id in by_id.keys() {
            downstream_duration(id, graph, &durations, &mut downstream_memo);
        }

        let raw_batches = graph.topological_batches()?;

        let mut batches = Vec::new();
        let mut scheduled_tasks = Vec::new();
        let mut offset_minutes = 0.0_f64;

        for raw_batch in raw_batches {
            // `graph` may carry nodes outside `tasks` (e.g. already-locked
            // tasks `update_schedule` excluded on purpose); only schedule
            // the ones this call was actually asked to plan.
            let raw_batch: Vec<TaskId> = raw_batch.into_iter().filter(|id| by_id.contains_key(id)).collect();
            if raw_batch.is_empty() {
                continue;
            }

            let ordered = self.order_within_batch(
                &raw_batch,
                &by_id,
                &downstream_memo,
                &critical_path,
                critical_path_duration_minutes,
            );

            for split in self.split_by_resource_cap(&ordered, &by_id) {
                let batch_duration = split
                    .iter()
                    .map(|id| durations.get(id).copied().unwrap_or(30.0))
                    .fold(0.0_f64, f64::max);

                let index = batches.len();
                for task_id in &split {
                    let estimate = self.resource_estimate(by_id.get(task_id).map(|t| &**t));
                    scheduled_tasks.push(ScheduledTask {
                        task_id: task_id.clone(),
                        batch_index: index,
                        estimated_start_offset_minutes: offset_minutes,
                        estimated_duration_minutes: durations
                            .get(task_id)
                            .copied()
                            .unwrap_or(30.0),
                        reserved_cpu_cores: estimate.cpu_cores,
                        reserved_memory_mb: estimate.memory_mb,
                    });
                }

                batches.push(ExecutionBatch {
                    index,
                    task_ids: split,
                    estimated_duration_minutes: batch_duration,
                });
                offset_minutes += batch_duration;
            }
        }

        let parallelism_factor = if batches.is_empty() {
            0.0
        } else {
            tasks.len() as f64 / batches.len() as f64
        };

        Ok(Schedule {
            project_id: project_id.to_string(),
            batches,
            scheduled_tasks,
            critical_path,
            critical_path_duration_minutes,
            parallelism_factor,
            generated_at: chrono::Utc::now(),
        })
    }

    /// Re-plans `tasks` around a schedule already in flight: tasks that
    /// are `in_progress` or `completed` keep whatever batch `existing`
    /// assigned them (their execution has already started or finished,
    /// so moving them would be meaningless), while everything else is
    /// scheduled fresh and appended after the preserved batches.
    #[instrument(skip(self, graph, tasks, existing))]
    pub fn update_schedule(
        &self,
        project_id: &str,
        graph: &DependencyGraph,
        tasks: &[Task],
        existing: &Schedule,
    ) -> OrchestratorResult<Schedule> {
        let locked_ids: HashSet<TaskId> = tasks
            .iter()
            .filter(|t| matches!(t.status, TaskStatus::InProgress | TaskStatus::Completed))
            .map(|t| t.id.clone())
            .collect();

        let mut locked_batches: Vec<ExecutionBatch> = existing
            .batches
            .iter()
            .map(|b| ExecutionBatch {
                index: b.index,
                task_ids: b
                    .task_ids
                    .iter()
                    .filter(|id| locked_ids.contains(*id))
                    .cloned()
                    .collect(),
                estimated_duration_minutes: b.estimated_duration_minutes,
            })
            .filter(|b| !b.task_ids.is_empty())
            .collect();
        let mut locked_scheduled: Vec<ScheduledTask> = existing
            .scheduled_tasks
            .iter()
            .filter(|st| locked_ids.contains(&st.task_id))
            .cloned()
            .collect();

        let remaining: Vec<Task> = tasks
            .iter()
            .filter(|t| !locked_ids.contains(&t.id))
            .cloned()
            .collect();

        if remaining.is_empty() {
            let parallelism_factor = if locked_batches.is_empty() {
                0.0
            } else {
                locked_scheduled.len() as f64 / locked_batches.len() as f64
            };
            return Ok(Schedule {
                project_id: project_id.to_string(),
                batches: locked_batches,
                scheduled_tasks: locked_scheduled,
                critical_path: existing.critical_path.clone(),
                critical_path_duration_minutes: existing.critical_path_duration_minutes,
                parallelism_factor,
                generated_at: chrono::Utc::now(),
            });
        }

        let fresh = self.generate_schedule(project_id, graph, &remaining)?;

        let batch_offset = locked_batches.len();
        let time_offset = locked_scheduled
            .iter()
            .map(|s| s.estimated_start_offset_minutes + s.estimated_duration_minutes)
            .fold(0.0_f64, f64::max);

        let mut fresh_batches = fresh.batches;
        for batch in &mut fresh_batches {
            batch.index += batch_offset;
        }
        let mut fresh_scheduled = fresh.scheduled_tasks;
        for st in &mut fresh_scheduled {
            st.batch_index += batch_offset;
            st.estimated_start_offset_minutes += time_offset;
        }

        locked_batches.extend(fresh_batches);
        locked_scheduled.extend(fresh_scheduled);

        let parallelism_factor = if locked_batches.is_empty() {
            0.0
        } else {
            locked_scheduled.len() as f64 / locked_batches.len() as f64
        };

        Ok(Schedule {
            project_id: project_id.to_string(),
            batches: locked_batches,
            scheduled_tasks: locked_scheduled,
            critical_path: fresh.critical_path,
            critical_path_duration_minutes: fresh.critical_path_duration_minutes,
            parallelism_factor,
            generated_at: chrono::Utc::now(),
        })
    }

    fn resource_estimate(&self, task: Option<&Task>) -> ResourceEstimate {
        let Some(task) = task else {
            return ResourceEstimate::default();
        };
        let mut estimate = if task.tags.iter().any(|t| t == "deployment") {
            ResourceEstimate::deployment()
        } else if task.tags.iter().any(|t| t == "testing") {
            ResourceEstimate::testing()
        } else {
            ResourceEstimate::default()
        };

        match task.priority {
            Priority::Critical => {
                estimate.cpu_cores *= 2.0;
                estimate.memory_mb *= 4.0;
            }
            Priority::High => {
                estimate.cpu_cores *= 1.5;
                estimate.memory_mb *= 2.0;
            }
            _ => {}
        }
        estimate
    }

    fn priority_score(task: &Task) -> f64 {
        match task.priority {
            Priority::Low => 0.25,
            Priority::Medium => 0.5,
            Priority::High => 0.75,
            Priority::Critical => 1.0,
        }
    }

    /// Higher for cheaper tasks: a task that reserves little of the cap
    /// leaves more room for the rest of the batch to run alongside it.
    fn resource_score(&self, task: Option<&Task>) -> f64 {
        let estimate = self.resource_estimate(task);
        let cpu_fraction = (estimate.cpu_cores / self.config.max_cpu_cores.max(f64::EPSILON)).min(1.0);
        let mem_fraction = (estimate.memory_mb / self.config.max_memory_mb.max(f64::EPSILON)).min(1.0);
        (1.0 - (cpu_fraction + mem_fraction) / 2.0).clamp(0.0, 1.0)
    }

    /// Higher for tasks that gate more downstream work: a task whose
    /// completion unblocks a long remaining chain is more urgent than one
    /// whose dependents are shallow.
    fn deadline_score(task_id: &TaskId, downstream: &HashMap<TaskId, f64>, critical_path_duration: f64) -> f64 {
        if critical_path_duration <= 0.0 {
            return 0.0;
        }
        (downstream.get(task_id).copied().unwrap_or(0.0) / critical_path_duration).min(1.0)
    }

    fn combined_score(
        &self,
        task: Option<&Task>,
        task_id: &TaskId,
        downstream: &HashMap<TaskId, f64>,
        critical_path: &[TaskId],
        critical_path_duration: f64,
    ) -> f64 {
        let priority = task.map(Self::priority_score).unwrap_or(0.5);
        let resource = self.resource_score(task);
        let deadline = Self::deadline_score(task_id, downstream, critical_path_duration);

        match self.config.algorithm.as_str() {
            "priority_first" => priority,
            "resource_aware" => resource,
            "deadline_driven" => deadline,
            "critical_path" => {
                if critical_path.contains(task_id) {
                    1.0
                } else {
                    deadline * 0.5
                }
            }
            // "hybrid_optimal" and any unrecognized name fall back to the
            // balanced default rather than silently ignoring the config.
            _ => priority * HYBRID_PRIORITY_WEIGHT + resource * HYBRID_RESOURCE_WEIGHT + deadline * HYBRID_DEADLINE_WEIGHT,
        }
    }

    /// Orders a single topological batch by the configured algorithm's
    /// combined score (descending), breaking ties by estimated duration
    /// (ascending, so quick wins come first) and finally by task id
    /// (ascending, for a fully deterministic order).
    fn order_within_batch(
        &self,
        batch: &[TaskId],
        by_id: &HashMap<&TaskId, &Task>,
        downstream: &HashMap<TaskId, f64>,
        critical_path: &[TaskId],
        critical_path_duration: f64,
    ) -> Vec<TaskId> {
        let mut scored: Vec<(TaskId, f64, f64)> = batch
            .iter()
            .map(|id| {
                let task = by_id.get(id).map(|t| &**t);
                let score = self.combined_score(task, id, downstream, critical_path, critical_path_duration);
                let hours = task
                    .and_then(|t| t.estimated_minutes)
                    .map(|m| m as f64 / 60.0)
                    .unwrap_or(0.5);
                (id.clone(), score, hours)
            })
            .collect();

        scored.sort_by(|a, b| {
            b.1.total_cmp(&a.1)
                .then_with(|| a.2.total_cmp(&b.2))
                .then_with(|| a.0.cmp(&b.0))
        });

        scored.into_iter().map(|(id, _, _)| id).collect()
    }

    /// A topological batch is independently parallelizable, but the
    /// scheduler still must not exceed `max_concurrent_tasks`,
    /// `max_cpu_cores`, or `max_memory_mb` for a single batch. Oversized
    /// batches are split, in the caller's order, into smaller batches
    /// that respect the caps; the caller is expected to have already
    /// ordered `batch` so the tasks that matter most land in the
    /// earliest split.
    fn split_by_resource_cap(
        &self,
        batch: &[TaskId],
        by_id: &HashMap<&TaskId, &Task>,
    ) -> Vec<Vec<TaskId>> {
        let mut result = Vec::new();
        let mut current: Vec<TaskId> = Vec::new();
        let mut cpu_used = 0.0_f64;
        let mut mem_used = 0.0_f64;

        for task_id in batch {
            let estimate = self.resource_estimate(by_id.get(task_id).map(|t| &**t));
            let would_exceed_count = current.len() + 1 > self.config.max_concurrent_tasks as usize;
            let would_exceed_cpu = cpu_used + estimate.cpu_cores > self.config.max_cpu_cores;
            let would_exceed_mem = mem_used + estimate.memory_mb > self.config.max_memory_mb;

            if !current.is_empty() && (would_exceed_count || would_exceed_cpu || would_exceed_mem) {
                result.push(std::mem::take(&mut current));
                cpu_used = 0.0;
                mem_used = 0.0;
            }

            cpu_used += estimate.cpu_cores;
            mem_used += estimate.memory_mb;
            current.push(task_id.clone());
        }

        if !current.is_empty() {
            result.push(current);
        }

        result
    }
}

fn downstream_duration(
    task_id: &TaskId,
    graph: &DependencyGraph,
    durations: &HashMap<TaskId, f64>,
    memo: &mut HashMap<TaskId, f64>,
) -> f64 {
    if let Some(&cached) = memo.get(task_id) {
        return cached;
    }
    let own = durations.get(task_id).copied().unwrap_or(0.0);
    let best_downstream = graph
        .dependents_of(task_id)
        .iter()
        .map(|dep| downstream_duration(dep, graph, durations, memo))
        .fold(0.0_f64, f64::max);
    let total = own + best_downstream;
    memo.insert(task_id.clone(), total);
    total
}
