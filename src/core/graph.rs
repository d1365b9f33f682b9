//! Task dependency graph and its validating builder.
//!
//! `TaskGraph` stores tasks in a petgraph `DiGraph`. Node indices follow
//! submission order and double as the numeric task id used for
//! deterministic tie-breaking. Edges point from a dependency to its
//! dependent and may carry a predicate evaluated against the dependency's
//! outputs.

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use uuid::Uuid;

use crate::core::predicate::Predicate;
use crate::core::task::{Task, TaskId, TaskSpec};
use crate::error::ValidationError;

/// Unique identifier for a submitted graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GraphId(pub Uuid);

impl GraphId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// First 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for GraphId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for GraphId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for GraphId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Edge payload: an optional condition on the upstream task's outputs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Dependency {
    pub condition: Option<Predicate>,
}

/// A validated, acyclic task graph.
#[derive(Clone)]
pub struct TaskGraph {
    graph: DiGraph<Task, Dependency>,
    index: HashMap<TaskId, NodeIndex>,
}

impl TaskGraph {
    /// Validate `specs` and build a graph from them.
    pub fn from_specs(specs: Vec<TaskSpec>) -> Result<Self, ValidationError> {
        GraphBuilder::from_specs(specs).build()
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Node indices in submission order.
    pub fn indices(&self) -> impl Iterator<Item = NodeIndex> + '_ {
        self.graph.node_indices()
    }

    pub fn node_index(&self, id: &TaskId) -> Option<NodeIndex> {
        self.index.get(id).copied()
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.index.contains_key(id)
    }

    pub fn task(&self, idx: NodeIndex) -> &Task {
        &self.graph[idx]
    }

    pub fn task_mut(&mut self, idx: NodeIndex) -> &mut Task {
        &mut self.graph[idx]
    }

    pub fn get(&self, id: &TaskId) -> Option<&Task> {
        self.node_index(id).map(|idx| &self.graph[idx])
    }

    pub fn get_mut(&mut self, id: &TaskId) -> Option<&mut Task> {
        let idx = self.node_index(id)?;
        Some(&mut self.graph[idx])
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.graph.node_weights()
    }

    /// Direct dependencies of `idx`, lowest index first.
    pub fn dependencies(&self, idx: NodeIndex) -> Vec<NodeIndex> {
        self.sorted_neighbors(idx, Direction::Incoming)
    }

    /// Direct dependents of `idx`, lowest index first.
    pub fn dependents(&self, idx: NodeIndex) -> Vec<NodeIndex> {
        self.sorted_neighbors(idx, Direction::Outgoing)
    }

    fn sorted_neighbors(&self, idx: NodeIndex, dir: Direction) -> Vec<NodeIndex> {
        let mut out: Vec<NodeIndex> = self.graph.neighbors_directed(idx, dir).collect();
        out.sort();
        out.dedup();
        out
    }

    pub fn dependency(&self, from: NodeIndex, to: NodeIndex) -> Option<&Dependency> {
        let edge = self.graph.find_edge(from, to)?;
        self.graph.edge_weight(edge)
    }

    /// Dependents of `idx` whose edge from `idx` carries a predicate.
    pub fn conditional_dependents(&self, idx: NodeIndex) -> Vec<(NodeIndex, &Predicate)> {
        self.dependents(idx)
            .into_iter()
            .filter_map(|to| {
                let predicate = self.dependency(idx, to)?.condition.as_ref()?;
                Some((to, predicate))
            })
            .collect()
    }

    /// Every task reachable downstream of `idx`, excluding `idx`, lowest index first.
    pub fn descendants(&self, idx: NodeIndex) -> Vec<NodeIndex> {
        let mut seen = HashSet::new();
        let mut queue: VecDeque<NodeIndex> = self.dependents(idx).into();
        while let Some(next) = queue.pop_front() {
            if seen.insert(next) {
                queue.extend(self.dependents(next));
            }
        }
        let mut out: Vec<NodeIndex> = seen.into_iter().collect();
        out.sort();
        out
    }

    /// Submission records in submission order.
    pub fn specs(&self) -> Vec<TaskSpec> {
        self.graph.node_weights().map(|t| t.spec.clone()).collect()
    }

    /// Reset every task's runtime fields.
    pub fn reset(&mut self) {
        for task in self.graph.node_weights_mut() {
            task.reset();
        }
    }
}

impl std::fmt::Debug for TaskGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskGraph")
            .field("tasks", &self.len())
            .field("dependencies", &self.edge_count())
            .finish()
    }
}

/// Collects task specs and validates them into a `TaskGraph`.
///
/// Validation order: duplicate ids, then resource weights, then unknown
/// dependencies (including a `when.from` that is not a declared dependency),
/// then cycles. Building is
/// pure and deterministic; the same specs always yield the same error.
#[derive(Debug, Default)]
pub struct GraphBuilder {
    specs: Vec<TaskSpec>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_specs(specs: Vec<TaskSpec>) -> Self {
        Self { specs }
    }

    pub fn task(mut self, spec: TaskSpec) -> Self {
        self.specs.push(spec);
        self
    }

    pub fn build(self) -> Result<TaskGraph, ValidationError> {
        let mut seen = HashSet::new();
        for spec in &self.specs {
            if !seen.insert(spec.id.clone()) {
                return Err(ValidationError::DuplicateId(spec.id.clone()));
            }
        }

        if let Some(spec) = self.specs.iter().find(|s| !s.resources.is_valid()) {
            return Err(ValidationError::InvalidResources {
                task: spec.id.clone(),
                cpu: spec.resources.cpu,
                mem: spec.resources.mem,
            });
        }

        for spec in &self.specs {
            for dep in &spec.depends_on {
                if !seen.contains(dep) {
                    return Err(ValidationError::MissingDependency {
                        task: spec.id.clone(),
                        missing: dep.clone(),
                    });
                }
            }
            for cond in &spec.when {
                if !spec.depends_on.contains(&cond.from) {
                    return Err(ValidationError::MissingDependency {
                        task: spec.id.clone(),
                        missing: cond.from.clone(),
                    });
                }
            }
        }

        let mut graph = DiGraph::with_capacity(self.specs.len(), 0);
        let mut index = HashMap::with_capacity(self.specs.len());
        for spec in &self.specs {
            let idx = graph.add_node(Task::new(spec.clone()));
            index.insert(spec.id.clone(), idx);
        }

        for spec in &self.specs {
            let to = index[&spec.id];
            for dep in &spec.depends_on {
                let from = index[dep];
                graph.add_edge(from, to, Dependency {
                    condition: edge_condition(spec, dep),
                });
            }
        }

        if let Some(cycle) = find_cycle(&graph) {
            return Err(ValidationError::CycleDetected {
                path: cycle.into_iter().map(|idx| graph[idx].spec.id.clone()).collect(),
            });
        }

        Ok(TaskGraph { graph, index })
    }
}

/// Combine every `when` clause declared on `spec` for the edge from `dep`.
fn edge_condition(spec: &TaskSpec, dep: &TaskId) -> Option<Predicate> {
    let mut preds: Vec<Predicate> = spec
        .when
        .iter()
        .filter(|c| &c.from == dep)
        .map(|c| c.predicate.clone())
        .collect();
    match preds.len() {
        0 => None,
        1 => preds.pop(),
        _ => Some(Predicate::All { predicates: preds }),
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Color {
    White,
    Gray,
    Black,
}

/// Iterative three-color DFS. Returns the first cycle found as a closed path
/// (first node repeated at the end), visiting nodes and neighbors in index order.
fn find_cycle(graph: &DiGraph<Task, Dependency>) -> Option<Vec<NodeIndex>> {
    let mut color = vec![Color::White; graph.node_count()];

    for root in graph.node_indices() {
        if color[root.index()] != Color::White {
            continue;
        }

        let mut stack: Vec<(NodeIndex, Vec<NodeIndex>, usize)> = Vec::new();
        color[root.index()] = Color::Gray;
        stack.push((root, sorted_out(graph, root), 0));

        while let Some((node, neighbors, pos)) = stack.last_mut() {
            if *pos == neighbors.len() {
                color[node.index()] = Color::Black;
                stack.pop();
                continue;
            }
            let next = neighbors[*pos];
            *pos += 1;

            match color[next.index()] {
                Color::White => {
                    color[next.index()] = Color::Gray;
                    let out = sorted_out(graph, next);
                    stack.push((next, out, 0));
                }
                Color::Gray => {
                    let start = stack.iter().position(|(n, _, _)| *n == next)?;
                    let mut path: Vec<NodeIndex> =
                        stack[start..].iter().map(|(n, _, _)| *n).collect();
                    path.push(next);
                    return Some(path);
                }
                Color::Black => {}
            }
        }
    }
    None
}

fn sorted_out(graph: &DiGraph<Task, Dependency>, idx: NodeIndex) -> Vec<NodeIndex> {
    let mut out: Vec<NodeIndex> = graph.neighbors_directed(idx, Direction::Outgoing).collect();
    out.sort();
    out
}
