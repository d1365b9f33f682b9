//! Wave planner for parallel task execution.
//!
//! The Scheduler turns a validated `TaskGraph` into an `ExecutionPlan`: an
//! ordered list of waves whose tasks may run concurrently, plus the critical
//! path through the graph. Waves are produced with Kahn's algorithm; each
//! wave is filled greedily by priority under a resource capacity and the
//! remainder is deferred to the next wave.

use petgraph::graph::NodeIndex;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap, HashSet};

use crate::core::graph::TaskGraph;
use crate::core::task::{Resources, TaskId};
use crate::error::ValidationError;

/// A set of tasks that may run concurrently.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Wave {
    pub tasks: Vec<TaskId>,
    /// Longest estimate among the wave's tasks.
    pub estimated_duration_ms: u64,
}

/// Ordered waves plus critical-path information.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub waves: Vec<Wave>,
    pub critical_path: Vec<TaskId>,
    pub estimated_total_duration_ms: u64,
    /// Incremented every time the plan is spliced by replanning.
    pub revision: u32,
}

impl ExecutionPlan {
    pub fn wave_count(&self) -> usize {
        self.waves.len()
    }

    pub fn task_count(&self) -> usize {
        self.waves.iter().map(|w| w.tasks.len()).sum()
    }

    /// Wave index of every planned task.
    pub fn wave_index(&self) -> HashMap<TaskId, usize> {
        let mut map = HashMap::with_capacity(self.task_count());
        for (i, wave) in self.waves.iter().enumerate() {
            for id in &wave.tasks {
                map.insert(id.clone(), i);
            }
        }
        map
    }

    pub fn wave_of(&self, id: &TaskId) -> Option<usize> {
        self.waves.iter().position(|w| w.tasks.contains(id))
    }

    /// Keep waves `..=completed` and append `tail`'s waves after them.
    ///
    /// The critical path and total come from `tail`, which covers the
    /// remaining work only.
    pub fn splice(&self, completed: Option<usize>, tail: ExecutionPlan) -> ExecutionPlan {
        let keep = completed.map(|k| k + 1).unwrap_or(0).min(self.waves.len());
        let mut waves: Vec<Wave> = self.waves[..keep].to_vec();
        waves.extend(tail.waves);
        ExecutionPlan {
            waves,
            critical_path: tail.critical_path,
            estimated_total_duration_ms: tail.estimated_total_duration_ms,
            revision: self.revision + 1,
        }
    }
}

/// Computes execution plans under a resource capacity.
#[derive(Debug, Clone, Copy)]
pub struct Scheduler {
    capacity: Resources,
}

impl Scheduler {
    pub fn new(capacity: Resources) -> Self {
        Self { capacity }
    }

    pub fn capacity(&self) -> Resources {
        self.capacity
    }

    /// Plan every task in the graph using the submitted estimates.
    pub fn schedule(&self, graph: &TaskGraph) -> Result<ExecutionPlan, ValidationError> {
        let include: HashSet<NodeIndex> = graph.indices().collect();
        self.schedule_subset(graph, &include, |idx| {
            graph.task(idx).spec.estimated_duration_ms
        })
    }

    /// Plan only the tasks in `include`.
    ///
    /// Dependencies outside `include` are treated as satisfied. `estimate`
    /// supplies the duration used for wave estimates and the critical path.
    pub fn schedule_subset<F>(
        &self,
        graph: &TaskGraph,
        include: &HashSet<NodeIndex>,
        estimate: F,
    ) -> Result<ExecutionPlan, ValidationError>
    where
        F: Fn(NodeIndex) -> u64,
    {
        let mut members: Vec<NodeIndex> = include.iter().copied().collect();
        members.sort();

        for &idx in &members {
            let spec = &graph.task(idx).spec;
            if !self.capacity.fits(&spec.resources) {
                return Err(ValidationError::Infeasible {
                    task: spec.id.clone(),
                    cpu: spec.resources.cpu,
                    mem: spec.resources.mem,
                    capacity_cpu: self.capacity.cpu,
                    capacity_mem: self.capacity.mem,
                });
            }
        }

        let mut in_degree: HashMap<NodeIndex, usize> = members
            .iter()
            .map(|&idx| {
                let deps = graph
                    .dependencies(idx)
                    .into_iter()
                    .filter(|d| include.contains(d))
                    .count();
                (idx, deps)
            })
            .collect();

        let mut candidates: Vec<NodeIndex> = members
            .iter()
            .copied()
            .filter(|idx| in_degree[idx] == 0)
            .collect();
        let mut waves = Vec::new();

        while !candidates.is_empty() {
            candidates.sort_by_key(|&idx| (Reverse(graph.task(idx).spec.priority), idx));

            let mut used = Resources::default();
            let mut admitted = Vec::new();
            let mut deferred = Vec::new();
            for idx in candidates {
                let need = used.add(&graph.task(idx).spec.resources);
                if self.capacity.fits(&need) {
                    used = need;
                    admitted.push(idx);
                } else {
                    deferred.push(idx);
                }
            }

            // Dependents unlock only after the wave is closed
            let mut unlocked = Vec::new();
            for &idx in &admitted {
                for dep in graph.dependents(idx) {
                    if let Some(d) = in_degree.get_mut(&dep) {
                        *d -= 1;
                        if *d == 0 {
                            unlocked.push(dep);
                        }
                    }
                }
            }

            waves.push(Wave {
                estimated_duration_ms: admitted.iter().map(|&i| estimate(i)).max().unwrap_or(0),
                tasks: admitted.iter().map(|&i| graph.task(i).spec.id.clone()).collect(),
            });

            candidates = deferred;
            candidates.extend(unlocked);
        }

        let (path, total) = critical_path(graph, include, &estimate);
        Ok(ExecutionPlan {
            waves,
            critical_path: path.iter().map(|&i| graph.task(i).spec.id.clone()).collect(),
            estimated_total_duration_ms: total,
            revision: 0,
        })
    }
}

/// Longest path through `include`, weighting each node by `estimate`.
///
/// Ties go to the lowest node index, both when choosing a predecessor and
/// when choosing the path's end.
pub fn critical_path<F>(
    graph: &TaskGraph,
    include: &HashSet<NodeIndex>,
    estimate: F,
) -> (Vec<NodeIndex>, u64)
where
    F: Fn(NodeIndex) -> u64,
{
    let mut remaining: HashMap<NodeIndex, usize> = include
        .iter()
        .map(|&idx| {
            let deps = graph
                .dependencies(idx)
                .into_iter()
                .filter(|d| include.contains(d))
                .count();
            (idx, deps)
        })
        .collect();
    let mut ready: BTreeSet<NodeIndex> = remaining
        .iter()
        .filter(|(_, &d)| d == 0)
        .map(|(&idx, _)| idx)
        .collect();

    let mut dist: HashMap<NodeIndex, u64> = HashMap::with_capacity(include.len());
    let mut pred: HashMap<NodeIndex, NodeIndex> = HashMap::new();

    while let Some(idx) = ready.pop_first() {
        let mut best: Option<(u64, NodeIndex)> = None;
        for dep in graph.dependencies(idx) {
            if let Some(&d) = dist.get(&dep) {
                if best.map(|(b, _)| d > b).unwrap_or(true) {
                    best = Some((d, dep));
                }
            }
        }
        let base = best.map(|(d, _)| d).unwrap_or(0);
        if let Some((_, p)) = best {
            pred.insert(idx, p);
        }
        dist.insert(idx, base.saturating_add(estimate(idx)));

        for next in graph.dependents(idx) {
            if let Some(r) = remaining.get_mut(&next) {
                *r -= 1;
                if *r == 0 {
                    ready.insert(next);
                }
            }
        }
    }

    let mut end: Option<(u64, NodeIndex)> = None;
    let mut ordered: Vec<(&NodeIndex, &u64)> = dist.iter().collect();
    ordered.sort_by_key(|(idx, _)| **idx);
    for (&idx, &d) in ordered {
        if end.map(|(b, _)| d > b).unwrap_or(true) {
            end = Some((d, idx));
        }
    }

    let Some((total, last)) = end else {
        return (Vec::new(), 0);
    };
    let mut path = vec![last];
    let mut cursor = last;
    while let Some(&p) = pred.get(&cursor) {
        path.push(p);
        cursor = p;
    }
    path.reverse();
    (path, total)
}
