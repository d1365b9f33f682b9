//! Runtime state of one graph execution.
//!
//! `ExecutionContext` is owned by the executor's coordination loop, which is
//! its only writer. The monitor and the orchestrator read it through the
//! shared `RwLock`.

use chrono::{DateTime, Utc};
use petgraph::graph::NodeIndex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::core::graph::{GraphId, TaskGraph};
use crate::core::task::{Resources, TaskId, TaskSpec, TaskStatus};
use crate::orchestration::scheduler::{critical_path, ExecutionPlan};

/// Lifecycle of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// Validated and planned, not started.
    #[default]
    Submitted,
    Running,
    /// No new dispatches; in-flight tasks finish.
    Paused,
    /// Cancellation requested; waiting for in-flight handlers.
    Cancelling,
    Cancelled,
    /// Every task succeeded or was skipped by a predicate.
    AllSucceeded,
    /// Finished with at least one failed task.
    Failed,
    /// Stopped by the global deadline.
    Aborted,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunState::Cancelled | RunState::AllSucceeded | RunState::Failed | RunState::Aborted
        )
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunState::Submitted => "submitted",
            RunState::Running => "running",
            RunState::Paused => "paused",
            RunState::Cancelling => "cancelling",
            RunState::Cancelled => "cancelled",
            RunState::AllSucceeded => "all_succeeded",
            RunState::Failed => "failed",
            RunState::Aborted => "aborted",
        };
        write!(f, "{}", s)
    }
}

/// Resources claimed by running tasks.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceLedger {
    capacity: Resources,
    in_use: Resources,
}

impl ResourceLedger {
    pub fn new(capacity: Resources) -> Self {
        Self {
            capacity,
            in_use: Resources::default(),
        }
    }

    pub fn in_use(&self) -> Resources {
        self.in_use
    }

    pub fn can_reserve(&self, need: &Resources) -> bool {
        self.capacity.fits(&self.in_use.add(need))
    }

    pub fn try_reserve(&mut self, need: &Resources) -> bool {
        let total = self.in_use.add(need);
        if self.capacity.fits(&total) {
            self.in_use = total;
            true
        } else {
            false
        }
    }

    pub fn release(&mut self, held: &Resources) {
        self.in_use = self.in_use.saturating_sub(held);
    }
}

/// Timing of one executed wave.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaveRecord {
    pub index: usize,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub estimated_ms: u64,
    pub actual_ms: Option<u64>,
}

/// Observed actual/estimate ratios per operation.
#[derive(Debug, Clone, Default)]
pub struct RuntimeStats {
    operations: HashMap<String, (f64, u32)>,
}

impl RuntimeStats {
    /// Record one successful attempt. Tasks without an estimate carry no signal.
    pub fn record_task(&mut self, operation: &str, estimated_ms: u64, actual_ms: u64) {
        if estimated_ms == 0 {
            return;
        }
        let entry = self.operations.entry(operation.to_string()).or_insert((0.0, 0));
        entry.0 += actual_ms as f64 / estimated_ms as f64;
        entry.1 += 1;
    }

    /// Mean actual/estimate ratio for an operation.
    pub fn operation_ratio(&self, operation: &str) -> Option<f64> {
        self.operations
            .get(operation)
            .filter(|(_, n)| *n > 0)
            .map(|(sum, n)| sum / *n as f64)
    }

    /// Estimate scaled by what the operation has actually taken so far.
    pub fn adjusted_estimate(&self, spec: &TaskSpec) -> u64 {
        let ratio = self.operation_ratio(&spec.operation_ref).unwrap_or(1.0);
        (spec.estimated_duration_ms as f64 * ratio).round() as u64
    }
}

/// Per-graph runtime state shared between executor, monitor and control API.
#[derive(Debug)]
pub struct ExecutionContext {
    pub graph_id: GraphId,
    pub graph: TaskGraph,
    pub plan: ExecutionPlan,
    /// Critical path of the whole graph under submitted estimates. Later
    /// plans only cover the remaining tail.
    pub original_critical_path: Vec<TaskId>,
    wave_of: HashMap<NodeIndex, usize>,
    /// Estimates the current plan was computed with.
    pub plan_estimates: HashMap<NodeIndex, u64>,
    pub run_state: RunState,
    pub ledger: ResourceLedger,
    /// Highest wave whose tasks may be dispatched.
    pub current_wave: usize,
    pub last_completed_wave: Option<usize>,
    pub wave_records: Vec<WaveRecord>,
    pub stats: RuntimeStats,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl ExecutionContext {
    pub fn new(graph_id: GraphId, graph: TaskGraph, plan: ExecutionPlan, capacity: Resources) -> Self {
        let plan_estimates = graph
            .indices()
            .map(|idx| (idx, graph.task(idx).spec.estimated_duration_ms))
            .collect();
        let all: HashSet<NodeIndex> = graph.indices().collect();
        let (path, _) = critical_path(&graph, &all, |idx| graph.task(idx).spec.estimated_duration_ms);
        let original_critical_path = path
            .into_iter()
            .map(|idx| graph.task(idx).spec.id.clone())
            .collect();
        let mut ctx = Self {
            graph_id,
            graph,
            plan: ExecutionPlan::default(),
            original_critical_path,
            wave_of: HashMap::new(),
            plan_estimates,
            run_state: RunState::Submitted,
            ledger: ResourceLedger::new(capacity),
            current_wave: 0,
            last_completed_wave: None,
            wave_records: Vec::new(),
            stats: RuntimeStats::default(),
            started_at: None,
            ended_at: None,
        };
        ctx.set_plan(plan);
        ctx
    }

    /// Install a plan and rebuild the wave lookup.
    pub fn set_plan(&mut self, plan: ExecutionPlan) {
        self.wave_of.clear();
        for (i, wave) in plan.waves.iter().enumerate() {
            for id in &wave.tasks {
                if let Some(idx) = self.graph.node_index(id) {
                    self.wave_of.insert(idx, i);
                }
            }
        }
        self.plan = plan;
    }

    pub fn wave_of(&self, idx: NodeIndex) -> Option<usize> {
        self.wave_of.get(&idx).copied()
    }

    pub fn wave_tasks(&self, wave: usize) -> Vec<NodeIndex> {
        self.plan
            .waves
            .get(wave)
            .map(|w| w.tasks.iter().filter_map(|id| self.graph.node_index(id)).collect())
            .unwrap_or_default()
    }

    pub fn wave_is_terminal(&self, wave: usize) -> bool {
        self.wave_tasks(wave)
            .into_iter()
            .all(|idx| self.graph.task(idx).status.is_terminal())
    }

    pub fn all_terminal(&self) -> bool {
        self.graph.tasks().all(|t| t.status.is_terminal())
    }

    pub fn status_of(&self, id: &TaskId) -> Option<&TaskStatus> {
        self.graph.get(id).map(|t| &t.status)
    }

    pub fn active_count(&self) -> usize {
        self.graph.tasks().filter(|t| t.status.is_active()).count()
    }

    /// Current best estimate for a task.
    pub fn effective_estimate(&self, idx: NodeIndex) -> u64 {
        self.stats.adjusted_estimate(&self.graph.task(idx).spec)
    }
}
