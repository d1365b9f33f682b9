//! Read-only status projection over an execution context.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

use crate::config::DEFAULT_BOTTLENECK_LIMIT;
use crate::core::context::{ExecutionContext, RunState};
use crate::core::graph::GraphId;
use crate::core::task::{Resources, TaskId, TaskStatus};
use crate::util::millis;

/// A critical-path task running longer than estimated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bottleneck {
    pub task: TaskId,
    pub estimated_ms: u64,
    pub actual_ms: u64,
}

impl Bottleneck {
    pub fn overrun_ms(&self) -> u64 {
        self.actual_ms.saturating_sub(self.estimated_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub graph_id: GraphId,
    pub run_state: RunState,
    /// Share of estimated work that has succeeded, in `[0, 1]`.
    pub overall_progress: f64,
    pub per_task_status: BTreeMap<TaskId, TaskStatus>,
    pub active_count: usize,
    pub resources_in_use: Resources,
    pub current_wave: usize,
    pub wave_count: usize,
    pub plan_revision: u32,
    pub critical_path: Vec<TaskId>,
    pub critical_path_remaining_ms: u64,
    pub bottleneck_tasks: Vec<Bottleneck>,
    pub estimated_completion: Option<DateTime<Utc>>,
}

/// Derives status snapshots; never mutates the context.
#[derive(Debug, Clone, Copy)]
pub struct Monitor {
    bottleneck_limit: usize,
}

impl Default for Monitor {
    fn default() -> Self {
        Self::new(DEFAULT_BOTTLENECK_LIMIT)
    }
}

impl Monitor {
    pub fn new(bottleneck_limit: usize) -> Self {
        Self { bottleneck_limit }
    }

    pub fn snapshot(&self, ctx: &ExecutionContext) -> StatusSnapshot {
        let remaining = critical_path_remaining(ctx);
        let estimated_completion = if ctx.run_state.is_terminal() {
            ctx.ended_at
        } else {
            chrono::Duration::from_std(std::time::Duration::from_millis(remaining))
                .ok()
                .map(|d| Utc::now() + d)
        };

        StatusSnapshot {
            graph_id: ctx.graph_id,
            run_state: ctx.run_state,
            overall_progress: overall_progress(ctx),
            per_task_status: ctx
                .graph
                .tasks()
                .map(|t| (t.spec.id.clone(), t.status.clone()))
                .collect(),
            active_count: ctx.active_count(),
            resources_in_use: ctx.ledger.in_use(),
            current_wave: ctx.current_wave,
            wave_count: ctx.plan.wave_count(),
            plan_revision: ctx.plan.revision,
            critical_path: ctx.plan.critical_path.clone(),
            critical_path_remaining_ms: remaining,
            bottleneck_tasks: self.bottlenecks(ctx),
            estimated_completion,
        }
    }

    /// Critical-path tasks whose actual (or elapsed) time exceeds the
    /// estimate, largest overrun first. Both the original path and the
    /// current plan's path count, so finished overruns survive a replan.
    /// Tasks without an estimate have no baseline and are never reported.
    pub fn bottlenecks(&self, ctx: &ExecutionContext) -> Vec<Bottleneck> {
        let mut seen = HashSet::new();
        let mut found: Vec<(usize, Bottleneck)> = ctx
            .original_critical_path
            .iter()
            .chain(&ctx.plan.critical_path)
            .filter(|id| seen.insert(*id))
            .filter_map(|id| {
                let idx = ctx.graph.node_index(id)?;
                let task = ctx.graph.task(idx);
                let estimated_ms = task.spec.estimated_duration_ms;
                let actual_ms = millis(task.actual_duration()?);
                (estimated_ms > 0 && actual_ms > estimated_ms).then(|| {
                    (
                        idx.index(),
                        Bottleneck {
                            task: id.clone(),
                            estimated_ms,
                            actual_ms,
                        },
                    )
                })
            })
            .collect();
        found.sort_by(|(ia, a), (ib, b)| b.overrun_ms().cmp(&a.overrun_ms()).then(ia.cmp(ib)));
        found
            .into_iter()
            .take(self.bottleneck_limit)
            .map(|(_, b)| b)
            .collect()
    }
}

/// Estimate-weighted share of succeeded tasks. Falls back to counting when
/// no task carries an estimate; an empty graph is complete.
pub fn overall_progress(ctx: &ExecutionContext) -> f64 {
    if ctx.graph.is_empty() {
        return 1.0;
    }
    let total: u64 = ctx.graph.tasks().map(|t| t.spec.estimated_duration_ms).sum();
    if total == 0 {
        let done = ctx
            .graph
            .tasks()
            .filter(|t| t.status == TaskStatus::Succeeded)
            .count();
        return done as f64 / ctx.graph.len() as f64;
    }
    let done: u64 = ctx
        .graph
        .tasks()
        .filter(|t| t.status == TaskStatus::Succeeded)
        .map(|t| t.spec.estimated_duration_ms)
        .sum();
    done as f64 / total as f64
}

/// Estimated time left on the critical path, counting elapsed time of
/// running tasks against their estimates.
pub fn critical_path_remaining(ctx: &ExecutionContext) -> u64 {
    ctx.plan
        .critical_path
        .iter()
        .filter_map(|id| ctx.graph.node_index(id))
        .map(|idx| {
            let task = ctx.graph.task(idx);
            let estimate = ctx.effective_estimate(idx);
            match &task.status {
                s if s.is_terminal() => 0,
                TaskStatus::Running => {
                    let elapsed = task.actual_duration().map(millis).unwrap_or(0);
                    estimate.saturating_sub(elapsed)
                }
                _ => estimate,
            }
        })
        .sum()
}
