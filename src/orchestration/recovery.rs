//! Adaptive control and recovery.
//!
//! Retry decisions and backoff, cascading skips after failures or false
//! predicates, drift-triggered replanning, and restoring a graph from its
//! latest usable checkpoint.

use petgraph::graph::NodeIndex;
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use crate::core::context::ExecutionContext;
use crate::core::graph::{GraphId, TaskGraph};
use crate::core::task::{FailurePolicy, RetryPolicy, SkipCause, TaskSpec, TaskStatus};
use crate::error::{ExecutionError, ValidationError};
use crate::orchestration::scheduler::{critical_path, Scheduler};
use crate::state::{Checkpoint, CheckpointSlot, CheckpointStore};
use crate::util::blocking;
use crate::{wlog, wlog_debug, wlog_warn, Result};

/// Whether a task that just failed with `error` gets another attempt.
pub fn should_retry(policy: &RetryPolicy, attempt_count: u32, error: &ExecutionError) -> bool {
    error.is_retryable() && attempt_count < policy.max_attempts
}

/// Delay before the next attempt: `base * 2^(attempt-1)` plus up to
/// `jitter_ratio` of that in random extra time.
pub fn backoff_delay(policy: &RetryPolicy, attempt_count: u32, jitter_ratio: f64) -> Duration {
    let exponent = attempt_count.saturating_sub(1).min(20);
    let base = policy.backoff_base_ms.saturating_mul(1u64 << exponent);
    let jitter = if jitter_ratio > 0.0 && base > 0 {
        let max = (base as f64 * jitter_ratio).round() as u64;
        rand::thread_rng().gen_range(0..=max)
    } else {
        0
    };
    Duration::from_millis(base.saturating_add(jitter))
}

/// Error recorded on a task that will not be attempted again.
pub fn final_error(policy: &RetryPolicy, attempt_count: u32, error: ExecutionError) -> ExecutionError {
    if policy.max_attempts > 1 && error.is_retryable() {
        ExecutionError::RetryExhausted {
            attempts: attempt_count,
            last: Box::new(error),
        }
    } else {
        error
    }
}

fn skip_not_started(
    graph: &mut TaskGraph,
    idx: NodeIndex,
    reason: SkipCause,
    skipped: &mut Vec<(NodeIndex, SkipCause)>,
) -> bool {
    let task = graph.task_mut(idx);
    if !task.status.is_not_started() {
        return false;
    }
    task.skip(reason.clone());
    skipped.push((idx, reason));
    true
}

fn skip_subtree(graph: &mut TaskGraph, root: NodeIndex, skipped: &mut Vec<(NodeIndex, SkipCause)>) {
    let from = graph.task(root).spec.id.clone();
    for idx in graph.descendants(root) {
        skip_not_started(graph, idx, SkipCause::Upstream { from: from.clone() }, skipped);
    }
}

/// Evaluate the predicates on edges leaving a succeeded task. Every target
/// whose predicate is false is skipped along with its whole downstream.
pub fn apply_predicates(graph: &mut TaskGraph, idx: NodeIndex) -> Vec<(NodeIndex, SkipCause)> {
    let from = graph.task(idx).spec.id.clone();
    let blocked: Vec<NodeIndex> = graph
        .conditional_dependents(idx)
        .into_iter()
        .filter(|(_, predicate)| !predicate.evaluate(&graph.task(idx).outputs))
        .map(|(to, _)| to)
        .collect();

    let mut skipped = Vec::new();
    for to in blocked {
        let reason = SkipCause::Predicate { from: from.clone() };
        if skip_not_started(graph, to, reason, &mut skipped) {
            skip_subtree(graph, to, &mut skipped);
        }
    }
    skipped
}

/// Propagate a failed or skipped task to its downstream.
///
/// A `skip_dependents` task takes its whole not-started subtree down with
/// it. Otherwise each dependent decides by its own policy: `fail` and
/// `skip_dependents` dependents are skipped and propagate further,
/// `continue` dependents stay eligible.
pub fn cascade(graph: &mut TaskGraph, origin: NodeIndex) -> Vec<(NodeIndex, SkipCause)> {
    let mut skipped = Vec::new();
    if graph.task(origin).spec.on_failure == FailurePolicy::SkipDependents {
        skip_subtree(graph, origin, &mut skipped);
        return skipped;
    }

    let mut stack = vec![origin];
    while let Some(src) = stack.pop() {
        let from = graph.task(src).spec.id.clone();
        for dep in graph.dependents(src) {
            let policy = graph.task(dep).spec.on_failure;
            if policy == FailurePolicy::Continue {
                continue;
            }
            let reason = SkipCause::Upstream { from: from.clone() };
            if !skip_not_started(graph, dep, reason, &mut skipped) {
                continue;
            }
            match policy {
                FailurePolicy::SkipDependents => skip_subtree(graph, dep, &mut skipped),
                _ => stack.push(dep),
            }
        }
    }
    skipped
}

/// Remaining critical path before and after applying observed runtimes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Drift {
    pub baseline_ms: u64,
    pub adjusted_ms: u64,
}

impl Drift {
    /// Relative change of the remaining critical path.
    pub fn ratio(&self) -> f64 {
        if self.baseline_ms == 0 {
            return 0.0;
        }
        (self.adjusted_ms as f64 - self.baseline_ms as f64).abs() / self.baseline_ms as f64
    }
}

fn remaining_tasks(ctx: &ExecutionContext) -> HashSet<NodeIndex> {
    ctx.graph
        .indices()
        .filter(|&idx| ctx.graph.task(idx).status.is_not_started())
        .collect()
}

/// Compare the remaining critical path under the plan's estimates with the
/// one under runtime-adjusted estimates.
pub fn measure_drift(ctx: &ExecutionContext) -> Option<Drift> {
    let remaining = remaining_tasks(ctx);
    if remaining.is_empty() {
        return None;
    }
    let (_, baseline_ms) = critical_path(&ctx.graph, &remaining, |idx| {
        ctx.plan_estimates.get(&idx).copied().unwrap_or(0)
    });
    let (_, adjusted_ms) = critical_path(&ctx.graph, &remaining, |idx| ctx.effective_estimate(idx));
    Some(Drift {
        baseline_ms,
        adjusted_ms,
    })
}

/// Reschedule the not-started tasks when drift exceeds `threshold`.
///
/// The new waves are spliced after the last completed wave and the plan
/// revision is incremented. Returns the drift that triggered the replan.
pub fn replan_on_drift(
    ctx: &mut ExecutionContext,
    scheduler: &Scheduler,
    threshold: f64,
) -> std::result::Result<Option<Drift>, ValidationError> {
    let Some(drift) = measure_drift(ctx) else {
        return Ok(None);
    };
    if drift.ratio() <= threshold {
        wlog_debug!(
            "Drift {:.3} within threshold {:.3} (baseline={}ms adjusted={}ms)",
            drift.ratio(),
            threshold,
            drift.baseline_ms,
            drift.adjusted_ms
        );
        return Ok(None);
    }

    let remaining = remaining_tasks(ctx);
    let estimates: HashMap<NodeIndex, u64> = remaining
        .iter()
        .map(|&idx| (idx, ctx.effective_estimate(idx)))
        .collect();
    let tail = scheduler.schedule_subset(&ctx.graph, &remaining, |idx| {
        estimates.get(&idx).copied().unwrap_or(0)
    })?;
    let plan = ctx.plan.splice(ctx.last_completed_wave, tail);
    wlog!(
        "Replanned graph {}: drift {:.3} > {:.3}, revision {} with {} waves",
        ctx.graph_id.short(),
        drift.ratio(),
        threshold,
        plan.revision,
        plan.wave_count()
    );
    ctx.set_plan(plan);
    ctx.plan_estimates.extend(estimates);
    Ok(Some(drift))
}

/// Latest checkpoint that parses and matches `graph`, trying the previous
/// record when the current one is unusable.
pub async fn latest_checkpoint(
    store: Arc<dyn CheckpointStore>,
    graph_id: GraphId,
    graph: &TaskGraph,
) -> Result<Option<Checkpoint>> {
    let loaded = blocking(move || {
        Ok([CheckpointSlot::Current, CheckpointSlot::Previous]
            .into_iter()
            .map(|slot| (slot, store.load(graph_id, slot)))
            .collect::<Vec<_>>())
    })
    .await?;

    for (slot, result) in loaded {
        match result {
            Ok(Some(checkpoint)) => match checkpoint.validate(graph_id, graph) {
                Ok(()) => return Ok(Some(checkpoint)),
                Err(reason) => {
                    wlog_warn!("Ignoring {:?} checkpoint for {}: {}", slot, graph_id.short(), reason)
                }
            },
            Ok(None) => {}
            Err(e) => wlog_warn!("Ignoring {:?} checkpoint for {}: {}", slot, graph_id.short(), e),
        }
    }
    Ok(None)
}

/// Build an execution context that continues a graph from its checkpoint.
///
/// Only succeeded tasks are restored, with their outputs; their predicates
/// are re-applied and the rest of the graph is scheduled as a new plan.
/// Without a usable checkpoint the graph starts fresh.
pub async fn restore(
    graph_id: GraphId,
    specs: Vec<TaskSpec>,
    store: Arc<dyn CheckpointStore>,
    scheduler: &Scheduler,
) -> Result<ExecutionContext> {
    let mut graph = TaskGraph::from_specs(specs)?;
    let checkpoint = latest_checkpoint(store, graph_id, &graph).await?;

    let mut restored = 0;
    if let Some(checkpoint) = &checkpoint {
        for (id, state) in checkpoint.succeeded() {
            if let Some(task) = graph.get_mut(id) {
                task.succeed(state.outputs.clone());
                restored += 1;
            }
        }
    }

    let succeeded: Vec<NodeIndex> = graph
        .indices()
        .filter(|&idx| graph.task(idx).status == TaskStatus::Succeeded)
        .collect();
    for idx in succeeded {
        apply_predicates(&mut graph, idx);
    }

    let remaining: HashSet<NodeIndex> = graph
        .indices()
        .filter(|&idx| !graph.task(idx).status.is_terminal())
        .collect();
    let plan = scheduler.schedule_subset(&graph, &remaining, |idx| {
        graph.task(idx).spec.estimated_duration_ms
    })?;

    wlog!(
        "Restored graph {}: {} succeeded tasks from checkpoint, {} remaining in {} waves",
        graph_id.short(),
        restored,
        remaining.len(),
        plan.wave_count()
    );
    Ok(ExecutionContext::new(graph_id, graph, plan, scheduler.capacity()))
}
