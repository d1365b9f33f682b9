//! Wave executor.
//!
//! The Executor drives one run of a graph. A single coordination loop owns
//! every write to the `ExecutionContext`: it promotes tasks whose wave has
//! been entered and whose dependencies have resolved, dispatches them to a
//! bounded set of worker tasks, and applies the reports those workers send
//! back over a channel. Waves are entered strictly in order; wave `k+1`
//! opens only once every task in waves `0..=k` is terminal.

use chrono::Utc;
use futures::FutureExt;
use petgraph::graph::NodeIndex;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::core::context::{ExecutionContext, RunState, WaveRecord};
use crate::core::graph::GraphId;
use crate::core::task::{FailurePolicy, Payload, SkipCause, TaskId, TaskStatus};
use crate::error::{ExecutionError, OrchestrationError};
use crate::orchestration::handler::{Handler, HandlerRegistry, HandlerResult};
use crate::orchestration::recovery;
use crate::orchestration::scheduler::Scheduler;
use crate::state::{Checkpoint, CheckpointStore};
use crate::util::{blocking, millis};
use crate::{wlog, wlog_debug, wlog_error, wlog_trace, wlog_warn};

/// Executor settings derived from `Config`.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub workers: usize,
    pub retry_jitter: f64,
    pub cancel_grace: Duration,
    pub drift_threshold: f64,
    pub global_deadline: Option<Duration>,
}

impl From<&Config> for ExecutorConfig {
    fn from(config: &Config) -> Self {
        Self {
            workers: config.effective_workers(),
            retry_jitter: config.retry_jitter,
            cancel_grace: config.cancel_grace(),
            drift_threshold: config.drift_threshold,
            global_deadline: config.global_deadline(),
        }
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

/// Requests delivered to a live run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Pause,
    Unpause,
}

/// Lifecycle notifications broadcast while a run progresses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "event")]
pub enum RunEvent {
    TaskStarted {
        graph_id: GraphId,
        task: TaskId,
        attempt: u32,
    },
    TaskSucceeded {
        graph_id: GraphId,
        task: TaskId,
    },
    TaskFailed {
        graph_id: GraphId,
        task: TaskId,
        error: ExecutionError,
    },
    TaskRetrying {
        graph_id: GraphId,
        task: TaskId,
        attempt: u32,
        delay_ms: u64,
    },
    TaskSkipped {
        graph_id: GraphId,
        task: TaskId,
        reason: SkipCause,
    },
    TaskCancelled {
        graph_id: GraphId,
        task: TaskId,
    },
    WaveCompleted {
        graph_id: GraphId,
        wave: usize,
        estimated_ms: u64,
        actual_ms: u64,
    },
    Replanned {
        graph_id: GraphId,
        revision: u32,
        baseline_ms: u64,
        adjusted_ms: u64,
    },
    CheckpointWritten {
        graph_id: GraphId,
        wave: Option<usize>,
    },
    RunFinished {
        graph_id: GraphId,
        state: RunState,
    },
}

impl RunEvent {
    pub fn graph_id(&self) -> GraphId {
        match self {
            RunEvent::TaskStarted { graph_id, .. }
            | RunEvent::TaskSucceeded { graph_id, .. }
            | RunEvent::TaskFailed { graph_id, .. }
            | RunEvent::TaskRetrying { graph_id, .. }
            | RunEvent::TaskSkipped { graph_id, .. }
            | RunEvent::TaskCancelled { graph_id, .. }
            | RunEvent::WaveCompleted { graph_id, .. }
            | RunEvent::Replanned { graph_id, .. }
            | RunEvent::CheckpointWritten { graph_id, .. }
            | RunEvent::RunFinished { graph_id, .. } => *graph_id,
        }
    }
}

/// Final result of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub graph_id: GraphId,
    pub state: RunState,
    /// Every non-skipped task succeeded and the run was not stopped.
    pub success: bool,
    pub succeeded: Vec<TaskId>,
    pub failed_tasks: BTreeMap<TaskId, ExecutionError>,
    pub skipped_tasks: Vec<TaskId>,
    pub cancelled_tasks: Vec<TaskId>,
    pub not_started: Vec<TaskId>,
}

impl RunReport {
    pub fn from_context(ctx: &ExecutionContext) -> Self {
        let mut report = Self {
            graph_id: ctx.graph_id,
            state: ctx.run_state,
            success: ctx.run_state == RunState::AllSucceeded,
            succeeded: Vec::new(),
            failed_tasks: BTreeMap::new(),
            skipped_tasks: Vec::new(),
            cancelled_tasks: Vec::new(),
            not_started: Vec::new(),
        };
        for task in ctx.graph.tasks() {
            let id = task.spec.id.clone();
            match &task.status {
                TaskStatus::Succeeded => report.succeeded.push(id),
                TaskStatus::Failed { error } => {
                    report.failed_tasks.insert(id, error.clone());
                }
                TaskStatus::Skipped { .. } => report.skipped_tasks.push(id),
                TaskStatus::Cancelled => report.cancelled_tasks.push(id),
                _ => report.not_started.push(id),
            }
        }
        report
    }
}

enum Outcome {
    Succeeded(Payload),
    Failed(ExecutionError),
    Cancelled,
}

struct WorkerReport {
    idx: NodeIndex,
    attempt: u32,
    outcome: Outcome,
    elapsed: Duration,
}

enum Message {
    Report(WorkerReport),
    RetryDue(NodeIndex),
}

enum DependencyState {
    Waiting,
    Resolved,
    Blocked(TaskId),
}

/// Bookkeeping owned by the coordination loop.
struct RunLoop {
    tx: mpsc::UnboundedSender<Message>,
    /// Ready tasks, highest priority then lowest index first.
    ready: BTreeSet<(Reverse<i64>, NodeIndex)>,
    in_flight: usize,
    retry_timers: usize,
    paused: bool,
    cancelling: bool,
    deadline_hit: bool,
    wave_started: Instant,
    checkpoints: Vec<Checkpoint>,
}

/// Runs one graph to completion, cancellation or deadline.
pub struct Executor {
    graph_id: GraphId,
    ctx: Arc<RwLock<ExecutionContext>>,
    registry: Arc<HandlerRegistry>,
    store: Arc<dyn CheckpointStore>,
    scheduler: Scheduler,
    config: ExecutorConfig,
    events: broadcast::Sender<RunEvent>,
    cancel: CancellationToken,
}

impl Executor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        graph_id: GraphId,
        ctx: Arc<RwLock<ExecutionContext>>,
        registry: Arc<HandlerRegistry>,
        store: Arc<dyn CheckpointStore>,
        scheduler: Scheduler,
        config: ExecutorConfig,
        events: broadcast::Sender<RunEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            graph_id,
            ctx,
            registry,
            store,
            scheduler,
            config,
            events,
            cancel,
        }
    }

    fn emit(&self, event: RunEvent) {
        let _ = self.events.send(event);
    }

    fn emit_skips(&self, ctx: &ExecutionContext, skipped: Vec<(NodeIndex, SkipCause)>) {
        for (idx, reason) in skipped {
            let task = ctx.graph.task(idx).spec.id.clone();
            wlog_debug!("Task {} skipped: {}", task, reason);
            self.emit(RunEvent::TaskSkipped {
                graph_id: self.graph_id,
                task,
                reason,
            });
        }
    }

    /// Run the coordination loop until the run settles.
    pub async fn execute(self, mut control: mpsc::UnboundedReceiver<Control>) -> RunReport {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut run = RunLoop {
            tx,
            ready: BTreeSet::new(),
            in_flight: 0,
            retry_timers: 0,
            paused: false,
            cancelling: false,
            deadline_hit: false,
            wave_started: Instant::now(),
            checkpoints: Vec::new(),
        };

        {
            let mut ctx = self.ctx.write().await;
            ctx.run_state = RunState::Running;
            ctx.started_at = Some(Utc::now());
            ctx.current_wave = 0;
            ctx.last_completed_wave = None;
            if !ctx.plan.waves.is_empty() {
                self.begin_wave(&mut ctx, &mut run, 0);
            }
            while let Ok(request) = control.try_recv() {
                self.apply_control(&mut ctx, &mut run, request);
            }
            wlog!(
                "Run started: graph={} tasks={} waves={} workers={}",
                self.graph_id.short(),
                ctx.graph.len(),
                ctx.plan.wave_count(),
                self.config.workers
            );
        }

        let cancel = self.cancel.clone();
        let deadline = self.config.global_deadline;
        let deadline_sleep = async move {
            match deadline {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(deadline_sleep);
        let mut control_open = true;

        loop {
            let finished = {
                let mut ctx = self.ctx.write().await;
                self.step(&mut ctx, &mut run)
            };
            if !run.checkpoints.is_empty() {
                self.flush_checkpoints(&mut run).await;
                continue;
            }
            if finished {
                break;
            }

            tokio::select! {
                Some(message) = rx.recv() => {
                    let mut ctx = self.ctx.write().await;
                    match message {
                        Message::Report(report) => self.handle_report(&mut ctx, &mut run, report),
                        Message::RetryDue(idx) => self.handle_retry_due(&mut ctx, &mut run, idx),
                    }
                }
                request = control.recv(), if control_open => {
                    match request {
                        Some(request) => {
                            let mut ctx = self.ctx.write().await;
                            self.apply_control(&mut ctx, &mut run, request);
                        }
                        None => control_open = false,
                    }
                }
                _ = cancel.cancelled(), if !run.cancelling => {
                    let mut ctx = self.ctx.write().await;
                    self.begin_cancel(&mut ctx, &mut run);
                }
                _ = &mut deadline_sleep, if !run.deadline_hit => {
                    run.deadline_hit = true;
                    wlog_warn!(
                        "Global deadline exceeded: graph={} after {:?}",
                        self.graph_id.short(),
                        deadline
                    );
                    cancel.cancel();
                }
            }
        }

        let report = {
            let mut ctx = self.ctx.write().await;
            self.settle(&mut ctx, &run);
            run.checkpoints.push(Checkpoint::capture(&ctx));
            RunReport::from_context(&ctx)
        };
        self.flush_checkpoints(&mut run).await;
        self.emit(RunEvent::RunFinished {
            graph_id: self.graph_id,
            state: report.state,
        });
        wlog!(
            "Run finished: graph={} state={} succeeded={} failed={} skipped={} cancelled={} not_started={}",
            self.graph_id.short(),
            report.state,
            report.succeeded.len(),
            report.failed_tasks.len(),
            report.skipped_tasks.len(),
            report.cancelled_tasks.len(),
            report.not_started.len()
        );
        report
    }

    fn apply_control(&self, ctx: &mut ExecutionContext, run: &mut RunLoop, request: Control) {
        match request {
            Control::Pause => {
                run.paused = true;
                if ctx.run_state == RunState::Running {
                    ctx.run_state = RunState::Paused;
                    wlog!("Run paused: graph={}", self.graph_id.short());
                }
            }
            Control::Unpause => {
                run.paused = false;
                if ctx.run_state == RunState::Paused {
                    ctx.run_state = RunState::Running;
                    wlog!("Run resumed: graph={}", self.graph_id.short());
                }
            }
        }
    }

    /// Advance, dispatch, and decide whether the run is over.
    fn step(&self, ctx: &mut ExecutionContext, run: &mut RunLoop) -> bool {
        if !run.cancelling && self.cancel.is_cancelled() {
            self.begin_cancel(ctx, run);
        }
        if run.cancelling {
            return run.in_flight == 0;
        }
        loop {
            self.advance(ctx, run);
            // A closed wave is persisted before the next one opens.
            if !run.checkpoints.is_empty() {
                return false;
            }
            if run.in_flight == 0 && ctx.all_terminal() {
                return true;
            }
            if run.paused || !self.dispatch(ctx, run) {
                break;
            }
        }
        if !run.paused && run.in_flight == 0 && run.ready.is_empty() && run.retry_timers == 0 {
            wlog_error!(
                "Run {} has no runnable tasks left but is not complete",
                self.graph_id.short()
            );
            return true;
        }
        false
    }

    fn begin_wave(&self, ctx: &mut ExecutionContext, run: &mut RunLoop, wave: usize) {
        run.wave_started = Instant::now();
        let estimated_ms = ctx
            .plan
            .waves
            .get(wave)
            .map(|w| w.estimated_duration_ms)
            .unwrap_or(0);
        ctx.wave_records.push(WaveRecord {
            index: wave,
            started_at: Utc::now(),
            ended_at: None,
            estimated_ms,
            actual_ms: None,
        });
        wlog_debug!(
            "Entering wave {} of graph {} ({} tasks)",
            wave,
            self.graph_id.short(),
            ctx.wave_tasks(wave).len()
        );
    }

    /// Promote resolved tasks of the open wave and close finished waves.
    fn advance(&self, ctx: &mut ExecutionContext, run: &mut RunLoop) {
        while ctx.current_wave < ctx.plan.waves.len() {
            let wave = ctx.current_wave;
            for idx in ctx.wave_tasks(wave) {
                if ctx.graph.task(idx).status != TaskStatus::Pending {
                    continue;
                }
                match dependency_state(ctx, idx) {
                    DependencyState::Waiting => {}
                    DependencyState::Resolved => {
                        let task = ctx.graph.task_mut(idx);
                        task.mark_ready();
                        run.ready.insert((Reverse(task.spec.priority), idx));
                        wlog_trace!("Task {} ready", task.spec.id);
                    }
                    DependencyState::Blocked(from) => {
                        ctx.graph.task_mut(idx).skip(SkipCause::Upstream { from: from.clone() });
                        let mut skipped = vec![(idx, SkipCause::Upstream { from })];
                        skipped.extend(recovery::cascade(&mut ctx.graph, idx));
                        self.emit_skips(ctx, skipped);
                    }
                }
            }

            if !ctx.wave_is_terminal(wave) {
                return;
            }
            if self.complete_wave(ctx, run, wave) {
                return;
            }
            if wave + 1 >= ctx.plan.waves.len() {
                return;
            }
            ctx.current_wave = wave + 1;
            self.begin_wave(ctx, run, wave + 1);
        }
    }

    /// Close a wave, replan on drift and queue its checkpoint. Returns
    /// false when the wave was already closed.
    fn complete_wave(&self, ctx: &mut ExecutionContext, run: &mut RunLoop, wave: usize) -> bool {
        if ctx.last_completed_wave.is_some_and(|done| done >= wave) {
            return false;
        }
        let actual_ms = millis(run.wave_started.elapsed());
        let estimated_ms = ctx
            .plan
            .waves
            .get(wave)
            .map(|w| w.estimated_duration_ms)
            .unwrap_or(0);
        if let Some(record) = ctx.wave_records.iter_mut().rev().find(|r| r.index == wave) {
            record.ended_at = Some(Utc::now());
            record.actual_ms = Some(actual_ms);
        }
        ctx.last_completed_wave = Some(wave);
        wlog!(
            "Wave {} complete: graph={} actual={}ms estimated={}ms",
            wave,
            self.graph_id.short(),
            actual_ms,
            estimated_ms
        );
        self.emit(RunEvent::WaveCompleted {
            graph_id: self.graph_id,
            wave,
            estimated_ms,
            actual_ms,
        });

        match recovery::replan_on_drift(ctx, &self.scheduler, self.config.drift_threshold) {
            Ok(Some(drift)) => self.emit(RunEvent::Replanned {
                graph_id: self.graph_id,
                revision: ctx.plan.revision,
                baseline_ms: drift.baseline_ms,
                adjusted_ms: drift.adjusted_ms,
            }),
            Ok(None) => {}
            Err(e) => wlog_warn!("Replanning skipped for {}: {}", self.graph_id.short(), e),
        }

        run.checkpoints.push(Checkpoint::capture(ctx));
        true
    }

    /// Launch ready tasks while workers and resources allow. Returns true
    /// when a task changed state without being launched.
    fn dispatch(&self, ctx: &mut ExecutionContext, run: &mut RunLoop) -> bool {
        let mut settled_inline = false;
        while run.in_flight < self.config.workers {
            let pick = run
                .ready
                .iter()
                .find(|(_, idx)| ctx.ledger.can_reserve(&ctx.graph.task(*idx).spec.resources))
                .copied();
            let Some(key) = pick else {
                break;
            };
            run.ready.remove(&key);
            if !self.launch(ctx, run, key.1) {
                settled_inline = true;
            }
        }
        settled_inline
    }

    fn launch(&self, ctx: &mut ExecutionContext, run: &mut RunLoop, idx: NodeIndex) -> bool {
        let operation = ctx.graph.task(idx).spec.operation_ref.clone();
        let Some(handler) = self.registry.get(&operation) else {
            let task = ctx.graph.task_mut(idx);
            task.start_attempt();
            let error = ExecutionError::HandlerMissing { operation };
            task.fail(error.clone());
            let id = task.spec.id.clone();
            wlog_error!("Task {} failed: {}", id, error);
            self.emit(RunEvent::TaskFailed {
                graph_id: self.graph_id,
                task: id,
                error,
            });
            let skipped = recovery::cascade(&mut ctx.graph, idx);
            self.emit_skips(ctx, skipped);
            return false;
        };

        let resources = ctx.graph.task(idx).spec.resources;
        ctx.ledger.try_reserve(&resources);
        let task = ctx.graph.task_mut(idx);
        let attempt = task.start_attempt();
        let inputs = task.spec.inputs.clone();
        let timeout = task.spec.timeout();
        let id = task.spec.id.clone();

        let token = self.cancel.child_token();
        let grace = self.config.cancel_grace;
        let tx = run.tx.clone();
        run.in_flight += 1;

        wlog_debug!("Dispatching {} (attempt {}) to {}", id, attempt, operation);
        self.emit(RunEvent::TaskStarted {
            graph_id: self.graph_id,
            task: id,
            attempt,
        });

        tokio::spawn(async move {
            let started = Instant::now();
            let outcome = invoke(handler, inputs, token, timeout, grace).await;
            let _ = tx.send(Message::Report(WorkerReport {
                idx,
                attempt,
                outcome,
                elapsed: started.elapsed(),
            }));
        });
        true
    }

    fn handle_report(&self, ctx: &mut ExecutionContext, run: &mut RunLoop, report: WorkerReport) {
        if !run.cancelling && self.cancel.is_cancelled() {
            self.begin_cancel(ctx, run);
        }
        run.in_flight = run.in_flight.saturating_sub(1);
        let idx = report.idx;
        let (resources, operation, estimate) = {
            let spec = &ctx.graph.task(idx).spec;
            (spec.resources, spec.operation_ref.clone(), spec.estimated_duration_ms)
        };
        ctx.ledger.release(&resources);

        let task = ctx.graph.task(idx);
        if task.status != TaskStatus::Running || task.attempt_count != report.attempt {
            wlog_warn!("Stale report for {} attempt {}", task.spec.id, report.attempt);
            return;
        }
        if matches!(report.outcome, Outcome::Succeeded(_)) {
            ctx.stats.record_task(&operation, estimate, millis(report.elapsed));
        }

        match report.outcome {
            Outcome::Succeeded(outputs) => self.on_success(ctx, idx, outputs),
            Outcome::Failed(_) | Outcome::Cancelled if run.cancelling => self.on_cancelled(ctx, idx),
            Outcome::Failed(error) => self.on_failure(ctx, run, idx, error),
            Outcome::Cancelled => self.on_cancelled(ctx, idx),
        }
    }

    fn on_success(&self, ctx: &mut ExecutionContext, idx: NodeIndex, outputs: Payload) {
        let task = ctx.graph.task_mut(idx);
        task.succeed(outputs);
        let id = task.spec.id.clone();
        wlog_debug!("Task {} succeeded", id);
        self.emit(RunEvent::TaskSucceeded {
            graph_id: self.graph_id,
            task: id,
        });
        let skipped = recovery::apply_predicates(&mut ctx.graph, idx);
        self.emit_skips(ctx, skipped);
    }

    fn on_cancelled(&self, ctx: &mut ExecutionContext, idx: NodeIndex) {
        let task = ctx.graph.task_mut(idx);
        task.cancel();
        let id = task.spec.id.clone();
        wlog_debug!("Task {} cancelled", id);
        self.emit(RunEvent::TaskCancelled {
            graph_id: self.graph_id,
            task: id,
        });
    }

    fn on_failure(&self, ctx: &mut ExecutionContext, run: &mut RunLoop, idx: NodeIndex, error: ExecutionError) {
        let task = ctx.graph.task_mut(idx);
        let policy = task.spec.retry;
        let attempts = task.attempt_count;
        let id = task.spec.id.clone();

        if recovery::should_retry(&policy, attempts, &error) {
            let delay = recovery::backoff_delay(&policy, attempts, self.config.retry_jitter);
            wlog_warn!(
                "Task {} attempt {} failed ({}), retrying in {:?}",
                id,
                attempts,
                error,
                delay
            );
            task.retry_later(error);
            self.emit(RunEvent::TaskRetrying {
                graph_id: self.graph_id,
                task: id,
                attempt: attempts,
                delay_ms: millis(delay),
            });

            run.retry_timers += 1;
            let tx = run.tx.clone();
            let cancel = self.cancel.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => {}
                }
                let _ = tx.send(Message::RetryDue(idx));
            });
            return;
        }

        let error = recovery::final_error(&policy, attempts, error);
        wlog_warn!("Task {} failed: {}", id, error);
        task.fail(error.clone());
        self.emit(RunEvent::TaskFailed {
            graph_id: self.graph_id,
            task: id,
            error,
        });
        let skipped = recovery::cascade(&mut ctx.graph, idx);
        self.emit_skips(ctx, skipped);
    }

    fn handle_retry_due(&self, ctx: &mut ExecutionContext, run: &mut RunLoop, idx: NodeIndex) {
        run.retry_timers = run.retry_timers.saturating_sub(1);
        if run.cancelling {
            return;
        }
        let task = ctx.graph.task_mut(idx);
        if matches!(task.status, TaskStatus::Retrying { .. }) {
            task.mark_ready();
            run.ready.insert((Reverse(task.spec.priority), idx));
        }
    }

    /// Stop dispatching and cancel everything that is not in flight.
    fn begin_cancel(&self, ctx: &mut ExecutionContext, run: &mut RunLoop) {
        run.cancelling = true;
        ctx.run_state = RunState::Cancelling;
        wlog!(
            "Cancelling run {} ({} tasks in flight)",
            self.graph_id.short(),
            run.in_flight
        );
        run.ready.clear();
        let indices: Vec<NodeIndex> = ctx.graph.indices().collect();
        for idx in indices {
            match ctx.graph.task(idx).status {
                TaskStatus::Retrying { .. } => self.on_cancelled(ctx, idx),
                TaskStatus::Ready => ctx.graph.task_mut(idx).status = TaskStatus::Pending,
                _ => {}
            }
        }
    }

    fn settle(&self, ctx: &mut ExecutionContext, run: &RunLoop) {
        let indices: Vec<NodeIndex> = ctx.graph.indices().collect();
        for idx in indices {
            if ctx.graph.task(idx).status.is_active() {
                ctx.graph.task_mut(idx).cancel();
            }
        }

        let any_failed = ctx
            .graph
            .tasks()
            .any(|t| matches!(t.status, TaskStatus::Failed { .. }));
        ctx.run_state = if run.deadline_hit {
            let limit = self.config.global_deadline.unwrap_or_default();
            wlog_warn!("{}: {}", self.graph_id.short(), OrchestrationError::DeadlineExceeded(limit));
            RunState::Aborted
        } else if run.cancelling {
            wlog!("{}: {}", self.graph_id.short(), OrchestrationError::CancelledByUser);
            RunState::Cancelled
        } else if !any_failed && ctx.all_terminal() {
            RunState::AllSucceeded
        } else {
            RunState::Failed
        };
        ctx.ended_at = Some(Utc::now());
    }

    async fn flush_checkpoints(&self, run: &mut RunLoop) {
        for checkpoint in run.checkpoints.drain(..) {
            let store = Arc::clone(&self.store);
            let wave = checkpoint.completed_wave_index;
            match blocking(move || store.save(&checkpoint)).await {
                Ok(()) => self.emit(RunEvent::CheckpointWritten {
                    graph_id: self.graph_id,
                    wave,
                }),
                Err(e) => wlog_error!(
                    "Checkpoint write failed for {}: {}",
                    self.graph_id.short(),
                    e
                ),
            }
        }
    }
}

/// Whether a pending task can run, must wait, or can never run.
fn dependency_state(ctx: &ExecutionContext, idx: NodeIndex) -> DependencyState {
    let tolerant = ctx.graph.task(idx).spec.on_failure == FailurePolicy::Continue;
    let mut waiting = false;
    for dep in ctx.graph.dependencies(idx) {
        let status = &ctx.graph.task(dep).status;
        if *status == TaskStatus::Succeeded {
            continue;
        }
        if !status.is_terminal() {
            waiting = true;
        } else if !tolerant {
            return DependencyState::Blocked(ctx.graph.task(dep).spec.id.clone());
        }
    }
    if waiting {
        DependencyState::Waiting
    } else {
        DependencyState::Resolved
    }
}

/// Call a handler under the task deadline and the run's cancellation.
///
/// A timeout cancels the handler's token and drops the call. A run-level
/// cancel gives the handler `grace` to finish; a success within the grace
/// period still counts.
async fn invoke(
    handler: Arc<dyn Handler>,
    inputs: Payload,
    token: CancellationToken,
    timeout: Option<Duration>,
    grace: Duration,
) -> Outcome {
    let handler_token = token.clone();
    let call = AssertUnwindSafe(async move { handler.execute(inputs, handler_token).await }).catch_unwind();
    tokio::pin!(call);
    let deadline = async {
        match timeout {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(deadline);

    tokio::select! {
        biased;
        result = &mut call => outcome_of(result),
        _ = &mut deadline => {
            token.cancel();
            Outcome::Failed(ExecutionError::TaskTimeout {
                timeout_ms: timeout.map(millis).unwrap_or(0),
            })
        }
        _ = token.cancelled() => {
            match tokio::time::timeout(grace, &mut call).await {
                Ok(Ok(Ok(output))) if output.success => Outcome::Succeeded(output.outputs),
                _ => Outcome::Cancelled,
            }
        }
    }
}

fn outcome_of(result: std::thread::Result<HandlerResult>) -> Outcome {
    match result {
        Ok(Ok(output)) if output.success => Outcome::Succeeded(output.outputs),
        Ok(Ok(output)) => {
            let (error_kind, message) = match output.error {
                Some(info) => (info.kind, info.message),
                None => ("unknown".to_string(), "handler reported failure".to_string()),
            };
            Outcome::Failed(ExecutionError::TaskRuntimeFailure {
                error_kind,
                message,
            })
        }
        Ok(Err(fault)) => Outcome::Failed(ExecutionError::HandlerFault { message: fault.0 }),
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "handler panicked".to_string());
            Outcome::Failed(ExecutionError::HandlerFault { message })
        }
    }
}
