//! Control and status API over many graphs.
//!
//! The `Orchestrator` owns every submitted graph, spawns one `Executor` per
//! run, and routes control requests to it. It is cheap to clone; clones
//! share the same graphs, handlers and checkpoint store.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch, RwLock};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::core::context::{ExecutionContext, RunState};
use crate::core::graph::{GraphId, TaskGraph};
use crate::core::task::TaskSpec;
use crate::error::{Error, Result};
use crate::orchestration::executor::{Control, Executor, ExecutorConfig, RunEvent, RunReport};
use crate::orchestration::handler::HandlerRegistry;
use crate::orchestration::monitor::{Monitor, StatusSnapshot};
use crate::orchestration::recovery;
use crate::orchestration::scheduler::Scheduler;
use crate::state::{CheckpointStore, FileCheckpointStore};
use crate::util::blocking;
use crate::{wlog, wlog_debug};

const EVENT_CAPACITY: usize = 1024;

/// Handle to a spawned run.
struct RunHandle {
    cancel: CancellationToken,
    control: mpsc::UnboundedSender<Control>,
    done: watch::Receiver<Option<RunReport>>,
}

impl RunHandle {
    fn is_finished(&self) -> bool {
        self.done.borrow().is_some()
    }
}

struct GraphEntry {
    ctx: Arc<RwLock<ExecutionContext>>,
    run: Option<RunHandle>,
}

impl GraphEntry {
    fn live_run(&self) -> Option<&RunHandle> {
        self.run.as_ref().filter(|run| !run.is_finished())
    }
}

struct Inner {
    config: Config,
    registry: Arc<HandlerRegistry>,
    store: Arc<dyn CheckpointStore>,
    scheduler: Scheduler,
    monitor: Monitor,
    graphs: RwLock<HashMap<GraphId, GraphEntry>>,
    events: broadcast::Sender<RunEvent>,
}

#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("config", &self.inner.config)
            .field("registry", &self.inner.registry)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    pub fn new(config: Config, registry: HandlerRegistry, store: Arc<dyn CheckpointStore>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                scheduler: Scheduler::new(config.capacity),
                monitor: Monitor::new(config.bottleneck_limit),
                config,
                registry: Arc::new(registry),
                store,
                graphs: RwLock::new(HashMap::new()),
                events,
            }),
        }
    }

    /// Orchestrator persisting checkpoints under the configured directory.
    pub fn from_config(config: Config, registry: HandlerRegistry) -> Result<Self> {
        let store = FileCheckpointStore::new(config.checkpoints_dir()?);
        Ok(Self::new(config, registry, Arc::new(store)))
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Validate and plan a graph. A rejected graph is not registered.
    pub async fn submit_graph(&self, specs: Vec<TaskSpec>) -> Result<GraphId> {
        let graph = TaskGraph::from_specs(specs)?;
        let plan = self.inner.scheduler.schedule(&graph)?;
        let graph_id = GraphId::new();
        wlog!(
            "Submitted graph {}: {} tasks, {} edges, {} waves, critical path {}ms",
            graph_id.short(),
            graph.len(),
            graph.edge_count(),
            plan.wave_count(),
            plan.estimated_total_duration_ms
        );
        let ctx = ExecutionContext::new(graph_id, graph, plan, self.inner.scheduler.capacity());
        let mut graphs = self.inner.graphs.write().await;
        self.prune_finished(&mut graphs).await;
        graphs.insert(
            graph_id,
            GraphEntry {
                ctx: Arc::new(RwLock::new(ctx)),
                run: None,
            },
        );
        Ok(graph_id)
    }

    /// Start a submitted graph, or continue a paused one.
    pub async fn start(&self, graph_id: GraphId) -> Result<()> {
        let mut graphs = self.inner.graphs.write().await;
        let entry = graphs.get_mut(&graph_id).ok_or(Error::GraphNotFound(graph_id))?;
        let state = entry.ctx.read().await.run_state;

        if let Some(run) = entry.live_run() {
            if state == RunState::Paused {
                let _ = run.control.send(Control::Unpause);
                return Ok(());
            }
            return Err(invalid("start", state));
        }
        if state != RunState::Submitted {
            return Err(invalid("start", state));
        }

        let specs = {
            let ctx = entry.ctx.read().await;
            self.check_handlers(&ctx.graph)?;
            ctx.graph.specs()
        };
        let store = Arc::clone(&self.inner.store);
        blocking(move || store.save_graph(graph_id, &specs)).await?;

        entry.run = Some(self.spawn_run(graph_id, Arc::clone(&entry.ctx)));
        Ok(())
    }

    /// Stop dispatching new tasks; running tasks finish.
    pub async fn pause(&self, graph_id: GraphId) -> Result<()> {
        let graphs = self.inner.graphs.read().await;
        let entry = graphs.get(&graph_id).ok_or(Error::GraphNotFound(graph_id))?;
        let state = entry.ctx.read().await.run_state;
        match entry.live_run() {
            Some(run) if state != RunState::Cancelling => {
                let _ = run.control.send(Control::Pause);
                Ok(())
            }
            _ => Err(invalid("pause", state)),
        }
    }

    /// Cancel a live run. Running handlers get the grace period to stop.
    pub async fn cancel(&self, graph_id: GraphId) -> Result<()> {
        let graphs = self.inner.graphs.read().await;
        let entry = graphs.get(&graph_id).ok_or(Error::GraphNotFound(graph_id))?;
        match entry.live_run() {
            Some(run) => {
                wlog!("Cancel requested for graph {}", graph_id.short());
                run.cancel.cancel();
                Ok(())
            }
            None => Err(invalid("cancel", entry.ctx.read().await.run_state)),
        }
    }

    /// Continue a graph.
    ///
    /// A paused run is unpaused. Otherwise the graph is rebuilt from its
    /// latest usable checkpoint, in memory or from the store, and the tasks
    /// that had not succeeded are run again.
    pub async fn resume(&self, graph_id: GraphId) -> Result<()> {
        let mut graphs = self.inner.graphs.write().await;

        let specs = match graphs.get(&graph_id) {
            Some(entry) => {
                let state = entry.ctx.read().await.run_state;
                if let Some(run) = entry.live_run() {
                    if state == RunState::Paused {
                        let _ = run.control.send(Control::Unpause);
                        return Ok(());
                    }
                    return Err(invalid("resume", state));
                }
                let ctx = entry.ctx.read().await;
                ctx.graph.specs()
            }
            None => {
                let store = Arc::clone(&self.inner.store);
                blocking(move || store.load_graph(graph_id))
                    .await?
                    .ok_or(Error::GraphNotFound(graph_id))?
            }
        };

        let ctx = recovery::restore(
            graph_id,
            specs.clone(),
            Arc::clone(&self.inner.store),
            &self.inner.scheduler,
        )
        .await?;
        self.check_handlers(&ctx.graph)?;
        let store = Arc::clone(&self.inner.store);
        blocking(move || store.save_graph(graph_id, &specs)).await?;

        wlog!("Resuming graph {}", graph_id.short());
        let ctx = Arc::new(RwLock::new(ctx));
        let run = self.spawn_run(graph_id, Arc::clone(&ctx));
        graphs.insert(graph_id, GraphEntry { ctx, run: Some(run) });
        Ok(())
    }

    /// Wait for the current run of a graph to finish.
    pub async fn wait(&self, graph_id: GraphId) -> Result<RunReport> {
        let mut done = {
            let graphs = self.inner.graphs.read().await;
            let entry = graphs.get(&graph_id).ok_or(Error::GraphNotFound(graph_id))?;
            match &entry.run {
                Some(run) => run.done.clone(),
                None => return Err(invalid("wait", entry.ctx.read().await.run_state)),
            }
        };
        let report = done
            .wait_for(|report| report.is_some())
            .await
            .map_err(|_| Error::TaskJoin(format!("run of graph {} ended without a report", graph_id)))?;
        report
            .clone()
            .ok_or_else(|| Error::TaskJoin(format!("run of graph {} ended without a report", graph_id)))
    }

    pub async fn status(&self, graph_id: GraphId) -> Result<StatusSnapshot> {
        let graphs = self.inner.graphs.read().await;
        let entry = graphs.get(&graph_id).ok_or(Error::GraphNotFound(graph_id))?;
        let ctx = entry.ctx.read().await;
        Ok(self.inner.monitor.snapshot(&ctx))
    }

    /// Drop a graph and its persisted state, cancelling any live run.
    pub async fn delete(&self, graph_id: GraphId) -> Result<()> {
        let entry = self.inner.graphs.write().await.remove(&graph_id);
        if let Some(run) = entry.as_ref().and_then(GraphEntry::live_run) {
            run.cancel.cancel();
            let mut done = run.done.clone();
            let _ = done.wait_for(|report| report.is_some()).await;
        }
        let store = Arc::clone(&self.inner.store);
        blocking(move || store.delete(graph_id)).await?;
        wlog_debug!("Deleted graph {}", graph_id.short());
        Ok(())
    }

    /// Ids of graphs known to this orchestrator.
    pub async fn graph_ids(&self) -> Vec<GraphId> {
        self.inner.graphs.read().await.keys().copied().collect()
    }

    /// Receive events from every run started after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.inner.events.subscribe()
    }

    /// Drop the oldest finished graphs beyond `retained_runs`.
    async fn prune_finished(&self, graphs: &mut HashMap<GraphId, GraphEntry>) {
        let mut finished = Vec::new();
        for (id, entry) in graphs.iter() {
            if entry.run.as_ref().is_some_and(RunHandle::is_finished) {
                finished.push((entry.ctx.read().await.ended_at, *id));
            }
        }
        let excess = finished.len().saturating_sub(self.inner.config.retained_runs);
        if excess == 0 {
            return;
        }
        finished.sort();
        for (_, id) in finished.into_iter().take(excess) {
            graphs.remove(&id);
            wlog_debug!("Dropped finished graph {} from memory", id.short());
        }
    }

    fn check_handlers(&self, graph: &TaskGraph) -> Result<()> {
        for task in graph.tasks() {
            if !self.inner.registry.contains(&task.spec.operation_ref) {
                return Err(Error::HandlerNotFound {
                    task: task.spec.id.clone(),
                    operation: task.spec.operation_ref.clone(),
                });
            }
        }
        Ok(())
    }

    fn spawn_run(&self, graph_id: GraphId, ctx: Arc<RwLock<ExecutionContext>>) -> RunHandle {
        let cancel = CancellationToken::new();
        let (control, control_rx) = mpsc::unbounded_channel();
        let (done_tx, done) = watch::channel(None);
        let executor = Executor::new(
            graph_id,
            ctx,
            Arc::clone(&self.inner.registry),
            Arc::clone(&self.inner.store),
            self.inner.scheduler,
            ExecutorConfig::from(&self.inner.config),
            self.inner.events.clone(),
            cancel.clone(),
        );
        tokio::spawn(async move {
            let report = executor.execute(control_rx).await;
            let _ = done_tx.send(Some(report));
        });
        RunHandle {
            cancel,
            control,
            done,
        }
    }
}

fn invalid(action: &str, state: RunState) -> Error {
    Error::InvalidRunState {
        action: action.to_string(),
        state: state.to_string(),
    }
}
