//! Checkpoint persistence.
//!
//! A checkpoint records every task's status and outputs after a wave
//! completes. Each graph has one active checkpoint; saving a new one keeps
//! the one it replaces as a fallback. The task definitions are stored beside
//! the checkpoints so a fresh process can resume a graph by id.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::core::context::ExecutionContext;
use crate::core::graph::{GraphId, TaskGraph};
use crate::core::task::{Payload, TaskId, TaskSpec, TaskStatus};
use crate::error::OrchestrationError;
use crate::{wlog_debug, Result};

/// Persisted state of one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskCheckpoint {
    pub status: TaskStatus,
    #[serde(default)]
    pub outputs: Payload,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub graph_id: GraphId,
    /// Last fully completed wave of the plan revision below.
    pub completed_wave_index: Option<usize>,
    #[serde(default)]
    pub plan_revision: u32,
    pub task_states: BTreeMap<TaskId, TaskCheckpoint>,
    pub timestamp: DateTime<Utc>,
}

impl Checkpoint {
    /// Snapshot the task states of a running context.
    pub fn capture(ctx: &ExecutionContext) -> Self {
        let task_states = ctx
            .graph
            .tasks()
            .map(|t| {
                (
                    t.spec.id.clone(),
                    TaskCheckpoint {
                        status: t.status.clone(),
                        outputs: t.outputs.clone(),
                    },
                )
            })
            .collect();
        Self {
            graph_id: ctx.graph_id,
            completed_wave_index: ctx.last_completed_wave,
            plan_revision: ctx.plan.revision,
            task_states,
            timestamp: Utc::now(),
        }
    }

    /// Check that the checkpoint describes exactly this graph.
    pub fn validate(&self, graph_id: GraphId, graph: &TaskGraph) -> std::result::Result<(), String> {
        if self.graph_id != graph_id {
            return Err(format!("belongs to graph {}", self.graph_id));
        }
        if self.task_states.len() != graph.len() {
            return Err(format!(
                "has {} tasks, graph has {}",
                self.task_states.len(),
                graph.len()
            ));
        }
        if let Some(unknown) = self.task_states.keys().find(|id| !graph.contains(id)) {
            return Err(format!("unknown task {}", unknown));
        }
        Ok(())
    }

    pub fn succeeded(&self) -> impl Iterator<Item = (&TaskId, &TaskCheckpoint)> {
        self.task_states
            .iter()
            .filter(|(_, state)| state.status == TaskStatus::Succeeded)
    }
}

/// Which stored checkpoint to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointSlot {
    Current,
    /// The checkpoint the current one replaced.
    Previous,
}

/// Storage for graph definitions and checkpoints.
///
/// Calls are synchronous; async callers go through `util::blocking`.
pub trait CheckpointStore: Send + Sync {
    fn save_graph(&self, graph_id: GraphId, specs: &[TaskSpec]) -> Result<()>;

    fn load_graph(&self, graph_id: GraphId) -> Result<Option<Vec<TaskSpec>>>;

    /// Persist `checkpoint` as the current record, demoting the old one.
    fn save(&self, checkpoint: &Checkpoint) -> Result<()>;

    /// Read a stored checkpoint. Unreadable records yield `CheckpointCorrupt`.
    fn load(&self, graph_id: GraphId, slot: CheckpointSlot) -> Result<Option<Checkpoint>>;

    /// Remove the graph definition and every checkpoint for it.
    fn delete(&self, graph_id: GraphId) -> Result<()>;
}

/// JSON files under one directory.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn checkpoint_path(&self, graph_id: GraphId) -> PathBuf {
        self.dir.join(format!("{}.checkpoint.json", graph_id))
    }

    pub fn previous_path(&self, graph_id: GraphId) -> PathBuf {
        self.dir.join(format!("{}.checkpoint.prev.json", graph_id))
    }

    pub fn graph_path(&self, graph_id: GraphId) -> PathBuf {
        self.dir.join(format!("{}.graph.json", graph_id))
    }

    fn ensure_dir(&self) -> Result<()> {
        if !self.dir.exists() {
            wlog_debug!("Creating checkpoint directory: {}", self.dir.display());
            fs::create_dir_all(&self.dir)?;
        }
        Ok(())
    }

    fn write_atomic(path: &Path, contents: &str) -> Result<()> {
        let temp_path = path.with_extension("json.tmp");
        fs::write(&temp_path, contents)?;
        fs::rename(&temp_path, path)?;
        Ok(())
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn save_graph(&self, graph_id: GraphId, specs: &[TaskSpec]) -> Result<()> {
        self.ensure_dir()?;
        let contents = serde_json::to_string_pretty(specs)?;
        Self::write_atomic(&self.graph_path(graph_id), &contents)
    }

    fn load_graph(&self, graph_id: GraphId) -> Result<Option<Vec<TaskSpec>>> {
        let path = self.graph_path(graph_id);
        if !path.exists() {
            return Ok(None);
        }
        let specs = serde_json::from_str(&fs::read_to_string(&path)?)?;
        Ok(Some(specs))
    }

    fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        self.ensure_dir()?;
        let path = self.checkpoint_path(checkpoint.graph_id);
        if path.exists() {
            fs::rename(&path, self.previous_path(checkpoint.graph_id))?;
        }
        let contents = serde_json::to_string_pretty(checkpoint)?;
        Self::write_atomic(&path, &contents)?;
        wlog_debug!(
            "Checkpoint saved: graph={} wave={:?}",
            checkpoint.graph_id.short(),
            checkpoint.completed_wave_index
        );
        Ok(())
    }

    fn load(&self, graph_id: GraphId, slot: CheckpointSlot) -> Result<Option<Checkpoint>> {
        let path = match slot {
            CheckpointSlot::Current => self.checkpoint_path(graph_id),
            CheckpointSlot::Previous => self.previous_path(graph_id),
        };
        if !path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(&path)?;
        let checkpoint = serde_json::from_str(&contents).map_err(|e| {
            OrchestrationError::CheckpointCorrupt {
                graph_id,
                reason: e.to_string(),
            }
        })?;
        Ok(Some(checkpoint))
    }

    fn delete(&self, graph_id: GraphId) -> Result<()> {
        for path in [
            self.checkpoint_path(graph_id),
            self.previous_path(graph_id),
            self.graph_path(graph_id),
        ] {
            if path.exists() {
                fs::remove_file(&path)?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct MemoryEntry {
    specs: Option<Vec<TaskSpec>>,
    current: Option<Checkpoint>,
    previous: Option<Checkpoint>,
}

/// In-process store for tests and embedders that do not need durability.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    entries: Mutex<HashMap<GraphId, MemoryEntry>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_entries<T>(&self, f: impl FnOnce(&mut HashMap<GraphId, MemoryEntry>) -> T) -> T {
        let mut guard = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn save_graph(&self, graph_id: GraphId, specs: &[TaskSpec]) -> Result<()> {
        self.with_entries(|entries| {
            entries.entry(graph_id).or_default().specs = Some(specs.to_vec());
        });
        Ok(())
    }

    fn load_graph(&self, graph_id: GraphId) -> Result<Option<Vec<TaskSpec>>> {
        Ok(self.with_entries(|entries| entries.get(&graph_id).and_then(|e| e.specs.clone())))
    }

    fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        self.with_entries(|entries| {
            let entry = entries.entry(checkpoint.graph_id).or_default();
            entry.previous = entry.current.replace(checkpoint.clone());
        });
        Ok(())
    }

    fn load(&self, graph_id: GraphId, slot: CheckpointSlot) -> Result<Option<Checkpoint>> {
        Ok(self.with_entries(|entries| {
            entries.get(&graph_id).and_then(|e| match slot {
                CheckpointSlot::Current => e.current.clone(),
                CheckpointSlot::Previous => e.previous.clone(),
            })
        }))
    }

    fn delete(&self, graph_id: GraphId) -> Result<()> {
        self.with_entries(|entries| entries.remove(&graph_id));
        Ok(())
    }
}
