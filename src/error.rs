use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::graph::GraphId;
use crate::core::task::TaskId;

/// Rejections raised while building or scheduling a graph.
///
/// These surface synchronously from `submit_graph` and are never partially
/// applied: a graph that fails validation gets no id.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Cycle detected: {}", format_path(.path))]
    CycleDetected { path: Vec<TaskId> },

    #[error("Task {task} depends on unknown task {missing}")]
    MissingDependency { task: TaskId, missing: TaskId },

    #[error("Duplicate task id: {0}")]
    DuplicateId(TaskId),

    #[error("Task {task} has invalid resources cpu={cpu} mem={mem}")]
    InvalidResources { task: TaskId, cpu: f64, mem: f64 },

    #[error("Task {task} needs cpu={cpu} mem={mem} but capacity is cpu={capacity_cpu} mem={capacity_mem}")]
    Infeasible {
        task: TaskId,
        cpu: f64,
        mem: f64,
        capacity_cpu: f64,
        capacity_mem: f64,
    },
}

fn format_path(path: &[TaskId]) -> String {
    path.iter()
        .map(|id| id.as_str())
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// Failures local to a single task.
///
/// Recorded in the task's status and handled by retry and cascade logic;
/// they never stop the orchestrator itself.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ExecutionError {
    #[error("Task timed out after {timeout_ms}ms")]
    TaskTimeout { timeout_ms: u64 },

    #[error("Task failed ({error_kind}): {message}")]
    TaskRuntimeFailure { error_kind: String, message: String },

    #[error("Retries exhausted after {attempts} attempts: {last}")]
    RetryExhausted {
        attempts: u32,
        last: Box<ExecutionError>,
    },

    #[error("Handler fault: {message}")]
    HandlerFault { message: String },

    #[error("No handler registered for operation: {operation}")]
    HandlerMissing { operation: String },
}

impl ExecutionError {
    /// Whether another attempt could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ExecutionError::TaskTimeout { .. } | ExecutionError::TaskRuntimeFailure { .. }
        )
    }

    /// The underlying error, unwrapping retry exhaustion.
    pub fn root(&self) -> &ExecutionError {
        match self {
            ExecutionError::RetryExhausted { last, .. } => last.root(),
            other => other,
        }
    }
}

/// Failures that affect a whole run.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum OrchestrationError {
    #[error("Run cancelled by user")]
    CancelledByUser,

    #[error("Checkpoint for graph {graph_id} is corrupt: {reason}")]
    CheckpointCorrupt { graph_id: GraphId, reason: String },

    #[error("Global deadline of {0:?} exceeded")]
    DeadlineExceeded(std::time::Duration),
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Orchestration error: {0}")]
    Orchestration(#[from] OrchestrationError),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Graph not found: {0}")]
    GraphNotFound(GraphId),

    #[error("Invalid graph id {id}: {reason}")]
    InvalidGraphId { id: String, reason: String },

    #[error("Invalid run state for {action}: {state}")]
    InvalidRunState { action: String, state: String },

    #[error("No handler registered for operation {operation} (task {task})")]
    HandlerNotFound { task: TaskId, operation: String },

    #[error("Task join error: {0}")]
    TaskJoin(String),
}

pub type Result<T> = std::result::Result<T, Error>;
