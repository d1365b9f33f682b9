//! Task data model.
//!
//! A `TaskSpec` is the submission record callers hand to the orchestrator.
//! A `Task` wraps the spec with the runtime fields the executor mutates:
//! status, attempt count, timing, outputs and the last error.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;

use crate::core::predicate::Predicate;
use crate::error::ExecutionError;

/// JSON object passed to handlers and returned from them.
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// Caller-chosen identifier for a task, unique within a graph.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Resource requirement of a task, or the capacity of a wave.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Resources {
    #[serde(default)]
    pub cpu: f64,
    #[serde(default)]
    pub mem: f64,
}

impl Resources {
    pub fn new(cpu: f64, mem: f64) -> Self {
        Self { cpu, mem }
    }

    /// Both weights are finite and not negative.
    pub fn is_valid(&self) -> bool {
        [self.cpu, self.mem].iter().all(|v| v.is_finite() && *v >= 0.0)
    }

    /// Whether `other` fits inside `self`.
    pub fn fits(&self, other: &Resources) -> bool {
        other.cpu <= self.cpu + f64::EPSILON && other.mem <= self.mem + f64::EPSILON
    }

    pub fn saturating_sub(&self, other: &Resources) -> Resources {
        Resources {
            cpu: (self.cpu - other.cpu).max(0.0),
            mem: (self.mem - other.mem).max(0.0),
        }
    }

    pub fn add(&self, other: &Resources) -> Resources {
        Resources {
            cpu: self.cpu + other.cpu,
            mem: self.mem + other.mem,
        }
    }
}

/// Retry settings for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts allowed, including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub backoff_base_ms: u64,
}

fn default_max_attempts() -> u32 {
    1
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_base_ms: 0,
        }
    }
}

impl RetryPolicy {
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }
}

/// How a task reacts when something it depends on does not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Skip this task when an upstream task fails or is skipped.
    #[default]
    Fail,
    /// Skip this task and, when it fails itself, its entire downstream subtree.
    SkipDependents,
    /// Run anyway once the other dependencies resolve.
    Continue,
}

impl std::fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailurePolicy::Fail => write!(f, "fail"),
            FailurePolicy::SkipDependents => write!(f, "skip_dependents"),
            FailurePolicy::Continue => write!(f, "continue"),
        }
    }
}

/// A predicate guarding the edge from `from` to the declaring task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeCondition {
    pub from: TaskId,
    pub predicate: Predicate,
}

/// The task submission record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub id: TaskId,
    pub operation_ref: String,
    #[serde(default)]
    pub inputs: Payload,
    #[serde(default)]
    pub depends_on: BTreeSet<TaskId>,
    #[serde(default)]
    pub resources: Resources,
    #[serde(default)]
    pub priority: i64,
    /// Per-attempt deadline; zero disables it.
    #[serde(default)]
    pub timeout_ms: u64,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub on_failure: FailurePolicy,
    #[serde(default)]
    pub estimated_duration_ms: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub when: Vec<EdgeCondition>,
}

impl TaskSpec {
    /// Create a spec with defaults for everything but id and operation.
    pub fn new(id: impl Into<String>, operation_ref: impl Into<String>) -> Self {
        Self {
            id: TaskId::new(id),
            operation_ref: operation_ref.into(),
            inputs: Payload::new(),
            depends_on: BTreeSet::new(),
            resources: Resources::default(),
            priority: 0,
            timeout_ms: 0,
            retry: RetryPolicy::default(),
            on_failure: FailurePolicy::default(),
            estimated_duration_ms: 0,
            when: Vec::new(),
        }
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on.extend(deps.into_iter().map(TaskId::new));
        self
    }

    pub fn with_input(mut self, key: &str, value: serde_json::Value) -> Self {
        self.inputs.insert(key.to_string(), value);
        self
    }

    pub fn with_resources(mut self, cpu: f64, mem: f64) -> Self {
        self.resources = Resources::new(cpu, mem);
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_retry(mut self, max_attempts: u32, backoff_base_ms: u64) -> Self {
        self.retry = RetryPolicy {
            max_attempts,
            backoff_base_ms,
        };
        self
    }

    pub fn with_on_failure(mut self, policy: FailurePolicy) -> Self {
        self.on_failure = policy;
        self
    }

    pub fn with_estimate_ms(mut self, estimated_duration_ms: u64) -> Self {
        self.estimated_duration_ms = estimated_duration_ms;
        self
    }

    /// Guard the edge from `from` with a predicate; `from` is added as a dependency.
    pub fn when(mut self, from: &str, predicate: Predicate) -> Self {
        self.depends_on.insert(TaskId::from(from));
        self.when.push(EdgeCondition {
            from: TaskId::from(from),
            predicate,
        });
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_ms > 0).then(|| Duration::from_millis(self.timeout_ms))
    }

    pub fn estimated_duration(&self) -> Duration {
        Duration::from_millis(self.estimated_duration_ms)
    }
}

/// Why a task was skipped without running.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "cause")]
pub enum SkipCause {
    /// An edge predicate evaluated false against `from`'s outputs.
    Predicate { from: TaskId },
    /// An upstream task failed or was skipped.
    Upstream { from: TaskId },
}

impl std::fmt::Display for SkipCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipCause::Predicate { from } => write!(f, "predicate on {} was false", from),
            SkipCause::Upstream { from } => write!(f, "upstream {} did not succeed", from),
        }
    }
}

/// Task status in its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum TaskStatus {
    /// Waiting for its wave or its dependencies.
    #[default]
    Pending,
    /// In the ready queue.
    Ready,
    /// A handler invocation is in flight.
    Running,
    /// Failed an attempt and waiting out the backoff.
    Retrying { attempt: u32 },
    /// Finished successfully.
    Succeeded,
    /// Failed with no attempts left.
    Failed { error: ExecutionError },
    /// Never ran because of a predicate or an upstream failure.
    Skipped { reason: SkipCause },
    /// Stopped by run cancellation.
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded
                | TaskStatus::Failed { .. }
                | TaskStatus::Skipped { .. }
                | TaskStatus::Cancelled
        )
    }

    /// Terminal without success.
    pub fn is_unsuccessful(&self) -> bool {
        self.is_terminal() && !matches!(self, TaskStatus::Succeeded)
    }

    /// Has never been handed to a worker.
    pub fn is_not_started(&self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::Ready)
    }

    pub fn is_active(&self) -> bool {
        matches!(self, TaskStatus::Running)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Ready => write!(f, "ready"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Retrying { attempt } => write!(f, "retrying (after attempt {})", attempt),
            TaskStatus::Succeeded => write!(f, "succeeded"),
            TaskStatus::Failed { error } => write!(f, "failed: {}", error),
            TaskStatus::Skipped { reason } => write!(f, "skipped: {}", reason),
            TaskStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// A task inside a graph: the immutable spec plus runtime state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub spec: TaskSpec,
    pub status: TaskStatus,
    /// Number of attempts started so far.
    pub attempt_count: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub outputs: Payload,
    pub last_error: Option<ExecutionError>,
}

impl Task {
    pub fn new(spec: TaskSpec) -> Self {
        Self {
            spec,
            status: TaskStatus::Pending,
            attempt_count: 0,
            started_at: None,
            ended_at: None,
            outputs: Payload::new(),
            last_error: None,
        }
    }

    pub fn id(&self) -> &TaskId {
        &self.spec.id
    }

    pub fn mark_ready(&mut self) {
        self.status = TaskStatus::Ready;
    }

    /// Begin a new attempt; returns its 1-based number.
    pub fn start_attempt(&mut self) -> u32 {
        self.attempt_count += 1;
        self.status = TaskStatus::Running;
        self.started_at = Some(Utc::now());
        self.ended_at = None;
        self.attempt_count
    }

    pub fn succeed(&mut self, outputs: Payload) {
        self.status = TaskStatus::Succeeded;
        self.outputs = outputs;
        self.ended_at = Some(Utc::now());
    }

    pub fn retry_later(&mut self, error: ExecutionError) {
        self.status = TaskStatus::Retrying {
            attempt: self.attempt_count,
        };
        self.last_error = Some(error);
        self.ended_at = Some(Utc::now());
    }

    pub fn fail(&mut self, error: ExecutionError) {
        self.last_error = Some(error.clone());
        self.status = TaskStatus::Failed { error };
        self.ended_at = Some(Utc::now());
    }

    pub fn skip(&mut self, reason: SkipCause) {
        self.status = TaskStatus::Skipped { reason };
    }

    pub fn cancel(&mut self) {
        self.status = TaskStatus::Cancelled;
        if self.started_at.is_some() {
            self.ended_at = Some(Utc::now());
        }
    }

    /// Put the task back to its submitted state.
    pub fn reset(&mut self) {
        *self = Task::new(self.spec.clone());
    }

    /// Wall time of the last attempt; for a running task, the time so far.
    pub fn actual_duration(&self) -> Option<Duration> {
        let started = self.started_at?;
        let end = match (&self.status, self.ended_at) {
            (TaskStatus::Running, _) => Utc::now(),
            (_, Some(ended)) => ended,
            (_, None) => return None,
        };
        (end - started).to_std().ok()
    }
}
