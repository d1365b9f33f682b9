//! Core domain model: tasks, predicates, the dependency graph, and the
//! runtime context of an execution.

pub mod context;
pub mod graph;
pub mod predicate;
pub mod task;

pub use context::{ExecutionContext, ResourceLedger, RunState, RuntimeStats, WaveRecord};
pub use graph::{Dependency, GraphBuilder, GraphId, TaskGraph};
pub use predicate::Predicate;
pub use task::{
    EdgeCondition, FailurePolicy, Payload, Resources, RetryPolicy, SkipCause, Task, TaskId,
    TaskSpec, TaskStatus,
};
