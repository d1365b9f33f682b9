//! Planning, execution and control of task graphs.
//!
//! The `Scheduler` turns a validated graph into waves, the `Executor` runs
//! one graph wave by wave through registered handlers, and the
//! `Orchestrator` ties graphs, runs, checkpoints and status together.

pub mod builtin;
pub mod executor;
pub mod handler;
pub mod monitor;
pub mod orchestrator;
pub mod recovery;
pub mod scheduler;

pub use executor::{Control, Executor, ExecutorConfig, RunEvent, RunReport};
pub use handler::{
    FnHandler, Handler, HandlerErrorInfo, HandlerFault, HandlerOutput, HandlerRegistry,
    HandlerResult,
};
pub use monitor::{Bottleneck, Monitor, StatusSnapshot};
pub use orchestrator::Orchestrator;
pub use scheduler::{ExecutionPlan, Scheduler, Wave};
