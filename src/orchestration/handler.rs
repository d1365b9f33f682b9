//! Handler capability registry.
//!
//! Task work is performed by handlers looked up by a task's `operation_ref`.
//! A handler receives the task's inputs and a cancellation token and reports
//! either an output record or a fault. Faults are unrecoverable and are never
//! retried; an output with `success = false` is an ordinary, retryable
//! failure.

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::core::task::Payload;

/// Failure description attached to an unsuccessful output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandlerErrorInfo {
    pub kind: String,
    pub message: String,
}

/// What a handler returns when it ran to completion.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct HandlerOutput {
    pub success: bool,
    #[serde(default)]
    pub outputs: Payload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<HandlerErrorInfo>,
}

impl HandlerOutput {
    pub fn ok(outputs: Payload) -> Self {
        Self {
            success: true,
            outputs,
            error: None,
        }
    }

    pub fn failed(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            success: false,
            outputs: Payload::new(),
            error: Some(HandlerErrorInfo {
                kind: kind.into(),
                message: message.into(),
            }),
        }
    }
}

/// An unrecoverable handler error.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct HandlerFault(pub String);

impl HandlerFault {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

pub type HandlerResult = Result<HandlerOutput, HandlerFault>;

/// A unit of task work.
///
/// Implementations should watch `cancel` and return promptly once it fires;
/// the executor waits a grace period before abandoning the call.
pub trait Handler: Send + Sync {
    fn execute(&self, inputs: Payload, cancel: CancellationToken) -> BoxFuture<'_, HandlerResult>;
}

/// Adapts a closure returning a future into a `Handler`.
pub struct FnHandler<F>(F);

impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(Payload, CancellationToken) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    fn execute(&self, inputs: Payload, cancel: CancellationToken) -> BoxFuture<'_, HandlerResult> {
        Box::pin((self.0)(inputs, cancel))
    }
}

/// Maps operation names to handlers.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn Handler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the built-in operations.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        crate::orchestration::builtin::register_builtins(&mut registry);
        registry
    }

    /// Register a handler, replacing any previous one for `operation`.
    pub fn register<H>(&mut self, operation: &str, handler: H) -> &mut Self
    where
        H: Handler + 'static,
    {
        self.handlers.insert(operation.to_string(), Arc::new(handler));
        self
    }

    pub fn register_fn<F, Fut>(&mut self, operation: &str, f: F) -> &mut Self
    where
        F: Fn(Payload, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.register(operation, FnHandler(f))
    }

    pub fn get(&self, operation: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.get(operation).cloned()
    }

    pub fn contains(&self, operation: &str) -> bool {
        self.handlers.contains_key(operation)
    }

    /// Registered operation names, sorted.
    pub fn operations(&self) -> Vec<String> {
        let mut ops: Vec<String> = self.handlers.keys().cloned().collect();
        ops.sort();
        ops
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("operations", &self.operations())
            .finish()
    }
}
