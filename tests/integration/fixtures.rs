//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - Building orchestrators over memory or file checkpoint stores
//! - Handlers that count invocations or block until cancelled
//! - Generated acyclic task sets

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::json;
use tokio::sync::broadcast;

use wavefront::core::{Payload, TaskSpec};
use wavefront::orchestration::{HandlerOutput, HandlerRegistry, Orchestrator, RunEvent};
use wavefront::state::{FileCheckpointStore, MemoryCheckpointStore};
use wavefront::Config;

/// Config with deterministic retries and a short cancel grace period.
pub fn test_config() -> Config {
    Config {
        retry_jitter: 0.0,
        cancel_grace_ms: 200,
        ..Config::default()
    }
}

pub fn memory_orchestrator(config: Config, registry: HandlerRegistry) -> Orchestrator {
    Orchestrator::new(config, registry, Arc::new(MemoryCheckpointStore::new()))
}

pub fn file_orchestrator(dir: &Path, registry: HandlerRegistry) -> Orchestrator {
    Orchestrator::new(
        test_config(),
        registry,
        Arc::new(FileCheckpointStore::new(dir)),
    )
}

/// Per-name invocation counts shared with `count` handlers.
#[derive(Clone, Default)]
pub struct CallCounter {
    calls: Arc<Mutex<HashMap<String, usize>>>,
}

impl CallCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, name: &str) {
        *self.calls.lock().unwrap().entry(name.to_string()).or_insert(0) += 1;
    }

    pub fn get(&self, name: &str) -> usize {
        self.calls.lock().unwrap().get(name).copied().unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.calls.lock().unwrap().values().sum()
    }
}

/// Registers `count`: records its `name` input and returns it as output.
pub fn register_counting(registry: &mut HandlerRegistry, counter: &CallCounter) {
    let counter = counter.clone();
    registry.register_fn("count", move |inputs: Payload, _cancel| {
        let counter = counter.clone();
        async move {
            let name = inputs
                .get("name")
                .and_then(|v| v.as_str())
                .unwrap_or("unnamed")
                .to_string();
            counter.record(&name);
            let mut out = Payload::new();
            out.insert("name".to_string(), json!(name));
            Ok(HandlerOutput::ok(out))
        }
    });
}

/// Registers `block` under `operation`: waits until cancelled.
pub fn register_blocking(registry: &mut HandlerRegistry, operation: &str) {
    registry.register_fn(operation, |_inputs, cancel| async move {
        cancel.cancelled().await;
        Ok(HandlerOutput::failed("cancelled", "blocked until cancelled"))
    });
}

pub fn counted(id: &str) -> TaskSpec {
    TaskSpec::new(id, "count").with_input("name", json!(id))
}

/// Wait until an event matching `pred` arrives, up to `limit`.
pub async fn wait_for_event<F>(
    events: &mut broadcast::Receiver<RunEvent>,
    limit: Duration,
    pred: F,
) -> Option<RunEvent>
where
    F: Fn(&RunEvent) -> bool,
{
    tokio::time::timeout(limit, async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return Some(event),
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .await
    .ok()
    .flatten()
}

/// Drain every event already queued on `events`.
pub fn drain(events: &mut broadcast::Receiver<RunEvent>) -> Vec<RunEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

/// A random DAG over `n` tasks: edges only run from lower to higher index.
pub fn random_dag(seed: u64, n: usize, edge_probability: f64, operation: &str) -> Vec<TaskSpec> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n)
        .map(|i| {
            let deps: Vec<String> = (0..i)
                .filter(|_| rng.gen_bool(edge_probability))
                .map(task_name)
                .collect();
            TaskSpec::new(task_name(i), operation)
                .depends_on(deps.clone())
                .with_input("name", json!(task_name(i)))
                .with_input("deps", json!(deps))
                .with_priority(rng.gen_range(0..3))
                .with_estimate_ms(rng.gen_range(1..50))
        })
        .collect()
}

pub fn task_name(i: usize) -> String {
    format!("t{:02}", i)
}
