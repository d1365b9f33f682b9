//! Checkpoint, resume and run-control integration tests.
//!
//! These tests verify that a graph interrupted after a wave can be resumed
//! by a fresh orchestrator without re-running succeeded tasks, and that
//! pause, cancel and the global deadline settle runs correctly.

use std::time::Duration;

use serde_json::json;
use tempfile::TempDir;

use wavefront::core::{GraphId, RunState, TaskId, TaskSpec, TaskStatus};
use wavefront::orchestration::{HandlerRegistry, RunEvent};
use wavefront::state::FileCheckpointStore;
use wavefront::Error;

use crate::fixtures::*;

const LIMIT: Duration = Duration::from_secs(5);

/// Registry where `count` records calls and `work` blocks until cancelled.
fn interrupting_registry(counter: &CallCounter) -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    register_counting(&mut registry, counter);
    register_blocking(&mut registry, "work");
    registry
}

/// Registry where both `count` and `work` complete immediately.
fn finishing_registry(counter: &CallCounter) -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    register_counting(&mut registry, counter);
    let work_counter = counter.clone();
    registry.register_fn("work", move |_inputs, _cancel| {
        let counter = work_counter.clone();
        async move {
            counter.record("work");
            Ok(wavefront::orchestration::HandlerOutput::ok(Default::default()))
        }
    });
    registry
}

fn two_wave_graph() -> Vec<TaskSpec> {
    vec![
        counted("A"),
        counted("A2"),
        TaskSpec::new("B", "work").depends_on(["A", "A2"]),
    ]
}

/// Run `two_wave_graph` until wave 0 is checkpointed and B is running,
/// then cancel it.
async fn interrupted_run(dir: &TempDir, counter: &CallCounter) -> GraphId {
    let orch = file_orchestrator(dir.path(), interrupting_registry(counter));
    let mut events = orch.subscribe();
    let id = orch.submit_graph(two_wave_graph()).await.unwrap();
    orch.start(id).await.unwrap();

    let written = wait_for_event(&mut events, LIMIT, |e| {
        matches!(e, RunEvent::CheckpointWritten { wave: Some(0), .. })
    })
    .await;
    assert!(written.is_some(), "wave 0 checkpoint never written");
    let started = wait_for_event(&mut events, LIMIT, |e| {
        matches!(e, RunEvent::TaskStarted { task, .. } if task.as_str() == "B")
    })
    .await;
    assert!(started.is_some(), "B never started");

    orch.cancel(id).await.unwrap();
    let report = tokio::time::timeout(LIMIT, orch.wait(id)).await.unwrap().unwrap();
    assert_eq!(report.state, RunState::Cancelled);
    assert_eq!(report.cancelled_tasks, vec![TaskId::from("B")]);
    id
}

/// Test: Restart and resume
/// Given a graph whose wave 0 completed and was checkpointed before the
/// run was cancelled
/// When a new orchestrator over the same checkpoint directory resumes it
/// Then wave 0 tasks are reported Succeeded without being invoked again
#[tokio::test]
async fn test_resume_after_restart_skips_completed_wave() {
    let dir = TempDir::new().unwrap();
    let first = CallCounter::new();
    let id = interrupted_run(&dir, &first).await;
    assert_eq!(first.get("A"), 1);
    assert_eq!(first.get("A2"), 1);

    let second = CallCounter::new();
    let orch = file_orchestrator(dir.path(), finishing_registry(&second));
    orch.resume(id).await.unwrap();

    let snap = orch.status(id).await.unwrap();
    assert_eq!(snap.per_task_status[&TaskId::from("A")], TaskStatus::Succeeded);
    assert_eq!(snap.per_task_status[&TaskId::from("A2")], TaskStatus::Succeeded);

    let report = tokio::time::timeout(LIMIT, orch.wait(id)).await.unwrap().unwrap();
    assert!(report.success);
    assert_eq!(report.succeeded.len(), 3);
    assert_eq!(second.get("A"), 0);
    assert_eq!(second.get("A2"), 0);
    assert_eq!(second.get("work"), 1);
}

/// Test: Corrupt checkpoint falls back to the previous one
#[tokio::test]
async fn test_corrupt_checkpoint_uses_previous() {
    let dir = TempDir::new().unwrap();
    let id = interrupted_run(&dir, &CallCounter::new()).await;

    let store = FileCheckpointStore::new(dir.path());
    std::fs::write(store.checkpoint_path(id), "{ not json").unwrap();
    assert!(store.previous_path(id).exists());

    let counter = CallCounter::new();
    let orch = file_orchestrator(dir.path(), finishing_registry(&counter));
    orch.resume(id).await.unwrap();
    let report = tokio::time::timeout(LIMIT, orch.wait(id)).await.unwrap().unwrap();

    assert!(report.success);
    assert_eq!(counter.get("A"), 0);
    assert_eq!(counter.get("work"), 1);
}

/// Test: Without any usable checkpoint the graph starts over
#[tokio::test]
async fn test_unusable_checkpoints_restart_from_scratch() {
    let dir = TempDir::new().unwrap();
    let id = interrupted_run(&dir, &CallCounter::new()).await;

    let store = FileCheckpointStore::new(dir.path());
    std::fs::write(store.checkpoint_path(id), "garbage").unwrap();
    std::fs::write(store.previous_path(id), "more garbage").unwrap();

    let counter = CallCounter::new();
    let orch = file_orchestrator(dir.path(), finishing_registry(&counter));
    orch.resume(id).await.unwrap();
    let report = tokio::time::timeout(LIMIT, orch.wait(id)).await.unwrap().unwrap();

    assert!(report.success);
    assert_eq!(counter.get("A"), 1);
    assert_eq!(counter.get("A2"), 1);
}

/// Test: Resume is idempotent
/// Given a graph that already ran to completion
/// When it is resumed twice
/// Then no handler runs again and both resumed runs succeed
#[tokio::test]
async fn test_resume_is_idempotent() {
    let counter = CallCounter::new();
    let orch = memory_orchestrator(test_config(), finishing_registry(&counter));
    let id = orch.submit_graph(two_wave_graph()).await.unwrap();
    orch.start(id).await.unwrap();
    assert!(orch.wait(id).await.unwrap().success);
    assert_eq!(counter.total(), 3);

    for _ in 0..2 {
        orch.resume(id).await.unwrap();
        let report = orch.wait(id).await.unwrap();
        assert!(report.success);
        assert_eq!(report.succeeded.len(), 3);
    }
    assert_eq!(counter.total(), 3);
}

/// Test: Resume of an unknown graph
#[tokio::test]
async fn test_resume_unknown_graph() {
    let dir = TempDir::new().unwrap();
    let orch = file_orchestrator(dir.path(), HandlerRegistry::with_builtins());
    let err = orch.resume(GraphId::new()).await.unwrap_err();
    assert!(matches!(err, Error::GraphNotFound(_)));
}

/// Test: Pause holds dispatch until resumed
/// Given a two-task chain whose first task sleeps
/// When the run is paused right after starting
/// Then the second task is not started until the run is resumed
#[tokio::test]
async fn test_pause_then_resume() {
    let orch = memory_orchestrator(test_config(), HandlerRegistry::with_builtins());
    let id = orch
        .submit_graph(vec![
            TaskSpec::new("A", "sleep").with_input("ms", json!(50)),
            TaskSpec::new("B", "noop").depends_on(["A"]),
        ])
        .await
        .unwrap();
    orch.start(id).await.unwrap();
    orch.pause(id).await.unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    let snap = orch.status(id).await.unwrap();
    assert_eq!(snap.run_state, RunState::Paused);
    assert!(snap.per_task_status[&TaskId::from("B")].is_not_started());

    orch.resume(id).await.unwrap();
    let report = tokio::time::timeout(LIMIT, orch.wait(id)).await.unwrap().unwrap();
    assert!(report.success);
}

/// Test: Global deadline aborts the run
#[tokio::test]
async fn test_global_deadline_aborts_run() {
    let mut config = test_config();
    config.global_deadline_ms = Some(100);
    let orch = memory_orchestrator(config, HandlerRegistry::with_builtins());
    let id = orch
        .submit_graph(vec![
            TaskSpec::new("A", "sleep").with_input("ms", json!(10_000)),
            TaskSpec::new("B", "noop").depends_on(["A"]),
        ])
        .await
        .unwrap();
    orch.start(id).await.unwrap();
    let report = tokio::time::timeout(LIMIT, orch.wait(id)).await.unwrap().unwrap();

    assert_eq!(report.state, RunState::Aborted);
    assert!(!report.success);
    assert_eq!(report.cancelled_tasks, vec![TaskId::from("A")]);
    assert_eq!(report.not_started, vec![TaskId::from("B")]);
}

/// Test: Cancel waits out running handlers
#[tokio::test]
async fn test_cancel_reaches_running_handler() {
    let counter = CallCounter::new();
    let orch = memory_orchestrator(test_config(), interrupting_registry(&counter));
    let mut events = orch.subscribe();
    let id = orch
        .submit_graph(vec![TaskSpec::new("B", "work")])
        .await
        .unwrap();
    orch.start(id).await.unwrap();
    wait_for_event(&mut events, LIMIT, |e| matches!(e, RunEvent::TaskStarted { .. }))
        .await
        .unwrap();

    orch.cancel(id).await.unwrap();
    let report = tokio::time::timeout(LIMIT, orch.wait(id)).await.unwrap().unwrap();
    assert_eq!(report.state, RunState::Cancelled);
    assert!(matches!(orch.cancel(id).await, Err(Error::InvalidRunState { .. })));
}
