//! End-to-end scenarios through the public orchestrator API.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::Barrier;

use wavefront::core::{FailurePolicy, Payload, Predicate, RunState, SkipCause, TaskId, TaskSpec, TaskStatus};
use wavefront::error::{ExecutionError, ValidationError};
use wavefront::orchestration::{HandlerOutput, HandlerRegistry, RunEvent};
use wavefront::Error;

use crate::fixtures::*;

/// Test: Fan-out tasks run concurrently
/// Given A, then B and C depending on A, then D depending on both
/// When the graph runs with two or more workers
/// Then B and C are in flight at the same time and D runs last
#[tokio::test]
async fn test_fan_out_runs_concurrently() {
    let counter = CallCounter::new();
    let barrier = Arc::new(Barrier::new(2));
    let mut registry = HandlerRegistry::new();
    register_counting(&mut registry, &counter);
    let meet = Arc::clone(&barrier);
    registry.register_fn("meet", move |_inputs, _cancel| {
        let barrier = Arc::clone(&meet);
        async move {
            match tokio::time::timeout(Duration::from_secs(2), barrier.wait()).await {
                Ok(_) => Ok(HandlerOutput::ok(Payload::new())),
                Err(_) => Ok(HandlerOutput::failed("not_concurrent", "peer never arrived")),
            }
        }
    });

    let orch = memory_orchestrator(test_config(), registry);
    let id = orch
        .submit_graph(vec![
            counted("A"),
            TaskSpec::new("B", "meet").depends_on(["A"]),
            TaskSpec::new("C", "meet").depends_on(["A"]),
            counted("D").depends_on(["B", "C"]),
        ])
        .await
        .unwrap();

    let snap = orch.status(id).await.unwrap();
    assert_eq!(snap.wave_count, 3);

    orch.start(id).await.unwrap();
    let report = orch.wait(id).await.unwrap();
    assert!(report.success, "fan-out run failed: {:?}", report.failed_tasks);
    assert_eq!(report.succeeded.len(), 4);
    assert_eq!(counter.get("A"), 1);
    assert_eq!(counter.get("D"), 1);
}

/// Test: Cycle rejection
/// Given A depending on B and B depending on A
/// When the graph is submitted
/// Then CycleDetected names the cycle and no graph is registered
#[tokio::test]
async fn test_cycle_is_rejected_without_graph_id() {
    let orch = memory_orchestrator(test_config(), HandlerRegistry::with_builtins());
    let err = orch
        .submit_graph(vec![
            TaskSpec::new("A", "noop").depends_on(["B"]),
            TaskSpec::new("B", "noop").depends_on(["A"]),
        ])
        .await
        .unwrap_err();

    match err {
        Error::Validation(ValidationError::CycleDetected { path }) => {
            assert_eq!(path.first(), path.last());
            assert!(path.contains(&TaskId::from("A")));
            assert!(path.contains(&TaskId::from("B")));
        }
        other => panic!("expected cycle, got {other:?}"),
    }
    assert!(orch.graph_ids().await.is_empty());
}

/// Test: Timeout then retry
/// Given a task with a 100ms deadline whose first attempt takes 500ms
/// When the task runs with two attempts allowed
/// Then the first attempt times out and the second succeeds
#[tokio::test]
async fn test_timeout_then_retry_succeeds() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut registry = HandlerRegistry::new();
    let seen = Arc::clone(&calls);
    registry.register_fn("slow_once", move |_inputs, cancel| {
        let attempt = seen.fetch_add(1, Ordering::SeqCst);
        async move {
            if attempt == 0 {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(500)) => {}
                    _ = cancel.cancelled() => {
                        return Ok(HandlerOutput::failed("cancelled", "timed out"));
                    }
                }
            }
            Ok(HandlerOutput::ok(Payload::new()))
        }
    });

    let orch = memory_orchestrator(test_config(), registry);
    let mut events = orch.subscribe();
    let id = orch
        .submit_graph(vec![TaskSpec::new("A", "slow_once")
            .with_timeout_ms(100)
            .with_retry(2, 10)])
        .await
        .unwrap();
    orch.start(id).await.unwrap();
    let report = orch.wait(id).await.unwrap();

    assert!(report.success);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    let events = drain(&mut events);
    assert!(events.iter().any(|e| matches!(
        e,
        RunEvent::TaskRetrying { attempt: 1, delay_ms: 10, .. }
    )));
    assert!(events
        .iter()
        .any(|e| matches!(e, RunEvent::TaskStarted { attempt: 2, .. })));
}

/// Test: Timeout without retry
/// Given a task with a 50ms deadline and a single attempt
/// When its handler sleeps for seconds
/// Then the task fails with TaskTimeout
#[tokio::test]
async fn test_timeout_without_retry_fails() {
    let orch = memory_orchestrator(test_config(), HandlerRegistry::with_builtins());
    let id = orch
        .submit_graph(vec![TaskSpec::new("A", "sleep")
            .with_input("ms", json!(5_000))
            .with_timeout_ms(50)])
        .await
        .unwrap();
    orch.start(id).await.unwrap();
    let report = tokio::time::timeout(Duration::from_secs(3), orch.wait(id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(report.state, RunState::Failed);
    assert_eq!(
        report.failed_tasks[&TaskId::from("A")],
        ExecutionError::TaskTimeout { timeout_ms: 50 }
    );
}

/// Test: Retries exhausted
/// Given a task that always fails with three attempts allowed
/// When the graph runs
/// Then the task records RetryExhausted wrapping the last failure
#[tokio::test]
async fn test_retry_exhausted() {
    let orch = memory_orchestrator(test_config(), HandlerRegistry::with_builtins());
    let id = orch
        .submit_graph(vec![TaskSpec::new("A", "fail")
            .with_input("kind", json!("flaky"))
            .with_retry(3, 1)])
        .await
        .unwrap();
    orch.start(id).await.unwrap();
    let report = orch.wait(id).await.unwrap();
    match &report.failed_tasks[&TaskId::from("A")] {
        ExecutionError::RetryExhausted { attempts, last } => {
            assert_eq!(*attempts, 3);
            assert!(matches!(
                last.as_ref(),
                ExecutionError::TaskRuntimeFailure { error_kind, .. } if error_kind == "flaky"
            ));
        }
        other => panic!("expected RetryExhausted, got {other:?}"),
    }
}

/// Test: Failure policies
/// Given a failing root with one dependent per policy
/// When the graph runs
/// Then `fail` dependents are skipped with their downstream and
/// `continue` dependents still run
#[tokio::test]
async fn test_failure_policies() {
    let counter = CallCounter::new();
    let mut registry = HandlerRegistry::with_builtins();
    register_counting(&mut registry, &counter);
    let orch = memory_orchestrator(test_config(), registry);
    let id = orch
        .submit_graph(vec![
            TaskSpec::new("root", "fail"),
            counted("strict").depends_on(["root"]),
            counted("strict_child").depends_on(["strict"]),
            counted("tolerant")
                .depends_on(["root"])
                .with_on_failure(FailurePolicy::Continue),
            counted("independent"),
        ])
        .await
        .unwrap();
    orch.start(id).await.unwrap();
    let report = orch.wait(id).await.unwrap();

    assert!(!report.success);
    assert_eq!(report.state, RunState::Failed);
    assert_eq!(
        report.skipped_tasks,
        vec![TaskId::from("strict"), TaskId::from("strict_child")]
    );
    assert_eq!(counter.get("strict"), 0);
    assert_eq!(counter.get("tolerant"), 1);
    assert_eq!(counter.get("independent"), 1);

    let snap = orch.status(id).await.unwrap();
    assert_eq!(
        snap.per_task_status[&TaskId::from("strict_child")],
        TaskStatus::Skipped {
            reason: SkipCause::Upstream {
                from: TaskId::from("strict")
            }
        }
    );
}

/// Test: skip_dependents takes the whole subtree down
#[tokio::test]
async fn test_skip_dependents_subtree() {
    let counter = CallCounter::new();
    let mut registry = HandlerRegistry::with_builtins();
    register_counting(&mut registry, &counter);
    let orch = memory_orchestrator(test_config(), registry);
    let id = orch
        .submit_graph(vec![
            TaskSpec::new("root", "fail").with_on_failure(FailurePolicy::SkipDependents),
            counted("child")
                .depends_on(["root"])
                .with_on_failure(FailurePolicy::Continue),
            counted("grandchild").depends_on(["child"]),
        ])
        .await
        .unwrap();
    orch.start(id).await.unwrap();
    let report = orch.wait(id).await.unwrap();
    assert_eq!(report.skipped_tasks.len(), 2);
    assert_eq!(counter.total(), 0);
}

/// Test: Conditional edges
/// Given B guarded by "A.outputs.go is truthy" and C unguarded
/// When A produces go = false
/// Then B and its dependent are skipped by predicate and the run still succeeds
#[tokio::test]
async fn test_false_predicate_skips_branch() {
    let counter = CallCounter::new();
    let mut registry = HandlerRegistry::with_builtins();
    register_counting(&mut registry, &counter);
    let orch = memory_orchestrator(test_config(), registry);
    let id = orch
        .submit_graph(vec![
            TaskSpec::new("A", "echo").with_input("go", json!(false)),
            counted("B").when("A", Predicate::truthy("go")),
            counted("B2").depends_on(["B"]),
            counted("C").depends_on(["A"]),
        ])
        .await
        .unwrap();
    orch.start(id).await.unwrap();
    let report = orch.wait(id).await.unwrap();

    assert!(report.success);
    assert_eq!(report.state, RunState::AllSucceeded);
    assert_eq!(counter.get("B"), 0);
    assert_eq!(counter.get("B2"), 0);
    assert_eq!(counter.get("C"), 1);

    let snap = orch.status(id).await.unwrap();
    assert_eq!(
        snap.per_task_status[&TaskId::from("B")],
        TaskStatus::Skipped {
            reason: SkipCause::Predicate {
                from: TaskId::from("A")
            }
        }
    );
}

/// Test: Unknown operations are rejected at start
#[tokio::test]
async fn test_unknown_operation_rejected_at_start() {
    let orch = memory_orchestrator(test_config(), HandlerRegistry::with_builtins());
    let id = orch
        .submit_graph(vec![TaskSpec::new("A", "no_such_operation")])
        .await
        .unwrap();
    let err = orch.start(id).await.unwrap_err();
    assert!(matches!(err, Error::HandlerNotFound { task, .. } if task == TaskId::from("A")));
}

/// Test: Infeasible resource demand
#[tokio::test]
async fn test_infeasible_task_rejected() {
    let mut config = test_config();
    config.capacity = wavefront::core::Resources::new(2.0, 2.0);
    let orch = memory_orchestrator(config, HandlerRegistry::with_builtins());
    let err = orch
        .submit_graph(vec![TaskSpec::new("big", "noop").with_resources(4.0, 1.0)])
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Validation(ValidationError::Infeasible { .. })
    ));
}

/// Test: Shell tasks pass outputs downstream
#[tokio::test]
async fn test_shell_task_outputs() {
    let orch = memory_orchestrator(test_config(), HandlerRegistry::with_builtins());
    let id = orch
        .submit_graph(vec![
            TaskSpec::new("say", "shell").with_input("command", json!("echo hello")),
            TaskSpec::new("after", "noop").when("say", Predicate::equals("exit_code", json!(0))),
        ])
        .await
        .unwrap();
    orch.start(id).await.unwrap();
    let report = orch.wait(id).await.unwrap();
    assert!(report.success, "{:?}", report.failed_tasks);
    assert_eq!(report.succeeded.len(), 2);
}

/// Test: Runtime drift replans the remaining waves
/// Given a chain whose first task takes far longer than estimated
/// When the first wave completes
/// Then a Replanned event is emitted, the plan revision rises, the
/// finished task is neither reset nor re-run, and the run succeeds
#[tokio::test]
async fn test_drift_replans_remaining_waves() {
    let orch = memory_orchestrator(test_config(), HandlerRegistry::with_builtins());
    let mut events = orch.subscribe();
    let id = orch
        .submit_graph(vec![
            TaskSpec::new("a", "sleep")
                .with_input("ms", json!(200))
                .with_estimate_ms(10),
            TaskSpec::new("b", "sleep")
                .depends_on(["a"])
                .with_input("ms", json!(1))
                .with_estimate_ms(10),
            TaskSpec::new("c", "sleep")
                .depends_on(["b"])
                .with_input("ms", json!(1))
                .with_estimate_ms(10),
        ])
        .await
        .unwrap();
    assert_eq!(orch.status(id).await.unwrap().plan_revision, 0);

    orch.start(id).await.unwrap();
    let report = tokio::time::timeout(Duration::from_secs(5), orch.wait(id))
        .await
        .unwrap()
        .unwrap();
    assert!(report.success);
    assert_eq!(report.state, RunState::AllSucceeded);

    let events = drain(&mut events);
    let replanned = events
        .iter()
        .position(|e| matches!(e, RunEvent::Replanned { revision: 1, .. }))
        .expect("no replan after the slow wave");
    if let RunEvent::Replanned {
        baseline_ms,
        adjusted_ms,
        ..
    } = &events[replanned]
    {
        assert_eq!(*baseline_ms, 20);
        assert!(*adjusted_ms > *baseline_ms);
    }

    let started = |name: &str| {
        events
            .iter()
            .enumerate()
            .filter(|(_, e)| matches!(e, RunEvent::TaskStarted { task, .. } if task.as_str() == name))
            .map(|(i, _)| i)
            .collect::<Vec<_>>()
    };
    let a_started = started("a");
    assert_eq!(a_started.len(), 1);
    assert!(a_started[0] < replanned);
    assert!(started("b").iter().all(|&i| i > replanned));

    let snap = orch.status(id).await.unwrap();
    assert!(snap.plan_revision >= 1);
    assert_eq!(snap.per_task_status[&TaskId::from("a")], TaskStatus::Succeeded);
    assert_eq!(snap.wave_count, 3);
}
