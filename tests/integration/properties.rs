//! Invariants checked over generated graphs.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use wavefront::core::{FailurePolicy, Payload, TaskGraph, TaskId, TaskSpec};
use wavefront::error::ValidationError;
use wavefront::orchestration::{HandlerOutput, HandlerRegistry, RunEvent, Scheduler};
use wavefront::Error;

use crate::fixtures::*;

/// Test: Wave invariant
/// Given generated acyclic graphs
/// When they are scheduled
/// Then every task appears in exactly one wave and every dependency sits
/// in a strictly earlier wave than its dependent
#[test]
fn test_waves_respect_dependencies_on_generated_graphs() {
    for seed in 0..25 {
        let specs = random_dag(seed, 20, 0.2, "noop");
        let graph = TaskGraph::from_specs(specs.clone()).unwrap();
        let plan = Scheduler::new(wavefront::core::Resources::new(4.0, 4.0))
            .schedule(&graph)
            .unwrap();

        let wave_of = plan.wave_index();
        assert_eq!(wave_of.len(), specs.len(), "seed {seed}: task missing from plan");
        assert_eq!(plan.task_count(), specs.len(), "seed {seed}: task planned twice");
        for spec in &specs {
            for dep in &spec.depends_on {
                assert!(
                    wave_of[dep] < wave_of[&spec.id],
                    "seed {seed}: {} must run after {}",
                    spec.id,
                    dep
                );
            }
        }
    }
}

/// Test: Scheduling is deterministic
#[test]
fn test_schedule_is_deterministic() {
    let specs = random_dag(7, 30, 0.15, "noop");
    let scheduler = Scheduler::new(wavefront::core::Resources::new(3.0, 3.0));
    let first = scheduler.schedule(&TaskGraph::from_specs(specs.clone()).unwrap()).unwrap();
    let second = scheduler.schedule(&TaskGraph::from_specs(specs).unwrap()).unwrap();
    assert_eq!(first, second);
}

/// Test: Generated cycles are rejected
/// Given a generated DAG with one back edge added
/// When it is submitted
/// Then CycleDetected reports a closed path and no graph id exists
#[tokio::test]
async fn test_generated_cycles_rejected() {
    let orch = memory_orchestrator(test_config(), HandlerRegistry::with_builtins());
    for seed in 0..10 {
        let mut specs = random_dag(seed, 8, 0.3, "noop");
        specs[0] = specs[0].clone().depends_on([task_name(7)]);
        specs[7] = specs[7].clone().depends_on([task_name(0)]);

        match orch.submit_graph(specs).await {
            Err(Error::Validation(ValidationError::CycleDetected { path })) => {
                assert!(path.len() >= 3, "seed {seed}: {path:?}");
                assert_eq!(path.first(), path.last());
            }
            other => panic!("seed {seed}: expected cycle, got {other:?}"),
        }
    }
    assert!(orch.graph_ids().await.is_empty());
}

/// Test: Dependencies finish before dependents start
/// Given generated DAGs run with several workers
/// When each handler checks that its dependencies already completed
/// Then no handler ever observes an unfinished dependency
#[tokio::test]
async fn test_execution_respects_dependencies() {
    for seed in 0..5 {
        let completed = Arc::new(Mutex::new(HashSet::<String>::new()));
        let violations = Arc::new(AtomicUsize::new(0));
        let mut registry = HandlerRegistry::new();
        let done = Arc::clone(&completed);
        let bad = Arc::clone(&violations);
        registry.register_fn("ordered", move |inputs: Payload, _cancel| {
            let done = Arc::clone(&done);
            let bad = Arc::clone(&bad);
            async move {
                let name = inputs["name"].as_str().unwrap_or_default().to_string();
                let deps: Vec<String> = inputs["deps"]
                    .as_array()
                    .map(|a| a.iter().filter_map(|v| v.as_str().map(String::from)).collect())
                    .unwrap_or_default();
                {
                    let done = done.lock().unwrap();
                    if deps.iter().any(|d| !done.contains(d)) {
                        bad.fetch_add(1, Ordering::SeqCst);
                    }
                }
                tokio::time::sleep(Duration::from_millis(2)).await;
                done.lock().unwrap().insert(name);
                Ok(HandlerOutput::ok(Payload::new()))
            }
        });

        let mut config = test_config();
        config.workers = 3;
        let orch = memory_orchestrator(config, registry);
        let id = orch
            .submit_graph(random_dag(seed, 15, 0.25, "ordered"))
            .await
            .unwrap();
        orch.start(id).await.unwrap();
        let report = orch.wait(id).await.unwrap();

        assert!(report.success, "seed {seed}: {:?}", report.failed_tasks);
        assert_eq!(violations.load(Ordering::SeqCst), 0, "seed {seed}");
        assert_eq!(completed.lock().unwrap().len(), 15);
    }
}

/// Test: Worker bound
/// Given eight independent tasks and two workers
/// When the graph runs
/// Then at most two handlers are ever in flight
#[tokio::test]
async fn test_in_flight_bounded_by_workers() {
    let current = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let mut registry = HandlerRegistry::new();
    let (cur, max) = (Arc::clone(&current), Arc::clone(&peak));
    registry.register_fn("busy", move |_inputs, _cancel| {
        let (cur, max) = (Arc::clone(&cur), Arc::clone(&max));
        async move {
            let now = cur.fetch_add(1, Ordering::SeqCst) + 1;
            max.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            cur.fetch_sub(1, Ordering::SeqCst);
            Ok(HandlerOutput::ok(Payload::new()))
        }
    });

    let mut config = test_config();
    config.workers = 2;
    let orch = memory_orchestrator(config, registry);
    let specs = (0..8).map(|i| TaskSpec::new(task_name(i), "busy")).collect();
    let id = orch.submit_graph(specs).await.unwrap();
    orch.start(id).await.unwrap();
    assert!(orch.wait(id).await.unwrap().success);

    let peak = peak.load(Ordering::SeqCst);
    assert!(peak <= 2, "peak in flight was {peak}");
    assert!(peak >= 1);
}

/// Test: Progress never decreases
/// Given a generated DAG with estimates
/// When status is sampled while it runs
/// Then overall_progress is non-decreasing and ends at 1.0
#[tokio::test]
async fn test_progress_is_monotonic() {
    let mut registry = HandlerRegistry::with_builtins();
    registry.register_fn("tick", |_inputs, _cancel| async {
        tokio::time::sleep(Duration::from_millis(3)).await;
        Ok(HandlerOutput::ok(Payload::new()))
    });
    let orch = memory_orchestrator(test_config(), registry);
    let id = orch
        .submit_graph(random_dag(3, 20, 0.2, "tick"))
        .await
        .unwrap();
    orch.start(id).await.unwrap();

    let mut samples = Vec::new();
    loop {
        let snap = orch.status(id).await.unwrap();
        samples.push(snap.overall_progress);
        if snap.run_state.is_terminal() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    assert!(samples.windows(2).all(|w| w[0] <= w[1]), "{samples:?}");
    assert_eq!(samples.last().copied(), Some(1.0));
}

/// Test: Skipped tasks never run
/// Given a failing task with `fail`-policy dependents
/// When the graph runs
/// Then no dependent ever emits TaskStarted and all are Skipped
#[tokio::test]
async fn test_fail_policy_dependents_never_start() {
    let orch = memory_orchestrator(test_config(), HandlerRegistry::with_builtins());
    let mut events = orch.subscribe();
    let id = orch
        .submit_graph(vec![
            TaskSpec::new("root", "fail"),
            TaskSpec::new("a", "noop").depends_on(["root"]),
            TaskSpec::new("b", "noop").depends_on(["a"]),
            TaskSpec::new("c", "noop")
                .depends_on(["root", "b"])
                .with_on_failure(FailurePolicy::Fail),
        ])
        .await
        .unwrap();
    orch.start(id).await.unwrap();
    let report = orch.wait(id).await.unwrap();

    let dependents: HashSet<TaskId> = ["a", "b", "c"].into_iter().map(TaskId::from).collect();
    let started: Vec<TaskId> = drain(&mut events)
        .into_iter()
        .filter_map(|e| match e {
            RunEvent::TaskStarted { task, .. } => Some(task),
            _ => None,
        })
        .collect();
    assert_eq!(started, vec![TaskId::from("root")]);
    let skipped: HashSet<TaskId> = report.skipped_tasks.into_iter().collect();
    assert_eq!(skipped, dependents);
}

/// Test: Priorities order dispatch within a wave
#[tokio::test]
async fn test_priority_orders_dispatch() {
    let order = Arc::new(Mutex::new(Vec::<String>::new()));
    let mut registry = HandlerRegistry::new();
    let seen = Arc::clone(&order);
    registry.register_fn("log", move |inputs: Payload, _cancel| {
        let seen = Arc::clone(&seen);
        async move {
            let name = inputs["name"].as_str().unwrap_or_default().to_string();
            seen.lock().unwrap().push(name);
            Ok(HandlerOutput::ok(Payload::new()))
        }
    });

    let mut config = test_config();
    config.workers = 1;
    let orch = memory_orchestrator(config, registry);
    let specs = [("low", 0), ("high", 10), ("mid", 5)]
        .into_iter()
        .map(|(name, priority)| {
            TaskSpec::new(name, "log")
                .with_input("name", serde_json::json!(name))
                .with_priority(priority)
        })
        .collect();
    let id = orch.submit_graph(specs).await.unwrap();
    orch.start(id).await.unwrap();
    assert!(orch.wait(id).await.unwrap().success);

    let order: HashMap<String, usize> = order
        .lock()
        .unwrap()
        .iter()
        .enumerate()
        .map(|(i, n)| (n.clone(), i))
        .collect();
    assert!(order["high"] < order["mid"]);
    assert!(order["mid"] < order["low"]);
}
