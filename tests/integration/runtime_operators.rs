// tests/integration/runtime_operators.rs

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use serde_json::json;

use dagflow::dag::{FailureKind, Graph, RunStatus, RetryPolicy, SensorSpec, TaskNode, TaskState};
use dagflow::engine::{RunTrigger, RuntimeOptions};
use dagflow::exec::{BranchChoice, TaskContext, TaskError, TaskOutput, TaskRegistry};
use dagflow::persist::{MemoryRunStore, RunStore};
use dagflow::types::SensorMode;
use dagflow_test_utils::harness::Pipeline;
use dagflow_test_utils::{init_tracing, summary_for, with_timeout};

#[tokio::test]
async fn running_tasks_never_exceed_parallel_cap() {
    init_tracing();
    let names: Vec<String> = (0..6).map(|i| format!("t{i}")).collect();
    let graph = Graph::new("wide", names.iter().map(|n| TaskNode::new(n.as_str())).collect()).unwrap();

    let current = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let mut registry = TaskRegistry::new();
    for name in &names {
        let current = Arc::clone(&current);
        let peak = Arc::clone(&peak);
        registry = registry.task(name.as_str(), move |_ctx: TaskContext| {
            let current = Arc::clone(&current);
            let peak = Arc::clone(&peak);
            async move {
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                current.fetch_sub(1, Ordering::SeqCst);
                Ok::<_, TaskError>(TaskOutput::default())
            }
        });
    }

    let options = RuntimeOptions {
        max_parallel_tasks: 2,
        ..RuntimeOptions::default()
    };
    let summaries = with_timeout(
        Pipeline::new(graph)
            .options(options)
            .run(registry, vec![RunTrigger::manual("d1")]),
    )
    .await;

    assert!(summaries[0].is_success());
    assert_eq!(peak.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn values_flow_through_the_exchange() {
    init_tracing();
    let graph = Graph::new(
        "etl",
        vec![
            TaskNode::new("extract"),
            TaskNode::new("transform").after("extract"),
            TaskNode::new("report").after("transform"),
        ],
    )
    .unwrap();

    let registry = TaskRegistry::new()
        .task("extract", |ctx: TaskContext| async move {
            let limit = ctx.param("limit").and_then(|v| v.as_u64()).unwrap_or(0);
            Ok::<_, TaskError>(TaskOutput::new(json!((1..=limit).collect::<Vec<_>>())))
        })
        .task("transform", |ctx: TaskContext| async move {
            let rows = ctx.upstream_value("extract")?;
            let doubled: Vec<u64> = rows
                .as_array()
                .ok_or_else(|| TaskError::fatal("extract did not return a list"))?
                .iter()
                .filter_map(|v| v.as_u64())
                .map(|v| v * 2)
                .collect();
            let count = doubled.len();
            Ok::<_, TaskError>(TaskOutput::new(json!(doubled)).with_entry("count", count))
        })
        .task("report", |ctx: TaskContext| async move {
            let count = ctx.exchange.pull("transform", "count")?;
            Ok::<_, TaskError>(TaskOutput::new(json!(format!("{count} rows"))))
        });

    let store = MemoryRunStore::new();
    let summaries = with_timeout(
        Pipeline::new(graph)
            .store(store.clone())
            .run(registry, vec![RunTrigger::manual("d1").with_param("limit", 3)]),
    )
    .await;
    assert!(summaries[0].is_success());

    let record = store.load("d1").unwrap().unwrap();
    let value_of = |task: &str, key: &str| {
        record
            .exchange
            .iter()
            .find(|e| e.task == task && e.key == key)
            .map(|e| (*e.value).clone())
    };
    assert_eq!(value_of("transform", "return_value"), Some(json!([2, 4, 6])));
    assert_eq!(value_of("report", "return_value"), Some(json!("3 rows")));
}

#[tokio::test(start_paused = true)]
async fn attempt_timeout_is_retried_then_fails() {
    init_tracing();
    let graph = Graph::new(
        "etl",
        vec![TaskNode::new("hang").with_retry(
            RetryPolicy::new(2, Duration::ZERO).with_timeout(Duration::from_millis(50)),
        )],
    )
    .unwrap();

    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);
    let registry = TaskRegistry::new().task("hang", move |_ctx: TaskContext| {
        counter.fetch_add(1, Ordering::SeqCst);
        async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok::<_, TaskError>(TaskOutput::default())
        }
    });

    let summaries = Pipeline::new(graph)
        .run(registry, vec![RunTrigger::manual("d1")])
        .await;

    let failure = &summaries[0].failures[0];
    assert_eq!(failure.attempts, 2);
    assert_eq!(failure.cause.as_ref().unwrap().kind, FailureKind::Timeout);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn timeout_without_retry_on_timeout_fails_immediately() {
    init_tracing();
    let graph = Graph::new(
        "etl",
        vec![TaskNode::new("hang").with_retry(
            RetryPolicy::new(3, Duration::ZERO)
                .with_timeout(Duration::from_millis(50))
                .with_retry_on_timeout(false),
        )],
    )
    .unwrap();

    let registry = TaskRegistry::new().task("hang", |_ctx: TaskContext| async {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok::<_, TaskError>(TaskOutput::default())
    });

    let summaries = Pipeline::new(graph)
        .run(registry, vec![RunTrigger::manual("d1")])
        .await;
    assert_eq!(summaries[0].failures[0].attempts, 1);
}

#[tokio::test]
async fn fatal_errors_are_not_retried() {
    init_tracing();
    let graph = Graph::new(
        "etl",
        vec![TaskNode::new("parse").with_retry(RetryPolicy::new(3, Duration::ZERO))],
    )
    .unwrap();

    let registry = TaskRegistry::new().task("parse", |_ctx: TaskContext| async {
        Err::<TaskOutput, _>(TaskError::fatal("malformed payload"))
    });

    let summaries =
        with_timeout(Pipeline::new(graph).run(registry, vec![RunTrigger::manual("d1")])).await;

    let failure = &summaries[0].failures[0];
    assert_eq!(failure.attempts, 1);
    assert_eq!(failure.cause.as_ref().unwrap().kind, FailureKind::Fatal);
}

#[tokio::test(start_paused = true)]
async fn poke_sensor_succeeds_once_condition_holds() {
    init_tracing();
    let spec = SensorSpec::new(Duration::from_secs(1), Duration::from_secs(60), SensorMode::Poke);
    let graph = Graph::new(
        "etl",
        vec![TaskNode::sensor("wait", spec), TaskNode::new("go").after("wait")],
    )
    .unwrap();

    let pokes = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&pokes);
    let registry = TaskRegistry::new()
        .sensor("wait", move |_ctx: TaskContext| {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            async move { Ok::<_, TaskError>(n >= 3) }
        })
        .task("go", |_ctx: TaskContext| async {
            Ok::<_, TaskError>(TaskOutput::default())
        });

    let summaries = Pipeline::new(graph)
        .run(registry, vec![RunTrigger::manual("d1")])
        .await;

    assert!(summaries[0].is_success());
    assert_eq!(pokes.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn poke_sensor_times_out_and_fails_dependents() {
    init_tracing();
    let spec = SensorSpec::new(Duration::from_secs(1), Duration::from_secs(5), SensorMode::Poke);
    let graph = Graph::new(
        "etl",
        vec![TaskNode::sensor("wait", spec), TaskNode::new("go").after("wait")],
    )
    .unwrap();

    let registry = TaskRegistry::new()
        .sensor("wait", |_ctx: TaskContext| async { Ok::<_, TaskError>(false) })
        .task("go", |_ctx: TaskContext| async {
            Ok::<_, TaskError>(TaskOutput::default())
        });

    let summaries = Pipeline::new(graph)
        .run(registry, vec![RunTrigger::manual("d1")])
        .await;

    let summary = &summaries[0];
    assert_eq!(summary.state_of("wait"), Some(TaskState::Failed));
    assert_eq!(summary.state_of("go"), Some(TaskState::UpstreamFailed));
    assert_eq!(
        summary.failures[0].cause.as_ref().unwrap().kind,
        FailureKind::SensorTimeout
    );
}

#[tokio::test]
async fn branch_logic_can_use_run_params() {
    init_tracing();
    let graph = Graph::new(
        "etl",
        vec![
            TaskNode::branch("is_weekend"),
            TaskNode::new("skip_day").after("is_weekend"),
            TaskNode::new("load_prices").after("is_weekend"),
        ],
    )
    .unwrap();

    let registry = TaskRegistry::new()
        .branch("is_weekend", |ctx: TaskContext| async move {
            let weekend = ctx.param("weekend").and_then(|v| v.as_bool()).unwrap_or(false);
            let chosen = if weekend { "skip_day" } else { "load_prices" };
            Ok::<_, TaskError>(BranchChoice::new(chosen))
        })
        .task("skip_day", |_ctx: TaskContext| async {
            Ok::<_, TaskError>(TaskOutput::default())
        })
        .task("load_prices", |_ctx: TaskContext| async {
            Ok::<_, TaskError>(TaskOutput::default())
        });

    let summaries = with_timeout(Pipeline::new(graph).run(
        registry,
        vec![RunTrigger::manual("2025-05-03").with_param("weekend", true)],
    ))
    .await;

    let summary = &summaries[0];
    assert!(summary.is_success());
    assert_eq!(summary.state_of("skip_day"), Some(TaskState::Success));
    assert_eq!(summary.state_of("load_prices"), Some(TaskState::Skipped));
}

#[tokio::test]
async fn panicking_task_fails_its_run_and_the_queue_moves_on() {
    init_tracing();
    let graph = Graph::new(
        "etl",
        vec![
            TaskNode::new("parse").with_retry(RetryPolicy::new(3, Duration::ZERO)),
            TaskNode::new("load").after("parse"),
        ],
    )
    .unwrap();

    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);
    let registry = TaskRegistry::new()
        .task("parse", move |ctx: TaskContext| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move {
                let rows: Vec<u32> = Vec::new();
                if ctx.run_id == "bad" {
                    let picked = rows[3];
                    return Ok::<_, TaskError>(TaskOutput::new(json!(picked)));
                }
                Ok::<_, TaskError>(TaskOutput::new(json!(rows.len())))
            }
        })
        .task("load", |_ctx: TaskContext| async {
            Ok::<_, TaskError>(TaskOutput::default())
        });

    let options = RuntimeOptions {
        max_active_runs: 1,
        ..RuntimeOptions::default()
    };
    let summaries = with_timeout(Pipeline::new(graph).options(options).run(
        registry,
        vec![RunTrigger::manual("bad"), RunTrigger::manual("good")],
    ))
    .await;

    let bad = summary_for(&summaries, "bad");
    assert_eq!(bad.status, RunStatus::Failed);
    assert_eq!(bad.state_of("load"), Some(TaskState::UpstreamFailed));
    let cause = bad.failures[0].cause.as_ref().unwrap();
    assert_eq!(cause.kind, FailureKind::Fatal);
    assert!(cause.message.contains("task panicked"), "{}", cause.message);

    assert!(summary_for(&summaries, "good").is_success());
    // A panic is fatal, so "bad" is not retried.
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn reschedule_sensor_times_out_with_sensor_timeout() {
    init_tracing();
    let spec = SensorSpec::new(
        Duration::from_millis(50),
        Duration::from_millis(300),
        SensorMode::Reschedule,
    );
    let graph = Graph::new(
        "etl",
        vec![TaskNode::sensor("wait", spec), TaskNode::new("go").after("wait")],
    )
    .unwrap();

    let pokes = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&pokes);
    let registry = TaskRegistry::new()
        .sensor("wait", move |_ctx: TaskContext| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, TaskError>(false) }
        })
        .task("go", |_ctx: TaskContext| async {
            Ok::<_, TaskError>(TaskOutput::default())
        });

    let started = tokio::time::Instant::now();
    let summaries = Pipeline::new(graph)
        .run(registry, vec![RunTrigger::manual("d1")])
        .await;
    let elapsed = started.elapsed();

    let summary = &summaries[0];
    assert_eq!(summary.status, RunStatus::Failed);
    assert_eq!(summary.state_of("wait"), Some(TaskState::Failed));
    assert_eq!(summary.state_of("go"), Some(TaskState::UpstreamFailed));
    let failure = &summary.failures[0];
    assert_eq!(failure.attempts, 1);
    assert_eq!(failure.cause.as_ref().unwrap().kind, FailureKind::SensorTimeout);
    assert!(pokes.load(Ordering::SeqCst) >= 2);
    assert!(elapsed >= Duration::from_millis(300), "{elapsed:?}");
    assert!(elapsed < Duration::from_secs(1), "{elapsed:?}");
}

#[tokio::test(start_paused = true)]
async fn reschedule_sensor_frees_its_slot_while_waiting() {
    init_tracing();
    let spec = SensorSpec::new(
        Duration::from_millis(50),
        Duration::from_secs(10),
        SensorMode::Reschedule,
    );
    let graph = Graph::new(
        "etl",
        vec![TaskNode::sensor("wait", spec), TaskNode::new("other")],
    )
    .unwrap();

    let flag = Arc::new(AtomicBool::new(false));
    let pokes = Arc::new(AtomicU32::new(0));
    let (seen, counter) = (Arc::clone(&flag), Arc::clone(&pokes));
    let registry = TaskRegistry::new()
        .sensor("wait", move |_ctx: TaskContext| {
            counter.fetch_add(1, Ordering::SeqCst);
            let ready = seen.load(Ordering::SeqCst);
            async move { Ok::<_, TaskError>(ready) }
        })
        .task("other", move |_ctx: TaskContext| {
            let flag = Arc::clone(&flag);
            async move {
                flag.store(true, Ordering::SeqCst);
                Ok::<_, TaskError>(TaskOutput::default())
            }
        });

    let options = RuntimeOptions {
        max_parallel_tasks: 1,
        ..RuntimeOptions::default()
    };
    let summaries = Pipeline::new(graph)
        .options(options)
        .run(registry, vec![RunTrigger::manual("d1")])
        .await;

    let summary = &summaries[0];
    assert!(summary.is_success());
    assert_eq!(summary.state_of("other"), Some(TaskState::Success));
    // The first poke saw nothing; "other" ran in the freed slot before the second.
    assert_eq!(pokes.load(Ordering::SeqCst), 2);
}
