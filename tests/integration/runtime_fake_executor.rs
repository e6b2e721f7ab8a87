// tests/integration/runtime_fake_executor.rs

use std::time::Duration;

use tokio::sync::mpsc;

use dagflow::config::RawConfigFile;
use dagflow::dag::{
    FailureCause, FailureKind, Graph, RetryPolicy, RunStatus, SensorSpec, TaskGroup, TaskNode,
    TaskState,
};
use dagflow::engine::{AttemptOutcome, RunTrigger, RuntimeEvent, RuntimeOptions, TaskRef};
use dagflow::persist::{MemoryRunStore, RunStore};
use dagflow::types::{QueuedRunBehaviour, SensorMode, TriggerRule};
use dagflow_test_utils::fake_executor::FakeExecutor;
use dagflow_test_utils::harness::Pipeline;
use dagflow_test_utils::{init_tracing, with_timeout};

/// a -> b -> c, a -> d (none_failed)
fn diamond_tail() -> Graph {
    Graph::new(
        "etl",
        vec![
            TaskNode::new("a"),
            TaskNode::new("b").after("a"),
            TaskNode::new("c").after("b"),
            TaskNode::new("d")
                .after("a")
                .with_trigger_rule(TriggerRule::NoneFailed),
        ],
    )
    .unwrap()
}

#[tokio::test]
async fn permanent_failure_skips_dependents_but_not_independent_branch() {
    init_tracing();
    let (tx, rx) = mpsc::channel(64);
    let executor = FakeExecutor::new(tx.clone()).script(
        "b",
        [AttemptOutcome::Failed(FailureCause::fatal("bad input"))],
    );
    let log = executor.log();

    let summaries = with_timeout(Pipeline::new(diamond_tail()).run_with(
        executor,
        tx,
        rx,
        vec![RunTrigger::manual("2025-04-29")],
    ))
    .await;

    let summary = &summaries[0];
    assert_eq!(summary.status, RunStatus::Failed);
    assert_eq!(summary.state_of("a"), Some(TaskState::Success));
    assert_eq!(summary.state_of("b"), Some(TaskState::Failed));
    assert_eq!(summary.state_of("c"), Some(TaskState::UpstreamFailed));
    assert_eq!(summary.state_of("d"), Some(TaskState::Success));

    assert!(!log.tasks().contains(&"c".to_string()));
    let failed: Vec<_> = summary.failures.iter().map(|f| f.task.as_str()).collect();
    assert_eq!(failed, vec!["b", "c"]);
}

#[tokio::test(start_paused = true)]
async fn retries_wait_for_backoff_between_attempts() {
    init_tracing();
    let graph = Graph::new(
        "etl",
        vec![TaskNode::new("fetch").with_retry(RetryPolicy::new(3, Duration::from_secs(10)))],
    )
    .unwrap();

    let (tx, rx) = mpsc::channel(64);
    let executor = FakeExecutor::new(tx.clone()).script(
        "fetch",
        [
            AttemptOutcome::Failed(FailureCause::retryable("503")),
            AttemptOutcome::Failed(FailureCause::retryable("503")),
            AttemptOutcome::success(42),
        ],
    );
    let log = executor.log();

    let start = tokio::time::Instant::now();
    let summaries = Pipeline::new(graph)
        .run_with(executor, tx, rx, vec![RunTrigger::manual("d1")])
        .await;

    assert!(summaries[0].is_success());
    assert_eq!(log.attempts_of("fetch"), 3);
    let numbers: Vec<u32> = log.attempts().iter().map(|a| a.attempt).collect();
    assert_eq!(numbers, vec![1, 2, 3]);
    assert!(start.elapsed() >= Duration::from_secs(20));
}

#[tokio::test]
async fn exhausted_retries_fail_the_task_with_last_cause() {
    init_tracing();
    let graph = Graph::new(
        "etl",
        vec![TaskNode::new("fetch").with_retry(RetryPolicy::new(2, Duration::ZERO))],
    )
    .unwrap();

    let (tx, rx) = mpsc::channel(64);
    let executor = FakeExecutor::new(tx.clone()).script(
        "fetch",
        [
            AttemptOutcome::Failed(FailureCause::retryable("first")),
            AttemptOutcome::Failed(FailureCause::retryable("second")),
        ],
    );

    let summaries = with_timeout(Pipeline::new(graph).run_with(
        executor,
        tx,
        rx,
        vec![RunTrigger::manual("d1")],
    ))
    .await;

    let failure = &summaries[0].failures[0];
    assert_eq!(failure.task, "fetch");
    assert_eq!(failure.state, TaskState::Failed);
    assert_eq!(failure.attempts, 2);
    let cause = failure.cause.as_ref().expect("cause recorded");
    assert_eq!(cause.kind, FailureKind::Retryable);
    assert_eq!(cause.message, "second");
}

#[tokio::test]
async fn queued_runs_start_in_trigger_order() {
    init_tracing();
    let (tx, rx) = mpsc::channel(64);
    let executor = FakeExecutor::new(tx.clone());
    let log = executor.log();

    let summaries = with_timeout(Pipeline::new(diamond_tail()).run_with(
        executor,
        tx,
        rx,
        vec![RunTrigger::manual("d1"), RunTrigger::manual("d2")],
    ))
    .await;

    let order: Vec<_> = summaries.iter().map(|s| s.run_id.as_str()).collect();
    assert_eq!(order, vec!["d1", "d2"]);

    // max_active_runs = 1: every d1 attempt is dispatched before any d2 one.
    let runs: Vec<_> = log.attempts().into_iter().map(|a| a.run_id).collect();
    let first_d2 = runs.iter().position(|r| r == "d2").expect("d2 ran");
    assert!(runs[..first_d2].iter().all(|r| r == "d1"));
    assert!(runs[first_d2..].iter().all(|r| r == "d2"));
}

#[tokio::test]
async fn latest_behaviour_drops_superseded_triggers() {
    init_tracing();
    let (tx, rx) = mpsc::channel(64);
    let executor = FakeExecutor::new(tx.clone());

    let summaries = with_timeout(
        Pipeline::new(diamond_tail())
            .behaviour(QueuedRunBehaviour::Latest)
            .run_with(
                executor,
                tx,
                rx,
                vec![
                    RunTrigger::manual("d1"),
                    RunTrigger::manual("d2"),
                    RunTrigger::manual("d3"),
                ],
            ),
    )
    .await;

    let order: Vec<_> = summaries.iter().map(|s| s.run_id.as_str()).collect();
    assert_eq!(order, vec!["d1", "d3"]);
}

#[tokio::test]
async fn branch_skips_unchosen_path_and_join_still_runs() {
    init_tracing();
    let graph = Graph::new(
        "etl",
        vec![
            TaskNode::branch("pick"),
            TaskNode::new("full_load").after("pick"),
            TaskNode::new("incremental").after("pick"),
            TaskNode::new("report")
                .after("full_load")
                .after("incremental")
                .with_trigger_rule(TriggerRule::NoneFailed),
        ],
    )
    .unwrap();

    let (tx, rx) = mpsc::channel(64);
    let executor =
        FakeExecutor::new(tx.clone()).script("pick", [AttemptOutcome::branch("incremental")]);
    let log = executor.log();

    let summaries = with_timeout(Pipeline::new(graph).run_with(
        executor,
        tx,
        rx,
        vec![RunTrigger::manual("d1")],
    ))
    .await;

    let summary = &summaries[0];
    assert!(summary.is_success());
    assert_eq!(summary.state_of("full_load"), Some(TaskState::Skipped));
    assert_eq!(summary.state_of("incremental"), Some(TaskState::Success));
    assert_eq!(summary.state_of("report"), Some(TaskState::Success));
    assert_eq!(log.tasks(), vec!["pick", "incremental", "report"]);
}

#[tokio::test]
async fn abort_cancels_running_attempts_and_fails_the_run() {
    init_tracing();
    let graph = Graph::new(
        "etl",
        vec![TaskNode::new("slow"), TaskNode::new("after").after("slow")],
    )
    .unwrap();

    let (tx, rx) = mpsc::channel(64);
    let executor = FakeExecutor::new(tx.clone()).hold("slow");
    let log = executor.log();

    tx.send(RuntimeEvent::RunTriggered(RunTrigger::manual("d1")))
        .await
        .unwrap();
    tx.send(RuntimeEvent::AbortRun {
        run_id: "d1".into(),
        reason: "operator request".into(),
    })
    .await
    .unwrap();

    let summaries = with_timeout(Pipeline::new(graph).run_with(executor, tx, rx, Vec::new())).await;

    assert_eq!(log.cancelled(), vec![TaskRef::new("d1", "slow")]);
    let summary = &summaries[0];
    assert_eq!(summary.status, RunStatus::Failed);
    assert_eq!(summary.state_of("slow"), Some(TaskState::Failed));
    assert_eq!(summary.state_of("after"), Some(TaskState::Failed));
    let cause = summary.failures[0].cause.as_ref().unwrap();
    assert_eq!(cause.kind, FailureKind::Cancelled);
}

#[tokio::test(start_paused = true)]
async fn reschedule_sensor_releases_slot_without_consuming_attempts() {
    init_tracing();
    let spec = SensorSpec::new(
        Duration::from_secs(30),
        Duration::from_secs(600),
        SensorMode::Reschedule,
    );
    let graph = Graph::new(
        "etl",
        vec![
            TaskNode::sensor("wait_for_api", spec),
            TaskNode::new("fetch").after("wait_for_api"),
        ],
    )
    .unwrap();

    let (tx, rx) = mpsc::channel(64);
    let executor = FakeExecutor::new(tx.clone()).script(
        "wait_for_api",
        [
            AttemptOutcome::NotReady,
            AttemptOutcome::NotReady,
            AttemptOutcome::success(true),
        ],
    );
    let log = executor.log();
    let store = MemoryRunStore::new();

    let start = tokio::time::Instant::now();
    let summaries = Pipeline::new(graph)
        .store(store.clone())
        .run_with(executor, tx, rx, vec![RunTrigger::manual("d1")])
        .await;

    assert!(summaries[0].is_success());
    assert_eq!(log.attempts_of("wait_for_api"), 3);
    assert!(log
        .attempts()
        .iter()
        .filter(|a| a.task == "wait_for_api")
        .all(|a| a.attempt == 1));
    assert!(start.elapsed() >= Duration::from_secs(60));

    let record = store.load("d1").unwrap().expect("run persisted");
    assert_eq!(record.instances["wait_for_api"].attempts, 1);
}

#[tokio::test]
async fn finished_run_is_persisted_with_its_exchange() {
    init_tracing();
    let graph = Graph::new("etl", vec![TaskNode::new("extract")]).unwrap();

    let (tx, rx) = mpsc::channel(64);
    let executor = FakeExecutor::new(tx.clone())
        .script("extract", [AttemptOutcome::success(serde_json::json!([1, 2, 3]))]);
    let store = MemoryRunStore::new();

    with_timeout(
        Pipeline::new(graph)
            .store(store.clone())
            .options(RuntimeOptions::default())
            .run_with(executor, tx, rx, vec![RunTrigger::manual("d1")]),
    )
    .await;

    let record = store.load("d1").unwrap().expect("run persisted");
    assert_eq!(record.status, RunStatus::Success);
    assert!(record.finished_at.is_some());
    let entry = record
        .exchange
        .iter()
        .find(|e| e.task == "extract")
        .expect("return value persisted");
    assert_eq!(*entry.value, serde_json::json!([1, 2, 3]));
}

#[tokio::test]
async fn dispatch_follows_task_order_of_the_config_file() {
    init_tracing();
    let raw = RawConfigFile::from_toml_str(
        r#"
        [task.zeta]
        cmd = "true"

        [task.alpha]
        cmd = "true"

        [task.mid]
        cmd = "true"

        [task.report]
        cmd = "true"
        after = ["mid", "zeta"]
        "#,
    )
    .unwrap();
    let graph = dagflow::config::ConfigFile::try_from(raw).unwrap().to_graph().unwrap();

    let (tx, rx) = mpsc::channel(64);
    let executor = FakeExecutor::new(tx.clone());
    let log = executor.log();
    let options = RuntimeOptions {
        max_parallel_tasks: 1,
        ..RuntimeOptions::default()
    };

    let summaries = with_timeout(Pipeline::new(graph).options(options).run_with(
        executor,
        tx,
        rx,
        vec![RunTrigger::manual("2025-04-29")],
    ))
    .await;

    assert!(summaries[0].is_success());
    assert_eq!(log.tasks(), vec!["zeta", "alpha", "mid", "report"]);
}

#[tokio::test]
async fn branch_into_a_group_runs_its_members_and_skips_the_rest() {
    init_tracing();
    let graph = Graph::with_groups(
        "dbt",
        vec![
            TaskNode::branch("check_data"),
            TaskNode::new("no_data").after("check_data"),
            TaskNode::new("dbt_run"),
            TaskNode::new("dbt_test").after("dbt_run"),
            TaskNode::new("docs").after("dbt_test"),
        ],
        vec![TaskGroup::new("dbt_tasks", ["dbt_run", "dbt_test", "docs"]).after("check_data")],
    )
    .unwrap();

    let (tx, rx) = mpsc::channel(64);
    let executor = FakeExecutor::new(tx.clone())
        .script("check_data", [AttemptOutcome::branch("dbt_tasks")]);
    let log = executor.log();

    let summaries = with_timeout(Pipeline::new(graph).run_with(
        executor,
        tx,
        rx,
        vec![RunTrigger::manual("2025-04-29")],
    ))
    .await;

    let summary = &summaries[0];
    assert!(summary.is_success());
    assert_eq!(summary.state_of("no_data"), Some(TaskState::Skipped));
    assert_eq!(log.tasks(), vec!["check_data", "dbt_run", "dbt_test", "docs"]);
}
