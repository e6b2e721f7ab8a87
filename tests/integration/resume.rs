// tests/integration/resume.rs

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use chrono::Utc;
use serde_json::{Value, json};
use tokio::sync::mpsc;

use dagflow::dag::{FailureCause, Graph, RunStatus, TaskInstance, TaskNode, TaskState};
use dagflow::engine::{RunTrigger, RuntimeEvent, RuntimeOptions};
use dagflow::exchange::{DEFAULT_KEY, ExchangeEntry};
use dagflow::exec::{TaskContext, TaskError, TaskOutput, TaskRegistry};
use dagflow::persist::{MemoryRunStore, RunRecord, RunStore};
use dagflow_test_utils::fake_executor::FakeExecutor;
use dagflow_test_utils::harness::Pipeline;
use dagflow_test_utils::{init_tracing, with_timeout};

fn chain() -> Graph {
    Graph::new(
        "etl",
        vec![
            TaskNode::new("a"),
            TaskNode::new("b").after("a"),
            TaskNode::new("c").after("b"),
        ],
    )
    .unwrap()
}

fn instance(task: &str, state: TaskState, attempts: u32) -> (String, TaskInstance) {
    let mut instance = TaskInstance::new(task);
    instance.state = state;
    instance.attempts = attempts;
    if state == TaskState::Failed {
        instance.last_error = Some(FailureCause::retryable("upstream API down"));
    }
    (task.to_string(), instance)
}

fn record(status: RunStatus, instances: Vec<(String, TaskInstance)>) -> RunRecord {
    RunRecord {
        run_id: "2025-04-29".into(),
        graph: "etl".into(),
        params: BTreeMap::new(),
        status,
        created_at: Utc::now(),
        finished_at: None,
        instances: instances.into_iter().collect(),
        exchange: vec![ExchangeEntry {
            task: "a".into(),
            key: DEFAULT_KEY.into(),
            value: Arc::new(json!("from a")),
            attempt: 1,
            seq: 0,
        }],
    }
}

/// Registry where `a` must never run again and `b` echoes `a`'s value.
fn registry(a_calls: Arc<AtomicU32>) -> TaskRegistry {
    TaskRegistry::new()
        .task("a", move |_ctx: TaskContext| {
            a_calls.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, TaskError>(TaskOutput::new("again")) }
        })
        .task("b", |ctx: TaskContext| async move {
            let a = ctx.upstream_value("a")?;
            Ok::<_, TaskError>(TaskOutput::new((*a).clone()))
        })
        .task("c", |_ctx: TaskContext| async {
            Ok::<_, TaskError>(TaskOutput::new(Value::Null))
        })
}

#[tokio::test]
async fn interrupted_run_resumes_without_rerunning_successful_tasks() {
    init_tracing();
    let a_calls = Arc::new(AtomicU32::new(0));
    let store = MemoryRunStore::new();
    let interrupted = record(
        RunStatus::Running,
        vec![
            instance("a", TaskState::Success, 1),
            instance("b", TaskState::Running, 1),
            instance("c", TaskState::Pending, 0),
        ],
    );

    let summaries = with_timeout(
        Pipeline::new(chain())
            .store(store.clone())
            .resume(vec![interrupted])
            // The same run id triggered again is a duplicate of the resumed run.
            .run(
                registry(Arc::clone(&a_calls)),
                vec![RunTrigger::manual("2025-04-29")],
            ),
    )
    .await;

    assert_eq!(summaries.len(), 1);
    assert!(summaries[0].is_success());
    assert_eq!(a_calls.load(Ordering::SeqCst), 0);

    let saved = store.load("2025-04-29").unwrap().unwrap();
    let b_value = saved
        .exchange
        .iter()
        .find(|e| e.task == "b")
        .map(|e| (*e.value).clone());
    assert_eq!(b_value, Some(json!("from a")));
}

#[tokio::test]
async fn rerun_failed_resets_failed_and_upstream_failed_tasks() {
    init_tracing();
    let a_calls = Arc::new(AtomicU32::new(0));
    let failed = record(
        RunStatus::Failed,
        vec![
            instance("a", TaskState::Success, 1),
            instance("b", TaskState::Failed, 3),
            instance("c", TaskState::UpstreamFailed, 0),
        ],
    );

    let options = RuntimeOptions {
        rerun_failed: true,
        ..RuntimeOptions::default()
    };
    let summaries = with_timeout(
        Pipeline::new(chain())
            .options(options)
            .resume(vec![failed])
            .run(registry(Arc::clone(&a_calls)), Vec::new()),
    )
    .await;

    let summary = &summaries[0];
    assert!(summary.is_success());
    assert_eq!(summary.state_of("b"), Some(TaskState::Success));
    assert_eq!(summary.state_of("c"), Some(TaskState::Success));
    assert_eq!(a_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn shutdown_leaves_a_resumable_record() {
    init_tracing();
    let store = MemoryRunStore::new();

    let (tx, rx) = mpsc::channel(64);
    let executor = FakeExecutor::new(tx.clone()).hold("a");
    let log = executor.log();
    tx.send(RuntimeEvent::RunTriggered(RunTrigger::manual("2025-04-29")))
        .await
        .unwrap();
    tx.send(RuntimeEvent::ShutdownRequested).await.unwrap();

    let summaries = with_timeout(
        Pipeline::new(chain())
            .store(store.clone())
            .run_with(executor, tx, rx, Vec::new()),
    )
    .await;
    assert!(summaries.is_empty());
    assert_eq!(log.cancelled().len(), 1);

    let saved = store.load("2025-04-29").unwrap().unwrap();
    assert_eq!(saved.status, RunStatus::Running);
    assert_eq!(saved.instances["a"].state, TaskState::Running);

    // The next process picks the run up from the store.
    let unfinished = store.list_unfinished().unwrap();
    let a_calls = Arc::new(AtomicU32::new(0));
    let summaries = with_timeout(
        Pipeline::new(chain())
            .store(store.clone())
            .resume(unfinished)
            .run(registry(Arc::clone(&a_calls)), Vec::new()),
    )
    .await;

    assert!(summaries[0].is_success());
    assert_eq!(a_calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        store.load("2025-04-29").unwrap().unwrap().status,
        RunStatus::Success
    );
}
