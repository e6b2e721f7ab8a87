use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::mpsc;

use dagflow::dag::ScheduledTask;
use dagflow::engine::{AttemptOutcome, RuntimeEvent, TaskRef};
use dagflow::errors::Result;
use dagflow::exec::{BoxFuture, ExecutorBackend};

/// One dispatched attempt, as seen by the fake executor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchedAttempt {
    pub run_id: String,
    pub task: String,
    pub attempt: u32,
}

/// Shared record of what a `FakeExecutor` was asked to do.
#[derive(Debug, Clone, Default)]
pub struct ExecutionLog {
    dispatched: Arc<Mutex<Vec<DispatchedAttempt>>>,
    cancelled: Arc<Mutex<Vec<TaskRef>>>,
}

impl ExecutionLog {
    pub fn attempts(&self) -> Vec<DispatchedAttempt> {
        self.dispatched.lock().unwrap().clone()
    }

    /// Task names in dispatch order.
    pub fn tasks(&self) -> Vec<String> {
        self.attempts().into_iter().map(|a| a.task).collect()
    }

    pub fn attempts_of(&self, task: &str) -> u32 {
        self.attempts().iter().filter(|a| a.task == task).count() as u32
    }

    pub fn cancelled(&self) -> Vec<TaskRef> {
        self.cancelled.lock().unwrap().clone()
    }
}

/// A fake executor that:
/// - records which attempts were dispatched and cancelled
/// - reports the next scripted outcome of each task (success with a `null`
///   value once the script runs out)
/// - never reports attempts of held tasks, which stay running until
///   cancelled.
pub struct FakeExecutor {
    runtime_tx: mpsc::Sender<RuntimeEvent>,
    script: Arc<Mutex<HashMap<String, VecDeque<AttemptOutcome>>>>,
    held: HashSet<String>,
    log: ExecutionLog,
}

impl FakeExecutor {
    pub fn new(runtime_tx: mpsc::Sender<RuntimeEvent>) -> Self {
        Self {
            runtime_tx,
            script: Arc::default(),
            held: HashSet::new(),
            log: ExecutionLog::default(),
        }
    }

    /// Outcomes of successive attempts of `task`.
    pub fn script(self, task: &str, outcomes: impl IntoIterator<Item = AttemptOutcome>) -> Self {
        self.script
            .lock()
            .unwrap()
            .entry(task.to_string())
            .or_default()
            .extend(outcomes);
        self
    }

    pub fn hold(mut self, task: &str) -> Self {
        self.held.insert(task.to_string());
        self
    }

    pub fn log(&self) -> ExecutionLog {
        self.log.clone()
    }
}

impl ExecutorBackend for FakeExecutor {
    fn spawn_ready_tasks(&mut self, tasks: Vec<ScheduledTask>) -> BoxFuture<'_, Result<()>> {
        let mut events = Vec::new();
        {
            let mut script = self.script.lock().unwrap();
            let mut dispatched = self.log.dispatched.lock().unwrap();

            for t in tasks {
                dispatched.push(DispatchedAttempt {
                    run_id: t.run_id.clone(),
                    task: t.name.clone(),
                    attempt: t.attempt,
                });
                if self.held.contains(&t.name) {
                    continue;
                }

                let outcome = script
                    .get_mut(&t.name)
                    .and_then(VecDeque::pop_front)
                    .unwrap_or_else(|| AttemptOutcome::success(Value::Null));
                events.push(RuntimeEvent::AttemptFinished {
                    run_id: t.run_id,
                    task: t.name,
                    attempt: t.attempt,
                    outcome,
                });
            }
        }

        // Report from a separate task so a full channel cannot block the
        // runtime that is awaiting this future.
        let tx = self.runtime_tx.clone();
        tokio::spawn(async move {
            for event in events {
                if tx.send(event).await.is_err() {
                    break;
                }
            }
        });

        Box::pin(async { Ok(()) })
    }

    fn cancel_tasks(&mut self, tasks: Vec<TaskRef>) -> BoxFuture<'_, Result<()>> {
        self.log.cancelled.lock().unwrap().extend(tasks);
        Box::pin(async { Ok(()) })
    }
}
