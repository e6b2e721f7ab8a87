// src/exec/executor_loop.rs

//! Main executor loop that manages running attempts.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::dag::{FailureCause, ScheduledTask};
use crate::engine::{AttemptOutcome, RuntimeEvent, TaskRef};
use crate::exec::task::TaskRegistry;
use crate::exec::task_runner::run_task;

/// Request sent from the runtime to the executor loop.
#[derive(Debug)]
pub enum ExecutorRequest {
    Run(ScheduledTask),
    Cancel(TaskRef),
}

/// Internal handle for a running attempt.
///
/// - `cancel` asks the runner to drop the attempt (run abort, shutdown).
/// - `handle` is the Tokio task driving the attempt.
struct ActiveTask {
    attempt: u32,
    cancel: Option<oneshot::Sender<()>>,
    handle: tokio::task::JoinHandle<()>,
}

/// Spawn the background executor loop.
///
/// Each attempt runs in its own Tokio task. The loop itself does not limit
/// concurrency; the scheduler only dispatches as many attempts as it has
/// free slots.
pub fn spawn_executor(
    registry: Arc<TaskRegistry>,
    runtime_tx: mpsc::Sender<RuntimeEvent>,
) -> mpsc::Sender<ExecutorRequest> {
    let (tx, mut rx) = mpsc::channel::<ExecutorRequest>(64);

    tokio::spawn(async move {
        info!("executor loop started");

        let mut active: HashMap<TaskRef, ActiveTask> = HashMap::new();

        while let Some(request) = rx.recv().await {
            active.retain(|_, t| !t.handle.is_finished());

            match request {
                ExecutorRequest::Run(task) => {
                    handle_scheduled_task(task, &registry, &mut active, &runtime_tx).await;
                }
                ExecutorRequest::Cancel(task_ref) => cancel_task(&task_ref, &mut active),
            }
        }

        for (task_ref, mut task) in active.drain() {
            debug!(run_id = %task_ref.run_id, task = %task_ref.task, "executor closing; cancelling attempt");
            if let Some(cancel) = task.cancel.take() {
                if cancel.send(()).is_err() {
                    debug!(run_id = %task_ref.run_id, task = %task_ref.task, "attempt already finished");
                }
            }
        }

        info!("executor loop finished (channel closed)");
    });

    tx
}

async fn handle_scheduled_task(
    task: ScheduledTask,
    registry: &TaskRegistry,
    active: &mut HashMap<TaskRef, ActiveTask>,
    runtime_tx: &mpsc::Sender<RuntimeEvent>,
) {
    let task_ref = TaskRef::new(&task.run_id, &task.name);

    let Some(operator) = registry.get(&task.name).cloned() else {
        warn!(run_id = %task.run_id, task = %task.name, "no operator registered for task");
        let event = RuntimeEvent::AttemptFinished {
            run_id: task.run_id.clone(),
            task: task.name.clone(),
            attempt: task.attempt,
            outcome: AttemptOutcome::Failed(FailureCause::fatal(format!(
                "no operator registered for task '{}'",
                task.name
            ))),
        };
        if runtime_tx.send(event).await.is_err() {
            warn!(run_id = %task.run_id, task = %task.name, "runtime channel closed; dropping failure");
        }
        return;
    };

    // A reschedule poke may arrive before the previous activation's runner
    // has fully returned; that runner has already reported, so replace it.
    if let Some(previous) = active.get(&task_ref) {
        debug!(
            run_id = %task.run_id,
            task = %task.name,
            previous_attempt = previous.attempt,
            attempt = task.attempt,
            "replacing finished activation"
        );
    }

    let (cancel_tx, cancel_rx) = oneshot::channel::<()>();
    let rt_tx = runtime_tx.clone();
    let attempt = task.attempt;
    let spawn_ref = task_ref.clone();

    let handle = tokio::spawn(async move {
        run_task(task, operator, rt_tx, cancel_rx).await;
        debug!(run_id = %spawn_ref.run_id, task = %spawn_ref.task, "task runner future finished");
    });

    active.insert(
        task_ref,
        ActiveTask {
            attempt,
            cancel: Some(cancel_tx),
            handle,
        },
    );
}

fn cancel_task(task_ref: &TaskRef, active: &mut HashMap<TaskRef, ActiveTask>) {
    let Some(mut existing) = active.remove(task_ref) else {
        debug!(
            run_id = %task_ref.run_id,
            task = %task_ref.task,
            "cancel requested for task that is not running"
        );
        return;
    };

    info!(
        run_id = %task_ref.run_id,
        task = %task_ref.task,
        attempt = existing.attempt,
        "cancelling running attempt"
    );

    if let Some(cancel) = existing.cancel.take() {
        if cancel.send(()).is_err() {
            debug!(
                run_id = %task_ref.run_id,
                task = %task_ref.task,
                "attempt already finished while cancelling"
            );
        }
    }
}
