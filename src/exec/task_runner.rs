// src/exec/task_runner.rs

//! Runs a single attempt and reports its outcome to the runtime.

use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinError;
use tokio::time::{Instant, sleep, timeout};
use tracing::{debug, info, warn};

use crate::dag::{FailureCause, ScheduledTask};
use crate::engine::{AttemptOutcome, RuntimeEvent};
use crate::exec::task::{Operator, SensorPredicate, TaskError};
use crate::types::SensorMode;

/// Run one attempt, emitting `AttemptFinished` once it completes.
///
/// The operator runs in its own Tokio task so a panic in task logic is
/// reported as a fatal failure instead of losing the result.
///
/// If the cancel channel fires the attempt is aborted and **no**
/// `AttemptFinished` event is sent; the scheduler already failed the
/// instance when it asked for cancellation.
pub async fn run_task(
    task: ScheduledTask,
    operator: Operator,
    runtime_tx: mpsc::Sender<RuntimeEvent>,
    mut cancel_rx: oneshot::Receiver<()>,
) {
    info!(
        run_id = %task.run_id,
        task = %task.name,
        attempt = task.attempt,
        kind = ?task.kind,
        "starting attempt"
    );

    let mut attempt = {
        let task = task.clone();
        tokio::spawn(async move { run_attempt(&task, &operator).await })
    };

    let joined = tokio::select! {
        joined = &mut attempt => joined,
        cancel = &mut cancel_rx => match cancel {
            Ok(()) => {
                info!(
                    run_id = %task.run_id,
                    task = %task.name,
                    attempt = task.attempt,
                    "cancellation requested; aborting attempt"
                );
                attempt.abort();
                return;
            }
            Err(_) => {
                debug!(
                    run_id = %task.run_id,
                    task = %task.name,
                    "cancel channel closed without explicit cancellation"
                );
                attempt.await
            }
        },
    };

    let outcome = joined.unwrap_or_else(|err| {
        AttemptOutcome::Failed(FailureCause::fatal(describe_join_error(err)))
    });

    match &outcome {
        AttemptOutcome::Succeeded { .. } => {
            info!(run_id = %task.run_id, task = %task.name, attempt = task.attempt, "attempt succeeded")
        }
        AttemptOutcome::NotReady => {
            debug!(run_id = %task.run_id, task = %task.name, "sensor condition not met yet")
        }
        AttemptOutcome::Failed(cause) => warn!(
            run_id = %task.run_id,
            task = %task.name,
            attempt = task.attempt,
            cause = %cause,
            "attempt failed"
        ),
    }

    let event = RuntimeEvent::AttemptFinished {
        run_id: task.run_id.clone(),
        task: task.name.clone(),
        attempt: task.attempt,
        outcome,
    };
    if runtime_tx.send(event).await.is_err() {
        debug!(task = %task.name, "runtime channel closed; dropping attempt result");
    }
}

fn describe_join_error(err: JoinError) -> String {
    if !err.is_panic() {
        return "attempt was aborted".to_string();
    }
    let payload = err.into_panic();
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string());
    format!("task panicked: {message}")
}

/// Execute the operator once, honouring the per-attempt timeout.
pub async fn run_attempt(task: &ScheduledTask, operator: &Operator) -> AttemptOutcome {
    match operator {
        Operator::Sensor(predicate) => run_sensor(task, predicate.as_ref()).await,
        Operator::Task(logic) => {
            bounded(task.timeout, async {
                match logic.execute(task.context.clone()).await {
                    Ok(output) => AttemptOutcome::Succeeded {
                        value: output.value,
                        entries: output.entries,
                        chosen: None,
                    },
                    Err(err) => AttemptOutcome::Failed(err.into()),
                }
            })
            .await
        }
        Operator::Branch(logic) => {
            bounded(task.timeout, async {
                match logic.choose(task.context.clone()).await {
                    Ok(choice) => AttemptOutcome::Succeeded {
                        value: Value::String(choice.chosen.clone()),
                        entries: Vec::new(),
                        chosen: Some(choice.chosen),
                    },
                    Err(err) => AttemptOutcome::Failed(err.into()),
                }
            })
            .await
        }
    }
}

async fn bounded<F>(limit: Option<Duration>, attempt: F) -> AttemptOutcome
where
    F: Future<Output = AttemptOutcome>,
{
    match limit {
        Some(limit) => timeout(limit, attempt)
            .await
            .unwrap_or_else(|_| AttemptOutcome::Failed(FailureCause::timeout(limit))),
        None => attempt.await,
    }
}

/// Poke the predicate until it holds or the sensor budget runs out.
///
/// In reschedule mode a single poke is made per activation; the slot is
/// released with `NotReady` and the scheduler wakes the sensor again after
/// `poke_interval`.
async fn run_sensor(task: &ScheduledTask, predicate: &dyn SensorPredicate) -> AttemptOutcome {
    let Some(spec) = task.sensor else {
        return AttemptOutcome::Failed(FailureCause::fatal(format!(
            "sensor task '{}' has no sensor settings",
            task.name
        )));
    };

    // A budget too large to represent means no deadline.
    let deadline = Instant::now().checked_add(task.sensor_remaining.unwrap_or(spec.timeout));

    loop {
        match predicate.poll(task.context.clone()).await {
            Ok(true) => {
                return AttemptOutcome::Succeeded {
                    value: Value::Bool(true),
                    entries: Vec::new(),
                    chosen: None,
                };
            }
            Ok(false) => {}
            Err(TaskError::Retryable(msg)) => {
                debug!(task = %task.name, error = %msg, "transient sensor error; treating as not ready");
            }
            Err(TaskError::Fatal(msg)) => return AttemptOutcome::Failed(FailureCause::fatal(msg)),
        }

        let now = Instant::now();
        if deadline.is_some_and(|d| now >= d) {
            return AttemptOutcome::Failed(FailureCause::sensor_timeout(spec.timeout));
        }

        match spec.mode {
            SensorMode::Reschedule => return AttemptOutcome::NotReady,
            SensorMode::Poke => {
                let pause = match deadline {
                    Some(d) => spec.poke_interval.min(d - now),
                    None => spec.poke_interval,
                };
                sleep(pause).await;
            }
        }
    }
}
