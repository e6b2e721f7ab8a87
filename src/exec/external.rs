// src/exec/external.rs

//! Sensor waiting on a task of another pipeline.

use tracing::debug;

use crate::dag::TaskState;
use crate::exec::task::{BoxFuture, SensorPredicate, TaskContext, TaskError};
use crate::persist::RunStore;

/// Holds once `task` of `pipeline` succeeded in the run with the same
/// logical date (run id) as the poking run.
///
/// The other pipeline's run records are read through `store`. A missing
/// record, or one from a different pipeline, means "not yet". If that run
/// finished without the task succeeding, the sensor fails fatally instead
/// of waiting out its timeout.
pub struct ExternalTaskSensor<S> {
    pipeline: String,
    task: String,
    store: S,
}

impl<S: RunStore + Sync> ExternalTaskSensor<S> {
    pub fn new(pipeline: impl Into<String>, task: impl Into<String>, store: S) -> Self {
        Self {
            pipeline: pipeline.into(),
            task: task.into(),
            store,
        }
    }

    fn check(&self, run_id: &str) -> Result<bool, TaskError> {
        let record = self.store.load(run_id).map_err(|e| {
            TaskError::retryable(format!("reading run '{run_id}' of '{}': {e:#}", self.pipeline))
        })?;

        let Some(record) = record.filter(|r| r.graph == self.pipeline) else {
            debug!(pipeline = %self.pipeline, run_id, "no external run yet");
            return Ok(false);
        };

        let state = record.instances.get(&self.task).map(|i| i.state);
        match state {
            Some(TaskState::Success) => Ok(true),
            None => Err(TaskError::fatal(format!(
                "pipeline '{}' has no task '{}'",
                self.pipeline, self.task
            ))),
            Some(state) if record.is_finished() => Err(TaskError::fatal(format!(
                "task '{}' of pipeline '{}' ended {state:?} in run '{run_id}'",
                self.task, self.pipeline
            ))),
            Some(state) => {
                debug!(pipeline = %self.pipeline, task = %self.task, run_id, ?state, "external task not done");
                Ok(false)
            }
        }
    }
}

impl<S: RunStore + Sync> SensorPredicate for ExternalTaskSensor<S> {
    fn poll(&self, ctx: TaskContext) -> BoxFuture<'_, Result<bool, TaskError>> {
        Box::pin(async move { self.check(&ctx.run_id) })
    }
}
