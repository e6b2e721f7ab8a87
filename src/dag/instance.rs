// src/dag/instance.rs

//! Per-run task records and the description of a dispatched attempt.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::dag::graph::{RetryPolicy, SensorSpec};
use crate::engine::{RunId, TaskName};
use crate::exec::task::TaskContext;
use crate::types::TaskKind;

/// State of a task instance within one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Waiting for upstreams to satisfy the trigger rule.
    Pending,
    /// Ready; waiting for a concurrency slot.
    Queued,
    Running,
    /// Failed attempt; will re-enter `Queued` after the backoff delay.
    UpForRetry,
    /// Sensor between two pokes in reschedule mode.
    UpForReschedule,
    Success,
    Failed,
    /// Pruned by a branch, or unreachable because an upstream was pruned.
    Skipped,
    UpstreamFailed,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Success | TaskState::Failed | TaskState::Skipped | TaskState::UpstreamFailed
        )
    }

    /// Failed, either directly or through an upstream.
    pub fn is_failed(self) -> bool {
        matches!(self, TaskState::Failed | TaskState::UpstreamFailed)
    }

    /// Dispatched or about to be re-dispatched.
    pub fn is_in_flight(self) -> bool {
        matches!(
            self,
            TaskState::Queued
                | TaskState::Running
                | TaskState::UpForRetry
                | TaskState::UpForReschedule
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskState::Pending => "pending",
            TaskState::Queued => "queued",
            TaskState::Running => "running",
            TaskState::UpForRetry => "up_for_retry",
            TaskState::UpForReschedule => "up_for_reschedule",
            TaskState::Success => "success",
            TaskState::Failed => "failed",
            TaskState::Skipped => "skipped",
            TaskState::UpstreamFailed => "upstream_failed",
        };
        f.write_str(s)
    }
}

/// Classification of an attempt failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Retryable,
    Fatal,
    /// The attempt exceeded `per_attempt_timeout`.
    Timeout,
    /// A sensor's condition did not hold before its deadline.
    SensorTimeout,
    /// The run was aborted while the task was not yet terminal.
    Cancelled,
}

/// Last failure recorded on a task instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureCause {
    pub kind: FailureKind,
    pub message: String,
}

impl FailureCause {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn retryable(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Retryable, message)
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Fatal, message)
    }

    pub fn timeout(limit: Duration) -> Self {
        Self::new(
            FailureKind::Timeout,
            format!("attempt exceeded timeout of {limit:?}"),
        )
    }

    pub fn sensor_timeout(limit: Duration) -> Self {
        Self::new(
            FailureKind::SensorTimeout,
            format!("sensor condition not met within {limit:?}"),
        )
    }

    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self::new(FailureKind::Cancelled, reason)
    }

    /// Whether another attempt may follow this failure under `policy`.
    /// Attempt budget is checked separately.
    pub fn allows_retry(&self, policy: &RetryPolicy) -> bool {
        match self.kind {
            FailureKind::Retryable => true,
            FailureKind::Timeout | FailureKind::SensorTimeout => policy.retry_on_timeout,
            FailureKind::Fatal | FailureKind::Cancelled => false,
        }
    }
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

/// Execution record of one task within one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInstance {
    pub task: TaskName,
    pub state: TaskState,
    /// Number of attempts started so far.
    pub attempts: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Exchange key of the published return value, once successful.
    pub result_key: Option<String>,
    pub last_error: Option<FailureCause>,
    /// First poke of the current sensor attempt.
    #[serde(default)]
    pub sensor_started_at: Option<DateTime<Utc>>,
    /// Next activation is a reschedule poke of the current attempt.
    #[serde(default)]
    pub rescheduled: bool,
}

impl TaskInstance {
    pub fn new(task: impl Into<TaskName>) -> Self {
        Self {
            task: task.into(),
            state: TaskState::Pending,
            attempts: 0,
            started_at: None,
            ended_at: None,
            result_key: None,
            last_error: None,
            sensor_started_at: None,
            rescheduled: false,
        }
    }

    /// Back to `Pending` with a fresh attempt budget.
    pub fn reset(&mut self) {
        *self = Self::new(std::mem::take(&mut self.task));
    }
}

/// Overall status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Success,
    Failed,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Running => f.write_str("running"),
            RunStatus::Success => f.write_str("success"),
            RunStatus::Failed => f.write_str("failed"),
        }
    }
}

/// One attempt the scheduler wants the executor to run now.
#[derive(Debug, Clone)]
pub struct ScheduledTask {
    pub run_id: RunId,
    pub name: TaskName,
    pub kind: TaskKind,
    /// 1-based attempt number; results carrying another number are stale.
    pub attempt: u32,
    pub timeout: Option<Duration>,
    pub sensor: Option<SensorSpec>,
    /// Remaining sensor budget at dispatch time.
    pub sensor_remaining: Option<Duration>,
    pub context: TaskContext,
}
