// src/dag/scheduler_step.rs

//! Result type for a single run state transition.

use std::time::Duration;

use crate::engine::TaskName;

/// Structured result of a single transition on a [`RunContext`].
///
/// Tests use it to step a run by hand and assert on what changed; the core
/// runtime turns it into commands.
///
/// [`RunContext`]: crate::dag::RunContext
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerStep {
    /// Tasks whose trigger rule became satisfied (now `Queued`).
    pub newly_queued: Vec<TaskName>,
    /// Tasks marked `UpstreamFailed` in this step.
    pub newly_failed: Vec<TaskName>,
    /// Tasks marked `Skipped` in this step.
    pub newly_skipped: Vec<TaskName>,
    /// The transitioned task has to be woken up after this delay (retry
    /// backoff or reschedule poke interval).
    pub wake_after: Option<Duration>,
    /// Every instance of the run is now terminal.
    pub run_just_finished: bool,
}

impl SchedulerStep {
    pub fn merge(&mut self, other: SchedulerStep) {
        self.newly_queued.extend(other.newly_queued);
        self.newly_failed.extend(other.newly_failed);
        self.newly_skipped.extend(other.newly_skipped);
        self.wake_after = self.wake_after.or(other.wake_after);
        self.run_just_finished |= other.run_just_finished;
    }
}
