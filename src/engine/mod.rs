// src/engine/mod.rs

//! Orchestration engine for dagflow.
//!
//! This module ties together:
//! - the per-run state machines (one [`RunContext`] per active run)
//! - the run queue (what happens when triggers arrive while
//!   `max_active_runs` runs are in flight)
//! - the main runtime event loop that reacts to:
//!   - run triggers
//!   - attempt results
//!   - retry / reschedule wake-ups
//!   - run aborts and shutdown signals
//!
//! The pure core state machine lives in [`core`] and [`event_handlers`];
//! the async/IO shell is implemented in [`runtime`].
//!
//! [`RunContext`]: crate::dag::RunContext

use std::collections::BTreeMap;

use serde_json::Value;

use crate::dag::FailureCause;

/// Canonical task name type used throughout the engine.
pub type TaskName = String;

/// Execution identifier of a run, typically a logical date (`2025-04-29`).
pub type RunId = String;

/// Override parameters supplied with a trigger.
pub type Params = BTreeMap<String, Value>;

/// A task within a specific run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskRef {
    pub run_id: RunId,
    pub task: TaskName,
}

impl TaskRef {
    pub fn new(run_id: &str, task: &str) -> Self {
        Self {
            run_id: run_id.to_string(),
            task: task.to_string(),
        }
    }
}

/// Why a run was triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerReason {
    /// Triggered by a time-based schedule.
    Schedule,
    /// Manual trigger (e.g. the CLI).
    Manual,
    /// Triggered by another system.
    External,
}

/// Request to start a run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunTrigger {
    pub run_id: RunId,
    pub params: Params,
    pub reason: TriggerReason,
}

impl RunTrigger {
    pub fn new(run_id: impl Into<RunId>, reason: TriggerReason) -> Self {
        Self {
            run_id: run_id.into(),
            params: Params::new(),
            reason,
        }
    }

    pub fn manual(run_id: impl Into<RunId>) -> Self {
        Self::new(run_id, TriggerReason::Manual)
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }
}

/// Result of one attempt, as reported by the executor.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    Succeeded {
        value: Value,
        entries: Vec<(String, Value)>,
        /// Set by branch tasks.
        chosen: Option<TaskName>,
    },
    /// A reschedule-mode sensor poked and its condition did not hold.
    NotReady,
    Failed(FailureCause),
}

impl AttemptOutcome {
    pub fn success(value: impl Into<Value>) -> Self {
        AttemptOutcome::Succeeded {
            value: value.into(),
            entries: Vec::new(),
            chosen: None,
        }
    }

    pub fn branch(chosen: impl Into<TaskName>) -> Self {
        let chosen = chosen.into();
        AttemptOutcome::Succeeded {
            value: Value::String(chosen.clone()),
            entries: Vec::new(),
            chosen: Some(chosen),
        }
    }
}

/// Runtime options used by both the core and the async shell.
#[derive(Debug, Clone, Copy)]
pub struct RuntimeOptions {
    /// Exit the runtime once no run is active or queued.
    pub exit_when_idle: bool,
    /// Cap on `Running` task instances across all runs.
    pub max_parallel_tasks: usize,
    /// Cap on runs in flight; further triggers are queued.
    pub max_active_runs: usize,
    /// When resuming a run, also reset its failed task instances.
    pub rerun_failed: bool,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            exit_when_idle: true,
            max_parallel_tasks: 4,
            max_active_runs: 1,
            rerun_failed: false,
        }
    }
}

/// Events flowing into the runtime from triggers, executors and timers.
#[derive(Debug, Clone)]
pub enum RuntimeEvent {
    /// Start (or queue) a run.
    RunTriggered(RunTrigger),
    /// An attempt finished with a concrete outcome.
    AttemptFinished {
        run_id: RunId,
        task: TaskName,
        attempt: u32,
        outcome: AttemptOutcome,
    },
    /// A retry backoff or reschedule interval elapsed.
    WakeUp { run_id: RunId, task: TaskName },
    /// Fail every non-terminal task of a run.
    AbortRun { run_id: RunId, reason: String },
    /// Graceful shutdown requested (e.g. Ctrl-C).
    ShutdownRequested,
}

pub mod core;
pub mod event_handlers;
pub mod queue;
pub mod runtime;

pub use core::CoreRuntime;
pub use event_handlers::{CoreCommand, CoreStep};
pub use queue::{PendingRun, RunQueue};
pub use runtime::Runtime;
