use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Capability tag of a task node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    /// Runs its logic once per attempt.
    #[default]
    Plain,
    /// Polls an external condition until it holds or a deadline passes.
    Sensor,
    /// Selects exactly one downstream node and prunes the others.
    Branch,
    /// Terminal load task that upserts rows into a sink.
    Sink,
}

/// Predicate over upstream task states that gates a task's readiness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerRule {
    /// Every upstream succeeded.
    #[default]
    AllSuccess,
    /// Every upstream reached a terminal state, whatever the outcome.
    AllDone,
    /// Every upstream is terminal and none of them failed. Skipped
    /// upstreams are accepted.
    NoneFailed,
}

impl FromStr for TriggerRule {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "all_success" => Ok(TriggerRule::AllSuccess),
            "all_done" => Ok(TriggerRule::AllDone),
            "none_failed" => Ok(TriggerRule::NoneFailed),
            other => Err(format!(
                "invalid trigger_rule: {other} (expected \"all_success\", \"all_done\" or \"none_failed\")"
            )),
        }
    }
}

/// How a sensor waits between pokes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorMode {
    /// Hold the execution slot for the entire wait.
    #[default]
    Poke,
    /// Release the slot between pokes and re-queue after `poke_interval`.
    Reschedule,
}

/// How the delay between retry attempts grows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    /// Same delay before every retry.
    #[default]
    Constant,
    /// Delay doubles after every failed attempt.
    Exponential,
}

/// Behaviour when a new run is triggered while `max_active_runs` runs are
/// already in flight.
///
/// - `Queue`: remember every trigger and start them in order as active runs
///   finish (default).
/// - `Latest`: keep only the most recent queued trigger; older queued
///   triggers are dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueuedRunBehaviour {
    #[default]
    Queue,
    Latest,
}

impl FromStr for QueuedRunBehaviour {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "queue" => Ok(QueuedRunBehaviour::Queue),
            "latest" => Ok(QueuedRunBehaviour::Latest),
            other => Err(format!(
                "invalid queued_run_behaviour: {other} (expected \"queue\" or \"latest\")"
            )),
        }
    }
}

/// Where run records are persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateStorageMode {
    /// Store run records as JSON files under `<state_dir>/runs`.
    #[default]
    File,
    /// Keep run records in memory only (lost on restart).
    Memory,
}
