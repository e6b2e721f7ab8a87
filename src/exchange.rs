// src/exchange.rs

//! Run-scoped store for values passed between tasks.
//!
//! Entries are keyed by `(run_id, producing task, key)`. The scheduler only
//! writes when an attempt succeeds, so everything in the store comes from a
//! successful task instance. Attempts read through an [`ExchangeView`], a
//! cheap snapshot taken when the attempt is dispatched.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::engine::{RunId, TaskName};

/// Key under which a task's return value is published.
pub const DEFAULT_KEY: &str = "return_value";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExchangeError {
    #[error("no value for key '{key}' from task '{task}' in run '{run_id}'")]
    MissingEntry {
        run_id: RunId,
        task: TaskName,
        key: String,
    },
}

/// One published value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeEntry {
    pub task: TaskName,
    pub key: String,
    pub value: Arc<Value>,
    /// Attempt of the producing task that wrote the value.
    pub attempt: u32,
    /// Store-wide write sequence; later writes have larger numbers.
    pub seq: u64,
}

type RunEntries = BTreeMap<(TaskName, String), ExchangeEntry>;

/// In-memory exchange store shared by all runs of one runtime.
#[derive(Debug, Default)]
pub struct ExchangeStore {
    runs: HashMap<RunId, Arc<RunEntries>>,
    next_seq: u64,
}

impl ExchangeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a value, superseding whatever the same task wrote under the
    /// same key before.
    pub fn put(&mut self, run_id: &str, task: &str, key: &str, value: Value, attempt: u32) {
        let seq = self.next_seq;
        self.next_seq += 1;

        let entries = self.runs.entry(run_id.to_string()).or_default();
        let previous = Arc::make_mut(entries).insert(
            (task.to_string(), key.to_string()),
            ExchangeEntry {
                task: task.to_string(),
                key: key.to_string(),
                value: Arc::new(value),
                attempt,
                seq,
            },
        );

        if let Some(previous) = previous {
            debug!(
                run_id,
                task,
                key,
                previous_attempt = previous.attempt,
                attempt,
                "superseding exchange value"
            );
        }
    }

    pub fn get(&self, run_id: &str, task: &str, key: &str) -> Result<Arc<Value>, ExchangeError> {
        self.runs
            .get(run_id)
            .and_then(|entries| entries.get(&(task.to_string(), key.to_string())))
            .map(|e| Arc::clone(&e.value))
            .ok_or_else(|| ExchangeError::MissingEntry {
                run_id: run_id.to_string(),
                task: task.to_string(),
                key: key.to_string(),
            })
    }

    /// Snapshot of a run's entries. Later writes are not visible through it.
    pub fn view(&self, run_id: &str) -> ExchangeView {
        ExchangeView {
            run_id: run_id.to_string(),
            entries: self.runs.get(run_id).cloned().unwrap_or_default(),
        }
    }

    /// All entries of a run, for persistence.
    pub fn entries(&self, run_id: &str) -> Vec<ExchangeEntry> {
        self.runs
            .get(run_id)
            .map(|entries| entries.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Load persisted entries of a resumed run.
    pub fn restore(&mut self, run_id: &str, entries: Vec<ExchangeEntry>) {
        let run = Arc::make_mut(self.runs.entry(run_id.to_string()).or_default());
        for entry in entries {
            self.next_seq = self.next_seq.max(entry.seq + 1);
            run.insert((entry.task.clone(), entry.key.clone()), entry);
        }
    }

    /// Forget a run once it has been archived.
    pub fn drop_run(&mut self, run_id: &str) {
        self.runs.remove(run_id);
    }
}

/// Read-only snapshot of one run's exchange entries.
#[derive(Debug, Clone, Default)]
pub struct ExchangeView {
    run_id: RunId,
    entries: Arc<RunEntries>,
}

impl ExchangeView {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn pull(&self, task: &str, key: &str) -> Result<Arc<Value>, ExchangeError> {
        self.entries
            .get(&(task.to_string(), key.to_string()))
            .map(|e| Arc::clone(&e.value))
            .ok_or_else(|| ExchangeError::MissingEntry {
                run_id: self.run_id.clone(),
                task: task.to_string(),
                key: key.to_string(),
            })
    }

    /// Return value of `task`.
    pub fn return_value(&self, task: &str) -> Result<Arc<Value>, ExchangeError> {
        self.pull(task, DEFAULT_KEY)
    }

    /// Most recently written value for `key`, from any task of the run.
    pub fn pull_latest(&self, key: &str) -> Option<Arc<Value>> {
        self.entries
            .values()
            .filter(|e| e.key == key)
            .max_by_key(|e| e.seq)
            .map(|e| Arc::clone(&e.value))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
