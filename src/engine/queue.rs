// src/engine/queue.rs

use std::collections::VecDeque;

use tracing::{debug, warn};

use crate::engine::RunTrigger;
use crate::persist::RunRecord;
use crate::types::QueuedRunBehaviour;

/// A run waiting for an active-run slot.
#[derive(Debug, Clone)]
pub enum PendingRun {
    Fresh(RunTrigger),
    /// Unfinished run loaded from the run store.
    Resume(RunRecord),
}

impl PendingRun {
    pub fn run_id(&self) -> &str {
        match self {
            PendingRun::Fresh(trigger) => &trigger.run_id,
            PendingRun::Resume(record) => &record.run_id,
        }
    }
}

/// Runs that arrived while `max_active_runs` runs were in flight.
///
/// Semantics:
/// - `Queue`: every trigger is kept and started in arrival order.
/// - `Latest`: a new trigger replaces the fresh triggers already waiting.
///   Resumed runs are never dropped.
/// - `max_len` (optional) bounds the queue; when it is exceeded the oldest
///   entries are dropped with a warning.
#[derive(Debug)]
pub struct RunQueue {
    behaviour: QueuedRunBehaviour,
    max_len: Option<usize>,
    runs: VecDeque<PendingRun>,
}

impl RunQueue {
    /// `max_len` is clamped to at least 1.
    pub fn new(behaviour: QueuedRunBehaviour, max_len: Option<usize>) -> Self {
        Self {
            behaviour,
            max_len: max_len.map(|n| n.max(1)),
            runs: VecDeque::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn behaviour(&self) -> QueuedRunBehaviour {
        self.behaviour
    }

    pub fn contains(&self, run_id: &str) -> bool {
        self.runs.iter().any(|r| r.run_id() == run_id)
    }

    pub fn push(&mut self, run: PendingRun) {
        if self.behaviour == QueuedRunBehaviour::Latest && matches!(run, PendingRun::Fresh(_)) {
            let before = self.runs.len();
            self.runs.retain(|r| matches!(r, PendingRun::Resume(_)));
            if self.runs.len() < before {
                debug!(
                    dropped = before - self.runs.len(),
                    run_id = run.run_id(),
                    "replacing queued triggers with the latest one"
                );
            }
        }

        debug!(run_id = run.run_id(), queued = self.runs.len() + 1, "queued run");
        self.runs.push_back(run);

        if let Some(max_len) = self.max_len {
            if self.runs.len() > max_len {
                warn!(
                    queued = self.runs.len(),
                    max_len, "exceeded queue_length; dropping oldest queued runs"
                );
                while self.runs.len() > max_len {
                    self.runs.pop_front();
                }
            }
        }
    }

    pub fn pop(&mut self) -> Option<PendingRun> {
        self.runs.pop_front()
    }

    /// Drop a queued run. Returns whether it was queued.
    pub fn remove(&mut self, run_id: &str) -> bool {
        let before = self.runs.len();
        self.runs.retain(|r| r.run_id() != run_id);
        self.runs.len() < before
    }
}
