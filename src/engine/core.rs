// src/engine/core.rs

//! Pure core runtime state machine.
//!
//! This module contains a synchronous, deterministic "core runtime" that
//! consumes [`RuntimeEvent`]s and produces:
//! - an updated core state
//! - a list of "commands" describing what the IO shell should do next
//!
//! The async/IO-heavy shell (`engine::runtime::Runtime`) is responsible for:
//! - reading events from channels
//! - sending `ScheduledTask`s to the executor
//! - wake-up timers, persistence and Ctrl+C handling
//!
//! The core is unit tested without any Tokio, channels, filesystem, or
//! processes.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use crate::dag::{Graph, RunContext};
use crate::engine::event_handlers::CoreStep;
use crate::engine::queue::{PendingRun, RunQueue};
use crate::engine::{RunId, RuntimeEvent, RuntimeOptions, TaskRef};
use crate::exchange::ExchangeStore;
use crate::persist::RunRecord;

/// How many finished run ids are kept for duplicate-trigger detection.
pub const FINISHED_RUNS_REMEMBERED: usize = 256;

/// Pure core runtime state.
///
/// This owns:
/// - the graph shared by every run
/// - the active run contexts and the run queue
/// - the exchange store
/// - the FIFO of queued task instances and the running-slot bookkeeping
///
/// It has **no** channels, no Tokio types, and does not perform any IO.
#[derive(Debug)]
pub struct CoreRuntime {
    pub(super) graph: Arc<Graph>,
    pub(super) options: RuntimeOptions,
    pub(super) runs: BTreeMap<RunId, RunContext>,
    /// Most recently finished runs; later triggers for them are ignored.
    /// Holds at most [`FINISHED_RUNS_REMEMBERED`] ids, oldest evicted first.
    pub(super) finished: HashSet<RunId>,
    pub(super) finished_order: VecDeque<RunId>,
    pub(super) queue: RunQueue,
    pub(super) exchange: ExchangeStore,
    /// Task instances in `Queued` state, in the order they became ready.
    pub(super) ready: VecDeque<TaskRef>,
    /// Instances holding a concurrency slot, with their attempt number.
    pub(super) running: HashMap<TaskRef, u32>,
}

impl CoreRuntime {
    pub fn new(graph: Arc<Graph>, queue: RunQueue, options: RuntimeOptions) -> Self {
        let options = RuntimeOptions {
            max_parallel_tasks: options.max_parallel_tasks.max(1),
            max_active_runs: options.max_active_runs.max(1),
            ..options
        };

        Self {
            graph,
            options,
            runs: BTreeMap::new(),
            finished: HashSet::new(),
            finished_order: VecDeque::new(),
            queue,
            exchange: ExchangeStore::new(),
            ready: VecDeque::new(),
            running: HashMap::new(),
        }
    }

    pub fn graph(&self) -> &Arc<Graph> {
        &self.graph
    }

    /// No run is active or queued.
    pub fn is_idle(&self) -> bool {
        self.runs.is_empty() && self.queue.is_empty()
    }

    /// Expose queue emptiness (for tests).
    pub fn queue_is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn active_runs(&self) -> impl Iterator<Item = &RunContext> {
        self.runs.values()
    }

    pub fn run(&self, run_id: &str) -> Option<&RunContext> {
        self.runs.get(run_id)
    }

    /// Number of task instances currently holding a slot.
    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    /// Whether `run_id` finished recently in this process.
    pub fn has_finished(&self, run_id: &str) -> bool {
        self.finished.contains(run_id)
    }

    pub(super) fn remember_finished(&mut self, run_id: RunId) {
        if !self.finished.insert(run_id.clone()) {
            return;
        }
        self.finished_order.push_back(run_id);
        while self.finished_order.len() > FINISHED_RUNS_REMEMBERED {
            if let Some(oldest) = self.finished_order.pop_front() {
                self.finished.remove(&oldest);
            }
        }
    }

    /// Queue persisted runs for resumption and start as many as allowed.
    pub fn resume(&mut self, records: Vec<RunRecord>) -> CoreStep {
        for record in records {
            if self.runs.contains_key(&record.run_id) || self.queue.contains(&record.run_id) {
                continue;
            }
            self.queue.push(PendingRun::Resume(record));
        }
        self.finish_step(Vec::new(), BTreeSet::new())
    }

    /// Handle a single runtime event, updating core state and returning the
    /// resulting commands for the IO shell.
    pub fn step(&mut self, event: RuntimeEvent) -> CoreStep {
        match event {
            RuntimeEvent::RunTriggered(trigger) => self.handle_run_triggered(trigger),
            RuntimeEvent::AttemptFinished {
                run_id,
                task,
                attempt,
                outcome,
            } => self.handle_attempt_finished(&run_id, &task, attempt, outcome),
            RuntimeEvent::WakeUp { run_id, task } => self.handle_wake_up(&run_id, &task),
            RuntimeEvent::AbortRun { run_id, reason } => self.handle_abort(&run_id, &reason),
            RuntimeEvent::ShutdownRequested => self.handle_shutdown(),
        }
    }
}
