// src/engine/runtime.rs

use std::fmt;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::dag::{RunSummary, ScheduledTask};
use crate::errors::Result;
use crate::exec::ExecutorBackend;
use crate::persist::{RunRecord, RunStore};

use super::core::CoreRuntime;
use super::{CoreCommand, CoreStep, RuntimeEvent, TaskRef};

/// Drives the scheduler in response to `RuntimeEvent`s and delegates
/// attempt execution to an `ExecutorBackend`.
///
/// This is a pure IO shell around `CoreRuntime`, which contains all the
/// runtime semantics. This struct handles async IO: reading events from
/// channels, dispatching attempts, arming wake-up timers and saving run
/// records.
pub struct Runtime<E: ExecutorBackend> {
    core: CoreRuntime,
    /// Used by wake-up timers to feed events back into the loop.
    event_tx: mpsc::Sender<RuntimeEvent>,
    event_rx: mpsc::Receiver<RuntimeEvent>,
    executor: E,
    store: Box<dyn RunStore>,
    resume: Vec<RunRecord>,
    summaries: Vec<RunSummary>,
}

impl<E: ExecutorBackend> fmt::Debug for Runtime<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("core", &self.core)
            .field("resume", &self.resume.len())
            .finish_non_exhaustive()
    }
}

impl<E: ExecutorBackend> Runtime<E> {
    pub fn new(
        core: CoreRuntime,
        event_tx: mpsc::Sender<RuntimeEvent>,
        event_rx: mpsc::Receiver<RuntimeEvent>,
        executor: E,
        store: Box<dyn RunStore>,
    ) -> Self {
        Self {
            core,
            event_tx,
            event_rx,
            executor,
            store,
            resume: Vec::new(),
            summaries: Vec::new(),
        }
    }

    /// Unfinished runs to pick up before handling any event.
    pub fn with_resume(mut self, records: Vec<RunRecord>) -> Self {
        self.resume = records;
        self
    }

    /// Main event loop.
    ///
    /// - Resumes persisted runs first.
    /// - Consumes `RuntimeEvent`s from `event_rx` and feeds them into the
    ///   core runtime.
    /// - Executes commands returned by the core (dispatch, cancel, timers,
    ///   persistence).
    ///
    /// Returns the summaries of every run that finished, in finishing order.
    pub async fn run(mut self) -> Result<Vec<RunSummary>> {
        info!(graph = self.core.graph().name(), "dagflow runtime started");

        let resume = std::mem::take(&mut self.resume);
        if !resume.is_empty() {
            info!(runs = resume.len(), "resuming unfinished runs");
            let step = self.core.resume(resume);
            // A trigger may already be waiting in the channel; only stop
            // here when there is nothing left to handle.
            if !self.execute_step(step).await? && self.event_rx.is_empty() {
                info!("nothing left to do after resume; stopping runtime");
                return Ok(self.summaries);
            }
        }

        loop {
            let event = match self.event_rx.recv().await {
                Some(e) => e,
                None => {
                    info!("runtime event channel closed; exiting");
                    break;
                }
            };

            debug!(?event, "runtime received event");

            let step = self.core.step(event);
            if !self.execute_step(step).await? {
                info!("core requested exit; stopping runtime");
                break;
            }
        }

        info!(finished_runs = self.summaries.len(), "runtime exiting");
        Ok(self.summaries)
    }

    /// Execute every command of a step. Returns whether to keep running.
    async fn execute_step(&mut self, step: CoreStep) -> Result<bool> {
        for command in step.commands {
            self.execute_command(command).await?;
        }
        Ok(step.keep_running)
    }

    /// Execute a single command from the core.
    async fn execute_command(&mut self, command: CoreCommand) -> Result<()> {
        match command {
            CoreCommand::DispatchTasks(tasks) => {
                self.spawn_ready(tasks).await?;
            }
            CoreCommand::CancelTasks(tasks) => {
                debug!(count = tasks.len(), "cancelling attempts");
                self.executor.cancel_tasks(tasks).await?;
            }
            CoreCommand::ScheduleWakeUp { task, delay } => {
                self.schedule_wake_up(task, delay);
            }
            CoreCommand::PersistRun(record) => {
                // The run continues in memory; a later save may succeed.
                if let Err(err) = self.store.save(&record) {
                    warn!(run_id = %record.run_id, error = %err, "failed to persist run record");
                }
            }
            CoreCommand::RunFinished(summary) => {
                info!(
                    run_id = %summary.run_id,
                    status = %summary.status,
                    failures = summary.failures.len(),
                    "run finished"
                );
                self.summaries.push(summary);
            }
            CoreCommand::RequestExit => {
                debug!("core issued RequestExit command");
            }
        }
        Ok(())
    }

    async fn spawn_ready(&mut self, tasks: Vec<ScheduledTask>) -> Result<()> {
        if tasks.is_empty() {
            return Ok(());
        }

        let names: Vec<_> = tasks
            .iter()
            .map(|t| format!("{}/{}#{}", t.run_id, t.name, t.attempt))
            .collect();
        debug!(?names, "dispatching ready attempts");

        self.executor.spawn_ready_tasks(tasks).await
    }

    fn schedule_wake_up(&self, task: TaskRef, delay: std::time::Duration) {
        debug!(run_id = %task.run_id, task = %task.task, ?delay, "arming wake-up timer");

        let tx = self.event_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let event = RuntimeEvent::WakeUp {
                run_id: task.run_id.clone(),
                task: task.task.clone(),
            };
            if tx.send(event).await.is_err() {
                debug!(run_id = %task.run_id, task = %task.task, "runtime gone; dropping wake-up");
            }
        });
    }
}
