// src/engine/event_handlers.rs

//! Event handling logic for the core runtime.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::dag::{FailureCause, RunContext, RunSummary, ScheduledTask, SchedulerStep};
use crate::engine::core::CoreRuntime;
use crate::engine::queue::PendingRun;
use crate::engine::{AttemptOutcome, RunId, RunTrigger, TaskRef};
use crate::exchange::DEFAULT_KEY;
use crate::exec::task::TaskContext;
use crate::persist::RunRecord;
use crate::types::TaskKind;

/// Command produced by the pure core, to be executed by the outer IO shell.
#[derive(Debug, Clone)]
pub enum CoreCommand {
    /// Send these attempts to the executor.
    DispatchTasks(Vec<ScheduledTask>),
    /// Stop these running attempts (run aborted or shutting down).
    CancelTasks(Vec<TaskRef>),
    /// Deliver a `WakeUp` event for `task` after `delay`.
    ScheduleWakeUp { task: TaskRef, delay: Duration },
    /// Save this snapshot to the run store.
    PersistRun(RunRecord),
    /// A run reached a terminal status.
    RunFinished(RunSummary),
    /// Request that the process exits.
    RequestExit,
}

/// Decision returned by the core after handling a single `RuntimeEvent`.
#[derive(Debug, Clone)]
pub struct CoreStep {
    /// Commands the IO shell should execute, in order.
    pub commands: Vec<CoreCommand>,
    /// Whether the outer runtime loop should keep running.
    pub keep_running: bool,
}

impl CoreStep {
    /// Attempts dispatched in this step, flattened.
    pub fn dispatched(&self) -> Vec<&ScheduledTask> {
        self.commands
            .iter()
            .filter_map(|c| match c {
                CoreCommand::DispatchTasks(tasks) => Some(tasks.iter()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    /// Summaries of runs that finished in this step.
    pub fn finished_runs(&self) -> Vec<&RunSummary> {
        self.commands
            .iter()
            .filter_map(|c| match c {
                CoreCommand::RunFinished(summary) => Some(summary),
                _ => None,
            })
            .collect()
    }
}

impl CoreRuntime {
    /// Handle a run trigger.
    ///
    /// Duplicate run ids (active, queued, or finished in this process) are
    /// ignored; anything else is queued and started as soon as an
    /// active-run slot is free.
    pub(super) fn handle_run_triggered(&mut self, trigger: RunTrigger) -> CoreStep {
        let run_id = trigger.run_id.clone();

        if self.runs.contains_key(&run_id)
            || self.queue.contains(&run_id)
            || self.has_finished(&run_id)
        {
            info!(run_id = %run_id, reason = ?trigger.reason, "duplicate trigger for known run; ignoring");
        } else {
            debug!(run_id = %run_id, reason = ?trigger.reason, "run triggered");
            self.queue.push(PendingRun::Fresh(trigger));
        }

        self.finish_step(Vec::new(), BTreeSet::new())
    }

    pub(super) fn handle_attempt_finished(
        &mut self,
        run_id: &str,
        task: &str,
        attempt: u32,
        outcome: AttemptOutcome,
    ) -> CoreStep {
        let mut commands = Vec::new();
        let mut dirty = BTreeSet::new();
        let task_ref = TaskRef::new(run_id, task);

        if self.running.get(&task_ref) == Some(&attempt) {
            self.running.remove(&task_ref);
        }

        let kind = self.graph.node(task).map(|n| n.kind);
        let Some(run) = self.runs.get_mut(run_id) else {
            debug!(run_id, task, attempt, "result for inactive run; ignoring");
            return self.finish_step(commands, dirty);
        };

        let step = match outcome {
            AttemptOutcome::Succeeded {
                value,
                entries,
                chosen,
            } => {
                let choice = match (kind, chosen) {
                    (Some(TaskKind::Branch), Some(chosen)) => {
                        run.validate_choice(task, &chosen).map(Some)
                    }
                    (Some(TaskKind::Branch), None) => Err(FailureCause::fatal(format!(
                        "branch '{task}' finished without choosing a task"
                    ))),
                    _ => Ok(None),
                };

                match choice {
                    Ok(chosen) => {
                        let step = run.complete_success(task, attempt, DEFAULT_KEY, chosen.as_deref());
                        if step.is_some() {
                            self.exchange.put(run_id, task, DEFAULT_KEY, value, attempt);
                            for (key, value) in entries {
                                self.exchange.put(run_id, task, &key, value, attempt);
                            }
                        }
                        step
                    }
                    Err(cause) => run.complete_failure(task, attempt, cause),
                }
            }
            AttemptOutcome::NotReady => run.sensor_not_ready(task, attempt),
            AttemptOutcome::Failed(cause) => run.complete_failure(task, attempt, cause),
        };

        if let Some(step) = step {
            dirty.insert(run_id.to_string());
            self.absorb(run_id, Some(task), step, &mut commands);
        }

        self.finish_step(commands, dirty)
    }

    pub(super) fn handle_wake_up(&mut self, run_id: &str, task: &str) -> CoreStep {
        let mut dirty = BTreeSet::new();

        let woken = self
            .runs
            .get_mut(run_id)
            .is_some_and(|run| run.wake(task));

        if woken {
            debug!(run_id, task, "woken up; re-queued");
            self.ready.push_back(TaskRef::new(run_id, task));
            dirty.insert(run_id.to_string());
        } else {
            debug!(run_id, task, "stale wake-up; ignoring");
        }

        self.finish_step(Vec::new(), dirty)
    }

    /// Abort a run: every non-terminal instance fails with a `Cancelled`
    /// cause and running attempts are cancelled. Repeated aborts are no-ops.
    pub(super) fn handle_abort(&mut self, run_id: &str, reason: &str) -> CoreStep {
        let mut commands = Vec::new();
        let mut dirty = BTreeSet::new();

        if let Some(run) = self.runs.get_mut(run_id) {
            let running = run.abort(reason);
            let refs: Vec<TaskRef> = running
                .iter()
                .map(|task| TaskRef::new(run_id, task))
                .collect();
            for task_ref in &refs {
                self.running.remove(task_ref);
            }
            self.ready.retain(|r| r.run_id != run_id);
            if !refs.is_empty() {
                commands.push(CoreCommand::CancelTasks(refs));
            }
            dirty.insert(run_id.to_string());
        } else if self.queue.remove(run_id) {
            info!(run_id, reason, "queued run aborted before it started");
        } else {
            debug!(run_id, "abort for unknown or finished run; ignoring");
        }

        self.finish_step(commands, dirty)
    }

    /// Stop everything. Active runs are persisted as they are so the next
    /// process can resume them.
    pub(super) fn handle_shutdown(&mut self) -> CoreStep {
        info!(active_runs = self.runs.len(), running = self.running.len(), "shutdown requested");

        let mut commands = Vec::new();
        let running: Vec<TaskRef> = self.running.drain().map(|(r, _)| r).collect();
        if !running.is_empty() {
            commands.push(CoreCommand::CancelTasks(running));
        }
        for run in self.runs.values() {
            commands.push(CoreCommand::PersistRun(
                run.to_record(self.exchange.entries(run.run_id())),
            ));
        }
        commands.push(CoreCommand::RequestExit);

        CoreStep {
            commands,
            keep_running: false,
        }
    }

    /// Turn a run transition into queue entries and wake-up commands.
    fn absorb(
        &mut self,
        run_id: &str,
        task: Option<&str>,
        step: SchedulerStep,
        commands: &mut Vec<CoreCommand>,
    ) {
        for name in step.newly_queued {
            self.ready.push_back(TaskRef::new(run_id, &name));
        }
        if let (Some(task), Some(delay)) = (task, step.wake_after) {
            commands.push(CoreCommand::ScheduleWakeUp {
                task: TaskRef::new(run_id, task),
                delay,
            });
        }
    }

    /// Common tail of every event: start queued runs, fill free slots,
    /// archive finished runs, persist what changed and decide whether to
    /// keep running.
    pub(super) fn finish_step(
        &mut self,
        mut commands: Vec<CoreCommand>,
        mut dirty: BTreeSet<RunId>,
    ) -> CoreStep {
        loop {
            self.start_queued_runs(&mut commands, &mut dirty);
            self.dispatch_ready(&mut commands, &mut dirty);
            if self.archive_finished(&mut commands, &mut dirty) == 0 {
                break;
            }
        }

        for run_id in dirty {
            if let Some(run) = self.runs.get(&run_id) {
                commands.push(CoreCommand::PersistRun(
                    run.to_record(self.exchange.entries(&run_id)),
                ));
            }
        }

        let mut keep_running = true;
        if self.options.exit_when_idle && self.is_idle() && self.running.is_empty() {
            keep_running = false;
            commands.push(CoreCommand::RequestExit);
        }

        CoreStep {
            commands,
            keep_running,
        }
    }

    fn start_queued_runs(&mut self, commands: &mut Vec<CoreCommand>, dirty: &mut BTreeSet<RunId>) {
        while self.runs.len() < self.options.max_active_runs {
            let Some(pending) = self.queue.pop() else {
                break;
            };

            let mut run = match pending {
                PendingRun::Fresh(trigger) => {
                    info!(run_id = %trigger.run_id, reason = ?trigger.reason, "starting run");
                    RunContext::new(Arc::clone(&self.graph), trigger.run_id, trigger.params)
                }
                PendingRun::Resume(record) => {
                    info!(
                        run_id = %record.run_id,
                        rerun_failed = self.options.rerun_failed,
                        "resuming run"
                    );
                    self.exchange.restore(&record.run_id, record.exchange.clone());
                    RunContext::from_record(
                        Arc::clone(&self.graph),
                        &record,
                        self.options.rerun_failed,
                    )
                }
            };

            let run_id = run.run_id().to_string();
            let step = run.evaluate();
            self.runs.insert(run_id.clone(), run);
            self.absorb(&run_id, None, step, commands);
            dirty.insert(run_id);
        }
    }

    /// Start queued instances, oldest first, while slots are free.
    fn dispatch_ready(&mut self, commands: &mut Vec<CoreCommand>, dirty: &mut BTreeSet<RunId>) {
        let mut dispatched = Vec::new();

        while self.running.len() < self.options.max_parallel_tasks {
            let Some(task_ref) = self.ready.pop_front() else {
                break;
            };
            let Some(node) = self.graph.node(&task_ref.task) else {
                continue;
            };
            let Some(run) = self.runs.get_mut(&task_ref.run_id) else {
                continue;
            };
            let Some(attempt) = run.mark_running(&task_ref.task) else {
                continue;
            };

            debug!(
                run_id = %task_ref.run_id,
                task = %task_ref.task,
                attempt,
                running = self.running.len() + 1,
                "dispatching attempt"
            );

            dispatched.push(ScheduledTask {
                run_id: task_ref.run_id.clone(),
                name: task_ref.task.clone(),
                kind: node.kind,
                attempt,
                timeout: node.retry.per_attempt_timeout,
                sensor: node.sensor,
                sensor_remaining: run.sensor_remaining(&task_ref.task),
                context: TaskContext {
                    run_id: task_ref.run_id.clone(),
                    task: task_ref.task.clone(),
                    attempt,
                    params: Arc::new(run.params().clone()),
                    upstream: node.upstream.clone(),
                    exchange: self.exchange.view(&task_ref.run_id),
                },
            });
            dirty.insert(task_ref.run_id.clone());
            self.running.insert(task_ref, attempt);
        }

        if !dispatched.is_empty() {
            commands.push(CoreCommand::DispatchTasks(dispatched));
        }
    }

    /// Persist, report and forget every finished run. Returns how many
    /// runs were archived.
    fn archive_finished(
        &mut self,
        commands: &mut Vec<CoreCommand>,
        dirty: &mut BTreeSet<RunId>,
    ) -> usize {
        let finished: Vec<RunId> = self
            .runs
            .values()
            .filter(|r| r.is_finished())
            .map(|r| r.run_id().to_string())
            .collect();

        for run_id in &finished {
            let Some(run) = self.runs.remove(run_id) else {
                continue;
            };
            let summary = run.summary();
            if summary.is_success() {
                info!(run_id = %run_id, "run succeeded");
            } else {
                warn!(
                    run_id = %run_id,
                    failed = ?summary.failures.iter().map(|f| f.task.as_str()).collect::<Vec<_>>(),
                    "run failed"
                );
            }

            commands.push(CoreCommand::PersistRun(
                run.to_record(self.exchange.entries(run_id)),
            ));
            commands.push(CoreCommand::RunFinished(summary));

            self.exchange.drop_run(run_id);
            self.ready.retain(|r| &r.run_id != run_id);
            self.remember_finished(run_id.clone());
            dirty.remove(run_id);
        }

        finished.len()
    }
}
