// src/dag/run.rs

//! Per-run state machine.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::dag::graph::Graph;
use crate::dag::instance::{FailureCause, RunStatus, TaskInstance, TaskState};
use crate::dag::readiness::Readiness;
use crate::dag::scheduler_step::SchedulerStep;
use crate::engine::{Params, RunId, TaskName};
use crate::exchange::ExchangeEntry;
use crate::persist::RunRecord;
use crate::types::{TaskKind, TriggerRule};

/// A task that ended the run in a failed state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFailure {
    pub task: TaskName,
    pub state: TaskState,
    pub attempts: u32,
    /// `None` for `UpstreamFailed` tasks that never ran.
    pub cause: Option<FailureCause>,
}

/// Final (or current) outcome of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub run_id: RunId,
    pub status: RunStatus,
    pub failures: Vec<TaskFailure>,
    pub states: BTreeMap<TaskName, TaskState>,
}

impl RunSummary {
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Success
    }

    pub fn state_of(&self, task: &str) -> Option<TaskState> {
        self.states.get(task).copied()
    }
}

/// All task instances of one invocation of a graph.
///
/// It is responsible for:
/// - deciding which `Pending` tasks are ready, skipped or upstream-failed
/// - applying attempt results (success, retry, failure, sensor reschedule)
/// - pruning the branches a branch task did not choose
/// - aborting the run
///
/// Every transition that takes an attempt number ignores results that do
/// not belong to the instance's current `Running` attempt.
#[derive(Debug, Clone)]
pub struct RunContext {
    run_id: RunId,
    graph: Arc<Graph>,
    params: Params,
    instances: BTreeMap<TaskName, TaskInstance>,
    status: RunStatus,
    created_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    /// Monotonic start of each sensor's current attempt. Not persisted; a
    /// resumed sensor starts a fresh attempt.
    sensor_clocks: BTreeMap<TaskName, Instant>,
}

impl RunContext {
    pub fn new(graph: Arc<Graph>, run_id: impl Into<RunId>, params: Params) -> Self {
        let instances = graph
            .tasks()
            .map(|name| (name.to_string(), TaskInstance::new(name)))
            .collect();

        Self {
            run_id: run_id.into(),
            graph,
            params,
            instances,
            status: RunStatus::Running,
            created_at: Utc::now(),
            finished_at: None,
            sensor_clocks: BTreeMap::new(),
        }
    }

    /// Rebuild a run from its persisted record.
    ///
    /// Terminal instances keep their state so successful tasks never run
    /// twice. Instances that were in flight go back to `Pending`; with
    /// `rerun_failed`, so do `Failed` and `UpstreamFailed` ones.
    pub fn from_record(graph: Arc<Graph>, record: &RunRecord, rerun_failed: bool) -> Self {
        let mut instances = BTreeMap::new();

        for name in graph.tasks() {
            let mut instance = record
                .instances
                .get(name)
                .cloned()
                .unwrap_or_else(|| TaskInstance::new(name));

            if instance.state.is_in_flight()
                || instance.state == TaskState::Pending
                || (rerun_failed && instance.state.is_failed())
            {
                instance.reset();
            }
            instances.insert(name.to_string(), instance);
        }

        let mut run = Self {
            run_id: record.run_id.clone(),
            graph,
            params: record.params.clone(),
            instances,
            status: RunStatus::Running,
            created_at: record.created_at,
            finished_at: None,
            sensor_clocks: BTreeMap::new(),
        };

        if run.all_terminal() {
            run.status = run.final_status();
            run.finished_at = record.finished_at.or(Some(Utc::now()));
        }

        run
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn graph(&self) -> &Arc<Graph> {
        &self.graph
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    pub fn is_finished(&self) -> bool {
        self.status != RunStatus::Running
    }

    pub fn instance(&self, task: &str) -> Option<&TaskInstance> {
        self.instances.get(task)
    }

    pub fn state_of(&self, task: &str) -> Option<TaskState> {
        self.instances.get(task).map(|i| i.state)
    }

    pub fn instances(&self) -> impl Iterator<Item = &TaskInstance> {
        self.instances.values()
    }

    /// Resolve every `Pending` task whose trigger rule can be decided.
    ///
    /// A single pass in topological order is enough: upstream decisions made
    /// earlier in the pass are visible to their dependents.
    pub fn evaluate(&mut self) -> SchedulerStep {
        let mut step = SchedulerStep::default();
        if self.is_finished() {
            return step;
        }

        let graph = Arc::clone(&self.graph);
        let now = Utc::now();

        for name in graph.topological_order() {
            if self.state_of(name) != Some(TaskState::Pending) {
                continue;
            }
            let Some(node) = graph.node(name) else {
                continue;
            };

            let readiness = node.trigger_rule.evaluate(
                node.upstream
                    .iter()
                    .filter_map(|up| self.instances.get(up).map(|i| i.state)),
            );

            let Some(instance) = self.instances.get_mut(name) else {
                continue;
            };

            match readiness {
                Readiness::Wait => {}
                Readiness::Ready => {
                    instance.state = TaskState::Queued;
                    debug!(run_id = %self.run_id, task = %name, "trigger rule satisfied; queued");
                    step.newly_queued.push(name.to_string());
                }
                Readiness::Skip => {
                    instance.state = TaskState::Skipped;
                    instance.ended_at = Some(now);
                    debug!(run_id = %self.run_id, task = %name, "upstream skipped; skipping");
                    step.newly_skipped.push(name.to_string());
                }
                Readiness::UpstreamFailed => {
                    instance.state = TaskState::UpstreamFailed;
                    instance.ended_at = Some(now);
                    info!(run_id = %self.run_id, task = %name, "upstream failed; marking upstream_failed");
                    step.newly_failed.push(name.to_string());
                }
            }
        }

        step.run_just_finished = self.maybe_finish();
        step
    }

    /// Move a `Queued` task to `Running` and return its attempt number.
    ///
    /// A reschedule poke continues the current attempt instead of starting a
    /// new one.
    pub fn mark_running(&mut self, task: &str) -> Option<u32> {
        let is_sensor = self.graph.node(task)?.kind == TaskKind::Sensor;
        let instance = self.instances.get_mut(task)?;
        if instance.state != TaskState::Queued {
            return None;
        }

        let now = Utc::now();
        if instance.rescheduled {
            instance.rescheduled = false;
        } else {
            instance.attempts += 1;
            instance.started_at = Some(now);
            instance.ended_at = None;
            instance.sensor_started_at = None;
            self.sensor_clocks.remove(task);
        }
        if is_sensor && !self.sensor_clocks.contains_key(task) {
            instance.sensor_started_at = Some(now);
            self.sensor_clocks.insert(task.to_string(), Instant::now());
        }

        instance.state = TaskState::Running;
        Some(instance.attempts)
    }

    /// Remaining budget of a sensor's current attempt.
    pub fn sensor_remaining(&self, task: &str) -> Option<Duration> {
        let spec = self.graph.node(task)?.sensor?;
        let started = self.sensor_clocks.get(task)?;
        Some(spec.timeout.saturating_sub(started.elapsed()))
    }

    /// A branch may only choose one of its direct downstream tasks, or a
    /// group with members among them. Returns the tasks the choice keeps.
    pub fn validate_choice(&self, branch: &str, chosen: &str) -> Result<Vec<TaskName>, FailureCause> {
        self.graph.branch_targets(branch, chosen).ok_or_else(|| {
            FailureCause::fatal(format!(
                "branch '{branch}' chose '{chosen}', which is not one of its downstream tasks or groups"
            ))
        })
    }

    /// Record a successful attempt. Returns `None` for stale results.
    pub fn complete_success(
        &mut self,
        task: &str,
        attempt: u32,
        result_key: impl Into<String>,
        chosen: Option<&[TaskName]>,
    ) -> Option<SchedulerStep> {
        let instance = self.current_attempt_mut(task, attempt)?;
        instance.state = TaskState::Success;
        instance.ended_at = Some(Utc::now());
        instance.result_key = Some(result_key.into());
        info!(run_id = %self.run_id, task, attempt, "task succeeded");

        let mut step = SchedulerStep::default();
        if let Some(chosen) = chosen {
            step.newly_skipped = self.apply_branch(task, chosen);
        }
        step.merge(self.evaluate());
        Some(step)
    }

    /// Record a failed attempt. Returns `None` for stale results.
    ///
    /// The task either goes `UpForRetry` (with `wake_after` set to the
    /// backoff delay) or `Failed`.
    pub fn complete_failure(
        &mut self,
        task: &str,
        attempt: u32,
        cause: FailureCause,
    ) -> Option<SchedulerStep> {
        let retry = self.graph.node(task)?.retry;
        let run_id = self.run_id.clone();
        let instance = self.current_attempt_mut(task, attempt)?;

        let retry_allowed = cause.allows_retry(&retry) && instance.attempts < retry.max_attempts;
        instance.last_error = Some(cause.clone());
        instance.sensor_started_at = None;

        let retry_delay = if retry_allowed {
            instance.state = TaskState::UpForRetry;
            Some(retry.delay_for(instance.attempts))
        } else {
            instance.state = TaskState::Failed;
            instance.ended_at = Some(Utc::now());
            None
        };
        self.sensor_clocks.remove(task);

        if let Some(delay) = retry_delay {
            warn!(
                run_id = %run_id,
                task,
                attempt,
                max_attempts = retry.max_attempts,
                ?delay,
                cause = %cause,
                "attempt failed; will retry"
            );
            return Some(SchedulerStep {
                wake_after: Some(delay),
                ..SchedulerStep::default()
            });
        }

        warn!(run_id = %run_id, task, attempt, cause = %cause, "task failed");
        Some(self.evaluate())
    }

    /// A reschedule-mode sensor poked and its condition did not hold yet.
    pub fn sensor_not_ready(&mut self, task: &str, attempt: u32) -> Option<SchedulerStep> {
        let interval = self.graph.node(task)?.sensor?.poke_interval;
        let instance = self.current_attempt_mut(task, attempt)?;
        instance.state = TaskState::UpForReschedule;
        instance.rescheduled = true;
        debug!(run_id = %self.run_id, task, attempt, ?interval, "sensor not ready; rescheduling");

        Some(SchedulerStep {
            wake_after: Some(interval),
            ..SchedulerStep::default()
        })
    }

    /// Re-queue a task whose retry backoff or reschedule interval elapsed.
    pub fn wake(&mut self, task: &str) -> bool {
        match self.instances.get_mut(task) {
            Some(instance)
                if matches!(
                    instance.state,
                    TaskState::UpForRetry | TaskState::UpForReschedule
                ) =>
            {
                instance.state = TaskState::Queued;
                true
            }
            _ => false,
        }
    }

    /// Fail every non-terminal instance with a `Cancelled` cause.
    ///
    /// Returns the tasks that were `Running`, whose attempts should be
    /// cancelled. Aborting an already aborted run changes nothing.
    pub fn abort(&mut self, reason: &str) -> Vec<TaskName> {
        let now = Utc::now();
        let mut running = Vec::new();

        for instance in self.instances.values_mut() {
            if instance.state.is_terminal() {
                continue;
            }
            if instance.state == TaskState::Running {
                running.push(instance.task.clone());
            }
            instance.state = TaskState::Failed;
            instance.ended_at = Some(now);
            instance.rescheduled = false;
            instance.last_error = Some(FailureCause::cancelled(reason));
        }

        if self.maybe_finish() {
            info!(run_id = %self.run_id, reason, "run aborted");
        }
        running
    }

    /// Skip every direct downstream of `branch` not in `chosen`, then every
    /// `all_success` descendant of a skipped task.
    ///
    /// Descendants with other trigger rules stay `Pending` and are decided
    /// by the next evaluation.
    pub fn apply_branch(&mut self, branch: &str, chosen: &[TaskName]) -> Vec<TaskName> {
        let graph = Arc::clone(&self.graph);
        let now = Utc::now();
        let mut skipped = Vec::new();

        let mut worklist: Vec<&str> = graph
            .downstream_of(branch)
            .iter()
            .filter(|d| !chosen.contains(d))
            .map(String::as_str)
            .collect();

        while let Some(name) = worklist.pop() {
            let Some(instance) = self.instances.get_mut(name) else {
                continue;
            };
            if instance.state != TaskState::Pending {
                continue;
            }
            instance.state = TaskState::Skipped;
            instance.ended_at = Some(now);
            skipped.push(name.to_string());

            for down in graph.downstream_of(name) {
                let rule = graph.node(down).map(|n| n.trigger_rule);
                if rule == Some(TriggerRule::AllSuccess) {
                    worklist.push(down.as_str());
                }
            }
        }

        if !skipped.is_empty() {
            info!(run_id = %self.run_id, branch, ?chosen, ?skipped, "branch pruned tasks");
        }
        skipped
    }

    pub fn summary(&self) -> RunSummary {
        let failures = self
            .graph
            .topological_order()
            .filter_map(|name| self.instances.get(name))
            .filter(|i| i.state.is_failed())
            .map(|i| TaskFailure {
                task: i.task.clone(),
                state: i.state,
                attempts: i.attempts,
                cause: i.last_error.clone(),
            })
            .collect();

        RunSummary {
            run_id: self.run_id.clone(),
            status: self.status,
            failures,
            states: self
                .instances
                .iter()
                .map(|(name, i)| (name.clone(), i.state))
                .collect(),
        }
    }

    /// Snapshot for persistence.
    pub fn to_record(&self, exchange: Vec<ExchangeEntry>) -> RunRecord {
        RunRecord {
            run_id: self.run_id.clone(),
            graph: self.graph.name().to_string(),
            params: self.params.clone(),
            status: self.status,
            created_at: self.created_at,
            finished_at: self.finished_at,
            instances: self.instances.clone(),
            exchange,
        }
    }

    fn current_attempt_mut(&mut self, task: &str, attempt: u32) -> Option<&mut TaskInstance> {
        let run_id = &self.run_id;
        match self.instances.get_mut(task) {
            Some(i) if i.state == TaskState::Running && i.attempts == attempt => Some(i),
            Some(i) => {
                debug!(
                    run_id = %run_id,
                    task,
                    attempt,
                    current_attempt = i.attempts,
                    state = %i.state,
                    "ignoring stale attempt result"
                );
                None
            }
            None => {
                warn!(run_id = %run_id, task, "result for unknown task; ignoring");
                None
            }
        }
    }

    fn all_terminal(&self) -> bool {
        self.instances.values().all(|i| i.state.is_terminal())
    }

    fn final_status(&self) -> RunStatus {
        if self.instances.values().any(|i| i.state.is_failed()) {
            RunStatus::Failed
        } else {
            RunStatus::Success
        }
    }

    fn maybe_finish(&mut self) -> bool {
        if self.is_finished() || !self.all_terminal() {
            return false;
        }
        self.status = self.final_status();
        self.finished_at = Some(Utc::now());
        info!(run_id = %self.run_id, status = %self.status, "run finished");
        true
    }
}
