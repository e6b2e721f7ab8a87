// src/dag/mod.rs

//! Task graph representation and the per-run state machine.
//!
//! - [`graph`] holds the validated, immutable directed acyclic graph.
//! - [`instance`] provides task instance records and scheduled attempts.
//! - [`readiness`] evaluates trigger rules over upstream states.
//! - [`run`] contains the per-run state machine that decides which tasks
//!   are ready, retried, skipped or failed.
//! - [`scheduler_step`] defines the result type for run transitions.

pub mod graph;
pub mod instance;
pub mod readiness;
pub mod run;
pub mod scheduler_step;

pub use graph::{Graph, GraphError, RetryPolicy, SensorSpec, TaskGroup, TaskNode, TopologicalOrder};
pub use instance::{FailureCause, FailureKind, RunStatus, ScheduledTask, TaskInstance, TaskState};
pub use readiness::Readiness;
pub use run::{RunContext, RunSummary, TaskFailure};
pub use scheduler_step::SchedulerStep;
