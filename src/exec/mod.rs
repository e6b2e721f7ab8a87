// src/exec/mod.rs

//! Execution layer.
//!
//! This module runs the attempts the scheduler dispatches and reports back
//! to the orchestration runtime via `RuntimeEvent`s.
//!
//! - [`task`] defines the task, branch and sensor interfaces and the
//!   registry binding them to graph nodes.
//! - [`task_runner`] runs one attempt (timeouts, sensor poking, cancel).
//! - [`executor_loop`] owns the loop that spawns and cancels attempts.
//! - [`command`] provides operators backed by shell commands.
//! - [`external`] provides a sensor waiting on another pipeline's task.
//! - [`backend`] provides the `ExecutorBackend` trait and the concrete
//!   `RealExecutorBackend` used in production, which tests replace with a
//!   fake implementation.

pub mod backend;
pub mod command;
pub mod executor_loop;
pub mod external;
pub mod task;
pub mod task_runner;

pub use backend::{ExecutorBackend, RealExecutorBackend};
pub use command::{CommandBranch, CommandSensor, CommandTask, ShellCommand};
pub use executor_loop::spawn_executor;
pub use external::ExternalTaskSensor;
pub use task::{
    BoxFuture, BranchChoice, BranchLogic, Operator, SensorPredicate, TaskContext, TaskError,
    TaskLogic, TaskOutput, TaskRegistry,
};
