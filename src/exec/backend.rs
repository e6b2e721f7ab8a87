// src/exec/backend.rs

//! Pluggable executor backend abstraction.
//!
//! The runtime talks to an `ExecutorBackend` instead of a raw mpsc sender,
//! so tests can swap in a fake executor that completes attempts from a
//! script while production runs the real operators.

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::mpsc;

use crate::dag::ScheduledTask;
use crate::engine::{RuntimeEvent, TaskRef};
use crate::errors::Result;
use crate::exec::task::{BoxFuture, TaskRegistry};

use super::executor_loop::{ExecutorRequest, spawn_executor};

/// Trait abstracting how scheduled attempts are executed.
pub trait ExecutorBackend: Send {
    /// Dispatch the given attempts for execution. Every dispatched attempt
    /// must eventually produce exactly one `AttemptFinished` event unless it
    /// is cancelled.
    fn spawn_ready_tasks(&mut self, tasks: Vec<ScheduledTask>) -> BoxFuture<'_, Result<()>>;

    /// Stop the given running attempts without reporting them.
    fn cancel_tasks(&mut self, tasks: Vec<TaskRef>) -> BoxFuture<'_, Result<()>>;
}

/// Executor backend used in production: forwards requests to the background
/// loop started by [`spawn_executor`].
pub struct RealExecutorBackend {
    tx: mpsc::Sender<ExecutorRequest>,
}

impl RealExecutorBackend {
    /// Spawns the background executor loop immediately.
    pub fn new(registry: Arc<TaskRegistry>, runtime_tx: mpsc::Sender<RuntimeEvent>) -> Self {
        let tx = spawn_executor(registry, runtime_tx);
        Self { tx }
    }

    fn forward(&self, requests: Vec<ExecutorRequest>) -> BoxFuture<'static, Result<()>> {
        // Clone the sender so the future doesn't borrow `self` across `await`.
        let tx = self.tx.clone();

        Box::pin(async move {
            for request in requests {
                tx.send(request).await.context("executor loop is gone")?;
            }
            Ok(())
        })
    }
}

impl ExecutorBackend for RealExecutorBackend {
    fn spawn_ready_tasks(&mut self, tasks: Vec<ScheduledTask>) -> BoxFuture<'_, Result<()>> {
        self.forward(tasks.into_iter().map(ExecutorRequest::Run).collect())
    }

    fn cancel_tasks(&mut self, tasks: Vec<TaskRef>) -> BoxFuture<'_, Result<()>> {
        self.forward(tasks.into_iter().map(ExecutorRequest::Cancel).collect())
    }
}
