// src/exec/task.rs

//! Task logic interfaces and the registry that binds them to graph nodes.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;

use crate::dag::{FailureCause, Graph};
use crate::engine::{Params, RunId, TaskName};
use crate::errors::{DagflowError, Result};
use crate::exchange::{ExchangeError, ExchangeView};
use crate::types::TaskKind;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Everything an attempt may look at.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub run_id: RunId,
    pub task: TaskName,
    pub attempt: u32,
    pub params: Arc<Params>,
    /// Direct upstream tasks, in declaration order.
    pub upstream: Vec<TaskName>,
    pub exchange: ExchangeView,
}

impl TaskContext {
    pub fn param(&self, key: &str) -> Option<&Value> {
        self.params.get(key)
    }

    pub fn upstream_value(&self, task: &str) -> std::result::Result<Arc<Value>, ExchangeError> {
        self.exchange.return_value(task)
    }

    /// Return values of all direct upstreams that published one.
    pub fn upstream_values(&self) -> serde_json::Map<String, Value> {
        self.upstream
            .iter()
            .filter_map(|name| {
                self.exchange
                    .return_value(name)
                    .ok()
                    .map(|v| (name.clone(), (*v).clone()))
            })
            .collect()
    }
}

/// Successful result of a task attempt.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskOutput {
    /// Published under the default key.
    pub value: Value,
    /// Extra named entries.
    pub entries: Vec<(String, Value)>,
}

impl TaskOutput {
    pub fn new(value: impl Into<Value>) -> Self {
        Self {
            value: value.into(),
            entries: Vec::new(),
        }
    }

    pub fn with_entry(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.entries.push((key.into(), value.into()));
        self
    }
}

impl From<Value> for TaskOutput {
    fn from(value: Value) -> Self {
        Self::new(value)
    }
}

/// Error returned by task logic.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    /// Retried according to the task's retry policy.
    #[error("{0}")]
    Retryable(String),
    /// Fails the task immediately.
    #[error("{0}")]
    Fatal(String),
}

impl TaskError {
    pub fn retryable(msg: impl fmt::Display) -> Self {
        TaskError::Retryable(msg.to_string())
    }

    pub fn fatal(msg: impl fmt::Display) -> Self {
        TaskError::Fatal(msg.to_string())
    }
}

impl From<ExchangeError> for TaskError {
    fn from(err: ExchangeError) -> Self {
        TaskError::Fatal(err.to_string())
    }
}

impl From<TaskError> for FailureCause {
    fn from(err: TaskError) -> Self {
        match err {
            TaskError::Retryable(msg) => FailureCause::retryable(msg),
            TaskError::Fatal(msg) => FailureCause::fatal(msg),
        }
    }
}

/// Typed decision of a branch task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchChoice {
    pub chosen: TaskName,
}

impl BranchChoice {
    pub fn new(chosen: impl Into<TaskName>) -> Self {
        Self {
            chosen: chosen.into(),
        }
    }
}

pub trait TaskLogic: Send + Sync {
    fn execute(&self, ctx: TaskContext) -> BoxFuture<'_, std::result::Result<TaskOutput, TaskError>>;
}

pub trait BranchLogic: Send + Sync {
    fn choose(&self, ctx: TaskContext) -> BoxFuture<'_, std::result::Result<BranchChoice, TaskError>>;
}

/// Readiness predicate of a sensor. A `Retryable` error counts as "not yet".
pub trait SensorPredicate: Send + Sync {
    fn poll(&self, ctx: TaskContext) -> BoxFuture<'_, std::result::Result<bool, TaskError>>;
}

/// Closure adapter for [`TaskLogic`].
pub struct FnTask<F>(pub F);

impl<F, Fut> TaskLogic for FnTask<F>
where
    F: Fn(TaskContext) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<TaskOutput, TaskError>> + Send + 'static,
{
    fn execute(&self, ctx: TaskContext) -> BoxFuture<'_, std::result::Result<TaskOutput, TaskError>> {
        Box::pin((self.0)(ctx))
    }
}

/// Closure adapter for [`BranchLogic`].
pub struct FnBranch<F>(pub F);

impl<F, Fut> BranchLogic for FnBranch<F>
where
    F: Fn(TaskContext) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<BranchChoice, TaskError>> + Send + 'static,
{
    fn choose(&self, ctx: TaskContext) -> BoxFuture<'_, std::result::Result<BranchChoice, TaskError>> {
        Box::pin((self.0)(ctx))
    }
}

/// Closure adapter for [`SensorPredicate`].
pub struct FnSensor<F>(pub F);

impl<F, Fut> SensorPredicate for FnSensor<F>
where
    F: Fn(TaskContext) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<bool, TaskError>> + Send + 'static,
{
    fn poll(&self, ctx: TaskContext) -> BoxFuture<'_, std::result::Result<bool, TaskError>> {
        Box::pin((self.0)(ctx))
    }
}

/// Logic bound to one task.
#[derive(Clone)]
pub enum Operator {
    /// Plain and sink tasks.
    Task(Arc<dyn TaskLogic>),
    Branch(Arc<dyn BranchLogic>),
    Sensor(Arc<dyn SensorPredicate>),
}

impl Operator {
    pub fn supports(&self, kind: TaskKind) -> bool {
        matches!(
            (self, kind),
            (Operator::Task(_), TaskKind::Plain | TaskKind::Sink)
                | (Operator::Branch(_), TaskKind::Branch)
                | (Operator::Sensor(_), TaskKind::Sensor)
        )
    }

    fn label(&self) -> &'static str {
        match self {
            Operator::Task(_) => "task",
            Operator::Branch(_) => "branch",
            Operator::Sensor(_) => "sensor",
        }
    }
}

impl fmt::Debug for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Operator::{}", self.label())
    }
}

/// Maps task names to their logic.
#[derive(Debug, Clone, Default)]
pub struct TaskRegistry {
    operators: HashMap<TaskName, Operator>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<TaskName>, operator: Operator) {
        self.operators.insert(name.into(), operator);
    }

    pub fn get(&self, name: &str) -> Option<&Operator> {
        self.operators.get(name)
    }

    pub fn with(mut self, name: impl Into<TaskName>, operator: Operator) -> Self {
        self.insert(name, operator);
        self
    }

    pub fn task<F, Fut>(self, name: impl Into<TaskName>, f: F) -> Self
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<TaskOutput, TaskError>> + Send + 'static,
    {
        self.with(name, Operator::Task(Arc::new(FnTask(f))))
    }

    pub fn branch<F, Fut>(self, name: impl Into<TaskName>, f: F) -> Self
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<BranchChoice, TaskError>> + Send + 'static,
    {
        self.with(name, Operator::Branch(Arc::new(FnBranch(f))))
    }

    pub fn sensor<F, Fut>(self, name: impl Into<TaskName>, f: F) -> Self
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<bool, TaskError>> + Send + 'static,
    {
        self.with(name, Operator::Sensor(Arc::new(FnSensor(f))))
    }

    /// Every node needs an operator matching its kind.
    pub fn check(&self, graph: &Graph) -> Result<()> {
        for node in graph.nodes() {
            match self.operators.get(&node.name) {
                None => return Err(DagflowError::TaskNotFound(node.name.clone())),
                Some(op) if !op.supports(node.kind) => {
                    return Err(DagflowError::ConfigError(format!(
                        "task '{}' is a {:?} task but has a {} operator",
                        node.name,
                        node.kind,
                        op.label()
                    )));
                }
                Some(_) => {}
            }
        }
        Ok(())
    }
}
