// src/sink/task.rs

use std::sync::Arc;

use serde_json::{Value, json};
use tracing::debug;

use super::{Row, Sink};
use crate::engine::TaskName;
use crate::exchange::DEFAULT_KEY;
use crate::exec::task::{BoxFuture, TaskContext, TaskError, TaskLogic, TaskOutput};

/// Load task: upserts the rows another task published into a sink table.
///
/// The source value must be a JSON array of objects (or a single object).
/// The task's return value is the `{"inserted": n, "updated": m}` report.
#[derive(Clone)]
pub struct SinkTask {
    sink: Arc<dyn Sink>,
    table: String,
    key_columns: Vec<String>,
    rows_from: TaskName,
    rows_key: String,
}

impl SinkTask {
    pub fn new(
        sink: Arc<dyn Sink>,
        table: impl Into<String>,
        key_columns: Vec<String>,
        rows_from: impl Into<TaskName>,
    ) -> Self {
        Self {
            sink,
            table: table.into(),
            key_columns,
            rows_from: rows_from.into(),
            rows_key: DEFAULT_KEY.to_string(),
        }
    }

    pub fn rows_key(mut self, key: impl Into<String>) -> Self {
        self.rows_key = key.into();
        self
    }
}

impl std::fmt::Debug for SinkTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SinkTask")
            .field("table", &self.table)
            .field("rows_from", &self.rows_from)
            .field("rows_key", &self.rows_key)
            .finish_non_exhaustive()
    }
}

fn rows_of(value: &Value) -> Result<Vec<Row>, TaskError> {
    match value {
        Value::Array(items) => items
            .iter()
            .enumerate()
            .map(|(idx, item)| {
                item.as_object()
                    .cloned()
                    .ok_or_else(|| TaskError::fatal(format!("row {idx} is not a JSON object")))
            })
            .collect(),
        Value::Object(row) => Ok(vec![row.clone()]),
        Value::Null => Ok(Vec::new()),
        other => Err(TaskError::fatal(format!(
            "expected rows as a JSON array of objects, got {other}"
        ))),
    }
}

impl TaskLogic for SinkTask {
    fn execute(&self, ctx: TaskContext) -> BoxFuture<'_, Result<TaskOutput, TaskError>> {
        Box::pin(async move {
            let value = ctx.exchange.pull(&self.rows_from, &self.rows_key)?;
            let rows = rows_of(&value)?;
            debug!(
                run_id = %ctx.run_id,
                task = %ctx.task,
                table = %self.table,
                rows = rows.len(),
                "loading rows into sink"
            );

            let sink = Arc::clone(&self.sink);
            let table = self.table.clone();
            let key_columns = self.key_columns.clone();
            let report = tokio::task::spawn_blocking(move || sink.upsert(&table, &key_columns, &rows))
                .await
                .map_err(|e| TaskError::retryable(format!("sink worker failed: {e}")))??;

            Ok(TaskOutput::new(json!({
                "inserted": report.inserted,
                "updated": report.updated,
            })))
        })
    }
}
