// src/config/build.rs

//! Turn a validated config into the objects the runtime needs.

use std::sync::Arc;

use tracing::debug;

use crate::config::model::ConfigFile;
use crate::errors::{DagflowError, Result};
use crate::exec::{
    CommandBranch, CommandSensor, CommandTask, ExternalTaskSensor, Operator, ShellCommand,
    TaskRegistry,
};
use crate::persist::FileRunStore;
use crate::sink::{JsonFileSink, MemorySink, Sink, SinkTask};
use crate::types::{StateStorageMode, TaskKind};

/// Directory (relative to the state dir) holding file-backed tables.
pub const TABLES_DIR: &str = "tables";

/// The sink shared by every sink task of the pipeline.
///
/// File storage keeps one JSON file per table under
/// `<state_dir>/tables`; memory storage is lost on exit.
pub fn build_sink(cfg: &ConfigFile) -> Arc<dyn Sink> {
    match cfg.pipeline.state_storage {
        StateStorageMode::File => {
            let root = cfg.pipeline.state_dir.join(TABLES_DIR);
            let sink = cfg
                .table
                .iter()
                .fold(JsonFileSink::new(root), |sink, (name, schema)| {
                    sink.with_table(name.as_str(), schema.clone())
                });
            Arc::new(sink)
        }
        StateStorageMode::Memory => {
            let sink = cfg
                .table
                .iter()
                .fold(MemorySink::new(), |sink, (name, schema)| {
                    sink.with_table(name.as_str(), schema.clone())
                });
            Arc::new(sink)
        }
    }
}

/// Bind every configured task to a command-backed operator, a
/// [`SinkTask`] writing into `sink`, or an [`ExternalTaskSensor`] reading
/// another pipeline's run records.
pub fn build_registry(cfg: &ConfigFile, sink: Arc<dyn Sink>) -> Result<TaskRegistry> {
    let mut registry = TaskRegistry::new();

    for (name, task) in cfg.tasks() {
        let command = || -> Result<ShellCommand> {
            let cmd = task.cmd.as_deref().ok_or_else(|| {
                DagflowError::ConfigError(format!("task '{name}' has no `cmd`"))
            })?;
            let mut command = ShellCommand::new(cmd);
            if let Some(dir) = &task.workdir {
                command = command.in_dir(dir);
            }
            Ok(command)
        };

        let operator = match task.kind {
            TaskKind::Plain => Operator::Task(Arc::new(CommandTask(command()?))),
            TaskKind::Branch => Operator::Branch(Arc::new(CommandBranch(command()?))),
            TaskKind::Sensor => match (
                &task.external_pipeline,
                &task.external_task,
                &task.external_state_dir,
            ) {
                (Some(pipeline), Some(external), Some(dir)) => {
                    let store = FileRunStore::new(dir);
                    Operator::Sensor(Arc::new(ExternalTaskSensor::new(
                        pipeline.as_str(),
                        external.as_str(),
                        store,
                    )))
                }
                _ => Operator::Sensor(Arc::new(CommandSensor(command()?))),
            },
            TaskKind::Sink => {
                let (Some(table), Some(rows_from)) = (&task.table, &task.rows_from) else {
                    return Err(DagflowError::ConfigError(format!(
                        "sink task '{name}' needs `table` and `rows_from`"
                    )));
                };
                let schema = cfg.table.get(table).ok_or_else(|| {
                    DagflowError::ConfigError(format!("unknown table '{table}'"))
                })?;

                let mut logic = SinkTask::new(
                    Arc::clone(&sink),
                    table.as_str(),
                    schema.key_columns.clone(),
                    rows_from.as_str(),
                );
                if let Some(key) = &task.rows_key {
                    logic = logic.rows_key(key.as_str());
                }
                Operator::Task(Arc::new(logic))
            }
        };

        debug!(task = %name, kind = ?task.kind, "registered operator");
        registry.insert(name.as_str(), operator);
    }

    Ok(registry)
}
