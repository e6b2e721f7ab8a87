#![allow(dead_code)]

use dagflow::config::{ConfigFile, GroupConfig, RawConfigFile, TaskConfig};
use dagflow::errors::Result;
use dagflow::sink::TableSchema;
use dagflow::types::{QueuedRunBehaviour, SensorMode, StateStorageMode, TaskKind, TriggerRule};

/// Builder for `ConfigFile` to simplify test setup.
#[derive(Default)]
pub struct ConfigFileBuilder {
    config: RawConfigFile,
}

impl ConfigFileBuilder {
    pub fn new() -> Self {
        let mut config = RawConfigFile::default();
        config.pipeline.state_storage = StateStorageMode::Memory;
        Self { config }
    }

    pub fn name(mut self, name: &str) -> Self {
        self.config.pipeline.name = name.to_string();
        self
    }

    pub fn max_parallel_tasks(mut self, n: usize) -> Self {
        self.config.pipeline.max_parallel_tasks = n;
        self
    }

    pub fn max_active_runs(mut self, n: usize) -> Self {
        self.config.pipeline.max_active_runs = n;
        self
    }

    pub fn queued_run_behaviour(mut self, behaviour: QueuedRunBehaviour) -> Self {
        self.config.pipeline.queued_run_behaviour = behaviour;
        self
    }

    pub fn default_max_attempts(mut self, n: u32) -> Self {
        self.config.default.max_attempts = Some(n);
        self
    }

    pub fn default_backoff(mut self, backoff: &str) -> Self {
        self.config.default.backoff = Some(backoff.to_string());
        self
    }

    pub fn with_table(mut self, name: &str, key_columns: &[&str], mutable_columns: &[&str]) -> Self {
        self.config.table.insert(
            name.to_string(),
            TableSchema::new(key_columns.iter().copied(), mutable_columns.iter().copied()),
        );
        self
    }

    /// Tasks keep the order they are added in.
    pub fn with_task(mut self, name: &str, task: TaskConfig) -> Self {
        if self.config.task.insert(name.to_string(), task).is_none() {
            self.config.task_order.push(name.to_string());
        }
        self
    }

    pub fn with_group(mut self, name: &str, tasks: &[&str], after: &[&str]) -> Self {
        let group = GroupConfig {
            tasks: tasks.iter().map(|t| t.to_string()).collect(),
            after: after.iter().map(|t| t.to_string()).collect(),
        };
        self.config.group.insert(name.to_string(), group);
        self
    }

    pub fn raw(self) -> RawConfigFile {
        self.config
    }

    pub fn try_build(self) -> Result<ConfigFile> {
        ConfigFile::try_from(self.config)
    }

    pub fn build(self) -> ConfigFile {
        self.try_build()
            .expect("Failed to build valid config from builder")
    }
}

/// Builder for `TaskConfig`.
pub struct TaskConfigBuilder {
    task: TaskConfig,
}

impl TaskConfigBuilder {
    pub fn new(cmd: &str) -> Self {
        Self {
            task: TaskConfig {
                cmd: Some(cmd.to_string()),
                ..TaskConfig::default()
            },
        }
    }

    pub fn sensor(cmd: &str, poke_interval: &str, timeout: &str) -> Self {
        let mut builder = Self::new(cmd);
        builder.task.kind = TaskKind::Sensor;
        builder.task.poke_interval = Some(poke_interval.to_string());
        builder.task.sensor_timeout = Some(timeout.to_string());
        builder
    }

    /// Sensor waiting on `task` of the pipeline whose state lives in `state_dir`.
    pub fn external_sensor(pipeline: &str, task: &str, state_dir: &str) -> Self {
        let mut builder = Self::sensor("", "1s", "1m");
        builder.task.cmd = None;
        builder.task.external_pipeline = Some(pipeline.to_string());
        builder.task.external_task = Some(task.to_string());
        builder.task.external_state_dir = Some(state_dir.into());
        builder
    }

    pub fn branch(cmd: &str) -> Self {
        let mut builder = Self::new(cmd);
        builder.task.kind = TaskKind::Branch;
        builder
    }

    pub fn sink(table: &str, rows_from: &str) -> Self {
        Self {
            task: TaskConfig {
                kind: TaskKind::Sink,
                table: Some(table.to_string()),
                rows_from: Some(rows_from.to_string()),
                after: vec![rows_from.to_string()],
                ..TaskConfig::default()
            },
        }
    }

    pub fn after(mut self, dep: &str) -> Self {
        if !self.task.after.iter().any(|d| d == dep) {
            self.task.after.push(dep.to_string());
        }
        self
    }

    pub fn trigger_rule(mut self, rule: TriggerRule) -> Self {
        self.task.trigger_rule = Some(rule);
        self
    }

    pub fn max_attempts(mut self, n: u32) -> Self {
        self.task.max_attempts = Some(n);
        self
    }

    pub fn backoff(mut self, backoff: &str) -> Self {
        self.task.backoff = Some(backoff.to_string());
        self
    }

    pub fn timeout(mut self, timeout: &str) -> Self {
        self.task.timeout = Some(timeout.to_string());
        self
    }

    pub fn mode(mut self, mode: SensorMode) -> Self {
        self.task.mode = Some(mode);
        self
    }

    pub fn build(self) -> TaskConfig {
        self.task
    }
}
