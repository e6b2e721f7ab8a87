// src/config/validate.rs

use std::collections::BTreeMap;
use std::time::Duration;

use crate::config::model::{ConfigFile, DefaultSection, GroupConfig, RawConfigFile, TaskConfig};
use crate::dag::{Graph, RetryPolicy, SensorSpec, TaskGroup, TaskNode};
use crate::errors::{DagflowError, Result};
use crate::types::TaskKind;

impl TryFrom<RawConfigFile> for ConfigFile {
    type Error = DagflowError;

    fn try_from(raw: RawConfigFile) -> std::result::Result<Self, Self::Error> {
        validate_raw_config(&raw)?;
        Ok(ConfigFile::new_unchecked(raw))
    }
}

impl ConfigFile {
    /// Build the task graph described by `[task.*]` and `[group.*]`.
    pub fn to_graph(&self) -> Result<Graph> {
        build_graph(&self.pipeline.name, &self.default, &self.tasks(), &self.group)
    }
}

/// Validate a raw config without converting it.
pub fn validate_config(cfg: &RawConfigFile) -> Result<()> {
    validate_raw_config(cfg)
}

fn validate_raw_config(cfg: &RawConfigFile) -> Result<()> {
    ensure_has_tasks(cfg)?;
    validate_pipeline(cfg)?;
    validate_defaults(&cfg.default)?;
    validate_tasks(cfg)?;
    validate_groups(cfg)?;
    build_graph(&cfg.pipeline.name, &cfg.default, &cfg.tasks(), &cfg.group)?;
    Ok(())
}

fn config_error(msg: impl Into<String>) -> DagflowError {
    DagflowError::ConfigError(msg.into())
}

fn ensure_has_tasks(cfg: &RawConfigFile) -> Result<()> {
    if cfg.task.is_empty() {
        return Err(config_error(
            "config must contain at least one [task.<name>] section",
        ));
    }
    Ok(())
}

fn validate_pipeline(cfg: &RawConfigFile) -> Result<()> {
    let pipeline = &cfg.pipeline;

    if pipeline.max_active_runs == 0 {
        return Err(config_error("[pipeline].max_active_runs must be >= 1 (got 0)"));
    }
    if pipeline.max_parallel_tasks == 0 {
        return Err(config_error(
            "[pipeline].max_parallel_tasks must be >= 1 (got 0)",
        ));
    }
    if pipeline.queue_length == Some(0) {
        return Err(config_error("[pipeline].queue_length must be >= 1 (got 0)"));
    }
    Ok(())
}

fn validate_defaults(default: &DefaultSection) -> Result<()> {
    if default.max_attempts == Some(0) {
        return Err(config_error("[default].max_attempts must be >= 1 (got 0)"));
    }
    if let Some(backoff) = &default.backoff {
        parse_setting("[default].backoff", backoff)?;
    }
    if let Some(timeout) = &default.timeout {
        parse_setting("[default].timeout", timeout)?;
    }
    Ok(())
}

fn validate_tasks(cfg: &RawConfigFile) -> Result<()> {
    for (name, task) in cfg.tasks() {
        for dep in task.after.iter() {
            if dep == name {
                return Err(config_error(format!(
                    "task '{name}' cannot depend on itself in `after`"
                )));
            }
            if !is_known(cfg, dep) {
                return Err(config_error(format!(
                    "task '{name}' has unknown dependency '{dep}' in `after`"
                )));
            }
        }

        if task.max_attempts == Some(0) {
            return Err(config_error(format!(
                "task '{name}': max_attempts must be >= 1 (got 0)"
            )));
        }
        for (field, value) in [
            ("backoff", &task.backoff),
            ("timeout", &task.timeout),
            ("poke_interval", &task.poke_interval),
            ("sensor_timeout", &task.sensor_timeout),
        ] {
            if let Some(value) = value {
                parse_setting(&format!("task '{name}': {field}"), value)?;
            }
        }

        let external = [
            task.external_pipeline.is_some(),
            task.external_task.is_some(),
            task.external_state_dir.is_some(),
        ];
        if external.contains(&true) {
            if task.kind != TaskKind::Sensor {
                return Err(config_error(format!(
                    "task '{name}': external_* settings are only allowed on sensors"
                )));
            }
            if external.contains(&false) {
                return Err(config_error(format!(
                    "sensor task '{name}' needs `external_pipeline`, `external_task` and `external_state_dir` together"
                )));
            }
        }

        match task.kind {
            TaskKind::Sink => validate_sink(cfg, name, task)?,
            _ if task.is_external_sensor() => {}
            kind => {
                if task.cmd.as_deref().is_none_or(|c| c.trim().is_empty()) {
                    return Err(config_error(format!(
                        "task '{name}' ({kind:?}) needs a non-empty `cmd`"
                    )));
                }
            }
        }

        if task.kind == TaskKind::Sensor
            && (task.poke_interval.is_none() || task.sensor_timeout.is_none())
        {
            return Err(config_error(format!(
                "sensor task '{name}' needs both `poke_interval` and `sensor_timeout`"
            )));
        }
        if let Some(interval) = &task.poke_interval {
            if parse_setting(&format!("task '{name}': poke_interval"), interval)?.is_zero() {
                return Err(config_error(format!(
                    "task '{name}': poke_interval must be greater than zero"
                )));
            }
        }
    }
    Ok(())
}

fn validate_groups(cfg: &RawConfigFile) -> Result<()> {
    for (name, group) in &cfg.group {
        if cfg.task.contains_key(name) {
            return Err(config_error(format!(
                "group '{name}' has the same name as a task"
            )));
        }
        if group.tasks.is_empty() {
            return Err(config_error(format!("group '{name}' needs at least one task")));
        }
        if let Some(task) = group.tasks.iter().find(|t| !cfg.task.contains_key(*t)) {
            return Err(config_error(format!(
                "group '{name}' lists unknown task '{task}'"
            )));
        }
        if let Some(dep) = group.after.iter().find(|d| !is_known(cfg, d)) {
            return Err(config_error(format!(
                "group '{name}' has unknown dependency '{dep}' in `after`"
            )));
        }
    }
    Ok(())
}

/// A task or group name.
fn is_known(cfg: &RawConfigFile, name: &str) -> bool {
    cfg.task.contains_key(name) || cfg.group.contains_key(name)
}

fn validate_sink(cfg: &RawConfigFile, name: &str, task: &TaskConfig) -> Result<()> {
    let Some(table) = &task.table else {
        return Err(config_error(format!("sink task '{name}' needs a `table`")));
    };
    let Some(schema) = cfg.table.get(table) else {
        return Err(config_error(format!(
            "sink task '{name}' refers to unknown table '{table}'"
        )));
    };
    if schema.key_columns.is_empty() {
        return Err(config_error(format!(
            "table '{table}' needs at least one key column"
        )));
    }

    let Some(rows_from) = &task.rows_from else {
        return Err(config_error(format!(
            "sink task '{name}' needs `rows_from`"
        )));
    };
    if !task.after.contains(rows_from) {
        return Err(config_error(format!(
            "sink task '{name}' reads rows from '{rows_from}', which is not in its `after` list"
        )));
    }
    Ok(())
}

fn parse_setting(what: &str, value: &str) -> Result<Duration> {
    parse_duration(value).map_err(|e| config_error(format!("{what}: {e}")))
}

/// Parse a duration such as `"250ms"`, `"30s"`, `"5m"` or `"1h"`.
pub fn parse_duration(s: &str) -> std::result::Result<Duration, String> {
    let s = s.trim();
    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| format!("invalid duration '{s}' (missing unit: ms, s, m or h)"))?;
    let (number, unit) = s.split_at(split);

    let value: u64 = number
        .parse()
        .map_err(|_| format!("invalid duration '{s}' (expected e.g. \"30s\")"))?;

    match unit.trim() {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value.saturating_mul(60))),
        "h" => Ok(Duration::from_secs(value.saturating_mul(3600))),
        other => Err(format!(
            "invalid duration unit '{other}' in '{s}' (expected ms, s, m or h)"
        )),
    }
}

fn optional_duration(value: Option<&str>) -> Result<Option<Duration>> {
    value
        .map(|v| parse_duration(v).map_err(config_error))
        .transpose()
}

fn build_graph(
    name: &str,
    default: &DefaultSection,
    tasks: &[(&String, &TaskConfig)],
    groups: &BTreeMap<String, GroupConfig>,
) -> Result<Graph> {
    let mut nodes = Vec::with_capacity(tasks.len());

    for &(task_name, task) in tasks {
        let mut retry = RetryPolicy::new(
            task.effective_max_attempts(default),
            optional_duration(task.effective_backoff(default))?.unwrap_or_default(),
        )
        .with_strategy(task.effective_backoff_strategy(default))
        .with_retry_on_timeout(task.effective_retry_on_timeout(default));
        if let Some(timeout) = optional_duration(task.effective_timeout(default))? {
            retry = retry.with_timeout(timeout);
        }

        let mut node = match task.kind {
            TaskKind::Plain => TaskNode::new(task_name.as_str()),
            TaskKind::Branch => TaskNode::branch(task_name.as_str()),
            TaskKind::Sink => TaskNode::sink(task_name.as_str()),
            TaskKind::Sensor => {
                let poke_interval = optional_duration(task.poke_interval.as_deref())?
                    .ok_or_else(|| config_error(format!("sensor task '{task_name}' needs `poke_interval`")))?;
                let timeout = optional_duration(task.sensor_timeout.as_deref())?
                    .ok_or_else(|| config_error(format!("sensor task '{task_name}' needs `sensor_timeout`")))?;
                TaskNode::sensor(
                    task_name.as_str(),
                    SensorSpec::new(poke_interval, timeout, task.mode.unwrap_or_default()),
                )
            }
        };

        node = node
            .with_retry(retry)
            .with_trigger_rule(task.effective_trigger_rule(default));
        for dep in &task.after {
            node = node.after(dep.as_str());
        }
        nodes.push(node);
    }

    let groups = groups
        .iter()
        .map(|(group_name, group)| TaskGroup {
            name: group_name.clone(),
            tasks: group.tasks.clone(),
            upstream: group.after.clone(),
        })
        .collect();

    Ok(Graph::with_groups(name, nodes, groups)?)
}
