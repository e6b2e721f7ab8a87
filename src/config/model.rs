// src/config/model.rs

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Deserialize;

use crate::sink::TableSchema;
use crate::types::{
    BackoffStrategy, QueuedRunBehaviour, SensorMode, StateStorageMode, TaskKind, TriggerRule,
};

/// Top-level configuration as read from a TOML file, before validation.
///
/// ```toml
/// [pipeline]
/// name = "financial_data_ingestion"
/// max_active_runs = 1
///
/// [default]
/// max_attempts = 3
/// backoff = "5m"
///
/// [table.stock_prices]
/// key_columns = ["symbol", "trading_date"]
/// mutable_columns = ["close", "volume"]
///
/// [task.extract]
/// cmd = "python extract.py"
///
/// [task.load]
/// kind = "sink"
/// table = "stock_prices"
/// rows_from = "extract"
/// after = ["extract"]
///
/// [group.reporting]
/// tasks = ["load"]
/// ```
///
/// All sections are optional at this stage; `ConfigFile::try_from` rejects
/// configs without tasks.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawConfigFile {
    #[serde(default)]
    pub pipeline: PipelineSection,

    #[serde(default)]
    pub default: DefaultSection,

    /// Tables from `[table.<name>]`, used by sink tasks.
    #[serde(default)]
    pub table: BTreeMap<String, TableSchema>,

    /// All tasks from `[task.<name>]`, keyed by task name.
    #[serde(default)]
    pub task: BTreeMap<String, TaskConfig>,

    /// Task groups from `[group.<name>]`.
    #[serde(default)]
    pub group: BTreeMap<String, GroupConfig>,

    /// Task names in the order the file declares them. Empty when the config
    /// was not read from TOML text.
    #[serde(skip)]
    pub task_order: Vec<String>,
}

impl RawConfigFile {
    /// Parse TOML text, remembering the order of `[task.*]` sections.
    pub fn from_toml_str(text: &str) -> Result<Self, toml::de::Error> {
        let mut raw: RawConfigFile = toml::from_str(text)?;
        let doc: toml::Table = toml::from_str(text)?;
        raw.task_order = doc
            .get("task")
            .and_then(|t| t.as_table())
            .map(|t| t.keys().cloned().collect())
            .unwrap_or_default();
        Ok(raw)
    }

    /// Tasks in declaration order.
    pub fn tasks(&self) -> Vec<(&String, &TaskConfig)> {
        in_declaration_order(&self.task, &self.task_order)
    }
}

/// A validated configuration.
///
/// Only obtainable through `TryFrom<RawConfigFile>`, so holders can rely on
/// every task referring to known tasks and tables and the graph being
/// acyclic.
#[derive(Debug, Clone)]
pub struct ConfigFile {
    pub pipeline: PipelineSection,
    pub default: DefaultSection,
    pub table: BTreeMap<String, TableSchema>,
    pub task: BTreeMap<String, TaskConfig>,
    pub group: BTreeMap<String, GroupConfig>,
    pub task_order: Vec<String>,
}

impl ConfigFile {
    pub(crate) fn new_unchecked(raw: RawConfigFile) -> Self {
        Self {
            pipeline: raw.pipeline,
            default: raw.default,
            table: raw.table,
            task: raw.task,
            group: raw.group,
            task_order: raw.task_order,
        }
    }

    /// Tasks in declaration order.
    pub fn tasks(&self) -> Vec<(&String, &TaskConfig)> {
        in_declaration_order(&self.task, &self.task_order)
    }
}

/// Declared names first, then any task the order does not mention, by name.
fn in_declaration_order<'a>(
    tasks: &'a BTreeMap<String, TaskConfig>,
    order: &[String],
) -> Vec<(&'a String, &'a TaskConfig)> {
    let mut ordered: Vec<(&String, &TaskConfig)> =
        order.iter().filter_map(|name| tasks.get_key_value(name)).collect();
    ordered.extend(tasks.iter().filter(|(name, _)| !order.contains(name)));
    ordered
}

/// `[group.<name>]` section: tasks that other tasks can depend on, or a
/// branch can choose, as one unit.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GroupConfig {
    pub tasks: Vec<String>,

    /// Tasks or groups the whole group waits for.
    #[serde(default)]
    pub after: Vec<String>,
}

/// `[pipeline]` section: run-level behaviour.
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineSection {
    #[serde(default = "default_pipeline_name")]
    pub name: String,

    /// Runs in flight at once; later triggers wait in the run queue.
    #[serde(default = "default_max_active_runs")]
    pub max_active_runs: usize,

    /// Task instances in `Running` state at once, across all runs.
    #[serde(default = "default_max_parallel_tasks")]
    pub max_parallel_tasks: usize,

    /// `"queue"` (default) or `"latest"`.
    #[serde(default)]
    pub queued_run_behaviour: QueuedRunBehaviour,

    /// Optional bound on the run queue.
    #[serde(default)]
    pub queue_length: Option<usize>,

    /// `"file"` (default) or `"memory"`.
    #[serde(default)]
    pub state_storage: StateStorageMode,

    /// Root for run records and file-backed tables. Relative paths are
    /// resolved against the config file's directory.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
}

fn default_pipeline_name() -> String {
    "pipeline".to_string()
}

fn default_max_active_runs() -> usize {
    1
}

fn default_max_parallel_tasks() -> usize {
    4
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".dagflow")
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            name: default_pipeline_name(),
            max_active_runs: default_max_active_runs(),
            max_parallel_tasks: default_max_parallel_tasks(),
            queued_run_behaviour: QueuedRunBehaviour::default(),
            queue_length: None,
            state_storage: StateStorageMode::default(),
            state_dir: default_state_dir(),
        }
    }
}

/// `[default]` section: arguments applied to every task that does not set
/// them itself.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DefaultSection {
    #[serde(default)]
    pub max_attempts: Option<u32>,

    /// Duration string such as `"30s"` or `"5m"`.
    #[serde(default)]
    pub backoff: Option<String>,

    #[serde(default)]
    pub backoff_strategy: Option<BackoffStrategy>,

    /// Per-attempt timeout.
    #[serde(default)]
    pub timeout: Option<String>,

    #[serde(default)]
    pub retry_on_timeout: Option<bool>,

    #[serde(default)]
    pub trigger_rule: Option<TriggerRule>,
}

/// `[task.<name>]` section.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskConfig {
    /// `plain` (default), `sensor`, `branch` or `sink`.
    #[serde(default)]
    pub kind: TaskKind,

    /// Shell command. Required for every kind except `sink`.
    #[serde(default)]
    pub cmd: Option<String>,

    /// Working directory of the command.
    #[serde(default)]
    pub workdir: Option<PathBuf>,

    /// This task waits for all tasks (or groups) listed here.
    #[serde(default)]
    pub after: Vec<String>,

    #[serde(default)]
    pub trigger_rule: Option<TriggerRule>,

    #[serde(default)]
    pub max_attempts: Option<u32>,

    #[serde(default)]
    pub backoff: Option<String>,

    #[serde(default)]
    pub backoff_strategy: Option<BackoffStrategy>,

    #[serde(default)]
    pub timeout: Option<String>,

    #[serde(default)]
    pub retry_on_timeout: Option<bool>,

    // Sensor settings.
    #[serde(default)]
    pub poke_interval: Option<String>,

    #[serde(default)]
    pub sensor_timeout: Option<String>,

    #[serde(default)]
    pub mode: Option<SensorMode>,

    /// With `external_task`, makes a sensor wait for that task of another
    /// pipeline instead of running `cmd`.
    #[serde(default)]
    pub external_pipeline: Option<String>,

    #[serde(default)]
    pub external_task: Option<String>,

    /// State dir of the other pipeline. Relative paths are resolved against
    /// the config file's directory.
    #[serde(default)]
    pub external_state_dir: Option<PathBuf>,

    // Sink settings.
    #[serde(default)]
    pub table: Option<String>,

    /// Upstream task whose exchange entry holds the rows.
    #[serde(default)]
    pub rows_from: Option<String>,

    /// Exchange key of the rows; `return_value` when unset.
    #[serde(default)]
    pub rows_key: Option<String>,
}

impl TaskConfig {
    /// Whether this is a sensor on another pipeline's task.
    pub fn is_external_sensor(&self) -> bool {
        self.kind == TaskKind::Sensor && self.external_task.is_some()
    }

    pub fn effective_trigger_rule(&self, default: &DefaultSection) -> TriggerRule {
        self.trigger_rule
            .or(default.trigger_rule)
            .unwrap_or_default()
    }

    pub fn effective_max_attempts(&self, default: &DefaultSection) -> u32 {
        self.max_attempts.or(default.max_attempts).unwrap_or(1)
    }

    pub fn effective_backoff<'a>(&'a self, default: &'a DefaultSection) -> Option<&'a str> {
        self.backoff.as_deref().or(default.backoff.as_deref())
    }

    pub fn effective_backoff_strategy(&self, default: &DefaultSection) -> BackoffStrategy {
        self.backoff_strategy
            .or(default.backoff_strategy)
            .unwrap_or_default()
    }

    pub fn effective_timeout<'a>(&'a self, default: &'a DefaultSection) -> Option<&'a str> {
        self.timeout.as_deref().or(default.timeout.as_deref())
    }

    pub fn effective_retry_on_timeout(&self, default: &DefaultSection) -> bool {
        self.retry_on_timeout
            .or(default.retry_on_timeout)
            .unwrap_or(true)
    }
}
