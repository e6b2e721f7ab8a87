// src/cli.rs

//! CLI argument parsing using `clap`.

use clap::{Parser, ValueEnum};
use serde_json::Value;

/// Command-line arguments for `dagflow`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "dagflow",
    version,
    about = "Run a DAG of tasks with retries, sensors, branches and idempotent loads.",
    long_about = None
)]
pub struct CliArgs {
    /// Path to the pipeline file (TOML).
    #[arg(long, value_name = "PATH", default_value = "Pipeline.toml")]
    pub config: String,

    /// Run id (logical date) to trigger. Defaults to today's date.
    #[arg(long, value_name = "ID")]
    pub run_id: Option<String>,

    /// Run parameter, repeatable. Values are parsed as JSON when possible.
    #[arg(long = "param", value_name = "KEY=VALUE", value_parser = parse_param)]
    pub params: Vec<(String, Value)>,

    /// When resuming an interrupted run, also re-run its failed tasks.
    #[arg(long)]
    pub rerun_failed: bool,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `DAGFLOW_LOG` or a default level will be used.
    #[arg(long, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    /// Parse + validate, print the graph, but don't execute any task.
    #[arg(long)]
    pub dry_run: bool,
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Parse `KEY=VALUE`. `VALUE` is JSON if it parses as JSON, a string
/// otherwise.
pub fn parse_param(s: &str) -> Result<(String, Value), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("invalid parameter '{s}' (expected KEY=VALUE)"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("invalid parameter '{s}' (empty key)"));
    }

    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}
