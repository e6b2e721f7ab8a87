// src/exec/command.rs

//! Operators backed by shell commands, used for pipelines declared in TOML.
//!
//! The command sees the attempt through environment variables:
//! `DAGFLOW_RUN_ID`, `DAGFLOW_TASK`, `DAGFLOW_ATTEMPT`, `DAGFLOW_PARAMS`
//! (JSON object) and `DAGFLOW_UPSTREAM` (JSON object of upstream return
//! values). The last non-empty stdout line is the command's result.

use std::path::PathBuf;
use std::process::Stdio;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info};

use crate::exec::task::{
    BoxFuture, BranchChoice, BranchLogic, SensorPredicate, TaskContext, TaskError, TaskLogic,
    TaskOutput,
};

/// A shell command plus the directory it runs in.
#[derive(Debug, Clone)]
pub struct ShellCommand {
    pub cmd: String,
    pub workdir: Option<PathBuf>,
}

impl ShellCommand {
    pub fn new(cmd: impl Into<String>) -> Self {
        Self {
            cmd: cmd.into(),
            workdir: None,
        }
    }

    pub fn in_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(dir.into());
        self
    }

    /// Run to completion. Failing to spawn the process is fatal.
    async fn run(&self, ctx: &TaskContext) -> Result<CommandResult, TaskError> {
        // Build a shell command appropriate for the platform.
        let mut cmd = if cfg!(windows) {
            let mut c = Command::new("cmd");
            c.arg("/C").arg(&self.cmd);
            c
        } else {
            let mut c = Command::new("sh");
            c.arg("-c").arg(&self.cmd);
            c
        };

        let params = serde_json::to_string(ctx.params.as_ref())
            .map_err(|e| TaskError::fatal(format!("encoding params: {e}")))?;
        let upstream = Value::Object(ctx.upstream_values()).to_string();

        cmd.env("DAGFLOW_RUN_ID", &ctx.run_id)
            .env("DAGFLOW_TASK", &ctx.task)
            .env("DAGFLOW_ATTEMPT", ctx.attempt.to_string())
            .env("DAGFLOW_PARAMS", params)
            .env("DAGFLOW_UPSTREAM", upstream)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.workdir {
            cmd.current_dir(dir);
        }

        info!(run_id = %ctx.run_id, task = %ctx.task, cmd = %self.cmd, "starting task process");

        let mut child = cmd.spawn().map_err(|e| {
            TaskError::fatal(format!("spawning process for task '{}': {e}", ctx.task))
        })?;

        // Always consume stderr so buffers don't fill; log at debug.
        if let Some(stderr) = child.stderr.take() {
            let task_name = ctx.task.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(task = %task_name, "stderr: {}", line);
                }
            });
        }

        let mut last_line = None;
        if let Some(stdout) = child.stdout.take() {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(task = %ctx.task, "stdout: {}", line);
                if !line.trim().is_empty() {
                    last_line = Some(line.trim().to_string());
                }
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|e| TaskError::retryable(format!("waiting for process: {e}")))?;

        info!(
            run_id = %ctx.run_id,
            task = %ctx.task,
            exit_code = status.code().unwrap_or(-1),
            success = status.success(),
            "task process exited"
        );

        Ok(CommandResult {
            success: status.success(),
            code: status.code(),
            last_line,
        })
    }
}

struct CommandResult {
    success: bool,
    code: Option<i32>,
    last_line: Option<String>,
}

impl CommandResult {
    fn exit_error(&self) -> TaskError {
        match self.code {
            Some(code) => TaskError::retryable(format!("command exited with code {code}")),
            None => TaskError::retryable("command terminated by signal"),
        }
    }
}

/// Interpret a result line: JSON if it parses, a plain string otherwise.
pub fn parse_output(line: Option<&str>) -> Value {
    match line {
        None => Value::Null,
        Some(line) => {
            serde_json::from_str(line).unwrap_or_else(|_| Value::String(line.to_string()))
        }
    }
}

/// Plain (or sink-less) task running a command. Non-zero exit is retryable.
#[derive(Debug, Clone)]
pub struct CommandTask(pub ShellCommand);

impl TaskLogic for CommandTask {
    fn execute(&self, ctx: TaskContext) -> BoxFuture<'_, Result<TaskOutput, TaskError>> {
        Box::pin(async move {
            let result = self.0.run(&ctx).await?;
            if !result.success {
                return Err(result.exit_error());
            }
            Ok(TaskOutput::new(parse_output(result.last_line.as_deref())))
        })
    }
}

/// Branch whose command prints the chosen task name as its last line.
#[derive(Debug, Clone)]
pub struct CommandBranch(pub ShellCommand);

impl BranchLogic for CommandBranch {
    fn choose(&self, ctx: TaskContext) -> BoxFuture<'_, Result<BranchChoice, TaskError>> {
        Box::pin(async move {
            let result = self.0.run(&ctx).await?;
            if !result.success {
                return Err(result.exit_error());
            }
            match result.last_line {
                Some(chosen) => Ok(BranchChoice::new(chosen)),
                None => Err(TaskError::fatal("branch command printed no task name")),
            }
        })
    }
}

/// Sensor whose condition holds when the command exits 0.
#[derive(Debug, Clone)]
pub struct CommandSensor(pub ShellCommand);

impl SensorPredicate for CommandSensor {
    fn poll(&self, ctx: TaskContext) -> BoxFuture<'_, Result<bool, TaskError>> {
        Box::pin(async move {
            let result = self.0.run(&ctx).await?;
            Ok(result.success)
        })
    }
}
