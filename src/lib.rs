// src/lib.rs

pub mod cli;
pub mod config;
pub mod dag;
pub mod engine;
pub mod errors;
pub mod exchange;
pub mod exec;
pub mod logging;
pub mod persist;
pub mod sink;
pub mod types;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::cli::CliArgs;
use crate::config::loader::load_and_validate;
use crate::config::model::ConfigFile;
use crate::config::{build_registry, build_sink};
use crate::dag::{Graph, RunSummary};
use crate::engine::{
    CoreRuntime, RunQueue, RunTrigger, Runtime, RuntimeEvent, RuntimeOptions, TriggerReason,
};
use crate::exec::RealExecutorBackend;
use crate::persist::{FileRunStore, MemoryRunStore, RunRecord, RunStore};
use crate::types::StateStorageMode;

/// High-level entry point used by `main.rs`.
///
/// This wires together:
/// - config loading
/// - operators, sink and run store
/// - run queue / core / runtime
/// - executor
/// - Ctrl-C handling
///
/// Returns the summaries of the runs that finished.
pub async fn run(args: CliArgs) -> Result<Vec<RunSummary>> {
    let config_path = PathBuf::from(&args.config);
    let cfg = load_and_validate(&config_path)?;
    let graph = Arc::new(cfg.to_graph()?);

    if args.dry_run {
        print_dry_run(&cfg, &graph);
        return Ok(Vec::new());
    }

    let registry = build_registry(&cfg, build_sink(&cfg))?;
    registry.check(&graph)?;

    let store: Box<dyn RunStore> = match cfg.pipeline.state_storage {
        StateStorageMode::File => Box::new(FileRunStore::new(&cfg.pipeline.state_dir)),
        StateStorageMode::Memory => Box::new(MemoryRunStore::new()),
    };

    let run_id = args.run_id.clone().unwrap_or_else(today);
    let resume = runs_to_resume(store.as_ref(), graph.name(), &run_id, args.rerun_failed)?;

    // Runtime event channel.
    let (rt_tx, rt_rx) = mpsc::channel::<RuntimeEvent>(64);

    let executor = RealExecutorBackend::new(Arc::new(registry), rt_tx.clone());

    // Ctrl-C → graceful shutdown.
    {
        let tx = rt_tx.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for Ctrl+C");
                return;
            }
            info!("Ctrl+C received; shutting down");
            if tx.send(RuntimeEvent::ShutdownRequested).await.is_err() {
                debug!("runtime already stopped; ignoring Ctrl+C");
            }
        });
    }

    let mut trigger = RunTrigger::new(run_id, TriggerReason::Manual);
    trigger.params.extend(args.params.iter().cloned());
    info!(run_id = %trigger.run_id, params = ?trigger.params, "triggering run");
    rt_tx.send(RuntimeEvent::RunTriggered(trigger)).await?;

    let options = RuntimeOptions {
        exit_when_idle: true,
        max_parallel_tasks: cfg.pipeline.max_parallel_tasks,
        max_active_runs: cfg.pipeline.max_active_runs,
        rerun_failed: args.rerun_failed,
    };
    let queue = RunQueue::new(cfg.pipeline.queued_run_behaviour, cfg.pipeline.queue_length);

    // Construct the pure core runtime (single source of truth for semantics).
    let core = CoreRuntime::new(graph, queue, options);

    // Construct the async IO shell around the core.
    let runtime = Runtime::new(core, rt_tx, rt_rx, executor, store).with_resume(resume);
    Ok(runtime.run().await?)
}

/// Today's date, the default run id.
fn today() -> String {
    chrono::Local::now().format("%Y-%m-%d").to_string()
}

/// Records to pick up before the new trigger.
///
/// Unfinished runs of this pipeline are always resumed. A finished run with
/// the requested id is resumed too when `rerun_failed` is set, which resets
/// its failed tasks; otherwise the trigger starts it from scratch.
fn runs_to_resume(
    store: &dyn RunStore,
    graph: &str,
    run_id: &str,
    rerun_failed: bool,
) -> Result<Vec<RunRecord>> {
    let mut resume = Vec::new();

    for record in store.list()? {
        if record.graph != graph {
            warn!(run_id = %record.run_id, graph = %record.graph, "ignoring run record of another pipeline");
            continue;
        }
        if !record.is_finished() || (rerun_failed && record.run_id == run_id) {
            debug!(run_id = %record.run_id, status = %record.status, "run will be resumed");
            resume.push(record);
        }
    }

    Ok(resume)
}

/// Simple dry-run output: print settings and tasks in topological order.
fn print_dry_run(cfg: &ConfigFile, graph: &Graph) {
    println!("dagflow dry-run: {}", graph.name());
    println!("  pipeline.max_active_runs = {}", cfg.pipeline.max_active_runs);
    println!("  pipeline.max_parallel_tasks = {}", cfg.pipeline.max_parallel_tasks);
    println!(
        "  pipeline.queued_run_behaviour = {:?}",
        cfg.pipeline.queued_run_behaviour
    );
    if let Some(len) = cfg.pipeline.queue_length {
        println!("  pipeline.queue_length = {len}");
    }
    println!("  pipeline.state_dir = {}", cfg.pipeline.state_dir.display());
    println!();

    println!("tasks ({}), in execution order:", graph.len());
    for name in graph.topological_order() {
        let Some(node) = graph.node(name) else {
            continue;
        };
        println!("  - {name} ({:?})", node.kind);
        let task = cfg.task.get(name);
        if let Some(cmd) = task.and_then(|t| t.cmd.as_deref()) {
            println!("      cmd: {cmd}");
        }
        if let Some((pipeline, external)) =
            task.and_then(|t| t.external_pipeline.as_deref().zip(t.external_task.as_deref()))
        {
            println!("      waits for: {pipeline}.{external}");
        }
        if !node.upstream.is_empty() {
            println!("      after: {:?}", node.upstream);
            println!("      trigger_rule: {:?}", node.trigger_rule);
        }
        if node.retry.max_attempts > 1 {
            println!(
                "      retries: {} x {:?} ({:?})",
                node.retry.max_attempts - 1,
                node.retry.backoff_delay,
                node.retry.backoff_strategy
            );
        }
        if let Some(timeout) = node.retry.per_attempt_timeout {
            println!("      timeout: {timeout:?}");
        }
        if let Some(sensor) = node.sensor {
            println!(
                "      sensor: every {:?} for up to {:?} ({:?})",
                sensor.poke_interval, sensor.timeout, sensor.mode
            );
        }
    }

    if graph.groups().next().is_some() {
        println!();
        println!("groups:");
        for group in graph.groups() {
            println!("  - {}: {:?}", group.name, group.tasks);
        }
    }

    debug!("dry-run complete (no execution)");
}
