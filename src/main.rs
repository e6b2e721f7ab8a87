// src/main.rs

use dagflow::{cli, logging, run};

#[tokio::main]
async fn main() {
    match run_main().await {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(err) => {
            eprintln!("dagflow error: {err:?}");
            std::process::exit(1);
        }
    }
}

/// Returns whether every finished run succeeded.
async fn run_main() -> anyhow::Result<bool> {
    let args = cli::parse();
    logging::init_logging(args.log_level)?;
    let summaries = run(args).await?;

    for summary in &summaries {
        for failure in &summary.failures {
            eprintln!(
                "run {}: task '{}' ended {} after {} attempt(s){}",
                summary.run_id,
                failure.task,
                failure.state,
                failure.attempts,
                failure
                    .cause
                    .as_ref()
                    .map(|c| format!(": {c}"))
                    .unwrap_or_default()
            );
        }
    }

    Ok(summaries.iter().all(|s| s.is_success()))
}
