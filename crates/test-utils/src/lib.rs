pub mod builders;
pub mod fake_executor;
pub mod harness;

use std::future::Future;
use std::sync::Once;
use std::time::Duration;

use dagflow::dag::RunSummary;
use dagflow::logging::LOG_ENV;
use tracing_subscriber::{EnvFilter, fmt};

/// Upper bound for a whole pipeline run in tests.
pub const RUN_TIMEOUT: Duration = Duration::from_secs(5);

static INIT: Once = Once::new();

/// Install a test subscriber once per test binary.
///
/// Reads the same `DAGFLOW_LOG` directive as the binary and defaults to
/// `warn,dagflow=info`. Output goes through the test writer, so it only shows
/// for failing tests.
pub fn init_tracing() {
    INIT.call_once(|| {
        let filter = std::env::var(LOG_ENV)
            .ok()
            .and_then(|s| EnvFilter::try_new(s.trim()).ok())
            .unwrap_or_else(|| EnvFilter::new("warn,dagflow=info"));

        let _ = fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .with_target(true)
            .try_init();
    });
}

/// Await `f`, failing the test if it takes longer than [`RUN_TIMEOUT`].
pub async fn with_timeout<F, T>(f: F) -> T
where
    F: Future<Output = T>,
{
    within(RUN_TIMEOUT, f).await
}

/// Await `f`, failing the test if it takes longer than `limit`.
///
/// A hung runtime shows up as a timeout here instead of a stuck test binary.
pub async fn within<F, T>(limit: Duration, f: F) -> T
where
    F: Future<Output = T>,
{
    match tokio::time::timeout(limit, f).await {
        Ok(value) => value,
        Err(_) => panic!("pipeline did not finish within {limit:?}"),
    }
}

/// The summary of `run_id`, failing the test if the run never finished.
pub fn summary_for<'a>(summaries: &'a [RunSummary], run_id: &str) -> &'a RunSummary {
    summaries
        .iter()
        .find(|s| s.run_id == run_id)
        .unwrap_or_else(|| {
            let seen: Vec<&str> = summaries.iter().map(|s| s.run_id.as_str()).collect();
            panic!("no summary for run '{run_id}'; finished runs: {seen:?}")
        })
}
