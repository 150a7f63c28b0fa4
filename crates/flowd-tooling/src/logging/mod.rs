//! Logging setup for long-running scheduler processes.
//!
//! One call from `main` wires up the `tracing` subscriber: an
//! `EnvFilter` honouring `RUST_LOG`, and a daily-rolling log file under
//! the run directory so a workflow's history survives its process.

use std::path::Path;
use std::time::Instant;
use tracing::debug;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// Install the global subscriber, writing to a daily-rolling file named
/// `file_prefix.*` in `log_dir`. The returned guard must stay alive for
/// the life of the process; dropping it stops the background writer and
/// loses buffered lines.
pub fn init_rolling(log_dir: &Path, file_prefix: &str, default_filter: &str) -> WorkerGuard {
    let appender = tracing_appender::rolling::daily(log_dir, file_prefix);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .init();
    guard
}

/// Await a future, logging its wall-clock duration at debug level.
pub async fn timed<F, T>(name: &str, future: F) -> T
where
    F: std::future::Future<Output = T>,
{
    let start = Instant::now();
    let result = future.await;
    debug!(operation = name, elapsed = ?start.elapsed(), "operation complete");
    result
}
