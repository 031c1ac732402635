//! Structured logging setup using `tracing-subscriber` and `tracing-appender`.
//!
//! `tryout run` drives a countdown for minutes at a time and logs through
//! [`init_production`]: JSON to a daily file plus stderr. The one-shot
//! commands (`migrate`, `start`, `verify`, `status`) print their result on
//! stdout and use [`init_cli`], which keeps stderr quiet unless `RUST_LOG`
//! asks otherwise.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// File name prefix for the rotated log files.
pub const LOG_FILE_PREFIX: &str = "tryout.log";

/// Default directives for `run`. sqlx logs every statement at `info`, and
/// the timer and answer lanes write often, so it is held to `warn`.
pub const RUN_FILTER: &str = "info,sqlx=warn";

/// Default directives for one-shot commands.
pub const CLI_FILTER: &str = "warn";

/// Holds the non-blocking writer guard for file logging.
///
/// Dropping it flushes pending log entries, so `run` keeps it until the
/// countdown has exited and the runtime has settled.
pub struct LoggingGuard {
    _guard: WorkerGuard,
}

fn filter_or(default: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

/// Initialise logging for `tryout run`.
///
/// Writes JSON logs to `{logs_dir}/tryout.log.YYYY-MM-DD`, plus compact
/// stderr output. Session ids, user ids and token fingerprints travel as
/// event fields so the JSON file can be filtered per attempt.
///
/// # Errors
///
/// Returns an error if the logs directory cannot be created or a global
/// subscriber is already installed.
pub fn init_production(logs_dir: &Path) -> anyhow::Result<LoggingGuard> {
    std::fs::create_dir_all(logs_dir).map_err(|e| {
        anyhow::anyhow!(
            "failed to create logs directory {}: {e}",
            logs_dir.display()
        )
    })?;

    let (writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(logs_dir, LOG_FILE_PREFIX));

    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .flatten_event(true)
        .with_writer(writer);
    let console_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_target(false)
        .with_writer(std::io::stderr);

    tracing_subscriber::registry()
        .with(filter_or(RUN_FILTER))
        .with(json_layer)
        .with(console_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))?;

    Ok(LoggingGuard { _guard: guard })
}

/// Initialise stderr-only logging for one-shot commands. Safe to call more
/// than once; later calls are no-ops.
pub fn init_cli() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter_or(CLI_FILTER))
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}
