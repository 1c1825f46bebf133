//! Logging setup. stdout is reserved exclusively for JSON-RPC traffic over
//! the stdio transport, so all diagnostic output goes to a rolling file
//! under `logging.directory` (stderr would also work, but a file survives
//! the process being supervised/daemonized under --mode service).

use crate::config::LoggingConfig;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// Initializes the global tracing subscriber. The returned [`WorkerGuard`]
/// must be kept alive for the life of the process -- dropping it stops the
/// background flush thread and can silently truncate the last lines logged.
pub fn init(config: &LoggingConfig) -> WorkerGuard {
    let file_appender = tracing_appender::rolling::daily(&config.directory, "dbgmux.log");
    let (writer, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.clone()));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .init();

    guard
}
