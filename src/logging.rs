//! Logging bootstrap shared by both daemons.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Install the tracing subscriber: stdout always, plus a daily-rolling file
/// when a log directory is configured. The returned guard must stay alive
/// for the life of the process or file logging silently stops.
pub fn init(log_directory: Option<&Path>, file_prefix: &str) -> std::io::Result<Option<WorkerGuard>> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "phonecert=info".into());

    match log_directory {
        Some(directory) => {
            std::fs::create_dir_all(directory)?;
            let file_appender = RollingFileAppender::new(
                Rotation::DAILY,
                directory,
                format!("{}.log", file_prefix),
            );
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().with_writer(non_blocking))
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stdout))
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stdout))
                .init();
            Ok(None)
        }
    }
}
