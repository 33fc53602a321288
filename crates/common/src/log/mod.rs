use crate::config::LogConfig;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Installs the global subscriber writing to stdout.
///
/// The returned guard flushes buffered events when dropped, keep it alive for
/// the lifetime of the process.
pub fn logging_stdout(config: &LogConfig) -> WorkerGuard {
    let (nonblocking, guard) = tracing_appender::non_blocking(std::io::stdout());

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(nonblocking)
                .with_file(config.with_file_line)
                .with_line_number(config.with_file_line),
        )
        .with(
            EnvFilter::builder()
                .with_default_directive(config.default_level.into())
                .from_env_lossy(),
        )
        .init();

    guard
}
