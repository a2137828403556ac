//! Tracing setup for the engine binaries.
//!
//! Verbosity comes from `RUST_LOG` (default `info`). Console output is
//! always on; a daily-rolling log file is added only when a directory is
//! given, in plain or JSON form.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

/// Install the global subscriber. The returned guard keeps the file writer
/// alive; dropping it flushes and stops background logging.
pub fn init_logging(log_dir: Option<&Path>, format: LogFormat) -> Option<WorkerGuard> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let console = fmt::layer().compact().with_target(false);

    let (file, guard) = match log_dir {
        Some(dir) => {
            let appender = RollingFileAppender::new(Rotation::DAILY, dir, "airgap.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = match format {
                LogFormat::Json => fmt::layer()
                    .json()
                    .with_current_span(false)
                    .with_writer(writer)
                    .boxed(),
                LogFormat::Text => fmt::layer()
                    .with_ansi(false)
                    .with_writer(writer)
                    .boxed(),
            };
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file)
        .init();

    guard
}
