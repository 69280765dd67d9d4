use std::path::Path;

use anyhow::Result;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Registry, fmt};

/// Install the global subscriber: human-readable output on stdout plus,
/// when a log directory is given, a daily-rolling newline-delimited JSON
/// file for machine consumption.
///
/// `log_level` is an `EnvFilter` directive (e.g. `"info"` or
/// `"rivulet=debug,notify=warn"`); `RUST_LOG` overrides it when set.
/// The returned guard must stay alive for the file writer to flush.
pub fn init_tracing(log_level: &str, log_dir: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let stdout_layer = fmt::layer().with_target(true);

    match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender = RollingFileAppender::new(Rotation::DAILY, dir, "rivulet.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let json_layer = fmt::layer().json().with_writer(writer).with_ansi(false);

            Registry::default()
                .with(env_filter)
                .with(stdout_layer)
                .with(json_layer)
                .init();
            Ok(Some(guard))
        }
        None => {
            Registry::default()
                .with(env_filter)
                .with(stdout_layer)
                .init();
            Ok(None)
        }
    }
}
