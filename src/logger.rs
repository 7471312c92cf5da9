use std::fs;
use std::path::Path;

use anyhow::Context;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Default filter when `RUST_LOG` is unset. The websocket stack logs every
/// frame at debug level, so it is held at warn.
const DEFAULT_FILTER: &str = "info,tungstenite=warn,tokio_tungstenite=warn,cpal=warn";

/// Initialize structured logging.
///
/// Sets up:
/// - File output: `{log_dir}/duplex.YYYY-MM-DD.log`, rotated daily, latest
///   5 files kept.
/// - Console output on stderr. Stdout carries the IPC protocol, so nothing
///   else may write there.
/// - Environment filter from `RUST_LOG`, defaulting to [`DEFAULT_FILTER`].
///
/// Fails if the log directory cannot be created or a global subscriber is
/// already installed.
pub fn init(log_dir: &Path) -> anyhow::Result<()> {
    let file_appender = file_appender(log_dir)?;

    let file_layer = fmt::layer()
        .with_writer(file_appender)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true);

    let console_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .with_target(true)
        .compact();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .context("Logger already initialized")?;

    tracing::info!(log_dir = %log_dir.display(), "Logger initialized");
    Ok(())
}

fn file_appender(log_dir: &Path) -> anyhow::Result<RollingFileAppender> {
    fs::create_dir_all(log_dir)
        .with_context(|| format!("Failed to create log directory {}", log_dir.display()))?;

    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix("duplex")
        .filename_suffix("log")
        .max_log_files(5)
        .build(log_dir)
        .context("Failed to create log file appender")
}
