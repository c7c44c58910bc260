//! provides logging helpers

use std::path::Path;

use anyhow::Context;
use anyhow::Result;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::RollingFileAppender;
use tracing_appender::rolling::Rotation;
use tracing_subscriber::filter::{self};
use tracing_subscriber::fmt::layer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry;

const MAX_LOG_FILES: usize = 3;

fn env_filter() -> filter::EnvFilter {
    filter::EnvFilter::builder()
        .with_default_directive(filter::LevelFilter::INFO.into())
        .from_env_lossy()
}

/// initiate the global tracing subscriber, also writing to `log_file` if given
///
/// The returned guard flushes the file writer on drop and must outlive the daemon.
pub fn init(log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let fmt_layer = utils::logging::get_fmt_layer().with_filter(env_filter());

    let Some(log_file) = log_file else {
        registry().with(fmt_layer).init();
        return Ok(None);
    };

    let directory = log_file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    let prefix = log_file
        .file_name()
        .and_then(|name| name.to_str())
        .with_context(|| format!("invalid log file name: {}", log_file.display()))?;

    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(prefix)
        .max_log_files(MAX_LOG_FILES)
        .build(directory)
        .context("failed to create rolling file appender")?;
    let (file_writer, file_guard) = tracing_appender::non_blocking(appender);

    let file_layer = layer()
        .with_writer(file_writer)
        .with_ansi(false)
        .with_filter(env_filter());

    registry().with(fmt_layer).with(file_layer).init();
    Ok(Some(file_guard))
}
