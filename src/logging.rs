//! Logging configuration for netfetch
//!
//! Structured logging to a daily-rolling file, with warnings mirrored to
//! stderr so failed fetches are visible at the terminal.

use crate::cli::Args;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    filter::LevelFilter,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

fn default_filter(debug: bool) -> String {
    let log_level = if debug { "debug" } else { "info" };
    format!("netfetch={}", log_level)
}

/// Install the global subscriber. Buffered file output is flushed when the
/// returned guard drops, so the caller keeps it alive until exit.
pub fn init_logging(args: &Args) -> Result<WorkerGuard> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(args.debug)));

    let default_dir = PathBuf::from(".");
    let log_dir = args.log_file.parent().unwrap_or(&default_dir);

    if !log_dir.as_os_str().is_empty() && log_dir != Path::new(".") {
        std::fs::create_dir_all(log_dir)
            .with_context(|| format!("creating log directory {}", log_dir.display()))?;
    }

    let file_appender = tracing_appender::rolling::daily(
        log_dir,
        args.log_file.file_name().unwrap_or_default(),
    );
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .with_filter(LevelFilter::WARN);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(stderr_layer)
        .try_init()
        .context("installing tracing subscriber")?;

    Ok(guard)
}
