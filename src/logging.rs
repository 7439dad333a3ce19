use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::OnceLock;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

pub const LOG_ENV: &str = "RETEXT_LOG";

static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

pub fn log_dir() -> Result<PathBuf> {
    let base = dirs::cache_dir().context("Could not determine cache directory")?;
    Ok(base.join("retext").join("logs"))
}

/// File-only logging: the terminal belongs to the UI. `RETEXT_LOG` wins
/// over the configured level.
pub fn init_tracing(level: &str) -> Result<()> {
    let dir = log_dir()?;
    std::fs::create_dir_all(&dir).with_context(|| format!("Failed to create {}", dir.display()))?;

    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix("retext")
        .filename_suffix("log")
        .max_log_files(14)
        .build(&dir)
        .context("Failed to set up log file")?;
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let _ = GUARD.set(guard);

    let filter = EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(writer).with_ansi(false))
        .try_init()
        .context("Failed to install tracing subscriber")?;
    Ok(())
}
