//! Log setup for the `pipestate` binary.
//!
//! The library only emits `tracing` events; whoever embeds it decides where
//! they go. The CLI writes them to a daily-rolled file so that stdout stays
//! machine-readable.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

pub const LOG_FILE_PREFIX: &str = "pipestate.log";

/// Default log directory: `<data_local_dir>/pipestate/logs`.
pub fn default_log_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("pipestate")
        .join("logs")
}

/// Resolve the level with priority CLI, then config, then INFO.
///
/// An unknown name falls back to INFO with a note on stderr, since logging is
/// not up yet to report it.
pub fn resolve_level(cli_level: Option<&str>, config_level: Option<&str>) -> Level {
    match cli_level.or(config_level) {
        Some(name) => match name.to_uppercase().as_str() {
            "TRACE" => Level::TRACE,
            "DEBUG" => Level::DEBUG,
            "INFO" => Level::INFO,
            "WARN" | "WARNING" => Level::WARN,
            "ERROR" => Level::ERROR,
            _ => {
                eprintln!("Warning: Unknown log level '{}', defaulting to INFO", name);
                Level::INFO
            }
        },
        None => Level::INFO,
    }
}

/// Install the global subscriber. Keep the returned guard alive until exit,
/// or buffered events are lost.
///
/// With `json` set, each event is written as one JSON object per line.
pub fn init_logging(level: Level, log_dir: Option<&Path>, json: bool) -> Result<WorkerGuard> {
    let log_dir = log_dir.map_or_else(default_log_dir, Path::to_path_buf);
    std::fs::create_dir_all(&log_dir)
        .with_context(|| format!("Failed to create log directory: {}", log_dir.display()))?;

    let appender = tracing_appender::rolling::daily(&log_dir, LOG_FILE_PREFIX);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let builder = tracing_subscriber::fmt()
        .with_writer(writer)
        .with_ansi(false)
        .with_target(false)
        .with_env_filter(EnvFilter::from_default_env().add_directive(level.into()));
    let installed = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| anyhow::anyhow!("Failed to install log subscriber: {}", e))?;

    tracing::info!(?level, dir = %log_dir.display(), json, "Logging initialized");
    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_level_priority() {
        assert_eq!(resolve_level(Some("debug"), Some("error")), Level::DEBUG);
        assert_eq!(resolve_level(None, Some("warning")), Level::WARN);
        assert_eq!(resolve_level(None, None), Level::INFO);
        assert_eq!(resolve_level(Some("chatty"), None), Level::INFO);
    }

    #[test]
    fn test_default_log_dir_ends_with_app_name() {
        let dir = default_log_dir();
        assert!(dir.ends_with("pipestate/logs"));
    }
}
