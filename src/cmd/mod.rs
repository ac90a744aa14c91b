//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module      | Commands handled                                  |
//! |-------------|---------------------------------------------------|
//! | `project`   | `Init`, `Status`, `Labels`                        |
//! | `stage`     | `Start`, `Complete`, `Fail`, `Checkpoint`         |
//! | `history`   | `Transitions`, `DeadLetters`, `Resolve`, `Replay` |
//! | `recovery`  | `Recover`, `Verify`                               |
//! | `config`    | `Config`                                          |

pub mod config;
pub mod history;
pub mod project;
pub mod recovery;
pub mod stage;

pub use config::cmd_config;
pub use history::{cmd_dead_letters, cmd_replay, cmd_resolve, cmd_transitions};
pub use project::{cmd_init, cmd_labels, cmd_status};
pub use recovery::{cmd_recover, cmd_verify};
pub use stage::{FailureArgs, cmd_checkpoint, cmd_complete, cmd_fail, cmd_start};

use std::path::PathBuf;

use anyhow::Result;
use serde::Serialize;
use tracing_appender::non_blocking::WorkerGuard;

use pipestate::config::{EngineConfig, PipestateToml};
use pipestate::logging::{init_logging, resolve_level};
use pipestate::state::StateManager;

use super::Cli;

/// Settings resolved from file, environment, and flags, plus the log guard
/// that must outlive the command.
pub struct CliContext {
    pub config_path: Option<PathBuf>,
    pub toml: PipestateToml,
    pub engine: EngineConfig,
    pub json: bool,
    _log_guard: Option<WorkerGuard>,
}

impl CliContext {
    pub fn from_cli(cli: &Cli) -> Result<Self> {
        let mut toml = PipestateToml::load_or_default(cli.config.as_deref())?;
        toml.apply_env(|key| std::env::var(key).ok())?;
        if let Some(dir) = &cli.projects_dir {
            toml.storage.projects_dir = dir.clone();
        }
        if let Some(secs) = cli.lock_timeout {
            toml.locks.timeout_secs = secs;
        }

        let level = resolve_level(cli.log_level.as_deref(), toml.logging.level.as_deref());
        let log_dir = cli.log_dir.clone().or_else(|| toml.logging.dir.clone());
        // A broken log directory should not block state operations.
        let log_guard = match init_logging(level, log_dir.as_deref(), toml.logging.json) {
            Ok(guard) => Some(guard),
            Err(e) => {
                eprintln!("Warning: logging disabled: {:#}", e);
                None
            }
        };

        let engine = toml.engine_config();
        tracing::debug!(
            projects_dir = %engine.projects_dir.display(),
            lock_timeout = ?engine.lock_timeout,
            "Resolved engine configuration"
        );

        Ok(Self {
            config_path: cli.config.clone(),
            toml,
            engine,
            json: cli.json,
            _log_guard: log_guard,
        })
    }

    pub fn manager(&self) -> StateManager {
        StateManager::new(self.engine.clone())
    }
}

pub fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Parse a `key=value` pair for `--custom`.
pub fn parse_key_value(raw: &str) -> std::result::Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected key=value, got '{}'", raw)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_key_value() {
        assert_eq!(
            parse_key_value("owner=platform").unwrap(),
            ("owner".to_string(), "platform".to_string())
        );
        assert_eq!(
            parse_key_value("note=a=b").unwrap(),
            ("note".to_string(), "a=b".to_string())
        );
        assert!(parse_key_value("novalue").is_err());
        assert!(parse_key_value("=x").is_err());
    }
}
