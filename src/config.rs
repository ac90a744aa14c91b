//! Configuration for the state engine.
//!
//! Settings come from `pipestate.toml`, then environment variables, then CLI
//! flags, each layer overriding the one before.
//!
//! # Configuration File Format
//!
//! ```toml
//! [storage]
//! projects_dir = ".somas/projects"
//!
//! [locks]
//! timeout_secs = 30
//!
//! [checkpoints]
//! max_retained = 20
//!
//! [retries]
//! max_stage_retries = 3
//!
//! [integrity]
//! window_secs = 300
//!
//! [logging]
//! level = "info"
//! json = false
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::checkpoint::DEFAULT_MAX_CHECKPOINTS;
use crate::state::{DEFAULT_MAX_STAGE_RETRIES, StatePolicy};
use crate::storage::lock::DEFAULT_LOCK_TIMEOUT;

pub const CONFIG_FILE: &str = "pipestate.toml";
pub const ENV_PROJECTS_DIR: &str = "PIPESTATE_PROJECTS_DIR";
pub const ENV_LOCK_TIMEOUT_SECS: &str = "PIPESTATE_LOCK_TIMEOUT_SECS";

const DEFAULT_INTEGRITY_WINDOW_SECS: u64 = 300;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSection {
    /// Directory holding one subdirectory per project
    #[serde(default = "default_projects_dir")]
    pub projects_dir: PathBuf,
}

fn default_projects_dir() -> PathBuf {
    PathBuf::from(".somas/projects")
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            projects_dir: default_projects_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocksSection {
    #[serde(default = "default_lock_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_lock_timeout_secs() -> u64 {
    DEFAULT_LOCK_TIMEOUT.as_secs()
}

impl Default for LocksSection {
    fn default() -> Self {
        Self {
            timeout_secs: default_lock_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointsSection {
    #[serde(default = "default_max_retained")]
    pub max_retained: usize,
}

fn default_max_retained() -> usize {
    DEFAULT_MAX_CHECKPOINTS
}

impl Default for CheckpointsSection {
    fn default() -> Self {
        Self {
            max_retained: default_max_retained(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetriesSection {
    /// Failed attempts after which a stage may not be restarted
    #[serde(default = "default_max_stage_retries")]
    pub max_stage_retries: u32,
}

fn default_max_stage_retries() -> u32 {
    DEFAULT_MAX_STAGE_RETRIES
}

impl Default for RetriesSection {
    fn default() -> Self {
        Self {
            max_stage_retries: default_max_stage_retries(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegritySection {
    /// How far a dead letter may be from its stage failure and still match
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
}

fn default_window_secs() -> u64 {
    DEFAULT_INTEGRITY_WINDOW_SECS
}

impl Default for IntegritySection {
    fn default() -> Self {
        Self {
            window_secs: default_window_secs(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
    /// Defaults to the platform data directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
    /// Write log events as JSON lines
    #[serde(default)]
    pub json: bool,
}

/// The complete pipestate.toml structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipestateToml {
    #[serde(default)]
    pub storage: StorageSection,
    #[serde(default)]
    pub locks: LocksSection,
    #[serde(default)]
    pub checkpoints: CheckpointsSection,
    #[serde(default)]
    pub retries: RetriesSection,
    #[serde(default)]
    pub integrity: IntegritySection,
    #[serde(default)]
    pub logging: LoggingSection,
}

impl PipestateToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse pipestate.toml")
    }

    /// Load `path` if given, else `./pipestate.toml` when present, else defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => {
                let local = Path::new(CONFIG_FILE);
                if local.exists() {
                    Self::load(local)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize pipestate.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply environment overrides read through `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(dir) = lookup(ENV_PROJECTS_DIR).filter(|v| !v.is_empty()) {
            self.storage.projects_dir = PathBuf::from(dir);
        }
        if let Some(secs) = lookup(ENV_LOCK_TIMEOUT_SECS) {
            self.locks.timeout_secs = secs
                .trim()
                .parse()
                .with_context(|| format!("{} must be a whole number of seconds", ENV_LOCK_TIMEOUT_SECS))?;
        }
        Ok(())
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.locks.timeout_secs == 0 {
            warnings.push(
                "locks.timeout_secs is 0: every contended operation will fail immediately".to_string(),
            );
        }
        if self.checkpoints.max_retained == 0 {
            warnings.push(
                "checkpoints.max_retained is 0: the newest checkpoint is still kept".to_string(),
            );
        }
        if self.retries.max_stage_retries == 0 {
            warnings.push(
                "retries.max_stage_retries is 0: a failed stage can never be retried".to_string(),
            );
        }
        if let Some(level) = &self.logging.level
            && level.parse::<tracing::Level>().is_err()
        {
            warnings.push(format!(
                "Invalid logging.level '{}': expected trace, debug, info, warn, or error",
                level
            ));
        }

        warnings
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            projects_dir: self.storage.projects_dir.clone(),
            lock_timeout: Duration::from_secs(self.locks.timeout_secs),
            max_checkpoints: self.checkpoints.max_retained,
            max_stage_retries: self.retries.max_stage_retries,
            integrity_window: Duration::from_secs(self.integrity.window_secs),
        }
    }
}

/// Resolved settings the engine runs with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub projects_dir: PathBuf,
    pub lock_timeout: Duration,
    pub max_checkpoints: usize,
    pub max_stage_retries: u32,
    pub integrity_window: Duration,
}

impl EngineConfig {
    /// Defaults with projects stored under `projects_dir`.
    pub fn new(projects_dir: impl Into<PathBuf>) -> Self {
        Self {
            projects_dir: projects_dir.into(),
            ..Self::default()
        }
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn with_max_checkpoints(mut self, max: usize) -> Self {
        self.max_checkpoints = max;
        self
    }

    pub fn with_max_stage_retries(mut self, max: u32) -> Self {
        self.max_stage_retries = max;
        self
    }

    pub fn policy(&self) -> StatePolicy {
        StatePolicy {
            max_checkpoints: self.max_checkpoints,
            retry_ceiling: self.max_stage_retries,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        PipestateToml::default().engine_config()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn test_parse_empty_gives_defaults() {
        let config = PipestateToml::parse("").unwrap();
        assert_eq!(config.storage.projects_dir, PathBuf::from(".somas/projects"));
        assert_eq!(config.locks.timeout_secs, 30);
        assert_eq!(config.checkpoints.max_retained, 20);
        assert_eq!(config.retries.max_stage_retries, 3);
        assert_eq!(config.integrity.window_secs, 300);
        assert!(config.logging.level.is_none());
        assert!(config.validate().is_empty());
    }

    #[test]
    fn test_parse_sections() {
        let content = r#"
[storage]
projects_dir = "/var/lib/somas"

[locks]
timeout_secs = 5

[checkpoints]
max_retained = 50

[logging]
level = "debug"
"#;
        let config = PipestateToml::parse(content).unwrap();
        let engine = config.engine_config();
        assert_eq!(engine.projects_dir, PathBuf::from("/var/lib/somas"));
        assert_eq!(engine.lock_timeout, Duration::from_secs(5));
        assert_eq!(engine.max_checkpoints, 50);
        assert_eq!(engine.max_stage_retries, 3);
        assert_eq!(config.logging.level.as_deref(), Some("debug"));
    }

    #[test]
    fn test_parse_invalid_toml() {
        let err = PipestateToml::parse("[locks\ntimeout_secs = ").unwrap_err();
        assert!(err.to_string().contains("pipestate.toml"));
    }

    #[test]
    fn test_env_overrides_file() {
        let mut config = PipestateToml::parse("[locks]\ntimeout_secs = 5").unwrap();
        let env = HashMap::from([
            (ENV_PROJECTS_DIR, "/tmp/projects".to_string()),
            (ENV_LOCK_TIMEOUT_SECS, "12".to_string()),
        ]);
        config.apply_env(|key| env.get(key).cloned()).unwrap();
        assert_eq!(config.storage.projects_dir, PathBuf::from("/tmp/projects"));
        assert_eq!(config.locks.timeout_secs, 12);
    }

    #[test]
    fn test_env_rejects_bad_timeout() {
        let mut config = PipestateToml::default();
        let result = config.apply_env(|key| (key == ENV_LOCK_TIMEOUT_SECS).then(|| "soon".to_string()));
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_warnings() {
        let mut config = PipestateToml::default();
        config.locks.timeout_secs = 0;
        config.checkpoints.max_retained = 0;
        config.logging.level = Some("loud".into());
        let warnings = config.validate();
        assert_eq!(warnings.len(), 3);
        assert!(warnings.iter().any(|w| w.contains("loud")));
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        let mut config = PipestateToml::default();
        config.retries.max_stage_retries = 7;
        config.save(&path).unwrap();

        let loaded = PipestateToml::load_or_default(Some(&path)).unwrap();
        assert_eq!(loaded.retries.max_stage_retries, 7);
    }

    #[test]
    fn test_engine_config_policy() {
        let engine = EngineConfig::new("/data")
            .with_max_checkpoints(5)
            .with_max_stage_retries(2);
        let policy = engine.policy();
        assert_eq!(policy.max_checkpoints, 5);
        assert_eq!(policy.retry_ceiling, 2);
        assert_eq!(engine.lock_timeout, DEFAULT_LOCK_TIMEOUT);
    }
}
