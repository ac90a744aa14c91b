//! Dead-letter store (`dead_letters.json`).
//!
//! Every failed execution attempt is kept here with enough context to replay
//! it or decide on recovery. Entries are never removed. After an entry is
//! appended only its recovery bookkeeping changes (`recovery_attempted`,
//! `recovery_result`, `replay_count`).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::errors::{Result, StateError};
use crate::stage::Stage;
use crate::state::{Labels, StateSnapshot};
use crate::storage::atomic;
use crate::storage::{LockSet, ProjectFile};

pub const DEAD_LETTERS_VERSION: &str = "1.0.0";

/// Structured description of what went wrong.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    #[serde(rename = "type")]
    pub error_type: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

impl ErrorInfo {
    pub fn new(error_type: &str, message: &str) -> Self {
        Self {
            error_type: error_type.to_string(),
            message: message.to_string(),
            exit_code: None,
        }
    }

    pub fn with_exit_code(mut self, exit_code: i32) -> Self {
        self.exit_code = Some(exit_code);
        self
    }
}

/// Everything known about the attempt when it failed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FailureContext {
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub inputs: Map<String, Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environment: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<String>,
    /// Request sent to the agent, verbatim
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub trace: Vec<Value>,
    /// Filled in by the engine
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_snapshot: Option<StateSnapshot>,
    /// Caller-specific keys kept as-is
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryResult {
    #[default]
    Pending,
    Success,
    Failed,
}

impl std::fmt::Display for RecoveryResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecoveryResult::Pending => write!(f, "pending"),
            RecoveryResult::Success => write!(f, "success"),
            RecoveryResult::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for RecoveryResult {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(RecoveryResult::Pending),
            "success" => Ok(RecoveryResult::Success),
            "failed" => Ok(RecoveryResult::Failed),
            _ => anyhow::bail!(
                "Invalid recovery result '{}'. Valid values: pending, success, failed",
                s
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub stage: Stage,
    pub agent: String,
    pub attempt_number: u32,
    pub error: ErrorInfo,
    pub context: FailureContext,
    #[serde(default)]
    pub labels: Labels,
    /// Newest successful checkpoint when the attempt failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_id: Option<String>,
    #[serde(default)]
    pub recovery_attempted: bool,
    #[serde(default)]
    pub recovery_result: RecoveryResult,
    #[serde(default)]
    pub replay_count: u32,
}

impl DeadLetterEntry {
    /// Unrecovered unless a recovery was attempted and succeeded.
    pub fn is_unrecovered(&self) -> bool {
        !(self.recovery_attempted && self.recovery_result == RecoveryResult::Success)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterStatistics {
    pub total_entries: u64,
    pub by_stage: BTreeMap<Stage, u64>,
    pub by_agent: BTreeMap<String, u64>,
    pub recovered: u64,
    pub unrecovered: u64,
}

impl DeadLetterStatistics {
    pub fn from_entries(entries: &[DeadLetterEntry]) -> Self {
        let mut stats = Self::default();
        for entry in entries {
            stats.total_entries += 1;
            *stats.by_stage.entry(entry.stage).or_default() += 1;
            *stats.by_agent.entry(entry.agent.clone()).or_default() += 1;
            if entry.is_unrecovered() {
                stats.unrecovered += 1;
            } else {
                stats.recovered += 1;
            }
        }
        stats
    }
}

/// On-disk document of `dead_letters.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterFile {
    pub project_id: String,
    pub version: String,
    pub entries: Vec<DeadLetterEntry>,
    pub statistics: DeadLetterStatistics,
}

impl DeadLetterFile {
    pub fn empty(project_id: &str) -> Self {
        Self {
            project_id: project_id.to_string(),
            version: DEAD_LETTERS_VERSION.to_string(),
            entries: Vec::new(),
            statistics: DeadLetterStatistics::default(),
        }
    }
}

/// Filters for dead-letter queries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeadLetterFilter {
    pub stage: Option<Stage>,
    pub agent: Option<String>,
    pub unrecovered_only: bool,
}

impl DeadLetterFilter {
    pub fn unrecovered() -> Self {
        Self {
            unrecovered_only: true,
            ..Self::default()
        }
    }

    pub fn matches(&self, entry: &DeadLetterEntry) -> bool {
        self.stage.is_none_or(|s| entry.stage == s)
            && self.agent.as_deref().is_none_or(|a| entry.agent == a)
            && (!self.unrecovered_only || entry.is_unrecovered())
    }
}

/// Handle on one project's dead-letter file.
#[derive(Debug, Clone)]
pub struct DeadLetterStore {
    project_id: String,
    path: PathBuf,
}

impl DeadLetterStore {
    pub fn new(project_id: &str, path: PathBuf) -> Self {
        Self {
            project_id: project_id.to_string(),
            path,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the file; a missing file reads as empty. Takes no lock.
    pub fn load(&self) -> Result<DeadLetterFile> {
        Ok(atomic::read_json(&self.path)?.unwrap_or_else(|| DeadLetterFile::empty(&self.project_id)))
    }

    pub fn query(&self, filter: &DeadLetterFilter) -> Result<Vec<DeadLetterEntry>> {
        Ok(self
            .load()?
            .entries
            .into_iter()
            .filter(|e| filter.matches(e))
            .collect())
    }

    pub(crate) fn initialize_locked(&self, locks: &LockSet) -> Result<()> {
        debug_assert!(locks.holds(ProjectFile::DeadLetters));
        atomic::write_json(&self.path, &DeadLetterFile::empty(&self.project_id))
    }

    pub(crate) fn append_locked(&self, entry: &DeadLetterEntry, locks: &LockSet) -> Result<()> {
        debug_assert!(locks.holds(ProjectFile::DeadLetters));
        let mut file = self.load()?;
        file.entries.push(entry.clone());
        file.statistics = DeadLetterStatistics::from_entries(&file.entries);
        atomic::write_json(&self.path, &file)?;
        debug!(
            project_id = %self.project_id,
            dead_letter_id = %entry.id,
            stage = %entry.stage,
            attempt = entry.attempt_number,
            "dead letter recorded"
        );
        Ok(())
    }

    /// Apply `update` to the recovery fields of entry `id`.
    pub(crate) fn update_locked(
        &self,
        id: &str,
        locks: &LockSet,
        update: impl FnOnce(&mut RecoveryFields<'_>),
    ) -> Result<DeadLetterEntry> {
        debug_assert!(locks.holds(ProjectFile::DeadLetters));
        let mut file = self.load()?;
        let entry = file
            .entries
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or_else(|| StateError::DeadLetterNotFound { id: id.to_string() })?;
        update(&mut RecoveryFields {
            recovery_attempted: &mut entry.recovery_attempted,
            recovery_result: &mut entry.recovery_result,
            replay_count: &mut entry.replay_count,
        });
        let updated = entry.clone();
        file.statistics = DeadLetterStatistics::from_entries(&file.entries);
        atomic::write_json(&self.path, &file)?;
        Ok(updated)
    }
}

/// The only mutable part of a dead-letter entry.
pub(crate) struct RecoveryFields<'a> {
    pub recovery_attempted: &'a mut bool,
    pub recovery_result: &'a mut RecoveryResult,
    pub replay_count: &'a mut u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::ProjectPaths;
    use std::time::Duration;
    use tempfile::TempDir;

    fn entry(id: &str, stage: Stage, agent: &str) -> DeadLetterEntry {
        DeadLetterEntry {
            id: id.to_string(),
            timestamp: Utc::now(),
            stage,
            agent: agent.to_string(),
            attempt_number: 1,
            error: ErrorInfo::new("TestFailureError", "3 tests failed"),
            context: FailureContext::default(),
            labels: Labels::default(),
            checkpoint_id: None,
            recovery_attempted: false,
            recovery_result: RecoveryResult::Pending,
            replay_count: 0,
        }
    }

    fn setup() -> (TempDir, ProjectPaths, DeadLetterStore) {
        let dir = TempDir::new().unwrap();
        let paths = ProjectPaths::new(dir.path(), "project-1").unwrap();
        paths.ensure_dir().unwrap();
        let store = DeadLetterStore::new("project-1", paths.dead_letters());
        (dir, paths, store)
    }

    fn locks(paths: &ProjectPaths) -> LockSet {
        LockSet::acquire(paths, &[ProjectFile::DeadLetters], Duration::from_secs(1)).unwrap()
    }

    #[test]
    fn test_missing_file_loads_empty() {
        let (_dir, _paths, store) = setup();
        let file = store.load().unwrap();
        assert!(file.entries.is_empty());
        assert_eq!(file.project_id, "project-1");
    }

    #[test]
    fn test_append_updates_statistics() {
        let (_dir, paths, store) = setup();
        let locks = locks(&paths);
        store.append_locked(&entry("a", Stage::Validation, "validator"), &locks).unwrap();
        store.append_locked(&entry("b", Stage::Validation, "validator"), &locks).unwrap();
        store.append_locked(&entry("c", Stage::Implementation, "coder"), &locks).unwrap();

        let stats = store.load().unwrap().statistics;
        assert_eq!(stats.total_entries, 3);
        assert_eq!(stats.by_stage[&Stage::Validation], 2);
        assert_eq!(stats.by_agent["coder"], 1);
        assert_eq!(stats.unrecovered, 3);
        assert_eq!(stats.recovered, 0);
    }

    #[test]
    fn test_query_filters() {
        let (_dir, paths, store) = setup();
        let locks = locks(&paths);
        store.append_locked(&entry("a", Stage::Validation, "validator"), &locks).unwrap();
        store.append_locked(&entry("b", Stage::Implementation, "coder"), &locks).unwrap();

        let by_stage = store
            .query(&DeadLetterFilter {
                stage: Some(Stage::Implementation),
                ..DeadLetterFilter::default()
            })
            .unwrap();
        assert_eq!(by_stage.len(), 1);
        assert_eq!(by_stage[0].id, "b");

        let by_agent = store
            .query(&DeadLetterFilter {
                agent: Some("validator".into()),
                ..DeadLetterFilter::default()
            })
            .unwrap();
        assert_eq!(by_agent.len(), 1);
        assert_eq!(by_agent[0].id, "a");
    }

    #[test]
    fn test_recovery_update_moves_statistics() {
        let (_dir, paths, store) = setup();
        let locks = locks(&paths);
        store.append_locked(&entry("a", Stage::Validation, "validator"), &locks).unwrap();
        store.append_locked(&entry("b", Stage::Validation, "validator"), &locks).unwrap();

        let updated = store
            .update_locked("a", &locks, |fields| {
                *fields.recovery_attempted = true;
                *fields.recovery_result = RecoveryResult::Success;
            })
            .unwrap();
        assert!(!updated.is_unrecovered());

        let file = store.load().unwrap();
        assert_eq!(file.statistics.recovered, 1);
        assert_eq!(file.statistics.unrecovered, 1);

        let unrecovered = store.query(&DeadLetterFilter::unrecovered()).unwrap();
        assert_eq!(unrecovered.len(), 1);
        assert_eq!(unrecovered[0].id, "b");
    }

    #[test]
    fn test_failed_recovery_stays_unrecovered() {
        let mut e = entry("a", Stage::Validation, "validator");
        e.recovery_attempted = true;
        e.recovery_result = RecoveryResult::Failed;
        assert!(e.is_unrecovered());
    }

    #[test]
    fn test_update_unknown_id() {
        let (_dir, paths, store) = setup();
        let locks = locks(&paths);
        let err = store.update_locked("missing", &locks, |_| {}).unwrap_err();
        assert!(matches!(err, StateError::DeadLetterNotFound { .. }));
    }

    #[test]
    fn test_context_keeps_caller_keys() {
        let json = r#"{"test_suite": "integration_tests", "artifacts": ["log.txt"]}"#;
        let ctx: FailureContext = serde_json::from_str(json).unwrap();
        assert_eq!(ctx.artifacts, vec!["log.txt".to_string()]);
        assert_eq!(ctx.extra["test_suite"], "integration_tests");

        let back = serde_json::to_value(&ctx).unwrap();
        assert_eq!(back["test_suite"], "integration_tests");
    }
}
