//! Pipeline stages and the per-stage state machine.
//!
//! This module provides:
//! - `Stage`, the closed set of declared pipeline stages in pipeline order
//! - `StageStatus`, the lifecycle of a single stage
//! - `StageRecord`, the persisted per-stage record and its legal transitions
//!
//! Legal moves: `pending → in_progress → completed`, and
//! `in_progress → failed → in_progress` on retry. `failed → failed` records a
//! repeated failure report. Nothing leaves `completed`.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{Result, StateError};

/// A declared pipeline stage.
///
/// Variant order is pipeline order; `Ord` follows it, so a
/// `BTreeMap<Stage, _>` iterates stages in the order they run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Ideation,
    Specification,
    Simulation,
    Architecture,
    Implementation,
    Validation,
    Staging,
}

impl Stage {
    /// All stages in pipeline order.
    pub const ALL: [Stage; 7] = [
        Stage::Ideation,
        Stage::Specification,
        Stage::Simulation,
        Stage::Architecture,
        Stage::Implementation,
        Stage::Validation,
        Stage::Staging,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Ideation => "ideation",
            Stage::Specification => "specification",
            Stage::Simulation => "simulation",
            Stage::Architecture => "architecture",
            Stage::Implementation => "implementation",
            Stage::Validation => "validation",
            Stage::Staging => "staging",
        }
    }

    /// The first stage of every pipeline.
    pub fn first() -> Stage {
        Stage::ALL[0]
    }

    /// The stage whose completion completes the pipeline.
    pub fn last() -> Stage {
        Stage::ALL[Stage::ALL.len() - 1]
    }

    /// The stage that runs after this one, if any.
    pub fn next(&self) -> Option<Stage> {
        let idx = Stage::ALL.iter().position(|s| s == self)?;
        Stage::ALL.get(idx + 1).copied()
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Stage {
    type Err = StateError;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().to_lowercase();
        Stage::ALL
            .iter()
            .copied()
            .find(|stage| stage.as_str() == wanted)
            .ok_or_else(|| StateError::invalid_transition(s, "not a declared pipeline stage"))
    }
}

/// Lifecycle status of one stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageStatus::Pending => "pending",
            StageStatus::InProgress => "in_progress",
            StageStatus::Completed => "completed",
            StageStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for StageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted record of one stage, created on its first start.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StageRecord {
    pub status: StageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<DateTime<Utc>>,
    /// External collaborator that last ran this stage
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    /// Failures recorded so far; never decreases
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub artifacts: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,
    /// Message of the most recent failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StageRecord {
    /// Whether another attempt is still allowed under `ceiling`.
    pub fn retries_exhausted(&self, ceiling: u32) -> bool {
        self.status == StageStatus::Failed && self.retry_count >= ceiling
    }

    pub(crate) fn start(&mut self, stage: Stage, agent: &str, at: DateTime<Utc>) -> Result<()> {
        match self.status {
            StageStatus::Pending | StageStatus::Failed => {}
            StageStatus::InProgress => {
                return Err(StateError::invalid_transition(stage, "stage is already in progress"));
            }
            StageStatus::Completed => {
                return Err(StateError::invalid_transition(stage, "stage is already completed"));
            }
        }
        self.status = StageStatus::InProgress;
        self.started_at = Some(at);
        self.completed_at = None;
        self.agent = Some(agent.to_string());
        Ok(())
    }

    /// Mark completed; returns the stage duration in seconds.
    pub(crate) fn complete(
        &mut self,
        stage: Stage,
        artifacts: &[String],
        at: DateTime<Utc>,
    ) -> Result<f64> {
        if self.status != StageStatus::InProgress {
            return Err(StateError::invalid_transition(
                stage,
                format!("cannot complete a stage that is {}", self.status),
            ));
        }
        let duration = self
            .started_at
            .map(|start| (at - start).num_milliseconds() as f64 / 1000.0)
            .unwrap_or(0.0)
            .max(0.0);
        self.status = StageStatus::Completed;
        self.completed_at = Some(at);
        self.duration_seconds = Some(duration);
        self.artifacts.extend(artifacts.iter().cloned());
        Ok(duration)
    }

    pub(crate) fn fail(&mut self, stage: Stage, message: &str, at: DateTime<Utc>) -> Result<()> {
        match self.status {
            StageStatus::InProgress | StageStatus::Failed => {}
            StageStatus::Pending => {
                return Err(StateError::invalid_transition(stage, "stage was never started"));
            }
            StageStatus::Completed => {
                return Err(StateError::invalid_transition(stage, "stage is already completed"));
            }
        }
        self.status = StageStatus::Failed;
        self.failed_at = Some(at);
        self.retry_count += 1;
        self.error = Some(message.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_stage_order_matches_pipeline() {
        assert_eq!(Stage::first(), Stage::Ideation);
        assert_eq!(Stage::last(), Stage::Staging);
        assert_eq!(Stage::Ideation.next(), Some(Stage::Specification));
        assert_eq!(Stage::Staging.next(), None);
        assert!(Stage::Architecture < Stage::Implementation);
    }

    #[test]
    fn test_stage_from_str() {
        assert_eq!("ideation".parse::<Stage>().unwrap(), Stage::Ideation);
        assert_eq!("VALIDATION".parse::<Stage>().unwrap(), Stage::Validation);
        let err = "deployment".parse::<Stage>().unwrap_err();
        assert!(matches!(err, StateError::InvalidTransition { .. }));
    }

    #[test]
    fn test_stage_serializes_snake_case() {
        assert_eq!(serde_json::to_string(&Stage::Implementation).unwrap(), "\"implementation\"");
        assert_eq!(
            serde_json::to_string(&StageStatus::InProgress).unwrap(),
            "\"in_progress\""
        );
    }

    #[test]
    fn test_record_happy_path() {
        let t0 = Utc::now();
        let mut record = StageRecord::default();
        record.start(Stage::Ideation, "planner", t0).unwrap();
        assert_eq!(record.status, StageStatus::InProgress);
        assert_eq!(record.agent.as_deref(), Some("planner"));

        let duration = record
            .complete(Stage::Ideation, &["plan.md".to_string()], t0 + Duration::seconds(90))
            .unwrap();
        assert_eq!(duration, 90.0);
        assert_eq!(record.status, StageStatus::Completed);
        assert!(record.artifacts.contains("plan.md"));
    }

    #[test]
    fn test_record_rejects_pending_to_terminal() {
        let now = Utc::now();
        let mut record = StageRecord::default();
        assert!(record.complete(Stage::Validation, &[], now).is_err());
        assert!(record.fail(Stage::Validation, "boom", now).is_err());
        assert_eq!(record.status, StageStatus::Pending);
        assert_eq!(record.retry_count, 0);
    }

    #[test]
    fn test_record_retry_cycle() {
        let now = Utc::now();
        let mut record = StageRecord::default();
        record.start(Stage::Validation, "validator", now).unwrap();
        record.fail(Stage::Validation, "3 tests failed", now).unwrap();
        assert_eq!(record.retry_count, 1);
        assert!(!record.retries_exhausted(3));

        record.start(Stage::Validation, "validator", now).unwrap();
        record.fail(Stage::Validation, "2 tests failed", now).unwrap();
        record.fail(Stage::Validation, "2 tests failed", now).unwrap();
        assert_eq!(record.retry_count, 3);
        assert!(record.retries_exhausted(3));
        assert_eq!(record.error.as_deref(), Some("2 tests failed"));
    }

    #[test]
    fn test_completed_is_terminal() {
        let now = Utc::now();
        let mut record = StageRecord::default();
        record.start(Stage::Staging, "deployer", now).unwrap();
        record.complete(Stage::Staging, &[], now).unwrap();
        assert!(record.start(Stage::Staging, "deployer", now).is_err());
        assert!(record.fail(Stage::Staging, "late", now).is_err());
    }
}
