//! Project state and the transition fold.
//!
//! `ProjectState` is a materialized view of `transitions.jsonl`. Every change
//! to it goes through [`ProjectState::apply`], one `TransitionEntry` at a
//! time, both for live operations and for replay. `state.json` is therefore
//! always reproducible from the log.

pub mod manager;
pub mod recovery;

use std::collections::{BTreeMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::checkpoint::{self, Checkpoint, CheckpointDetails, DEFAULT_MAX_CHECKPOINTS};
use crate::errors::{Result, StateError};
use crate::stage::{Stage, StageRecord, StageStatus};
use crate::transitions::{EventType, TransitionEntry};

pub use manager::StateManager;

pub const STATE_VERSION: &str = "1.0.0";
pub const DEFAULT_MAX_STAGE_RETRIES: u32 = 3;
pub const DEFAULT_LABELS: [&str; 2] = ["somas-project", "somas:dev"];

/// Limits that shape how transitions fold into state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatePolicy {
    pub max_checkpoints: usize,
    pub retry_ceiling: u32,
}

impl Default for StatePolicy {
    fn default() -> Self {
        Self {
            max_checkpoints: DEFAULT_MAX_CHECKPOINTS,
            retry_ceiling: DEFAULT_MAX_STAGE_RETRIES,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl ProjectStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectStatus::Pending => "pending",
            ProjectStatus::InProgress => "in_progress",
            ProjectStatus::Completed => "completed",
            ProjectStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for ProjectStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Labels {
    #[serde(default)]
    pub github: Vec<String>,
    #[serde(default)]
    pub custom: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    pub total_duration_seconds: f64,
    #[serde(default)]
    pub stage_durations: BTreeMap<Stage, f64>,
    pub retry_count: u32,
    pub agent_invocations: u32,
    pub artifacts_generated: u32,
    pub dead_letters: u32,
}

/// Where and whether a project can pick up again. Derived, never stored
/// independently of the rest of the state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryInfo {
    pub last_successful_checkpoint: Option<String>,
    pub can_resume: bool,
    pub resume_from_stage: Option<Stage>,
}

impl RecoveryInfo {
    pub fn derive(state: &ProjectState, retry_ceiling: u32) -> Self {
        let last_successful_checkpoint =
            checkpoint::last_successful(&state.checkpoints).map(|c| c.id.clone());

        let resume_from_stage = if state.status == ProjectStatus::Completed {
            None
        } else {
            state.in_progress_stage().or_else(|| {
                if state.stage_status(state.current_stage) == StageStatus::Failed {
                    Some(state.current_stage)
                } else {
                    Stage::ALL
                        .into_iter()
                        .find(|s| state.stage_status(*s) != StageStatus::Completed)
                }
            })
        };

        let can_resume = resume_from_stage.is_some_and(|stage| {
            state
                .stages
                .get(&stage)
                .is_none_or(|record| !record.retries_exhausted(retry_ceiling))
        });

        Self {
            last_successful_checkpoint,
            can_resume,
            resume_from_stage,
        }
    }
}

/// State captured into a dead letter at failure time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub current_stage: Stage,
    pub status: ProjectStatus,
    pub metrics: Metrics,
}

/// Payload of `project_initialized`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct InitDetails {
    pub issue_number: u64,
    pub title: String,
    pub branch: String,
    pub labels: Vec<String>,
}

pub(crate) fn to_metadata<T: Serialize>(value: &T) -> Result<Map<String, Value>> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        _ => Ok(Map::new()),
    }
}

fn from_metadata<T: DeserializeOwned>(entry: &TransitionEntry) -> Result<T> {
    Ok(serde_json::from_value(Value::Object(entry.metadata.clone()))?)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectState {
    pub project_id: String,
    pub version: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub issue_number: u64,
    pub title: String,
    pub branch: String,
    pub current_stage: Stage,
    pub status: ProjectStatus,
    /// Started stages only; absent stages are pending
    #[serde(default)]
    pub stages: BTreeMap<Stage, StageRecord>,
    #[serde(default)]
    pub checkpoints: VecDeque<Checkpoint>,
    #[serde(default)]
    pub labels: Labels,
    #[serde(default)]
    pub metrics: Metrics,
    #[serde(default)]
    pub recovery_info: RecoveryInfo,
    /// Sequence of the last transition folded into this state
    pub last_sequence: u64,
}

impl ProjectState {
    /// Build the initial state from a `project_initialized` entry.
    pub(crate) fn from_initialization(entry: &TransitionEntry, policy: StatePolicy) -> Result<Self> {
        if entry.event_type != EventType::ProjectInitialized {
            return Err(StateError::invalid_transition(
                entry.event_type,
                "history must begin with project_initialized",
            ));
        }
        if entry.sequence != 1 {
            return Err(StateError::invalid_transition(
                entry.event_type,
                format!("initialization at sequence {} instead of 1", entry.sequence),
            ));
        }
        let details: InitDetails = from_metadata(entry)?;
        let mut state = Self {
            project_id: entry.project_id.clone(),
            version: STATE_VERSION.to_string(),
            created_at: entry.timestamp,
            updated_at: entry.timestamp,
            issue_number: details.issue_number,
            title: details.title,
            branch: details.branch,
            current_stage: Stage::first(),
            status: ProjectStatus::Pending,
            stages: BTreeMap::new(),
            checkpoints: VecDeque::new(),
            labels: Labels {
                github: details.labels,
                custom: BTreeMap::new(),
            },
            metrics: Metrics::default(),
            recovery_info: RecoveryInfo::default(),
            last_sequence: entry.sequence,
        };
        state.refresh_recovery_info(policy.retry_ceiling);
        Ok(state)
    }

    /// The `project_initialized` entry this state was built from. Only a
    /// state that has folded nothing else can give it back.
    pub(crate) fn initialization_entry(&self) -> Result<TransitionEntry> {
        if self.last_sequence != 1 {
            return Err(StateError::invalid_transition(
                EventType::ProjectInitialized,
                format!("state has folded history up to sequence {}", self.last_sequence),
            ));
        }
        let details = InitDetails {
            issue_number: self.issue_number,
            title: self.title.clone(),
            branch: self.branch.clone(),
            labels: self.labels.github.clone(),
        };
        let mut entry = TransitionEntry::new(&self.project_id, EventType::ProjectInitialized)
            .with_metadata(to_metadata(&details)?);
        entry.sequence = 1;
        entry.timestamp = self.created_at;
        Ok(entry)
    }

    /// Fold one stamped transition into the state.
    ///
    /// Every check happens before the first mutation, so an `Err` leaves the
    /// state as it was.
    pub(crate) fn apply(&mut self, entry: &TransitionEntry, policy: StatePolicy) -> Result<()> {
        if entry.project_id != self.project_id {
            return Err(StateError::invalid_transition(
                entry.event_type,
                format!("entry belongs to {}", entry.project_id),
            ));
        }
        if entry.sequence != self.last_sequence + 1 {
            return Err(StateError::invalid_transition(
                entry.event_type,
                format!(
                    "sequence {} does not follow {}",
                    entry.sequence, self.last_sequence
                ),
            ));
        }

        match entry.event_type {
            EventType::ProjectInitialized => {
                return Err(StateError::invalid_transition(
                    entry.event_type,
                    "project is already initialized",
                ));
            }
            EventType::StageStarted => {
                let stage = required_stage(entry)?;
                if self.status == ProjectStatus::Completed {
                    return Err(StateError::invalid_transition(stage, "project is already completed"));
                }
                if let Some(active) = self.in_progress_stage()
                    && active != stage
                {
                    return Err(StateError::invalid_transition(
                        stage,
                        format!("stage {} is already in progress", active),
                    ));
                }
                let agent = entry.agent.as_deref().unwrap_or_default();
                let mut record = self.stages.get(&stage).cloned().unwrap_or_default();
                record.start(stage, agent, entry.timestamp)?;
                self.stages.insert(stage, record);
                self.current_stage = stage;
                self.status = ProjectStatus::InProgress;
                self.metrics.agent_invocations += 1;
            }
            EventType::StageCompleted => {
                let stage = required_stage(entry)?;
                let record = self.started_record(stage)?;
                let duration = record.complete(stage, &entry.artifacts, entry.timestamp)?;
                self.metrics.stage_durations.insert(stage, duration);
                self.metrics.total_duration_seconds = self.metrics.stage_durations.values().sum();
                let produced = u32::try_from(entry.artifacts.len()).unwrap_or(u32::MAX);
                self.metrics.artifacts_generated =
                    self.metrics.artifacts_generated.saturating_add(produced);
                self.current_stage = stage;
                self.status = if stage == Stage::last() {
                    ProjectStatus::Completed
                } else {
                    ProjectStatus::InProgress
                };
            }
            EventType::StageFailed => {
                let stage = required_stage(entry)?;
                let message = entry.error.as_ref().map_or("", |e| e.message.as_str());
                self.started_record(stage)?.fail(stage, message, entry.timestamp)?;
                self.metrics.retry_count += 1;
                if self.in_progress_stage().is_none() {
                    self.current_stage = stage;
                    self.status = ProjectStatus::Failed;
                }
            }
            EventType::ErrorRecorded => {
                self.metrics.dead_letters += 1;
            }
            EventType::CheckpointCreated => {
                let stage = required_stage(entry)?;
                let id = entry.checkpoint_id.clone().ok_or_else(|| {
                    StateError::invalid_transition(stage, "checkpoint_created without checkpoint_id")
                })?;
                let details: CheckpointDetails = from_metadata(entry)?;
                checkpoint::retain_push(
                    &mut self.checkpoints,
                    Checkpoint {
                        id,
                        stage,
                        timestamp: entry.timestamp,
                        status: details.status,
                        artifacts: entry.artifacts.clone(),
                        metadata: details.metadata,
                        dead_letter_id: details.dead_letter_id,
                    },
                    policy.max_checkpoints,
                );
            }
            EventType::LabelsUpdated => {
                self.labels = from_metadata(entry)?;
            }
        }

        self.updated_at = entry.timestamp;
        self.last_sequence = entry.sequence;
        self.refresh_recovery_info(policy.retry_ceiling);
        Ok(())
    }

    pub fn refresh_recovery_info(&mut self, retry_ceiling: u32) {
        self.recovery_info = RecoveryInfo::derive(self, retry_ceiling);
    }

    pub fn stage(&self, stage: Stage) -> Option<&StageRecord> {
        self.stages.get(&stage)
    }

    pub fn stage_status(&self, stage: Stage) -> StageStatus {
        self.stages.get(&stage).map_or(StageStatus::Pending, |r| r.status)
    }

    /// The stage currently running, if any. There is at most one.
    pub fn in_progress_stage(&self) -> Option<Stage> {
        self.stages
            .iter()
            .find(|(_, r)| r.status == StageStatus::InProgress)
            .map(|(s, _)| *s)
    }

    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            current_stage: self.current_stage,
            status: self.status,
            metrics: self.metrics.clone(),
        }
    }

    fn started_record(&mut self, stage: Stage) -> Result<&mut StageRecord> {
        self.stages
            .get_mut(&stage)
            .ok_or_else(|| StateError::invalid_transition(stage, "stage was never started"))
    }
}

fn required_stage(entry: &TransitionEntry) -> Result<Stage> {
    entry
        .stage
        .ok_or_else(|| StateError::invalid_transition(entry.event_type, "transition carries no stage"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::CheckpointStatus;
    use crate::transitions::TransitionError;
    use proptest::prelude::*;

    struct Fold {
        state: ProjectState,
        clock: DateTime<Utc>,
    }

    impl Fold {
        fn new() -> Self {
            let clock = Utc::now();
            let mut init = TransitionEntry::new("project-1", EventType::ProjectInitialized)
                .with_metadata(
                    to_metadata(&InitDetails {
                        issue_number: 1,
                        title: "Title".into(),
                        branch: "somas/project-1".into(),
                        labels: vec!["somas-project".into()],
                    })
                    .unwrap(),
                );
            init.sequence = 1;
            init.timestamp = clock;
            let state = ProjectState::from_initialization(&init, StatePolicy::default()).unwrap();
            Self { state, clock }
        }

        fn apply(&mut self, entry: TransitionEntry) -> Result<()> {
            let mut entry = entry;
            self.clock += chrono::Duration::seconds(10);
            entry.sequence = self.state.last_sequence + 1;
            entry.timestamp = self.clock;
            self.state.apply(&entry, StatePolicy::default())
        }

        fn start(&mut self, stage: Stage) -> Result<()> {
            self.apply(
                TransitionEntry::new("project-1", EventType::StageStarted)
                    .with_stage(stage)
                    .with_agent("agent"),
            )
        }

        fn complete(&mut self, stage: Stage) -> Result<()> {
            self.apply(
                TransitionEntry::new("project-1", EventType::StageCompleted)
                    .with_stage(stage)
                    .with_artifacts(&[format!("{stage}.md")]),
            )
        }

        fn fail(&mut self, stage: Stage) -> Result<()> {
            self.apply(
                TransitionEntry::new("project-1", EventType::StageFailed)
                    .with_stage(stage)
                    .with_error(TransitionError {
                        error_type: "TestFailureError".into(),
                        message: "3 tests failed".into(),
                        dead_letter_id: None,
                    }),
            )
        }

        fn checkpoint(&mut self, stage: Stage, id: &str, status: CheckpointStatus) -> Result<()> {
            let details = CheckpointDetails {
                status,
                ..CheckpointDetails::default()
            };
            self.apply(
                TransitionEntry::new("project-1", EventType::CheckpointCreated)
                    .with_stage(stage)
                    .with_checkpoint(id)
                    .with_metadata(to_metadata(&details).unwrap()),
            )
        }
    }

    #[test]
    fn test_initial_state() {
        let fold = Fold::new();
        let state = &fold.state;
        assert_eq!(state.status, ProjectStatus::Pending);
        assert_eq!(state.current_stage, Stage::Ideation);
        assert!(state.stages.is_empty());
        assert_eq!(state.labels.github, vec!["somas-project".to_string()]);
        assert_eq!(state.recovery_info.resume_from_stage, Some(Stage::Ideation));
        assert!(state.recovery_info.can_resume);
    }

    #[test]
    fn test_initialization_entry_rebuilds_initial_state() {
        let fold = Fold::new();
        let entry = fold.state.initialization_entry().unwrap();
        assert_eq!(entry.sequence, 1);
        assert_eq!(entry.timestamp, fold.state.created_at);

        let rebuilt = ProjectState::from_initialization(&entry, StatePolicy::default()).unwrap();
        assert_eq!(rebuilt, fold.state);
    }

    #[test]
    fn test_initialization_entry_refuses_later_state() {
        let mut fold = Fold::new();
        fold.start(Stage::Ideation).unwrap();
        assert!(matches!(
            fold.state.initialization_entry().unwrap_err(),
            StateError::InvalidTransition { .. }
        ));
    }

    #[test]
    fn test_artifact_count_saturates() {
        let mut fold = Fold::new();
        fold.state.metrics.artifacts_generated = u32::MAX - 1;
        fold.start(Stage::Ideation).unwrap();
        fold.apply(
            TransitionEntry::new("project-1", EventType::StageCompleted)
                .with_stage(Stage::Ideation)
                .with_artifacts(&["a.md".to_string(), "b.md".to_string(), "c.md".to_string()]),
        )
        .unwrap();
        assert_eq!(fold.state.metrics.artifacts_generated, u32::MAX);
    }

    #[test]
    fn test_complete_stage_continues_pipeline() {
        let mut fold = Fold::new();
        fold.start(Stage::Ideation).unwrap();
        fold.complete(Stage::Ideation).unwrap();

        let state = &fold.state;
        assert_eq!(state.status, ProjectStatus::InProgress);
        assert_eq!(state.stage_status(Stage::Ideation), StageStatus::Completed);
        assert_eq!(state.metrics.stage_durations[&Stage::Ideation], 10.0);
        assert_eq!(state.metrics.artifacts_generated, 1);
        assert_eq!(state.recovery_info.resume_from_stage, Some(Stage::Specification));
    }

    #[test]
    fn test_second_stage_cannot_start_while_one_runs() {
        let mut fold = Fold::new();
        fold.start(Stage::Ideation).unwrap();
        let before = fold.state.clone();
        let err = fold.start(Stage::Specification).unwrap_err();
        assert!(matches!(err, StateError::InvalidTransition { .. }));
        assert_eq!(fold.state, before);
    }

    #[test]
    fn test_complete_pending_stage_rejected() {
        let mut fold = Fold::new();
        let err = fold.complete(Stage::Validation).unwrap_err();
        assert!(matches!(err, StateError::InvalidTransition { .. }));
    }

    #[test]
    fn test_failure_marks_project_failed() {
        let mut fold = Fold::new();
        fold.start(Stage::Ideation).unwrap();
        fold.fail(Stage::Ideation).unwrap();

        let state = &fold.state;
        assert_eq!(state.status, ProjectStatus::Failed);
        assert_eq!(state.stage(Stage::Ideation).unwrap().retry_count, 1);
        assert_eq!(state.metrics.retry_count, 1);
        assert_eq!(state.recovery_info.resume_from_stage, Some(Stage::Ideation));
        assert!(state.recovery_info.can_resume);
    }

    #[test]
    fn test_failure_of_other_stage_keeps_running_stage_current() {
        let mut fold = Fold::new();
        fold.start(Stage::Ideation).unwrap();
        fold.fail(Stage::Ideation).unwrap();
        fold.start(Stage::Specification).unwrap();
        fold.fail(Stage::Ideation).unwrap();

        assert_eq!(fold.state.status, ProjectStatus::InProgress);
        assert_eq!(fold.state.current_stage, Stage::Specification);
        assert_eq!(fold.state.stage(Stage::Ideation).unwrap().retry_count, 2);
    }

    #[test]
    fn test_exhausted_retries_block_resume() {
        let mut fold = Fold::new();
        fold.start(Stage::Validation).unwrap();
        for _ in 0..3 {
            fold.fail(Stage::Validation).unwrap();
        }
        let info = &fold.state.recovery_info;
        assert_eq!(info.resume_from_stage, Some(Stage::Validation));
        assert!(!info.can_resume);
    }

    #[test]
    fn test_last_stage_completes_project() {
        let mut fold = Fold::new();
        for stage in Stage::ALL {
            fold.start(stage).unwrap();
            fold.complete(stage).unwrap();
        }
        assert_eq!(fold.state.status, ProjectStatus::Completed);
        assert_eq!(fold.state.recovery_info.resume_from_stage, None);
        assert!(!fold.state.recovery_info.can_resume);
        assert!(fold.start(Stage::Ideation).is_err());
        assert_eq!(fold.state.metrics.total_duration_seconds, 70.0);
    }

    #[test]
    fn test_checkpoints_and_last_successful() {
        let mut fold = Fold::new();
        fold.checkpoint(Stage::Ideation, "chk-a", CheckpointStatus::Success).unwrap();
        fold.checkpoint(Stage::Ideation, "chk-b", CheckpointStatus::Partial).unwrap();
        assert_eq!(fold.state.checkpoints.len(), 2);
        assert_eq!(
            fold.state.recovery_info.last_successful_checkpoint.as_deref(),
            Some("chk-a")
        );
    }

    #[test]
    fn test_out_of_sequence_entry_rejected() {
        let mut fold = Fold::new();
        let mut entry = TransitionEntry::new("project-1", EventType::StageStarted)
            .with_stage(Stage::Ideation)
            .with_agent("planner");
        entry.sequence = 5;
        let err = fold.state.apply(&entry, StatePolicy::default()).unwrap_err();
        assert!(matches!(err, StateError::InvalidTransition { .. }));
    }

    #[test]
    fn test_labels_replace() {
        let mut fold = Fold::new();
        let labels = Labels {
            github: vec!["somas:impl".into()],
            custom: BTreeMap::from([("priority".to_string(), "high".to_string())]),
        };
        fold.apply(
            TransitionEntry::new("project-1", EventType::LabelsUpdated)
                .with_metadata(to_metadata(&labels).unwrap()),
        )
        .unwrap();
        assert_eq!(fold.state.labels, labels);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Start(Stage),
        Complete(Stage),
        Fail(Stage),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        let stage = prop::sample::select(Stage::ALL.to_vec());
        prop_oneof![
            stage.clone().prop_map(Op::Start),
            stage.clone().prop_map(Op::Complete),
            stage.prop_map(Op::Fail),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(256))]

        /// Arbitrary call sequences never break the stage machine.
        #[test]
        fn test_random_operations_keep_state_consistent(ops in prop::collection::vec(op_strategy(), 1..60)) {
            let mut fold = Fold::new();
            for op in ops {
                let before = fold.state.clone();
                let (stage, result) = match op {
                    Op::Start(s) => (s, fold.start(s)),
                    Op::Complete(s) => (s, fold.complete(s)),
                    Op::Fail(s) => (s, fold.fail(s)),
                };

                if result.is_err() {
                    prop_assert_eq!(&fold.state, &before);
                    continue;
                }

                let running = fold
                    .state
                    .stages
                    .values()
                    .filter(|r| r.status == StageStatus::InProgress)
                    .count();
                prop_assert!(running <= 1);

                for (s, record) in &fold.state.stages {
                    let old = before.stages.get(s).map_or(0, |r| r.retry_count);
                    prop_assert!(record.retry_count >= old);
                }

                // Nothing reaches completed or failed without having started.
                if before.stage_status(stage) == StageStatus::Pending {
                    prop_assert_eq!(fold.state.stage_status(stage), StageStatus::InProgress);
                }
            }
        }
    }
}
