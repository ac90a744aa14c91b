//! Public API of the state engine.
//!
//! `StateManager` owns one `ProjectHandle` per project it has touched. A
//! handle is the only in-process path to a project's files: its gate lets one
//! operation at a time through, and the file locks it then takes serialize
//! against other processes.
//!
//! Handles nobody is using are evicted when a new project is touched, so a
//! long-lived manager holds one handle per project in flight.
//!
//! Every write operation follows the same shape:
//! 1. pass the gate, take the file locks in rank order
//! 2. load `state.json`, reconciling it with the log if they disagree
//! 3. build the transitions, stamp them, fold them into the state
//! 4. write `state.json`, then `dead_letters.json`, then append the log
//!
//! Reads take no lock and may trail a concurrent write.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::checkpoint::{Checkpoint, CheckpointDetails, NewCheckpoint, new_checkpoint_id};
use crate::config::EngineConfig;
use crate::dead_letter::{
    DeadLetterEntry, DeadLetterFilter, DeadLetterStore, ErrorInfo, FailureContext, RecoveryResult,
};
use crate::errors::{IntegrityWarning, Result, StateError};
use crate::stage::Stage;
use crate::storage::{LockSet, ProjectFile, ProjectPaths, atomic};
use crate::transitions::{
    EventType, TransitionEntry, TransitionError, TransitionFilter, TransitionIter, TransitionLog,
    most_recent,
};

use super::{DEFAULT_LABELS, InitDetails, Labels, ProjectState, StatePolicy, recovery, to_metadata};

/// Lets one in-process operation at a time work on a project.
#[derive(Debug, Default)]
struct ProjectGate {
    busy: Mutex<bool>,
    released: Condvar,
}

impl ProjectGate {
    fn enter(&self, deadline: Instant, timeout: Duration, dir: &Path) -> Result<GateTurn<'_>> {
        let mut busy = self.busy.lock().map_err(|_| StateError::LockPoisoned)?;
        while *busy {
            let now = Instant::now();
            if now >= deadline {
                return Err(StateError::LockTimeout {
                    path: dir.to_path_buf(),
                    timeout,
                });
            }
            busy = self
                .released
                .wait_timeout(busy, deadline - now)
                .map_err(|_| StateError::LockPoisoned)?
                .0;
        }
        *busy = true;
        Ok(GateTurn { gate: self })
    }
}

struct GateTurn<'a> {
    gate: &'a ProjectGate,
}

impl Drop for GateTurn<'_> {
    fn drop(&mut self) {
        let mut busy: MutexGuard<'_, bool> = match self.gate.busy.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *busy = false;
        self.gate.released.notify_one();
    }
}

/// Single owner of one project's files within this process.
#[derive(Debug)]
struct ProjectHandle {
    paths: ProjectPaths,
    log: TransitionLog,
    dead_letters: DeadLetterStore,
    gate: ProjectGate,
}

impl ProjectHandle {
    fn new(paths: ProjectPaths) -> Self {
        let log = TransitionLog::new(paths.transitions());
        let dead_letters = DeadLetterStore::new(paths.project_id(), paths.dead_letters());
        Self {
            paths,
            log,
            dead_letters,
            gate: ProjectGate::default(),
        }
    }

    fn project_id(&self) -> &str {
        self.paths.project_id()
    }

    fn write_state(&self, state: &ProjectState) -> Result<()> {
        atomic::write_json(&self.paths.state(), state)
    }
}

/// Persistent state of pipeline projects.
#[derive(Debug)]
pub struct StateManager {
    config: EngineConfig,
    handles: Mutex<HashMap<String, Arc<ProjectHandle>>>,
}

impl StateManager {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            handles: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn policy(&self) -> StatePolicy {
        self.config.policy()
    }

    fn handle(&self, project_id: &str) -> Result<Arc<ProjectHandle>> {
        let mut handles = self.handles.lock().map_err(|_| StateError::LockPoisoned)?;
        if let Some(handle) = handles.get(project_id) {
            return Ok(Arc::clone(handle));
        }
        let paths = ProjectPaths::new(&self.config.projects_dir, project_id)?;
        // Clones are only made under this mutex, so a count of one means idle.
        handles.retain(|_, handle| Arc::strong_count(handle) > 1);
        let handle = Arc::new(ProjectHandle::new(paths));
        handles.insert(project_id.to_string(), Arc::clone(&handle));
        Ok(handle)
    }

    /// Run `op` with the project's gate and `files` locked.
    fn locked<T>(
        &self,
        handle: &ProjectHandle,
        files: &[ProjectFile],
        op: impl FnOnce(&LockSet) -> Result<T>,
    ) -> Result<T> {
        let timeout = self.config.lock_timeout;
        let deadline = Instant::now() + timeout;
        let _turn = handle.gate.enter(deadline, timeout, handle.paths.dir())?;
        let locks = LockSet::acquire_until(&handle.paths, files, deadline, timeout)?;
        op(&locks)
    }

    /// Handle of a project that must already exist on disk.
    fn existing(&self, project_id: &str) -> Result<Arc<ProjectHandle>> {
        let handle = self.handle(project_id)?;
        if !handle.paths.dir().is_dir() {
            return Err(StateError::ProjectNotFound {
                project_id: project_id.to_string(),
            });
        }
        Ok(handle)
    }

    /// Load the state for a write, rebuilding it from the log when the two
    /// disagree. The log wins.
    fn load_for_write(&self, handle: &ProjectHandle, locks: &LockSet) -> Result<ProjectState> {
        debug_assert!(locks.holds(ProjectFile::State) && locks.holds(ProjectFile::Transitions));
        let project_id = handle.project_id();

        let log_sequence = handle
            .log
            .last_entry()
            .map_err(|e| unrecoverable_if_corrupt(project_id, e))?
            .map(|e| e.sequence);

        let (stored, corrupt) = match atomic::read_json::<ProjectState>(&handle.paths.state()) {
            Ok(stored) => (stored, None),
            Err(StateError::CorruptedState { reason, .. }) => (None, Some(reason)),
            Err(e) => return Err(e),
        };

        let reason = match (stored, log_sequence) {
            (Some(state), Some(seq)) if state.last_sequence == seq => return Ok(state),
            (Some(state), Some(seq)) if state.last_sequence > seq => IntegrityWarning::TransitionLogBehind {
                state_sequence: state.last_sequence,
                log_sequence: seq,
            }
            .to_string(),
            (Some(state), Some(seq)) => format!(
                "state file is at sequence {} but the log continues to {}",
                state.last_sequence, seq
            ),
            (Some(state), None) if state.last_sequence == 1 => {
                self.restore_initialization(handle, locks, &state)?;
                return Ok(state);
            }
            (Some(_), None) => {
                return Err(StateError::Unrecoverable {
                    project_id: project_id.to_string(),
                    reason: "state file exists but the transition log is empty".to_string(),
                });
            }
            (None, Some(_)) => corrupt.unwrap_or_else(|| "state file is missing".to_string()),
            (None, None) => {
                return Err(match corrupt {
                    Some(reason) => StateError::Unrecoverable {
                        project_id: project_id.to_string(),
                        reason: format!("state file is corrupted ({reason}) and the transition log is empty"),
                    },
                    None => StateError::ProjectNotFound {
                        project_id: project_id.to_string(),
                    },
                });
            }
        };

        warn!(project_id, %reason, "Rebuilding state file from transition log");
        let state = recovery::replay(&handle.log, project_id, self.policy())?;
        handle.write_state(&state)?;
        Ok(state)
    }

    /// Put back the `project_initialized` entry of a project whose log lost
    /// it, from a state file that has folded nothing else.
    fn restore_initialization(
        &self,
        handle: &ProjectHandle,
        locks: &LockSet,
        state: &ProjectState,
    ) -> Result<()> {
        warn!(
            project_id = handle.project_id(),
            "Restoring project_initialized entry from state file"
        );
        let entry = state.initialization_entry()?;
        handle.log.restore_first(&entry, locks)
    }

    /// Stamp `entries` and fold them into `state`.
    fn fold(
        &self,
        handle: &ProjectHandle,
        locks: &LockSet,
        mut state: ProjectState,
        entries: &mut [TransitionEntry],
    ) -> Result<ProjectState> {
        handle.log.stamp(entries, locks)?;
        for entry in entries.iter() {
            state.apply(entry, self.policy())?;
        }
        Ok(state)
    }

    fn log_committed(entries: &[TransitionEntry]) {
        for entry in entries {
            info!(
                project_id = %entry.project_id,
                sequence = entry.sequence,
                event = %entry.event_type,
                stage = entry.stage.map(|s| s.as_str()),
                "transition committed"
            );
        }
    }

    // =========================================
    // Project lifecycle
    // =========================================

    /// Create a project. Fails with `AlreadyExists` if it has a state file
    /// or any logged history.
    ///
    /// `branch` defaults to `somas/<project_id>`; `labels` to the standard
    /// project labels.
    pub fn initialize_project(
        &self,
        project_id: &str,
        issue_number: u64,
        title: &str,
        branch: Option<&str>,
        labels: Option<Vec<String>>,
    ) -> Result<ProjectState> {
        debug!(project_id, issue_number, "initialize_project");
        let handle = self.handle(project_id)?;
        handle.paths.ensure_dir()?;

        let files = [ProjectFile::State, ProjectFile::DeadLetters, ProjectFile::Transitions];
        self.locked(&handle, &files, |locks| {
            let has_history = handle
                .log
                .has_entries()
                .map_err(|e| unrecoverable_if_corrupt(project_id, e))?;
            if handle.paths.state().exists() || has_history {
                return Err(StateError::AlreadyExists {
                    project_id: project_id.to_string(),
                });
            }

            let details = InitDetails {
                issue_number,
                title: title.to_string(),
                branch: branch.map_or_else(|| format!("somas/{}", project_id), str::to_string),
                labels: labels
                    .unwrap_or_else(|| DEFAULT_LABELS.iter().map(|l| l.to_string()).collect()),
            };
            let mut entries = [TransitionEntry::new(project_id, EventType::ProjectInitialized)
                .with_metadata(to_metadata(&details)?)];
            handle.log.stamp(&mut entries, locks)?;
            let state = ProjectState::from_initialization(&entries[0], self.policy())?;

            // Log first: a project whose log holds its initialization can
            // always be rebuilt.
            handle.log.append_locked(&entries, locks)?;
            handle.write_state(&state)?;
            handle.dead_letters.initialize_locked(locks)?;
            Self::log_committed(&entries);
            Ok(state)
        })
    }

    /// Start (or retry) `stage` with the configured retry ceiling.
    pub fn start_stage(&self, project_id: &str, stage: Stage, agent: &str) -> Result<ProjectState> {
        self.start_stage_with_ceiling(project_id, stage, agent, self.config.max_stage_retries)
    }

    /// Start (or retry) `stage`. A failed stage whose `retry_count` has
    /// reached `retry_ceiling` cannot be started again.
    pub fn start_stage_with_ceiling(
        &self,
        project_id: &str,
        stage: Stage,
        agent: &str,
        retry_ceiling: u32,
    ) -> Result<ProjectState> {
        debug!(project_id, %stage, agent, "start_stage");
        let handle = self.existing(project_id)?;
        self.locked(&handle, &[ProjectFile::State, ProjectFile::Transitions], |locks| {
            let state = self.load_for_write(&handle, locks)?;
            if let Some(record) = state.stage(stage)
                && record.retries_exhausted(retry_ceiling)
            {
                return Err(StateError::invalid_transition(
                    stage,
                    format!(
                        "retries exhausted ({} failures, ceiling {})",
                        record.retry_count, retry_ceiling
                    ),
                ));
            }

            let mut entries = [TransitionEntry::new(project_id, EventType::StageStarted)
                .with_stage(stage)
                .with_agent(agent)];
            let state = self.fold(&handle, locks, state, &mut entries)?;

            handle.write_state(&state)?;
            handle.log.append_locked(&entries, locks)?;
            Self::log_committed(&entries);
            Ok(state)
        })
    }

    /// Complete the in-progress `stage`, optionally checkpointing it in the
    /// same operation.
    pub fn complete_stage(
        &self,
        project_id: &str,
        stage: Stage,
        artifacts: &[String],
        create_checkpoint: bool,
    ) -> Result<ProjectState> {
        debug!(project_id, %stage, artifacts = artifacts.len(), "complete_stage");
        let handle = self.existing(project_id)?;
        self.locked(&handle, &[ProjectFile::State, ProjectFile::Transitions], |locks| {
            let state = self.load_for_write(&handle, locks)?;

            let mut completed = TransitionEntry::new(project_id, EventType::StageCompleted)
                .with_stage(stage)
                .with_artifacts(artifacts);
            if let Some(agent) = state.stage(stage).and_then(|r| r.agent.as_deref()) {
                completed = completed.with_agent(agent);
            }
            let mut entries = vec![];
            if create_checkpoint {
                let checkpoint_id = new_checkpoint_id();
                entries.push(completed.with_checkpoint(&checkpoint_id));
                entries.push(
                    TransitionEntry::new(project_id, EventType::CheckpointCreated)
                        .with_stage(stage)
                        .with_checkpoint(&checkpoint_id)
                        .with_artifacts(artifacts)
                        .with_metadata(to_metadata(&CheckpointDetails::default())?),
                );
            } else {
                entries.push(completed);
            }
            let state = self.fold(&handle, locks, state, &mut entries)?;

            handle.write_state(&state)?;
            handle.log.append_locked(&entries, locks)?;
            Self::log_committed(&entries);
            Ok(state)
        })
    }

    /// Record a failed attempt at `stage`.
    ///
    /// Business failures are not errors: this returns `Ok` with the stage
    /// marked failed and a dead letter written. Only engine failures (lock
    /// timeout, I/O, corruption) and illegal transitions are `Err`.
    pub fn fail_stage(
        &self,
        project_id: &str,
        stage: Stage,
        agent: &str,
        error: ErrorInfo,
        context: FailureContext,
    ) -> Result<ProjectState> {
        self.record_failure(project_id, stage, agent, error, context)
            .map(|(state, _)| state)
    }

    /// As `fail_stage`, returning the dead letter that was written.
    pub fn add_dead_letter(
        &self,
        project_id: &str,
        stage: Stage,
        agent: &str,
        error: ErrorInfo,
        context: FailureContext,
    ) -> Result<DeadLetterEntry> {
        self.record_failure(project_id, stage, agent, error, context)
            .map(|(_, dead_letter)| dead_letter)
    }

    fn record_failure(
        &self,
        project_id: &str,
        stage: Stage,
        agent: &str,
        error: ErrorInfo,
        context: FailureContext,
    ) -> Result<(ProjectState, DeadLetterEntry)> {
        debug!(project_id, %stage, agent, error_type = %error.error_type, "fail_stage");
        let handle = self.existing(project_id)?;
        let files = [ProjectFile::State, ProjectFile::DeadLetters, ProjectFile::Transitions];
        self.locked(&handle, &files, |locks| {
            let before = self.load_for_write(&handle, locks)?;
            let dead_letter_id = uuid::Uuid::new_v4().to_string();
            let summary = TransitionError {
                error_type: error.error_type.clone(),
                message: error.message.clone(),
                dead_letter_id: Some(dead_letter_id.clone()),
            };

            let mut entries = [
                TransitionEntry::new(project_id, EventType::StageFailed)
                    .with_stage(stage)
                    .with_agent(agent)
                    .with_error(summary.clone()),
                TransitionEntry::new(project_id, EventType::ErrorRecorded)
                    .with_stage(stage)
                    .with_agent(agent)
                    .with_error(summary),
            ];
            let state = self.fold(&handle, locks, before.clone(), &mut entries)?;

            let attempt_number = state.stage(stage).map_or(0, |r| r.retry_count);
            let mut context = context;
            context.state_snapshot = Some(before.snapshot());
            let dead_letter = DeadLetterEntry {
                id: dead_letter_id,
                timestamp: entries[0].timestamp,
                stage,
                agent: agent.to_string(),
                attempt_number,
                error,
                context,
                labels: before.labels.clone(),
                checkpoint_id: before.recovery_info.last_successful_checkpoint.clone(),
                recovery_attempted: false,
                recovery_result: RecoveryResult::Pending,
                replay_count: 0,
            };

            handle.write_state(&state)?;
            handle.dead_letters.append_locked(&dead_letter, locks)?;
            handle.log.append_locked(&entries, locks)?;
            Self::log_committed(&entries);
            Ok((state, dead_letter))
        })
    }

    /// Record a successful checkpoint of `stage`.
    pub fn create_checkpoint(
        &self,
        project_id: &str,
        stage: Stage,
        artifacts: &[String],
    ) -> Result<Checkpoint> {
        self.create_checkpoint_with(project_id, NewCheckpoint::success(stage, artifacts.to_vec()))
    }

    pub fn create_checkpoint_with(&self, project_id: &str, request: NewCheckpoint) -> Result<Checkpoint> {
        debug!(project_id, stage = %request.stage, status = %request.status, "create_checkpoint");
        let handle = self.existing(project_id)?;

        if let Some(id) = &request.dead_letter_id
            && !handle.dead_letters.load()?.entries.iter().any(|e| &e.id == id)
        {
            return Err(StateError::DeadLetterNotFound { id: id.clone() });
        }

        self.locked(&handle, &[ProjectFile::State, ProjectFile::Transitions], |locks| {
            let state = self.load_for_write(&handle, locks)?;
            let checkpoint_id = new_checkpoint_id();
            let details = CheckpointDetails {
                status: request.status,
                dead_letter_id: request.dead_letter_id.clone(),
                metadata: request.metadata.clone(),
            };
            let mut entries = [TransitionEntry::new(project_id, EventType::CheckpointCreated)
                .with_stage(request.stage)
                .with_checkpoint(&checkpoint_id)
                .with_artifacts(&request.artifacts)
                .with_metadata(to_metadata(&details)?)];
            let state = self.fold(&handle, locks, state, &mut entries)?;

            handle.write_state(&state)?;
            handle.log.append_locked(&entries, locks)?;
            Self::log_committed(&entries);
            Ok(Checkpoint {
                id: checkpoint_id,
                stage: request.stage,
                timestamp: entries[0].timestamp,
                status: request.status,
                artifacts: request.artifacts,
                metadata: request.metadata,
                dead_letter_id: request.dead_letter_id,
            })
        })
    }

    /// Replace the GitHub labels and/or merge custom labels.
    pub fn update_labels(
        &self,
        project_id: &str,
        github: Option<Vec<String>>,
        custom: Option<BTreeMap<String, String>>,
    ) -> Result<ProjectState> {
        debug!(project_id, "update_labels");
        let handle = self.existing(project_id)?;
        self.locked(&handle, &[ProjectFile::State, ProjectFile::Transitions], |locks| {
            let state = self.load_for_write(&handle, locks)?;
            let mut labels: Labels = state.labels.clone();
            if let Some(github) = github {
                labels.github = github;
            }
            if let Some(custom) = custom {
                labels.custom.extend(custom);
            }

            let mut entries = [TransitionEntry::new(project_id, EventType::LabelsUpdated)
                .with_metadata(to_metadata(&labels)?)];
            let state = self.fold(&handle, locks, state, &mut entries)?;

            handle.write_state(&state)?;
            handle.log.append_locked(&entries, locks)?;
            Self::log_committed(&entries);
            Ok(state)
        })
    }

    // =========================================
    // Dead-letter recovery bookkeeping
    // =========================================

    /// Record the outcome of a recovery attempt for a dead letter.
    pub fn mark_dead_letter_recovery(
        &self,
        project_id: &str,
        dead_letter_id: &str,
        result: RecoveryResult,
    ) -> Result<DeadLetterEntry> {
        debug!(project_id, dead_letter_id, %result, "mark_dead_letter_recovery");
        let handle = self.existing(project_id)?;
        self.locked(&handle, &[ProjectFile::DeadLetters], |locks| {
            handle.dead_letters.update_locked(dead_letter_id, locks, |fields| {
                *fields.recovery_attempted = true;
                *fields.recovery_result = result;
            })
        })
    }

    /// Count one more replay of a dead letter's request.
    pub fn record_dead_letter_replay(
        &self,
        project_id: &str,
        dead_letter_id: &str,
    ) -> Result<DeadLetterEntry> {
        debug!(project_id, dead_letter_id, "record_dead_letter_replay");
        let handle = self.existing(project_id)?;
        self.locked(&handle, &[ProjectFile::DeadLetters], |locks| {
            handle.dead_letters.update_locked(dead_letter_id, locks, |fields| {
                *fields.replay_count += 1;
            })
        })
    }

    // =========================================
    // Reads (lock-free)
    // =========================================

    /// Current state of a project. Takes no lock.
    ///
    /// A missing or unparseable state file is rebuilt in memory from the log;
    /// nothing is written.
    pub fn get_state(&self, project_id: &str) -> Result<ProjectState> {
        let handle = self.handle(project_id)?;
        let mut state = match atomic::read_json::<ProjectState>(&handle.paths.state()) {
            Ok(Some(state)) => state,
            Ok(None) => {
                let has_history = handle
                    .log
                    .has_entries()
                    .map_err(|e| unrecoverable_if_corrupt(project_id, e))?;
                if !has_history {
                    return Err(StateError::ProjectNotFound {
                        project_id: project_id.to_string(),
                    });
                }
                warn!(project_id, "State file is missing; reading state from transition log");
                recovery::replay(&handle.log, project_id, self.policy())?
            }
            Err(StateError::CorruptedState { reason, .. }) => {
                warn!(project_id, %reason, "State file is corrupted; reading state from transition log");
                recovery::replay(&handle.log, project_id, self.policy())?
            }
            Err(e) => return Err(e),
        };

        if let Ok(Some(tail)) = handle.log.last_entry()
            && tail.sequence < state.last_sequence
        {
            warn!(
                project_id,
                warning = %IntegrityWarning::TransitionLogBehind {
                    state_sequence: state.last_sequence,
                    log_sequence: tail.sequence,
                },
                "State file and transition log disagree"
            );
        }

        state.refresh_recovery_info(self.config.max_stage_retries);
        Ok(state)
    }

    /// Lazily read a project's transitions, oldest first.
    pub fn get_transitions(&self, project_id: &str, filter: TransitionFilter) -> Result<TransitionIter> {
        self.existing(project_id)?.log.read(filter)
    }

    /// The newest `limit` transitions matching `filter`, oldest first.
    pub fn get_recent_transitions(
        &self,
        project_id: &str,
        filter: TransitionFilter,
        limit: usize,
    ) -> Result<Vec<TransitionEntry>> {
        most_recent(self.get_transitions(project_id, filter)?, limit)
    }

    pub fn get_dead_letters(&self, project_id: &str, unrecovered_only: bool) -> Result<Vec<DeadLetterEntry>> {
        self.query_dead_letters(
            project_id,
            &DeadLetterFilter {
                unrecovered_only,
                ..DeadLetterFilter::default()
            },
        )
    }

    pub fn query_dead_letters(
        &self,
        project_id: &str,
        filter: &DeadLetterFilter,
    ) -> Result<Vec<DeadLetterEntry>> {
        self.existing(project_id)?.dead_letters.query(filter)
    }

    // =========================================
    // Recovery
    // =========================================

    /// Rebuild state from the transition log without writing anything.
    pub fn reconstruct_state(&self, project_id: &str) -> Result<ProjectState> {
        let handle = self.existing(project_id)?;
        recovery::replay(&handle.log, project_id, self.policy())
    }

    /// Rebuild state from the transition log and persist it.
    pub fn recover_project(&self, project_id: &str) -> Result<ProjectState> {
        info!(project_id, "recover_project");
        let handle = self.existing(project_id)?;
        self.locked(&handle, &[ProjectFile::State, ProjectFile::Transitions], |locks| {
            let has_history = handle
                .log
                .has_entries()
                .map_err(|e| unrecoverable_if_corrupt(project_id, e))?;
            if !has_history
                && let Ok(Some(stored)) = atomic::read_json::<ProjectState>(&handle.paths.state())
                && stored.last_sequence == 1
            {
                self.restore_initialization(&handle, locks, &stored)?;
            }
            let state = recovery::replay(&handle.log, project_id, self.policy())?;
            handle.write_state(&state)?;
            Ok(state)
        })
    }

    /// Report skew between the state file, the dead letters, and the log.
    pub fn check_integrity(&self, project_id: &str) -> Result<Vec<IntegrityWarning>> {
        let handle = self.existing(project_id)?;
        let mut warnings = Vec::new();

        let state = match atomic::read_json::<ProjectState>(&handle.paths.state()) {
            Ok(Some(state)) => state,
            Ok(None) => {
                warnings.push(IntegrityWarning::Rebuilt {
                    reason: "state file is missing".to_string(),
                });
                recovery::replay(&handle.log, project_id, self.policy())?
            }
            Err(StateError::CorruptedState { reason, .. }) => {
                warnings.push(IntegrityWarning::Rebuilt { reason });
                recovery::replay(&handle.log, project_id, self.policy())?
            }
            Err(e) => return Err(e),
        };

        let dead_letters = handle.dead_letters.load()?;
        warnings.extend(recovery::check_integrity(
            &state,
            &handle.log,
            &dead_letters.entries,
            self.config.integrity_window,
        )?);
        for warning in &warnings {
            warn!(project_id, %warning, "Integrity check finding");
        }
        Ok(warnings)
    }
}

fn unrecoverable_if_corrupt(project_id: &str, error: StateError) -> StateError {
    match error {
        StateError::CorruptedState { reason, .. } => StateError::Unrecoverable {
            project_id: project_id.to_string(),
            reason,
        },
        other => other,
    }
}
