//! Rebuilding state from the transition log, and integrity checks.

use std::collections::HashSet;
use std::time::Duration;

use tracing::{debug, info};

use crate::dead_letter::DeadLetterEntry;
use crate::errors::{IntegrityWarning, Result, StateError};
use crate::stage::StageStatus;
use crate::transitions::{TransitionFilter, TransitionLog};

use super::{ProjectState, StatePolicy};

/// Counters from one replay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayStats {
    pub transitions: u64,
    pub checkpoints: usize,
    pub failed_stages: usize,
}

/// Rebuild `project_id`'s state by folding the whole log from the start.
///
/// Any unreadable line, gap in the sequence, or illegal transition makes the
/// log unusable as a source of truth and yields `Unrecoverable`.
pub fn replay(log: &TransitionLog, project_id: &str, policy: StatePolicy) -> Result<ProjectState> {
    replay_with_stats(log, project_id, policy).map(|(state, _)| state)
}

pub fn replay_with_stats(
    log: &TransitionLog,
    project_id: &str,
    policy: StatePolicy,
) -> Result<(ProjectState, ReplayStats)> {
    let unrecoverable = |reason: String| StateError::Unrecoverable {
        project_id: project_id.to_string(),
        reason,
    };

    let mut entries = log
        .read(TransitionFilter::default())
        .map_err(|e| unrecoverable(e.to_string()))?;

    let first = entries
        .next()
        .ok_or_else(|| unrecoverable("transition log is empty".to_string()))?
        .map_err(|e| unrecoverable(e.to_string()))?;
    if first.project_id != project_id {
        return Err(unrecoverable(format!(
            "log begins with an entry for {}",
            first.project_id
        )));
    }
    let mut state = ProjectState::from_initialization(&first, policy)
        .map_err(|e| unrecoverable(format!("sequence {}: {}", first.sequence, e)))?;
    let mut stats = ReplayStats {
        transitions: 1,
        ..ReplayStats::default()
    };

    for entry in entries {
        let entry = entry.map_err(|e| unrecoverable(e.to_string()))?;
        state
            .apply(&entry, policy)
            .map_err(|e| unrecoverable(format!("sequence {}: {}", entry.sequence, e)))?;
        stats.transitions += 1;
    }

    stats.checkpoints = state.checkpoints.len();
    stats.failed_stages = state
        .stages
        .values()
        .filter(|r| r.status == StageStatus::Failed)
        .count();

    info!(
        project_id,
        transitions = stats.transitions,
        checkpoints = stats.checkpoints,
        failed_stages = stats.failed_stages,
        "state reconstructed from transition log"
    );
    Ok((state, stats))
}

/// Compare `state` against the log and the dead letters it should agree with.
///
/// Reads are lock-free, so a check racing a write may report skew that the
/// write is about to resolve.
pub fn check_integrity(
    state: &ProjectState,
    log: &TransitionLog,
    dead_letters: &[DeadLetterEntry],
    window: Duration,
) -> Result<Vec<IntegrityWarning>> {
    let mut warnings = Vec::new();

    let log_sequence = log.last_entry()?.map_or(0, |e| e.sequence);
    if state.last_sequence > log_sequence {
        warnings.push(IntegrityWarning::TransitionLogBehind {
            state_sequence: state.last_sequence,
            log_sequence,
        });
    }

    let window = chrono::Duration::from_std(window).unwrap_or(chrono::Duration::MAX);
    for (stage, record) in &state.stages {
        if record.status != StageStatus::Failed {
            continue;
        }
        let Some(failed_at) = record.failed_at else {
            continue;
        };
        let recorded = dead_letters
            .iter()
            .any(|dl| dl.stage == *stage && (dl.timestamp - failed_at).abs() <= window);
        if !recorded {
            warnings.push(IntegrityWarning::MissingDeadLetter {
                stage: *stage,
                retry_count: record.retry_count,
            });
        }
    }

    let mut referenced = HashSet::new();
    for entry in log.read(TransitionFilter::default())? {
        if let Some(id) = entry?.error.and_then(|e| e.dead_letter_id) {
            referenced.insert(id);
        }
    }
    for dl in dead_letters {
        if !referenced.contains(&dl.id) {
            warnings.push(IntegrityWarning::OrphanDeadLetter {
                id: dl.id.clone(),
                stage: dl.stage,
            });
        }
    }

    debug!(
        project_id = %state.project_id,
        warnings = warnings.len(),
        "integrity check finished"
    );
    Ok(warnings)
}
