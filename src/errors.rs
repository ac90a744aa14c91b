//! Typed error hierarchy for the pipeline state engine.
//!
//! `StateError` covers every infrastructure and contract failure the engine
//! can surface to a caller:
//! - `LockTimeout`: retryable, the lock was never held
//! - `InvalidTransition` / `AlreadyExists`: caller contract violations
//! - `CorruptedState` / `Unrecoverable`: on-disk data errors
//!
//! `IntegrityWarning` is not part of the enum. Skew between the state file,
//! the dead-letter file, and the log is reported, never raised.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::stage::Stage;

pub type Result<T, E = StateError> = std::result::Result<T, E>;

/// Errors from the state engine.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("Timed out after {timeout:?} waiting for lock on {path}")]
    LockTimeout { path: PathBuf, timeout: Duration },

    #[error("Invalid transition for stage '{stage}': {reason}")]
    InvalidTransition { stage: String, reason: String },

    #[error("Project {project_id} already exists")]
    AlreadyExists { project_id: String },

    #[error("Project {project_id} not found")]
    ProjectNotFound { project_id: String },

    #[error("Corrupted state in {path}: {reason}")]
    CorruptedState { path: PathBuf, reason: String },

    #[error("State for project {project_id} cannot be recovered: {reason}")]
    Unrecoverable { project_id: String, reason: String },

    #[error("Invalid project ID format: {0}")]
    InvalidProjectId(String),

    #[error("Dead letter {id} not found")]
    DeadLetterNotFound { id: String },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Project handle lock poisoned")]
    LockPoisoned,
}

impl StateError {
    /// Whether the caller may retry the same operation unchanged.
    ///
    /// Only lock contention qualifies; the engine itself never retries.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StateError::LockTimeout { .. })
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StateError::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn invalid_transition(stage: impl ToString, reason: impl Into<String>) -> Self {
        StateError::InvalidTransition {
            stage: stage.to_string(),
            reason: reason.into(),
        }
    }
}

/// Non-fatal data-integrity finding.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IntegrityWarning {
    /// A stage is marked failed but no dead letter was written near the failure time.
    #[error("Stage {stage} is marked failed (attempt {retry_count}) with no matching dead letter")]
    MissingDeadLetter { stage: Stage, retry_count: u32 },

    /// The state file has applied transitions the log does not contain.
    #[error("State file is at sequence {state_sequence} but the transition log ends at {log_sequence}")]
    TransitionLogBehind {
        state_sequence: u64,
        log_sequence: u64,
    },

    /// A dead letter exists that no logged failure refers to.
    #[error("Dead letter {id} for stage {stage} is not referenced by any logged failure")]
    OrphanDeadLetter { id: String, stage: Stage },

    /// The state file was rebuilt from the transition log.
    #[error("State file was rebuilt from the transition log: {reason}")]
    Rebuilt { reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_timeout_is_retryable() {
        let err = StateError::LockTimeout {
            path: PathBuf::from("/tmp/state.json.lock"),
            timeout: Duration::from_secs(30),
        };
        assert!(err.is_retryable());
        assert!(err.to_string().contains("state.json.lock"));
    }

    #[test]
    fn contract_errors_are_not_retryable() {
        let err = StateError::invalid_transition("ideation", "already in progress");
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("ideation"));

        let err = StateError::AlreadyExists {
            project_id: "project-1".into(),
        };
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("project-1"));
    }

    #[test]
    fn io_error_carries_path_and_kind() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err = StateError::io("/data/state.json", io_err);
        match &err {
            StateError::Io { path, source } => {
                assert_eq!(path, &PathBuf::from("/data/state.json"));
                assert_eq!(source.kind(), std::io::ErrorKind::PermissionDenied);
            }
            _ => panic!("Expected Io variant"),
        }
    }

    #[test]
    fn serde_errors_convert() {
        let parse_err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err: StateError = parse_err.into();
        assert!(matches!(err, StateError::Serialization(_)));
    }

    #[test]
    fn integrity_warning_is_std_error() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        let warning = IntegrityWarning::MissingDeadLetter {
            stage: Stage::Validation,
            retry_count: 2,
        };
        assert_std_error(&warning);
        assert!(warning.to_string().contains("validation"));
    }
}
