//! Recovery checkpoints.
//!
//! A checkpoint is an immutable marker of recoverable progress at one stage.
//! Projects keep at most `max_retained` of them, newest last; the oldest is
//! evicted first.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::stage::Stage;

pub const DEFAULT_MAX_CHECKPOINTS: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStatus {
    #[default]
    Success,
    Partial,
}

impl std::fmt::Display for CheckpointStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CheckpointStatus::Success => write!(f, "success"),
            CheckpointStatus::Partial => write!(f, "partial"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    pub stage: Stage,
    pub timestamp: DateTime<Utc>,
    pub status: CheckpointStatus,
    #[serde(default)]
    pub artifacts: Vec<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
    /// Failure this checkpoint attempt is associated with, by reference
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dead_letter_id: Option<String>,
}

/// Generate a fresh checkpoint id.
pub fn new_checkpoint_id() -> String {
    format!("chk-{}", uuid::Uuid::new_v4().simple())
}

/// Request for a checkpoint beyond the plain success case.
#[derive(Debug, Clone)]
pub struct NewCheckpoint {
    pub stage: Stage,
    pub status: CheckpointStatus,
    pub artifacts: Vec<String>,
    pub metadata: Map<String, Value>,
    pub dead_letter_id: Option<String>,
}

impl NewCheckpoint {
    pub fn new(stage: Stage, status: CheckpointStatus, artifacts: Vec<String>) -> Self {
        Self {
            stage,
            status,
            artifacts,
            metadata: Map::new(),
            dead_letter_id: None,
        }
    }

    pub fn success(stage: Stage, artifacts: Vec<String>) -> Self {
        Self::new(stage, CheckpointStatus::Success, artifacts)
    }

    pub fn partial(stage: Stage, artifacts: Vec<String>) -> Self {
        Self::new(stage, CheckpointStatus::Partial, artifacts)
    }

    pub fn after_failure(mut self, dead_letter_id: &str) -> Self {
        self.dead_letter_id = Some(dead_letter_id.to_string());
        self
    }

    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Details a `checkpoint_created` transition carries besides id, stage, and artifacts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub(crate) struct CheckpointDetails {
    pub status: CheckpointStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dead_letter_id: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

/// Push `checkpoint`, evicting the oldest entries beyond `max_retained`.
pub fn retain_push(
    checkpoints: &mut VecDeque<Checkpoint>,
    checkpoint: Checkpoint,
    max_retained: usize,
) {
    checkpoints.push_back(checkpoint);
    while checkpoints.len() > max_retained.max(1) {
        checkpoints.pop_front();
    }
}

/// Newest checkpoint with `status = success`.
pub fn last_successful(checkpoints: &VecDeque<Checkpoint>) -> Option<&Checkpoint> {
    checkpoints
        .iter()
        .rev()
        .find(|c| c.status == CheckpointStatus::Success)
}
