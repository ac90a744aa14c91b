//! Crash-safe state persistence and recovery for multi-stage agent pipelines.
//!
//! Each project lives in its own directory with three files:
//! - `state.json`: the current materialized state
//! - `transitions.jsonl`: the append-only history every state is folded from
//! - `dead_letters.json`: failed attempts kept with their full context
//!
//! [`StateManager`] is the entry point. All mutations serialize on per-file
//! locks and write atomically; reads take no lock.

pub mod checkpoint;
pub mod config;
pub mod dead_letter;
pub mod errors;
pub mod logging;
pub mod stage;
pub mod state;
pub mod storage;
pub mod transitions;

pub use checkpoint::{Checkpoint, CheckpointStatus, NewCheckpoint};
pub use config::{EngineConfig, PipestateToml};
pub use dead_letter::{DeadLetterEntry, DeadLetterFilter, ErrorInfo, FailureContext, RecoveryResult};
pub use errors::{IntegrityWarning, Result, StateError};
pub use stage::{Stage, StageRecord, StageStatus};
pub use state::{ProjectState, ProjectStatus, StateManager};
pub use transitions::{EventType, TransitionEntry, TransitionFilter};
