//! Append-only transition log (`transitions.jsonl`).
//!
//! The log is the write-ahead record every `ProjectState` can be rebuilt
//! from. Entries are appended under the log's lock and never rewritten.
//! `sequence` and `timestamp` are strictly increasing within a project; both
//! are assigned by `stamp` while the lock is held.
//!
//! Reads take no lock. A reader racing an append may stop short of the newest
//! entry; a line without its terminating newline is treated as not yet written.

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::errors::{Result, StateError};
use crate::stage::Stage;
use crate::storage::atomic;
use crate::storage::{LockSet, ProjectFile, ScopedLock};

/// Kind of state change a transition records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    ProjectInitialized,
    StageStarted,
    StageCompleted,
    StageFailed,
    CheckpointCreated,
    ErrorRecorded,
    LabelsUpdated,
}

impl EventType {
    pub const ALL: [EventType; 7] = [
        EventType::ProjectInitialized,
        EventType::StageStarted,
        EventType::StageCompleted,
        EventType::StageFailed,
        EventType::CheckpointCreated,
        EventType::ErrorRecorded,
        EventType::LabelsUpdated,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::ProjectInitialized => "project_initialized",
            EventType::StageStarted => "stage_started",
            EventType::StageCompleted => "stage_completed",
            EventType::StageFailed => "stage_failed",
            EventType::CheckpointCreated => "checkpoint_created",
            EventType::ErrorRecorded => "error_recorded",
            EventType::LabelsUpdated => "labels_updated",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let wanted = s.trim().to_lowercase();
        EventType::ALL
            .iter()
            .copied()
            .find(|e| e.as_str() == wanted)
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "Invalid event type '{}'. Valid values: {}",
                    s,
                    EventType::ALL.map(|e| e.as_str()).join(", ")
                )
            })
    }
}

/// Error summary carried by failure transitions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionError {
    #[serde(rename = "type")]
    pub error_type: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dead_letter_id: Option<String>,
}

/// One immutable line of the transition log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionEntry {
    pub id: String,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub project_id: String,
    pub event_type: EventType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<Stage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TransitionError>,
}

impl TransitionEntry {
    /// A new, not yet stamped entry.
    pub fn new(project_id: &str, event_type: EventType) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            sequence: 0,
            timestamp: Utc::now(),
            project_id: project_id.to_string(),
            event_type,
            stage: None,
            agent: None,
            metadata: Map::new(),
            checkpoint_id: None,
            artifacts: Vec::new(),
            error: None,
        }
    }

    pub fn with_stage(mut self, stage: Stage) -> Self {
        self.stage = Some(stage);
        self
    }

    pub fn with_agent(mut self, agent: &str) -> Self {
        self.agent = Some(agent.to_string());
        self
    }

    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_checkpoint(mut self, checkpoint_id: &str) -> Self {
        self.checkpoint_id = Some(checkpoint_id.to_string());
        self
    }

    pub fn with_artifacts(mut self, artifacts: &[String]) -> Self {
        self.artifacts = artifacts.to_vec();
        self
    }

    pub fn with_error(mut self, error: TransitionError) -> Self {
        self.error = Some(error);
        self
    }
}

/// Stage and/or event-type filter for log reads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransitionFilter {
    pub stage: Option<Stage>,
    pub event_type: Option<EventType>,
}

impl TransitionFilter {
    pub fn stage(stage: Stage) -> Self {
        Self {
            stage: Some(stage),
            event_type: None,
        }
    }

    pub fn event(event_type: EventType) -> Self {
        Self {
            stage: None,
            event_type: Some(event_type),
        }
    }

    pub fn matches(&self, entry: &TransitionEntry) -> bool {
        self.stage.is_none_or(|s| entry.stage == Some(s))
            && self.event_type.is_none_or(|e| entry.event_type == e)
    }
}

/// Handle on one project's transition log.
#[derive(Debug, Clone)]
pub struct TransitionLog {
    path: PathBuf,
}

impl TransitionLog {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the log holds at least one committed entry.
    pub fn has_entries(&self) -> Result<bool> {
        Ok(self.read_tail()?.0.is_some())
    }

    /// The newest committed entry.
    pub fn last_entry(&self) -> Result<Option<TransitionEntry>> {
        Ok(self.read_tail()?.0)
    }

    /// Assign sequence numbers and timestamps that continue the log.
    ///
    /// Must run while `locks` holds the log lock, immediately before the
    /// entries are appended. A torn final line left by a crashed append is cut
    /// off here.
    pub fn stamp(&self, entries: &mut [TransitionEntry], locks: &LockSet) -> Result<()> {
        debug_assert!(locks.holds(ProjectFile::Transitions));
        let (tail, complete_len) = self.read_tail()?;
        self.truncate_torn_tail(complete_len)?;

        let mut sequence = tail.as_ref().map_or(0, |e| e.sequence);
        let mut previous = tail.map(|e| e.timestamp);
        for entry in entries.iter_mut() {
            sequence += 1;
            let now = Utc::now();
            let timestamp = match previous {
                Some(prev) if now <= prev => prev + chrono::Duration::microseconds(1),
                _ => now,
            };
            entry.sequence = sequence;
            entry.timestamp = timestamp;
            previous = Some(timestamp);
        }
        Ok(())
    }

    /// Append already stamped entries while `locks` holds the log lock.
    pub fn append_locked(&self, entries: &[TransitionEntry], locks: &LockSet) -> Result<()> {
        debug_assert!(locks.holds(ProjectFile::Transitions));
        for entry in entries {
            atomic::append_line(&self.path, entry)?;
            debug!(
                project_id = %entry.project_id,
                sequence = entry.sequence,
                event = %entry.event_type,
                "transition appended"
            );
        }
        Ok(())
    }

    /// Write back the first entry of a log that holds no committed entry,
    /// keeping the stamp it already carries.
    pub(crate) fn restore_first(&self, entry: &TransitionEntry, locks: &LockSet) -> Result<()> {
        debug_assert!(locks.holds(ProjectFile::Transitions));
        let (tail, complete_len) = self.read_tail()?;
        if let Some(tail) = tail {
            return Err(StateError::CorruptedState {
                path: self.path.clone(),
                reason: format!("log already continues to sequence {}", tail.sequence),
            });
        }
        self.truncate_torn_tail(complete_len)?;
        atomic::append_line(&self.path, entry)
    }

    /// Stamp and append one entry under the log's own lock.
    pub fn append_transition(
        &self,
        entry: TransitionEntry,
        timeout: Duration,
    ) -> Result<TransitionEntry> {
        let _lock = ScopedLock::acquire(&self.path, timeout)?;
        let (tail, complete_len) = self.read_tail()?;
        self.truncate_torn_tail(complete_len)?;

        let mut entry = entry;
        entry.sequence = tail.as_ref().map_or(0, |e| e.sequence) + 1;
        let now = Utc::now();
        entry.timestamp = match tail {
            Some(prev) if now <= prev.timestamp => prev.timestamp + chrono::Duration::microseconds(1),
            _ => now,
        };
        atomic::append_line(&self.path, &entry)?;
        Ok(entry)
    }

    /// Lazily read entries matching `filter`, oldest first. Takes no lock.
    pub fn read(&self, filter: TransitionFilter) -> Result<TransitionIter> {
        let reader = match File::open(&self.path) {
            Ok(file) => Some(BufReader::new(file)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(StateError::io(&self.path, e)),
        };
        Ok(TransitionIter {
            path: self.path.clone(),
            reader,
            filter,
            line_number: 0,
            buf: Vec::new(),
        })
    }

    /// The newest complete entry and the byte length of the complete prefix.
    fn read_tail(&self) -> Result<(Option<TransitionEntry>, u64)> {
        let mut file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((None, 0)),
            Err(e) => return Err(StateError::io(&self.path, e)),
        };
        let len = file
            .metadata()
            .map_err(|e| StateError::io(&self.path, e))?
            .len();

        let mut window: u64 = 4096;
        'window: loop {
            let start = len.saturating_sub(window);
            let mut buf = Vec::with_capacity((len - start) as usize);
            file.seek(SeekFrom::Start(start))
                .and_then(|_| (&mut file).take(len - start).read_to_end(&mut buf))
                .map_err(|e| StateError::io(&self.path, e))?;

            let Some(end) = buf.iter().rposition(|&b| b == b'\n') else {
                if start == 0 {
                    return Ok((None, 0));
                }
                window *= 2;
                continue;
            };
            let complete_len = start + end as u64 + 1;

            // Walk back over blank lines, which readers skip too.
            let mut body = &buf[..end];
            let line = loop {
                let (line, rest) = match body.iter().rposition(|&b| b == b'\n') {
                    Some(prev) => (&body[prev + 1..], Some(&body[..prev])),
                    None if start == 0 => (body, None),
                    None => {
                        window *= 2;
                        continue 'window;
                    }
                };
                if !line.iter().all(u8::is_ascii_whitespace) {
                    break line;
                }
                match rest {
                    Some(rest) => body = rest,
                    None => return Ok((None, complete_len)),
                }
            };
            let entry = serde_json::from_slice(line).map_err(|e| StateError::CorruptedState {
                path: self.path.clone(),
                reason: format!("last transition is unreadable: {}", e),
            })?;
            return Ok((Some(entry), complete_len));
        }
    }

    fn truncate_torn_tail(&self, complete_len: u64) -> Result<()> {
        let len = match std::fs::metadata(&self.path) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(StateError::io(&self.path, e)),
        };
        if len > complete_len {
            warn!(
                path = %self.path.display(),
                torn_bytes = len - complete_len,
                "Discarding torn transition record left by an interrupted append"
            );
            let file = OpenOptions::new()
                .write(true)
                .open(&self.path)
                .map_err(|e| StateError::io(&self.path, e))?;
            file.set_len(complete_len)
                .and_then(|_| file.sync_all())
                .map_err(|e| StateError::io(&self.path, e))?;
        }
        Ok(())
    }
}

/// Lazy iterator over a transition log.
pub struct TransitionIter {
    path: PathBuf,
    reader: Option<BufReader<File>>,
    filter: TransitionFilter,
    line_number: usize,
    buf: Vec<u8>,
}

impl Iterator for TransitionIter {
    type Item = Result<TransitionEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        let reader = self.reader.as_mut()?;
        loop {
            self.buf.clear();
            match reader.read_until(b'\n', &mut self.buf) {
                Ok(0) => return None,
                Ok(_) => {}
                Err(e) => {
                    self.reader = None;
                    return Some(Err(StateError::io(&self.path, e)));
                }
            }
            self.line_number += 1;

            // Unterminated: an append still in flight.
            if self.buf.last() != Some(&b'\n') {
                self.reader = None;
                return None;
            }
            let line = &self.buf[..self.buf.len() - 1];
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }

            match serde_json::from_slice::<TransitionEntry>(line) {
                Ok(entry) if self.filter.matches(&entry) => return Some(Ok(entry)),
                Ok(_) => continue,
                Err(e) => {
                    return Some(Err(StateError::CorruptedState {
                        path: self.path.clone(),
                        reason: format!("line {}: {}", self.line_number, e),
                    }));
                }
            }
        }
    }
}

/// Keep only the newest `limit` entries of a read.
pub fn most_recent(iter: TransitionIter, limit: usize) -> Result<Vec<TransitionEntry>> {
    let mut window = VecDeque::with_capacity(limit.min(1024));
    for entry in iter {
        let entry = entry?;
        if limit == 0 {
            continue;
        }
        if window.len() == limit {
            window.pop_front();
        }
        window.push_back(entry);
    }
    Ok(window.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::ProjectPaths;
    use std::io::Write;
    use tempfile::TempDir;

    fn setup() -> (TempDir, ProjectPaths, TransitionLog) {
        let dir = TempDir::new().unwrap();
        let paths = ProjectPaths::new(dir.path(), "project-1").unwrap();
        paths.ensure_dir().unwrap();
        let log = TransitionLog::new(paths.transitions());
        (dir, paths, log)
    }

    fn append(log: &TransitionLog, entry: TransitionEntry) -> TransitionEntry {
        log.append_transition(entry, Duration::from_secs(1)).unwrap()
    }

    #[test]
    fn test_empty_log_reads_nothing() {
        let (_dir, _paths, log) = setup();
        assert!(!log.has_entries().unwrap());
        assert_eq!(log.read(TransitionFilter::default()).unwrap().count(), 0);
    }

    #[test]
    fn test_sequence_and_timestamps_strictly_increase() {
        let (_dir, _paths, log) = setup();
        for _ in 0..50 {
            append(&log, TransitionEntry::new("project-1", EventType::StageStarted));
        }
        let entries: Vec<_> = log
            .read(TransitionFilter::default())
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(entries.len(), 50);
        for pair in entries.windows(2) {
            assert_eq!(pair[1].sequence, pair[0].sequence + 1);
            assert!(pair[1].timestamp > pair[0].timestamp);
        }
    }

    #[test]
    fn test_stamp_continues_existing_log() {
        let (_dir, paths, log) = setup();
        append(&log, TransitionEntry::new("project-1", EventType::ProjectInitialized));

        let locks = LockSet::acquire(&paths, &[ProjectFile::Transitions], Duration::from_secs(1)).unwrap();
        let mut batch = vec![
            TransitionEntry::new("project-1", EventType::StageCompleted),
            TransitionEntry::new("project-1", EventType::CheckpointCreated),
        ];
        log.stamp(&mut batch, &locks).unwrap();
        assert_eq!(batch[0].sequence, 2);
        assert_eq!(batch[1].sequence, 3);
        assert!(batch[1].timestamp > batch[0].timestamp);
        log.append_locked(&batch, &locks).unwrap();
        drop(locks);

        assert_eq!(log.last_entry().unwrap().unwrap().sequence, 3);
    }

    #[test]
    fn test_filters_by_stage_and_event() {
        let (_dir, _paths, log) = setup();
        append(
            &log,
            TransitionEntry::new("project-1", EventType::StageStarted).with_stage(Stage::Ideation),
        );
        append(
            &log,
            TransitionEntry::new("project-1", EventType::StageCompleted).with_stage(Stage::Ideation),
        );
        append(
            &log,
            TransitionEntry::new("project-1", EventType::StageStarted).with_stage(Stage::Specification),
        );

        let started = log.read(TransitionFilter::event(EventType::StageStarted)).unwrap().count();
        assert_eq!(started, 2);

        let ideation = log.read(TransitionFilter::stage(Stage::Ideation)).unwrap().count();
        assert_eq!(ideation, 2);

        let both = TransitionFilter {
            stage: Some(Stage::Specification),
            event_type: Some(EventType::StageStarted),
        };
        assert_eq!(log.read(both).unwrap().count(), 1);
    }

    #[test]
    fn test_reader_ignores_unterminated_tail() {
        let (_dir, _paths, log) = setup();
        append(&log, TransitionEntry::new("project-1", EventType::ProjectInitialized));
        let mut file = OpenOptions::new().append(true).open(log.path()).unwrap();
        file.write_all(br#"{"id":"half-writ"#).unwrap();

        let entries: Vec<_> = log.read(TransitionFilter::default()).unwrap().collect();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].is_ok());
        assert_eq!(log.last_entry().unwrap().unwrap().sequence, 1);
    }

    #[test]
    fn test_torn_tail_is_cut_before_next_append() {
        let (_dir, _paths, log) = setup();
        append(&log, TransitionEntry::new("project-1", EventType::ProjectInitialized));
        let mut file = OpenOptions::new().append(true).open(log.path()).unwrap();
        file.write_all(br#"{"id":"torn"#).unwrap();
        drop(file);

        let next = append(&log, TransitionEntry::new("project-1", EventType::StageStarted));
        assert_eq!(next.sequence, 2);
        let entries: Vec<_> = log
            .read(TransitionFilter::default())
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(entries.len(), 2);
    }

    #[test]
    fn test_trailing_blank_lines_are_skipped() {
        let (_dir, _paths, log) = setup();
        append(&log, TransitionEntry::new("project-1", EventType::ProjectInitialized));
        let mut file = OpenOptions::new().append(true).open(log.path()).unwrap();
        file.write_all(b"\n   \n").unwrap();
        drop(file);

        assert_eq!(log.last_entry().unwrap().unwrap().sequence, 1);
        let next = append(&log, TransitionEntry::new("project-1", EventType::StageStarted));
        assert_eq!(next.sequence, 2);
        assert_eq!(log.read(TransitionFilter::default()).unwrap().count(), 2);
    }

    #[test]
    fn test_blank_only_log_has_no_entries() {
        let (_dir, _paths, log) = setup();
        std::fs::write(log.path(), "\n \n").unwrap();
        assert!(!log.has_entries().unwrap());
    }

    #[test]
    fn test_corrupted_line_is_reported() {
        let (_dir, _paths, log) = setup();
        append(&log, TransitionEntry::new("project-1", EventType::ProjectInitialized));
        let mut file = OpenOptions::new().append(true).open(log.path()).unwrap();
        file.write_all(b"not json at all\n").unwrap();

        let results: Vec<_> = log.read(TransitionFilter::default()).unwrap().collect();
        assert_eq!(results.len(), 2);
        match &results[1] {
            Err(StateError::CorruptedState { reason, .. }) => assert!(reason.contains("line 2")),
            other => panic!("Expected CorruptedState, got {other:?}"),
        }
    }

    #[test]
    fn test_tail_spans_large_entries() {
        let (_dir, _paths, log) = setup();
        let mut metadata = Map::new();
        metadata.insert("blob".into(), Value::String("x".repeat(20_000)));
        append(
            &log,
            TransitionEntry::new("project-1", EventType::ProjectInitialized).with_metadata(metadata),
        );
        append(
            &log,
            TransitionEntry::new("project-1", EventType::LabelsUpdated).with_metadata({
                let mut m = Map::new();
                m.insert("blob".into(), Value::String("y".repeat(9_000)));
                m
            }),
        );
        let last = log.last_entry().unwrap().unwrap();
        assert_eq!(last.sequence, 2);
        assert_eq!(last.event_type, EventType::LabelsUpdated);
    }

    #[test]
    fn test_most_recent_keeps_tail() {
        let (_dir, _paths, log) = setup();
        for _ in 0..5 {
            append(&log, TransitionEntry::new("project-1", EventType::StageStarted));
        }
        let recent = most_recent(log.read(TransitionFilter::default()).unwrap(), 2).unwrap();
        assert_eq!(recent.iter().map(|e| e.sequence).collect::<Vec<_>>(), vec![4, 5]);
    }

    #[test]
    fn test_event_type_parse() {
        assert_eq!(
            "stage_failed".parse::<EventType>().unwrap(),
            EventType::StageFailed
        );
        assert!("stage_exploded".parse::<EventType>().is_err());
    }
}
