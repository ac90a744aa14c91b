//! Crash-safe file writes.
//!
//! `write_atomic` writes a sibling temp file, fsyncs it, and renames it over
//! the target, so readers see either the old or the new document. `append_line`
//! adds one newline-terminated record in a single write; callers must hold the
//! file's lock while appending.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::errors::{Result, StateError};

fn temp_path_for(path: &Path) -> PathBuf {
    let temp_name = format!(
        ".{}.{}.tmp",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("file"),
        uuid::Uuid::new_v4().simple()
    );
    path.with_file_name(temp_name)
}

/// Replace `path` with `bytes` atomically.
///
/// On any failure the original file is untouched. Removing the temp file
/// after a failure is best effort.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let temp_path = temp_path_for(path);

    let result = (|| -> std::io::Result<()> {
        let mut file = File::create(&temp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&temp_path, path)
    })();

    if let Err(e) = result {
        if let Err(cleanup) = fs::remove_file(&temp_path)
            && cleanup.kind() != std::io::ErrorKind::NotFound
        {
            warn!(
                temp = %temp_path.display(),
                error = %cleanup,
                "Failed to remove temp file after aborted write"
            );
        }
        return Err(StateError::io(path, e));
    }

    // The rename is only durable once the directory entry is synced.
    #[cfg(unix)]
    {
        if let Some(parent) = path.parent()
            && let Ok(dir) = File::open(parent)
        {
            let _ = dir.sync_all();
        }
    }

    debug!(path = %path.display(), bytes = bytes.len(), "atomic write committed");
    Ok(())
}

/// Serialize `value` as pretty JSON and write it atomically.
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut bytes = serde_json::to_vec_pretty(value)?;
    bytes.push(b'\n');
    write_atomic(path, &bytes)
}

/// Read a JSON document. `Ok(None)` when the file does not exist.
///
/// A document that exists but does not parse is `CorruptedState`.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let content = match fs::read(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(StateError::io(path, e)),
    };
    serde_json::from_slice(&content)
        .map(Some)
        .map_err(|e| StateError::CorruptedState {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
}

/// Append one record as a single JSON line and sync it.
pub fn append_line<T: Serialize>(path: &Path, record: &T) -> Result<()> {
    let mut line = serde_json::to_vec(record)?;
    line.push(b'\n');

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| StateError::io(path, e))?;
    file.write_all(&line).map_err(|e| StateError::io(path, e))?;
    file.sync_data().map_err(|e| StateError::io(path, e))?;
    Ok(())
}
