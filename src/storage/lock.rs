//! Advisory, process-external file locks.
//!
//! Every logical file has a sibling lock file (`state.json` →
//! `state.json.lock`). `ScopedLock` holds an exclusive `fs2` lock on it and
//! releases it when dropped, on every exit path.
//!
//! Operations that touch several files go through `LockSet`, which always
//! acquires in `ProjectFile` rank order (state, dead letters, transitions).
//! No other acquisition order is expressible, so two operations can never
//! wait on each other in a cycle.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use fs2::FileExt;
use tracing::{debug, trace};

use crate::errors::{Result, StateError};

use super::ProjectPaths;

pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

const INITIAL_BACKOFF: Duration = Duration::from_micros(200);
const MAX_BACKOFF: Duration = Duration::from_millis(50);

/// The lockable files of a project, in global acquisition order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ProjectFile {
    State,
    DeadLetters,
    Transitions,
}

/// Lock file path for a data file.
///
/// - `/p/state.json` → `/p/state.json.lock`
/// - `/p/journal` → `/p/journal.lock`
pub fn lock_path_for(path: &Path) -> PathBuf {
    let mut lock_path = path.to_path_buf();
    match lock_path.extension() {
        Some(ext) => {
            let new_ext = format!("{}.lock", ext.to_string_lossy());
            lock_path.set_extension(new_ext);
        }
        None => {
            lock_path.set_extension("lock");
        }
    }
    lock_path
}

/// An exclusive lock on one data file, released on drop.
pub struct ScopedLock {
    file: File,
    lock_path: PathBuf,
}

impl ScopedLock {
    /// Acquire the lock for `path`, waiting at most `timeout`.
    pub fn acquire(path: &Path, timeout: Duration) -> Result<Self> {
        Self::acquire_until(path, Instant::now() + timeout, timeout)
    }

    fn acquire_until(path: &Path, deadline: Instant, timeout: Duration) -> Result<Self> {
        let lock_path = lock_path_for(path);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|e| StateError::io(&lock_path, e))?;

        let contended = fs2::lock_contended_error().kind();
        let mut backoff = INITIAL_BACKOFF;
        loop {
            // Fully qualified: newer std has inherent File locking methods.
            match FileExt::try_lock_exclusive(&file) {
                Ok(()) => {
                    trace!(lock = %lock_path.display(), "lock acquired");
                    return Ok(Self { file, lock_path });
                }
                Err(e) if e.kind() == contended => {
                    let now = Instant::now();
                    if now >= deadline {
                        debug!(lock = %lock_path.display(), ?timeout, "lock acquisition timed out");
                        return Err(StateError::LockTimeout {
                            path: lock_path,
                            timeout,
                        });
                    }
                    thread::sleep(backoff.min(deadline - now));
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
                Err(e) => return Err(StateError::io(&lock_path, e)),
            }
        }
    }

    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }
}

impl Drop for ScopedLock {
    fn drop(&mut self) {
        // Closing the handle releases the lock too; unlock explicitly so the
        // release does not wait on the handle being closed.
        if let Err(e) = FileExt::unlock(&self.file) {
            debug!(lock = %self.lock_path.display(), error = %e, "explicit unlock failed");
        }
        trace!(lock = %self.lock_path.display(), "lock released");
    }
}

impl std::fmt::Debug for ScopedLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopedLock")
            .field("lock_path", &self.lock_path)
            .finish()
    }
}

/// Locks on several files of one project, acquired in rank order.
#[derive(Debug)]
pub struct LockSet {
    held: Vec<(ProjectFile, ScopedLock)>,
}

impl LockSet {
    /// Acquire locks on `files` in `ProjectFile` order.
    ///
    /// `timeout` bounds the whole set. On timeout every lock taken so far is
    /// released and nothing has been written.
    pub fn acquire(paths: &ProjectPaths, files: &[ProjectFile], timeout: Duration) -> Result<Self> {
        Self::acquire_until(paths, files, Instant::now() + timeout, timeout)
    }

    /// As `acquire`, against a deadline shared with earlier waits.
    pub(crate) fn acquire_until(
        paths: &ProjectPaths,
        files: &[ProjectFile],
        deadline: Instant,
        timeout: Duration,
    ) -> Result<Self> {
        let mut ordered = files.to_vec();
        ordered.sort();
        ordered.dedup();

        let mut held = Vec::with_capacity(ordered.len());
        for file in ordered {
            let lock = ScopedLock::acquire_until(&paths.file(file), deadline, timeout)?;
            held.push((file, lock));
        }
        Ok(Self { held })
    }

    pub fn holds(&self, file: ProjectFile) -> bool {
        self.held.iter().any(|(f, _)| *f == file)
    }
}

impl Drop for LockSet {
    fn drop(&mut self) {
        while let Some((_, lock)) = self.held.pop() {
            drop(lock);
        }
    }
}
