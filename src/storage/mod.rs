//! On-disk layout of a project and the primitives that touch it.
//!
//! Each project lives in `<projects_dir>/<project_id>/`:
//!
//! | File                | Written by                     |
//! |---------------------|--------------------------------|
//! | `state.json`        | atomic rename (`atomic`)       |
//! | `dead_letters.json` | atomic rename (`atomic`)       |
//! | `transitions.jsonl` | locked append (`atomic`)       |
//! | `*.lock`            | lock coordination (`lock`)     |

pub mod atomic;
pub mod lock;

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;

use crate::errors::{Result, StateError};

pub use lock::{LockSet, ProjectFile, ScopedLock, lock_path_for};

pub const STATE_FILE: &str = "state.json";
pub const DEAD_LETTERS_FILE: &str = "dead_letters.json";
pub const TRANSITIONS_FILE: &str = "transitions.jsonl";

static PROJECT_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^project-\d+$").expect("project id pattern is valid"));

/// Reject ids that could escape the projects directory.
pub fn validate_project_id(project_id: &str) -> Result<()> {
    if PROJECT_ID.is_match(project_id) {
        Ok(())
    } else {
        Err(StateError::InvalidProjectId(project_id.to_string()))
    }
}

/// Paths of one project's files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectPaths {
    project_id: String,
    dir: PathBuf,
}

impl ProjectPaths {
    pub fn new(projects_dir: &Path, project_id: &str) -> Result<Self> {
        validate_project_id(project_id)?;
        Ok(Self {
            project_id: project_id.to_string(),
            dir: projects_dir.join(project_id),
        })
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn file(&self, file: ProjectFile) -> PathBuf {
        match file {
            ProjectFile::State => self.dir.join(STATE_FILE),
            ProjectFile::DeadLetters => self.dir.join(DEAD_LETTERS_FILE),
            ProjectFile::Transitions => self.dir.join(TRANSITIONS_FILE),
        }
    }

    pub fn state(&self) -> PathBuf {
        self.file(ProjectFile::State)
    }

    pub fn dead_letters(&self) -> PathBuf {
        self.file(ProjectFile::DeadLetters)
    }

    pub fn transitions(&self) -> PathBuf {
        self.file(ProjectFile::Transitions)
    }

    pub fn ensure_dir(&self) -> Result<()> {
        std::fs::create_dir_all(&self.dir).map_err(|e| StateError::io(&self.dir, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_project_id() {
        assert!(validate_project_id("project-1").is_ok());
        assert!(validate_project_id("project-4821").is_ok());
        for bad in ["project-", "project-1a", "../project-1", "project-1/..", "p-1", ""] {
            let err = validate_project_id(bad).unwrap_err();
            assert!(matches!(err, StateError::InvalidProjectId(_)), "{bad} accepted");
        }
    }

    #[test]
    fn test_project_paths_layout() {
        let paths = ProjectPaths::new(Path::new("/data/projects"), "project-7").unwrap();
        assert_eq!(paths.dir(), Path::new("/data/projects/project-7"));
        assert_eq!(paths.state(), PathBuf::from("/data/projects/project-7/state.json"));
        assert_eq!(
            paths.dead_letters(),
            PathBuf::from("/data/projects/project-7/dead_letters.json")
        );
        assert_eq!(
            paths.transitions(),
            PathBuf::from("/data/projects/project-7/transitions.jsonl")
        );
    }

    #[test]
    fn test_project_paths_rejects_traversal() {
        assert!(ProjectPaths::new(Path::new("/data"), "../../etc").is_err());
    }
}
