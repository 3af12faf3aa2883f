//! Git repository access for the trigger engine
//!
//! Covers exactly what the watcher and the control surface need: reading
//! HEAD, turning a commit into a `CommitInfo` (with diff-derived changed
//! files), and installing the advisory post-commit hook. Status/branch/tag/
//! stash management lived here in an earlier, TUI-oriented incarnation of
//! this module and has no counterpart in the daemon.

pub mod repo;

pub use repo::GitRepo;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Commit information as carried by a `TriggerEvent`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitInfo {
    /// Full 40-character hex commit hash
    pub hash: String,
    /// Commit message, trimmed
    pub message: String,
    /// Author name
    pub author: String,
    /// Author email
    pub author_email: String,
    /// Commit date
    pub timestamp: DateTime<Utc>,
    /// Changed file paths, relative to the repository root, in tree order
    pub files: Vec<String>,
}

/// Find the Git repository root starting from a given path.
///
/// Recursively searches upward for a `.git` directory or file (the latter
/// covers worktrees and submodules, whose `.git` is a gitlink file).
pub fn find_git_root(start_path: &Path) -> Option<PathBuf> {
    let mut current = start_path;

    loop {
        if current.join(".git").exists() {
            return Some(current.to_path_buf());
        }

        match current.parent() {
            Some(parent) => current = parent,
            None => return None,
        }
    }
}

/// Whether `path` is itself the root of a Git working copy.
pub fn is_git_working_copy(path: &Path) -> bool {
    path.join(".git").exists()
}
