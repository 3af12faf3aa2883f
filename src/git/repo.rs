//! Thin synchronous wrapper around `git2::Repository`.
//!
//! Kept synchronous on purpose: every caller (the watcher's debounce task,
//! the control surface) runs this inside `tokio::task::spawn_blocking`,
//! since `git2` has no async API and the teacher's own `GitService` made
//! the same call by hiding a `Mutex<Repository>` behind async methods that
//! never actually yielded mid-operation.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use git2::Repository;

use crate::error::{AppError, AppResult};

use super::{is_git_working_copy, CommitInfo};

pub struct GitRepo {
    repo: Repository,
    path: PathBuf,
}

impl GitRepo {
    /// Open the repository at `path`. Fails with `NotARepository` if `path`
    /// has no `.git` directory (§4.3 `new(repoPath)` contract).
    pub fn open(path: &Path) -> AppResult<Self> {
        if !is_git_working_copy(path) {
            return Err(AppError::NotARepository(path.to_path_buf()));
        }

        let repo = Repository::open(path)?;
        Ok(Self {
            repo,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Full hex id of the commit HEAD currently points at.
    pub fn head_commit_id(&self) -> AppResult<String> {
        let head = self.repo.head()?;
        let oid = head
            .target()
            .ok_or_else(|| AppError::watcher_failed("HEAD has no target (unborn branch?)"))?;
        Ok(oid.to_string())
    }

    /// Current branch name, if HEAD is not detached.
    pub fn current_branch(&self) -> Option<String> {
        let head = self.repo.head().ok()?;
        head.shorthand().map(str::to_string)
    }

    /// Build a `CommitInfo` for the given commit id, including the ordered
    /// list of changed files (§4.3 changed-files extraction).
    pub fn commit_info(&self, commit_hex: &str) -> AppResult<CommitInfo> {
        let oid = git2::Oid::from_str(commit_hex)
            .map_err(|e| AppError::watcher_failed(format!("invalid commit id: {e}")))?;
        let commit = self.repo.find_commit(oid)?;

        let author = commit.author();
        let timestamp = DateTime::from_timestamp(commit.time().seconds(), 0).unwrap_or_else(Utc::now);

        Ok(CommitInfo {
            hash: commit.id().to_string(),
            message: commit.message().unwrap_or("").trim().to_string(),
            author: author.name().unwrap_or("").to_string(),
            author_email: author.email().unwrap_or("").to_string(),
            timestamp,
            files: self.changed_files(&commit)?,
        })
    }

    /// Diff the commit tree against its first parent; for the root commit,
    /// every path in the tree counts as changed. Either side of the diff
    /// contributes its path, per §4.3.
    fn changed_files(&self, commit: &git2::Commit<'_>) -> AppResult<Vec<String>> {
        let tree = commit.tree()?;

        let diff = if commit.parent_count() > 0 {
            let parent = commit.parent(0)?;
            let parent_tree = parent.tree()?;
            self.repo
                .diff_tree_to_tree(Some(&parent_tree), Some(&tree), None)?
        } else {
            self.repo.diff_tree_to_tree(None, Some(&tree), None)?
        };

        let mut files = BTreeSet::new();
        for delta in diff.deltas() {
            if let Some(path) = delta.old_file().path() {
                files.insert(path.to_string_lossy().into_owned());
            }
            if let Some(path) = delta.new_file().path() {
                files.insert(path.to_string_lossy().into_owned());
            }
        }

        Ok(files.into_iter().collect())
    }

    /// Install the advisory post-commit hook (§4.3, §6). Overwrites any
    /// existing hook of the same name; the hook's only effect is to append a
    /// timestamped line to `commit_log_path` and it is never required for
    /// correctness.
    pub fn install_post_commit_hook(&self, commit_log_path: &Path) -> AppResult<()> {
        let hooks_dir = self.repo.path().join("hooks");
        std::fs::create_dir_all(&hooks_dir)?;

        let hook_path = hooks_dir.join("post-commit");
        let script = format!(
            "#!/bin/sh\n# installed by devtrackd: advisory only, not required for correctness\necho \"$(date -u +%Y-%m-%dT%H:%M:%SZ) commit $(git rev-parse HEAD)\" >> {}\n",
            commit_log_path.display()
        );
        std::fs::write(&hook_path, script)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = std::fs::metadata(&hook_path)?.permissions();
            perms.set_mode(0o755);
            std::fs::set_permissions(&hook_path, perms)?;
        }

        Ok(())
    }
}
