//! Git watcher (§4.3): watches a repository's `.git` directory tree and
//! invokes a callback with a `CommitInfo` each time `HEAD` advances.
//!
//! The `notify` crate delivers filesystem events on a background OS thread
//! (it has no async API); that thread is bridged into the Tokio runtime by
//! handing each relevant event to `Handle::spawn`, mirroring how the pack's
//! own worktree watcher bridges `notify-debouncer-full` callbacks into an
//! event broadcaster. Debounce here is a plain 100 ms sleep per event rather
//! than a dedicated debouncer crate, since a single cursor compare after the
//! sleep already collapses a burst of events into at most one emission.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::runtime::Handle;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, warn};

use crate::error::{AppError, AppResult};
use crate::git::{is_git_working_copy, CommitInfo, GitRepo};

const DEBOUNCE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherState {
    New,
    Watching,
    Stopped,
    Failed,
}

type CommitCallback = dyn Fn(Option<String>, CommitInfo) + Send + Sync;

pub struct GitWatcher {
    repo_path: PathBuf,
    state: AsyncMutex<WatcherState>,
    cursor: AsyncMutex<Option<String>>,
    handle: AsyncMutex<Option<RecommendedWatcher>>,
}

impl std::fmt::Debug for GitWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitWatcher")
            .field("repo_path", &self.repo_path)
            .finish_non_exhaustive()
    }
}

impl GitWatcher {
    /// Validate that `repo_path` contains a `.git` directory (§4.3 `new`
    /// contract).
    pub fn new(repo_path: &Path) -> AppResult<Self> {
        if !is_git_working_copy(repo_path) {
            return Err(AppError::NotARepository(repo_path.to_path_buf()));
        }

        Ok(Self {
            repo_path: repo_path.to_path_buf(),
            state: AsyncMutex::new(WatcherState::New),
            cursor: AsyncMutex::new(None),
            handle: AsyncMutex::new(None),
        })
    }

    pub async fn state(&self) -> WatcherState {
        *self.state.lock().await
    }

    /// Record the current HEAD as the cursor and begin watching. Never
    /// emits for the commit HEAD already pointed at (§4.3).
    pub async fn start<F>(self: &Arc<Self>, on_commit: F) -> AppResult<()>
    where
        F: Fn(Option<String>, CommitInfo) + Send + Sync + 'static,
    {
        let repo_path = self.repo_path.clone();
        let initial_head = tokio::task::spawn_blocking(move || {
            GitRepo::open(&repo_path).and_then(|r| r.head_commit_id())
        })
        .await
        .map_err(|e| AppError::watcher_unavailable(e.to_string()))??;
        *self.cursor.lock().await = Some(initial_head);

        let git_dir = self.repo_path.join(".git");
        let (tx, rx) = std::sync::mpsc::channel::<notify::Result<Event>>();
        let mut watcher = notify::recommended_watcher(move |res| {
            let _ = tx.send(res);
        })
        .map_err(|e| AppError::watcher_unavailable(e.to_string()))?;
        watcher
            .watch(&git_dir, RecursiveMode::Recursive)
            .map_err(|e| AppError::watcher_unavailable(e.to_string()))?;

        let on_commit: Arc<CommitCallback> = Arc::new(on_commit);
        let this = Arc::clone(self);
        let rt_handle = Handle::current();

        std::thread::spawn(move || {
            for result in rx {
                match result {
                    Ok(event) if is_relevant_event(&event) => {
                        let this = Arc::clone(&this);
                        let on_commit = Arc::clone(&on_commit);
                        rt_handle.spawn(async move {
                            tokio::time::sleep(DEBOUNCE).await;
                            if let Err(e) = this.poll_once(on_commit.as_ref()).await {
                                warn!("git watcher poll failed: {e}");
                                *this.state.lock().await = WatcherState::Failed;
                            }
                        });
                    }
                    Ok(_) => {}
                    Err(e) => warn!("git watcher event error: {e}"),
                }
            }
            debug!("git watcher event thread exiting");
        });

        *self.handle.lock().await = Some(watcher);
        *self.state.lock().await = WatcherState::Watching;
        Ok(())
    }

    /// Release the watch. The background thread exits once the watcher is
    /// dropped and its sender side closes.
    pub async fn stop(&self) {
        *self.handle.lock().await = None;
        let mut state = self.state.lock().await;
        if *state != WatcherState::Failed {
            *state = WatcherState::Stopped;
        }
    }

    /// Read HEAD; if it differs from the cursor, build a `CommitInfo`,
    /// advance the cursor, and invoke the callback. Holding the cursor lock
    /// across the whole check serializes emissions per repository.
    async fn poll_once(&self, on_commit: &CommitCallback) -> AppResult<()> {
        if self.state().await == WatcherState::Failed {
            return Ok(());
        }

        let mut cursor = self.cursor.lock().await;
        let repo_path = self.repo_path.clone();
        let current_head = match tokio::task::spawn_blocking(move || {
            GitRepo::open(&repo_path).and_then(|r| r.head_commit_id())
        })
        .await
        {
            Ok(Ok(head)) => head,
            Ok(Err(e)) => {
                warn!("repository unreadable during poll: {e}");
                return Err(AppError::repository_unreadable(e.to_string()));
            }
            Err(e) => return Err(AppError::watcher_unavailable(e.to_string())),
        };

        if cursor.as_deref() == Some(current_head.as_str()) {
            return Ok(());
        }

        let repo_path = self.repo_path.clone();
        let head_for_info = current_head.clone();
        let (commit_info, branch) = tokio::task::spawn_blocking(move || {
            let repo = GitRepo::open(&repo_path)?;
            let info = repo.commit_info(&head_for_info)?;
            AppResult::Ok((info, repo.current_branch()))
        })
        .await
        .map_err(|e| AppError::watcher_unavailable(e.to_string()))??;

        *cursor = Some(current_head);
        drop(cursor);

        on_commit(branch, commit_info);
        Ok(())
    }

    /// Install the advisory post-commit hook (§4.3, §6).
    pub async fn install_post_commit_hook(&self, commit_log_path: &Path) -> AppResult<()> {
        let repo_path = self.repo_path.clone();
        let commit_log_path = commit_log_path.to_path_buf();
        tokio::task::spawn_blocking(move || {
            GitRepo::open(&repo_path)?.install_post_commit_hook(&commit_log_path)
        })
        .await
        .map_err(|e| AppError::watcher_unavailable(e.to_string()))?
    }
}

/// Writes or creates that aren't lock files or editor temporaries (§4.3).
fn is_relevant_event(event: &Event) -> bool {
    let is_write_or_create = matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_));
    if !is_write_or_create {
        return false;
    }

    event.paths.iter().any(|path| {
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
        !name.ends_with(".lock") && !name.ends_with('~')
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    fn init_repo(dir: &Path) -> git2::Repository {
        let repo = git2::Repository::init(dir).unwrap();
        let sig = git2::Signature::now("tester", "tester@example.com").unwrap();
        std::fs::write(dir.join("a.txt"), "hello").unwrap();
        let mut index = repo.index().unwrap();
        index.add_path(Path::new("a.txt")).unwrap();
        index.write().unwrap();
        let tree_id = index.write_tree().unwrap();
        let tree = repo.find_tree(tree_id).unwrap();
        repo.commit(Some("HEAD"), &sig, &sig, "initial", &tree, &[])
            .unwrap();
        drop(tree);
        repo
    }

    #[test]
    fn new_rejects_non_git_path() {
        let dir = tempdir().unwrap();
        let err = GitWatcher::new(dir.path()).unwrap_err();
        assert!(matches!(err, AppError::NotARepository(_)));
    }

    fn relevant(kind: EventKind, path: &str) -> Event {
        Event::new(kind).add_path(PathBuf::from(path))
    }

    #[test]
    fn filters_lock_and_tilde_files() {
        assert!(!is_relevant_event(&relevant(
            EventKind::Modify(notify::event::ModifyKind::Any),
            "/repo/.git/HEAD.lock"
        )));
        assert!(!is_relevant_event(&relevant(
            EventKind::Create(notify::event::CreateKind::Any),
            "/repo/.git/index~"
        )));
        assert!(is_relevant_event(&relevant(
            EventKind::Modify(notify::event::ModifyKind::Any),
            "/repo/.git/HEAD"
        )));
        assert!(!is_relevant_event(&relevant(EventKind::Access(notify::event::AccessKind::Any), "/repo/.git/HEAD")));
    }

    #[tokio::test]
    async fn start_captures_initial_head_without_emitting() {
        let dir = tempdir().unwrap();
        init_repo(dir.path());

        let watcher = Arc::new(GitWatcher::new(dir.path()).unwrap());
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);
        watcher
            .start(move |_branch, _commit| {
                count_clone.fetch_add(1, Ordering::SeqCst);
            })
            .await
            .unwrap();

        assert_eq!(watcher.state().await, WatcherState::Watching);
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(watcher.cursor.lock().await.is_some());
    }

    #[tokio::test]
    async fn poll_once_emits_on_new_commit_and_advances_cursor() {
        let dir = tempdir().unwrap();
        let repo = init_repo(dir.path());

        let watcher = Arc::new(GitWatcher::new(dir.path()).unwrap());
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);
        watcher
            .start(move |_branch, _commit| {
                count_clone.fetch_add(1, Ordering::SeqCst);
            })
            .await
            .unwrap();

        let initial_cursor = watcher.cursor.lock().await.clone();

        let sig = git2::Signature::now("tester", "tester@example.com").unwrap();
        std::fs::write(dir.path().join("b.txt"), "world").unwrap();
        let mut index = repo.index().unwrap();
        index.add_path(Path::new("b.txt")).unwrap();
        index.write().unwrap();
        let tree_id = index.write_tree().unwrap();
        let tree = repo.find_tree(tree_id).unwrap();
        let parent = repo.head().unwrap().peel_to_commit().unwrap();
        repo.commit(Some("HEAD"), &sig, &sig, "second", &tree, &[&parent])
            .unwrap();

        let on_commit = Arc::new(move |_b: Option<String>, _c: CommitInfo| {}) as Arc<CommitCallback>;
        watcher.poll_once(on_commit.as_ref()).await.unwrap();

        let new_cursor = watcher.cursor.lock().await.clone();
        assert_ne!(initial_cursor, new_cursor);
    }

    #[tokio::test]
    async fn stop_sets_state_and_releases_watcher() {
        let dir = tempdir().unwrap();
        init_repo(dir.path());
        let watcher = Arc::new(GitWatcher::new(dir.path()).unwrap());
        watcher.start(|_branch, _commit| {}).await.unwrap();
        watcher.stop().await;
        assert_eq!(watcher.state().await, WatcherState::Stopped);
        assert!(watcher.handle.lock().await.is_none());
    }
}
