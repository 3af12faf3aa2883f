//! Daemon supervisor (§4.7): process lifecycle, the single-instance PID
//! guard, and graceful shutdown.
//!
//! The PID guard is grounded on the pack's own lifecycle module's ordering
//! (validate, acquire, then write) but uses a liveness probe — `kill(pid,
//! None)` — instead of an OS-level file lock, since the contract is framed
//! purely in terms of "is the named process alive," not advisory locking.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::signal::unix::{signal as unix_signal, SignalKind};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::ipc::{Envelope, IpcServer, MessageHandler, MessageType};
use crate::monitor::Monitor;
use crate::scheduler::{Scheduler, TriggerHandler};
use crate::store::EventStore;
use crate::watcher::GitWatcher;

const KILL_POLL_INTERVAL: Duration = Duration::from_millis(100);
const KILL_TIMEOUT: Duration = Duration::from_secs(5);

/// Fixed on-disk layout under one profile directory (§6, §9 design note:
/// "pass it explicitly rather than recomputing it in each component").
#[derive(Debug, Clone)]
pub struct Paths {
    profile_dir: PathBuf,
}

impl Paths {
    pub fn new(profile_dir: impl Into<PathBuf>) -> Self {
        Self {
            profile_dir: profile_dir.into(),
        }
    }

    pub fn profile_dir(&self) -> &Path {
        &self.profile_dir
    }

    pub fn config_file(&self) -> PathBuf {
        self.profile_dir.join("config.yaml")
    }

    pub fn pid_file(&self) -> PathBuf {
        self.profile_dir.join("daemon.pid")
    }

    pub fn log_file(&self) -> PathBuf {
        self.profile_dir.join("daemon.log")
    }

    pub fn db_file(&self) -> PathBuf {
        self.profile_dir.join("devtrack.db")
    }

    pub fn socket_file(&self) -> PathBuf {
        self.profile_dir.join("devtrack.sock")
    }

    pub fn commit_log(&self) -> PathBuf {
        self.profile_dir.join("commit.log")
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DaemonStatus {
    pub running: bool,
    pub pid: Option<u32>,
}

fn read_pid_file(paths: &Paths) -> Option<u32> {
    std::fs::read_to_string(paths.pid_file()).ok()?.trim().parse().ok()
}

/// `kill(pid, 0)`: delivers no signal, only checks existence/permission.
fn is_process_alive(pid: u32) -> bool {
    match signal::kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => true,
        Err(nix::errno::Errno::ESRCH) => false,
        Err(_) => true,
    }
}

/// Refuse to proceed if a live process owns the PID file; clean up a stale
/// one; write the current PID atomically (§4.7 Single-instance guarantee).
fn acquire_pid_lock(paths: &Paths) -> AppResult<()> {
    if let Some(pid) = read_pid_file(paths) {
        if is_process_alive(pid) {
            return Err(AppError::AlreadyRunning { pid });
        }
        let _ = std::fs::remove_file(paths.pid_file());
    }

    std::fs::create_dir_all(&paths.profile_dir)?;
    let tmp = paths.pid_file().with_extension("pid.tmp");
    std::fs::write(&tmp, std::process::id().to_string())?;
    std::fs::rename(&tmp, paths.pid_file())?;
    Ok(())
}

fn release_pid_lock(paths: &Paths) {
    if paths.pid_file().exists() {
        if let Err(e) = std::fs::remove_file(paths.pid_file()) {
            warn!("failed to remove pid file: {e}");
        }
    }
}

pub fn is_running(paths: &Paths) -> bool {
    read_pid_file(paths).is_some_and(is_process_alive)
}

pub fn status(paths: &Paths) -> DaemonStatus {
    match read_pid_file(paths) {
        Some(pid) if is_process_alive(pid) => DaemonStatus {
            running: true,
            pid: Some(pid),
        },
        _ => DaemonStatus {
            running: false,
            pid: None,
        },
    }
}

/// Reads the whole log file and slices the last `lines` (§4.7: no rotation
/// is implemented here; external tools may rotate the file).
pub fn get_logs(paths: &Paths, lines: usize) -> AppResult<Vec<String>> {
    let content = match std::fs::read_to_string(paths.log_file()) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(AppError::Io(e)),
    };
    let all: Vec<&str> = content.lines().collect();
    let start = all.len().saturating_sub(lines);
    Ok(all[start..].iter().map(|s| s.to_string()).collect())
}

/// Sends the termination signal, polls liveness for up to 5 s, and
/// escalates to an unconditional kill; always removes the PID file
/// (§4.7 Forced termination).
pub async fn kill_daemon(paths: &Paths) -> AppResult<()> {
    let pid = match read_pid_file(paths) {
        Some(pid) => pid,
        None => return Err(AppError::NotRunning),
    };

    if !is_process_alive(pid) {
        release_pid_lock(paths);
        return Err(AppError::NotRunning);
    }

    let _ = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM);

    let deadline = tokio::time::Instant::now() + KILL_TIMEOUT;
    while tokio::time::Instant::now() < deadline && is_process_alive(pid) {
        tokio::time::sleep(KILL_POLL_INTERVAL).await;
    }

    if is_process_alive(pid) {
        let _ = signal::kill(Pid::from_raw(pid as i32), Signal::SIGKILL);
    }

    release_pid_lock(paths);
    Ok(())
}

/// Answers a `status_query` by broadcasting a `response` carrying the live
/// scheduler and store snapshot (§4.8). The server has no per-client reply
/// path, so this broadcasts; a control-surface client that is the only
/// listener on the socket at query time simply reads the one reply.
pub struct StatusResponder {
    scheduler: Arc<Scheduler>,
    store: Arc<EventStore>,
    server: Arc<IpcServer>,
}

impl StatusResponder {
    pub fn new(scheduler: Arc<Scheduler>, store: Arc<EventStore>, server: Arc<IpcServer>) -> Arc<Self> {
        Arc::new(Self { scheduler, store, server })
    }
}

#[async_trait]
impl MessageHandler for StatusResponder {
    async fn handle(&self, envelope: Envelope) -> AppResult<()> {
        let stats = self.scheduler.get_stats().await;
        let work_hours = self.scheduler.work_hours_status().await;
        let store_stats = self.store.get_stats()?;

        let mut response = Envelope::new(
            MessageType::Response,
            serde_json::json!({
                "trigger_count": stats.trigger_count,
                "last_trigger": stats.last_trigger,
                "next_trigger": stats.next_trigger,
                "paused": stats.paused,
                "interval_minutes": stats.interval_minutes,
                "work_hours_open": work_hours.is_open,
                "work_hours_opens_at": work_hours.opens_at,
                "store": store_stats,
            }),
        );
        response.id = envelope.id;
        self.server.send_message(&response).await
    }
}

/// Interprets `response` messages carrying `{"command": "..."}` as operator
/// commands against the live scheduler (pause/resume/force-trigger/
/// skip-next). The wire format has no dedicated command message type;
/// reusing the "application-defined" `response` slot keeps the envelope
/// stable per §6.
pub struct CommandHandler {
    scheduler: Arc<Scheduler>,
}

impl CommandHandler {
    pub fn new(scheduler: Arc<Scheduler>) -> Arc<Self> {
        Arc::new(Self { scheduler })
    }
}

#[async_trait]
impl MessageHandler for CommandHandler {
    async fn handle(&self, envelope: Envelope) -> AppResult<()> {
        let command = envelope.data.get("command").and_then(|v| v.as_str()).unwrap_or("");
        match command {
            "pause" => self.scheduler.pause().await,
            "resume" => self.scheduler.resume().await,
            "force-trigger" => self.scheduler.force_immediate().await,
            "skip-next" => self.scheduler.skip_next().await,
            other => warn!("unrecognized control command: {other}"),
        }
        Ok(())
    }
}

/// Owns the running daemon's worker set: the event store, the IPC server,
/// the scheduler, and one Git watcher per configured repository.
pub struct DaemonSupervisor {
    paths: Paths,
    server: Arc<IpcServer>,
    scheduler: Arc<Scheduler>,
    monitor: Arc<Monitor>,
    watchers: Mutex<Vec<Arc<GitWatcher>>>,
    retention_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

/// How often the retention sweep runs (§4.2 `cleanOldRecords`). The setting
/// itself (`retention_days`) comes from configuration; this is just the
/// sweep's own cadence, not reloaded on SIGHUP since a day-scale period
/// tolerates a stale value until the next restart.
const RETENTION_SWEEP_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

impl DaemonSupervisor {
    /// Full startup sequence: acquire the single-instance lock, open the
    /// store, bind IPC, start the scheduler, then start one watcher per
    /// enabled repository. Bind happens only after the lock is held, so a
    /// losing second instance never touches the socket of the running one.
    pub async fn start(config: &Config, paths: Paths) -> AppResult<Arc<Self>> {
        acquire_pid_lock(&paths)?;

        let store = Arc::new(EventStore::open(&paths.db_file())?);
        let server = Arc::new(IpcServer::new(paths.socket_file()));
        let monitor = Monitor::new(Arc::clone(&store), Arc::clone(&server));

        server
            .register_handler(MessageType::TaskUpdate, Arc::clone(&monitor) as Arc<dyn MessageHandler>)
            .await;
        server
            .register_handler(MessageType::Ack, Arc::clone(&monitor) as Arc<dyn MessageHandler>)
            .await;
        server
            .register_handler(MessageType::Error, Arc::clone(&monitor) as Arc<dyn MessageHandler>)
            .await;

        let scheduler = Arc::new(Scheduler::new(
            config.settings.prompt_interval_minutes,
            config.settings.work_hours_enabled,
            config.settings.work_start_hour,
            config.settings.work_end_hour,
            Arc::clone(&monitor) as Arc<dyn TriggerHandler>,
        )?);
        server
            .register_handler(MessageType::Response, CommandHandler::new(Arc::clone(&scheduler)))
            .await;
        server
            .register_handler(
                MessageType::StatusQuery,
                StatusResponder::new(Arc::clone(&scheduler), Arc::clone(&store), Arc::clone(&server)),
            )
            .await;

        if let Err(e) = server.start().await {
            release_pid_lock(&paths);
            return Err(e);
        }
        scheduler.start().await;

        let retention_days = config.settings.retention_days;
        let retention_store = Arc::clone(&store);
        let retention_task = tokio::spawn(async move {
            loop {
                if let Err(e) = retention_store.clean_old_records(retention_days) {
                    error!("retention sweep failed: {e}");
                }
                tokio::time::sleep(RETENTION_SWEEP_INTERVAL).await;
            }
        });

        let supervisor = Arc::new(Self {
            paths,
            server,
            scheduler,
            monitor,
            watchers: Mutex::new(Vec::new()),
            retention_task: Mutex::new(Some(retention_task)),
        });

        for repo in config.enabled_repositories() {
            if let Err(e) = supervisor.start_watcher(&repo.path).await {
                error!("failed to start watcher for {}: {e}", repo.path.display());
            }
        }

        Ok(supervisor)
    }

    async fn start_watcher(self: &Arc<Self>, repo_path: &Path) -> AppResult<()> {
        let watcher = Arc::new(GitWatcher::new(repo_path)?);
        if let Err(e) = watcher.install_post_commit_hook(&self.paths.commit_log()).await {
            warn!("failed to install post-commit hook for {}: {e}", repo_path.display());
        }

        let monitor = Arc::clone(&self.monitor);
        let repo_path_owned = repo_path.to_path_buf();
        watcher
            .start(move |branch, commit| {
                let monitor = Arc::clone(&monitor);
                let repo_path_owned = repo_path_owned.clone();
                tokio::spawn(async move {
                    monitor.handle_commit(&repo_path_owned, branch, commit).await;
                });
            })
            .await?;

        self.watchers.lock().await.push(watcher);
        Ok(())
    }

    /// Stops every worker, publishes a final IPC shutdown, and releases the
    /// PID file (§4.7 Graceful shutdown).
    pub async fn shutdown(&self) {
        self.scheduler.stop().await;
        for watcher in self.watchers.lock().await.iter() {
            watcher.stop().await;
        }
        if let Some(task) = self.retention_task.lock().await.take() {
            task.abort();
        }
        self.server.stop().await;
        release_pid_lock(&self.paths);
        info!("daemon shutdown complete");
    }

    /// Blocks until INT or TERM, reloading configuration on HUP without
    /// restarting (§4.7).
    pub async fn run_until_signal(self: Arc<Self>) -> AppResult<()> {
        let mut sigint = unix_signal(SignalKind::interrupt()).map_err(|e| AppError::application(e.to_string()))?;
        let mut sigterm = unix_signal(SignalKind::terminate()).map_err(|e| AppError::application(e.to_string()))?;
        let mut sighup = unix_signal(SignalKind::hangup()).map_err(|e| AppError::application(e.to_string()))?;

        loop {
            tokio::select! {
                _ = sigint.recv() => {
                    info!("received SIGINT");
                    break;
                }
                _ = sigterm.recv() => {
                    info!("received SIGTERM");
                    break;
                }
                _ = sighup.recv() => {
                    info!("received SIGHUP; reloading configuration");
                    match Config::load(self.paths.profile_dir()) {
                        Ok(config) => {
                            if let Err(e) = self.scheduler.set_interval(config.settings.prompt_interval_minutes).await {
                                error!("failed to apply reloaded interval: {e}");
                            }
                        }
                        Err(e) if e.is_fatal() => {
                            error!("reloaded configuration is unusable, shutting down: {e}");
                            break;
                        }
                        Err(e) => warn!("failed to reload configuration, keeping current settings: {e}"),
                    }
                }
            }
        }

        self.shutdown().await;
        Ok(())
    }
}
