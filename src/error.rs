//! Error handling for the devtrack daemon
//!
//! Follows the same shape as most of this codebase's error modules:
//! thiserror for the enum, constructor helpers for string-payload variants,
//! and a severity classification consumed by the supervisor and logging.

use std::path::PathBuf;
use thiserror::Error;

/// Application result type alias
pub type AppResult<T> = std::result::Result<T, AppError>;

/// Main application error enum.
///
/// Variants mirror the abstract error kinds components are specified
/// against (`ConfigInvalid`, `NotARepository`, `StoreUnavailable`, ...).
#[derive(Error, Debug)]
pub enum AppError {
    /// Git repository operation errors
    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    /// I/O operation errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML configuration (de)serialization errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// IPC message (de)serialization errors
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Event store errors
    #[error("Store error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Configuration failed validation
    #[error("Configuration invalid: {message}")]
    ConfigInvalid { message: String },

    /// `addRepository` target is not a Git working copy
    #[error("not a git working copy: {0}")]
    InvalidRepo(PathBuf),

    /// Git watcher `new(repoPath)` target has no `.git` directory
    #[error("not a git repository: {0}")]
    NotARepository(PathBuf),

    /// Event store open failed (I/O or schema error)
    #[error("event store unavailable: {message}")]
    StoreUnavailable { message: String },

    /// Event store insert failed after bounded retries
    #[error("event store busy: {message}")]
    StoreBusy { message: String },

    /// Watcher could not be started
    #[error("watcher unavailable: {message}")]
    WatcherUnavailable { message: String },

    /// Watcher hit a permanent error and stopped
    #[error("watcher failed: {message}")]
    WatcherFailed { message: String },

    /// Transient failure reading repository state; logged and swallowed
    #[error("repository unreadable: {message}")]
    RepositoryUnreadable { message: String },

    /// IPC endpoint could not be bound
    #[error("bind failed: {message}")]
    BindFailed { message: String },

    /// IPC peer disconnected unexpectedly (logged, not fatal)
    #[error("peer disconnected: {message}")]
    PeerDisconnected { message: String },

    /// IPC frame failed to parse or validate
    #[error("malformed message: {message}")]
    MalformedMessage { message: String },

    /// Single-instance guard tripped; carries the running PID
    #[error("daemon already running (pid {pid})")]
    AlreadyRunning { pid: u32 },

    /// Control command issued against a daemon that is not running
    #[error("daemon is not running")]
    NotRunning,

    /// Scheduler could not be reached (e.g. stopped)
    #[error("scheduler unavailable: {message}")]
    SchedulerUnavailable { message: String },

    /// Generic application errors
    #[error("Application error: {message}")]
    Application { message: String },
}

impl AppError {
    pub fn config_invalid<S: Into<String>>(message: S) -> Self {
        Self::ConfigInvalid {
            message: message.into(),
        }
    }

    pub fn store_unavailable<S: Into<String>>(message: S) -> Self {
        Self::StoreUnavailable {
            message: message.into(),
        }
    }

    pub fn store_busy<S: Into<String>>(message: S) -> Self {
        Self::StoreBusy {
            message: message.into(),
        }
    }

    pub fn watcher_unavailable<S: Into<String>>(message: S) -> Self {
        Self::WatcherUnavailable {
            message: message.into(),
        }
    }

    pub fn watcher_failed<S: Into<String>>(message: S) -> Self {
        Self::WatcherFailed {
            message: message.into(),
        }
    }

    pub fn repository_unreadable<S: Into<String>>(message: S) -> Self {
        Self::RepositoryUnreadable {
            message: message.into(),
        }
    }

    pub fn bind_failed<S: Into<String>>(message: S) -> Self {
        Self::BindFailed {
            message: message.into(),
        }
    }

    pub fn peer_disconnected<S: Into<String>>(message: S) -> Self {
        Self::PeerDisconnected {
            message: message.into(),
        }
    }

    pub fn malformed_message<S: Into<String>>(message: S) -> Self {
        Self::MalformedMessage {
            message: message.into(),
        }
    }

    pub fn scheduler_unavailable<S: Into<String>>(message: S) -> Self {
        Self::SchedulerUnavailable {
            message: message.into(),
        }
    }

    pub fn application<S: Into<String>>(message: S) -> Self {
        Self::Application {
            message: message.into(),
        }
    }

    /// Configuration and startup errors are fatal (§7); per-event errors are
    /// logged and swallowed by their call sites instead.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            AppError::ConfigInvalid { .. }
                | AppError::Yaml(_)
                | AppError::NotARepository(_)
                | AppError::BindFailed { .. }
                | AppError::AlreadyRunning { .. }
                | AppError::InvalidRepo(_)
        )
    }

    /// Get error severity level
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            AppError::Git(_) => ErrorSeverity::Medium,
            AppError::Io(_) => ErrorSeverity::High,
            AppError::Yaml(_) => ErrorSeverity::High,
            AppError::Serde(_) => ErrorSeverity::Medium,
            AppError::Sqlite(_) => ErrorSeverity::High,
            AppError::ConfigInvalid { .. } => ErrorSeverity::Critical,
            AppError::InvalidRepo(_) => ErrorSeverity::Medium,
            AppError::NotARepository(_) => ErrorSeverity::Critical,
            AppError::StoreUnavailable { .. } => ErrorSeverity::Critical,
            AppError::StoreBusy { .. } => ErrorSeverity::Low,
            AppError::WatcherUnavailable { .. } => ErrorSeverity::High,
            AppError::WatcherFailed { .. } => ErrorSeverity::High,
            AppError::RepositoryUnreadable { .. } => ErrorSeverity::Low,
            AppError::BindFailed { .. } => ErrorSeverity::Critical,
            AppError::PeerDisconnected { .. } => ErrorSeverity::Low,
            AppError::MalformedMessage { .. } => ErrorSeverity::Low,
            AppError::AlreadyRunning { .. } => ErrorSeverity::Medium,
            AppError::NotRunning => ErrorSeverity::Low,
            AppError::SchedulerUnavailable { .. } => ErrorSeverity::High,
            AppError::Application { .. } => ErrorSeverity::Medium,
        }
    }
}

/// Error severity levels for monitoring and alerting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl ErrorSeverity {
    /// Convert severity to string for logging
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorSeverity::Low => "LOW",
            ErrorSeverity::Medium => "MEDIUM",
            ErrorSeverity::High => "HIGH",
            ErrorSeverity::Critical => "CRITICAL",
        }
    }
}
