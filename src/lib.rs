//! devtrackd: a developer-activity tracking daemon.
//!
//! Watches Git repositories for commits, fires an interval-aligned timer on
//! a configurable cadence, and publishes both as messages over a local IPC
//! bus to an external prompt/task-tracker peer, durably recording every
//! trigger, response, and task update along the way.
//!
//! # Architecture
//!
//! Five workers cooperate inside one process:
//! - **Git watcher** (`watcher`): notices HEAD advances per repository.
//! - **Scheduler** (`scheduler`): fires a wall-clock-aligned timer trigger.
//! - **Event store** (`store`): the durable record of every trigger,
//!   response, and task update.
//! - **IPC transport** (`ipc`): a newline-delimited JSON protocol over a
//!   Unix domain socket.
//! - **Integrated monitor** (`monitor`): wires the first three into the
//!   fourth — persistence happens-before publication for every trigger.
//!
//! The **daemon supervisor** (`daemon`) owns their lifecycle: the
//! single-instance PID guard, startup wiring, and graceful shutdown. The
//! **control surface** (`control`) is a separate, short-lived CLI process
//! that only ever touches the profile directory and the IPC socket inside
//! it — never daemon in-process state directly.

pub mod config;
pub mod control;
pub mod daemon;
pub mod error;
pub mod git;
pub mod ipc;
pub mod monitor;
pub mod scheduler;
pub mod store;
pub mod watcher;

pub use error::{AppError, AppResult};

use std::path::Path;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize structured logging.
///
/// Always logs human-readable output to stdout. When `log_file` is given
/// (the daemon process passes `daemon.log`; the control surface passes
/// `None` and logs to stdout only), a second non-blocking, non-ANSI layer
/// appends to that file. The returned guard must be held for the life of
/// the process — dropping it flushes and stops the writer thread, and
/// buffered lines written after that point are lost.
pub fn initialize_logging(log_file: Option<&Path>) -> AppResult<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "devtrackd=info".into());

    let Some(path) = log_file else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
        return Ok(None);
    };

    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let file_name = path
        .file_name()
        .ok_or_else(|| AppError::config_invalid("log file path has no file name"))?;
    std::fs::create_dir_all(dir)?;

    let appender = tracing_appender::rolling::never(dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::fmt::layer().with_writer(non_blocking).with_ansi(false))
        .init();

    Ok(Some(guard))
}
