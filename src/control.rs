//! Control surface (§4.8): CLI subcommand dispatch, status formatting, and
//! the icon/summary/next-step failure presentation convention (§7).
//!
//! Runs in a short-lived client process against a long-lived daemon
//! process; the two only share the profile directory and the IPC socket
//! inside it, never in-process state.

use std::path::PathBuf;
use std::time::Duration;

use serde_json::Value as JsonValue;

use crate::config::Config;
use crate::daemon::{self, DaemonSupervisor, Paths};
use crate::error::{AppError, AppResult};
use crate::ipc::{Envelope, IpcClient, MessageType};

const STATUS_QUERY_TIMEOUT: Duration = Duration::from_secs(2);
const DEFAULT_LOG_LINES: usize = 50;

pub fn default_profile_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")).join(".devtrack")
}

/// Run one subcommand to completion and return the process exit code.
/// `start` blocks until the daemon receives a shutdown signal; every other
/// command returns promptly.
pub async fn dispatch(command: &str, args: &[String], paths: &Paths) -> i32 {
    let result = match command {
        "start" => cmd_start(paths).await,
        "stop" => cmd_stop(paths).await,
        "restart" => cmd_restart(paths).await,
        "status" => cmd_status(paths).await,
        "pause" => cmd_control_command(paths, "pause").await,
        "resume" => cmd_control_command(paths, "resume").await,
        "force-trigger" => cmd_control_command(paths, "force-trigger").await,
        "skip-next" => cmd_control_command(paths, "skip-next").await,
        "send-summary" => cmd_control_command(paths, "send-summary").await,
        "logs" => cmd_logs(paths, args),
        "db-stats" => cmd_db_stats(paths),
        "version" => {
            print_version();
            Ok(())
        }
        "help" | "--help" | "-h" | "" => {
            print_help();
            Ok(())
        }
        other => Err(AppError::application(format!("unknown command: {other}"))),
    };

    match result {
        Ok(()) => 0,
        Err(AppError::AlreadyRunning { pid }) => {
            present_error(&AppError::AlreadyRunning { pid });
            0
        }
        Err(e) => {
            present_error(&e);
            1
        }
    }
}

/// Icon + one-line summary + actionable next step; never a raw stack trace
/// (§7).
fn present_error(err: &AppError) {
    let next_step: String = match err {
        AppError::AlreadyRunning { pid } => format!("pid {pid} is already running devtrackd; nothing to do"),
        AppError::NotRunning => "start the daemon first with `devtrackd start`".to_string(),
        AppError::BindFailed { .. } => "check that no other process holds the socket or pid file".to_string(),
        AppError::ConfigInvalid { .. } => "fix config.yaml and retry".to_string(),
        AppError::PeerDisconnected { .. } => "the daemon may be busy or shutting down; retry shortly".to_string(),
        _ => "see daemon.log for details".to_string(),
    };
    let icon = if matches!(err, AppError::AlreadyRunning { .. }) { "\u{26a0}" } else { "\u{2717}" };
    eprintln!("{icon} {err}");
    eprintln!("  -> {next_step}");
}

async fn cmd_start(paths: &Paths) -> AppResult<()> {
    let config = Config::load(paths.profile_dir())?;
    let supervisor = DaemonSupervisor::start(&config, paths.clone()).await?;
    println!("\u{2713} devtrackd started (pid {})", std::process::id());
    supervisor.run_until_signal().await
}

async fn cmd_stop(paths: &Paths) -> AppResult<()> {
    daemon::kill_daemon(paths).await?;
    println!("\u{2713} devtrackd stopped");
    Ok(())
}

/// Stops the running process (if any) then launches a fresh detached
/// instance running `start` in the background.
async fn cmd_restart(paths: &Paths) -> AppResult<()> {
    if daemon::is_running(paths) {
        daemon::kill_daemon(paths).await?;
    }
    let exe = std::env::current_exe()?;
    std::process::Command::new(exe)
        .arg("start")
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn()?;
    println!("\u{2713} devtrackd restarted");
    Ok(())
}

async fn cmd_status(paths: &Paths) -> AppResult<()> {
    let status = daemon::status(paths);
    println!("devtrackd status");
    println!("  running:    {}", status.running);
    match status.pid {
        Some(pid) => println!("  pid:        {pid}"),
        None => println!("  pid:        -"),
    }
    println!("  config:     {}", paths.config_file().display());
    println!("  log file:   {}", paths.log_file().display());
    println!("  pid file:   {}", paths.pid_file().display());
    println!("  database:   {}", paths.db_file().display());

    if let Ok(metadata) = std::fs::metadata(paths.log_file()) {
        if let Ok(elapsed) = metadata.modified().and_then(|m| m.elapsed().map_err(std::io::Error::other)) {
            println!("  uptime:     ~{}s since last log write", elapsed.as_secs());
        }
    }

    if status.running {
        match query_live_status(paths).await {
            Ok(data) => print_live_status(&data),
            Err(e) => println!("  (live scheduler stats unavailable: {e})"),
        }
    }

    Ok(())
}

fn print_live_status(data: &JsonValue) {
    let bool_field = |key: &str| data.get(key).and_then(JsonValue::as_bool).unwrap_or(false);
    let u64_field = |key: &str| data.get(key).and_then(JsonValue::as_u64).unwrap_or(0);

    println!("  paused:     {}", bool_field("paused"));
    println!("  interval:   {} min", u64_field("interval_minutes"));
    println!("  triggers:   {}", u64_field("trigger_count"));
    if let Some(last) = data.get("last_trigger").and_then(JsonValue::as_str) {
        println!("  last fired: {last}");
    }
    if let Some(next) = data.get("next_trigger").and_then(JsonValue::as_str) {
        println!("  next fire:  {next}");
    }
    let gate = if bool_field("work_hours_open") { "open" } else { "closed" };
    println!("  work hours: {gate}");
}

/// Connect, send a `status_query`, and wait for the broadcast `response`
/// carrying the snapshot (§4.8).
async fn query_live_status(paths: &Paths) -> AppResult<JsonValue> {
    let client = IpcClient::new(paths.socket_file());
    client.connect().await?;
    client
        .send_message(&Envelope::new(MessageType::StatusQuery, JsonValue::Object(Default::default())))
        .await?;

    let response = tokio::time::timeout(STATUS_QUERY_TIMEOUT, client.receive_message())
        .await
        .map_err(|_| AppError::peer_disconnected("status query timed out"))??;
    client.disconnect().await;
    Ok(response.data)
}

/// `pause`/`resume`/`force-trigger`/`skip-next`/`send-summary` all require a
/// running daemon and are forwarded as a `response`-typed command envelope
/// (§9 design note: the wire format has no dedicated command type).
async fn cmd_control_command(paths: &Paths, command: &str) -> AppResult<()> {
    if !daemon::is_running(paths) {
        return Err(AppError::NotRunning);
    }
    let client = IpcClient::new(paths.socket_file());
    client.connect().await?;
    client
        .send_message(&Envelope::new(MessageType::Response, serde_json::json!({ "command": command })))
        .await?;
    client.disconnect().await;
    println!("\u{2713} {command} sent");
    Ok(())
}

fn cmd_logs(paths: &Paths, args: &[String]) -> AppResult<()> {
    let lines = args.first().and_then(|s| s.parse::<usize>().ok()).unwrap_or(DEFAULT_LOG_LINES);
    for line in daemon::get_logs(paths, lines)? {
        println!("{line}");
    }
    Ok(())
}

fn cmd_db_stats(paths: &Paths) -> AppResult<()> {
    let store = crate::store::EventStore::open(&paths.db_file())?;
    let stats = store.get_stats()?;
    println!("triggers:               {}", stats.triggers);
    println!("responses:              {}", stats.responses);
    println!("task_updates:           {}", stats.task_updates);
    println!("unsynced_task_updates:  {}", stats.unsynced_task_updates);
    println!("logs:                   {}", stats.logs);
    println!("database:               {}", stats.db_path);
    Ok(())
}

fn print_version() {
    println!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
}

fn print_help() {
    println!(
        "devtrackd - developer-activity tracking daemon\n\n\
         USAGE:\n    devtrackd <command> [args]\n\n\
         COMMANDS:\n\
         \x20   start           run the daemon in the foreground\n\
         \x20   stop            terminate the running daemon\n\
         \x20   restart         stop then relaunch the daemon in the background\n\
         \x20   status          report daemon state and scheduler snapshot\n\
         \x20   pause           suspend the scheduler's regular cadence\n\
         \x20   resume          resume the scheduler's regular cadence\n\
         \x20   force-trigger   fire a timer trigger immediately, bypassing gates\n\
         \x20   skip-next       push the next scheduled trigger back one interval\n\
         \x20   send-summary    ask the connected peer to produce a summary\n\
         \x20   logs [n]        print the last n lines of the daemon log (default 50)\n\
         \x20   db-stats        print event-store row counts\n\
         \x20   version         print the binary's version\n\
         \x20   help            print this message"
    );
}
