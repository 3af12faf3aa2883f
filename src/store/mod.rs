//! Event store (§4.2): a single-file embedded relational database recording
//! triggers, responses, task updates, structured logs, and config key/value
//! pairs.
//!
//! Backed by `rusqlite`. All access goes through one `Mutex`-guarded
//! connection — SQLite serializes writers internally, and the mutex keeps
//! to the "short bounded time" transaction discipline the contract
//! requires by construction (no caller can hold the connection across an
//! `.await`).

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::{AppError, AppResult};

const BUSY_TIMEOUT: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerType {
    Commit,
    Timer,
    Manual,
}

impl TriggerType {
    fn as_str(&self) -> &'static str {
        match self {
            TriggerType::Commit => "commit",
            TriggerType::Timer => "timer",
            TriggerType::Manual => "manual",
        }
    }

    fn parse(s: &str) -> AppResult<Self> {
        match s {
            "commit" => Ok(TriggerType::Commit),
            "timer" => Ok(TriggerType::Timer),
            "manual" => Ok(TriggerType::Manual),
            other => Err(AppError::store_unavailable(format!(
                "unknown trigger_type in database: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl LogLevel {
    fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
        }
    }
}

/// A new trigger to insert (§3 TriggerEvent, minus the assigned id).
#[derive(Debug, Clone)]
pub struct NewTrigger {
    pub trigger_type: TriggerType,
    pub timestamp: DateTime<Utc>,
    pub source: String,
    pub repo_path: Option<String>,
    pub commit_hash: Option<String>,
    pub commit_message: Option<String>,
    pub author: Option<String>,
    pub data: JsonValue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerEvent {
    pub id: i64,
    pub trigger_type: TriggerType,
    pub timestamp: DateTime<Utc>,
    pub source: String,
    pub repo_path: Option<String>,
    pub commit_hash: Option<String>,
    pub commit_message: Option<String>,
    pub author: Option<String>,
    pub data: JsonValue,
    pub processed: bool,
}

#[derive(Debug, Clone)]
pub struct NewResponse {
    pub trigger_id: i64,
    pub timestamp: DateTime<Utc>,
    pub project: Option<String>,
    pub ticket_id: Option<String>,
    pub description: Option<String>,
    pub time_spent: Option<String>,
    pub status: Option<String>,
    pub raw_input: String,
}

#[derive(Debug, Clone)]
pub struct NewTaskUpdate {
    pub response_id: i64,
    pub timestamp: DateTime<Utc>,
    pub project: Option<String>,
    pub ticket_id: Option<String>,
    pub update_text: Option<String>,
    pub status: Option<String>,
    pub synced: bool,
    pub platform: String,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskUpdate {
    pub id: i64,
    pub response_id: i64,
    pub timestamp: DateTime<Utc>,
    pub project: Option<String>,
    pub ticket_id: Option<String>,
    pub update_text: Option<String>,
    pub status: Option<String>,
    pub synced: bool,
    pub synced_at: Option<DateTime<Utc>>,
    pub platform: String,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewLog {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub component: String,
    pub message: String,
    pub data: Option<JsonValue>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreStats {
    pub triggers: i64,
    pub responses: i64,
    pub task_updates: i64,
    pub unsynced_task_updates: i64,
    pub logs: i64,
    pub db_path: String,
}

pub struct EventStore {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl EventStore {
    /// Open (or create) the database at `path`, creating the schema
    /// idempotently. Returns `StoreUnavailable` on I/O or schema error
    /// (§4.2 Failures).
    pub fn open(path: &Path) -> AppResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| AppError::store_unavailable(e.to_string()))?;
        }

        let conn = Connection::open(path)
            .map_err(|e| AppError::store_unavailable(e.to_string()))?;
        conn.busy_timeout(BUSY_TIMEOUT)
            .map_err(|e| AppError::store_unavailable(e.to_string()))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| AppError::store_unavailable(e.to_string()))?;
        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(|e| AppError::store_unavailable(e.to_string()))?;

        let store = Self {
            conn: Mutex::new(conn),
            path: path.to_path_buf(),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> AppResult<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS triggers (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                trigger_type TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                source TEXT NOT NULL,
                repo_path TEXT,
                commit_hash TEXT,
                commit_message TEXT,
                author TEXT,
                data TEXT NOT NULL,
                processed INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_triggers_timestamp ON triggers(timestamp);
            CREATE INDEX IF NOT EXISTS idx_triggers_processed ON triggers(processed);

            CREATE TABLE IF NOT EXISTS responses (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                trigger_id INTEGER NOT NULL REFERENCES triggers(id),
                timestamp TEXT NOT NULL,
                project TEXT,
                ticket_id TEXT,
                description TEXT,
                time_spent TEXT,
                status TEXT,
                raw_input TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_responses_trigger_id ON responses(trigger_id);

            CREATE TABLE IF NOT EXISTS task_updates (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                response_id INTEGER NOT NULL REFERENCES responses(id),
                timestamp TEXT NOT NULL,
                project TEXT,
                ticket_id TEXT,
                update_text TEXT,
                status TEXT,
                synced INTEGER NOT NULL DEFAULT 0,
                synced_at TEXT,
                platform TEXT NOT NULL,
                error TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_task_updates_response_id ON task_updates(response_id);
            CREATE INDEX IF NOT EXISTS idx_task_updates_synced ON task_updates(synced);

            CREATE TABLE IF NOT EXISTS logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                level TEXT NOT NULL,
                component TEXT NOT NULL,
                message TEXT NOT NULL,
                data TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_logs_timestamp ON logs(timestamp);
            CREATE INDEX IF NOT EXISTS idx_logs_level ON logs(level);

            CREATE TABLE IF NOT EXISTS config (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            "#,
        )
        .map_err(|e| AppError::store_unavailable(e.to_string()))?;
        Ok(())
    }

    fn lock(&self) -> AppResult<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| AppError::store_unavailable("event store mutex poisoned"))
    }

    /// Classify a rusqlite error as `StoreBusy` on contention, `StoreUnavailable`
    /// otherwise (§4.2 Failures).
    fn classify(err: rusqlite::Error) -> AppError {
        if let rusqlite::Error::SqliteFailure(ref inner, _) = err {
            if inner.code == rusqlite::ErrorCode::DatabaseBusy
                || inner.code == rusqlite::ErrorCode::DatabaseLocked
            {
                return AppError::store_busy(err.to_string());
            }
        }
        AppError::Sqlite(err)
    }

    pub fn insert_trigger(&self, trigger: &NewTrigger) -> AppResult<i64> {
        let conn = self.lock()?;
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO triggers (trigger_type, timestamp, source, repo_path, commit_hash, commit_message, author, data, processed, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0, ?9)",
            params![
                trigger.trigger_type.as_str(),
                trigger.timestamp.to_rfc3339(),
                trigger.source,
                trigger.repo_path,
                trigger.commit_hash,
                trigger.commit_message,
                trigger.author,
                trigger.data.to_string(),
                now,
            ],
        )
        .map_err(Self::classify)?;
        Ok(conn.last_insert_rowid())
    }

    pub fn mark_trigger_processed(&self, id: i64) -> AppResult<()> {
        let conn = self.lock()?;
        conn.execute("UPDATE triggers SET processed = 1 WHERE id = ?1", params![id])
            .map_err(Self::classify)?;
        Ok(())
    }

    pub fn get_trigger_by_id(&self, id: i64) -> AppResult<Option<TriggerEvent>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT id, trigger_type, timestamp, source, repo_path, commit_hash, commit_message, author, data, processed
             FROM triggers WHERE id = ?1",
            params![id],
            Self::row_to_trigger,
        )
        .optional()
        .map_err(Self::classify)?
        .transpose()
    }

    pub fn get_recent_triggers(&self, limit: usize) -> AppResult<Vec<TriggerEvent>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, trigger_type, timestamp, source, repo_path, commit_hash, commit_message, author, data, processed
                 FROM triggers ORDER BY id DESC LIMIT ?1",
            )
            .map_err(Self::classify)?;
        let rows = stmt
            .query_map(params![limit as i64], Self::row_to_trigger)
            .map_err(Self::classify)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(Self::classify)??);
        }
        Ok(out)
    }

    fn row_to_trigger(row: &rusqlite::Row<'_>) -> rusqlite::Result<AppResult<TriggerEvent>> {
        let trigger_type: String = row.get(1)?;
        let timestamp: String = row.get(2)?;
        let data: String = row.get(8)?;
        Ok((|| {
            Ok(TriggerEvent {
                id: row.get(0)?,
                trigger_type: TriggerType::parse(&trigger_type)?,
                timestamp: parse_rfc3339(&timestamp)?,
                source: row.get(3)?,
                repo_path: row.get(4)?,
                commit_hash: row.get(5)?,
                commit_message: row.get(6)?,
                author: row.get(7)?,
                data: serde_json::from_str(&data).unwrap_or(JsonValue::Null),
                processed: row.get::<_, i64>(9)? != 0,
            })
        })())
    }

    pub fn insert_response(&self, response: &NewResponse) -> AppResult<i64> {
        let conn = self.lock()?;
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO responses (trigger_id, timestamp, project, ticket_id, description, time_spent, status, raw_input, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                response.trigger_id,
                response.timestamp.to_rfc3339(),
                response.project,
                response.ticket_id,
                response.description,
                response.time_spent,
                response.status,
                response.raw_input,
                now,
            ],
        )
        .map_err(Self::classify)?;
        Ok(conn.last_insert_rowid())
    }

    pub fn insert_task_update(&self, update: &NewTaskUpdate) -> AppResult<i64> {
        let conn = self.lock()?;
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO task_updates (response_id, timestamp, project, ticket_id, update_text, status, synced, synced_at, platform, error, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, NULL, ?8, ?9, ?10)",
            params![
                update.response_id,
                update.timestamp.to_rfc3339(),
                update.project,
                update.ticket_id,
                update.update_text,
                update.status,
                update.synced as i64,
                update.platform,
                update.error,
                now,
            ],
        )
        .map_err(Self::classify)?;
        Ok(conn.last_insert_rowid())
    }

    /// Flip `synced = true` and set `syncedAt = at`. Idempotent: a second
    /// call on an already-synced row is a no-op (§4.2).
    pub fn mark_task_update_synced(&self, id: i64, at: DateTime<Utc>) -> AppResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE task_updates SET synced = 1, synced_at = ?1 WHERE id = ?2 AND synced = 0",
            params![at.to_rfc3339(), id],
        )
        .map_err(Self::classify)?;
        Ok(())
    }

    pub fn get_unsynced_task_updates(&self) -> AppResult<Vec<TaskUpdate>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, response_id, timestamp, project, ticket_id, update_text, status, synced, synced_at, platform, error
                 FROM task_updates WHERE synced = 0 ORDER BY id ASC",
            )
            .map_err(Self::classify)?;
        let rows = stmt
            .query_map([], Self::row_to_task_update)
            .map_err(Self::classify)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(Self::classify)??);
        }
        Ok(out)
    }

    fn row_to_task_update(row: &rusqlite::Row<'_>) -> rusqlite::Result<AppResult<TaskUpdate>> {
        let timestamp: String = row.get(2)?;
        let synced_at: Option<String> = row.get(8)?;
        Ok((|| {
            Ok(TaskUpdate {
                id: row.get(0)?,
                response_id: row.get(1)?,
                timestamp: parse_rfc3339(&timestamp)?,
                project: row.get(3)?,
                ticket_id: row.get(4)?,
                update_text: row.get(5)?,
                status: row.get(6)?,
                synced: row.get::<_, i64>(7)? != 0,
                synced_at: synced_at.map(|s| parse_rfc3339(&s)).transpose()?,
                platform: row.get(9)?,
                error: row.get(10)?,
            })
        })())
    }

    pub fn insert_log(&self, log: &NewLog) -> AppResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO logs (timestamp, level, component, message, data) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                log.timestamp.to_rfc3339(),
                log.level.as_str(),
                log.component,
                log.message,
                log.data.as_ref().map(|v| v.to_string()),
            ],
        )
        .map_err(Self::classify)?;
        Ok(())
    }

    pub fn get_config(&self, key: &str) -> AppResult<Option<String>> {
        let conn = self.lock()?;
        conn.query_row("SELECT value FROM config WHERE key = ?1", params![key], |row| {
            row.get(0)
        })
        .optional()
        .map_err(Self::classify)
    }

    pub fn set_config(&self, key: &str, value: &str) -> AppResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO config (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value, Utc::now().to_rfc3339()],
        )
        .map_err(Self::classify)?;
        Ok(())
    }

    /// Remove `logs` older than N days and `triggers` older than N days with
    /// `processed = true`; responses and task updates are never removed
    /// directly (§4.2, invariant 7).
    pub fn clean_old_records(&self, retention_days: u32) -> AppResult<()> {
        let cutoff = (Utc::now() - chrono::Duration::days(retention_days as i64)).to_rfc3339();
        let conn = self.lock()?;
        conn.execute("DELETE FROM logs WHERE timestamp < ?1", params![cutoff])
            .map_err(Self::classify)?;
        conn.execute(
            "DELETE FROM triggers WHERE timestamp < ?1 AND processed = 1",
            params![cutoff],
        )
        .map_err(Self::classify)?;
        Ok(())
    }

    pub fn get_stats(&self) -> AppResult<StoreStats> {
        let conn = self.lock()?;
        let triggers: i64 = conn
            .query_row("SELECT COUNT(*) FROM triggers", [], |r| r.get(0))
            .map_err(Self::classify)?;
        let responses: i64 = conn
            .query_row("SELECT COUNT(*) FROM responses", [], |r| r.get(0))
            .map_err(Self::classify)?;
        let task_updates: i64 = conn
            .query_row("SELECT COUNT(*) FROM task_updates", [], |r| r.get(0))
            .map_err(Self::classify)?;
        let unsynced_task_updates: i64 = conn
            .query_row("SELECT COUNT(*) FROM task_updates WHERE synced = 0", [], |r| {
                r.get(0)
            })
            .map_err(Self::classify)?;
        let logs: i64 = conn
            .query_row("SELECT COUNT(*) FROM logs", [], |r| r.get(0))
            .map_err(Self::classify)?;

        Ok(StoreStats {
            triggers,
            responses,
            task_updates,
            unsynced_task_updates,
            logs,
            db_path: self.path.display().to_string(),
        })
    }
}

fn parse_rfc3339(s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn store() -> (tempfile::TempDir, EventStore) {
        let dir = tempdir().unwrap();
        let store = EventStore::open(&dir.path().join("devtrack.db")).unwrap();
        (dir, store)
    }

    fn sample_trigger() -> NewTrigger {
        NewTrigger {
            trigger_type: TriggerType::Commit,
            timestamp: Utc::now(),
            source: "watcher".to_string(),
            repo_path: Some("/repo".to_string()),
            commit_hash: Some("a".repeat(40)),
            commit_message: Some("Fixed auth bug #123".to_string()),
            author: Some("alice".to_string()),
            data: serde_json::json!({"files_changed": ["src/auth.rs"]}),
        }
    }

    #[test]
    fn insert_and_fetch_trigger_round_trips() {
        let (_dir, store) = store();
        let id = store.insert_trigger(&sample_trigger()).unwrap();
        assert!(id > 0);

        let fetched = store.get_trigger_by_id(id).unwrap().unwrap();
        assert_eq!(fetched.commit_message.as_deref(), Some("Fixed auth bug #123"));
        assert!(!fetched.processed);
    }

    #[test]
    fn mark_trigger_processed_flips_flag() {
        let (_dir, store) = store();
        let id = store.insert_trigger(&sample_trigger()).unwrap();
        store.mark_trigger_processed(id).unwrap();
        let fetched = store.get_trigger_by_id(id).unwrap().unwrap();
        assert!(fetched.processed);
    }

    #[test]
    fn task_update_sync_is_idempotent_and_sets_synced_at() {
        let (_dir, store) = store();
        let trigger_id = store.insert_trigger(&sample_trigger()).unwrap();
        let response_id = store
            .insert_response(&NewResponse {
                trigger_id,
                timestamp: Utc::now(),
                project: Some("P".to_string()),
                ticket_id: Some("P-1".to_string()),
                description: Some("Fixed".to_string()),
                time_spent: Some("1h".to_string()),
                status: Some("in_progress".to_string()),
                raw_input: "raw".to_string(),
            })
            .unwrap();
        let update_id = store
            .insert_task_update(&NewTaskUpdate {
                response_id,
                timestamp: Utc::now(),
                project: Some("P".to_string()),
                ticket_id: Some("P-1".to_string()),
                update_text: Some("Fixed".to_string()),
                status: Some("in_progress".to_string()),
                synced: false,
                platform: "pending".to_string(),
                error: None,
            })
            .unwrap();

        assert_eq!(store.get_unsynced_task_updates().unwrap().len(), 1);

        let at = Utc::now();
        store.mark_task_update_synced(update_id, at).unwrap();
        assert!(store.get_unsynced_task_updates().unwrap().is_empty());

        // Second call is a no-op: synced_at must not move.
        store
            .mark_task_update_synced(update_id, at + chrono::Duration::seconds(5))
            .unwrap();
        let stats = store.get_stats().unwrap();
        assert_eq!(stats.unsynced_task_updates, 0);
    }

    #[test]
    fn clean_old_records_preserves_unprocessed_and_recent_rows() {
        let (_dir, store) = store();
        let mut old_trigger = sample_trigger();
        old_trigger.timestamp = Utc::now() - chrono::Duration::days(100);
        let old_id = store.insert_trigger(&old_trigger).unwrap();
        store.mark_trigger_processed(old_id).unwrap();

        let mut old_unprocessed = sample_trigger();
        old_unprocessed.timestamp = Utc::now() - chrono::Duration::days(100);
        let old_unprocessed_id = store.insert_trigger(&old_unprocessed).unwrap();

        let recent_id = store.insert_trigger(&sample_trigger()).unwrap();

        store.clean_old_records(90).unwrap();

        assert!(store.get_trigger_by_id(old_id).unwrap().is_none());
        assert!(store.get_trigger_by_id(old_unprocessed_id).unwrap().is_some());
        assert!(store.get_trigger_by_id(recent_id).unwrap().is_some());
    }

    #[test]
    fn config_kv_upserts() {
        let (_dir, store) = store();
        assert_eq!(store.get_config("k").unwrap(), None);
        store.set_config("k", "v1").unwrap();
        assert_eq!(store.get_config("k").unwrap().as_deref(), Some("v1"));
        store.set_config("k", "v2").unwrap();
        assert_eq!(store.get_config("k").unwrap().as_deref(), Some("v2"));
    }

    #[test]
    fn get_stats_reports_counts_and_path() {
        let (_dir, store) = store();
        store.insert_trigger(&sample_trigger()).unwrap();
        let stats = store.get_stats().unwrap();
        assert_eq!(stats.triggers, 1);
        assert!(stats.db_path.ends_with("devtrack.db"));
    }
}
