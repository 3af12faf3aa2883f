//! Integrated monitor (§4.6): fans commit and timer events into a single
//! persist-then-publish pipeline, and persists inbound `task_update`/`error`
//! messages from the IPC client side.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{error, warn};

use crate::error::AppResult;
use crate::git::CommitInfo;
use crate::ipc::{
    CommitTriggerPayload, Envelope, IpcServer, MessageHandler, MessageType, TaskUpdatePayload, TimerTriggerPayload,
};
use crate::scheduler::{TimerTriggerData, TriggerHandler};
use crate::store::{EventStore, LogLevel, NewLog, NewResponse, NewTaskUpdate, NewTrigger, TriggerType};

pub struct Monitor {
    store: Arc<EventStore>,
    server: Arc<IpcServer>,
    /// Maps a `task_update` envelope's client-assigned id to the store row
    /// it produced, so a later `ack` referencing that same id can flip
    /// `synced` (§4.6, §8 S5). The client has no other way to learn the
    /// store's row id.
    pending_acks: AsyncMutex<HashMap<String, i64>>,
}

impl Monitor {
    pub fn new(store: Arc<EventStore>, server: Arc<IpcServer>) -> Arc<Self> {
        Arc::new(Self {
            store,
            server,
            pending_acks: AsyncMutex::new(HashMap::new()),
        })
    }

    /// Persist then publish a commit trigger (§4.6 steps 1-2). A store
    /// failure is logged but publication still happens; a publish failure
    /// is logged and the stored row remains for reprocessing (§4.6 step 3).
    pub async fn handle_commit(&self, repo_path: &Path, branch: Option<String>, commit: CommitInfo) {
        let trigger = NewTrigger {
            trigger_type: TriggerType::Commit,
            timestamp: commit.timestamp,
            source: "watcher".to_string(),
            repo_path: Some(repo_path.display().to_string()),
            commit_hash: Some(commit.hash.clone()),
            commit_message: Some(commit.message.clone()),
            author: Some(commit.author.clone()),
            data: serde_json::json!({
                "author_email": commit.author_email,
                "files_changed": commit.files,
                "branch": branch,
            }),
        };

        if let Err(e) = self.store.insert_trigger(&trigger) {
            error!("failed to persist commit trigger {}: {e}", commit.hash);
        }

        let payload = CommitTriggerPayload {
            repo_path: repo_path.display().to_string(),
            commit_hash: commit.hash.clone(),
            commit_message: commit.message,
            author: commit.author,
            timestamp: commit.timestamp,
            files_changed: commit.files,
            branch,
        };
        match Envelope::commit_trigger(&payload) {
            Ok(envelope) => {
                if let Err(e) = self.server.send_message(&envelope).await {
                    error!("failed to publish commit trigger {}: {e}", commit.hash);
                }
            }
            Err(e) => error!("failed to encode commit trigger {}: {e}", commit.hash),
        }
    }
}

#[async_trait]
impl TriggerHandler for Monitor {
    /// Persist then publish a timer trigger (§4.6 steps 1-2).
    async fn on_trigger(&self, data: TimerTriggerData) -> AppResult<()> {
        let now = Utc::now();
        let trigger = NewTrigger {
            trigger_type: TriggerType::Timer,
            timestamp: now,
            source: "scheduler".to_string(),
            repo_path: None,
            commit_hash: None,
            commit_message: None,
            author: None,
            data: serde_json::json!({
                "interval_mins": data.interval_minutes,
                "trigger_count": data.trigger_count,
            }),
        };

        if let Err(e) = self.store.insert_trigger(&trigger) {
            error!("failed to persist timer trigger: {e}");
        }

        let payload = TimerTriggerPayload {
            timestamp: now,
            interval_mins: data.interval_minutes,
            trigger_count: data.trigger_count,
        };
        match Envelope::timer_trigger(&payload) {
            Ok(envelope) => {
                if let Err(e) = self.server.send_message(&envelope).await {
                    error!("failed to publish timer trigger: {e}");
                }
            }
            Err(e) => error!("failed to encode timer trigger: {e}"),
        }

        Ok(())
    }
}

impl Monitor {
    /// Persist an inbound `task_update` with `synced = false` and
    /// `platform = "pending"` (§4.6, §8 S5).
    ///
    /// The schema requires a `responses` row as parent; a `task_update`
    /// implicitly records the user's response to whichever trigger is most
    /// recent, recording it as a `Response` and flipping that trigger's
    /// `processed` flag before inserting the `TaskUpdate` beneath it.
    async fn handle_task_update(&self, envelope: Envelope) -> AppResult<()> {
        let payload: TaskUpdatePayload = serde_json::from_value(envelope.data)?;

        let trigger = match self.store.get_recent_triggers(1)?.into_iter().next() {
            Some(trigger) => trigger,
            None => {
                warn!("task_update received with no prior trigger to attach to; discarding");
                return Ok(());
            }
        };
        self.store.mark_trigger_processed(trigger.id)?;

        let raw_input = serde_json::to_string(&payload).unwrap_or_default();
        let response_id = self.store.insert_response(&NewResponse {
            trigger_id: trigger.id,
            timestamp: envelope.timestamp,
            project: payload.project.clone(),
            ticket_id: payload.ticket_id.clone(),
            description: payload.description.clone(),
            time_spent: payload.time_spent,
            status: payload.status.clone(),
            raw_input,
        })?;

        let task_update_id = self.store.insert_task_update(&NewTaskUpdate {
            response_id,
            timestamp: envelope.timestamp,
            project: payload.project,
            ticket_id: payload.ticket_id,
            update_text: payload.description,
            status: payload.status,
            synced: false,
            platform: "pending".to_string(),
            error: None,
        })?;

        self.pending_acks.lock().await.insert(envelope.id, task_update_id);
        Ok(())
    }

    /// Flips the `task_updates` row recorded for the referenced `task_update`
    /// envelope id to synced (§8 S5).
    async fn handle_ack(&self, envelope: Envelope) -> AppResult<()> {
        let referenced_id = match envelope.data.get("id").and_then(|v| v.as_str()) {
            Some(id) => id.to_string(),
            None => {
                warn!("ack message missing referenced id; discarding");
                return Ok(());
            }
        };

        let task_update_id = self.pending_acks.lock().await.remove(&referenced_id);
        match task_update_id {
            Some(id) => self.store.mark_task_update_synced(id, Utc::now()),
            None => {
                warn!("ack referenced unknown id {referenced_id}; discarding");
                Ok(())
            }
        }
    }

    /// Persists an inbound `error` message as an error-level log record
    /// (§4.6).
    async fn handle_error(&self, envelope: Envelope) -> AppResult<()> {
        self.store.insert_log(&NewLog {
            timestamp: envelope.timestamp,
            level: LogLevel::Error,
            component: "ipc-peer".to_string(),
            message: envelope.error.unwrap_or_else(|| "peer reported an error".to_string()),
            data: Some(envelope.data),
        })
    }
}

#[async_trait]
impl MessageHandler for Monitor {
    async fn handle(&self, envelope: Envelope) -> AppResult<()> {
        match envelope.message_type {
            MessageType::TaskUpdate => self.handle_task_update(envelope).await,
            MessageType::Ack => self.handle_ack(envelope).await,
            MessageType::Error => self.handle_error(envelope).await,
            other => {
                warn!(message_type = ?other, "monitor has no behavior for this message type; discarding");
                Ok(())
            }
        }
    }
}
