//! Wire envelope for the local IPC transport (§4.5, §6).
//!
//! Every message is one UTF-8 JSON object terminated by a single `\n`; no
//! length prefix, no embedded newline. `id` generation follows the same
//! `Uuid::new_v4` convention the protocol module elsewhere in this codebase
//! used for MCP message ids.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::error::{AppError, AppResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    CommitTrigger,
    TimerTrigger,
    StatusQuery,
    ConfigUpdate,
    Shutdown,
    Response,
    TaskUpdate,
    PromptRequest,
    Error,
    Ack,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub timestamp: DateTime<Utc>,
    pub id: String,
    #[serde(default)]
    pub data: JsonValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Envelope {
    pub fn new(message_type: MessageType, data: JsonValue) -> Self {
        Self {
            message_type,
            timestamp: Utc::now(),
            id: Uuid::new_v4().to_string(),
            data,
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            message_type: MessageType::Error,
            timestamp: Utc::now(),
            id: Uuid::new_v4().to_string(),
            data: JsonValue::Object(Default::default()),
            error: Some(message.into()),
        }
    }

    pub fn ack(referenced_id: impl Into<String>) -> Self {
        Self::new(MessageType::Ack, serde_json::json!({ "id": referenced_id.into() }))
    }

    pub fn shutdown() -> Self {
        Self::new(MessageType::Shutdown, JsonValue::Object(Default::default()))
    }

    /// `id` is the commit hash rather than a random uuid: re-publishing the
    /// same commit (e.g. after a restart) must always carry the same id
    /// (§8 invariant 1).
    pub fn commit_trigger(payload: &CommitTriggerPayload) -> AppResult<Self> {
        let mut envelope = Self::new(MessageType::CommitTrigger, serde_json::to_value(payload)?);
        envelope.id = payload.commit_hash.clone();
        Ok(envelope)
    }

    pub fn timer_trigger(payload: &TimerTriggerPayload) -> AppResult<Self> {
        Ok(Self::new(MessageType::TimerTrigger, serde_json::to_value(payload)?))
    }

    /// Serialize to one newline-terminated JSON line. Rejects payloads that
    /// would embed a literal newline, which the framing forbids.
    pub fn to_line(&self) -> AppResult<String> {
        let json = serde_json::to_string(self)?;
        if json.contains('\n') {
            return Err(AppError::malformed_message(
                "serialized envelope contains an embedded newline",
            ));
        }
        Ok(format!("{json}\n"))
    }

    pub fn from_line(line: &str) -> AppResult<Self> {
        let trimmed = line.trim_end_matches(['\n', '\r']);
        serde_json::from_str(trimmed)
            .map_err(|e| AppError::malformed_message(format!("invalid envelope: {e}")))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitTriggerPayload {
    pub repo_path: String,
    pub commit_hash: String,
    pub commit_message: String,
    pub author: String,
    pub timestamp: DateTime<Utc>,
    pub files_changed: Vec<String>,
    pub branch: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimerTriggerPayload {
    pub timestamp: DateTime<Utc>,
    pub interval_mins: u32,
    pub trigger_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskUpdatePayload {
    pub project: Option<String>,
    pub ticket_id: Option<String>,
    pub description: Option<String>,
    pub status: Option<String>,
    pub time_spent: Option<String>,
    #[serde(default)]
    pub synced: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_a_line() {
        let envelope = Envelope::new(MessageType::StatusQuery, JsonValue::Object(Default::default()));
        let line = envelope.to_line().unwrap();
        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);

        let parsed = Envelope::from_line(&line).unwrap();
        assert_eq!(parsed.id, envelope.id);
        assert_eq!(parsed.message_type, MessageType::StatusQuery);
    }

    #[test]
    fn from_line_rejects_garbage() {
        let err = Envelope::from_line("not json\n").unwrap_err();
        assert!(matches!(err, AppError::MalformedMessage { .. }));
    }

    #[test]
    fn error_envelope_carries_message_and_empty_data() {
        let envelope = Envelope::error("boom");
        assert_eq!(envelope.error.as_deref(), Some("boom"));
        assert_eq!(envelope.data, JsonValue::Object(Default::default()));
    }

    #[test]
    fn commit_trigger_payload_round_trips_through_data() {
        let payload = CommitTriggerPayload {
            repo_path: "/repo".to_string(),
            commit_hash: "a".repeat(40),
            commit_message: "Fixed auth bug #123".to_string(),
            author: "alice".to_string(),
            timestamp: Utc::now(),
            files_changed: vec!["src/auth.rs".to_string()],
            branch: Some("main".to_string()),
        };
        let envelope = Envelope::commit_trigger(&payload).unwrap();
        let line = envelope.to_line().unwrap();
        let parsed = Envelope::from_line(&line).unwrap();
        let round_tripped: CommitTriggerPayload = serde_json::from_value(parsed.data).unwrap();
        assert_eq!(round_tripped.commit_hash, payload.commit_hash);
    }
}
