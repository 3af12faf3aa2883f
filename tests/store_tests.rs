//! Integration tests for the event store schema: trigger/response/task-update
//! insertion, the processed flag, sync tracking, and retention cleanup.

use chrono::Utc;
use devtrackd::store::{EventStore, NewLog, NewResponse, NewTaskUpdate, NewTrigger, TriggerType};
use devtrackd::store::LogLevel;
use serde_json::json;
use tempfile::tempdir;

fn open_store() -> (tempfile::TempDir, EventStore) {
    let dir = tempdir().unwrap();
    let store = EventStore::open(&dir.path().join("devtrack.db")).unwrap();
    (dir, store)
}

#[test]
fn test_insert_and_fetch_trigger() {
    let (_dir, store) = open_store();

    let id = store
        .insert_trigger(&NewTrigger {
            trigger_type: TriggerType::Commit,
            timestamp: Utc::now(),
            source: "watcher".to_string(),
            repo_path: Some("/tmp/repo".to_string()),
            commit_hash: Some("abc123".to_string()),
            commit_message: Some("fix: bug".to_string()),
            author: Some("tester".to_string()),
            data: json!({"branch": "main"}),
        })
        .unwrap();

    let trigger = store.get_trigger_by_id(id).unwrap().unwrap();
    assert_eq!(trigger.trigger_type, TriggerType::Commit);
    assert!(!trigger.processed);

    store.mark_trigger_processed(id).unwrap();
    let trigger = store.get_trigger_by_id(id).unwrap().unwrap();
    assert!(trigger.processed);

    println!("✓ Trigger insert, fetch, and processed flag round-trip");
}

#[test]
fn test_response_and_task_update_chain() {
    let (_dir, store) = open_store();

    let trigger_id = store
        .insert_trigger(&NewTrigger {
            trigger_type: TriggerType::Timer,
            timestamp: Utc::now(),
            source: "scheduler".to_string(),
            repo_path: None,
            commit_hash: None,
            commit_message: None,
            author: None,
            data: json!({}),
        })
        .unwrap();

    let response_id = store
        .insert_response(&NewResponse {
            trigger_id,
            timestamp: Utc::now(),
            project: Some("PROJ".to_string()),
            ticket_id: Some("PROJ-1".to_string()),
            description: Some("worked on it".to_string()),
            time_spent: Some("30m".to_string()),
            status: Some("in-progress".to_string()),
            raw_input: "raw text".to_string(),
        })
        .unwrap();

    let update_id = store
        .insert_task_update(&NewTaskUpdate {
            response_id,
            timestamp: Utc::now(),
            project: Some("PROJ".to_string()),
            ticket_id: Some("PROJ-1".to_string()),
            update_text: Some("worked on it".to_string()),
            status: Some("in-progress".to_string()),
            synced: false,
            platform: "jira".to_string(),
            error: None,
        })
        .unwrap();

    let unsynced = store.get_unsynced_task_updates().unwrap();
    assert_eq!(unsynced.len(), 1);
    assert_eq!(unsynced[0].id, update_id);

    store.mark_task_update_synced(update_id, Utc::now()).unwrap();
    assert!(store.get_unsynced_task_updates().unwrap().is_empty());

    println!("✓ Trigger -> response -> task_update chain persists and syncs");
}

#[test]
fn test_stats_reflect_inserted_rows() {
    let (_dir, store) = open_store();

    store
        .insert_log(&NewLog {
            timestamp: Utc::now(),
            level: LogLevel::Info,
            component: "daemon".to_string(),
            message: "started".to_string(),
            data: None,
        })
        .unwrap();

    let stats = store.get_stats().unwrap();
    assert_eq!(stats.triggers, 0);
    assert_eq!(stats.logs, 1);

    println!("✓ Store stats reflect inserted rows");
}

#[test]
fn test_config_key_value_round_trips() {
    let (_dir, store) = open_store();

    assert_eq!(store.get_config("last_seen_commit").unwrap(), None);
    store.set_config("last_seen_commit", "abc123").unwrap();
    assert_eq!(store.get_config("last_seen_commit").unwrap(), Some("abc123".to_string()));

    println!("✓ Config key/value table round-trips");
}

#[test]
fn test_clean_old_records_is_a_noop_on_fresh_store() {
    let (_dir, store) = open_store();

    store.clean_old_records(90).unwrap();
    assert_eq!(store.get_stats().unwrap().triggers, 0);

    println!("✓ Retention sweep runs cleanly against an empty store");
}
