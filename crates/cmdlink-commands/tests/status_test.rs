//! Status consumer tests through the transport subscription path.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::json;

use cmdlink_commands::{Command, CommandStatus, MemoryCommandStore, StatusConsumer};
use cmdlink_core::STATUS_TOPIC_PATTERN;
use cmdlink_transport::{MemoryTransport, Transport};

fn executed_at() -> DateTime<Utc> {
    "2024-05-01T12:00:00Z".parse().unwrap()
}

async fn setup(commands: Vec<Command>) -> (Arc<MemoryCommandStore>, MemoryTransport) {
    let store = Arc::new(MemoryCommandStore::with_commands(commands));
    let consumer = StatusConsumer::new(store.clone()).with_clock(Arc::new(executed_at));

    let transport = MemoryTransport::new();
    transport
        .subscribe(STATUS_TOPIC_PATTERN, Arc::new(consumer))
        .await
        .unwrap();
    (store, transport)
}

#[tokio::test]
async fn test_completed_report_updates_record() {
    let (store, transport) = setup(vec![Command::pending("C2", "open_valve")]).await;

    let report = json!({"command_id": "C2", "status": "completed", "result": {"ok": true}});
    transport
        .deliver("device/AA:BB:CC/status", report.to_string())
        .await;

    let record = store.get("C2").unwrap();
    assert_eq!(record.status, CommandStatus::Completed);
    assert_eq!(record.result, Some(json!({"ok": true})));
    assert_eq!(record.error_message, None);
    assert_eq!(record.executed_at, Some(executed_at()));
}

#[tokio::test]
async fn test_replayed_report_is_idempotent() {
    let (store, transport) = setup(vec![Command::pending("C2", "open_valve")]).await;
    let report = json!({"command_id": "C2", "status": "failed", "error_message": "timeout"});

    transport
        .deliver("device/AA/status", report.to_string())
        .await;
    let once = store.get("C2").unwrap();

    transport
        .deliver("device/AA/status", report.to_string())
        .await;
    let twice = store.get("C2").unwrap();

    assert_eq!(once, twice);
    assert_eq!(store.mutations_for("C2").len(), 2);
}

#[tokio::test]
async fn test_processing_then_completed_overwrites_fields() {
    let (store, transport) = setup(vec![Command::pending("C7", "x")]).await;

    transport
        .deliver(
            "device/AA/status",
            json!({"command_id": "C7", "status": "processing", "error_message": "warming up"})
                .to_string(),
        )
        .await;
    transport
        .deliver(
            "device/AA/status",
            json!({"command_id": "C7", "status": "completed"}).to_string(),
        )
        .await;

    let record = store.get("C7").unwrap();
    assert_eq!(record.status, CommandStatus::Completed);
    assert_eq!(record.error_message, None);
    assert_eq!(record.result, None);
}

#[tokio::test]
async fn test_invalid_reports_do_not_mutate() {
    let (store, transport) = setup(vec![Command::pending("C2", "x")]).await;

    for payload in [
        "{not json".to_string(),
        json!({"status": "completed"}).to_string(),
        json!({"command_id": "C2", "status": "exploded"}).to_string(),
        json!([1, 2, 3]).to_string(),
    ] {
        assert_eq!(transport.deliver("device/AA/status", payload).await, 1);
    }

    assert!(store.mutations().is_empty());
    assert_eq!(store.get("C2").unwrap().status, CommandStatus::Pending);
}

#[tokio::test]
async fn test_command_topics_are_not_consumed() {
    let (store, transport) = setup(vec![Command::pending("C2", "x")]).await;

    let delivered = transport
        .deliver(
            "device/AA/commands",
            json!({"command_id": "C2", "status": "completed"}).to_string(),
        )
        .await;

    assert_eq!(delivered, 0);
    assert!(store.mutations().is_empty());
}
