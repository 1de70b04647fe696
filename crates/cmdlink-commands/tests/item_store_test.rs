//! Item store client tests against a local stub server.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, patch};
use axum::{Json, Router};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::net::TcpListener;

use cmdlink_commands::{
    CommandReportSink, CommandStatus, CommandUpdate, ItemStoreClient, PendingCommandSource,
    StoreError,
};
use cmdlink_core::StoreConfig;

const TOKEN: &str = "store-token";

#[derive(Default)]
struct Recorded {
    queries: Vec<HashMap<String, String>>,
    patches: Vec<(String, Value)>,
}

type Shared = Arc<Mutex<Recorded>>;

fn authorized(headers: &HeaderMap) -> bool {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == format!("Bearer {TOKEN}"))
}

async fn list_items(
    State(state): State<Shared>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Result<Json<Value>, StatusCode> {
    if !authorized(&headers) {
        return Err(StatusCode::UNAUTHORIZED);
    }
    state.lock().queries.push(query);
    Ok(Json(json!({
        "data": [
            {
                "id": 1,
                "type": "reboot",
                "status": "pending",
                "params": {},
                "date_created": "2024-05-01T10:00:00Z",
                "device": {"id": 3, "mac_address": "AA:BB:CC", "name": "Pump"}
            },
            {"id": 2, "type": "reboot", "status": "pending", "device": null},
            {"type": "broken"}
        ]
    })))
}

async fn patch_item(
    State(state): State<Shared>,
    headers: HeaderMap,
    Path((_collection, id)): Path<(String, String)>,
    Json(body): Json<Value>,
) -> StatusCode {
    if !authorized(&headers) {
        return StatusCode::UNAUTHORIZED;
    }
    if id == "missing" {
        return StatusCode::NOT_FOUND;
    }
    state.lock().patches.push((id, body));
    StatusCode::OK
}

async fn start_stub() -> (String, Shared) {
    let state = Shared::default();
    let app = Router::new()
        .route("/items/:collection", get(list_items))
        .route("/items/:collection/:id", patch(patch_item))
        .with_state(state.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}"), state)
}

fn client(base_url: &str, token: &str) -> ItemStoreClient {
    ItemStoreClient::new(&StoreConfig {
        base_url: base_url.to_string(),
        token: token.to_string(),
        collection: "commands".to_string(),
        timeout: Duration::from_secs(5),
    })
    .unwrap()
}

#[tokio::test]
async fn test_fetch_pending_query_and_parsing() {
    let (base, state) = start_stub().await;
    let commands = client(&base, TOKEN).fetch_pending(25).await.unwrap();

    assert_eq!(commands.len(), 2);
    assert_eq!(commands[0].id, "1");
    assert_eq!(commands[0].device_address(), Some("AA:BB:CC"));
    assert_eq!(commands[1].id, "2");
    assert!(commands[1].device_address().is_none());

    let query = state.lock().queries[0].clone();
    assert_eq!(query["filter[status][_eq]"], "pending");
    assert_eq!(query["sort"], "date_created");
    assert_eq!(query["limit"], "25");
    assert_eq!(query["fields"], "*,device.*");
}

#[tokio::test]
async fn test_patch_bodies() {
    let (base, state) = start_stub().await;
    let client = client(&base, TOKEN);

    client.mark_unroutable("2", "no device").await.unwrap();
    let at = "2024-05-01T12:00:00Z".parse().unwrap();
    client
        .apply_report(
            "1",
            &CommandUpdate::report(CommandStatus::Completed, Some(json!({"ok": true})), None, at),
        )
        .await
        .unwrap();

    let patches = state.lock().patches.clone();
    assert_eq!(
        patches[0],
        ("2".to_string(), json!({"status": "failed", "error_message": "no device"}))
    );
    assert_eq!(
        patches[1],
        (
            "1".to_string(),
            json!({
                "status": "completed",
                "result": {"ok": true},
                "error_message": null,
                "executed_at": "2024-05-01T12:00:00Z"
            })
        )
    );
}

#[tokio::test]
async fn test_error_mapping() {
    let (base, _state) = start_stub().await;

    let err = client(&base, "wrong").fetch_pending(5).await.unwrap_err();
    assert!(matches!(err, StoreError::Unauthorized));

    let err = client(&base, TOKEN)
        .mark_unroutable("missing", "x")
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::NotFound(id) if id == "missing"));
}
