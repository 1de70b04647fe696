//! Direct dispatch trigger.

use axum::{Json, extract::State, extract::rejection::JsonRejection};
use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};

use cmdlink_commands::{DispatchRequest, command_id_of};

use super::ServerState;
use crate::models::{ApiResult, ErrorResponse};

#[derive(Debug, Clone, Serialize)]
pub struct DispatchResponse {
    pub success: bool,
    pub topic: String,
    pub timestamp: String,
}

/// `POST /dispatch` with body `{topic, payload}`.
///
/// A payload carrying a `command_id` is recorded in the dedup cache, so the
/// poll reconciler does not publish the same command again within the cooldown.
pub async fn dispatch_handler(
    State(state): State<ServerState>,
    body: Result<Json<DispatchRequest>, JsonRejection>,
) -> ApiResult<Json<DispatchResponse>> {
    let Json(request) = body.map_err(|e| {
        warn!(error = %e, "Rejected unparseable dispatch request");
        ErrorResponse::from(e)
    })?;

    let command_id = request.payload.as_ref().and_then(command_id_of);

    let receipt = state.dispatcher.dispatch(request).await.map_err(|e| {
        warn!(error = %e, "Dispatch request failed");
        ErrorResponse::from(e)
    })?;

    if let Some(id) = &command_id {
        state.dedup.record_dispatch(id, Utc::now());
    }
    info!(
        topic = %receipt.topic,
        command_id = command_id.as_deref().unwrap_or("-"),
        "Dispatched via HTTP trigger"
    );

    Ok(Json(DispatchResponse {
        success: true,
        topic: receipt.topic,
        timestamp: receipt.timestamp,
    }))
}
