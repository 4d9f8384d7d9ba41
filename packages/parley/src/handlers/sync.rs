use axum::{
    Json,
    extract::{Path, State},
};
use parley_wire::{SyncRequest, SyncResponse};
use serde::Serialize;

use super::{ApiError, internal_error, owned_conversation, require_active};
use crate::AppState;
use crate::auth::CallerId;
use crate::models::rfc3339;
use crate::repository::MessageStore;

/// HTTP twin of the duplex `sync_request`: same reconciler, same fan-out.
pub async fn sync_messages(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
    caller: CallerId,
    Json(req): Json<SyncRequest>,
) -> Result<Json<SyncResponse>, ApiError> {
    let conversation = owned_conversation(&state, &conversation_id, &caller).await?;
    require_active(&conversation)?;

    let response = state
        .reconciler
        .reconcile_batch(&conversation_id, &req.messages)
        .await;
    Ok(Json(response))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatusResponse {
    pub conversation_id: String,
    pub pending_count: i64,
    pub synced_count: i64,
    pub conflict_count: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_synced_at: Option<String>,
}

pub async fn sync_status(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
    caller: CallerId,
) -> Result<Json<SyncStatusResponse>, ApiError> {
    owned_conversation(&state, &conversation_id, &caller).await?;

    let counts = state
        .repository
        .sync_counts(&conversation_id)
        .await
        .map_err(|e| internal_error("Failed to get sync status", e))?;

    Ok(Json(SyncStatusResponse {
        conversation_id,
        pending_count: counts.pending,
        synced_count: counts.synced,
        conflict_count: counts.conflict,
        last_synced_at: counts.last_synced_at.as_ref().map(rfc3339),
    }))
}
