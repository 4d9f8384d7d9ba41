use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use chrono::Utc;
use parley_wire::{GenerationKind, ResponseGenerationRequest};
use serde::{Deserialize, Serialize};

use super::{ApiError, api_error, owned_conversation, require_active};
use crate::AppState;
use crate::auth::CallerId;
use crate::ws::AgentRoute;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateRequest {
    pub message_id: String,
    pub request_type: GenerationKind,
    #[serde(default)]
    pub previous_id: Option<String>,
    #[serde(default)]
    pub new_content: Option<String>,
    #[serde(default)]
    pub enable_tools: bool,
    #[serde(default)]
    pub enable_reasoning: bool,
    #[serde(default)]
    pub enable_streaming: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateResponse {
    pub request_id: String,
    pub route: AgentRoute,
}

/// Hand a generation request to the agent. Accepted even with no agent
/// connected; the outcome is reported, not retried.
pub async fn request_generation(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
    caller: CallerId,
    Json(req): Json<GenerateRequest>,
) -> Result<(StatusCode, Json<GenerateResponse>), ApiError> {
    let conversation = owned_conversation(&state, &conversation_id, &caller).await?;
    require_active(&conversation)?;

    if req.message_id.trim().is_empty() {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "invalid_request",
            "messageId is required",
        ));
    }
    if req.request_type == GenerationKind::Edit && req.new_content.is_none() {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "invalid_request",
            "newContent is required for edit",
        ));
    }

    let request_id = state.ids.generate_request_id();
    let route = state
        .notifier
        .route_generation(ResponseGenerationRequest {
            id: request_id.clone(),
            message_id: req.message_id,
            conversation_id,
            request_type: req.request_type,
            previous_id: req.previous_id,
            new_content: req.new_content,
            enable_tools: req.enable_tools,
            enable_reasoning: req.enable_reasoning,
            enable_streaming: req.enable_streaming,
            timestamp: Utc::now().timestamp_millis(),
        })
        .await;

    Ok((
        StatusCode::ACCEPTED,
        Json(GenerateResponse { request_id, route }),
    ))
}
