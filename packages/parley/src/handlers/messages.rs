use axum::{
    Json,
    extract::{Path, State},
};
use parley_wire::MessageView;

use super::{ApiError, internal_error, owned_conversation};
use crate::AppState;
use crate::auth::CallerId;

/// Catch-up read for push-only clients after a reconnect.
pub async fn list_messages(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
    caller: CallerId,
) -> Result<Json<Vec<MessageView>>, ApiError> {
    owned_conversation(&state, &conversation_id, &caller).await?;

    let messages = state
        .repository
        .list_messages(&conversation_id)
        .await
        .map_err(|e| internal_error("Failed to list messages", e))?;

    Ok(Json(messages.iter().map(|m| m.to_view()).collect()))
}
