pub mod events;
pub mod generation;
pub mod messages;
pub mod metrics;
pub mod sync;
pub mod websocket;

use axum::{Json, http::StatusCode};
use parley_wire::ErrorBody;
use tracing::error;

use crate::AppState;
use crate::auth::CallerId;
use crate::models::Conversation;
use crate::repository::ConversationStore;

// Re-export handlers for route registration
pub use events::conversation_events;
pub use generation::request_generation;
pub use messages::list_messages;
pub use metrics::metrics_handler;
pub use sync::{sync_messages, sync_status};
pub use websocket::websocket_handler;

/// Error response shared by the JSON endpoints.
pub type ApiError = (StatusCode, Json<ErrorBody>);

pub(crate) fn api_error(status: StatusCode, code: &str, message: impl Into<String>) -> ApiError {
    (status, Json(ErrorBody::new(code, message)))
}

pub(crate) fn internal_error(context: &str, err: anyhow::Error) -> ApiError {
    error!("{}: {:#}", context, err);
    api_error(
        StatusCode::INTERNAL_SERVER_ERROR,
        "internal_error",
        context.to_string(),
    )
}

/// The conversation, if the caller owns it. Missing and foreign look the same.
pub(crate) async fn owned_conversation(
    state: &AppState,
    conversation_id: &str,
    caller: &CallerId,
) -> Result<Conversation, ApiError> {
    state
        .repository
        .get_by_id_and_user_id(conversation_id, caller.as_str())
        .await
        .map_err(|e| internal_error("Failed to load conversation", e))?
        .ok_or_else(|| {
            api_error(
                StatusCode::NOT_FOUND,
                "not_found",
                "Conversation not found",
            )
        })
}

pub(crate) fn require_active(conversation: &Conversation) -> Result<(), ApiError> {
    if conversation.is_active() {
        Ok(())
    } else {
        Err(api_error(
            StatusCode::BAD_REQUEST,
            "conversation_inactive",
            "Conversation is not active",
        ))
    }
}
