use std::convert::Infallible;

use axum::{
    extract::{Path, State},
    response::sse::{Event, KeepAlive, Sse},
};
use futures::Stream;
use tokio_stream::StreamExt;
use tracing::{debug, warn};

use super::{ApiError, owned_conversation, require_active};
use crate::AppState;
use crate::auth::CallerId;
use crate::push::PushEvent;

/// Server-push stream for one conversation.
///
/// Starts with a `connected` event, then one `message` event per synced
/// message. Events a slow client could not take are dropped; clients catch up
/// through `/messages` or a sync on reconnect.
pub async fn conversation_events(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
    caller: CallerId,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let conversation = owned_conversation(&state, &conversation_id, &caller).await?;
    require_active(&conversation)?;

    let subscription = state.push.subscribe(&conversation_id).await;
    debug!(
        conn_id = %subscription.id(),
        conversation_id = %conversation_id,
        "Push stream opened"
    );

    let connected = PushEvent::Connected { conversation_id };
    let events = tokio_stream::once(connected)
        .chain(subscription)
        .filter_map(|event| match Event::default().json_data(&event) {
            Ok(event) => Some(Ok::<_, Infallible>(event)),
            Err(e) => {
                warn!("Failed to serialize push event: {}", e);
                None
            }
        });

    Ok(Sse::new(events).keep_alive(KeepAlive::new().interval(state.server_config.push.keepalive)))
}
