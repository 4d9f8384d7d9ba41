use axum::{
    extract::{State, WebSocketUpgrade},
    response::Response,
};
use futures::StreamExt;

use crate::AppState;

/// Multiplexed duplex connection: one socket for every conversation.
pub async fn websocket_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    let ctx = state.connection_context();
    ws.on_upgrade(move |socket| async move {
        let (sink, stream) = socket.split();
        crate::ws::serve_connection(sink, stream, ctx).await;
    })
}
