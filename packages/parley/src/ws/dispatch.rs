//! Inbound envelope dispatcher.
//!
//! Every decoded frame is handled here: subscription control, sync requests,
//! and routing of application envelopes the server does not interpret.
//! Replies go straight to the sending connection with its next stanza id.

use std::sync::Arc;

use bytes::Bytes;
use parley_wire::{
    Body, CodecError, Envelope, ErrorBody, SubscribeAck, SubscribeRequest, SyncRequest,
    UnsubscribeAck, UnsubscribeRequest, error_codes, tags,
};
use tracing::{debug, error, warn};

use crate::config::WebSocketConfig;
use crate::metrics::ServerMetrics;
use crate::reconciler::SyncReconciler;
use crate::repository::ConversationStore;

use super::connection::Connection;
use super::registry::BroadcastRegistry;
use super::sink::SinkError;

/// Shared services handed to every duplex connection.
#[derive(Clone)]
pub struct ConnectionContext {
    pub registry: Arc<BroadcastRegistry>,
    pub reconciler: Arc<SyncReconciler>,
    pub conversations: Arc<dyn ConversationStore>,
    pub metrics: Arc<ServerMetrics>,
    pub config: WebSocketConfig,
}

/// Handle one binary frame. An `Err` means a reply could not be written and
/// the connection should be torn down.
pub(crate) async fn dispatch_frame(
    conn: &Arc<Connection>,
    frame: Bytes,
    ctx: &ConnectionContext,
) -> Result<(), SinkError> {
    ctx.metrics.envelope_received();

    let envelope = match Envelope::decode_with_limit(&frame, ctx.config.max_envelope_bytes) {
        Ok(envelope) => envelope,
        Err(e) => {
            ctx.metrics.decode_error();
            debug!(conn_id = %conn.id, "Rejected inbound envelope: {}", e);
            return reject_undecodable(conn, e, ctx).await;
        }
    };

    let Envelope {
        conversation_id,
        body,
        ..
    } = envelope;

    match body {
        Body::Subscribe(req) => handle_subscribe(conn, &conversation_id, req, ctx).await,
        Body::Unsubscribe(req) => handle_unsubscribe(conn, &conversation_id, req, ctx).await,
        Body::SyncRequest(req) => handle_sync(conn, &conversation_id, req, ctx).await,
        other => {
            route_passthrough(conn, &conversation_id, other.type_tag(), frame, ctx).await;
            Ok(())
        }
    }
}

async fn reject_undecodable(
    conn: &Connection,
    err: CodecError,
    ctx: &ConnectionContext,
) -> Result<(), SinkError> {
    let CodecError::InvalidBody {
        kind,
        conversation_id,
        ..
    } = err
    else {
        return send_error(conn, "", error_codes::INVALID_MESSAGE, "Failed to decode message", ctx)
            .await;
    };

    match kind.as_str() {
        tags::SUBSCRIBE => {
            let ack = SubscribeAck {
                conversation_id: conversation_id.clone(),
                success: false,
                error: Some("Invalid subscribe request".to_string()),
            };
            reply(conn, &conversation_id, Body::SubscribeAck(ack), ctx).await
        }
        tags::UNSUBSCRIBE => {
            let ack = UnsubscribeAck {
                conversation_id: conversation_id.clone(),
                success: false,
            };
            reply(conn, &conversation_id, Body::UnsubscribeAck(ack), ctx).await
        }
        tags::SYNC_REQUEST if !conn.state.is_subscribed(&conversation_id).await => {
            send_error(
                conn,
                &conversation_id,
                error_codes::NOT_SUBSCRIBED,
                "Not subscribed to conversation",
                ctx,
            )
            .await
        }
        tags::SYNC_REQUEST => {
            send_error(
                conn,
                &conversation_id,
                error_codes::INVALID_MESSAGE,
                "Invalid sync request",
                ctx,
            )
            .await
        }
        _ => {
            send_error(
                conn,
                &conversation_id,
                error_codes::INVALID_MESSAGE,
                "Failed to decode message",
                ctx,
            )
            .await
        }
    }
}

async fn handle_subscribe(
    conn: &Arc<Connection>,
    envelope_conversation: &str,
    req: SubscribeRequest,
    ctx: &ConnectionContext,
) -> Result<(), SinkError> {
    if req.agent_mode {
        ctx.registry.subscribe_agent(conn).await;
        let ack = SubscribeAck {
            conversation_id: String::new(),
            success: true,
            error: None,
        };
        return reply(conn, "", Body::SubscribeAck(ack), ctx).await;
    }

    let conversation_id = resolve_conversation(req.conversation_id, envelope_conversation);
    if conversation_id.is_empty() {
        let ack = SubscribeAck {
            conversation_id,
            success: false,
            error: Some("Conversation ID required".to_string()),
        };
        return reply(conn, "", Body::SubscribeAck(ack), ctx).await;
    }

    ctx.registry.subscribe(&conversation_id, conn).await;
    debug!(conn_id = %conn.id, conversation_id = %conversation_id, "Subscribed");
    let ack = SubscribeAck {
        conversation_id: conversation_id.clone(),
        success: true,
        error: None,
    };
    reply(conn, &conversation_id, Body::SubscribeAck(ack), ctx).await
}

async fn handle_unsubscribe(
    conn: &Arc<Connection>,
    envelope_conversation: &str,
    req: UnsubscribeRequest,
    ctx: &ConnectionContext,
) -> Result<(), SinkError> {
    let conversation_id = resolve_conversation(req.conversation_id, envelope_conversation);
    let success = !conversation_id.is_empty();
    if success {
        ctx.registry.unsubscribe(&conversation_id, conn).await;
        debug!(conn_id = %conn.id, conversation_id = %conversation_id, "Unsubscribed");
    }
    let ack = UnsubscribeAck {
        conversation_id: conversation_id.clone(),
        success,
    };
    reply(conn, &conversation_id, Body::UnsubscribeAck(ack), ctx).await
}

async fn handle_sync(
    conn: &Arc<Connection>,
    conversation_id: &str,
    req: SyncRequest,
    ctx: &ConnectionContext,
) -> Result<(), SinkError> {
    if !conn.state.is_subscribed(conversation_id).await {
        return send_error(
            conn,
            conversation_id,
            error_codes::NOT_SUBSCRIBED,
            "Not subscribed to conversation",
            ctx,
        )
        .await;
    }

    match ctx.conversations.get_by_id(conversation_id).await {
        Ok(Some(conversation)) if conversation.is_active() => {}
        Ok(Some(_)) => {
            return send_error(
                conn,
                conversation_id,
                error_codes::CONVERSATION_INACTIVE,
                "Conversation is not active",
                ctx,
            )
            .await;
        }
        Ok(None) => {
            return send_error(
                conn,
                conversation_id,
                error_codes::CONVERSATION_NOT_FOUND,
                "Conversation not found",
                ctx,
            )
            .await;
        }
        Err(e) => {
            error!(conn_id = %conn.id, conversation_id, "Failed to load conversation: {:#}", e);
            return send_error(
                conn,
                conversation_id,
                error_codes::INTERNAL_ERROR,
                "Failed to load conversation",
                ctx,
            )
            .await;
        }
    }

    let response = ctx
        .reconciler
        .reconcile_batch(conversation_id, &req.messages)
        .await;
    reply(conn, conversation_id, Body::SyncResponse(response), ctx).await
}

async fn route_passthrough(
    conn: &Connection,
    conversation_id: &str,
    kind: &str,
    frame: Bytes,
    ctx: &ConnectionContext,
) {
    if conversation_id.is_empty() {
        debug!(conn_id = %conn.id, kind, "Dropping envelope without conversation");
        return;
    }

    let report = if conn.state.is_agent() {
        ctx.registry
            .broadcast_excluding(conversation_id, frame, conn.id)
            .await
    } else if conn.state.is_subscribed(conversation_id).await {
        ctx.registry.broadcast(conversation_id, frame).await
    } else {
        debug!(
            conn_id = %conn.id,
            conversation_id,
            kind,
            "Dropping envelope for unsubscribed conversation"
        );
        return;
    };
    ctx.metrics.record_fanout(&report);
}

/// The body's id wins; the envelope's is the fallback.
fn resolve_conversation(from_body: String, from_envelope: &str) -> String {
    if from_body.is_empty() {
        from_envelope.to_string()
    } else {
        from_body
    }
}

async fn send_error(
    conn: &Connection,
    conversation_id: &str,
    code: &str,
    message: &str,
    ctx: &ConnectionContext,
) -> Result<(), SinkError> {
    reply(
        conn,
        conversation_id,
        Body::Error(ErrorBody::new(code, message)),
        ctx,
    )
    .await
}

async fn reply(
    conn: &Connection,
    conversation_id: &str,
    body: Body,
    ctx: &ConnectionContext,
) -> Result<(), SinkError> {
    let envelope = Envelope::new(conversation_id, conn.state.next_stanza_id(), body);
    let frame = match envelope.encode() {
        Ok(bytes) => Bytes::from(bytes),
        Err(e) => {
            error!(conn_id = %conn.id, "Failed to encode {}: {}", envelope.type_tag(), e);
            return Ok(());
        }
    };

    match tokio::time::timeout(ctx.config.write_timeout, conn.sink.send_frame(frame)).await {
        Ok(result) => result,
        Err(_) => {
            warn!(conn_id = %conn.id, "Reply write timed out");
            Err(SinkError::Timeout)
        }
    }
}
