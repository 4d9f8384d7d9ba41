//! Outbound routing shared by the sync paths and HTTP hooks: new messages go
//! to both transports, generation requests go to the agent.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parley_wire::{Body, Envelope, MessageView, ResponseGenerationRequest};
use tracing::error;

use crate::metrics::ServerMetrics;
use crate::push::{PushBroadcaster, PushEvent};
use crate::ws::{AgentRoute, BroadcastRegistry};

/// Stanza id carried by frames shared across many connections.
pub const FANOUT_STANZA_ID: i32 = 0;

/// Receives authoritative messages once they are persisted.
#[async_trait]
pub trait MessagePublisher: Send + Sync {
    async fn publish_message(&self, message: MessageView);
}

pub struct Notifier {
    registry: Arc<BroadcastRegistry>,
    push: Arc<PushBroadcaster>,
    metrics: Arc<ServerMetrics>,
}

impl Notifier {
    pub fn new(
        registry: Arc<BroadcastRegistry>,
        push: Arc<PushBroadcaster>,
        metrics: Arc<ServerMetrics>,
    ) -> Self {
        Self {
            registry,
            push,
            metrics,
        }
    }

    /// Fire-and-forget: the outcome is returned for callers that report it,
    /// never retried.
    pub async fn route_generation(&self, request: ResponseGenerationRequest) -> AgentRoute {
        let envelope = Envelope::new(
            request.conversation_id.clone(),
            FANOUT_STANZA_ID,
            Body::ResponseGenerationRequest(request),
        );
        let route = self.registry.send_to_agent(&envelope).await;
        self.metrics.record_agent_route(route);
        route
    }
}

#[async_trait]
impl MessagePublisher for Notifier {
    async fn publish_message(&self, message: MessageView) {
        let conversation_id = message.conversation_id.clone();

        let envelope = Envelope::new(
            conversation_id.clone(),
            FANOUT_STANZA_ID,
            Body::Message(message.clone()),
        );
        match envelope.encode() {
            Ok(frame) => {
                let report = self
                    .registry
                    .broadcast(&conversation_id, Bytes::from(frame))
                    .await;
                self.metrics.record_fanout(&report);
            }
            Err(e) => error!(conversation_id = %conversation_id, "Failed to encode message broadcast: {}", e),
        }

        let report = self
            .push
            .broadcast(&conversation_id, PushEvent::Message { message })
            .await;
        self.metrics.record_push(&report);
    }
}
