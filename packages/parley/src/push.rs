//! Push-only transport: per-subscriber bounded queues feeding SSE streams.
//!
//! Delivery is `try_send`: a full queue drops the event for that subscriber,
//! a closed queue unsubscribes it. Clients catch up through sync on reconnect.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::Stream;
use parley_wire::MessageView;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::debug;

use crate::fanout::{Delivery, FanoutReport, Subscriber, SubscriberTable};
use crate::metrics::ServerMetrics;
use crate::ws::ConnectionId;

/// JSON payload of one SSE event.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PushEvent {
    Connected {
        #[serde(rename = "conversationId")]
        conversation_id: String,
    },
    Message {
        message: MessageView,
    },
}

#[derive(Clone)]
struct PushHandle {
    id: ConnectionId,
    tx: mpsc::Sender<PushEvent>,
}

#[async_trait]
impl Subscriber for PushHandle {
    fn subscriber_id(&self) -> ConnectionId {
        self.id
    }
}

pub struct PushBroadcaster {
    table: SubscriberTable<PushHandle>,
    capacity: usize,
    metrics: Arc<ServerMetrics>,
}

impl PushBroadcaster {
    pub fn new(capacity: usize, metrics: Arc<ServerMetrics>) -> Self {
        Self {
            table: SubscriberTable::new(),
            capacity: capacity.max(1),
            metrics,
        }
    }

    pub async fn subscribe(self: &Arc<Self>, conversation_id: &str) -> PushSubscription {
        let (tx, rx) = mpsc::channel(self.capacity);
        let id = ConnectionId::next();
        self.table
            .insert(conversation_id, PushHandle { id, tx })
            .await;
        self.metrics.push_stream_opened();
        debug!(conn_id = %id, conversation_id, "Push subscriber added");

        PushSubscription {
            id,
            conversation_id: conversation_id.to_string(),
            rx,
            broadcaster: self.clone(),
        }
    }

    pub async fn unsubscribe(&self, conversation_id: &str, id: ConnectionId) -> bool {
        self.table.remove(conversation_id, id).await
    }

    pub async fn broadcast(&self, conversation_id: &str, event: PushEvent) -> FanoutReport {
        self.table
            .fan_out(conversation_id, None, |handle: PushHandle| {
                let outcome = match handle.tx.try_send(event.clone()) {
                    Ok(()) => Delivery::Delivered,
                    Err(TrySendError::Full(_)) => {
                        debug!(conn_id = %handle.id, conversation_id, "Push queue full, dropping event");
                        Delivery::Dropped
                    }
                    Err(TrySendError::Closed(_)) => Delivery::Gone,
                };
                async move { outcome }
            })
            .await
    }

    pub async fn subscriber_count(&self, conversation_id: &str) -> usize {
        self.table.subscriber_count(conversation_id).await
    }
}

/// A live push stream. Dropping it removes the subscriber.
pub struct PushSubscription {
    id: ConnectionId,
    conversation_id: String,
    rx: mpsc::Receiver<PushEvent>,
    broadcaster: Arc<PushBroadcaster>,
}

impl PushSubscription {
    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

impl Stream for PushSubscription {
    type Item = PushEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<PushEvent>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for PushSubscription {
    fn drop(&mut self) {
        self.broadcaster.metrics.push_stream_closed();
        // Without a runtime the closed queue is reaped on the next broadcast.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let broadcaster = self.broadcaster.clone();
            let conversation_id = std::mem::take(&mut self.conversation_id);
            let id = self.id;
            handle.spawn(async move {
                broadcaster.unsubscribe(&conversation_id, id).await;
            });
        }
    }
}
