//! Broadcast Registry
//!
//! Process-wide table of conversation → subscriber connections, plus the
//! singleton agent slot. Constructed once in `main` and handed to every
//! connection; tests build their own.
//!
//! Lock discipline: the conversation table and the agent slot each have their
//! own `RwLock`, and neither is held across a socket write.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parley_wire::Envelope;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::fanout::{Delivery, FanoutReport, SubscriberTable};

use super::connection::{Connection, ConnectionId};

/// Outcome of routing to the agent connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRoute {
    Delivered,
    /// No agent connected; the request is dropped, not queued.
    NoAgent,
    /// The write failed and the agent slot was cleared.
    Failed,
}

pub struct BroadcastRegistry {
    conversations: SubscriberTable<Arc<Connection>>,
    agent: RwLock<Option<Arc<Connection>>>,
    write_timeout: Duration,
}

impl BroadcastRegistry {
    pub fn new(write_timeout: Duration) -> Self {
        Self {
            conversations: SubscriberTable::new(),
            agent: RwLock::new(None),
            write_timeout,
        }
    }

    /// Idempotent. Also records the conversation in the connection's state.
    pub async fn subscribe(&self, conversation_id: &str, conn: &Arc<Connection>) -> bool {
        self.conversations
            .insert(conversation_id, conn.clone())
            .await
    }

    pub async fn unsubscribe(&self, conversation_id: &str, conn: &Connection) -> bool {
        self.conversations.remove(conversation_id, conn.id).await
    }

    pub async fn broadcast(&self, conversation_id: &str, frame: Bytes) -> FanoutReport {
        self.fan_out(conversation_id, frame, None).await
    }

    /// Broadcast to everyone but `exclude` (the agent's own traffic).
    pub async fn broadcast_excluding(
        &self,
        conversation_id: &str,
        frame: Bytes,
        exclude: ConnectionId,
    ) -> FanoutReport {
        self.fan_out(conversation_id, frame, Some(exclude)).await
    }

    async fn fan_out(
        &self,
        conversation_id: &str,
        frame: Bytes,
        exclude: Option<ConnectionId>,
    ) -> FanoutReport {
        let write_timeout = self.write_timeout;
        let report = self
            .conversations
            .fan_out(conversation_id, exclude, |conn: Arc<Connection>| {
                let frame = frame.clone();
                async move {
                    match tokio::time::timeout(write_timeout, conn.sink.send_frame(frame)).await {
                        Ok(Ok(())) => Delivery::Delivered,
                        Ok(Err(e)) => {
                            warn!(conn_id = %conn.id, conversation_id, "Broadcast write failed: {}", e);
                            conn.sink.close();
                            Delivery::Gone
                        }
                        Err(_) => {
                            warn!(conn_id = %conn.id, conversation_id, "Broadcast write timed out");
                            conn.sink.close();
                            Delivery::Gone
                        }
                    }
                }
            })
            .await;

        if !report.removed.is_empty() {
            debug!(
                conversation_id,
                removed = report.removed.len(),
                "Dropped failed subscribers"
            );
        }
        report
    }

    /// Make `conn` the agent. Returns the connection it replaced, if any.
    pub async fn subscribe_agent(&self, conn: &Arc<Connection>) -> Option<ConnectionId> {
        conn.state.mark_agent();
        let previous = self.agent.write().await.replace(conn.clone());
        let previous = previous.map(|p| p.id).filter(|id| *id != conn.id);
        match previous {
            Some(prev) => info!(conn_id = %conn.id, previous = %prev, "Agent connection replaced"),
            None => info!(conn_id = %conn.id, "Agent connected"),
        }
        previous
    }

    /// Clears the slot only if `id` still holds it.
    pub async fn unsubscribe_agent(&self, id: ConnectionId) -> bool {
        let mut slot = self.agent.write().await;
        if slot.as_ref().is_some_and(|a| a.id == id) {
            *slot = None;
            info!(conn_id = %id, "Agent disconnected");
            true
        } else {
            false
        }
    }

    pub async fn is_agent_connected(&self) -> bool {
        self.agent.read().await.is_some()
    }

    pub async fn send_to_agent(&self, envelope: &Envelope) -> AgentRoute {
        let agent = self.agent.read().await.clone();
        let Some(agent) = agent else {
            info!(
                conversation_id = %envelope.conversation_id,
                "No agent connected, dropping {}",
                envelope.type_tag()
            );
            return AgentRoute::NoAgent;
        };

        let frame = match envelope.encode() {
            Ok(bytes) => Bytes::from(bytes),
            Err(e) => {
                error!("Failed to encode agent envelope: {}", e);
                return AgentRoute::Failed;
            }
        };

        match tokio::time::timeout(self.write_timeout, agent.sink.send_frame(frame)).await {
            Ok(Ok(())) => AgentRoute::Delivered,
            outcome => {
                let reason = match outcome {
                    Ok(Err(e)) => e.to_string(),
                    _ => "write timed out".to_string(),
                };
                warn!(conn_id = %agent.id, "Agent write failed: {}", reason);
                self.unsubscribe_agent(agent.id).await;
                agent.sink.close();
                AgentRoute::Failed
            }
        }
    }

    /// Drop every trace of `conn`. Returns how many conversations it left.
    pub async fn remove_connection(&self, conn: &Connection) -> usize {
        let subscriptions = conn.state.list_subscriptions().await;
        let mut removed = 0;
        for conversation_id in &subscriptions {
            if self.conversations.remove(conversation_id, conn.id).await {
                removed += 1;
            }
        }
        if conn.state.is_agent() {
            self.unsubscribe_agent(conn.id).await;
        }
        removed
    }

    pub async fn subscriber_count(&self, conversation_id: &str) -> usize {
        self.conversations.subscriber_count(conversation_id).await
    }

    pub async fn conversation_count(&self) -> usize {
        self.conversations.topic_count().await
    }
}
