//! Per-connection state.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::fanout::Subscriber;

use super::sink::FrameSink;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique handle identity; the registry keys subscribers by it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    #[cfg(test)]
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "c{}", self.0)
    }
}

/// Mutable record owned by one duplex connection.
///
/// The subscription set is guarded by its own lock, separate from the
/// registry's, so `list_subscriptions` is safe alongside subscribe/unsubscribe.
#[derive(Debug, Default)]
pub struct ConnectionState {
    subscriptions: RwLock<HashSet<String>>,
    stanza_counter: AtomicI32,
    is_agent: AtomicBool,
}

impl ConnectionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn subscribe(&self, conversation_id: &str) -> bool {
        self.subscriptions
            .write()
            .await
            .insert(conversation_id.to_string())
    }

    pub async fn unsubscribe(&self, conversation_id: &str) -> bool {
        self.subscriptions.write().await.remove(conversation_id)
    }

    pub async fn is_subscribed(&self, conversation_id: &str) -> bool {
        self.subscriptions.read().await.contains(conversation_id)
    }

    pub async fn list_subscriptions(&self) -> Vec<String> {
        self.subscriptions.read().await.iter().cloned().collect()
    }

    /// Strictly decreasing: -1, -2, ...
    pub fn next_stanza_id(&self) -> i32 {
        self.stanza_counter.fetch_sub(1, Ordering::Relaxed) - 1
    }

    pub fn is_agent(&self) -> bool {
        self.is_agent.load(Ordering::Acquire)
    }

    /// One-way. Returns true the first time.
    pub fn mark_agent(&self) -> bool {
        !self.is_agent.swap(true, Ordering::AcqRel)
    }
}

/// A live duplex connection as the registry sees it.
pub struct Connection {
    pub id: ConnectionId,
    pub state: ConnectionState,
    pub sink: Arc<dyn FrameSink>,
}

impl Connection {
    pub fn new(sink: Arc<dyn FrameSink>) -> Arc<Self> {
        Arc::new(Self {
            id: ConnectionId::next(),
            state: ConnectionState::new(),
            sink,
        })
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("is_agent", &self.state.is_agent())
            .finish()
    }
}

// Registry membership and the connection's own set move together.
#[async_trait]
impl Subscriber for Arc<Connection> {
    fn subscriber_id(&self) -> ConnectionId {
        self.id
    }

    async fn joined(&self, topic: &str) {
        self.state.subscribe(topic).await;
    }

    async fn left(&self, topic: &str) {
        self.state.unsubscribe(topic).await;
    }
}
