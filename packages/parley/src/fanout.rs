//! Topic → subscriber table shared by the duplex registry and the push
//! broadcaster.
//!
//! `fan_out` snapshots a topic's subscribers under the read lock, releases it,
//! and only then runs the delivery future for each one, concurrently. No
//! delivery I/O ever happens while the table lock is held.

use std::collections::HashMap;
use std::future::Future;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::RwLock;

use crate::ws::ConnectionId;

/// A handle the table can store.
///
/// `joined`/`left` run under the table's write lock so per-subscriber
/// bookkeeping changes together with table membership.
#[async_trait]
pub trait Subscriber: Clone + Send + Sync + 'static {
    fn subscriber_id(&self) -> ConnectionId;

    async fn joined(&self, _topic: &str) {}

    async fn left(&self, _topic: &str) {}
}

/// Result of one delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// Skipped for this subscriber only; it stays subscribed.
    Dropped,
    /// Subscriber is unusable; remove it from the topic.
    Gone,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FanoutReport {
    pub delivered: usize,
    pub dropped: usize,
    pub removed: Vec<ConnectionId>,
}

pub struct SubscriberTable<H> {
    topics: RwLock<HashMap<String, HashMap<ConnectionId, H>>>,
}

impl<H: Subscriber> Default for SubscriberTable<H> {
    fn default() -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
        }
    }
}

impl<H: Subscriber> SubscriberTable<H> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent. Returns true if the handle was not already present.
    pub async fn insert(&self, topic: &str, handle: H) -> bool {
        let mut topics = self.topics.write().await;
        let added = topics
            .entry(topic.to_string())
            .or_default()
            .insert(handle.subscriber_id(), handle.clone())
            .is_none();
        handle.joined(topic).await;
        added
    }

    /// Removes the handle; an emptied topic is deleted outright.
    pub async fn remove(&self, topic: &str, id: ConnectionId) -> bool {
        let mut topics = self.topics.write().await;
        let Some(members) = topics.get_mut(topic) else {
            return false;
        };
        let removed = members.remove(&id);
        if members.is_empty() {
            topics.remove(topic);
        }
        match removed {
            Some(handle) => {
                handle.left(topic).await;
                true
            }
            None => false,
        }
    }

    pub async fn snapshot(&self, topic: &str) -> Vec<H> {
        self.topics
            .read()
            .await
            .get(topic)
            .map(|members| members.values().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .read()
            .await
            .get(topic)
            .map(HashMap::len)
            .unwrap_or(0)
    }

    pub async fn topic_count(&self) -> usize {
        self.topics.read().await.len()
    }

    /// Deliver to every subscriber of `topic` except `exclude`.
    pub async fn fan_out<F, Fut>(
        &self,
        topic: &str,
        exclude: Option<ConnectionId>,
        deliver: F,
    ) -> FanoutReport
    where
        F: Fn(H) -> Fut,
        Fut: Future<Output = Delivery>,
    {
        let targets: Vec<H> = self
            .snapshot(topic)
            .await
            .into_iter()
            .filter(|h| Some(h.subscriber_id()) != exclude)
            .collect();

        let outcomes = join_all(targets.into_iter().map(|handle| {
            let id = handle.subscriber_id();
            let attempt = deliver(handle);
            async move { (id, attempt.await) }
        }))
        .await;

        let mut report = FanoutReport::default();
        for (id, outcome) in outcomes {
            match outcome {
                Delivery::Delivered => report.delivered += 1,
                Delivery::Dropped => report.dropped += 1,
                Delivery::Gone => {
                    self.remove(topic, id).await;
                    report.removed.push(id);
                }
            }
        }
        report
    }
}
