//! Sync Reconciler
//!
//! Turns a batch of client-proposed messages into authoritative messages or
//! per-message conflict reports. Every entry is resolved independently; a
//! failure on one never aborts the rest of the batch.

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use parley_wire::{SyncMessageRequest, SyncOutcome, SyncResponse, SyncedMessage};
use tracing::{debug, error, warn};

use crate::ids::IdGenerator;
use crate::metrics::ServerMetrics;
use crate::models::{Message, MessageRole, SyncStatus, rfc3339};
use crate::notify::MessagePublisher;
use crate::repository::MessageStore;

pub const LOCAL_ID_REQUIRED: &str = "Local ID is required";
pub const ROLE_REQUIRED: &str = "Message role is required";
pub const CONTENT_MISMATCH: &str = "Content mismatch with existing message";
pub const LOCAL_ID_TAKEN: &str = "Local ID already used in another conversation";

pub struct SyncReconciler {
    messages: Arc<dyn MessageStore>,
    ids: Arc<dyn IdGenerator>,
    publisher: Arc<dyn MessagePublisher>,
    metrics: Arc<ServerMetrics>,
}

impl SyncReconciler {
    pub fn new(
        messages: Arc<dyn MessageStore>,
        ids: Arc<dyn IdGenerator>,
        publisher: Arc<dyn MessagePublisher>,
        metrics: Arc<ServerMetrics>,
    ) -> Self {
        Self {
            messages,
            ids,
            publisher,
            metrics,
        }
    }

    pub async fn reconcile_batch(
        &self,
        conversation_id: &str,
        requests: &[SyncMessageRequest],
    ) -> SyncResponse {
        let mut synced_messages = Vec::with_capacity(requests.len());
        for request in requests {
            let result = match self.reconcile_message(conversation_id, request).await {
                Ok(result) => result,
                Err(e) => {
                    error!(
                        conversation_id,
                        local_id = %request.local_id,
                        "Failed to sync message: {:#}",
                        e
                    );
                    SyncedMessage::conflict(
                        request.local_id.clone(),
                        format!("Internal error: {e}"),
                        None,
                    )
                }
            };
            synced_messages.push(result);
        }

        let conflicts = synced_messages
            .iter()
            .filter(|m| m.status == SyncOutcome::Conflict)
            .count();
        self.metrics
            .record_sync(synced_messages.len() - conflicts, conflicts);
        debug!(
            conversation_id,
            total = synced_messages.len(),
            conflicts,
            "Sync batch reconciled"
        );

        SyncResponse {
            synced_messages,
            synced_at: rfc3339(&Utc::now()),
        }
    }

    /// Resolve one proposal. Validation outcomes are `Ok` conflicts; `Err` is
    /// reserved for store failures.
    pub async fn reconcile_message(
        &self,
        conversation_id: &str,
        request: &SyncMessageRequest,
    ) -> Result<SyncedMessage> {
        if request.local_id.is_empty() {
            return Ok(SyncedMessage::conflict("", LOCAL_ID_REQUIRED, None));
        }
        if request.role.is_empty() {
            return Ok(SyncedMessage::conflict(
                request.local_id.clone(),
                ROLE_REQUIRED,
                None,
            ));
        }

        if let Some(mut existing) = self.messages.get_by_local_id(&request.local_id).await? {
            // Another conversation's message is never revealed or touched.
            if existing.conversation_id != conversation_id {
                warn!(
                    conversation_id,
                    local_id = %request.local_id,
                    "Sync rejected: local id belongs to another conversation"
                );
                return Ok(SyncedMessage::conflict(
                    request.local_id.clone(),
                    LOCAL_ID_TAKEN,
                    None,
                ));
            }
            if existing.contents == request.contents {
                return Ok(SyncedMessage::synced(existing.to_view()));
            }

            warn!(
                conversation_id,
                local_id = %request.local_id,
                message_id = %existing.id,
                "Sync conflict: content differs from stored message"
            );
            existing.mark_as_conflict();
            self.messages.update(&existing).await?;
            return Ok(SyncedMessage::conflict(
                request.local_id.clone(),
                CONTENT_MISMATCH,
                Some(existing.to_view()),
            ));
        }

        let role: MessageRole = match request.role.parse() {
            Ok(role) => role,
            Err(_) => {
                return Ok(SyncedMessage::conflict(
                    request.local_id.clone(),
                    format!("Unknown message role: {}", request.role),
                    None,
                ));
            }
        };

        let now = Utc::now();
        let created_at = parse_timestamp(&request.created_at).unwrap_or(now);
        let updated_at = request
            .updated_at
            .as_deref()
            .and_then(parse_timestamp)
            .unwrap_or(created_at);

        let id = self.ids.generate_message_id();
        let message = Message {
            id: id.clone(),
            conversation_id: conversation_id.to_string(),
            sequence_number: request.sequence_number,
            previous_id: request.previous_id.clone().filter(|p| !p.is_empty()),
            role,
            contents: request.contents.clone(),
            local_id: Some(request.local_id.clone()),
            server_id: Some(id),
            sync_status: SyncStatus::Synced,
            created_at,
            updated_at,
            synced_at: Some(now),
        };
        self.messages.create(&message).await?;

        let view = message.to_view();
        let publisher = self.publisher.clone();
        let published = view.clone();
        tokio::spawn(async move {
            publisher.publish_message(published).await;
        });

        Ok(SyncedMessage::synced(view))
    }
}

/// Client clocks are untrusted; anything that is not RFC 3339 is ignored.
fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::UuidIdGenerator;
    use crate::models::SyncCounts;
    use crate::repository::test_helpers::seeded_repository;
    use async_trait::async_trait;
    use parley_wire::MessageView;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct MemoryStore {
        messages: Mutex<HashMap<String, Message>>,
        writes: AtomicUsize,
    }

    #[async_trait]
    impl MessageStore for MemoryStore {
        async fn get_by_local_id(&self, local_id: &str) -> Result<Option<Message>> {
            Ok(self.messages.lock().await.get(local_id).cloned())
        }

        async fn create(&self, message: &Message) -> Result<()> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            let key = message.local_id.clone().unwrap_or_default();
            self.messages.lock().await.insert(key, message.clone());
            Ok(())
        }

        async fn update(&self, message: &Message) -> Result<()> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            let key = message.local_id.clone().unwrap_or_default();
            self.messages.lock().await.insert(key, message.clone());
            Ok(())
        }

        async fn sync_counts(&self, _conversation_id: &str) -> Result<SyncCounts> {
            Ok(SyncCounts::default())
        }
    }

    struct BrokenStore;

    #[async_trait]
    impl MessageStore for BrokenStore {
        async fn get_by_local_id(&self, _local_id: &str) -> Result<Option<Message>> {
            Ok(None)
        }

        async fn create(&self, _message: &Message) -> Result<()> {
            anyhow::bail!("disk full")
        }

        async fn update(&self, _message: &Message) -> Result<()> {
            anyhow::bail!("disk full")
        }

        async fn sync_counts(&self, _conversation_id: &str) -> Result<SyncCounts> {
            anyhow::bail!("disk full")
        }
    }

    #[derive(Default)]
    struct RecordingPublisher {
        published: Mutex<Vec<MessageView>>,
    }

    #[async_trait]
    impl MessagePublisher for RecordingPublisher {
        async fn publish_message(&self, message: MessageView) {
            self.published.lock().await.push(message);
        }
    }

    impl RecordingPublisher {
        async fn wait_for(&self, n: usize) -> Vec<MessageView> {
            for _ in 0..100 {
                let published = self.published.lock().await.clone();
                if published.len() >= n {
                    return published;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            self.published.lock().await.clone()
        }
    }

    fn reconciler(
        store: Arc<dyn MessageStore>,
    ) -> (SyncReconciler, Arc<RecordingPublisher>, Arc<ServerMetrics>) {
        let publisher = Arc::new(RecordingPublisher::default());
        let metrics = Arc::new(ServerMetrics::new());
        (
            SyncReconciler::new(
                store,
                Arc::new(UuidIdGenerator),
                publisher.clone(),
                metrics.clone(),
            ),
            publisher,
            metrics,
        )
    }

    fn request(local_id: &str, contents: &str) -> SyncMessageRequest {
        SyncMessageRequest {
            local_id: local_id.into(),
            sequence_number: 1,
            role: "user".into(),
            contents: contents.into(),
            created_at: "2024-05-01T10:00:00Z".into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn resubmission_is_idempotent() {
        let store = Arc::new(MemoryStore::default());
        let (reconciler, publisher, _) = reconciler(store.clone());

        let first = reconciler
            .reconcile_message("conv_a", &request("L1", "hi"))
            .await
            .unwrap();
        let second = reconciler
            .reconcile_message("conv_a", &request("L1", "hi"))
            .await
            .unwrap();

        assert_eq!(first.status, SyncOutcome::Synced);
        assert_eq!(second.status, SyncOutcome::Synced);
        assert!(first.server_id.is_some());
        assert_eq!(first.server_id, second.server_id);
        assert_eq!(store.writes.load(Ordering::SeqCst), 1);
        assert_eq!(publisher.wait_for(1).await.len(), 1);
    }

    #[tokio::test]
    async fn content_mismatch_never_overwrites() {
        let store = Arc::new(MemoryStore::default());
        let (reconciler, _, _) = reconciler(store.clone());

        reconciler
            .reconcile_message("conv_a", &request("L1", "hi"))
            .await
            .unwrap();
        let result = reconciler
            .reconcile_message("conv_a", &request("L1", "bye"))
            .await
            .unwrap();

        assert_eq!(result.status, SyncOutcome::Conflict);
        let conflict = result.conflict.unwrap();
        assert_eq!(conflict.reason, CONTENT_MISMATCH);
        assert_eq!(conflict.resolution, "manual");
        let server_message = conflict.server_message.unwrap();
        assert_eq!(server_message.contents, "hi");
        assert_eq!(server_message.sync_status, "conflict");
        assert_eq!(result.server_id.as_deref(), Some(server_message.id.as_str()));

        let stored = store.get_by_local_id("L1").await.unwrap().unwrap();
        assert_eq!(stored.contents, "hi");
        assert_eq!(stored.sync_status, SyncStatus::Conflict);
    }

    #[tokio::test]
    async fn local_id_from_another_conversation_is_left_alone() {
        let store = Arc::new(MemoryStore::default());
        let (reconciler, _, _) = reconciler(store.clone());

        reconciler
            .reconcile_message("conv_a", &request("L1", "private"))
            .await
            .unwrap();
        let writes = store.writes.load(Ordering::SeqCst);

        let result = reconciler
            .reconcile_message("conv_b", &request("L1", "guess"))
            .await
            .unwrap();

        assert_eq!(result.status, SyncOutcome::Conflict);
        assert!(result.server_id.is_none());
        let conflict = result.conflict.unwrap();
        assert_eq!(conflict.reason, LOCAL_ID_TAKEN);
        assert!(conflict.server_message.is_none());

        assert_eq!(store.writes.load(Ordering::SeqCst), writes);
        let stored = store.get_by_local_id("L1").await.unwrap().unwrap();
        assert_eq!(stored.conversation_id, "conv_a");
        assert_eq!(stored.sync_status, SyncStatus::Synced);
    }

    #[tokio::test]
    async fn invalid_entries_do_not_abort_the_batch() {
        let (reconciler, _, metrics) = reconciler(Arc::new(MemoryStore::default()));

        let mut no_role = request("L3", "x");
        no_role.role.clear();
        let mut bad_role = request("L4", "x");
        bad_role.role = "robot".into();

        let response = reconciler
            .reconcile_batch(
                "conv_a",
                &[request("", "x"), request("L2", "ok"), no_role, bad_role],
            )
            .await;

        let results = &response.synced_messages;
        assert_eq!(results.len(), 4);
        assert_eq!(results[0].status, SyncOutcome::Conflict);
        assert_eq!(
            results[0].conflict.as_ref().unwrap().reason,
            LOCAL_ID_REQUIRED
        );
        assert_eq!(results[1].status, SyncOutcome::Synced);
        assert_eq!(results[1].local_id, "L2");
        assert_eq!(results[2].conflict.as_ref().unwrap().reason, ROLE_REQUIRED);
        assert_eq!(
            results[3].conflict.as_ref().unwrap().reason,
            "Unknown message role: robot"
        );
        assert!(DateTime::parse_from_rfc3339(&response.synced_at).is_ok());

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.sync.synced, 1);
        assert_eq!(snapshot.sync.conflicts, 3);
    }

    #[tokio::test]
    async fn store_failure_becomes_internal_error_entry() {
        let (reconciler, publisher, _) = reconciler(Arc::new(BrokenStore));

        let response = reconciler
            .reconcile_batch("conv_a", &[request("L1", "hi")])
            .await;

        let result = &response.synced_messages[0];
        assert_eq!(result.status, SyncOutcome::Conflict);
        assert_eq!(result.local_id, "L1");
        let reason = &result.conflict.as_ref().unwrap().reason;
        assert!(reason.starts_with("Internal error: "), "{reason}");
        assert!(publisher.published.lock().await.is_empty());
    }

    #[tokio::test]
    async fn unparseable_timestamps_fall_back() {
        let store = Arc::new(MemoryStore::default());
        let (reconciler, _, _) = reconciler(store.clone());

        let mut garbled = request("L1", "hi");
        garbled.created_at = "yesterday-ish".into();
        let before = Utc::now() - chrono::Duration::seconds(1);
        reconciler
            .reconcile_message("conv_a", &garbled)
            .await
            .unwrap();
        let stored = store.get_by_local_id("L1").await.unwrap().unwrap();
        assert!(stored.created_at >= before);
        assert_eq!(stored.updated_at, stored.created_at);

        let mut explicit = request("L2", "hi");
        explicit.updated_at = Some("2024-05-02T08:30:00Z".into());
        reconciler
            .reconcile_message("conv_a", &explicit)
            .await
            .unwrap();
        let stored = store.get_by_local_id("L2").await.unwrap().unwrap();
        assert_eq!(rfc3339(&stored.created_at), "2024-05-01T10:00:00Z");
        assert_eq!(rfc3339(&stored.updated_at), "2024-05-02T08:30:00Z");
    }

    #[tokio::test]
    async fn synced_hi_then_conflicting_bye_against_sqlite() {
        let repo = Arc::new(seeded_repository().await);
        let (reconciler, publisher, _) = reconciler(repo.clone());

        let first = reconciler
            .reconcile_batch("conv_a", &[request("L1", "hi")])
            .await
            .synced_messages
            .remove(0);
        assert_eq!(first.local_id, "L1");
        assert_eq!(first.status, SyncOutcome::Synced);
        let server_id = first.server_id.clone().unwrap();
        assert!(server_id.starts_with("msg_"));

        let again = reconciler
            .reconcile_batch("conv_a", &[request("L1", "hi")])
            .await
            .synced_messages
            .remove(0);
        assert_eq!(again.status, SyncOutcome::Synced);
        assert_eq!(again.server_id.as_deref(), Some(server_id.as_str()));

        let conflict = reconciler
            .reconcile_batch("conv_a", &[request("L1", "bye")])
            .await
            .synced_messages
            .remove(0);
        assert_eq!(conflict.status, SyncOutcome::Conflict);
        let details = conflict.conflict.unwrap();
        assert_eq!(details.reason, CONTENT_MISMATCH);
        assert_eq!(conflict.server_id.as_deref(), Some(server_id.as_str()));
        let original = details.server_message.unwrap();
        assert_eq!(original.id, server_id);
        assert_eq!(original.contents, "hi");

        let published = publisher.wait_for(1).await;
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].id, server_id);

        let counts = repo.get_sync_counts("conv_a").await.unwrap();
        assert_eq!(counts.conflict, 1);
        assert_eq!(counts.synced, 0);
    }
}
