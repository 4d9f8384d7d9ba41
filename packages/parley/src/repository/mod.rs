// Repository layer: the collaborator traits the sync core consumes, and the
// SQLite-backed `ConversationRepository` that implements them. Each domain
// lives in its own file with `impl ConversationRepository`.

use anyhow::Result;
use async_trait::async_trait;
use sqlx::sqlite::SqlitePool;

use crate::models::{Conversation, Message, SyncCounts};

mod conversations;
mod messages;

#[cfg(test)]
pub(crate) mod test_helpers;

/// Message persistence as seen by the reconciler.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Lookup is global, not scoped to a conversation.
    async fn get_by_local_id(&self, local_id: &str) -> Result<Option<Message>>;
    async fn create(&self, message: &Message) -> Result<()>;
    async fn update(&self, message: &Message) -> Result<()>;
    async fn sync_counts(&self, conversation_id: &str) -> Result<SyncCounts>;
}

/// Conversation lookup used to authorize sync entry points.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn get_by_id(&self, id: &str) -> Result<Option<Conversation>>;


    /// `None` when the conversation is missing or owned by someone else.
    async fn get_by_id_and_user_id(&self, id: &str, user_id: &str)
    -> Result<Option<Conversation>>;
}

#[derive(Clone)]
pub struct ConversationRepository {
    pub(crate) pool: SqlitePool,
}

impl ConversationRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MessageStore for ConversationRepository {
    async fn get_by_local_id(&self, local_id: &str) -> Result<Option<Message>> {
        self.get_message_by_local_id(local_id).await
    }

    async fn create(&self, message: &Message) -> Result<()> {
        self.insert_message(message).await
    }

    async fn update(&self, message: &Message) -> Result<()> {
        self.update_message(message).await
    }

    async fn sync_counts(&self, conversation_id: &str) -> Result<SyncCounts> {
        self.get_sync_counts(conversation_id).await
    }
}

#[async_trait]
impl ConversationStore for ConversationRepository {
    async fn get_by_id(&self, id: &str) -> Result<Option<Conversation>> {
        self.get_conversation(id).await
    }

    async fn get_by_id_and_user_id(
        &self,
        id: &str,
        user_id: &str,
    ) -> Result<Option<Conversation>> {
        self.get_conversation_for_user(id, user_id).await
    }
}
