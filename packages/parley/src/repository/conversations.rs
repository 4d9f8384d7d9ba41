use anyhow::{Context, Result};
use chrono::DateTime;
use sqlx::Row;
use sqlx::sqlite::SqliteRow;

use crate::models::{Conversation, ConversationStatus};

use super::ConversationRepository;

fn conversation_from_row(r: &SqliteRow) -> Result<Conversation> {
    let status: String = r.get("status");
    let created_at: i64 = r.get("created_at");
    let updated_at: i64 = r.get("updated_at");
    Ok(Conversation {
        id: r.get("id"),
        user_id: r.get("user_id"),
        title: r.get("title"),
        status: status
            .parse::<ConversationStatus>()
            .context("Invalid conversation status")?,
        created_at: DateTime::from_timestamp_millis(created_at)
            .context("Invalid conversation created_at")?,
        updated_at: DateTime::from_timestamp_millis(updated_at)
            .context("Invalid conversation updated_at")?,
    })
}

impl ConversationRepository {
    pub async fn create_conversation(&self, conversation: &Conversation) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO conversations (id, user_id, title, status, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&conversation.id)
        .bind(&conversation.user_id)
        .bind(&conversation.title)
        .bind(conversation.status.as_str())
        .bind(conversation.created_at.timestamp_millis())
        .bind(conversation.updated_at.timestamp_millis())
        .execute(&self.pool)
        .await
        .context("Failed to insert conversation")?;

        Ok(())
    }

    pub async fn get_conversation(&self, id: &str) -> Result<Option<Conversation>> {
        let row = sqlx::query(
            r#"
            SELECT id, user_id, title, status, created_at, updated_at
            FROM conversations
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to load conversation")?;

        row.as_ref().map(conversation_from_row).transpose()
    }

    pub async fn get_conversation_for_user(
        &self,
        id: &str,
        user_id: &str,
    ) -> Result<Option<Conversation>> {
        let row = sqlx::query(
            r#"
            SELECT id, user_id, title, status, created_at, updated_at
            FROM conversations
            WHERE id = ? AND user_id = ?
            "#,
        )
        .bind(id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to load conversation")?;

        row.as_ref().map(conversation_from_row).transpose()
    }

    pub async fn set_conversation_status(&self, id: &str, status: ConversationStatus) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE conversations SET status = ?, updated_at = ? WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(chrono::Utc::now().timestamp_millis())
        .bind(id)
        .execute(&self.pool)
        .await
        .context("Failed to update conversation status")?;

        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_helpers::{make_conversation, test_repository};
    use super::*;

    #[tokio::test]
    async fn lookup_is_scoped_to_owner() {
        let repo = test_repository().await;
        repo.create_conversation(&make_conversation("conv_a", "user_1"))
            .await
            .unwrap();

        let found = repo
            .get_conversation_for_user("conv_a", "user_1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.user_id, "user_1");
        assert!(found.is_active());

        assert!(
            repo.get_conversation_for_user("conv_a", "user_2")
                .await
                .unwrap()
                .is_none()
        );
        assert!(
            repo.get_conversation_for_user("missing", "user_1")
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn lookup_by_id_ignores_owner() {
        let repo = test_repository().await;
        repo.create_conversation(&make_conversation("conv_a", "user_1"))
            .await
            .unwrap();

        let found = repo.get_conversation("conv_a").await.unwrap().unwrap();
        assert_eq!(found.id, "conv_a");
        assert_eq!(found.user_id, "user_1");
        assert!(repo.get_conversation("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn archive_conversation() {
        let repo = test_repository().await;
        repo.create_conversation(&make_conversation("conv_a", "user_1"))
            .await
            .unwrap();

        assert!(
            repo.set_conversation_status("conv_a", ConversationStatus::Archived)
                .await
                .unwrap()
        );
        let found = repo
            .get_conversation_for_user("conv_a", "user_1")
            .await
            .unwrap()
            .unwrap();
        assert!(!found.is_active());
        assert!(
            !repo
                .set_conversation_status("missing", ConversationStatus::Archived)
                .await
                .unwrap()
        );
    }
}
