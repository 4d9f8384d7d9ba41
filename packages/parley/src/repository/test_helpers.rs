use chrono::Utc;
use sqlx::sqlite::SqlitePoolOptions;

use crate::models::{Conversation, ConversationStatus};

/// Create a fresh ConversationRepository backed by an in-memory SQLite database.
/// Each call returns an isolated database with all migrations applied.
pub async fn test_repository() -> super::ConversationRepository {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to create in-memory SQLite pool");

    crate::db::run_migrations(&pool)
        .await
        .expect("Failed to run migrations");

    sqlx::query("PRAGMA foreign_keys = ON")
        .execute(&pool)
        .await
        .expect("Failed to enable foreign keys");

    super::ConversationRepository::new(pool)
}

pub fn make_conversation(id: &str, user_id: &str) -> Conversation {
    let now = Utc::now();
    Conversation {
        id: id.to_string(),
        user_id: user_id.to_string(),
        title: None,
        status: ConversationStatus::Active,
        created_at: now,
        updated_at: now,
    }
}

/// Repository with one active conversation `conv_a` owned by `user_1`.
pub async fn seeded_repository() -> super::ConversationRepository {
    let repo = test_repository().await;
    repo.create_conversation(&make_conversation("conv_a", "user_1"))
        .await
        .expect("Failed to seed conversation");
    repo
}
