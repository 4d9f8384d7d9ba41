use crate::AppState;
use crate::config::ServerConfig;
use crate::models::ConversationStatus;
use crate::repository::test_helpers::{make_conversation, test_repository};

/// Build a fully-wired `AppState` backed by an in-memory SQLite database.
///
/// Seeded conversations, all owned by `user_1`:
/// - `conv_a`, `conv_b`: active
/// - `conv_archived`: archived
pub async fn test_app_state() -> AppState {
    let repository = test_repository().await;

    for id in ["conv_a", "conv_b"] {
        repository
            .create_conversation(&make_conversation(id, "user_1"))
            .await
            .expect("seed conversation");
    }
    let mut archived = make_conversation("conv_archived", "user_1");
    archived.status = ConversationStatus::Archived;
    repository
        .create_conversation(&archived)
        .await
        .expect("seed archived conversation");

    AppState::new(repository, ServerConfig::default())
}
