use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::sqlite::SqliteRow;

use crate::models::{Message, MessageRole, SyncCounts, SyncStatus};

use super::ConversationRepository;

const MESSAGE_COLUMNS: &str = "id, conversation_id, sequence_number, previous_id, role, contents, \
     local_id, server_id, sync_status, created_at, updated_at, synced_at";

fn millis(ts: i64, column: &str) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ts).with_context(|| format!("Invalid {} timestamp", column))
}

fn message_from_row(r: &SqliteRow) -> Result<Message> {
    let role: String = r.get("role");
    let sync_status: String = r.get("sync_status");
    let synced_at: Option<i64> = r.get("synced_at");
    Ok(Message {
        id: r.get("id"),
        conversation_id: r.get("conversation_id"),
        sequence_number: r.get("sequence_number"),
        previous_id: r.get("previous_id"),
        role: role.parse::<MessageRole>().context("Invalid message role")?,
        contents: r.get("contents"),
        local_id: r.get("local_id"),
        server_id: r.get("server_id"),
        sync_status: sync_status
            .parse::<SyncStatus>()
            .context("Invalid sync status")?,
        created_at: millis(r.get("created_at"), "created_at")?,
        updated_at: millis(r.get("updated_at"), "updated_at")?,
        synced_at: synced_at.map(|ts| millis(ts, "synced_at")).transpose()?,
    })
}

impl ConversationRepository {
    pub async fn insert_message(&self, msg: &Message) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO messages (id, conversation_id, sequence_number, previous_id, role, contents,
                                  local_id, server_id, sync_status, created_at, updated_at, synced_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&msg.id)
        .bind(&msg.conversation_id)
        .bind(msg.sequence_number)
        .bind(&msg.previous_id)
        .bind(msg.role.as_str())
        .bind(&msg.contents)
        .bind(&msg.local_id)
        .bind(&msg.server_id)
        .bind(msg.sync_status.as_str())
        .bind(msg.created_at.timestamp_millis())
        .bind(msg.updated_at.timestamp_millis())
        .bind(msg.synced_at.map(|ts| ts.timestamp_millis()))
        .execute(&self.pool)
        .await
        .context("Failed to insert message")?;

        Ok(())
    }

    pub async fn update_message(&self, msg: &Message) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE messages
            SET sequence_number = ?, previous_id = ?, role = ?, contents = ?, server_id = ?,
                sync_status = ?, updated_at = ?, synced_at = ?
            WHERE id = ?
            "#,
        )
        .bind(msg.sequence_number)
        .bind(&msg.previous_id)
        .bind(msg.role.as_str())
        .bind(&msg.contents)
        .bind(&msg.server_id)
        .bind(msg.sync_status.as_str())
        .bind(msg.updated_at.timestamp_millis())
        .bind(msg.synced_at.map(|ts| ts.timestamp_millis()))
        .bind(&msg.id)
        .execute(&self.pool)
        .await
        .context("Failed to update message")?;

        if result.rows_affected() == 0 {
            anyhow::bail!("Message {} not found", msg.id);
        }
        Ok(())
    }

    pub async fn get_message_by_local_id(&self, local_id: &str) -> Result<Option<Message>> {
        let sql = format!("SELECT {} FROM messages WHERE local_id = ?", MESSAGE_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(local_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to load message by local id")?;

        row.as_ref().map(message_from_row).transpose()
    }

    /// Messages of a conversation in sequence order.
    pub async fn list_messages(&self, conversation_id: &str) -> Result<Vec<Message>> {
        let sql = format!(
            "SELECT {} FROM messages WHERE conversation_id = ? ORDER BY sequence_number, created_at",
            MESSAGE_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(conversation_id)
            .fetch_all(&self.pool)
            .await
            .context("Failed to list messages")?;

        rows.iter().map(message_from_row).collect()
    }

    pub async fn get_sync_counts(&self, conversation_id: &str) -> Result<SyncCounts> {
        let row = sqlx::query(
            r#"
            SELECT
                COALESCE(SUM(CASE WHEN sync_status = 'pending' THEN 1 ELSE 0 END), 0) AS pending,
                COALESCE(SUM(CASE WHEN sync_status = 'synced' THEN 1 ELSE 0 END), 0) AS synced,
                COALESCE(SUM(CASE WHEN sync_status = 'conflict' THEN 1 ELSE 0 END), 0) AS conflict,
                MAX(CASE WHEN sync_status = 'synced' THEN synced_at END) AS last_synced_at
            FROM messages
            WHERE conversation_id = ?
            "#,
        )
        .bind(conversation_id)
        .fetch_one(&self.pool)
        .await
        .context("Failed to count messages by sync status")?;

        let last_synced_at: Option<i64> = row.get("last_synced_at");
        Ok(SyncCounts {
            pending: row.get("pending"),
            synced: row.get("synced"),
            conflict: row.get("conflict"),
            last_synced_at: last_synced_at
                .map(|ts| millis(ts, "synced_at"))
                .transpose()?,
        })
    }
}
