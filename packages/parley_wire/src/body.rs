//! Body payloads for the envelope types the server interprets.
//!
//! Field names are camelCase on the wire. Request bodies default every field so
//! a missing key is reported by the handler (e.g. "Local ID is required")
//! rather than as a decode failure.

use serde::{Deserialize, Serialize};

/// Codes carried in [`ErrorBody::code`].
pub mod error_codes {
    pub const INVALID_MESSAGE: &str = "invalid_message";
    pub const NOT_SUBSCRIBED: &str = "not_subscribed";
    pub const CONVERSATION_NOT_FOUND: &str = "conversation_not_found";
    pub const CONVERSATION_INACTIVE: &str = "conversation_inactive";
    pub const INTERNAL_ERROR: &str = "internal_error";
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeRequest {
    #[serde(default)]
    pub conversation_id: String,
    /// Declares the sending connection as the response-generation agent.
    /// When set, `conversation_id` is ignored.
    #[serde(default)]
    pub agent_mode: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeAck {
    #[serde(default)]
    pub conversation_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnsubscribeRequest {
    #[serde(default)]
    pub conversation_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnsubscribeAck {
    #[serde(default)]
    pub conversation_id: String,
    pub success: bool,
}

/// A client-proposed message. Untrusted: every field is validated by the
/// reconciler.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncMessageRequest {
    #[serde(default)]
    pub local_id: String,
    #[serde(default)]
    pub sequence_number: i64,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub contents: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_id: Option<String>,
    /// RFC 3339.
    #[serde(default)]
    pub created_at: String,
    /// RFC 3339.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequest {
    #[serde(default)]
    pub messages: Vec<SyncMessageRequest>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncOutcome {
    Synced,
    Conflict,
}

/// Authoritative message as seen by clients.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageView {
    pub id: String,
    pub conversation_id: String,
    pub sequence_number: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_id: Option<String>,
    pub role: String,
    pub contents: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,
    pub sync_status: String,
    pub created_at: String,
    pub updated_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synced_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictDetails {
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_message: Option<MessageView>,
    /// Always "manual": there is no automatic resolution.
    pub resolution: String,
}

/// Per-message result of a sync batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncedMessage {
    pub local_id: String,
    pub status: SyncOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<MessageView>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conflict: Option<ConflictDetails>,
}

impl SyncedMessage {
    pub fn synced(message: MessageView) -> Self {
        Self {
            local_id: message.local_id.clone().unwrap_or_default(),
            status: SyncOutcome::Synced,
            server_id: message.server_id.clone().or_else(|| Some(message.id.clone())),
            message: Some(message),
            conflict: None,
        }
    }

    pub fn conflict(
        local_id: impl Into<String>,
        reason: impl Into<String>,
        server_message: Option<MessageView>,
    ) -> Self {
        let server_id = server_message
            .as_ref()
            .map(|m| m.server_id.clone().unwrap_or_else(|| m.id.clone()));
        Self {
            local_id: local_id.into(),
            status: SyncOutcome::Conflict,
            server_id,
            message: None,
            conflict: Some(ConflictDetails {
                reason: reason.into(),
                server_message,
                resolution: "manual".to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResponse {
    pub synced_messages: Vec<SyncedMessage>,
    /// RFC 3339 batch timestamp.
    pub synced_at: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

impl ErrorBody {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GenerationKind {
    Send,
    Edit,
    Regenerate,
    Continue,
}

/// Routed to the single agent connection; never broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseGenerationRequest {
    pub id: String,
    pub message_id: String,
    pub conversation_id: String,
    pub request_type: GenerationKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_content: Option<String>,
    #[serde(default)]
    pub enable_tools: bool,
    #[serde(default)]
    pub enable_reasoning: bool,
    #[serde(default)]
    pub enable_streaming: bool,
    /// Unix milliseconds.
    #[serde(default)]
    pub timestamp: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view(local_id: &str) -> MessageView {
        MessageView {
            id: "msg_1".into(),
            conversation_id: "conv_1".into(),
            sequence_number: 1,
            role: "user".into(),
            contents: "hi".into(),
            local_id: Some(local_id.into()),
            server_id: Some("msg_1".into()),
            sync_status: "synced".into(),
            created_at: "2024-01-01T00:00:00Z".into(),
            updated_at: "2024-01-01T00:00:00Z".into(),
            ..Default::default()
        }
    }

    #[test]
    fn synced_result_carries_server_id() {
        let result = SyncedMessage::synced(view("L1"));
        assert_eq!(result.local_id, "L1");
        assert_eq!(result.status, SyncOutcome::Synced);
        assert_eq!(result.server_id.as_deref(), Some("msg_1"));
        assert!(result.conflict.is_none());
    }

    #[test]
    fn conflict_result_is_manual() {
        let result = SyncedMessage::conflict("L1", "Content mismatch", Some(view("L1")));
        assert_eq!(result.status, SyncOutcome::Conflict);
        assert_eq!(result.server_id.as_deref(), Some("msg_1"));
        let conflict = result.conflict.unwrap();
        assert_eq!(conflict.resolution, "manual");
        assert_eq!(conflict.server_message.unwrap().contents, "hi");
    }

    #[test]
    fn validation_conflict_has_no_server_id() {
        let result = SyncedMessage::conflict("", "Local ID is required", None);
        assert!(result.server_id.is_none());
        assert!(result.conflict.unwrap().server_message.is_none());
    }

    #[test]
    fn json_field_names_are_camel_case() {
        let json = serde_json::to_value(SubscribeRequest {
            conversation_id: "c".into(),
            agent_mode: true,
        })
        .unwrap();
        assert_eq!(json["conversationId"], "c");
        assert_eq!(json["agentMode"], true);

        let status = serde_json::to_value(SyncOutcome::Conflict).unwrap();
        assert_eq!(status, "conflict");
    }

    #[test]
    fn sync_request_tolerates_missing_fields() {
        let req: SyncRequest =
            serde_json::from_str(r#"{"messages":[{"contents":"x"}]}"#).unwrap();
        assert_eq!(req.messages.len(), 1);
        assert!(req.messages[0].local_id.is_empty());
        assert!(req.messages[0].role.is_empty());
        assert!(req.messages[0].updated_at.is_none());
    }
}
