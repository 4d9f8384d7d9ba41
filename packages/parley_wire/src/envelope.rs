//! CBOR envelope over websocket binary frames.
//!
//! Wire record (one per frame):
//! `{ "conversationId": text?, "stanzaId": int, "type": text, "body": any? }`
//!
//! The frame boundary is the length frame, so the only size check is
//! [`DEFAULT_MAX_ENVELOPE_BYTES`] (or the caller's limit).

use ciborium::Value;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::body::{
    ErrorBody, MessageView, ResponseGenerationRequest, SubscribeAck, SubscribeRequest,
    SyncRequest, SyncResponse, UnsubscribeAck, UnsubscribeRequest,
};

/// Maximum encoded envelope size (1 MiB).
pub const DEFAULT_MAX_ENVELOPE_BYTES: usize = 1024 * 1024;

/// Stable type tags.
pub mod tags {
    pub const SUBSCRIBE: &str = "subscribe";
    pub const SUBSCRIBE_ACK: &str = "subscribe_ack";
    pub const UNSUBSCRIBE: &str = "unsubscribe";
    pub const UNSUBSCRIBE_ACK: &str = "unsubscribe_ack";
    pub const SYNC_REQUEST: &str = "sync_request";
    pub const SYNC_RESPONSE: &str = "sync_response";
    pub const ERROR: &str = "error";
    pub const RESPONSE_GENERATION_REQUEST: &str = "response_generation_request";
    pub const MESSAGE: &str = "message";

    // Application types routed without interpretation.
    pub const ASSISTANT_MESSAGE: &str = "assistant_message";
    pub const ASSISTANT_SENTENCE: &str = "assistant_sentence";
    pub const START_ANSWER: &str = "start_answer";
    pub const TOOL_USE_REQUEST: &str = "tool_use_request";
    pub const TOOL_USE_RESULT: &str = "tool_use_result";
    pub const CONVERSATION_UPDATE: &str = "conversation_update";
    pub const GENERATION_COMPLETE: &str = "generation_complete";
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("envelope is {len} bytes (max {max})")]
    TooLarge { len: usize, max: usize },
    #[error("malformed envelope: {0}")]
    Malformed(String),
    #[error("invalid {kind} body: {reason}")]
    InvalidBody {
        kind: String,
        conversation_id: String,
        reason: String,
    },
    #[error("failed to encode envelope: {0}")]
    Encode(String),
}

/// A type the server routes but never interprets. `body` is the CBOR encoding
/// of the original body value, preserved byte-for-byte in meaning.
#[derive(Debug, Clone, PartialEq)]
pub struct Passthrough {
    pub kind: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    Subscribe(SubscribeRequest),
    SubscribeAck(SubscribeAck),
    Unsubscribe(UnsubscribeRequest),
    UnsubscribeAck(UnsubscribeAck),
    SyncRequest(SyncRequest),
    SyncResponse(SyncResponse),
    Error(ErrorBody),
    ResponseGenerationRequest(ResponseGenerationRequest),
    Message(MessageView),
    Passthrough(Passthrough),
}

impl Body {
    pub fn type_tag(&self) -> &str {
        match self {
            Body::Subscribe(_) => tags::SUBSCRIBE,
            Body::SubscribeAck(_) => tags::SUBSCRIBE_ACK,
            Body::Unsubscribe(_) => tags::UNSUBSCRIBE,
            Body::UnsubscribeAck(_) => tags::UNSUBSCRIBE_ACK,
            Body::SyncRequest(_) => tags::SYNC_REQUEST,
            Body::SyncResponse(_) => tags::SYNC_RESPONSE,
            Body::Error(_) => tags::ERROR,
            Body::ResponseGenerationRequest(_) => tags::RESPONSE_GENERATION_REQUEST,
            Body::Message(_) => tags::MESSAGE,
            Body::Passthrough(p) => &p.kind,
        }
    }

    fn is_interpreted(kind: &str) -> bool {
        matches!(
            kind,
            tags::SUBSCRIBE
                | tags::SUBSCRIBE_ACK
                | tags::UNSUBSCRIBE
                | tags::UNSUBSCRIBE_ACK
                | tags::SYNC_REQUEST
                | tags::SYNC_RESPONSE
                | tags::ERROR
                | tags::RESPONSE_GENERATION_REQUEST
                | tags::MESSAGE
        )
    }

    fn from_wire(
        kind: &str,
        conversation_id: &str,
        body: Option<Value>,
    ) -> Result<Self, CodecError> {
        if kind.is_empty() {
            return Err(CodecError::Malformed("missing type tag".to_string()));
        }
        if !Self::is_interpreted(kind) {
            let mut raw = Vec::new();
            ciborium::into_writer(&body.unwrap_or(Value::Null), &mut raw)
                .map_err(|e| CodecError::Malformed(e.to_string()))?;
            return Ok(Body::Passthrough(Passthrough {
                kind: kind.to_string(),
                body: raw,
            }));
        }

        // An absent body decodes as an empty map so field defaults apply.
        let value = body.unwrap_or_else(|| Value::Map(Vec::new()));
        let parsed = match kind {
            tags::SUBSCRIBE => Body::Subscribe(typed(kind, conversation_id, value)?),
            tags::SUBSCRIBE_ACK => Body::SubscribeAck(typed(kind, conversation_id, value)?),
            tags::UNSUBSCRIBE => Body::Unsubscribe(typed(kind, conversation_id, value)?),
            tags::UNSUBSCRIBE_ACK => Body::UnsubscribeAck(typed(kind, conversation_id, value)?),
            tags::SYNC_REQUEST => Body::SyncRequest(typed(kind, conversation_id, value)?),
            tags::SYNC_RESPONSE => Body::SyncResponse(typed(kind, conversation_id, value)?),
            tags::ERROR => Body::Error(typed(kind, conversation_id, value)?),
            tags::RESPONSE_GENERATION_REQUEST => {
                Body::ResponseGenerationRequest(typed(kind, conversation_id, value)?)
            }
            _ => Body::Message(typed(kind, conversation_id, value)?),
        };
        Ok(parsed)
    }

    fn to_value(&self) -> Result<Value, CodecError> {
        let value = match self {
            Body::Subscribe(b) => Value::serialized(b),
            Body::SubscribeAck(b) => Value::serialized(b),
            Body::Unsubscribe(b) => Value::serialized(b),
            Body::UnsubscribeAck(b) => Value::serialized(b),
            Body::SyncRequest(b) => Value::serialized(b),
            Body::SyncResponse(b) => Value::serialized(b),
            Body::Error(b) => Value::serialized(b),
            Body::ResponseGenerationRequest(b) => Value::serialized(b),
            Body::Message(b) => Value::serialized(b),
            Body::Passthrough(p) => {
                return ciborium::from_reader(p.body.as_slice())
                    .map_err(|e| CodecError::Encode(e.to_string()));
            }
        };
        value.map_err(|e| CodecError::Encode(e.to_string()))
    }
}

fn typed<T: DeserializeOwned>(
    kind: &str,
    conversation_id: &str,
    value: Value,
) -> Result<T, CodecError> {
    value.deserialized().map_err(|e| CodecError::InvalidBody {
        kind: kind.to_string(),
        conversation_id: conversation_id.to_string(),
        reason: e.to_string(),
    })
}

#[derive(Serialize, Deserialize)]
struct WireEnvelope {
    #[serde(
        rename = "conversationId",
        default,
        skip_serializing_if = "String::is_empty"
    )]
    conversation_id: String,
    #[serde(rename = "stanzaId", default)]
    stanza_id: i32,
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    body: Option<Value>,
}

/// The unit exchanged on every duplex connection.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Empty for agent-control traffic.
    pub conversation_id: String,
    /// Per-connection causal tag assigned by the sending endpoint.
    pub stanza_id: i32,
    pub body: Body,
}

impl Envelope {
    pub fn new(conversation_id: impl Into<String>, stanza_id: i32, body: Body) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            stanza_id,
            body,
        }
    }

    pub fn type_tag(&self) -> &str {
        self.body.type_tag()
    }

    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let wire = WireEnvelope {
            conversation_id: self.conversation_id.clone(),
            stanza_id: self.stanza_id,
            kind: self.body.type_tag().to_string(),
            body: Some(self.body.to_value()?),
        };
        let mut buf = Vec::new();
        ciborium::into_writer(&wire, &mut buf).map_err(|e| CodecError::Encode(e.to_string()))?;
        Ok(buf)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        Self::decode_with_limit(bytes, DEFAULT_MAX_ENVELOPE_BYTES)
    }

    pub fn decode_with_limit(bytes: &[u8], max_len: usize) -> Result<Self, CodecError> {
        if bytes.len() > max_len {
            return Err(CodecError::TooLarge {
                len: bytes.len(),
                max: max_len,
            });
        }
        let wire: WireEnvelope =
            ciborium::from_reader(bytes).map_err(|e| CodecError::Malformed(e.to_string()))?;
        let body = Body::from_wire(&wire.kind, &wire.conversation_id, wire.body)?;
        Ok(Self {
            conversation_id: wire.conversation_id,
            stanza_id: wire.stanza_id,
            body,
        })
    }
}
