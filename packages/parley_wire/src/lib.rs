//! Wire protocol for parley's multiplexed conversation sync.
//!
//! Every duplex connection exchanges [`Envelope`]s: one CBOR record per
//! websocket binary frame, carrying a conversation id, a per-connection stanza
//! id, a type tag, and a body whose shape depends on the tag. Tags the server
//! does not interpret decode to [`Body::Passthrough`] and are routed untouched.

pub mod body;
pub mod envelope;

pub use body::{
    ConflictDetails, ErrorBody, GenerationKind, MessageView, ResponseGenerationRequest,
    SubscribeAck, SubscribeRequest, SyncMessageRequest, SyncOutcome, SyncRequest, SyncResponse,
    SyncedMessage, UnsubscribeAck, UnsubscribeRequest, error_codes,
};
pub use envelope::{Body, CodecError, DEFAULT_MAX_ENVELOPE_BYTES, Envelope, Passthrough, tags};
