//! Multiplexed duplex transport
//!
//! One websocket per client carrying CBOR envelopes for any number of
//! conversations:
//! - subscribe/unsubscribe join and leave conversation fan-out
//! - sync requests go through the reconciler
//! - everything else is routed to the conversation's subscribers untouched

pub mod connection;
mod dispatch;
mod pump;
pub mod registry;
pub mod sink;

pub use connection::ConnectionId;
pub use dispatch::ConnectionContext;
pub use pump::serve_connection;
pub use registry::{AgentRoute, BroadcastRegistry};
