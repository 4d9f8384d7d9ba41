//! Outbound half of a duplex connection.

use std::fmt::Display;

use async_trait::async_trait;
use axum::extract::ws::Message;
use bytes::Bytes;
use futures::{Sink, SinkExt};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("connection closed")]
    Closed,
    #[error("write timed out")]
    Timeout,
    #[error("transport error: {0}")]
    Transport(String),
}

/// Where the registry writes encoded envelopes.
///
/// Callers bound each `send_frame` with their own deadline.
#[async_trait]
pub trait FrameSink: Send + Sync {
    async fn send_frame(&self, frame: Bytes) -> Result<(), SinkError>;

    /// Ask the owning connection to shut down. Must not block.
    fn close(&self);
}

/// `FrameSink` over the write half of a websocket.
///
/// Writes are serialized by a mutex; `close` only fires the connection's
/// cancellation token so a stuck writer cannot wedge the caller.
pub struct WsFrameSink<S> {
    inner: Mutex<S>,
    cancel: CancellationToken,
}

impl<S> WsFrameSink<S>
where
    S: Sink<Message> + Unpin + Send,
    S::Error: Display,
{
    pub fn new(inner: S, cancel: CancellationToken) -> Self {
        Self {
            inner: Mutex::new(inner),
            cancel,
        }
    }

    async fn send_message(&self, msg: Message) -> Result<(), SinkError> {
        if self.cancel.is_cancelled() {
            return Err(SinkError::Closed);
        }
        let mut inner = self.inner.lock().await;
        inner
            .send(msg)
            .await
            .map_err(|e| SinkError::Transport(e.to_string()))
    }

    pub async fn send_ping(&self) -> Result<(), SinkError> {
        self.send_message(Message::Ping(Bytes::new())).await
    }

    /// Close the underlying socket. Used by the pump once both halves stop.
    pub async fn shutdown(&self) {
        let mut inner = self.inner.lock().await;
        let _ = inner.close().await;
    }
}

#[async_trait]
impl<S> FrameSink for WsFrameSink<S>
where
    S: Sink<Message> + Unpin + Send + 'static,
    S::Error: Display,
{
    async fn send_frame(&self, frame: Bytes) -> Result<(), SinkError> {
        self.send_message(Message::Binary(frame)).await
    }

    fn close(&self) {
        self.cancel.cancel();
    }
}
