//! Connection pump pair.
//!
//! A read pump decoding and dispatching frames, and a write pump sending
//! liveness pings, joined under one cancellation token. Cleanup runs once
//! after both have stopped, whichever side noticed the failure first.

use std::fmt::Display;
use std::sync::Arc;

use axum::extract::ws::Message;
use futures::{Sink, Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::connection::Connection;
use super::dispatch::{ConnectionContext, dispatch_frame};
use super::sink::WsFrameSink;

/// Run a duplex connection to completion.
///
/// Generic over the socket halves so tests can drive it with channels; the
/// websocket handler passes the two halves of `WebSocket::split()`.
pub async fn serve_connection<S, R, E>(sink: S, mut stream: R, ctx: ConnectionContext)
where
    S: Sink<Message> + Unpin + Send + 'static,
    S::Error: Display,
    R: Stream<Item = Result<Message, E>> + Unpin + Send,
    E: Display + Send,
{
    let cancel = CancellationToken::new();
    let ws_sink = Arc::new(WsFrameSink::new(sink, cancel.clone()));
    let conn = Connection::new(ws_sink.clone());

    ctx.metrics.connection_opened();
    info!(conn_id = %conn.id, "Duplex connection opened");

    let read_pump = async {
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => break,
                next = tokio::time::timeout(ctx.config.read_timeout, stream.next()) => next,
            };

            match next {
                Err(_) => {
                    info!(conn_id = %conn.id, "Read deadline exceeded");
                    break;
                }
                Ok(None) | Ok(Some(Ok(Message::Close(_)))) => break,
                Ok(Some(Err(e))) => {
                    debug!(conn_id = %conn.id, "Read error: {}", e);
                    break;
                }
                Ok(Some(Ok(Message::Binary(frame)))) => {
                    if let Err(e) = dispatch_frame(&conn, frame, &ctx).await {
                        warn!(conn_id = %conn.id, "Reply write failed: {}", e);
                        ctx.metrics.write_failed();
                        break;
                    }
                }
                // Text, ping and pong only re-arm the read deadline
                Ok(Some(Ok(_))) => {}
            }
        }
        cancel.cancel();
    };

    let write_pump = async {
        let mut ticker = tokio::time::interval(ctx.config.ping_interval);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    match tokio::time::timeout(ctx.config.write_timeout, ws_sink.send_ping()).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => {
                            debug!(conn_id = %conn.id, "Ping failed: {}", e);
                            break;
                        }
                        Err(_) => {
                            warn!(conn_id = %conn.id, "Ping write timed out");
                            break;
                        }
                    }
                }
            }
        }
        cancel.cancel();
    };

    tokio::join!(read_pump, write_pump);

    let left = ctx.registry.remove_connection(&conn).await;
    if tokio::time::timeout(ctx.config.write_timeout, ws_sink.shutdown())
        .await
        .is_err()
    {
        debug!(conn_id = %conn.id, "Socket close timed out");
    }
    ctx.metrics.connection_closed();
    info!(
        conn_id = %conn.id,
        conversations = left,
        "Duplex connection closed"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WebSocketConfig;
    use crate::test_helpers::test_app_state;
    use crate::AppState;
    use bytes::Bytes;
    use futures::SinkExt;
    use futures::channel::mpsc;
    use parley_wire::{
        Body, Envelope, GenerationKind, Passthrough, ResponseGenerationRequest, SubscribeRequest,
        SyncMessageRequest, SyncOutcome, SyncRequest, UnsubscribeRequest, error_codes, tags,
    };
    use std::time::Duration;
    use tokio::task::JoinHandle;

    struct TestClient {
        tx: mpsc::UnboundedSender<Result<Message, String>>,
        rx: mpsc::UnboundedReceiver<Message>,
        task: JoinHandle<()>,
    }

    impl TestClient {
        fn connect(ctx: ConnectionContext) -> Self {
            let (tx, server_rx) = mpsc::unbounded();
            let (server_tx, rx) = mpsc::unbounded();
            let task = tokio::spawn(serve_connection(server_tx, server_rx, ctx));
            Self { tx, rx, task }
        }

        async fn send(&mut self, envelope: Envelope) {
            self.send_raw(envelope.encode().unwrap()).await;
        }

        async fn send_raw(&mut self, bytes: Vec<u8>) {
            self.tx
                .send(Ok(Message::Binary(Bytes::from(bytes))))
                .await
                .unwrap();
        }

        async fn recv(&mut self) -> Envelope {
            loop {
                let msg = tokio::time::timeout(Duration::from_secs(2), self.rx.next())
                    .await
                    .expect("timed out waiting for a frame")
                    .expect("connection closed");
                if let Message::Binary(frame) = msg {
                    return Envelope::decode(&frame).unwrap();
                }
            }
        }

        async fn expect_silence(&mut self) {
            let next = tokio::time::timeout(Duration::from_millis(50), self.rx.next()).await;
            assert!(
                !matches!(next, Ok(Some(Message::Binary(_)))),
                "unexpected frame"
            );
        }

        async fn subscribe(&mut self, conversation_id: &str) {
            self.send(Envelope::new(
                conversation_id,
                1,
                Body::Subscribe(SubscribeRequest {
                    conversation_id: conversation_id.into(),
                    agent_mode: false,
                }),
            ))
            .await;
            match self.recv().await.body {
                Body::SubscribeAck(ack) => assert!(ack.success),
                other => panic!("expected subscribe_ack, got {:?}", other),
            }
        }

        async fn become_agent(&mut self) {
            self.send(Envelope::new(
                "",
                1,
                Body::Subscribe(SubscribeRequest {
                    conversation_id: String::new(),
                    agent_mode: true,
                }),
            ))
            .await;
            match self.recv().await.body {
                Body::SubscribeAck(ack) => assert!(ack.success),
                other => panic!("expected subscribe_ack, got {:?}", other),
            }
        }

        async fn close(self) {
            drop(self.tx);
            tokio::time::timeout(Duration::from_secs(2), self.task)
                .await
                .expect("pump did not exit")
                .unwrap();
        }
    }

    fn sync_request(local_id: &str, contents: &str) -> Body {
        Body::SyncRequest(SyncRequest {
            messages: vec![SyncMessageRequest {
                local_id: local_id.into(),
                sequence_number: 1,
                role: "user".into(),
                contents: contents.into(),
                created_at: "2024-05-01T10:00:00Z".into(),
                ..Default::default()
            }],
        })
    }

    fn passthrough(kind: &str) -> Body {
        let mut body = Vec::new();
        ciborium::into_writer(&ciborium::Value::Text("chunk".into()), &mut body).unwrap();
        Body::Passthrough(Passthrough {
            kind: kind.into(),
            body,
        })
    }

    async fn context() -> (AppState, ConnectionContext) {
        let state = test_app_state().await;
        let ctx = state.connection_context();
        (state, ctx)
    }

    #[tokio::test]
    async fn subscribe_is_acked_with_decreasing_stanzas() {
        let (state, ctx) = context().await;
        let mut client = TestClient::connect(ctx);

        client
            .send(Envelope::new(
                "conv_a",
                7,
                Body::Subscribe(SubscribeRequest::default()),
            ))
            .await;
        let ack = client.recv().await;
        assert_eq!(ack.stanza_id, -1);
        match ack.body {
            Body::SubscribeAck(ack) => {
                assert!(ack.success);
                assert_eq!(ack.conversation_id, "conv_a");
            }
            other => panic!("expected subscribe_ack, got {:?}", other),
        }
        assert_eq!(state.registry.subscriber_count("conv_a").await, 1);

        client
            .send(Envelope::new(
                "",
                8,
                Body::Unsubscribe(UnsubscribeRequest {
                    conversation_id: "conv_a".into(),
                }),
            ))
            .await;
        let ack = client.recv().await;
        assert_eq!(ack.stanza_id, -2);
        assert!(matches!(ack.body, Body::UnsubscribeAck(ref a) if a.success));
        assert_eq!(state.registry.conversation_count().await, 0);

        client.close().await;
    }

    #[tokio::test]
    async fn subscribe_without_conversation_is_refused() {
        let (state, ctx) = context().await;
        let mut client = TestClient::connect(ctx);

        client
            .send(Envelope::new("", 1, Body::Subscribe(SubscribeRequest::default())))
            .await;
        match client.recv().await.body {
            Body::SubscribeAck(ack) => {
                assert!(!ack.success);
                assert_eq!(ack.error.as_deref(), Some("Conversation ID required"));
            }
            other => panic!("expected subscribe_ack, got {:?}", other),
        }
        assert_eq!(state.registry.conversation_count().await, 0);
        client.close().await;
    }

    #[tokio::test]
    async fn sync_requires_subscription() {
        let (_state, ctx) = context().await;
        let mut client = TestClient::connect(ctx);

        client
            .send(Envelope::new("conv_a", 1, sync_request("L1", "hi")))
            .await;
        let reply = client.recv().await;
        assert_eq!(reply.conversation_id, "conv_a");
        match reply.body {
            Body::Error(err) => {
                assert_eq!(err.code, error_codes::NOT_SUBSCRIBED);
                assert_eq!(err.message, "Not subscribed to conversation");
            }
            other => panic!("expected error, got {:?}", other),
        }
        client.close().await;
    }

    #[tokio::test]
    async fn sync_to_missing_or_archived_conversation_is_refused() {
        let (state, ctx) = context().await;
        let mut client = TestClient::connect(ctx);
        client.subscribe("conv_nope").await;
        client.subscribe("conv_archived").await;

        client
            .send(Envelope::new("conv_nope", 2, sync_request("L1", "hi")))
            .await;
        match client.recv().await.body {
            Body::Error(err) => assert_eq!(err.code, error_codes::CONVERSATION_NOT_FOUND),
            other => panic!("expected error, got {:?}", other),
        }

        client
            .send(Envelope::new("conv_archived", 3, sync_request("L2", "hi")))
            .await;
        let reply = client.recv().await;
        assert_eq!(reply.conversation_id, "conv_archived");
        match reply.body {
            Body::Error(err) => {
                assert_eq!(err.code, error_codes::CONVERSATION_INACTIVE);
                assert_eq!(err.message, "Conversation is not active");
            }
            other => panic!("expected error, got {:?}", other),
        }

        assert!(
            state
                .repository
                .list_messages("conv_archived")
                .await
                .unwrap()
                .is_empty()
        );
        assert!(
            state
                .repository
                .get_message_by_local_id("L1")
                .await
                .unwrap()
                .is_none()
        );
        client.close().await;
    }

    #[tokio::test]
    async fn sync_replies_and_fans_out_to_subscribers() {
        let (_state, ctx) = context().await;
        let mut writer = TestClient::connect(ctx.clone());
        let mut watcher = TestClient::connect(ctx);
        writer.subscribe("conv_a").await;
        watcher.subscribe("conv_a").await;

        writer
            .send(Envelope::new("conv_a", 2, sync_request("L1", "hi")))
            .await;

        // The response and the fan-out race on the writer's socket.
        let mut response = None;
        for _ in 0..2 {
            let envelope = writer.recv().await;
            if let Body::SyncResponse(r) = envelope.body {
                assert!(envelope.stanza_id < 0);
                response = Some(r);
            }
        }
        let response = response.expect("no sync_response");
        assert_eq!(response.synced_messages.len(), 1);
        let result = &response.synced_messages[0];
        assert_eq!(result.status, SyncOutcome::Synced);
        let server_id = result.server_id.clone().unwrap();

        let pushed = watcher.recv().await;
        assert_eq!(pushed.stanza_id, 0);
        assert_eq!(pushed.type_tag(), tags::MESSAGE);
        match pushed.body {
            Body::Message(view) => {
                assert_eq!(view.id, server_id);
                assert_eq!(view.contents, "hi");
            }
            other => panic!("expected message, got {:?}", other),
        }

        writer.close().await;
        watcher.close().await;
    }

    #[tokio::test]
    async fn undecodable_frame_keeps_connection_open() {
        let (state, ctx) = context().await;
        let mut client = TestClient::connect(ctx);

        client.send_raw(vec![0xff, 0x00, 0x13]).await;
        match client.recv().await.body {
            Body::Error(err) => {
                assert_eq!(err.code, error_codes::INVALID_MESSAGE);
                assert_eq!(err.message, "Failed to decode message");
            }
            other => panic!("expected error, got {:?}", other),
        }

        client.subscribe("conv_a").await;
        assert_eq!(state.metrics.snapshot().envelopes.decode_errors, 1);
        client.close().await;
    }

    #[tokio::test]
    async fn passthrough_reaches_subscribers_only_when_sender_subscribed() {
        let (_state, ctx) = context().await;
        let mut sender = TestClient::connect(ctx.clone());
        let mut peer = TestClient::connect(ctx);
        peer.subscribe("conv_a").await;

        let chunk = Envelope::new("conv_a", 3, passthrough(tags::ASSISTANT_SENTENCE));
        sender.send(chunk.clone()).await;
        peer.expect_silence().await;

        sender.subscribe("conv_a").await;
        sender.send(chunk.clone()).await;
        assert_eq!(peer.recv().await, chunk);
        // Non-agent senders hear their own traffic.
        assert_eq!(sender.recv().await, chunk);

        sender.close().await;
        peer.close().await;
    }

    #[tokio::test]
    async fn agent_traffic_is_not_echoed_and_receives_generation_requests() {
        let (state, ctx) = context().await;
        let mut agent = TestClient::connect(ctx.clone());
        let mut client = TestClient::connect(ctx);
        agent.become_agent().await;
        client.subscribe("conv_a").await;
        assert!(state.registry.is_agent_connected().await);

        let answer = Envelope::new("conv_a", 4, passthrough(tags::ASSISTANT_MESSAGE));
        agent.send(answer.clone()).await;
        assert_eq!(client.recv().await, answer);
        agent.expect_silence().await;

        let route = state
            .notifier
            .route_generation(ResponseGenerationRequest {
                id: "req_1".into(),
                message_id: "msg_1".into(),
                conversation_id: "conv_a".into(),
                request_type: GenerationKind::Send,
                previous_id: None,
                new_content: None,
                enable_tools: false,
                enable_reasoning: false,
                enable_streaming: true,
                timestamp: 0,
            })
            .await;
        assert_eq!(route, crate::ws::AgentRoute::Delivered);
        assert_eq!(
            agent.recv().await.type_tag(),
            tags::RESPONSE_GENERATION_REQUEST
        );

        agent.close().await;
        assert!(!state.registry.is_agent_connected().await);
        client.close().await;
    }

    #[tokio::test]
    async fn disconnect_removes_every_subscription() {
        let (state, ctx) = context().await;
        let mut client = TestClient::connect(ctx);
        client.subscribe("conv_a").await;
        client.subscribe("conv_b").await;
        assert_eq!(state.registry.conversation_count().await, 2);
        assert_eq!(state.metrics.snapshot().connections.active, 1);

        client.close().await;
        assert_eq!(state.registry.conversation_count().await, 0);
        assert_eq!(state.metrics.snapshot().connections.active, 0);
    }

    #[tokio::test]
    async fn silent_peer_hits_read_deadline() {
        let (state, mut ctx) = context().await;
        ctx.config = WebSocketConfig {
            read_timeout: Duration::from_millis(100),
            ..ctx.config
        };
        let mut client = TestClient::connect(ctx);
        client.subscribe("conv_a").await;

        let task = client.task;
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("pump ignored read deadline")
            .unwrap();
        assert_eq!(state.registry.conversation_count().await, 0);
        drop(client.tx);
    }

    #[tokio::test]
    async fn write_pump_pings_on_interval() {
        let (_state, mut ctx) = context().await;
        ctx.config = WebSocketConfig {
            ping_interval: Duration::from_millis(20),
            ..ctx.config
        };
        let mut client = TestClient::connect(ctx);

        let first = tokio::time::timeout(Duration::from_secs(2), client.rx.next())
            .await
            .unwrap();
        assert!(matches!(first, Some(Message::Ping(_))));
        client.close().await;
    }
}
