//! HTTP and WebSocket handlers.

mod pages;
mod room;
mod stream;

pub use pages::{room_create, room_info, stream_info, welcome};
pub use room::{room_chat_websocket, room_viewer_websocket, room_websocket};
pub use stream::{stream_chat_websocket, stream_viewer_websocket, stream_websocket};

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::warn;

use huddle_core::chat::{MAX_MESSAGE_SIZE, PING_PERIOD, PONG_WAIT, WRITE_WAIT};
use huddle_sfu::Room;

/// Drain a signaling writer's channel into the socket sink. Ends when the
/// writer closes or the socket dies, then closes the sink.
pub(crate) fn spawn_socket_pump(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<String>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    })
}

/// Run one chat connection: register with the room's hub, pump queued
/// messages out with periodic pings, and feed inbound text into the hub's
/// broadcast until the peer goes quiet or misbehaves.
pub(crate) async fn run_chat_socket(socket: WebSocket, room: Arc<Room>) {
    let hub = room.hub.clone();
    let mut client = hub.register();
    let client_id = client.id;
    let (mut sink, mut inbound) = socket.split();

    // Write pump: drain the send queue, ping every PING_PERIOD. Exits when
    // the queue closes (eviction or unregister) or a write fails.
    let write_pump = tokio::spawn(async move {
        let mut ping = tokio::time::interval(PING_PERIOD);
        ping.tick().await; // first tick is immediate
        loop {
            tokio::select! {
                queued = client.recv() => {
                    let Some(text) = queued else { break };
                    let sent = timeout(WRITE_WAIT, sink.send(Message::Text(text.into()))).await;
                    if !matches!(sent, Ok(Ok(()))) {
                        break;
                    }
                }
                _ = ping.tick() => {
                    let sent = timeout(WRITE_WAIT, sink.send(Message::Ping(Vec::new().into()))).await;
                    if !matches!(sent, Ok(Ok(()))) {
                        break;
                    }
                }
            }
        }
        let _ = sink.close().await;
    });

    // Read pump: every frame (pongs included) extends the liveness deadline.
    loop {
        let frame = match timeout(PONG_WAIT, inbound.next()).await {
            Err(_) => break, // deadline passed without any frame
            Ok(None) | Ok(Some(Err(_))) => break,
            Ok(Some(Ok(frame))) => frame,
        };
        match frame {
            Message::Text(text) => {
                if text.len() > MAX_MESSAGE_SIZE {
                    warn!(client = client_id, "oversized chat message, dropping client");
                    break;
                }
                hub.broadcast(text.to_string());
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    hub.unregister(client_id);
    let _ = write_pump.await;
}

/// Emit the participant count every two seconds until the socket dies.
pub(crate) async fn run_viewer_ticker(mut socket: WebSocket, room: Arc<Room>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(2));
    ticker.tick().await; // the first tick fires immediately; skip it
    loop {
        ticker.tick().await;
        let count = room.peers.connection_count().await;
        let msg = json!({"event": "viewer_count", "data": {"count": count}});
        if socket
            .send(Message::Text(msg.to_string().into()))
            .await
            .is_err()
        {
            return;
        }
    }
}
