//! Room WebSocket endpoints: signaling, chat, viewer count.

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures_util::StreamExt;
use tracing::error;

use huddle_core::models::RoomId;
use huddle_core::signal::ClientWriter;
use huddle_sfu::Session;

use super::{run_chat_socket, run_viewer_ticker, spawn_socket_pump};
use crate::server::AppState;

/// `GET /room/{id}/websocket` — the signaling channel.
pub async fn room_websocket(
    State(state): State<AppState>,
    Path(id): Path<String>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_room_socket(socket, state, id))
}

async fn handle_room_socket(socket: WebSocket, state: AppState, id: String) {
    let room = state.registry.create_room(&RoomId::from(id));
    let (writer, writer_rx) = ClientWriter::channel();
    let (sink, mut inbound) = socket.split();
    let pump = spawn_socket_pump(sink, writer_rx);

    let session = match Session::join(room, &state.stun_servers, writer.clone()).await {
        Ok(Some(session)) => session,
        Ok(None) => {
            // Locked: the rejection frame is already queued and the writer
            // closed, so the pump flushes and closes the socket.
            let _ = pump.await;
            return;
        }
        Err(e) => {
            error!(error = %e, "room join failed");
            writer.close();
            let _ = pump.await;
            return;
        }
    };

    while let Some(Ok(frame)) = inbound.next().await {
        match frame {
            Message::Text(text) => session.handle_message(text.as_str()).await,
            Message::Close(_) => break,
            _ => {}
        }
    }

    session.leave().await;
    writer.close();
    let _ = pump.await;
}

/// `GET /room/{id}/chat/websocket` — the chat channel; the room must exist.
pub async fn room_chat_websocket(
    State(state): State<AppState>,
    Path(id): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    match state.registry.get_room(&RoomId::from(id)) {
        Some(room) => ws
            .on_upgrade(move |socket| run_chat_socket(socket, room))
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// `GET /room/{id}/viewer/websocket` — periodic participant counts.
pub async fn room_viewer_websocket(
    State(state): State<AppState>,
    Path(id): Path<String>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let room = state.registry.create_room(&RoomId::from(id));
    ws.on_upgrade(move |socket| run_viewer_ticker(socket, room))
}
