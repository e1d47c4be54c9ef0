//! Stream WebSocket endpoints: one-to-many variants of the room endpoints.

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures_util::StreamExt;
use tracing::error;

use huddle_core::models::RoomId;
use huddle_core::signal::ClientWriter;
use huddle_sfu::StreamSession;

use super::{run_chat_socket, run_viewer_ticker, spawn_socket_pump};
use crate::server::AppState;

/// `GET /stream/{id}/websocket` — publisher/viewer signaling.
pub async fn stream_websocket(
    State(state): State<AppState>,
    Path(id): Path<String>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_stream_socket(socket, state, id))
}

async fn handle_stream_socket(socket: WebSocket, state: AppState, id: String) {
    let stream = state.registry.create_stream(&RoomId::from(id));
    let (writer, writer_rx) = ClientWriter::channel();
    let (sink, mut inbound) = socket.split();
    let pump = spawn_socket_pump(sink, writer_rx);

    let session = match StreamSession::join(stream, &state.stun_servers, writer.clone()).await {
        Ok(session) => session,
        Err(e) => {
            error!(error = %e, "stream join failed");
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

/// `GET /stream/{id}/chat/websocket` — the chat channel; the stream must exist.
pub async fn stream_chat_websocket(
    State(state): State<AppState>,
    Path(id): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    match state.registry.get_stream(&RoomId::from(id)) {
        Some(stream) => ws
            .on_upgrade(move |socket| run_chat_socket(socket, stream))
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// `GET /stream/{id}/viewer/websocket` — periodic viewer counts.
pub async fn stream_viewer_websocket(
    State(state): State<AppState>,
    Path(id): Path<String>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let stream = state.registry.create_stream(&RoomId::from(id));
    ws.on_upgrade(move |socket| run_viewer_ticker(socket, stream))
}
