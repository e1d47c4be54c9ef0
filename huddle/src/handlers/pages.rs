//! Landing and info pages. No template engine: the landing page is a static
//! shell and room/stream pages answer with JSON.

use axum::extract::{Path, State};
use axum::response::{Html, IntoResponse, Redirect};
use axum::Json;
use serde_json::json;
use uuid::Uuid;

use huddle_core::models::RoomId;

use crate::server::AppState;

pub async fn welcome() -> Html<&'static str> {
    Html(
        "<!doctype html><html><head><title>huddle</title></head>\
         <body><h1>huddle</h1>\
         <p><a href=\"/room/create\">Create a room</a></p>\
         </body></html>",
    )
}

/// Allocate a fresh room id and send the client there.
pub async fn room_create() -> Redirect {
    Redirect::to(&format!("/room/{}", Uuid::new_v4()))
}

/// Room info. Visiting the page materializes the room.
pub async fn room_info(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let room = state.registry.create_room(&RoomId::from(id.clone()));
    let participants = room.peers.connection_count().await;
    Json(json!({"roomId": id, "participants": participants}))
}

/// Stream info. Visiting the page materializes the stream.
pub async fn stream_info(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let stream = state.registry.create_stream(&RoomId::from(id.clone()));
    let viewers = stream.peers.connection_count().await;
    Json(json!({"streamId": id, "viewers": viewers}))
}
