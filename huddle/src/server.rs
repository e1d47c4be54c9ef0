//! Router assembly and server lifecycle.

use anyhow::Result;
use axum::{routing::get, Router};
use axum_server::tls_rustls::RustlsConfig;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use huddle_core::Config;
use huddle_sfu::Registry;

use crate::handlers;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Registry>,
    pub stun_servers: Vec<String>,
}

/// Create the HTTP router with all routes
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(handlers::welcome))
        .route("/room/create", get(handlers::room_create))
        .route("/room/{id}", get(handlers::room_info))
        .route("/room/{id}/websocket", get(handlers::room_websocket))
        .route("/room/{id}/chat/websocket", get(handlers::room_chat_websocket))
        .route("/room/{id}/viewer/websocket", get(handlers::room_viewer_websocket))
        .route("/stream/{id}", get(handlers::stream_info))
        .route("/stream/{id}/websocket", get(handlers::stream_websocket))
        .route("/stream/{id}/chat/websocket", get(handlers::stream_chat_websocket))
        .route("/stream/{id}/viewer/websocket", get(handlers::stream_viewer_websocket))
        .with_state(state)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}

/// Start background tasks and serve until shutdown.
pub async fn run(config: Config, listen_addr: &str) -> Result<()> {
    let registry = Registry::new();
    registry.spawn_keyframe_dispatcher();
    registry.spawn_empty_sweep();

    let state = AppState {
        registry,
        stun_servers: config.webrtc.stun_servers.clone(),
    };
    let router = create_router(state);

    let addr: SocketAddr = listen_addr
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid listen address {listen_addr}: {e}"))?;

    if config.server.tls_enabled() {
        let cert = config.server.cert.as_deref().unwrap_or_default();
        let key = config.server.key.as_deref().unwrap_or_default();
        let tls = RustlsConfig::from_pem_file(cert, key)
            .await
            .map_err(|e| anyhow::anyhow!("failed to load TLS material: {e}"))?;
        info!(%addr, "serving with TLS");
        axum_server::bind_rustls(addr, tls)
            .serve(router.into_make_service())
            .await?;
    } else {
        info!(%addr, "serving");
        axum_server::bind(addr)
            .serve(router.into_make_service())
            .await?;
    }

    Ok(())
}
