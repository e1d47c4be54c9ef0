//! Peer-connection factory.

use anyhow::Result;
use std::sync::Arc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::RTCPeerConnection;

/// Create a new `RTCPeerConnection` with default codecs and interceptors
/// and the configured STUN servers.
pub async fn new_peer_connection(stun_servers: &[String]) -> Result<Arc<RTCPeerConnection>> {
    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs()?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine)?;

    let api = APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build();

    let ice_servers = if stun_servers.is_empty() {
        Vec::new()
    } else {
        vec![RTCIceServer {
            urls: stun_servers.to_vec(),
            ..Default::default()
        }]
    };

    let config = RTCConfiguration {
        ice_servers,
        ..Default::default()
    };

    let pc = api.new_peer_connection(config).await?;
    Ok(Arc::new(pc))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_peer_connection_construction() {
        let pc = new_peer_connection(&["stun:stun.l.google.com:19302".to_string()])
            .await
            .unwrap();
        let offer = pc.create_offer(None).await.unwrap();
        assert!(!offer.sdp.is_empty());
        pc.close().await.unwrap();
    }
}
