//! The per-room peer set: signaling connections, relay tracks and the
//! renegotiation engine.

use anyhow::Result;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, warn};
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use huddle_core::models::PeerId;
use huddle_core::signal::{ClientWriter, SignalMessage};

/// Renegotiation attempts before giving up and scheduling a delayed retry
const SYNC_ATTEMPTS: usize = 25;
/// Delay before the single retry after an exhausted renegotiation pass
const SYNC_RETRY_DELAY: Duration = Duration::from_secs(3);

/// One signaling connection and its peer connection.
pub struct PeerConnectionState {
    pub pc: Arc<RTCPeerConnection>,
    pub writer: ClientWriter,
    pub peer_id: PeerId,
}

/// Connections and relay tracks, guarded together so renegotiation always
/// sees a consistent snapshot. Connection iteration order is insertion
/// order.
#[derive(Default)]
struct Inner {
    connections: Vec<PeerConnectionState>,
    track_locals: HashMap<String, Arc<TrackLocalStaticRTP>>,
}

/// Tracks-and-connections registry for one room.
pub struct PeerSet {
    list: RwLock<Inner>,
}

impl PeerSet {
    #[must_use]
    pub fn new() -> Self {
        Self {
            list: RwLock::new(Inner::default()),
        }
    }

    pub async fn add_peer_connection(
        &self,
        pc: Arc<RTCPeerConnection>,
        writer: ClientWriter,
        peer_id: PeerId,
    ) {
        let mut inner = self.list.write().await;
        inner.connections.push(PeerConnectionState { pc, writer, peer_id });
    }

    /// Splice out a connection by peer-connection identity.
    pub async fn remove_peer_connection(&self, pc: &Arc<RTCPeerConnection>) {
        let mut inner = self.list.write().await;
        if let Some(idx) = inner
            .connections
            .iter()
            .position(|c| Arc::ptr_eq(&c.pc, pc))
        {
            let state = inner.connections.remove(idx);
            debug!(peer = %state.peer_id, "removed peer connection");
        }
    }

    /// Remove a peer by id, closing both its peer connection and its
    /// signaling writer.
    pub async fn remove_peer(&self, peer_id: &PeerId) {
        let mut inner = self.list.write().await;
        if let Some(idx) = inner.connections.iter().position(|c| &c.peer_id == peer_id) {
            let state = inner.connections.remove(idx);
            if let Err(e) = state.pc.close().await {
                debug!(peer = %peer_id, error = %e, "error closing removed peer connection");
            }
            state.writer.close();
            debug!(peer = %peer_id, "removed peer");
        }
    }

    pub async fn connection_count(&self) -> usize {
        self.list.read().await.connections.len()
    }

    pub async fn peer_ids(&self) -> Vec<PeerId> {
        self.list
            .read()
            .await
            .connections
            .iter()
            .map(|c| c.peer_id.clone())
            .collect()
    }

    /// Allocate a relay track mirroring `remote` and register it, then
    /// renegotiate every connection. The caller copies RTP from the remote
    /// track into the returned sink until read error and then removes it.
    pub async fn add_track(
        self: &Arc<Self>,
        remote: &Arc<TrackRemote>,
    ) -> Result<Arc<TrackLocalStaticRTP>> {
        let track = {
            let mut inner = self.list.write().await;
            let local = Arc::new(TrackLocalStaticRTP::new(
                remote.codec().capability,
                remote.id(),
                remote.stream_id(),
            ));
            inner.track_locals.insert(remote.id(), Arc::clone(&local));
            local
        };

        self.signal_peer_connections().await;
        Ok(track)
    }

    /// Drop a relay track and renegotiate so subscribers stop receiving it.
    pub async fn remove_track(self: &Arc<Self>, track: &Arc<TrackLocalStaticRTP>) {
        {
            let mut inner = self.list.write().await;
            inner.track_locals.remove(track.id());
        }
        self.signal_peer_connections().await;
    }

    /// Reconcile every connection's senders against the relay-track set and
    /// push fresh offers. Bounded retries; reconciliation races against
    /// ICE/DTLS establishment, so transient failures are expected. When the
    /// budget is exhausted a single delayed retry is scheduled.
    pub async fn signal_peer_connections(self: &Arc<Self>) {
        if self.sync_rounds().await {
            return;
        }

        warn!("renegotiation attempts exhausted, scheduling retry");
        let peers = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(SYNC_RETRY_DELAY).await;
            if !peers.sync_rounds().await {
                warn!("renegotiation retry exhausted, waiting for the next trigger");
            }
        });
    }

    /// Run the bounded attempt loop once. Returns true when a full pass
    /// reconciled every connection.
    async fn sync_rounds(&self) -> bool {
        for _ in 0..SYNC_ATTEMPTS {
            if self.attempt_sync().await {
                self.dispatch_key_frame().await;
                return true;
            }
        }
        false
    }

    /// One reconciliation pass over every connection. Returns true when the
    /// pass completed cleanly, false to retry.
    async fn attempt_sync(&self) -> bool {
        let mut inner = self.list.write().await;

        // Sweep one closed connection per pass and rescan.
        if let Some(idx) = inner
            .connections
            .iter()
            .position(|c| c.pc.connection_state() == RTCPeerConnectionState::Closed)
        {
            let state = inner.connections.remove(idx);
            state.writer.close();
            debug!(peer = %state.peer_id, "swept closed peer connection");
            return false;
        }

        for conn in &inner.connections {
            // Existing senders: drop the stale, remember the attached.
            let mut attached: HashSet<String> = HashSet::new();
            for sender in conn.pc.get_senders().await {
                let Some(track) = sender.track().await else {
                    continue;
                };
                let id = track.id().to_string();
                if inner.track_locals.contains_key(&id) {
                    attached.insert(id);
                } else if conn.pc.remove_track(&sender).await.is_err() {
                    return false;
                }
            }

            // Attach every relay track this connection is missing.
            for (id, local) in &inner.track_locals {
                if attached.contains(id) {
                    continue;
                }
                match conn
                    .pc
                    .add_track(Arc::clone(local) as Arc<dyn TrackLocal + Send + Sync>)
                    .await
                {
                    Ok(sender) => spawn_rtcp_drain(sender),
                    Err(_) => return false,
                }
            }

            let offer = match conn.pc.create_offer(None).await {
                Ok(offer) => offer,
                Err(e) => {
                    debug!(peer = %conn.peer_id, error = %e, "create_offer failed");
                    return false;
                }
            };
            let sdp = offer.sdp.clone();
            if conn.pc.set_local_description(offer).await.is_err() {
                return false;
            }

            let msg = SignalMessage::new("offer", json!({ "sdp": sdp }));
            if conn.writer.send(&msg).is_err() {
                return false;
            }
        }

        true
    }

    /// Ask every publisher for a fresh keyframe so new subscribers do not
    /// wait out a full GOP.
    pub async fn dispatch_key_frame(&self) {
        let inner = self.list.read().await;
        for conn in &inner.connections {
            for sender in conn.pc.get_senders().await {
                if sender.track().await.is_none() {
                    continue;
                }
                let pli = PictureLossIndication {
                    sender_ssrc: 0,
                    media_ssrc: 0,
                };
                if let Err(e) = conn.pc.write_rtcp(&[Box::new(pli)]).await {
                    debug!(peer = %conn.peer_id, error = %e, "PLI send failed");
                }
            }
        }
    }

    /// Attach any relay tracks missing from `pc`'s senders. Used when
    /// answering a client-initiated offer.
    pub async fn attach_tracks(&self, pc: &Arc<RTCPeerConnection>) -> Result<()> {
        let inner = self.list.read().await;

        let mut attached: HashSet<String> = HashSet::new();
        for sender in pc.get_senders().await {
            if let Some(track) = sender.track().await {
                attached.insert(track.id().to_string());
            }
        }

        for (id, local) in &inner.track_locals {
            if attached.contains(id) {
                continue;
            }
            let sender = pc
                .add_track(Arc::clone(local) as Arc<dyn TrackLocal + Send + Sync>)
                .await?;
            spawn_rtcp_drain(sender);
        }

        Ok(())
    }

    // ----- broadcast helpers -----

    /// Send to every connection. Write errors are logged and swallowed; a
    /// dead writer is collected when its peer is removed.
    pub async fn broadcast_to_all(&self, msg: &SignalMessage) {
        let inner = self.list.read().await;
        for conn in &inner.connections {
            if let Err(e) = conn.writer.send(msg) {
                debug!(peer = %conn.peer_id, error = %e, "broadcast write failed");
            }
        }
    }

    /// Send to every connection except `exclude`.
    pub async fn broadcast_to_others(&self, msg: &SignalMessage, exclude: &PeerId) {
        let inner = self.list.read().await;
        for conn in &inner.connections {
            if &conn.peer_id == exclude {
                continue;
            }
            if let Err(e) = conn.writer.send(msg) {
                debug!(peer = %conn.peer_id, error = %e, "broadcast write failed");
            }
        }
    }

    /// Unicast to one peer.
    pub async fn send_to_peer(&self, msg: &SignalMessage, peer_id: &PeerId) {
        let inner = self.list.read().await;
        for conn in &inner.connections {
            if &conn.peer_id == peer_id {
                if let Err(e) = conn.writer.send(msg) {
                    debug!(peer = %peer_id, error = %e, "unicast write failed");
                }
                return;
            }
        }
        debug!(peer = %peer_id, "unicast target not found");
    }
}

impl Default for PeerSet {
    fn default() -> Self {
        Self::new()
    }
}

/// Drain RTCP from a sender so interceptor feedback keeps flowing.
fn spawn_rtcp_drain(sender: Arc<RTCRtpSender>) {
    tokio::spawn(async move {
        let mut rtcp_buf = vec![0u8; 1500];
        while let Ok((_, _)) = sender.read(&mut rtcp_buf).await {}
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtc::new_peer_connection;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    async fn next_msg(rx: &mut mpsc::UnboundedReceiver<String>) -> SignalMessage {
        let text = timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for message")
            .expect("writer closed unexpectedly");
        SignalMessage::parse(&text).unwrap()
    }

    async fn add_test_peer(
        peers: &Arc<PeerSet>,
        id: &str,
    ) -> (Arc<RTCPeerConnection>, mpsc::UnboundedReceiver<String>) {
        let pc = new_peer_connection(&[]).await.unwrap();
        let (writer, rx) = ClientWriter::channel();
        peers
            .add_peer_connection(Arc::clone(&pc), writer, PeerId::from(id))
            .await;
        (pc, rx)
    }

    #[tokio::test]
    async fn test_add_and_remove_connections() {
        let peers = Arc::new(PeerSet::new());
        let (pc_a, _rx_a) = add_test_peer(&peers, "a").await;
        let (_pc_b, _rx_b) = add_test_peer(&peers, "b").await;
        assert_eq!(peers.connection_count().await, 2);
        assert_eq!(
            peers.peer_ids().await,
            vec![PeerId::from("a"), PeerId::from("b")]
        );

        peers.remove_peer_connection(&pc_a).await;
        assert_eq!(peers.peer_ids().await, vec![PeerId::from("b")]);

        // Removing an already-removed connection is a no-op.
        peers.remove_peer_connection(&pc_a).await;
        assert_eq!(peers.connection_count().await, 1);
    }

    #[tokio::test]
    async fn test_remove_peer_closes_writer() {
        let peers = Arc::new(PeerSet::new());
        let (_pc, mut rx) = add_test_peer(&peers, "a").await;

        peers.remove_peer(&PeerId::from("a")).await;
        assert_eq!(peers.connection_count().await, 0);

        // Writer channel closes with the peer.
        assert!(timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("channel should close")
            .is_none());
    }

    #[tokio::test]
    async fn test_broadcast_to_others_excludes_sender() {
        let peers = Arc::new(PeerSet::new());
        let (_pc_a, mut rx_a) = add_test_peer(&peers, "a").await;
        let (_pc_b, mut rx_b) = add_test_peer(&peers, "b").await;

        let msg = SignalMessage::new("peer-joined", json!({"peerId": "b"}));
        peers.broadcast_to_others(&msg, &PeerId::from("b")).await;

        assert_eq!(next_msg(&mut rx_a).await.event, "peer-joined");
        assert!(timeout(Duration::from_millis(100), rx_b.recv())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_send_to_peer_is_unicast() {
        let peers = Arc::new(PeerSet::new());
        let (_pc_a, mut rx_a) = add_test_peer(&peers, "a").await;
        let (_pc_b, mut rx_b) = add_test_peer(&peers, "b").await;

        let msg = SignalMessage::new("offer", json!({"sdp": "v=0"}));
        peers.send_to_peer(&msg, &PeerId::from("a")).await;

        assert_eq!(next_msg(&mut rx_a).await.event, "offer");
        assert!(timeout(Duration::from_millis(100), rx_b.recv())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_renegotiation_sends_offers_and_terminates() {
        let peers = Arc::new(PeerSet::new());
        let (_pc_a, mut rx_a) = add_test_peer(&peers, "a").await;
        let (_pc_b, mut rx_b) = add_test_peer(&peers, "b").await;

        peers.signal_peer_connections().await;

        let offer_a = next_msg(&mut rx_a).await;
        assert_eq!(offer_a.event, "offer");
        assert!(offer_a.data_str("sdp").is_some());
        assert_eq!(next_msg(&mut rx_b).await.event, "offer");
    }
}
