//! Per-connection signaling: join handshake, event dispatch under the
//! authorization rules, SDP/ICE handling and teardown.

use anyhow::Result;
use serde_json::json;
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::track::track_local::TrackLocalWriter;

use huddle_core::models::PeerId;
use huddle_core::signal::{ClientWriter, SignalMessage};

use crate::room::{JoinDecision, Room};
use crate::rtc::new_peer_connection;

/// RTP relay scratch buffer (MTU-sized)
const RTP_BUFFER: usize = 1400;

/// A participant's signaling connection to a room.
pub struct Session {
    room: Arc<Room>,
    pub peer_id: PeerId,
    pc: Arc<RTCPeerConnection>,
    writer: ClientWriter,
}

impl Session {
    /// Run the join handshake. Returns `None` when the room is locked: the
    /// rejection frame has been written and the writer closed, nothing was
    /// registered.
    pub async fn join(
        room: Arc<Room>,
        stun_servers: &[String],
        writer: ClientWriter,
    ) -> Result<Option<Self>> {
        let peer_id = PeerId::generate();

        match room.admit(&peer_id).await {
            JoinDecision::Locked => {
                info!(room = %room.id, peer = %peer_id, "join rejected, room locked");
                let _ = writer.send(&SignalMessage::new(
                    "room-locked",
                    json!({"message": "This room is locked and not accepting new participants"}),
                ));
                writer.close();
                return Ok(None);
            }
            JoinDecision::Host => {
                info!(room = %room.id, peer = %peer_id, "joining as host");
            }
            JoinDecision::Admitted => {
                debug!(room = %room.id, peer = %peer_id, "joining");
            }
        }

        // Current participants and role info for the new joiner.
        let existing: Vec<String> = room
            .peers
            .peer_ids()
            .await
            .iter()
            .map(|id| id.as_str().to_string())
            .collect();
        let is_host = room.is_host(&peer_id).await;
        let host_id = room
            .host_peer_id()
            .await
            .map(|id| id.as_str().to_string())
            .unwrap_or_default();
        writer.send(&SignalMessage::new(
            "peers",
            json!({
                "peers": existing,
                "yourId": peer_id.as_str(),
                "isHost": is_host,
                "hostId": host_id,
            }),
        ))?;

        let pc = new_peer_connection(stun_servers).await?;

        room.peers
            .add_peer_connection(Arc::clone(&pc), writer.clone(), peer_id.clone())
            .await;

        room.peers
            .broadcast_to_others(
                &SignalMessage::new("peer-joined", json!({"peerId": peer_id.as_str()})),
                &peer_id,
            )
            .await;

        wire_media_relay(&pc, Arc::clone(&room.peers), peer_id.clone());

        Ok(Some(Self {
            room,
            peer_id,
            pc,
            writer,
        }))
    }

    /// Handle one inbound frame. Malformed frames are logged and skipped;
    /// unauthorized admin events are silently dropped.
    pub async fn handle_message(&self, text: &str) {
        let msg = match SignalMessage::parse(text) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(peer = %self.peer_id, error = %e, "malformed signaling message");
                return;
            }
        };

        // Unicast forwarding: the sender's id is stamped on, the target
        // stripped off. Covers offer/answer/candidate between clients.
        if let Some(target) = msg.target_peer_id() {
            debug!(event = %msg.event, from = %self.peer_id, to = %target, "forwarding");
            let forwarded = msg.into_forwarded(self.peer_id.as_str());
            self.room
                .peers
                .send_to_peer(&forwarded, &PeerId::from(target))
                .await;
            return;
        }

        match msg.event.as_str() {
            // Join is performed during the websocket handshake.
            "join" => {}

            // Untargeted SDP/ICE addresses this connection's own peer
            // connection (server-initiated renegotiation completes here).
            "offer" => self.handle_offer(&msg).await,
            "answer" => self.handle_answer(&msg).await,
            "candidate" => self.handle_candidate(&msg).await,

            "request-screen-share" => self.on_request_screen_share(&msg).await,
            "approve-screen-share" => self.on_approve_screen_share(&msg).await,
            "deny-screen-share" => self.on_deny_screen_share(&msg).await,
            "revoke-screen-share" => self.on_revoke_screen_share(&msg).await,
            "screen-share-started" => self.on_screen_share_started(&msg).await,
            "screen-share-stopped" => self.on_screen_share_stopped().await,

            "add-cohost" => self.on_add_co_host(&msg).await,
            "remove-cohost" => self.on_remove_co_host(&msg).await,

            "lock-room" => self.on_lock_room().await,
            "unlock-room" => self.on_unlock_room().await,
            "disable-chat" => self.on_disable_chat().await,
            "enable-chat" => self.on_enable_chat().await,

            "mute-participant" => self.on_mute_participant(&msg).await,
            "unmute-participant" => self.on_unmute_participant(&msg).await,
            "mute-all" => self.on_mute_all().await,
            "unmute-all" => self.on_unmute_all().await,

            "admit-participant" => self.on_admit_participant(&msg).await,
            "deny-participant" => self.on_deny_participant(&msg).await,
            "get-waiting-room" => self.on_get_waiting_room().await,

            "start-recording" => self.on_start_recording().await,
            "stop-recording" => self.on_stop_recording().await,

            "remove-participant" => self.on_remove_participant(&msg).await,

            "raise-hand" => self.on_raise_hand().await,
            "lower-hand" => self.on_lower_hand().await,
            "clear-all-hands" => self.on_clear_all_hands().await,

            "reaction" => self.on_reaction(&msg).await,

            other => debug!(peer = %self.peer_id, event = other, "ignoring unknown event"),
        }
    }

    /// Deferred cleanup, run however the message loop exited: tell the
    /// others, drop the connection from the peer set, close the pc.
    pub async fn leave(&self) {
        self.room
            .peers
            .broadcast_to_others(
                &SignalMessage::new("peer-left", json!({"peerId": self.peer_id.as_str()})),
                &self.peer_id,
            )
            .await;
        self.room.peers.remove_peer_connection(&self.pc).await;
        if let Err(e) = self.pc.close().await {
            debug!(peer = %self.peer_id, error = %e, "error closing peer connection");
        }
        info!(room = %self.room.id, peer = %self.peer_id, "peer left");
    }

    // ----- SDP / ICE toward the server's own pc -----

    async fn handle_offer(&self, msg: &SignalMessage) {
        if let Err(e) = answer_client_offer(&self.room, &self.pc, &self.writer, msg).await {
            warn!(peer = %self.peer_id, error = %e, "failed to answer offer");
        }
    }

    async fn handle_answer(&self, msg: &SignalMessage) {
        if let Err(e) = apply_client_answer(&self.pc, msg).await {
            warn!(peer = %self.peer_id, error = %e, "failed to apply answer");
        }
    }

    async fn handle_candidate(&self, msg: &SignalMessage) {
        if let Err(e) = apply_remote_candidate(&self.pc, msg).await {
            warn!(peer = %self.peer_id, error = %e, "failed to add ICE candidate");
        }
    }

    // ----- screen share -----

    async fn on_request_screen_share(&self, msg: &SignalMessage) {
        if self.room.is_host(&self.peer_id).await {
            // The host always may share.
            self.room.grant_screen_share(&self.peer_id).await;
            self.room
                .peers
                .send_to_peer(
                    &SignalMessage::new("screen-share-response", json!({"approved": true})),
                    &self.peer_id,
                )
                .await;
            return;
        }

        if let Some(host) = self.room.host_peer_id().await {
            let request = SignalMessage::new(
                "screen-share-request",
                json!({
                    "peerId": self.peer_id.as_str(),
                    "peerName": msg.data.get("peerName").cloned().unwrap_or_default(),
                }),
            );
            self.room.peers.send_to_peer(&request, &host).await;
        }
    }

    async fn on_approve_screen_share(&self, msg: &SignalMessage) {
        if !self.room.is_host(&self.peer_id).await {
            return;
        }
        let Some(target) = msg.data_str("peerId").map(PeerId::from) else {
            return;
        };
        self.room.grant_screen_share(&target).await;
        self.room
            .peers
            .send_to_peer(
                &SignalMessage::new("screen-share-response", json!({"approved": true})),
                &target,
            )
            .await;
    }

    async fn on_deny_screen_share(&self, msg: &SignalMessage) {
        if !self.room.is_host(&self.peer_id).await {
            return;
        }
        let Some(target) = msg.data_str("peerId").map(PeerId::from) else {
            return;
        };
        self.room
            .peers
            .send_to_peer(
                &SignalMessage::new("screen-share-response", json!({"approved": false})),
                &target,
            )
            .await;
    }

    async fn on_revoke_screen_share(&self, msg: &SignalMessage) {
        if !self.room.is_host(&self.peer_id).await {
            return;
        }
        let Some(target) = msg.data_str("peerId").map(PeerId::from) else {
            return;
        };
        self.room.revoke_screen_share(&target).await;
        self.room
            .peers
            .send_to_peer(
                &SignalMessage::new("screen-share-revoked", json!({})),
                &target,
            )
            .await;
    }

    async fn on_screen_share_started(&self, msg: &SignalMessage) {
        // Pass the payload through, stamping the sharer's id.
        let mut broadcast = msg.clone().into_forwarded(self.peer_id.as_str());
        broadcast.event = "screen-share-started".to_string();
        self.room
            .peers
            .broadcast_to_others(&broadcast, &self.peer_id)
            .await;
        debug!(peer = %self.peer_id, "screen share started");
    }

    async fn on_screen_share_stopped(&self) {
        self.room
            .peers
            .broadcast_to_others(
                &SignalMessage::new(
                    "screen-share-stopped",
                    json!({"peerId": self.peer_id.as_str()}),
                ),
                &self.peer_id,
            )
            .await;
        debug!(peer = %self.peer_id, "screen share stopped");
    }

    // ----- co-hosts -----

    async fn on_add_co_host(&self, msg: &SignalMessage) {
        if !self.room.is_host_or_co_host(&self.peer_id).await {
            return;
        }
        let Some(target) = msg.data_str("peerId").map(PeerId::from) else {
            return;
        };
        self.room.add_co_host(&target).await;
        self.room
            .peers
            .send_to_peer(
                &SignalMessage::new(
                    "cohost-promoted",
                    json!({"message": "You have been promoted to co-host"}),
                ),
                &target,
            )
            .await;
        self.room
            .peers
            .broadcast_to_others(
                &SignalMessage::new("cohost-added", json!({"peerId": target.as_str()})),
                &self.peer_id,
            )
            .await;
    }

    async fn on_remove_co_host(&self, msg: &SignalMessage) {
        if !self.room.is_host(&self.peer_id).await {
            return;
        }
        let Some(target) = msg.data_str("peerId").map(PeerId::from) else {
            return;
        };
        self.room.remove_co_host(&target).await;
        self.room
            .peers
            .send_to_peer(&SignalMessage::new("cohost-demoted", json!({})), &target)
            .await;
        self.room
            .peers
            .broadcast_to_others(
                &SignalMessage::new("cohost-removed", json!({"peerId": target.as_str()})),
                &self.peer_id,
            )
            .await;
    }

    // ----- room security -----

    async fn on_lock_room(&self) {
        if !self.room.is_host_or_co_host(&self.peer_id).await {
            return;
        }
        self.room.lock().await;
        self.room
            .peers
            .broadcast_to_all(&SignalMessage::new(
                "room-locked",
                json!({"message": "Room has been locked by host"}),
            ))
            .await;
    }

    async fn on_unlock_room(&self) {
        if !self.room.is_host_or_co_host(&self.peer_id).await {
            return;
        }
        self.room.unlock().await;
        self.room
            .peers
            .broadcast_to_all(&SignalMessage::new("room-unlocked", json!({})))
            .await;
    }

    async fn on_disable_chat(&self) {
        if !self.room.is_host_or_co_host(&self.peer_id).await {
            return;
        }
        self.room.disable_chat().await;
        self.room
            .peers
            .broadcast_to_all(&SignalMessage::new(
                "chat-disabled",
                json!({"message": "Chat has been disabled by host"}),
            ))
            .await;
    }

    async fn on_enable_chat(&self) {
        if !self.room.is_host_or_co_host(&self.peer_id).await {
            return;
        }
        self.room.enable_chat().await;
        self.room
            .peers
            .broadcast_to_all(&SignalMessage::new("chat-enabled", json!({})))
            .await;
    }

    // ----- mute -----

    async fn on_mute_participant(&self, msg: &SignalMessage) {
        if !self.room.is_host_or_co_host(&self.peer_id).await {
            return;
        }
        let Some(target) = msg.data_str("peerId").map(PeerId::from) else {
            return;
        };
        self.room.mute_participant(&target).await;
        self.room
            .peers
            .send_to_peer(
                &SignalMessage::new(
                    "muted-by-host",
                    json!({"message": "You have been muted by the host"}),
                ),
                &target,
            )
            .await;
    }

    async fn on_unmute_participant(&self, msg: &SignalMessage) {
        if !self.room.is_host_or_co_host(&self.peer_id).await {
            return;
        }
        let Some(target) = msg.data_str("peerId").map(PeerId::from) else {
            return;
        };
        self.room.unmute_participant(&target).await;
        self.room
            .peers
            .send_to_peer(&SignalMessage::new("unmuted-by-host", json!({})), &target)
            .await;
    }

    async fn on_mute_all(&self) {
        if !self.room.is_host_or_co_host(&self.peer_id).await {
            return;
        }
        self.room.mute_all().await;
        self.room
            .peers
            .broadcast_to_all(&SignalMessage::new(
                "all-muted",
                json!({"message": "All participants have been muted"}),
            ))
            .await;
    }

    async fn on_unmute_all(&self) {
        if !self.room.is_host_or_co_host(&self.peer_id).await {
            return;
        }
        self.room.unmute_all().await;
        self.room
            .peers
            .broadcast_to_all(&SignalMessage::new("all-unmuted", json!({})))
            .await;
    }

    // ----- waiting room -----

    async fn on_admit_participant(&self, msg: &SignalMessage) {
        if !self.room.is_host_or_co_host(&self.peer_id).await {
            return;
        }
        let Some(target) = msg.data_str("peerId").map(PeerId::from) else {
            return;
        };
        if let Some(participant) = self.room.admit_from_waiting_room(&target).await {
            let _ = participant.writer.send(&SignalMessage::new(
                "admitted-to-room",
                json!({"message": "You have been admitted to the meeting"}),
            ));
        }
    }

    async fn on_deny_participant(&self, msg: &SignalMessage) {
        if !self.room.is_host_or_co_host(&self.peer_id).await {
            return;
        }
        let Some(target) = msg.data_str("peerId").map(PeerId::from) else {
            return;
        };
        if let Some(participant) = self.room.remove_from_waiting_room(&target).await {
            participant.writer.close();
        }
    }

    async fn on_get_waiting_room(&self) {
        if !self.room.is_host_or_co_host(&self.peer_id).await {
            return;
        }
        let participants = self.room.waiting_participants().await;
        let _ = self.writer.send(&SignalMessage::new(
            "waiting-room-list",
            json!({"participants": participants}),
        ));
    }

    // ----- recording -----

    async fn on_start_recording(&self) {
        if !self.room.is_host_or_co_host(&self.peer_id).await {
            return;
        }
        self.room.start_recording().await;
        self.room
            .peers
            .broadcast_to_all(&SignalMessage::new(
                "recording-started",
                json!({"message": "This meeting is being recorded"}),
            ))
            .await;
    }

    async fn on_stop_recording(&self) {
        if !self.room.is_host_or_co_host(&self.peer_id).await {
            return;
        }
        let duration = self.room.stop_recording().await;
        self.room
            .peers
            .broadcast_to_all(&SignalMessage::new(
                "recording-stopped",
                json!({"duration": format!("{duration:?}")}),
            ))
            .await;
    }

    // ----- removal -----

    async fn on_remove_participant(&self, msg: &SignalMessage) {
        if !self.room.is_host_or_co_host(&self.peer_id).await {
            return;
        }
        let Some(target) = msg.data_str("peerId").map(PeerId::from) else {
            return;
        };
        self.room
            .peers
            .send_to_peer(
                &SignalMessage::new(
                    "removed-from-room",
                    json!({"message": "You have been removed from the meeting"}),
                ),
                &target,
            )
            .await;
        self.room.peers.remove_peer(&target).await;
    }

    // ----- raised hands & reactions -----

    async fn on_raise_hand(&self) {
        self.room.raise_hand(&self.peer_id).await;
        self.room
            .peers
            .broadcast_to_all(&SignalMessage::new(
                "hand-raised",
                json!({
                    "peerId": self.peer_id.as_str(),
                    "timestamp": chrono::Utc::now().timestamp(),
                }),
            ))
            .await;
        debug!(peer = %self.peer_id, "hand raised");
    }

    async fn on_lower_hand(&self) {
        self.room.lower_hand(&self.peer_id).await;
        self.room
            .peers
            .broadcast_to_all(&SignalMessage::new(
                "hand-lowered",
                json!({"peerId": self.peer_id.as_str()}),
            ))
            .await;
    }

    async fn on_clear_all_hands(&self) {
        if !self.room.is_host_or_co_host(&self.peer_id).await {
            return;
        }
        self.room.clear_all_hands().await;
        self.room
            .peers
            .broadcast_to_all(&SignalMessage::new(
                "all-hands-cleared",
                json!({"message": "All hands have been cleared"}),
            ))
            .await;
    }

    async fn on_reaction(&self, msg: &SignalMessage) {
        let Some(emoji) = msg.data_str("emoji") else {
            return;
        };
        self.room
            .peers
            .broadcast_to_all(&SignalMessage::new(
                "reaction",
                json!({"peerId": self.peer_id.as_str(), "emoji": emoji}),
            ))
            .await;
    }
}

/// A viewer/publisher connection on a stream: no peer protocol, no policy —
/// just the SDP exchange and the relay.
pub struct StreamSession {
    stream: Arc<Room>,
    pc: Arc<RTCPeerConnection>,
    writer: ClientWriter,
}

impl StreamSession {
    pub async fn join(
        stream: Arc<Room>,
        stun_servers: &[String],
        writer: ClientWriter,
    ) -> Result<Self> {
        let peer_id = PeerId::generate();
        let pc = new_peer_connection(stun_servers).await?;

        stream
            .peers
            .add_peer_connection(Arc::clone(&pc), writer.clone(), peer_id.clone())
            .await;

        wire_media_relay(&pc, Arc::clone(&stream.peers), peer_id);

        // Push current tracks to the new connection right away.
        stream.peers.signal_peer_connections().await;

        Ok(Self { stream, pc, writer })
    }

    pub async fn handle_message(&self, text: &str) {
        let msg = match SignalMessage::parse(text) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(stream = %self.stream.id, error = %e, "malformed stream message");
                return;
            }
        };

        match msg.event.as_str() {
            "offer" => {
                if let Err(e) =
                    answer_client_offer(&self.stream, &self.pc, &self.writer, &msg).await
                {
                    warn!(stream = %self.stream.id, error = %e, "failed to answer offer");
                }
            }
            "answer" => {
                if let Err(e) = apply_client_answer(&self.pc, &msg).await {
                    warn!(stream = %self.stream.id, error = %e, "failed to apply answer");
                }
            }
            "candidate" => {
                if let Err(e) = apply_remote_candidate(&self.pc, &msg).await {
                    warn!(stream = %self.stream.id, error = %e, "failed to add ICE candidate");
                }
            }
            other => debug!(stream = %self.stream.id, event = other, "ignoring stream event"),
        }
    }

    pub async fn leave(&self) {
        self.stream.peers.remove_peer_connection(&self.pc).await;
        if let Err(e) = self.pc.close().await {
            debug!(stream = %self.stream.id, error = %e, "error closing peer connection");
        }
    }
}

/// Install the media callbacks: inbound tracks fan out through the peer
/// set's relay, and an ICE failure drops the connection from the set.
fn wire_media_relay(
    pc: &Arc<RTCPeerConnection>,
    peers: Arc<crate::peers::PeerSet>,
    peer_id: PeerId,
) {
    {
        let peers = Arc::clone(&peers);
        let peer_id = peer_id.clone();
        pc.on_track(Box::new(move |remote, _receiver, _transceiver| {
            let peers = Arc::clone(&peers);
            let peer_id = peer_id.clone();
            Box::pin(async move {
                debug!(
                    peer = %peer_id,
                    track = %remote.id(),
                    kind = %remote.kind(),
                    "track received"
                );

                let local = match peers.add_track(&remote).await {
                    Ok(local) => local,
                    Err(e) => {
                        warn!(peer = %peer_id, error = %e, "failed to allocate relay track");
                        return;
                    }
                };

                // Relay RTP until the upstream read fails, then retire the
                // track so subscribers are renegotiated without it.
                tokio::spawn(async move {
                    let mut buf = vec![0u8; RTP_BUFFER];
                    loop {
                        let packet = match remote.read(&mut buf).await {
                            Ok((packet, _)) => packet,
                            Err(_) => break,
                        };
                        if local.write_rtp(&packet).await.is_err() {
                            break;
                        }
                    }
                    peers.remove_track(&local).await;
                });
            })
        }));
    }

    {
        let peers = Arc::clone(&peers);
        let weak_pc: Weak<RTCPeerConnection> = Arc::downgrade(pc);
        pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
            let peers = Arc::clone(&peers);
            let weak_pc = weak_pc.clone();
            let peer_id = peer_id.clone();
            Box::pin(async move {
                debug!(peer = %peer_id, state = %state, "ICE connection state changed");
                if matches!(
                    state,
                    RTCIceConnectionState::Failed | RTCIceConnectionState::Closed
                ) {
                    if let Some(pc) = weak_pc.upgrade() {
                        peers.remove_peer_connection(&pc).await;
                    }
                }
            })
        }));
    }
}

/// Answer a client-initiated offer on the server's pc: set the remote
/// description, make sure every relay track is attached, answer back.
async fn answer_client_offer(
    room: &Arc<Room>,
    pc: &Arc<RTCPeerConnection>,
    writer: &ClientWriter,
    msg: &SignalMessage,
) -> Result<()> {
    let sdp = msg
        .data_str("sdp")
        .ok_or_else(|| anyhow::anyhow!("offer without sdp"))?;

    pc.set_remote_description(RTCSessionDescription::offer(sdp.to_string())?)
        .await?;

    room.peers.attach_tracks(pc).await?;

    let answer = pc.create_answer(None).await?;
    let sdp = answer.sdp.clone();
    pc.set_local_description(answer).await?;

    writer.send(&SignalMessage::new("answer", json!({"sdp": sdp})))?;
    Ok(())
}

async fn apply_client_answer(pc: &Arc<RTCPeerConnection>, msg: &SignalMessage) -> Result<()> {
    let sdp = msg
        .data_str("sdp")
        .ok_or_else(|| anyhow::anyhow!("answer without sdp"))?;
    pc.set_remote_description(RTCSessionDescription::answer(sdp.to_string())?)
        .await?;
    Ok(())
}

/// ICE candidates arrive either as a JSON-encoded string (legacy clients)
/// or as the candidate object itself.
async fn apply_remote_candidate(pc: &Arc<RTCPeerConnection>, msg: &SignalMessage) -> Result<()> {
    let candidate_value = msg
        .data
        .get("candidate")
        .ok_or_else(|| anyhow::anyhow!("candidate without payload"))?;

    let candidate: RTCIceCandidateInit = match candidate_value {
        serde_json::Value::String(s) => serde_json::from_str(s)?,
        other => serde_json::from_value(other.clone())?,
    };

    pc.add_ice_candidate(candidate).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use huddle_core::models::RoomId;
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

    async fn assert_silent(rx: &mut mpsc::UnboundedReceiver<String>) {
        assert!(
            timeout(Duration::from_millis(100), rx.recv()).await.is_err(),
            "expected no message"
        );
    }

    async fn join(room: &Arc<Room>) -> (Session, mpsc::UnboundedReceiver<String>) {
        let (writer, mut rx) = ClientWriter::channel();
        let session = Session::join(Arc::clone(room), &[], writer)
            .await
            .unwrap()
            .expect("join should be admitted");
        // Swallow the join handshake frame.
        let peers = next_msg(&mut rx).await;
        assert_eq!(peers.event, "peers");
        (session, rx)
    }

    #[tokio::test]
    async fn test_host_election_and_second_join() {
        let room = Room::new(RoomId::from("r"));

        let (writer_a, mut rx_a) = ClientWriter::channel();
        let session_a = Session::join(Arc::clone(&room), &[], writer_a)
            .await
            .unwrap()
            .unwrap();
        let peers_a = next_msg(&mut rx_a).await;
        assert_eq!(peers_a.event, "peers");
        assert_eq!(peers_a.data["isHost"], json!(true));
        assert_eq!(peers_a.data["peers"], json!([]));
        assert_eq!(peers_a.data["yourId"], json!(session_a.peer_id.as_str()));

        let (writer_b, mut rx_b) = ClientWriter::channel();
        let session_b = Session::join(Arc::clone(&room), &[], writer_b)
            .await
            .unwrap()
            .unwrap();
        let peers_b = next_msg(&mut rx_b).await;
        assert_eq!(peers_b.data["isHost"], json!(false));
        assert_eq!(peers_b.data["peers"], json!([session_a.peer_id.as_str()]));
        assert_eq!(peers_b.data["hostId"], json!(session_a.peer_id.as_str()));

        let joined = next_msg(&mut rx_a).await;
        assert_eq!(joined.event, "peer-joined");
        assert_eq!(joined.data["peerId"], json!(session_b.peer_id.as_str()));
    }

    #[tokio::test]
    async fn test_locked_room_rejects_with_single_message() {
        let room = Room::new(RoomId::from("r"));
        let (session_a, mut rx_a) = join(&room).await;

        session_a.handle_message(r#"{"event":"lock-room","data":{}}"#).await;
        assert_eq!(next_msg(&mut rx_a).await.event, "room-locked");

        let (writer_c, mut rx_c) = ClientWriter::channel();
        let rejected = Session::join(Arc::clone(&room), &[], writer_c)
            .await
            .unwrap();
        assert!(rejected.is_none());

        let only = next_msg(&mut rx_c).await;
        assert_eq!(only.event, "room-locked");
        assert!(rx_c.recv().await.is_none()); // channel closed after rejection
        assert_eq!(room.peers.connection_count().await, 1);
    }

    #[tokio::test]
    async fn test_admin_events_from_regular_peer_are_dropped() {
        let room = Room::new(RoomId::from("r"));
        let (_session_a, mut rx_a) = join(&room).await;
        let (session_b, mut rx_b) = join(&room).await;
        assert_eq!(next_msg(&mut rx_a).await.event, "peer-joined");

        for event in [
            "lock-room",
            "disable-chat",
            "mute-all",
            "start-recording",
            "clear-all-hands",
        ] {
            session_b
                .handle_message(&format!(r#"{{"event":"{event}","data":{{}}}}"#))
                .await;
        }

        assert!(!room.is_locked().await);
        assert!(room.is_chat_enabled().await);
        assert!(!room.is_recording().await);
        assert_silent(&mut rx_a).await;
        assert_silent(&mut rx_b).await;
    }

    #[tokio::test]
    async fn test_targeted_message_is_forwarded_unicast() {
        let room = Room::new(RoomId::from("r"));
        let (session_a, mut rx_a) = join(&room).await;
        let (session_b, mut rx_b) = join(&room).await;
        let (_session_c, mut rx_c) = join(&room).await;
        assert_eq!(next_msg(&mut rx_a).await.event, "peer-joined");
        assert_eq!(next_msg(&mut rx_a).await.event, "peer-joined");
        assert_eq!(next_msg(&mut rx_b).await.event, "peer-joined");

        let text = format!(
            r#"{{"event":"offer","data":{{"targetPeerId":"{}","sdp":"v=0..."}}}}"#,
            session_a.peer_id.as_str()
        );
        session_b.handle_message(&text).await;

        let forwarded = next_msg(&mut rx_a).await;
        assert_eq!(forwarded.event, "offer");
        assert_eq!(forwarded.data["peerId"], json!(session_b.peer_id.as_str()));
        assert_eq!(forwarded.data["sdp"], json!("v=0..."));
        assert!(forwarded.data.get("targetPeerId").is_none());

        assert_silent(&mut rx_b).await;
        assert_silent(&mut rx_c).await;
    }

    #[tokio::test]
    async fn test_raise_hand_broadcasts_with_timestamp() {
        let room = Room::new(RoomId::from("r"));
        let (_session_a, mut rx_a) = join(&room).await;
        let (session_b, mut rx_b) = join(&room).await;
        assert_eq!(next_msg(&mut rx_a).await.event, "peer-joined");

        let before = chrono::Utc::now().timestamp();
        session_b
            .handle_message(r#"{"event":"raise-hand","data":{}}"#)
            .await;

        for rx in [&mut rx_a, &mut rx_b] {
            let raised = next_msg(rx).await;
            assert_eq!(raised.event, "hand-raised");
            assert_eq!(raised.data["peerId"], json!(session_b.peer_id.as_str()));
            let ts = raised.data["timestamp"].as_i64().unwrap();
            assert!((ts - before).abs() <= 2);
        }
        assert_eq!(room.raised_hands().await, vec![session_b.peer_id.clone()]);
    }

    #[tokio::test]
    async fn test_recording_toggle_reports_duration() {
        let room = Room::new(RoomId::from("r"));
        let (session_a, mut rx_a) = join(&room).await;

        session_a
            .handle_message(r#"{"event":"start-recording","data":{}}"#)
            .await;
        assert_eq!(next_msg(&mut rx_a).await.event, "recording-started");
        assert!(room.is_recording().await);

        tokio::time::sleep(Duration::from_millis(30)).await;

        session_a
            .handle_message(r#"{"event":"stop-recording","data":{}}"#)
            .await;
        let stopped = next_msg(&mut rx_a).await;
        assert_eq!(stopped.event, "recording-stopped");
        assert!(stopped.data["duration"].as_str().unwrap().ends_with('s'));
        assert!(!room.is_recording().await);
    }

    #[tokio::test]
    async fn test_remove_participant_notifies_then_disconnects() {
        let room = Room::new(RoomId::from("r"));
        let (session_a, mut rx_a) = join(&room).await;
        let (session_b, mut rx_b) = join(&room).await;
        assert_eq!(next_msg(&mut rx_a).await.event, "peer-joined");

        let text = format!(
            r#"{{"event":"remove-participant","data":{{"peerId":"{}"}}}}"#,
            session_b.peer_id.as_str()
        );
        session_a.handle_message(&text).await;

        assert_eq!(next_msg(&mut rx_b).await.event, "removed-from-room");
        assert!(rx_b.recv().await.is_none()); // writer closed with the peer
        assert_eq!(room.peers.connection_count().await, 1);
    }

    #[tokio::test]
    async fn test_cohost_gains_admin_rights() {
        let room = Room::new(RoomId::from("r"));
        let (session_a, mut rx_a) = join(&room).await;
        let (session_b, mut rx_b) = join(&room).await;
        assert_eq!(next_msg(&mut rx_a).await.event, "peer-joined");

        let text = format!(
            r#"{{"event":"add-cohost","data":{{"peerId":"{}"}}}}"#,
            session_b.peer_id.as_str()
        );
        session_a.handle_message(&text).await;

        assert_eq!(next_msg(&mut rx_b).await.event, "cohost-promoted");
        assert_eq!(next_msg(&mut rx_b).await.event, "cohost-added");
        assert!(room.is_host_or_co_host(&session_b.peer_id).await);
        assert!(room.can_share_screen(&session_b.peer_id).await);

        // The co-host can now lock the room.
        session_b.handle_message(r#"{"event":"lock-room","data":{}}"#).await;
        assert!(room.is_locked().await);
        assert_eq!(next_msg(&mut rx_a).await.event, "room-locked");
        assert_eq!(next_msg(&mut rx_b).await.event, "room-locked");
    }

    #[tokio::test]
    async fn test_reaction_broadcasts_emoji() {
        let room = Room::new(RoomId::from("r"));
        let (_session_a, mut rx_a) = join(&room).await;
        let (session_b, mut rx_b) = join(&room).await;
        assert_eq!(next_msg(&mut rx_a).await.event, "peer-joined");

        session_b
            .handle_message(r#"{"event":"reaction","data":{"emoji":"clap"}}"#)
            .await;

        for rx in [&mut rx_a, &mut rx_b] {
            let reaction = next_msg(rx).await;
            assert_eq!(reaction.event, "reaction");
            assert_eq!(reaction.data["emoji"], json!("clap"));
            assert_eq!(reaction.data["peerId"], json!(session_b.peer_id.as_str()));
        }

        // A reaction without an emoji is dropped.
        session_b
            .handle_message(r#"{"event":"reaction","data":{}}"#)
            .await;
        assert_silent(&mut rx_a).await;
    }

    #[tokio::test]
    async fn test_peer_left_broadcast_on_leave() {
        let room = Room::new(RoomId::from("r"));
        let (_session_a, mut rx_a) = join(&room).await;
        let (session_b, _rx_b) = join(&room).await;
        assert_eq!(next_msg(&mut rx_a).await.event, "peer-joined");

        session_b.leave().await;

        let left = next_msg(&mut rx_a).await;
        assert_eq!(left.event, "peer-left");
        assert_eq!(left.data["peerId"], json!(session_b.peer_id.as_str()));
        assert_eq!(room.peers.connection_count().await, 1);
        assert_silent(&mut rx_a).await; // exactly once
    }

    #[tokio::test]
    async fn test_malformed_and_unknown_messages_are_skipped() {
        let room = Room::new(RoomId::from("r"));
        let (session_a, mut rx_a) = join(&room).await;

        session_a.handle_message("not json at all").await;
        session_a.handle_message(r#"{"data":{"no":"event"}}"#).await;
        session_a
            .handle_message(r#"{"event":"no-such-event","data":{}}"#)
            .await;

        assert_silent(&mut rx_a).await;
        assert_eq!(room.peers.connection_count().await, 1);
    }
}
