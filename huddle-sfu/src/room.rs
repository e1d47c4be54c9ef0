//! A named session: the peer set, the chat hub and the policy state.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::info;

use huddle_core::chat::ChatHub;
use huddle_core::models::{PeerId, RoomId};
use huddle_core::policy::{RoomPolicy, WaitingParticipant};
use huddle_core::signal::ClientWriter;

use crate::peers::PeerSet;

/// Outcome of a join attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinDecision {
    /// First peer in: seated as host
    Host,
    /// Admitted as a regular participant
    Admitted,
    /// Room is locked; the connection must be told and closed
    Locked,
}

/// One room (or stream — identical structure, separate registry).
///
/// Lock order is `policy` before any `peers` lock; the peer set is never
/// consulted first when the policy lock will also be taken.
pub struct Room {
    pub id: RoomId,
    pub peers: Arc<PeerSet>,
    pub hub: ChatHub,
    policy: RwLock<RoomPolicy>,
}

impl Room {
    /// Build a room and start its chat hub.
    #[must_use]
    pub fn new(id: RoomId) -> Arc<Self> {
        info!(room = %id, "room created");
        Arc::new(Self {
            id,
            peers: Arc::new(PeerSet::new()),
            hub: ChatHub::new(),
            policy: RwLock::new(RoomPolicy::new()),
        })
    }

    /// Join admission, atomic with respect to other joiners: the first peer
    /// becomes host; later peers are rejected while the room is locked.
    pub async fn admit(&self, peer_id: &PeerId) -> JoinDecision {
        let mut policy = self.policy.write().await;
        if self.peers.connection_count().await == 0 {
            policy.set_host(peer_id);
            JoinDecision::Host
        } else if policy.is_locked() {
            JoinDecision::Locked
        } else {
            JoinDecision::Admitted
        }
    }

    // ----- host & co-hosts -----

    pub async fn host_peer_id(&self) -> Option<PeerId> {
        self.policy.read().await.host_peer_id().cloned()
    }

    pub async fn is_host(&self, peer_id: &PeerId) -> bool {
        self.policy.read().await.is_host(peer_id)
    }

    pub async fn is_host_or_co_host(&self, peer_id: &PeerId) -> bool {
        self.policy.read().await.is_host_or_co_host(peer_id)
    }

    pub async fn add_co_host(&self, peer_id: &PeerId) {
        self.policy.write().await.add_co_host(peer_id);
    }

    pub async fn remove_co_host(&self, peer_id: &PeerId) {
        self.policy.write().await.remove_co_host(peer_id);
    }

    // ----- screen share -----

    pub async fn grant_screen_share(&self, peer_id: &PeerId) {
        self.policy.write().await.grant_screen_share(peer_id);
    }

    pub async fn revoke_screen_share(&self, peer_id: &PeerId) {
        self.policy.write().await.revoke_screen_share(peer_id);
    }

    pub async fn can_share_screen(&self, peer_id: &PeerId) -> bool {
        self.policy.read().await.can_share_screen(peer_id)
    }

    // ----- lock & chat -----

    pub async fn lock(&self) {
        self.policy.write().await.lock();
    }

    pub async fn unlock(&self) {
        self.policy.write().await.unlock();
    }

    pub async fn is_locked(&self) -> bool {
        self.policy.read().await.is_locked()
    }

    pub async fn disable_chat(&self) {
        self.policy.write().await.disable_chat();
    }

    pub async fn enable_chat(&self) {
        self.policy.write().await.enable_chat();
    }

    pub async fn is_chat_enabled(&self) -> bool {
        self.policy.read().await.is_chat_enabled()
    }

    // ----- mute -----

    pub async fn mute_participant(&self, peer_id: &PeerId) {
        self.policy.write().await.mute_participant(peer_id);
    }

    pub async fn unmute_participant(&self, peer_id: &PeerId) {
        self.policy.write().await.unmute_participant(peer_id);
    }

    pub async fn is_participant_muted(&self, peer_id: &PeerId) -> bool {
        self.policy.read().await.is_participant_muted(peer_id)
    }

    /// Mute everyone currently connected except the host and co-hosts.
    pub async fn mute_all(&self) {
        let mut policy = self.policy.write().await;
        let connected = self.peers.peer_ids().await;
        policy.mute_all(&connected);
    }

    pub async fn unmute_all(&self) {
        self.policy.write().await.unmute_all();
    }

    // ----- waiting room -----

    pub async fn add_to_waiting_room(&self, peer_id: PeerId, name: String, writer: ClientWriter) {
        self.policy
            .write()
            .await
            .add_to_waiting_room(peer_id, name, writer);
    }

    pub async fn admit_from_waiting_room(&self, peer_id: &PeerId) -> Option<WaitingParticipant> {
        self.policy.write().await.admit_from_waiting_room(peer_id)
    }

    pub async fn remove_from_waiting_room(&self, peer_id: &PeerId) -> Option<WaitingParticipant> {
        self.policy.write().await.remove_from_waiting_room(peer_id)
    }

    pub async fn waiting_participants(&self) -> Vec<WaitingParticipant> {
        self.policy.read().await.waiting_participants()
    }

    // ----- recording -----

    pub async fn start_recording(&self) {
        self.policy.write().await.start_recording();
    }

    pub async fn stop_recording(&self) -> Duration {
        self.policy.write().await.stop_recording()
    }

    pub async fn is_recording(&self) -> bool {
        self.policy.read().await.is_recording()
    }

    // ----- raised hands -----

    pub async fn raise_hand(&self, peer_id: &PeerId) {
        self.policy.write().await.raise_hand(peer_id);
    }

    pub async fn lower_hand(&self, peer_id: &PeerId) {
        self.policy.write().await.lower_hand(peer_id);
    }

    pub async fn clear_all_hands(&self) {
        self.policy.write().await.clear_all_hands();
    }

    pub async fn raised_hands(&self) -> Vec<PeerId> {
        self.policy.read().await.raised_hands().to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtc::new_peer_connection;

    async fn connect(room: &Room, id: &str) {
        let pc = new_peer_connection(&[]).await.unwrap();
        let (writer, _rx) = ClientWriter::channel();
        room.peers
            .add_peer_connection(pc, writer, PeerId::from(id))
            .await;
    }

    #[tokio::test]
    async fn test_first_joiner_is_host() {
        let room = Room::new(RoomId::from("r"));
        assert_eq!(room.admit(&PeerId::from("a")).await, JoinDecision::Host);
        connect(&room, "a").await;

        assert_eq!(room.admit(&PeerId::from("b")).await, JoinDecision::Admitted);
        assert!(room.is_host(&PeerId::from("a")).await);
        assert!(!room.is_host(&PeerId::from("b")).await);
    }

    #[tokio::test]
    async fn test_locked_room_rejects_joiners() {
        let room = Room::new(RoomId::from("r"));
        assert_eq!(room.admit(&PeerId::from("a")).await, JoinDecision::Host);
        connect(&room, "a").await;

        room.lock().await;
        assert_eq!(room.admit(&PeerId::from("b")).await, JoinDecision::Locked);
        assert_eq!(room.peers.connection_count().await, 1);

        room.unlock().await;
        assert_eq!(room.admit(&PeerId::from("b")).await, JoinDecision::Admitted);
    }

    #[tokio::test]
    async fn test_lock_never_applies_to_first_joiner() {
        // A locked-but-empty room still seats the first joiner as host.
        let room = Room::new(RoomId::from("r"));
        room.lock().await;
        assert_eq!(room.admit(&PeerId::from("a")).await, JoinDecision::Host);
    }

    #[tokio::test]
    async fn test_mute_all_exempts_host_and_co_hosts() {
        let room = Room::new(RoomId::from("r"));
        assert_eq!(room.admit(&PeerId::from("a")).await, JoinDecision::Host);
        for id in ["a", "b", "c", "d"] {
            connect(&room, id).await;
        }
        room.add_co_host(&PeerId::from("c")).await;

        room.mute_all().await;

        assert!(!room.is_participant_muted(&PeerId::from("a")).await);
        assert!(room.is_participant_muted(&PeerId::from("b")).await);
        assert!(!room.is_participant_muted(&PeerId::from("c")).await);
        assert!(room.is_participant_muted(&PeerId::from("d")).await);
    }
}
