//! Room policy state: host and co-host controls, screen-share permissions,
//! room lock, chat toggle, mute set, waiting room, recording clock and
//! raised hands.
//!
//! `RoomPolicy` is plain state. The owning room wraps it in a single
//! reader/writer lock; every mutation below is written against `&mut self`
//! so the lock discipline lives in one place.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use crate::models::PeerId;
use crate::signal::ClientWriter;

/// A participant parked in the waiting room, pending host admission.
#[derive(Clone, Serialize)]
pub struct WaitingParticipant {
    #[serde(rename = "peerId")]
    pub peer_id: PeerId,
    pub name: String,
    #[serde(rename = "joinedAt")]
    pub joined_at: DateTime<Utc>,
    /// Pending connection handle, used to notify on admit/deny.
    #[serde(skip)]
    pub writer: ClientWriter,
}

/// Policy fields of one room. Host privileges are rooted in the first peer
/// to join; co-hosts are delegated and may hold stale entries for peers that
/// already left (predicates re-check against live state lazily).
#[derive(Default)]
pub struct RoomPolicy {
    host_peer_id: Option<PeerId>,
    co_hosts: HashSet<PeerId>,
    screen_share_perms: HashMap<PeerId, bool>,
    locked: bool,
    chat_disabled: bool,
    muted: HashSet<PeerId>,
    waiting_room: HashMap<PeerId, WaitingParticipant>,
    raised_hands: Vec<PeerId>,
    recording_started: Option<Instant>,
}

impl RoomPolicy {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    // ----- host & co-hosts -----

    /// Seat the host. Only the first call takes effect; the host keeps
    /// screen-share permission for the life of the room.
    pub fn set_host(&mut self, peer_id: &PeerId) {
        if self.host_peer_id.is_none() {
            self.host_peer_id = Some(peer_id.clone());
            self.screen_share_perms.insert(peer_id.clone(), true);
        }
    }

    #[must_use]
    pub fn host_peer_id(&self) -> Option<&PeerId> {
        self.host_peer_id.as_ref()
    }

    #[must_use]
    pub fn is_host(&self, peer_id: &PeerId) -> bool {
        self.host_peer_id.as_ref() == Some(peer_id)
    }

    pub fn add_co_host(&mut self, peer_id: &PeerId) {
        self.co_hosts.insert(peer_id.clone());
        self.screen_share_perms.insert(peer_id.clone(), true);
    }

    pub fn remove_co_host(&mut self, peer_id: &PeerId) {
        self.co_hosts.remove(peer_id);
    }

    #[must_use]
    pub fn is_co_host(&self, peer_id: &PeerId) -> bool {
        self.co_hosts.contains(peer_id)
    }

    #[must_use]
    pub fn is_host_or_co_host(&self, peer_id: &PeerId) -> bool {
        self.is_host(peer_id) || self.is_co_host(peer_id)
    }

    // ----- screen share -----

    pub fn grant_screen_share(&mut self, peer_id: &PeerId) {
        self.screen_share_perms.insert(peer_id.clone(), true);
    }

    /// Revoking the host's permission is a no-op.
    pub fn revoke_screen_share(&mut self, peer_id: &PeerId) {
        if !self.is_host(peer_id) {
            self.screen_share_perms.insert(peer_id.clone(), false);
        }
    }

    #[must_use]
    pub fn can_share_screen(&self, peer_id: &PeerId) -> bool {
        self.screen_share_perms.get(peer_id).copied().unwrap_or(false)
    }

    // ----- room lock -----

    pub fn lock(&mut self) {
        self.locked = true;
    }

    pub fn unlock(&mut self) {
        self.locked = false;
    }

    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.locked
    }

    // ----- chat toggle -----

    pub fn disable_chat(&mut self) {
        self.chat_disabled = true;
    }

    pub fn enable_chat(&mut self) {
        self.chat_disabled = false;
    }

    #[must_use]
    pub fn is_chat_enabled(&self) -> bool {
        !self.chat_disabled
    }

    // ----- mute -----

    pub fn mute_participant(&mut self, peer_id: &PeerId) {
        self.muted.insert(peer_id.clone());
    }

    pub fn unmute_participant(&mut self, peer_id: &PeerId) {
        self.muted.remove(peer_id);
    }

    #[must_use]
    pub fn is_participant_muted(&self, peer_id: &PeerId) -> bool {
        self.muted.contains(peer_id)
    }

    /// Mute every currently connected peer except the host and co-hosts.
    pub fn mute_all(&mut self, connected: &[PeerId]) {
        for peer_id in connected {
            if !self.is_host_or_co_host(peer_id) {
                self.muted.insert(peer_id.clone());
            }
        }
    }

    pub fn unmute_all(&mut self) {
        self.muted.clear();
    }

    // ----- waiting room -----

    pub fn add_to_waiting_room(&mut self, peer_id: PeerId, name: String, writer: ClientWriter) {
        self.waiting_room.insert(
            peer_id.clone(),
            WaitingParticipant {
                peer_id,
                name,
                joined_at: Utc::now(),
                writer,
            },
        );
    }

    /// Admit a pending participant, handing back their entry, or `None` if
    /// they already left the waiting room.
    pub fn admit_from_waiting_room(&mut self, peer_id: &PeerId) -> Option<WaitingParticipant> {
        self.waiting_room.remove(peer_id)
    }

    /// Deny entry; returns the dropped entry so the caller can close it.
    pub fn remove_from_waiting_room(&mut self, peer_id: &PeerId) -> Option<WaitingParticipant> {
        self.waiting_room.remove(peer_id)
    }

    /// Pending participants, oldest first.
    #[must_use]
    pub fn waiting_participants(&self) -> Vec<WaitingParticipant> {
        let mut participants: Vec<_> = self.waiting_room.values().cloned().collect();
        participants.sort_by_key(|p| p.joined_at);
        participants
    }

    // ----- recording -----

    /// Start the recording clock. Idempotent while already recording.
    pub fn start_recording(&mut self) {
        if self.recording_started.is_none() {
            self.recording_started = Some(Instant::now());
        }
    }

    /// Stop recording and return the elapsed duration; zero when idle.
    pub fn stop_recording(&mut self) -> Duration {
        self.recording_started
            .take()
            .map_or(Duration::ZERO, |started| started.elapsed())
    }

    #[must_use]
    pub fn is_recording(&self) -> bool {
        self.recording_started.is_some()
    }

    /// Elapsed recording time so far; zero when idle.
    #[must_use]
    pub fn recording_duration(&self) -> Duration {
        self.recording_started
            .map_or(Duration::ZERO, |started| started.elapsed())
    }

    // ----- raised hands -----

    /// Add the peer to the raised-hands queue, preserving raise order.
    pub fn raise_hand(&mut self, peer_id: &PeerId) {
        if !self.raised_hands.contains(peer_id) {
            self.raised_hands.push(peer_id.clone());
        }
    }

    pub fn lower_hand(&mut self, peer_id: &PeerId) {
        self.raised_hands.retain(|id| id != peer_id);
    }

    pub fn clear_all_hands(&mut self) {
        self.raised_hands.clear();
    }

    #[must_use]
    pub fn raised_hands(&self) -> &[PeerId] {
        &self.raised_hands
    }
}
