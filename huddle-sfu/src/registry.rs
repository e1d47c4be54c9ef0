//! Process-wide room and stream registries plus the keyframe dispatcher.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info};

use huddle_core::models::RoomId;

use crate::room::Room;

/// Keyframe request cadence across all rooms and streams
const KEYFRAME_INTERVAL: Duration = Duration::from_secs(3);
/// Empty-room sweep cadence
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Registry of active rooms and streams. Streams share the room structure
/// but live in their own map; the two namespaces never collide.
#[derive(Default)]
pub struct Registry {
    rooms: DashMap<RoomId, Arc<Room>>,
    streams: DashMap<RoomId, Arc<Room>>,
}

impl Registry {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Get or create a room; a new room's chat hub starts immediately.
    pub fn create_room(&self, id: &RoomId) -> Arc<Room> {
        self.rooms
            .entry(id.clone())
            .or_insert_with(|| Room::new(id.clone()))
            .clone()
    }

    pub fn get_room(&self, id: &RoomId) -> Option<Arc<Room>> {
        self.rooms.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Remove a room, but only once it has no connections. Advisory: the
    /// periodic sweep below covers rooms nobody deletes explicitly.
    pub async fn delete_room(&self, id: &RoomId) {
        if let Some(room) = self.get_room(id) {
            if room.peers.connection_count().await == 0 {
                self.rooms.remove(id);
                info!(room = %id, "room deleted");
            }
        }
    }

    pub fn create_stream(&self, id: &RoomId) -> Arc<Room> {
        self.streams
            .entry(id.clone())
            .or_insert_with(|| Room::new(id.clone()))
            .clone()
    }

    pub fn get_stream(&self, id: &RoomId) -> Option<Arc<Room>> {
        self.streams.get(id).map(|entry| Arc::clone(entry.value()))
    }

    pub async fn delete_stream(&self, id: &RoomId) {
        if let Some(stream) = self.get_stream(id) {
            if stream.peers.connection_count().await == 0 {
                self.streams.remove(id);
                info!(stream = %id, "stream deleted");
            }
        }
    }

    #[must_use]
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    #[must_use]
    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    /// Snapshot of every room and stream. Taken before any awaiting so map
    /// guards are never held across suspension points.
    fn snapshot(&self) -> Vec<Arc<Room>> {
        self.rooms
            .iter()
            .chain(self.streams.iter())
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Periodic PLI across all rooms and streams so late subscribers get a
    /// keyframe within one interval.
    pub fn spawn_keyframe_dispatcher(self: &Arc<Self>) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval(KEYFRAME_INTERVAL);
            loop {
                ticker.tick().await;
                for room in registry.snapshot() {
                    room.peers.dispatch_key_frame().await;
                }
            }
        })
    }

    /// Periodic removal of empty rooms and streams.
    pub fn spawn_empty_sweep(self: &Arc<Self>) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval(SWEEP_INTERVAL);
            loop {
                ticker.tick().await;
                registry.sweep_empty().await;
            }
        })
    }

    async fn sweep_empty(&self) {
        let mut removed = 0usize;

        let rooms: Vec<Arc<Room>> = self.rooms.iter().map(|e| Arc::clone(e.value())).collect();
        for room in rooms {
            if room.peers.connection_count().await == 0 && self.rooms.remove(&room.id).is_some() {
                removed += 1;
            }
        }

        let streams: Vec<Arc<Room>> = self.streams.iter().map(|e| Arc::clone(e.value())).collect();
        for stream in streams {
            if stream.peers.connection_count().await == 0
                && self.streams.remove(&stream.id).is_some()
            {
                removed += 1;
            }
        }

        if removed > 0 {
            debug!(removed, remaining = self.room_count() + self.stream_count(), "swept empty rooms");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtc::new_peer_connection;
    use huddle_core::models::PeerId;
    use huddle_core::signal::ClientWriter;

    #[tokio::test]
    async fn test_create_room_is_get_or_insert() {
        let registry = Registry::new();
        let id = RoomId::from("r1");

        let room = registry.create_room(&id);
        let same = registry.create_room(&id);
        assert!(Arc::ptr_eq(&room, &same));
        assert_eq!(registry.room_count(), 1);

        assert!(registry.get_room(&id).is_some());
        assert!(registry.get_room(&RoomId::from("missing")).is_none());
    }

    #[tokio::test]
    async fn test_rooms_and_streams_are_separate_namespaces() {
        let registry = Registry::new();
        let id = RoomId::from("shared");

        let room = registry.create_room(&id);
        let stream = registry.create_stream(&id);
        assert!(!Arc::ptr_eq(&room, &stream));
        assert_eq!(registry.room_count(), 1);
        assert_eq!(registry.stream_count(), 1);
    }

    #[tokio::test]
    async fn test_delete_room_only_when_empty() {
        let registry = Registry::new();
        let id = RoomId::from("r1");
        let room = registry.create_room(&id);

        let pc = new_peer_connection(&[]).await.unwrap();
        let (writer, _rx) = ClientWriter::channel();
        room.peers
            .add_peer_connection(Arc::clone(&pc), writer, PeerId::from("a"))
            .await;

        registry.delete_room(&id).await;
        assert_eq!(registry.room_count(), 1); // occupied: no-op

        room.peers.remove_peer_connection(&pc).await;
        registry.delete_room(&id).await;
        assert_eq!(registry.room_count(), 0);
    }

    #[tokio::test]
    async fn test_sweep_removes_only_empty() {
        let registry = Registry::new();
        let empty = RoomId::from("empty");
        let busy = RoomId::from("busy");
        registry.create_room(&empty);
        let room = registry.create_room(&busy);

        let pc = new_peer_connection(&[]).await.unwrap();
        let (writer, _rx) = ClientWriter::channel();
        room.peers
            .add_peer_connection(pc, writer, PeerId::from("a"))
            .await;

        registry.sweep_empty().await;
        assert!(registry.get_room(&empty).is_none());
        assert!(registry.get_room(&busy).is_some());
    }
}
