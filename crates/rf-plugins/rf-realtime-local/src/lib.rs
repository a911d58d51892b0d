//! # rf-realtime-local
//!
//! In-process room hub. Every room is a lossy `tokio::sync::broadcast`
//! channel created on first join; publishing to a room nobody joined is a
//! no-op. Slow receivers lag and skip events, they never block publishers.

use dashmap::DashMap;
use rf_core::events::{RealtimeEvent, Room};
use rf_core::traits::Fanout;
use tokio::sync::broadcast;
use uuid::Uuid;

const ROOM_CAPACITY: usize = 256;

pub struct RoomHub {
    rooms: DashMap<Room, broadcast::Sender<RealtimeEvent>>,
    capacity: usize,
}

impl Default for RoomHub {
    fn default() -> Self {
        Self::new(ROOM_CAPACITY)
    }
}

/// Rooms every authenticated connection is subscribed to implicitly.
pub struct Connection {
    pub user_id: Uuid,
    pub global: broadcast::Receiver<RealtimeEvent>,
    pub user: broadcast::Receiver<RealtimeEvent>,
}

impl RoomHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            rooms: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Explicit join, used for thread rooms.
    pub fn join(&self, room: Room) -> broadcast::Receiver<RealtimeEvent> {
        self.rooms
            .entry(room)
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Authenticated connect: the user's own room plus the global room.
    pub fn connect(&self, user_id: Uuid) -> Connection {
        Connection {
            user_id,
            global: self.join(Room::Global),
            user: self.join(Room::User(user_id)),
        }
    }

    pub fn subscriber_count(&self, room: Room) -> usize {
        self.rooms.get(&room).map(|tx| tx.receiver_count()).unwrap_or(0)
    }

    /// Drops rooms whose every receiver has gone away.
    pub fn prune(&self) -> usize {
        let before = self.rooms.len();
        self.rooms.retain(|_, tx| tx.receiver_count() > 0);
        before - self.rooms.len()
    }
}

impl Fanout for RoomHub {
    fn publish(&self, room: Room, event: RealtimeEvent) {
        let Some(tx) = self.rooms.get(&room) else {
            return;
        };
        let name = event.name();
        // Err only means no live receivers; fire-and-forget either way.
        match tx.send(event) {
            Ok(receivers) => tracing::trace!(%room, event = name, receivers, "realtime event published"),
            Err(_) => tracing::trace!(%room, event = name, "realtime event dropped, room empty"),
        }
    }
}

/// JSON frame as written to a client socket.
pub fn frame(event: &RealtimeEvent) -> serde_json::Result<String> {
    serde_json::to_string(event)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deleted(thread_id: Uuid) -> RealtimeEvent {
        RealtimeEvent::ThreadDeleted { thread_id }
    }

    #[tokio::test]
    async fn test_thread_room_receives_only_its_events() {
        let hub = RoomHub::default();
        let a = Uuid::now_v7();
        let b = Uuid::now_v7();
        let mut rx = hub.join(Room::Thread(a));

        hub.publish(Room::Thread(b), deleted(b));
        hub.publish(Room::Thread(a), deleted(a));

        assert_eq!(rx.recv().await.unwrap(), deleted(a));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_connect_joins_user_and_global_rooms() {
        let hub = RoomHub::default();
        let user = Uuid::now_v7();
        let mut conn = hub.connect(user);

        hub.publish(Room::User(user), deleted(user));
        hub.publish(Room::Global, deleted(user));

        assert!(conn.user.recv().await.is_ok());
        assert!(conn.global.recv().await.is_ok());
        assert_eq!(hub.subscriber_count(Room::User(user)), 1);
    }

    #[test]
    fn test_publish_without_listeners_is_noop() {
        let hub = RoomHub::default();
        hub.publish(Room::Global, deleted(Uuid::now_v7()));

        let rx = hub.join(Room::Global);
        drop(rx);
        hub.publish(Room::Global, deleted(Uuid::now_v7()));
        assert_eq!(hub.prune(), 1);
    }

    #[test]
    fn test_frame_carries_event_name() {
        let json = frame(&deleted(Uuid::nil())).unwrap();
        assert!(json.contains("\"event\":\"thread.deleted\""));
    }
}
