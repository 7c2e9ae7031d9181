//! Room registry: maps a room to its live connections.
//!
//! All membership mutation happens under the single `rooms` mutex. Rooms are
//! created on first join and removed as soon as their last member leaves.

use crate::connection::{Channel, ConnectionHandle, RoomKey};
use sigrelay_core::CloseCode;
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Connections of one room keyed by participant id.
type Members = HashMap<String, ConnectionHandle>;

/// Room and connection counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub room_count: usize,
    pub connection_count: usize,
}

/// Registry of active rooms.
#[derive(Default)]
pub struct RoomRegistry {
    rooms: Mutex<HashMap<RoomKey, Members>>,
}

impl RoomRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit a connection to its room, creating the room if absent.
    ///
    /// A live connection already held by the same participant in that room
    /// is asked to close with 1000 before the new one takes its slot; it is
    /// returned to the caller.
    pub async fn join(&self, handle: ConnectionHandle) -> Option<ConnectionHandle> {
        let mut rooms = self.rooms.lock().await;
        let key = handle.room().clone();
        let created = !rooms.contains_key(&key);
        let members = rooms.entry(key.clone()).or_default();

        let prior = members.insert(handle.participant_id().to_string(), handle.clone());
        if let Some(prev) = &prior {
            prev.close(CloseCode::Normal, "superseded by a newer connection");
            info!(
                room = %key,
                participant = %handle.participant_id(),
                previous = prev.id(),
                connection = handle.id(),
                "participant reconnected, previous connection superseded"
            );
        }
        if created {
            info!(room = %key, "room created");
        }
        debug!(
            room = %key,
            participant = %handle.participant_id(),
            members = members.len(),
            "connection joined"
        );

        prior
    }

    /// Remove a connection. Only removes the slot if it still holds this
    /// exact connection, so a superseded connection leaving does not evict
    /// its replacement. Empty rooms are removed.
    pub async fn leave(&self, handle: &ConnectionHandle) -> bool {
        let mut rooms = self.rooms.lock().await;
        let key = handle.room();
        let Some(members) = rooms.get_mut(key) else {
            return false;
        };

        match members.get(handle.participant_id()) {
            Some(current) if current.id() == handle.id() => {
                members.remove(handle.participant_id());
            }
            _ => return false,
        }

        if members.is_empty() {
            rooms.remove(key);
            info!(room = %key, "room destroyed");
        } else {
            debug!(room = %key, remaining = members.len(), "connection left");
        }
        true
    }

    /// Members of a room, or `None` if the room does not exist.
    pub async fn lookup(&self, key: &RoomKey) -> Option<Vec<ConnectionHandle>> {
        let rooms = self.rooms.lock().await;
        rooms.get(key).map(|members| members.values().cloned().collect())
    }

    /// Members of a room; an unknown room has no members.
    pub async fn members(&self, key: &RoomKey) -> Vec<ConnectionHandle> {
        self.lookup(key).await.unwrap_or_default()
    }

    pub async fn contains_room(&self, key: &RoomKey) -> bool {
        self.rooms.lock().await.contains_key(key)
    }

    pub async fn stats(&self) -> RegistryStats {
        let rooms = self.rooms.lock().await;
        RegistryStats {
            room_count: rooms.len(),
            connection_count: rooms.values().map(HashMap::len).sum(),
        }
    }

    /// Counts restricted to one channel.
    pub async fn stats_for(&self, channel: Channel) -> RegistryStats {
        let rooms = self.rooms.lock().await;
        rooms
            .iter()
            .filter(|(key, _)| key.channel == channel)
            .fold(RegistryStats::default(), |mut acc, (_, members)| {
                acc.room_count += 1;
                acc.connection_count += members.len();
                acc
            })
    }

    /// Request every registered connection to close. Returns how many were asked.
    pub async fn close_all(&self, code: CloseCode, reason: &str) -> usize {
        let rooms = self.rooms.lock().await;
        let mut count = 0;
        for handle in rooms.values().flat_map(HashMap::values) {
            handle.close(code, reason);
            count += 1;
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionQueues;

    fn conn(id: u64, channel: Channel, room: &str, participant: &str) -> (ConnectionHandle, ConnectionQueues) {
        ConnectionHandle::new(
            id,
            RoomKey::new(channel, room),
            participant,
            "127.0.0.1:4000".parse().unwrap(),
            4,
        )
    }

    #[tokio::test]
    async fn join_creates_room_and_leave_destroys_it() {
        let registry = RoomRegistry::new();
        let (a, _qa) = conn(1, Channel::Call, "appt-42", "u1");
        let (b, _qb) = conn(2, Channel::Call, "appt-42", "u2");

        assert!(registry.join(a.clone()).await.is_none());
        assert!(registry.join(b.clone()).await.is_none());
        assert_eq!(
            registry.stats().await,
            RegistryStats {
                room_count: 1,
                connection_count: 2
            }
        );

        assert!(registry.leave(&a).await);
        assert!(registry.contains_room(a.room()).await);
        assert!(registry.leave(&b).await);
        assert!(!registry.contains_room(a.room()).await);
        assert_eq!(registry.stats().await, RegistryStats::default());
    }

    #[tokio::test]
    async fn unknown_room_has_no_members() {
        let registry = RoomRegistry::new();
        let key = RoomKey::new(Channel::Chat, "gone");
        assert!(registry.members(&key).await.is_empty());
        assert!(registry.lookup(&key).await.is_none());
    }

    #[tokio::test]
    async fn reconnect_supersedes_previous_connection() {
        let registry = RoomRegistry::new();
        let (old, old_queues) = conn(1, Channel::Call, "appt-42", "u1");
        let (new, _new_queues) = conn(2, Channel::Call, "appt-42", "u1");

        registry.join(old.clone()).await;
        let prior = registry.join(new.clone()).await.unwrap();
        assert_eq!(prior.id(), 1);

        let request = old_queues.close.borrow().clone().unwrap();
        assert_eq!(request.code, CloseCode::Normal);

        let members = registry.members(new.room()).await;
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].id(), 2);

        // the superseded connection leaving must not evict its replacement
        assert!(!registry.leave(&old).await);
        assert_eq!(registry.members(new.room()).await.len(), 1);
    }

    #[tokio::test]
    async fn channels_are_separate_namespaces() {
        let registry = RoomRegistry::new();
        let (call, _q1) = conn(1, Channel::Call, "appt-42", "u1");
        let (chat, q2) = conn(2, Channel::Chat, "appt-42", "u1");

        registry.join(call).await;
        assert!(registry.join(chat).await.is_none());
        assert!(q2.close.borrow().is_none());

        assert_eq!(registry.stats_for(Channel::Call).await.connection_count, 1);
        assert_eq!(registry.stats_for(Channel::Chat).await.room_count, 1);
        assert_eq!(registry.stats().await.room_count, 2);
    }

    #[tokio::test]
    async fn rooms_never_share_connections() {
        let registry = RoomRegistry::new();
        let (a, _qa) = conn(1, Channel::Call, "R1", "u1");
        let (b, _qb) = conn(2, Channel::Call, "R2", "u2");
        registry.join(a).await;
        registry.join(b).await;

        let r1 = registry.members(&RoomKey::new(Channel::Call, "R1")).await;
        assert_eq!(r1.iter().map(|h| h.id()).collect::<Vec<_>>(), vec![1]);
    }

    #[tokio::test]
    async fn close_all_reaches_every_connection() {
        let registry = RoomRegistry::new();
        let (a, qa) = conn(1, Channel::Call, "R1", "u1");
        let (b, qb) = conn(2, Channel::Chat, "R2", "u2");
        registry.join(a).await;
        registry.join(b).await;

        assert_eq!(registry.close_all(CloseCode::GoingAway, "shutdown").await, 2);
        for q in [qa, qb] {
            assert_eq!(q.close.borrow().clone().unwrap().code, CloseCode::GoingAway);
        }
    }
}
