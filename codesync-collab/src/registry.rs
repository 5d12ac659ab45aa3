//! Per-room snapshot cache.
//!
//! The registry is plain owned state: it is handed to the relay at
//! construction and only ever touched from the relay's task, so it needs no
//! locking of its own. Nothing is validated, bounded or expired; a room's
//! snapshot lives until the process exits.
//!
//! Empty content is recorded but does not count as a snapshot: a room cleared
//! to `""` bootstraps from its peers again.

use std::collections::HashMap;

use crate::protocol::RoomId;

/// Latest known code snapshot for every room the relay has seen.
#[derive(Debug, Default, Clone)]
pub struct SessionRegistry {
    snapshots: HashMap<RoomId, String>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot for `room_id`, or `None` if nothing but empty content was
    /// ever recorded.
    pub fn get(&self, room_id: &RoomId) -> Option<&str> {
        self.snapshots
            .get(room_id)
            .map(String::as_str)
            .filter(|snapshot| !snapshot.is_empty())
    }

    /// Overwrite the snapshot for `room_id`.
    pub fn set(&mut self, room_id: RoomId, snapshot: String) {
        self.snapshots.insert(room_id, snapshot);
    }

    pub fn contains(&self, room_id: &RoomId) -> bool {
        self.get(room_id).is_some()
    }

    /// Number of rooms with recorded content, empty or not.
    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_absent() {
        let registry = SessionRegistry::new();
        assert!(registry.get(&RoomId::from("R1")).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_set_overwrites() {
        let mut registry = SessionRegistry::new();
        let room = RoomId::from("R1");

        registry.set(room.clone(), "a".into());
        registry.set(room.clone(), "b".into());

        assert_eq!(registry.get(&room), Some("b"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_empty_snapshot_counts_as_absent() {
        let mut registry = SessionRegistry::new();
        let room = RoomId::from("R1");
        registry.set(room.clone(), String::new());

        assert!(!registry.contains(&room));
        assert_eq!(registry.get(&room), None);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_rooms_are_isolated() {
        let mut registry = SessionRegistry::new();
        registry.set("R1".into(), "one".into());
        registry.set("R2".into(), "two".into());

        assert_eq!(registry.get(&"R1".into()), Some("one"));
        assert_eq!(registry.get(&"R2".into()), Some("two"));
    }
}
