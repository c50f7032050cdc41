//! Room registry: the authoritative room → member-set store.
//!
//! Every join/leave for one room runs under that room's own mutex, so the
//! capacity check and the membership change are a single step as seen by
//! concurrent joiners. Different rooms never contend with each other.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use super::state::{AdmitError, ParticipantSession, Room, ROOM_CAPACITY};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinOutcome {
    /// Admitted. `prior` holds the members that were already present.
    Accepted { prior: Vec<ParticipantSession> },
    Full,
    AlreadyMember,
}

/// Storage seam for room membership. The in-memory implementation backs a
/// single relay process; a shared store can implement the same contract.
#[async_trait]
pub trait RoomRegistry: Send + Sync {
    async fn join(&self, room_id: &str, participant: ParticipantSession) -> JoinOutcome;

    /// Remove a member. Empty rooms are discarded.
    async fn leave(&self, room_id: &str, session_id: &str) -> Option<ParticipantSession>;

    async fn list_members(&self, room_id: &str) -> Vec<ParticipantSession>;

    async fn room_count(&self) -> usize;
}

struct RoomSlot {
    room: Room,
    /// Set once the slot has been unlinked from the map; joiners that raced
    /// the removal must look the room up again.
    retired: bool,
}

pub struct InMemoryRegistry {
    capacity: usize,
    rooms: RwLock<HashMap<String, Arc<Mutex<RoomSlot>>>>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::with_capacity(ROOM_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.min(ROOM_CAPACITY),
            rooms: RwLock::new(HashMap::new()),
        }
    }

    async fn slot(&self, room_id: &str) -> Arc<Mutex<RoomSlot>> {
        if let Some(slot) = self.rooms.read().await.get(room_id) {
            return slot.clone();
        }
        let mut rooms = self.rooms.write().await;
        rooms
            .entry(room_id.to_string())
            .or_insert_with(|| {
                debug!(room_id, "Creating room");
                Arc::new(Mutex::new(RoomSlot {
                    room: Room::new(room_id.to_string(), self.capacity),
                    retired: false,
                }))
            })
            .clone()
    }
}

impl Default for InMemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RoomRegistry for InMemoryRegistry {
    async fn join(&self, room_id: &str, participant: ParticipantSession) -> JoinOutcome {
        loop {
            let slot = self.slot(room_id).await;
            let mut guard = slot.lock().await;
            if guard.retired {
                continue;
            }
            let session_id = participant.session_id.clone();
            return match guard.room.add_member(participant) {
                Ok(prior) => {
                    info!(
                        room_id,
                        session = %session_id,
                        members = guard.room.members().len(),
                        "Participant joined"
                    );
                    JoinOutcome::Accepted { prior }
                }
                Err(AdmitError::Full) => {
                    info!(room_id, session = %session_id, "Join rejected: room full");
                    JoinOutcome::Full
                }
                Err(AdmitError::AlreadyMember) => JoinOutcome::AlreadyMember,
            };
        }
    }

    async fn leave(&self, room_id: &str, session_id: &str) -> Option<ParticipantSession> {
        let slot = self.rooms.read().await.get(room_id).cloned()?;
        let mut guard = slot.lock().await;
        let removed = guard.room.remove_member(session_id);

        if guard.room.is_empty() && !guard.retired {
            guard.retired = true;
            let mut rooms = self.rooms.write().await;
            if rooms.get(room_id).is_some_and(|current| Arc::ptr_eq(current, &slot)) {
                rooms.remove(room_id);
                info!(room_id, "Room discarded (empty)");
            }
        }

        if removed.is_some() {
            info!(room_id, session = %session_id, "Participant left");
        }
        removed
    }

    async fn list_members(&self, room_id: &str) -> Vec<ParticipantSession> {
        let Some(slot) = self.rooms.read().await.get(room_id).cloned() else {
            return Vec::new();
        };
        let guard = slot.lock().await;
        guard.room.members().to_vec()
    }

    async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(id: &str) -> ParticipantSession {
        ParticipantSession::new(id, format!("user-{id}"))
    }

    #[tokio::test]
    async fn room_is_created_on_first_join_and_dropped_when_empty() {
        let registry = InMemoryRegistry::new();
        assert_eq!(registry.room_count().await, 0);

        let outcome = registry.join("algebra-101", member("a")).await;
        assert_eq!(outcome, JoinOutcome::Accepted { prior: vec![] });
        assert_eq!(registry.room_count().await, 1);

        assert!(registry.leave("algebra-101", "a").await.is_some());
        assert_eq!(registry.room_count().await, 0);
        assert!(registry.list_members("algebra-101").await.is_empty());
    }

    #[tokio::test]
    async fn sixth_join_is_rejected_without_mutation() {
        let registry = InMemoryRegistry::new();
        for id in ["a", "b", "c", "d", "e"] {
            assert!(matches!(
                registry.join("r", member(id)).await,
                JoinOutcome::Accepted { .. }
            ));
        }
        let before = registry.list_members("r").await;
        assert_eq!(registry.join("r", member("f")).await, JoinOutcome::Full);
        assert_eq!(registry.list_members("r").await, before);
    }

    #[tokio::test]
    async fn leaving_unknown_room_is_a_no_op() {
        let registry = InMemoryRegistry::new();
        assert!(registry.leave("nowhere", "a").await.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_joins_never_exceed_capacity() {
        let registry = Arc::new(InMemoryRegistry::new());
        let mut tasks = Vec::new();
        for i in 0..32 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                registry.join("race", member(&format!("p{i}"))).await
            }));
        }

        let mut accepted = 0;
        let mut full = 0;
        for task in tasks {
            match task.await.unwrap() {
                JoinOutcome::Accepted { .. } => accepted += 1,
                JoinOutcome::Full => full += 1,
                JoinOutcome::AlreadyMember => panic!("unique session ids"),
            }
        }
        assert_eq!(accepted, ROOM_CAPACITY);
        assert_eq!(full, 32 - ROOM_CAPACITY);
        assert_eq!(registry.list_members("race").await.len(), ROOM_CAPACITY);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn join_racing_room_removal_lands_in_live_room() {
        let registry = Arc::new(InMemoryRegistry::new());
        for round in 0..50 {
            let a = format!("a{round}");
            registry.join("churn", member(&a)).await;

            let leaver = {
                let registry = registry.clone();
                tokio::spawn(async move { registry.leave("churn", &a).await })
            };
            let joiner = {
                let registry = registry.clone();
                let b = format!("b{round}");
                tokio::spawn(async move { registry.join("churn", member(&b)).await })
            };
            leaver.await.unwrap();
            assert!(matches!(joiner.await.unwrap(), JoinOutcome::Accepted { .. }));

            let members = registry.list_members("churn").await;
            assert_eq!(members.len(), 1);
            registry.leave("churn", &members[0].session_id).await;
            assert_eq!(registry.room_count().await, 0);
        }
    }
}
