use chrono::{DateTime, Utc};

use crate::protocol::{MemberInfo, RoomId, SessionId};

/// Hard upper bound on room size; the mesh needs n*(n-1)/2 peer sessions.
pub const ROOM_CAPACITY: usize = 5;

/// One signaling connection's membership in a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParticipantSession {
    pub session_id: SessionId,
    pub display_name: String,
    pub joined_at: DateTime<Utc>,
}

impl ParticipantSession {
    pub fn new(session_id: impl Into<SessionId>, display_name: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            display_name: display_name.into(),
            joined_at: Utc::now(),
        }
    }

    pub fn info(&self) -> MemberInfo {
        MemberInfo {
            session_id: self.session_id.clone(),
            name: self.display_name.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmitError {
    Full,
    AlreadyMember,
}

#[derive(Debug, Clone)]
pub struct Room {
    pub id: RoomId,
    capacity: usize,
    members: Vec<ParticipantSession>,
}

impl Room {
    pub fn new(id: RoomId, capacity: usize) -> Self {
        Self {
            id,
            capacity: capacity.min(ROOM_CAPACITY),
            members: Vec::new(),
        }
    }

    /// Admit a participant. Returns the members that were present before it,
    /// in join order.
    pub fn add_member(
        &mut self,
        participant: ParticipantSession,
    ) -> Result<Vec<ParticipantSession>, AdmitError> {
        if self.contains(&participant.session_id) {
            return Err(AdmitError::AlreadyMember);
        }
        if self.is_full() {
            return Err(AdmitError::Full);
        }
        let prior = self.members.clone();
        self.members.push(participant);
        Ok(prior)
    }

    pub fn remove_member(&mut self, session_id: &str) -> Option<ParticipantSession> {
        let idx = self.members.iter().position(|m| m.session_id == session_id)?;
        Some(self.members.remove(idx))
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.members.iter().any(|m| m.session_id == session_id)
    }

    pub fn members(&self) -> &[ParticipantSession] {
        &self.members
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_full(&self) -> bool {
        self.members.len() >= self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_is_clamped_to_five() {
        let room = Room::new("r".into(), 12);
        assert_eq!(room.capacity(), ROOM_CAPACITY);
    }

    #[test]
    fn add_member_returns_prior_members_in_join_order() {
        let mut room = Room::new("r".into(), 5);
        room.add_member(ParticipantSession::new("a", "Ann")).unwrap();
        room.add_member(ParticipantSession::new("b", "Bob")).unwrap();
        let prior = room.add_member(ParticipantSession::new("c", "Cat")).unwrap();
        let ids: Vec<_> = prior.iter().map(|p| p.session_id.as_str()).collect();
        assert_eq!(ids, ["a", "b"]);
    }

    #[test]
    fn full_room_is_left_untouched() {
        let mut room = Room::new("r".into(), 2);
        room.add_member(ParticipantSession::new("a", "Ann")).unwrap();
        room.add_member(ParticipantSession::new("b", "Bob")).unwrap();
        let err = room.add_member(ParticipantSession::new("c", "Cat")).unwrap_err();
        assert_eq!(err, AdmitError::Full);
        assert_eq!(room.members().len(), 2);
        assert!(!room.contains("c"));
    }

    #[test]
    fn same_session_cannot_join_twice() {
        let mut room = Room::new("r".into(), 5);
        room.add_member(ParticipantSession::new("a", "Ann")).unwrap();
        let err = room.add_member(ParticipantSession::new("a", "Ann")).unwrap_err();
        assert_eq!(err, AdmitError::AlreadyMember);
    }

    #[test]
    fn remove_member_empties_room() {
        let mut room = Room::new("r".into(), 5);
        room.add_member(ParticipantSession::new("a", "Ann")).unwrap();
        assert_eq!(room.remove_member("a").map(|p| p.display_name), Some("Ann".into()));
        assert!(room.remove_member("a").is_none());
        assert!(room.is_empty());
    }
}
