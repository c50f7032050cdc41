//! Rooms and the registry that owns them.

mod registry;
mod state;

pub use registry::{InMemoryRegistry, JoinOutcome, RoomRegistry};
pub use state::{AdmitError, ParticipantSession, Room, ROOM_CAPACITY};
