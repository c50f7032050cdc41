use std::fmt;
use std::sync::Arc;

use tokio::sync::watch;

use crate::error::{Error, ErrorCode};
use crate::negotiator::PeerSnapshot;
use crate::protocol::SessionId;

/// Whether anyone else is in the room with us.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    AloneInRoom,
    Active,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Idle,
    AcquiringMedia,
    ConnectingSignaling,
    Joining,
    Joined(Presence),
    Reconnecting { attempt: u32 },
    Leaving,
    Left,
    MediaError,
    SignalingError,
    RoomFullError,
}

impl SupervisorState {
    /// Terminal error states wait for an explicit retry.
    pub fn is_error(self) -> bool {
        matches!(
            self,
            SupervisorState::MediaError
                | SupervisorState::SignalingError
                | SupervisorState::RoomFullError
        )
    }

    pub fn is_joined(self) -> bool {
        matches!(self, SupervisorState::Joined(_))
    }
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SupervisorState::Idle => write!(f, "Idle"),
            SupervisorState::AcquiringMedia => write!(f, "AcquiringMedia"),
            SupervisorState::ConnectingSignaling => write!(f, "ConnectingSignaling"),
            SupervisorState::Joining => write!(f, "Joining"),
            SupervisorState::Joined(Presence::AloneInRoom) => write!(f, "Joined (alone)"),
            SupervisorState::Joined(Presence::Active) => write!(f, "Joined"),
            SupervisorState::Reconnecting { attempt } => write!(f, "Reconnecting ({attempt})"),
            SupervisorState::Leaving => write!(f, "Leaving"),
            SupervisorState::Left => write!(f, "Left"),
            SupervisorState::MediaError => write!(f, "MediaError"),
            SupervisorState::SignalingError => write!(f, "SignalingError"),
            SupervisorState::RoomFullError => write!(f, "RoomFullError"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientStatus {
    pub state: SupervisorState,
    pub session_id: Option<SessionId>,
    /// Other members of the room, by session id.
    pub members: Vec<SessionId>,
    pub peers: Vec<PeerSnapshot>,
    pub muted: bool,
    pub last_error: Option<String>,
    pub error_code: Option<ErrorCode>,
}

impl Default for ClientStatus {
    fn default() -> Self {
        Self {
            state: SupervisorState::Idle,
            session_id: None,
            members: Vec::new(),
            peers: Vec::new(),
            muted: false,
            last_error: None,
            error_code: None,
        }
    }
}

/// Publishes the client's status to any number of watchers.
#[derive(Clone)]
pub struct StatusMonitor {
    status: Arc<watch::Sender<ClientStatus>>,
}

impl StatusMonitor {
    pub fn new() -> Self {
        let (status, _) = watch::channel(ClientStatus::default());
        Self {
            status: Arc::new(status),
        }
    }

    pub fn set_state(&self, state: SupervisorState) {
        self.status.send_if_modified(|status| {
            if status.state == state {
                return false;
            }
            tracing::debug!(from = %status.state, to = %state, "Client state change");
            status.state = state;
            true
        });
    }

    /// Enter a terminal error state and record what caused it.
    pub fn fail(&self, state: SupervisorState, error: &Error) {
        self.status.send_modify(|status| {
            status.state = state;
            status.last_error = Some(error.to_string());
            status.error_code = Some(error.code());
            status.session_id = None;
            status.members.clear();
            status.peers.clear();
        });
    }

    /// Start over in `state`, forgetting any previous error.
    pub fn restart(&self, state: SupervisorState) {
        self.status.send_modify(|status| {
            status.state = state;
            status.last_error = None;
            status.error_code = None;
        });
    }

    pub fn update(&self, f: impl FnOnce(&mut ClientStatus)) {
        self.status.send_modify(f);
    }

    pub fn snapshot(&self) -> ClientStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ClientStatus> {
        self.status.subscribe()
    }
}

impl Default for StatusMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MediaError;

    #[test]
    fn failure_records_code_and_clears_room_view() {
        let monitor = StatusMonitor::new();
        monitor.update(|s| {
            s.session_id = Some("a".into());
            s.members = vec!["b".into()];
        });
        monitor.fail(
            SupervisorState::MediaError,
            &Error::from(MediaError::DeviceNotFound("no input".into())),
        );

        let status = monitor.snapshot();
        assert!(status.state.is_error());
        assert_eq!(status.error_code, Some(ErrorCode::MediaDeviceNotFound));
        assert!(status.members.is_empty());
        assert!(status.session_id.is_none());
    }

    #[tokio::test]
    async fn unchanged_state_does_not_wake_watchers() {
        let monitor = StatusMonitor::new();
        let mut rx = monitor.subscribe();
        monitor.set_state(SupervisorState::Idle);
        assert!(!rx.has_changed().unwrap());
        monitor.set_state(SupervisorState::Joining);
        assert!(rx.has_changed().unwrap());
        rx.borrow_and_update();
    }
}
