//! Signaling relay: room membership plus forwarding of negotiation messages.
//!
//! The relay never sees audio. It tracks one mailbox per signaling
//! connection, consults the room registry for membership, and forwards
//! offers/answers/candidates between members of the same room.

mod auth;
pub mod server;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::protocol::{
    reasons, ClientMessage, MemberInfo, NegotiationMessage, RoomId, ServerMessage, SessionId,
};
use crate::room::{JoinOutcome, ParticipantSession, RoomRegistry};

pub use auth::{AllowAll, Authorizer};

const MAILBOX_CAPACITY: usize = 256;

struct Connection {
    /// Dropped once the mailbox overflows; the pump then drains what is
    /// queued and disconnects.
    tx: Option<mpsc::Sender<ServerMessage>>,
    room: Option<RoomId>,
    last_seen: Instant,
}

/// Cheaply cloneable handle to the relay state.
#[derive(Clone)]
pub struct Relay {
    registry: Arc<dyn RoomRegistry>,
    authorizer: Arc<dyn Authorizer>,
    connections: Arc<RwLock<HashMap<SessionId, Connection>>>,
    forwarded: Arc<AtomicU64>,
}

impl Relay {
    pub fn new(registry: Arc<dyn RoomRegistry>, authorizer: Arc<dyn Authorizer>) -> Self {
        Self {
            registry,
            authorizer,
            connections: Arc::new(RwLock::new(HashMap::new())),
            forwarded: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Register a new signaling connection. The returned mailbox already
    /// holds the `Welcome` carrying the session id.
    pub async fn connect(&self) -> (SessionId, mpsc::Receiver<ServerMessage>) {
        let session_id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
        let _ = tx.try_send(ServerMessage::Welcome {
            session_id: session_id.clone(),
        });
        self.connections.write().await.insert(
            session_id.clone(),
            Connection {
                tx: Some(tx),
                room: None,
                last_seen: Instant::now(),
            },
        );
        debug!(session = %session_id, "Signaling connection registered");
        (session_id, rx)
    }

    /// Dispatch one inbound message from a connection.
    pub async fn handle(&self, session_id: &str, msg: ClientMessage) {
        self.touch(session_id).await;
        match msg {
            ClientMessage::Join {
                room_id,
                display_name,
                user_id,
            } => {
                self.join(session_id, &room_id, &display_name, user_id.as_deref())
                    .await
            }
            ClientMessage::Leave { room_id } => self.leave(session_id, &room_id).await,
            ClientMessage::Signal(message) => self.relay(session_id, message).await,
        }
    }

    pub async fn join(
        &self,
        session_id: &str,
        room_id: &str,
        display_name: &str,
        user_id: Option<&str>,
    ) {
        let current_room = match self.connections.read().await.get(session_id) {
            Some(conn) => conn.room.clone(),
            None => return,
        };
        if current_room.is_some() {
            self.send(session_id, ServerMessage::rejected(reasons::ALREADY_JOINED))
                .await;
            return;
        }

        let name = match self
            .authorizer
            .authorize(user_id, room_id, display_name)
            .await
        {
            Ok(name) => name,
            Err(reason) => {
                info!(room_id, session = %session_id, %reason, "Join denied");
                self.send(session_id, ServerMessage::rejected(reasons::FORBIDDEN))
                    .await;
                return;
            }
        };

        let participant = ParticipantSession::new(session_id, name.clone());
        let prior = match self.registry.join(room_id, participant).await {
            JoinOutcome::Accepted { prior } => prior,
            JoinOutcome::Full => {
                self.send(session_id, ServerMessage::rejected(reasons::FULL))
                    .await;
                return;
            }
            JoinOutcome::AlreadyMember => {
                self.send(session_id, ServerMessage::rejected(reasons::ALREADY_JOINED))
                    .await;
                return;
            }
        };

        // The connection may have dropped while the registry was busy.
        let bound = {
            let mut conns = self.connections.write().await;
            match conns.get_mut(session_id) {
                Some(conn) => {
                    conn.room = Some(room_id.to_string());
                    true
                }
                None => false,
            }
        };
        if !bound {
            self.registry.leave(room_id, session_id).await;
            self.broadcast_left(room_id, session_id).await;
            return;
        }

        let members: Vec<MemberInfo> = prior.iter().map(ParticipantSession::info).collect();
        self.send(session_id, ServerMessage::accepted(members)).await;

        let joined = ServerMessage::ParticipantJoined {
            session_id: session_id.to_string(),
            name,
        };
        for member in &prior {
            self.send(&member.session_id, joined.clone()).await;
        }
    }

    /// Forward a negotiation message to its target if both ends share a room.
    pub async fn relay(&self, from: &str, mut message: NegotiationMessage) {
        message.from = from.to_string();
        let same_room = {
            let conns = self.connections.read().await;
            let sender_room = conns.get(from).and_then(|c| c.room.as_ref());
            match (sender_room, conns.get(&message.to)) {
                (Some(room), Some(target)) => target.room.as_ref() == Some(room),
                _ => false,
            }
        };

        if !same_room {
            debug!(
                from,
                to = %message.to,
                kind = ?message.kind,
                "Dropping negotiation message for non-member"
            );
            return;
        }
        let to = message.to.clone();
        if self.send(&to, ServerMessage::Signal(message)).await {
            self.forwarded.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub async fn leave(&self, session_id: &str, room_id: &str) {
        let left = {
            let mut conns = self.connections.write().await;
            match conns.get_mut(session_id) {
                Some(conn) if conn.room.as_deref() == Some(room_id) => {
                    conn.room = None;
                    true
                }
                _ => false,
            }
        };
        if left {
            self.remove_member(room_id, session_id).await;
        }
    }

    /// Drop a connection entirely; same effect on membership as `leave`.
    pub async fn disconnect(&self, session_id: &str) {
        let conn = self.connections.write().await.remove(session_id);
        let Some(conn) = conn else {
            return;
        };
        debug!(session = %session_id, "Signaling connection closed");
        if let Some(room_id) = conn.room {
            self.remove_member(&room_id, session_id).await;
        }
    }

    /// Record activity on a connection.
    pub async fn touch(&self, session_id: &str) {
        if let Some(conn) = self.connections.write().await.get_mut(session_id) {
            conn.last_seen = Instant::now();
        }
    }

    /// Disconnect sessions silent for longer than `max_idle`.
    pub async fn reap_idle(&self, max_idle: Duration) -> Vec<SessionId> {
        let now = Instant::now();
        let stale: Vec<SessionId> = self
            .connections
            .read()
            .await
            .iter()
            .filter(|(_, conn)| now.duration_since(conn.last_seen) > max_idle)
            .map(|(id, _)| id.clone())
            .collect();

        for session_id in &stale {
            warn!(session = %session_id, "Membership timeout, dropping session");
            self.disconnect(session_id).await;
        }
        stale
    }

    pub async fn members(&self, room_id: &str) -> Vec<ParticipantSession> {
        self.registry.list_members(room_id).await
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn room_count(&self) -> usize {
        self.registry.room_count().await
    }

    /// Total negotiation messages delivered since startup.
    pub fn forwarded_count(&self) -> u64 {
        self.forwarded.load(Ordering::Relaxed)
    }

    async fn remove_member(&self, room_id: &str, session_id: &str) {
        if self.registry.leave(room_id, session_id).await.is_some() {
            self.broadcast_left(room_id, session_id).await;
        }
    }

    async fn broadcast_left(&self, room_id: &str, session_id: &str) {
        let left = ServerMessage::ParticipantLeft {
            session_id: session_id.to_string(),
        };
        for member in self.registry.list_members(room_id).await {
            self.send(&member.session_id, left.clone()).await;
        }
    }

    /// Queue `msg` without waiting. A connection that cannot keep up loses
    /// its mailbox instead of stalling the sender.
    async fn send(&self, session_id: &str, msg: ServerMessage) -> bool {
        let tx = self
            .connections
            .read()
            .await
            .get(session_id)
            .and_then(|c| c.tx.clone());
        let Some(tx) = tx else {
            return false;
        };
        match tx.try_send(msg) {
            Ok(()) => true,
            Err(TrySendError::Closed(_)) => {
                debug!(session = %session_id, "Mailbox closed");
                false
            }
            Err(TrySendError::Full(_)) => {
                warn!(session = %session_id, "Mailbox full, evicting slow connection");
                drop(tx);
                if let Some(conn) = self.connections.write().await.get_mut(session_id) {
                    conn.tx = None;
                }
                false
            }
        }
    }
}
