//! Transport seam between the negotiator and a concrete peer connection.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::NegotiationError;
use crate::media::LocalAudioTrack;
use crate::protocol::SessionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connected,
    /// Connectivity lost; may still recover on its own.
    Disconnected,
    Failed,
    Closed,
}

/// Source of encoded audio packets from one remote participant.
#[async_trait]
pub trait RemoteAudio: Send + Sync {
    /// Next payload, or `None` once the track has ended.
    async fn read_packet(&self) -> Option<Bytes>;
}

pub enum LinkEventKind {
    LocalCandidate(serde_json::Value),
    State(LinkState),
    RemoteTrack(Arc<dyn RemoteAudio>),
}

impl fmt::Debug for LinkEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkEventKind::LocalCandidate(c) => f.debug_tuple("LocalCandidate").field(c).finish(),
            LinkEventKind::State(s) => f.debug_tuple("State").field(s).finish(),
            LinkEventKind::RemoteTrack(_) => f.write_str("RemoteTrack"),
        }
    }
}

/// Something a link reported. Tagged with the negotiation attempt that
/// opened the link so events from a superseded link can be ignored.
#[derive(Debug)]
pub struct LinkEvent {
    pub peer: SessionId,
    pub attempt: u32,
    pub kind: LinkEventKind,
}

/// One direct media path under negotiation. Descriptions and candidates are
/// opaque JSON values carried in negotiation payloads.
#[async_trait]
pub trait PeerLink: Send + Sync {
    async fn create_offer(&self) -> Result<serde_json::Value, NegotiationError>;

    /// Apply a remote offer and produce the answer.
    async fn accept_offer(
        &self,
        offer: serde_json::Value,
    ) -> Result<serde_json::Value, NegotiationError>;

    async fn accept_answer(&self, answer: serde_json::Value) -> Result<(), NegotiationError>;

    async fn add_remote_candidate(
        &self,
        candidate: serde_json::Value,
    ) -> Result<(), NegotiationError>;

    async fn close(&self);
}

#[async_trait]
pub trait PeerConnector: Send + Sync {
    /// Open a link to `peer` carrying the shared local track. Events are
    /// delivered on `events` until the link is closed.
    async fn open(
        &self,
        peer: &str,
        attempt: u32,
        local: &LocalAudioTrack,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Result<Arc<dyn PeerLink>, NegotiationError>;
}
