//! Peer session negotiator.
//!
//! One [`PeerSession`] per remote participant, driven through
//! `New → OfferExchanged → AnswerExchanged → CandidateExchange → Connected`
//! and ending in `Closed` or `Failed`. The member that was in the room first
//! always initiates, so two offers never cross.
//!
//! Every offer/answer/candidate payload carries the negotiation attempt it
//! belongs to. A failed negotiation is retried exactly once with a fresh
//! attempt number; anything tagged with an older attempt is discarded.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{ErrorCode, NegotiationError};
use crate::link::{LinkEvent, LinkEventKind, LinkState, PeerConnector, PeerLink, RemoteAudio};
use crate::media::{LocalAudioTrack, MediaSessionManager};
use crate::protocol::{NegotiationKind, NegotiationMessage, SessionId};

pub const NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    New,
    OfferExchanged,
    AnswerExchanged,
    CandidateExchange,
    Connected,
    Closed,
    Failed,
}

impl PeerState {
    pub fn is_terminal(self) -> bool {
        matches!(self, PeerState::Closed | PeerState::Failed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DescriptionPayload {
    attempt: u32,
    description: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CandidatePayload {
    attempt: u32,
    candidate: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deadline {
    pub peer: SessionId,
    pub attempt: u32,
}

#[derive(Debug)]
pub enum PeerEvent {
    Link(LinkEvent),
    Deadline(Deadline),
}

/// Receiving half of everything the negotiator's links and timers report.
pub struct PeerEvents {
    links: mpsc::UnboundedReceiver<LinkEvent>,
    deadlines: mpsc::UnboundedReceiver<Deadline>,
}

impl PeerEvents {
    pub async fn recv(&mut self) -> Option<PeerEvent> {
        tokio::select! {
            Some(ev) = self.links.recv() => Some(PeerEvent::Link(ev)),
            Some(d) = self.deadlines.recv() => Some(PeerEvent::Deadline(d)),
            else => None,
        }
    }

    pub fn try_recv(&mut self) -> Option<PeerEvent> {
        if let Ok(ev) = self.links.try_recv() {
            return Some(PeerEvent::Link(ev));
        }
        self.deadlines.try_recv().ok().map(PeerEvent::Deadline)
    }
}

/// Read-only view of one peer session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSnapshot {
    pub remote: SessionId,
    pub role: Role,
    pub state: PeerState,
    pub attempt: u32,
    /// Why the most recent attempt failed, until the pair connects.
    pub error: Option<ErrorCode>,
}

struct PeerSession {
    role: Role,
    state: PeerState,
    attempt: u32,
    retried: bool,
    error: Option<ErrorCode>,
    link: Option<Arc<dyn PeerLink>>,
    remote_track: Option<Arc<dyn RemoteAudio>>,
    remote_described: bool,
    pending_candidates: Vec<(u32, serde_json::Value)>,
    deadline: Option<(u32, JoinHandle<()>)>,
}

impl PeerSession {
    fn new(role: Role, attempt: u32) -> Self {
        Self {
            role,
            state: PeerState::New,
            attempt,
            retried: false,
            error: None,
            link: None,
            remote_track: None,
            remote_described: false,
            pending_candidates: Vec::new(),
            deadline: None,
        }
    }

    fn cancel_deadline(&mut self) {
        if let Some((_, handle)) = self.deadline.take() {
            handle.abort();
        }
    }

    /// Drop everything tied to the current attempt. Returns the link so the
    /// caller can close it outside the borrow.
    fn reset_attempt(&mut self) -> Option<Arc<dyn PeerLink>> {
        self.cancel_deadline();
        self.remote_track = None;
        self.remote_described = false;
        self.link.take()
    }
}

impl Drop for PeerSession {
    fn drop(&mut self) {
        self.cancel_deadline();
    }
}

pub struct Negotiator {
    local_id: SessionId,
    connector: Arc<dyn PeerConnector>,
    media: Arc<MediaSessionManager>,
    local_track: LocalAudioTrack,
    timeout: Duration,
    sessions: HashMap<SessionId, PeerSession>,
    outbox: Vec<NegotiationMessage>,
    link_tx: mpsc::UnboundedSender<LinkEvent>,
    deadline_tx: mpsc::UnboundedSender<Deadline>,
}

impl Negotiator {
    pub fn new(
        local_id: SessionId,
        connector: Arc<dyn PeerConnector>,
        media: Arc<MediaSessionManager>,
        local_track: LocalAudioTrack,
        timeout: Duration,
    ) -> (Self, PeerEvents) {
        let (link_tx, links) = mpsc::unbounded_channel();
        let (deadline_tx, deadlines) = mpsc::unbounded_channel();
        let negotiator = Self {
            local_id,
            connector,
            media,
            local_track,
            timeout,
            sessions: HashMap::new(),
            outbox: Vec::new(),
            link_tx,
            deadline_tx,
        };
        (negotiator, PeerEvents { links, deadlines })
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    /// Messages produced since the last drain, in the order they must be sent.
    pub fn drain_outbox(&mut self) -> Vec<NegotiationMessage> {
        std::mem::take(&mut self.outbox)
    }

    pub fn peer(&self, remote: &str) -> Option<PeerSnapshot> {
        self.sessions.get(remote).map(|s| PeerSnapshot {
            remote: remote.to_string(),
            role: s.role,
            state: s.state,
            attempt: s.attempt,
            error: s.error,
        })
    }

    pub fn peers(&self) -> Vec<PeerSnapshot> {
        let mut peers: Vec<_> = self
            .sessions
            .keys()
            .filter_map(|remote| self.peer(remote))
            .collect();
        peers.sort_by(|a, b| a.remote.cmp(&b.remote));
        peers
    }

    pub fn connected_count(&self) -> usize {
        self.sessions
            .values()
            .filter(|s| s.state == PeerState::Connected)
            .count()
    }

    /// A newcomer entered the room; we were here first, so we initiate.
    pub async fn on_participant_joined(&mut self, peer: &str) {
        if peer == self.local_id {
            return;
        }
        if self.sessions.contains_key(peer) {
            debug!(peer, "Duplicate join event ignored");
            return;
        }
        info!(peer, "Initiating negotiation");
        self.sessions
            .insert(peer.to_string(), PeerSession::new(Role::Initiator, 1));
        if let Err(e) = self.offer(peer).await {
            self.fail(peer, e).await;
        }
    }

    pub async fn on_participant_left(&mut self, peer: &str) {
        self.close_session(peer, "participant left").await;
    }

    pub async fn on_message(&mut self, msg: NegotiationMessage) {
        if msg.to != self.local_id {
            debug!(to = %msg.to, "Negotiation message for previous identity dropped");
            return;
        }
        let from = msg.from.clone();
        match msg.kind {
            NegotiationKind::Offer => match serde_json::from_value(msg.payload) {
                Ok(payload) => self.on_offer(&from, payload).await,
                Err(e) => warn!(peer = %from, error = %e, "Malformed offer"),
            },
            NegotiationKind::Answer => match serde_json::from_value(msg.payload) {
                Ok(payload) => self.on_answer(&from, payload).await,
                Err(e) => warn!(peer = %from, error = %e, "Malformed answer"),
            },
            NegotiationKind::IceCandidate => match serde_json::from_value(msg.payload) {
                Ok(payload) => self.on_candidate(&from, payload).await,
                Err(e) => warn!(peer = %from, error = %e, "Malformed candidate"),
            },
        }
    }

    pub async fn on_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::Link(ev) => self.on_link_event(ev).await,
            PeerEvent::Deadline(Deadline { peer, attempt }) => {
                let expired = self.sessions.get(&peer).is_some_and(|s| {
                    s.attempt == attempt
                        && !s.state.is_terminal()
                        && s.state != PeerState::Connected
                });
                if expired {
                    warn!(peer = %peer, attempt, "Negotiation timed out");
                    let err = NegotiationError::Timeout { peer: peer.clone() };
                    self.fail(&peer, err).await;
                } else {
                    debug!(peer = %peer, attempt, "Stale negotiation deadline ignored");
                }
            }
        }
    }

    /// Close every session; used on leave and on any terminal exit.
    pub async fn close_all(&mut self) {
        let peers: Vec<SessionId> = self.sessions.keys().cloned().collect();
        for peer in peers {
            self.close_session(&peer, "local teardown").await;
        }
        self.outbox.clear();
    }

    /// Adopt a new signaling identity after rejoining. Peers see us as a
    /// newcomer and re-offer, so every existing session is superseded.
    pub async fn reset_identity(&mut self, local_id: SessionId) {
        self.close_all().await;
        self.local_id = local_id;
    }

    async fn on_offer(&mut self, from: &str, payload: DescriptionPayload) {
        let attempt = payload.attempt;
        match self.sessions.get_mut(from) {
            None => {
                info!(peer = from, attempt, "First contact, responding");
                self.sessions
                    .insert(from.to_string(), PeerSession::new(Role::Responder, attempt));
            }
            Some(session) => {
                if session.role == Role::Initiator {
                    warn!(peer = from, "Offer from a peer we initiate to; ignored");
                    return;
                }
                if session.state.is_terminal()
                    || attempt < session.attempt
                    || (attempt == session.attempt && session.state != PeerState::New)
                {
                    debug!(peer = from, attempt, "Stale or duplicate offer dropped");
                    return;
                }
                if attempt > session.attempt {
                    info!(peer = from, attempt, "Peer restarted negotiation");
                    session.attempt = attempt;
                    session.retried = true;
                    session.state = PeerState::New;
                    session.pending_candidates.retain(|(a, _)| *a == attempt);
                    let old = session.reset_attempt();
                    if let Some(link) = old {
                        link.close().await;
                    }
                    self.media.teardown(from).await;
                }
            }
        }

        self.arm_deadline(from, attempt);
        if let Err(e) = self.answer(from, attempt, payload.description).await {
            self.fail(from, e).await;
        }
    }

    async fn answer(
        &mut self,
        peer: &str,
        attempt: u32,
        offer: serde_json::Value,
    ) -> Result<(), NegotiationError> {
        let link = self.open_link(peer, attempt).await?;
        let answer = link.accept_offer(offer).await?;
        if let Some(session) = self.sessions.get_mut(peer) {
            session.remote_described = true;
            session.state = PeerState::AnswerExchanged;
        }
        self.push(
            peer,
            NegotiationKind::Answer,
            &DescriptionPayload {
                attempt,
                description: answer,
            },
        );
        self.flush_candidates(peer).await;
        Ok(())
    }

    async fn on_answer(&mut self, from: &str, payload: DescriptionPayload) {
        let link = match self.sessions.get(from) {
            Some(s)
                if s.role == Role::Initiator
                    && s.attempt == payload.attempt
                    && s.state == PeerState::OfferExchanged =>
            {
                s.link.clone()
            }
            _ => {
                debug!(peer = from, attempt = payload.attempt, "Unexpected answer dropped");
                return;
            }
        };
        let Some(link) = link else {
            return;
        };

        if let Err(e) = link.accept_answer(payload.description).await {
            self.fail(from, e).await;
            return;
        }
        if let Some(session) = self.sessions.get_mut(from) {
            session.remote_described = true;
            session.state = PeerState::AnswerExchanged;
        }
        self.flush_candidates(from).await;
    }

    async fn on_candidate(&mut self, from: &str, payload: CandidatePayload) {
        let attempt = payload.attempt;
        if !self.sessions.contains_key(from) {
            info!(peer = from, attempt, "First contact via candidate, responding");
            self.sessions
                .insert(from.to_string(), PeerSession::new(Role::Responder, attempt));
            self.arm_deadline(from, attempt);
        }
        let Some(session) = self.sessions.get_mut(from) else {
            return;
        };

        if session.state.is_terminal() || attempt < session.attempt {
            debug!(peer = from, attempt, "Stale candidate dropped");
            return;
        }
        if attempt > session.attempt {
            if session.role == Role::Initiator {
                debug!(peer = from, attempt, "Candidate from the future dropped");
                return;
            }
            info!(peer = from, attempt, "Peer restarted negotiation");
            session.attempt = attempt;
            session.retried = true;
            session.state = PeerState::New;
            session.pending_candidates.clear();
            let old = session.reset_attempt();
            session.pending_candidates.push((attempt, payload.candidate));
            if let Some(link) = old {
                link.close().await;
            }
            self.media.teardown(from).await;
            self.arm_deadline(from, attempt);
            return;
        }

        if !session.remote_described {
            session.pending_candidates.push((attempt, payload.candidate));
            return;
        }
        let link = session.link.clone();
        if session.state == PeerState::AnswerExchanged {
            session.state = PeerState::CandidateExchange;
        }
        if let Some(link) = link {
            if let Err(e) = link.add_remote_candidate(payload.candidate).await {
                warn!(peer = from, error = %e, "Remote candidate rejected");
            }
        }
    }

    async fn on_link_event(&mut self, ev: LinkEvent) {
        let LinkEvent {
            peer,
            attempt,
            kind,
        } = ev;
        let Some(session) = self.sessions.get_mut(&peer) else {
            debug!(peer = %peer, ?kind, "Event for unknown peer ignored");
            return;
        };
        if session.attempt != attempt || session.state.is_terminal() {
            debug!(peer = %peer, attempt, ?kind, "Event from superseded link ignored");
            return;
        }

        match kind {
            LinkEventKind::LocalCandidate(candidate) => {
                if session.state == PeerState::AnswerExchanged {
                    session.state = PeerState::CandidateExchange;
                }
                self.push(
                    &peer,
                    NegotiationKind::IceCandidate,
                    &CandidatePayload { attempt, candidate },
                );
            }
            LinkEventKind::RemoteTrack(track) => {
                session.remote_track = Some(track.clone());
                if session.state == PeerState::Connected {
                    self.attach(&peer, track).await;
                }
            }
            LinkEventKind::State(LinkState::Connected) => {
                if session.state == PeerState::Connected {
                    return;
                }
                session.state = PeerState::Connected;
                session.error = None;
                session.cancel_deadline();
                let track = session.remote_track.clone();
                info!(peer = %peer, attempt, "Peer session connected");
                if let Some(track) = track {
                    self.attach(&peer, track).await;
                }
            }
            LinkEventKind::State(LinkState::Disconnected) => {
                debug!(peer = %peer, "Peer transport disconnected, waiting for recovery");
            }
            LinkEventKind::State(LinkState::Failed) => {
                let err = NegotiationError::Transport("transport failed".into());
                self.fail(&peer, err).await;
            }
            LinkEventKind::State(LinkState::Closed) => {
                self.close_session(&peer, "transport closed").await;
            }
        }
    }

    /// Open a link for the session's current attempt and send the offer.
    async fn offer(&mut self, peer: &str) -> Result<(), NegotiationError> {
        let attempt = match self.sessions.get(peer) {
            Some(session) => session.attempt,
            None => return Ok(()),
        };
        let link = self.open_link(peer, attempt).await?;
        let offer = link.create_offer().await?;
        if let Some(session) = self.sessions.get_mut(peer) {
            session.state = PeerState::OfferExchanged;
        }
        self.push(
            peer,
            NegotiationKind::Offer,
            &DescriptionPayload {
                attempt,
                description: offer,
            },
        );
        self.arm_deadline(peer, attempt);
        Ok(())
    }

    async fn open_link(
        &mut self,
        peer: &str,
        attempt: u32,
    ) -> Result<Arc<dyn PeerLink>, NegotiationError> {
        let link = self
            .connector
            .open(peer, attempt, &self.local_track, self.link_tx.clone())
            .await?;
        if let Some(session) = self.sessions.get_mut(peer) {
            session.link = Some(link.clone());
        }
        Ok(link)
    }

    /// Handle a failed attempt: one fresh retry, then terminal `Failed`.
    async fn fail(&mut self, peer: &str, cause: NegotiationError) {
        let mut cause = cause;
        loop {
            let Some(session) = self.sessions.get_mut(peer) else {
                return;
            };
            if session.state.is_terminal() {
                return;
            }
            session.state = PeerState::Failed;
            session.error = Some(cause.code());
            let old = session.reset_attempt();
            session.pending_candidates.clear();
            let retry = !session.retried;
            let role = session.role;
            if retry {
                session.retried = true;
                session.attempt += 1;
                session.state = PeerState::New;
            }
            let attempt = session.attempt;

            if let Some(link) = old {
                link.close().await;
            }
            self.media.teardown(peer).await;

            if !retry {
                warn!(peer, %cause, "Peer unreachable after retry");
                return;
            }
            info!(peer, attempt, %cause, "Retrying negotiation");

            match role {
                Role::Responder => {
                    self.arm_deadline(peer, attempt);
                    return;
                }
                Role::Initiator => match self.offer(peer).await {
                    Ok(()) => return,
                    Err(e) => cause = e,
                },
            }
        }
    }

    async fn close_session(&mut self, peer: &str, reason: &str) {
        let Some(mut session) = self.sessions.remove(peer) else {
            return;
        };
        session.state = PeerState::Closed;
        if let Some(link) = session.reset_attempt() {
            link.close().await;
        }
        self.media.teardown(peer).await;
        info!(peer, reason, "Peer session closed");
    }

    /// A connected pair without a sink counts as a failed attempt.
    async fn attach(&mut self, peer: &str, track: Arc<dyn RemoteAudio>) {
        if let Err(e) = self.media.attach_remote(peer, track).await {
            warn!(peer, error = %e, "Could not open output sink");
            self.fail(peer, NegotiationError::Sink(e)).await;
        }
    }

    async fn flush_candidates(&mut self, peer: &str) {
        let (link, pending) = match self.sessions.get_mut(peer) {
            Some(session) => {
                let attempt = session.attempt;
                let pending: Vec<_> = std::mem::take(&mut session.pending_candidates)
                    .into_iter()
                    .filter(|(a, _)| *a == attempt)
                    .map(|(_, c)| c)
                    .collect();
                if !pending.is_empty() && session.state == PeerState::AnswerExchanged {
                    session.state = PeerState::CandidateExchange;
                }
                (session.link.clone(), pending)
            }
            None => return,
        };
        let Some(link) = link else {
            return;
        };
        for candidate in pending {
            if let Err(e) = link.add_remote_candidate(candidate).await {
                warn!(peer, error = %e, "Buffered candidate rejected");
            }
        }
    }

    fn arm_deadline(&mut self, peer: &str, attempt: u32) {
        let Some(session) = self.sessions.get_mut(peer) else {
            return;
        };
        if matches!(&session.deadline, Some((armed, _)) if *armed == attempt) {
            return;
        }
        session.cancel_deadline();
        let tx = self.deadline_tx.clone();
        let timeout = self.timeout;
        let peer_id = peer.to_string();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = tx.send(Deadline {
                peer: peer_id,
                attempt,
            });
        });
        session.deadline = Some((attempt, handle));
    }

    fn push<T: Serialize>(&mut self, to: &str, kind: NegotiationKind, payload: &T) {
        match serde_json::to_value(payload) {
            Ok(payload) => self.outbox.push(NegotiationMessage {
                to: to.to_string(),
                from: self.local_id.clone(),
                kind,
                payload,
            }),
            Err(e) => warn!(peer = to, error = %e, "Could not encode negotiation payload"),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::error::MediaError;
    use crate::media::AudioConstraints;
    use crate::testing::{LoopbackConnector, RecordingBackend};

    struct Side {
        negotiator: Negotiator,
        events: PeerEvents,
        media: Arc<MediaSessionManager>,
    }

    async fn side(id: &str, connector: Arc<LoopbackConnector>) -> Side {
        side_with(id, connector, RecordingBackend::new()).await
    }

    async fn side_with(id: &str, connector: Arc<LoopbackConnector>, backend: RecordingBackend) -> Side {
        let media = Arc::new(MediaSessionManager::new(Arc::new(backend)));
        let track = media
            .acquire_local_audio(&AudioConstraints::default())
            .await
            .unwrap();
        let (negotiator, events) = Negotiator::new(
            id.to_string(),
            connector,
            media.clone(),
            track,
            NEGOTIATION_TIMEOUT,
        );
        Side {
            negotiator,
            events,
            media,
        }
    }

    /// Shuttle messages and link events between two sides until both go quiet.
    async fn pump(a: &mut Side, b: &mut Side) {
        loop {
            let mut progressed = false;
            for msg in a.negotiator.drain_outbox() {
                progressed = true;
                b.negotiator.on_message(msg).await;
            }
            for msg in b.negotiator.drain_outbox() {
                progressed = true;
                a.negotiator.on_message(msg).await;
            }
            while let Some(ev) = a.events.try_recv() {
                progressed = true;
                a.negotiator.on_event(ev).await;
            }
            while let Some(ev) = b.events.try_recv() {
                progressed = true;
                b.negotiator.on_event(ev).await;
            }
            if !progressed {
                break;
            }
        }
    }

    fn state(side: &Side, peer: &str) -> Option<PeerState> {
        side.negotiator.peer(peer).map(|p| p.state)
    }

    #[tokio::test]
    async fn existing_member_initiates_and_both_connect() {
        let connector = Arc::new(LoopbackConnector::new());
        let mut a = side("a", connector.clone()).await;
        let mut b = side("b", connector.clone()).await;

        a.negotiator.on_participant_joined("b").await;
        assert_eq!(state(&a, "b"), Some(PeerState::OfferExchanged));
        pump(&mut a, &mut b).await;

        let a_view = a.negotiator.peer("b").unwrap();
        let b_view = b.negotiator.peer("a").unwrap();
        assert_eq!(a_view.role, Role::Initiator);
        assert_eq!(b_view.role, Role::Responder);
        assert_eq!(a_view.state, PeerState::Connected);
        assert_eq!(b_view.state, PeerState::Connected);
        assert_eq!(a.media.live_sinks().await, vec!["b".to_string()]);
        assert_eq!(b.media.live_sinks().await, vec!["a".to_string()]);
        assert_eq!(connector.links_opened(), 2);
    }

    #[tokio::test]
    async fn duplicate_join_event_keeps_one_session() {
        let connector = Arc::new(LoopbackConnector::new());
        let mut a = side("a", connector.clone()).await;
        a.negotiator.on_participant_joined("b").await;
        a.negotiator.on_participant_joined("b").await;
        a.negotiator.on_participant_joined("a").await;
        assert_eq!(a.negotiator.peers().len(), 1);
        assert_eq!(a.negotiator.drain_outbox().len(), 1);
        assert_eq!(connector.links_opened(), 1);
    }

    #[tokio::test]
    async fn responder_creates_session_on_first_contact() {
        let connector = Arc::new(LoopbackConnector::new());
        let mut b = side("b", connector).await;
        b.negotiator
            .on_message(NegotiationMessage {
                to: "b".into(),
                from: "stranger".into(),
                kind: NegotiationKind::Offer,
                payload: json!({
                    "attempt": 1,
                    "description": {"type": "offer", "sdp": "x"}
                }),
            })
            .await;
        let view = b.negotiator.peer("stranger").unwrap();
        assert_eq!(view.role, Role::Responder);
        assert_eq!(view.state, PeerState::AnswerExchanged);
        let out = b.negotiator.drain_outbox();
        assert_eq!(out[0].kind, NegotiationKind::Answer);
        assert_eq!(out[0].to, "stranger");
    }

    #[tokio::test]
    async fn early_candidates_are_buffered_until_described() {
        let connector = Arc::new(LoopbackConnector::new());
        let mut b = side("b", connector).await;
        b.negotiator
            .on_message(NegotiationMessage {
                to: "b".into(),
                from: "a".into(),
                kind: NegotiationKind::IceCandidate,
                payload: json!({"attempt": 1, "candidate": {"candidate": "c"}}),
            })
            .await;
        assert_eq!(state(&b, "a"), Some(PeerState::New));

        b.negotiator
            .on_message(NegotiationMessage {
                to: "b".into(),
                from: "a".into(),
                kind: NegotiationKind::Offer,
                payload: json!({"attempt": 1, "description": {"type": "offer", "sdp": "x"}}),
            })
            .await;
        assert_eq!(state(&b, "a"), Some(PeerState::CandidateExchange));
    }

    #[tokio::test]
    async fn leaving_peer_releases_sink() {
        let connector = Arc::new(LoopbackConnector::new());
        let mut a = side("a", connector.clone()).await;
        let mut b = side("b", connector).await;
        a.negotiator.on_participant_joined("b").await;
        pump(&mut a, &mut b).await;
        assert_eq!(a.media.live_sinks().await.len(), 1);

        a.negotiator.on_participant_left("b").await;
        assert!(a.negotiator.peer("b").is_none());
        assert!(a.media.live_sinks().await.is_empty());
    }

    #[tokio::test]
    async fn deadline_after_connect_is_a_no_op() {
        let connector = Arc::new(LoopbackConnector::new());
        let mut a = side("a", connector.clone()).await;
        let mut b = side("b", connector).await;
        a.negotiator.on_participant_joined("b").await;
        pump(&mut a, &mut b).await;

        for _ in 0..2 {
            a.negotiator
                .on_event(PeerEvent::Deadline(Deadline {
                    peer: "b".into(),
                    attempt: 1,
                }))
                .await;
        }
        assert_eq!(state(&a, "b"), Some(PeerState::Connected));
        assert!(a.negotiator.drain_outbox().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_retries_once_then_fails_for_good() {
        let connector = Arc::new(LoopbackConnector::stalled());
        let mut a = side("a", connector.clone()).await;
        let mut b = side("b", connector.clone()).await;
        a.negotiator.on_participant_joined("b").await;
        pump(&mut a, &mut b).await;
        assert_eq!(state(&a, "b"), Some(PeerState::OfferExchanged));

        let first = a.events.recv().await.unwrap();
        assert!(matches!(&first, PeerEvent::Deadline(d) if d.attempt == 1));
        a.negotiator.on_event(first).await;

        let view = a.negotiator.peer("b").unwrap();
        assert_eq!(view.attempt, 2);
        assert_eq!(view.state, PeerState::OfferExchanged);
        assert_eq!(view.error, Some(ErrorCode::NegotiationTimeout));
        let retry = a.negotiator.drain_outbox();
        assert_eq!(retry.len(), 1);
        assert_eq!(retry[0].kind, NegotiationKind::Offer);
        assert_eq!(retry[0].payload["attempt"], 2);

        // A late duplicate of the first deadline changes nothing.
        a.negotiator
            .on_event(PeerEvent::Deadline(Deadline {
                peer: "b".into(),
                attempt: 1,
            }))
            .await;
        assert_eq!(a.negotiator.peer("b").unwrap().attempt, 2);

        let second = a.events.recv().await.unwrap();
        a.negotiator.on_event(second).await;
        assert_eq!(state(&a, "b"), Some(PeerState::Failed));
        assert!(a.negotiator.drain_outbox().is_empty());
        assert_eq!(connector.links_opened(), 3);

        a.negotiator
            .on_event(PeerEvent::Deadline(Deadline {
                peer: "b".into(),
                attempt: 2,
            }))
            .await;
        let view = a.negotiator.peer("b").unwrap();
        assert_eq!(view.state, PeerState::Failed);
        assert_eq!(view.error, Some(ErrorCode::NegotiationTimeout));
        assert!(a.media.live_sinks().await.is_empty());
    }

    #[tokio::test]
    async fn pair_without_an_output_sink_is_retried_then_failed() {
        let connector = Arc::new(LoopbackConnector::new());
        let broken = RecordingBackend::failing_output(MediaError::DeviceBusy("speakers".into()));
        let mut a = side_with("a", connector.clone(), broken).await;
        let mut b = side("b", connector.clone()).await;

        a.negotiator.on_participant_joined("b").await;
        pump(&mut a, &mut b).await;

        let view = a.negotiator.peer("b").unwrap();
        assert_eq!(view.state, PeerState::Failed);
        assert_eq!(view.attempt, 2);
        assert_eq!(view.error, Some(ErrorCode::NegotiationTimeout));
        assert!(a.media.live_sinks().await.is_empty());
        assert_eq!(a.negotiator.connected_count(), 0);
        assert_eq!(connector.links_opened(), 4);

        assert_eq!(state(&b, "a"), Some(PeerState::Connected));
        assert_eq!(b.negotiator.peer("a").unwrap().error, None);
    }

    #[tokio::test]
    async fn retry_offer_supersedes_responder_attempt() {
        let connector = Arc::new(LoopbackConnector::new());
        let mut a = side("a", connector.clone()).await;
        let mut b = side("b", connector).await;
        a.negotiator.on_participant_joined("b").await;
        pump(&mut a, &mut b).await;

        a.negotiator
            .on_event(PeerEvent::Link(LinkEvent {
                peer: "b".into(),
                attempt: 1,
                kind: LinkEventKind::State(LinkState::Failed),
            }))
            .await;
        assert!(a.media.live_sinks().await.is_empty());
        pump(&mut a, &mut b).await;

        assert_eq!(a.negotiator.peer("b").unwrap().attempt, 2);
        assert_eq!(b.negotiator.peer("a").unwrap().attempt, 2);
        assert_eq!(state(&a, "b"), Some(PeerState::Connected));
        assert_eq!(state(&b, "a"), Some(PeerState::Connected));
        assert_eq!(b.media.live_sinks().await, vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn stale_attempt_messages_are_discarded() {
        let connector = Arc::new(LoopbackConnector::new());
        let mut a = side("a", connector.clone()).await;
        let mut b = side("b", connector).await;
        a.negotiator.on_participant_joined("b").await;
        let first_offer = a.negotiator.drain_outbox().remove(0);
        b.negotiator.on_message(first_offer.clone()).await;
        b.negotiator.drain_outbox();
        while b.events.try_recv().is_some() {}

        b.negotiator.on_message(first_offer).await;
        assert!(b.negotiator.drain_outbox().is_empty());
        assert_eq!(b.negotiator.peer("a").unwrap().attempt, 1);
    }

    #[tokio::test]
    async fn close_all_leaves_no_sinks() {
        let connector = Arc::new(LoopbackConnector::new());
        let mut a = side("a", connector.clone()).await;
        let mut b = side("b", connector).await;
        a.negotiator.on_participant_joined("b").await;
        pump(&mut a, &mut b).await;

        a.negotiator.close_all().await;
        assert!(a.negotiator.peers().is_empty());
        assert!(a.media.live_sinks().await.is_empty());
    }
}
