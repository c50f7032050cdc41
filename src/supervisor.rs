//! Connection supervisor: the per-client room lifecycle.
//!
//! Runs as one actor task that owns the negotiator, so peer state is never
//! shared. The actor is driven by [`SupervisorHandle`] commands, relay
//! messages and peer events, and publishes its state through a
//! [`StatusMonitor`].

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::ClientConfig;
use crate::connection::{ClientStatus, Presence, StatusMonitor, SupervisorState};
use crate::error::{Error, SignalingError};
use crate::link::PeerConnector;
use crate::media::MediaSessionManager;
use crate::negotiator::{Negotiator, PeerEvent, PeerEvents, PeerSnapshot};
use crate::protocol::{reasons, ClientMessage, MemberInfo, ServerMessage, SessionId};
use crate::signaling::{SignalingClient, SignalingConnector};

const COMMAND_CAPACITY: usize = 32;

enum Command {
    Join,
    Leave(oneshot::Sender<()>),
    ToggleMute(oneshot::Sender<bool>),
    Peers(oneshot::Sender<Vec<PeerSnapshot>>),
}

/// Why a room session ended.
enum Exit {
    /// Explicit leave; `None` when the handle itself went away.
    Leave(Option<oneshot::Sender<()>>),
    Failed(SupervisorState, Error),
}

/// An accepted join.
struct Admission {
    client: SignalingClient,
    members: Vec<MemberInfo>,
    /// Relay traffic that overtook our own join result.
    backlog: Vec<ServerMessage>,
}

/// Outcome of one connect-and-join attempt.
enum Attempt {
    Transient(SignalingError),
    Exit(Exit),
}

enum Step {
    Command(Option<Command>),
    Server(Option<ServerMessage>),
    Peer(PeerEvent),
}

pub struct Supervisor {
    config: ClientConfig,
    signaling: Arc<dyn SignalingConnector>,
    connector: Arc<dyn PeerConnector>,
    media: Arc<MediaSessionManager>,
    monitor: StatusMonitor,
}

impl Supervisor {
    pub fn new(
        config: ClientConfig,
        signaling: Arc<dyn SignalingConnector>,
        connector: Arc<dyn PeerConnector>,
        media: Arc<MediaSessionManager>,
    ) -> Self {
        Self {
            config,
            signaling,
            connector,
            media,
            monitor: StatusMonitor::new(),
        }
    }

    /// Start the actor. It stays `Idle` until [`SupervisorHandle::join`].
    pub fn spawn(self) -> SupervisorHandle {
        let (tx, rx) = mpsc::channel(COMMAND_CAPACITY);
        let monitor = self.monitor.clone();
        let task = tokio::spawn(self.run(rx));
        SupervisorHandle {
            commands: tx,
            monitor,
            task,
        }
    }

    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        while let Some(cmd) = commands.recv().await {
            match cmd {
                Command::Join => self.session(&mut commands).await,
                Command::Leave(done) => {
                    let _ = done.send(());
                }
                Command::ToggleMute(reply) => {
                    let muted = self.toggle_mute().await;
                    let _ = reply.send(muted);
                }
                Command::Peers(reply) => {
                    let _ = reply.send(Vec::new());
                }
            }
        }
        self.media.release_all().await;
        debug!("Supervisor stopped");
    }

    /// One pass through the room lifecycle, from media acquisition to an
    /// exit. Every exit runs the same cleanup.
    async fn session(&mut self, commands: &mut mpsc::Receiver<Command>) {
        self.monitor.restart(SupervisorState::AcquiringMedia);
        let exit = self.run_session(commands).await;

        self.media.release_all().await;
        self.monitor.update(|s| {
            s.session_id = None;
            s.members.clear();
            s.peers.clear();
            s.muted = false;
        });
        match exit {
            Exit::Leave(done) => {
                info!(room = %self.config.room_id, "Left room");
                self.monitor.set_state(SupervisorState::Left);
                if let Some(done) = done {
                    let _ = done.send(());
                }
            }
            Exit::Failed(state, err) => {
                error!(
                    room = %self.config.room_id,
                    kind = ?err.kind(),
                    code = %err.code(),
                    error = %err,
                    "Room session ended"
                );
                self.monitor.fail(state, &err);
            }
        }
    }

    async fn run_session(&mut self, commands: &mut mpsc::Receiver<Command>) -> Exit {
        let track = match self.media.acquire_local_audio(&self.config.audio).await {
            Ok(track) => track,
            Err(e) => return Exit::Failed(SupervisorState::MediaError, e.into()),
        };

        let admission = match self.establish(commands, false, &[]).await {
            Ok(admission) => admission,
            Err(exit) => return exit,
        };

        let (mut negotiator, mut events) = Negotiator::new(
            admission.client.session_id().to_string(),
            self.connector.clone(),
            self.media.clone(),
            track,
            self.config.negotiation_timeout(),
        );
        let exit = self
            .joined(commands, admission, &mut negotiator, &mut events)
            .await;
        negotiator.close_all().await;
        exit
    }

    /// Connect and join, retrying transient signaling failures with the
    /// configured backoff. A first connect tries immediately before backing
    /// off; a reconnect waits before every attempt.
    async fn establish(
        &mut self,
        commands: &mut mpsc::Receiver<Command>,
        reconnect: bool,
        peers: &[PeerSnapshot],
    ) -> Result<Admission, Exit> {
        let backoff = self.config.reconnect_backoff();
        let mut delays: Vec<Option<Duration>> = Vec::with_capacity(backoff.len() + 1);
        if !reconnect {
            delays.push(None);
        }
        delays.extend(backoff.into_iter().map(Some));

        let mut last_error = SignalingError::Unavailable("no connection attempts made".into());
        for (i, delay) in delays.into_iter().enumerate() {
            if reconnect {
                self.monitor.set_state(SupervisorState::Reconnecting {
                    attempt: i as u32 + 1,
                });
            } else {
                self.monitor.set_state(SupervisorState::ConnectingSignaling);
            }

            if let Some(delay) = delay {
                let sleep = tokio::time::sleep(delay);
                tokio::pin!(sleep);
                loop {
                    tokio::select! {
                        _ = &mut sleep => break,
                        cmd = commands.recv() => {
                            if let Some(exit) = self.busy_command(cmd, peers).await {
                                return Err(exit);
                            }
                        }
                    }
                }
            }

            match self.connect_and_join(commands, reconnect, peers).await {
                Ok(admission) => return Ok(admission),
                Err(Attempt::Transient(e)) => {
                    warn!(attempt = i + 1, error = %e, "Signaling attempt failed");
                    last_error = e;
                }
                Err(Attempt::Exit(exit)) => return Err(exit),
            }
        }
        Err(Exit::Failed(
            SupervisorState::SignalingError,
            Error::Signaling(last_error),
        ))
    }

    async fn connect_and_join(
        &mut self,
        commands: &mut mpsc::Receiver<Command>,
        reconnect: bool,
        peers: &[PeerSnapshot],
    ) -> Result<Admission, Attempt> {
        let mut client = self
            .signaling
            .connect()
            .await
            .map_err(Attempt::Transient)?;
        if !reconnect {
            self.monitor.set_state(SupervisorState::Joining);
        }
        client
            .send(ClientMessage::Join {
                room_id: self.config.room_id.clone(),
                display_name: self.config.display_name.clone(),
                user_id: self.config.user_id.clone(),
            })
            .await
            .map_err(Attempt::Transient)?;

        let mut backlog = Vec::new();
        loop {
            let step = tokio::select! {
                cmd = commands.recv() => Step::Command(cmd),
                msg = client.receive() => Step::Server(msg),
            };
            match step {
                Step::Command(cmd) => {
                    if let Some(exit) = self.busy_command(cmd, peers).await {
                        return Err(Attempt::Exit(exit));
                    }
                }
                Step::Server(Some(ServerMessage::JoinResult {
                    accepted: true,
                    members,
                    ..
                })) => {
                    info!(
                        room = %self.config.room_id,
                        session = %client.session_id(),
                        members = members.len(),
                        "Joined room"
                    );
                    return Ok(Admission {
                        client,
                        members,
                        backlog,
                    });
                }
                Step::Server(Some(ServerMessage::JoinResult { reason, .. })) => {
                    let reason = reason.unwrap_or_default();
                    let exit = if reason == reasons::FULL {
                        Exit::Failed(
                            SupervisorState::RoomFullError,
                            Error::RoomFull(self.config.room_id.clone()),
                        )
                    } else {
                        Exit::Failed(
                            SupervisorState::SignalingError,
                            SignalingError::Rejected(reason).into(),
                        )
                    };
                    return Err(Attempt::Exit(exit));
                }
                Step::Server(Some(ServerMessage::Welcome { .. })) => {}
                Step::Server(Some(other)) => {
                    debug!(?other, "Holding relay message until joined");
                    backlog.push(other);
                }
                Step::Server(None) => return Err(Attempt::Transient(SignalingError::Closed)),
                Step::Peer(_) => {}
            }
        }
    }

    /// Main loop while a member of the room.
    async fn joined(
        &mut self,
        commands: &mut mpsc::Receiver<Command>,
        admission: Admission,
        negotiator: &mut Negotiator,
        events: &mut PeerEvents,
    ) -> Exit {
        let Admission {
            mut client,
            members,
            backlog,
        } = admission;
        let mut members = member_map(members);
        Self::replay(backlog, &client, negotiator, &mut members).await;

        loop {
            self.publish(client.session_id(), &members, negotiator);

            let step = tokio::select! {
                cmd = commands.recv() => Step::Command(cmd),
                msg = client.receive() => Step::Server(msg),
                Some(ev) = events.recv() => Step::Peer(ev),
            };

            match step {
                Step::Command(None) => {
                    self.send_leave(&client).await;
                    return Exit::Leave(None);
                }
                Step::Command(Some(Command::Leave(done))) => {
                    self.send_leave(&client).await;
                    return Exit::Leave(Some(done));
                }
                Step::Command(Some(Command::Join)) => {
                    debug!("Already in a room session");
                }
                Step::Command(Some(Command::ToggleMute(reply))) => {
                    let muted = self.toggle_mute().await;
                    let _ = reply.send(muted);
                }
                Step::Command(Some(Command::Peers(reply))) => {
                    let _ = reply.send(negotiator.peers());
                }
                Step::Server(Some(msg)) => {
                    Self::on_server_message(msg, negotiator, &mut members).await;
                }
                Step::Server(None) => {
                    warn!(room = %self.config.room_id, "Signaling connection lost");
                    let peers = negotiator.peers();
                    match self.establish(commands, true, &peers).await {
                        Ok(admission) => {
                            info!(session = %admission.client.session_id(), "Rejoined room");
                            negotiator
                                .reset_identity(admission.client.session_id().to_string())
                                .await;
                            client = admission.client;
                            members = member_map(admission.members);
                            Self::replay(admission.backlog, &client, negotiator, &mut members)
                                .await;
                        }
                        Err(exit) => return exit,
                    }
                }
                Step::Peer(ev) => negotiator.on_event(ev).await,
            }

            flush_outbox(&client, negotiator).await;
        }
    }

    /// Apply messages held back while joining, in arrival order.
    async fn replay(
        backlog: Vec<ServerMessage>,
        client: &SignalingClient,
        negotiator: &mut Negotiator,
        members: &mut BTreeMap<SessionId, String>,
    ) {
        if backlog.is_empty() {
            return;
        }
        debug!(count = backlog.len(), "Replaying relay messages received while joining");
        for msg in backlog {
            Self::on_server_message(msg, negotiator, members).await;
        }
        flush_outbox(client, negotiator).await;
    }

    async fn on_server_message(
        msg: ServerMessage,
        negotiator: &mut Negotiator,
        members: &mut BTreeMap<SessionId, String>,
    ) {
        match msg {
            ServerMessage::ParticipantJoined { session_id, name } => {
                info!(peer = %session_id, %name, "Participant joined");
                members.insert(session_id.clone(), name);
                negotiator.on_participant_joined(&session_id).await;
            }
            ServerMessage::ParticipantLeft { session_id } => {
                info!(peer = %session_id, "Participant left");
                members.remove(&session_id);
                negotiator.on_participant_left(&session_id).await;
            }
            ServerMessage::Signal(message) => negotiator.on_message(message).await,
            ServerMessage::Error { message } => warn!(%message, "Relay reported an error"),
            other => debug!(?other, "Unexpected relay message"),
        }
    }

    /// Commands that arrive while connecting. Returns an exit for leave.
    async fn busy_command(&mut self, cmd: Option<Command>, peers: &[PeerSnapshot]) -> Option<Exit> {
        match cmd {
            None => Some(Exit::Leave(None)),
            Some(Command::Leave(done)) => Some(Exit::Leave(Some(done))),
            Some(Command::Join) => None,
            Some(Command::ToggleMute(reply)) => {
                let muted = self.toggle_mute().await;
                let _ = reply.send(muted);
                None
            }
            Some(Command::Peers(reply)) => {
                let _ = reply.send(peers.to_vec());
                None
            }
        }
    }

    async fn send_leave(&self, client: &SignalingClient) {
        self.monitor.set_state(SupervisorState::Leaving);
        let notice = ClientMessage::Leave {
            room_id: self.config.room_id.clone(),
        };
        if let Err(e) = client.send(notice).await {
            debug!(error = %e, "Leave notice not delivered");
        }
    }

    async fn toggle_mute(&mut self) -> bool {
        let muted = self.media.toggle_mute().await;
        self.monitor.update(|s| s.muted = muted);
        muted
    }

    fn publish(
        &self,
        session_id: &str,
        members: &BTreeMap<SessionId, String>,
        negotiator: &Negotiator,
    ) {
        let presence = if members.is_empty() {
            Presence::AloneInRoom
        } else {
            Presence::Active
        };
        let peers = negotiator.peers();
        self.monitor.update(|s| {
            s.session_id = Some(session_id.to_string());
            s.members = members.keys().cloned().collect();
            s.peers = peers;
        });
        self.monitor.set_state(SupervisorState::Joined(presence));
    }
}

fn member_map(members: Vec<MemberInfo>) -> BTreeMap<SessionId, String> {
    members
        .into_iter()
        .map(|m| (m.session_id, m.name))
        .collect()
}

async fn flush_outbox(client: &SignalingClient, negotiator: &mut Negotiator) {
    for msg in negotiator.drain_outbox() {
        if let Err(e) = client.send(ClientMessage::Signal(msg)).await {
            debug!(error = %e, "Negotiation message not sent");
        }
    }
}

/// Controls a running [`Supervisor`].
pub struct SupervisorHandle {
    commands: mpsc::Sender<Command>,
    monitor: StatusMonitor,
    task: JoinHandle<()>,
}

impl SupervisorHandle {
    /// Start a room session, or retry one after a terminal error.
    pub async fn join(&self) {
        if self.commands.send(Command::Join).await.is_err() {
            warn!("Supervisor is not running");
        }
    }

    /// Leave the room and wait for local teardown to finish.
    pub async fn leave(&self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Leave(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }

    /// Returns the new muted state.
    pub async fn toggle_mute(&self) -> bool {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::ToggleMute(tx)).await.is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    pub async fn peer_states(&self) -> Vec<PeerSnapshot> {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Peers(tx)).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub fn status(&self) -> watch::Receiver<ClientStatus> {
        self.monitor.subscribe()
    }

    pub fn snapshot(&self) -> ClientStatus {
        self.monitor.snapshot()
    }

    /// Wait until the published status satisfies `pred`.
    #[allow(clippy::let_and_return)]
    pub async fn wait_for(&self, mut pred: impl FnMut(&ClientStatus) -> bool) -> ClientStatus {
        let mut rx = self.monitor.subscribe();
        let status = match rx.wait_for(|s| pred(s)).await {
            Ok(status) => status.clone(),
            Err(_) => self.monitor.snapshot(),
        };
        status
    }

    /// Kill the actor without any cleanup, as a crashed client would.
    pub fn abort(&self) {
        self.task.abort();
    }
}
