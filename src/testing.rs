//! In-process stand-ins for audio devices and peer transports.
//!
//! They let the whole client stack run without sound hardware or ICE:
//! `RecordingBackend` counts what the media manager opens and closes, and
//! `LoopbackConnector` hands out links that "connect" as soon as the
//! offer/answer/candidate exchange has been carried out.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::json;
use tokio::sync::mpsc;

use crate::error::{MediaError, NegotiationError};
use crate::link::{LinkEvent, LinkEventKind, LinkState, PeerConnector, PeerLink, RemoteAudio};
use crate::media::{AudioBackend, AudioConstraints, AudioSink, CaptureHandle, LocalAudioTrack};

/// A remote track that never produces audio.
pub struct SilentRemote;

#[async_trait]
impl RemoteAudio for SilentRemote {
    async fn read_packet(&self) -> Option<Bytes> {
        std::future::pending().await
    }
}

#[derive(Default)]
struct Counters {
    captures_started: AtomicUsize,
    captures_stopped: AtomicUsize,
    sinks_opened: AtomicUsize,
    sinks_closed: AtomicUsize,
}

pub struct RecordingBackend {
    counters: Arc<Counters>,
    capture_error: Option<MediaError>,
    sink_error: Option<MediaError>,
}

impl RecordingBackend {
    pub fn new() -> Self {
        Self {
            counters: Arc::new(Counters::default()),
            capture_error: None,
            sink_error: None,
        }
    }

    /// A backend whose microphone always fails with `error`.
    pub fn failing(error: MediaError) -> Self {
        Self {
            counters: Arc::new(Counters::default()),
            capture_error: Some(error),
            sink_error: None,
        }
    }

    /// A backend whose speakers can never be opened.
    pub fn failing_output(error: MediaError) -> Self {
        Self {
            counters: Arc::new(Counters::default()),
            capture_error: None,
            sink_error: Some(error),
        }
    }

    pub fn captures_started(&self) -> usize {
        self.counters.captures_started.load(Ordering::SeqCst)
    }

    pub fn captures_stopped(&self) -> usize {
        self.counters.captures_stopped.load(Ordering::SeqCst)
    }

    pub fn sinks_opened(&self) -> usize {
        self.counters.sinks_opened.load(Ordering::SeqCst)
    }

    pub fn sinks_closed(&self) -> usize {
        self.counters.sinks_closed.load(Ordering::SeqCst)
    }
}

impl Default for RecordingBackend {
    fn default() -> Self {
        Self::new()
    }
}

struct RecordedCapture(Arc<Counters>);

impl CaptureHandle for RecordedCapture {
    fn stop(&mut self) {
        self.0.captures_stopped.fetch_add(1, Ordering::SeqCst);
    }
}

struct RecordedSink(Arc<Counters>);

impl AudioSink for RecordedSink {
    fn close(&mut self) {
        self.0.sinks_closed.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl AudioBackend for RecordingBackend {
    async fn start_capture(
        &self,
        _constraints: &AudioConstraints,
        _track: LocalAudioTrack,
    ) -> Result<Box<dyn CaptureHandle>, MediaError> {
        if let Some(err) = &self.capture_error {
            return Err(err.clone());
        }
        self.counters.captures_started.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(RecordedCapture(self.counters.clone())))
    }

    async fn open_sink(
        &self,
        _constraints: &AudioConstraints,
        _peer: &str,
        _remote: Arc<dyn RemoteAudio>,
    ) -> Result<Box<dyn AudioSink>, MediaError> {
        if let Some(err) = &self.sink_error {
            return Err(err.clone());
        }
        self.counters.sinks_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(RecordedSink(self.counters.clone())))
    }
}

/// Hands out loopback links. A stalled connector's links never gather
/// candidates, so their negotiations can only time out.
pub struct LoopbackConnector {
    stalled: bool,
    opened: AtomicUsize,
}

impl LoopbackConnector {
    pub fn new() -> Self {
        Self {
            stalled: false,
            opened: AtomicUsize::new(0),
        }
    }

    pub fn stalled() -> Self {
        Self {
            stalled: true,
            opened: AtomicUsize::new(0),
        }
    }

    pub fn links_opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }
}

impl Default for LoopbackConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PeerConnector for LoopbackConnector {
    async fn open(
        &self,
        peer: &str,
        attempt: u32,
        _local: &LocalAudioTrack,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Result<Arc<dyn PeerLink>, NegotiationError> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(LoopbackLink {
            peer: peer.to_string(),
            attempt,
            stalled: self.stalled,
            events,
            progress: Mutex::new(Progress::default()),
        }))
    }
}

#[derive(Default)]
struct Progress {
    local_described: bool,
    remote_described: bool,
    remote_candidates: usize,
    connected: bool,
    closed: bool,
}

struct LoopbackLink {
    peer: String,
    attempt: u32,
    stalled: bool,
    events: mpsc::UnboundedSender<LinkEvent>,
    progress: Mutex<Progress>,
}

impl LoopbackLink {
    fn emit(&self, kind: LinkEventKind) {
        let _ = self.events.send(LinkEvent {
            peer: self.peer.clone(),
            attempt: self.attempt,
            kind,
        });
    }

    fn described_locally(&self) {
        if let Ok(mut p) = self.progress.lock() {
            p.local_described = true;
        }
        if !self.stalled {
            self.emit(LinkEventKind::LocalCandidate(json!({
                "candidate": format!("candidate:loopback {}", self.attempt),
                "sdpMid": "0",
                "sdpMLineIndex": 0
            })));
        }
        self.maybe_connect();
    }

    fn maybe_connect(&self) {
        let ready = match self.progress.lock() {
            Ok(mut p) => {
                let ready = !p.connected
                    && !p.closed
                    && p.local_described
                    && p.remote_described
                    && p.remote_candidates > 0;
                if ready {
                    p.connected = true;
                }
                ready
            }
            Err(_) => false,
        };
        if ready {
            self.emit(LinkEventKind::RemoteTrack(Arc::new(SilentRemote)));
            self.emit(LinkEventKind::State(LinkState::Connected));
        }
    }
}

#[async_trait]
impl PeerLink for LoopbackLink {
    async fn create_offer(&self) -> Result<serde_json::Value, NegotiationError> {
        let offer = json!({"type": "offer", "sdp": format!("loopback-offer-{}", self.attempt)});
        self.described_locally();
        Ok(offer)
    }

    async fn accept_offer(
        &self,
        offer: serde_json::Value,
    ) -> Result<serde_json::Value, NegotiationError> {
        if offer.get("type").and_then(|t| t.as_str()) != Some("offer") {
            return Err(NegotiationError::Payload("not an offer".into()));
        }
        if let Ok(mut p) = self.progress.lock() {
            p.remote_described = true;
        }
        let answer = json!({"type": "answer", "sdp": format!("loopback-answer-{}", self.attempt)});
        self.described_locally();
        Ok(answer)
    }

    async fn accept_answer(&self, answer: serde_json::Value) -> Result<(), NegotiationError> {
        if answer.get("type").and_then(|t| t.as_str()) != Some("answer") {
            return Err(NegotiationError::Payload("not an answer".into()));
        }
        if let Ok(mut p) = self.progress.lock() {
            p.remote_described = true;
        }
        self.maybe_connect();
        Ok(())
    }

    async fn add_remote_candidate(
        &self,
        _candidate: serde_json::Value,
    ) -> Result<(), NegotiationError> {
        if let Ok(mut p) = self.progress.lock() {
            if !p.remote_described {
                return Err(NegotiationError::Transport(
                    "candidate before remote description".into(),
                ));
            }
            p.remote_candidates += 1;
        }
        self.maybe_connect();
        Ok(())
    }

    async fn close(&self) {
        if let Ok(mut p) = self.progress.lock() {
            p.closed = true;
        }
    }
}
