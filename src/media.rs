//! Media session manager: the single local capture and one output sink per
//! connected peer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use webrtc::api::media_engine::MIME_TYPE_PCMU;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use crate::error::MediaError;
use crate::link::RemoteAudio;
use crate::protocol::SessionId;

/// PCMU runs at 8 kHz mono.
pub const CLOCK_RATE: u32 = 8000;

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AudioConstraints {
    /// Input device name; the host default when unset.
    pub input_device: Option<String>,
    /// Output device name; the host default when unset.
    pub output_device: Option<String>,
}

/// The local microphone track, shared by every peer session.
#[derive(Clone, Debug)]
pub struct LocalAudioTrack {
    track: Arc<TrackLocalStaticSample>,
    enabled: Arc<AtomicBool>,
}

impl LocalAudioTrack {
    pub fn new() -> Self {
        let track = TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_PCMU.to_owned(),
                clock_rate: CLOCK_RATE,
                channels: 1,
                ..Default::default()
            },
            "audio".to_owned(),
            "meshvoice".to_owned(),
        );
        Self {
            track: Arc::new(track),
            enabled: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn sample_track(&self) -> Arc<TrackLocalStaticSample> {
        self.track.clone()
    }

    pub fn track_local(&self) -> Arc<dyn TrackLocal + Send + Sync> {
        self.track.clone()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    /// True when both handles refer to the same underlying track.
    pub fn same_track(&self, other: &LocalAudioTrack) -> bool {
        Arc::ptr_eq(&self.track, &other.track)
    }
}

impl Default for LocalAudioTrack {
    fn default() -> Self {
        Self::new()
    }
}

/// A running microphone capture feeding the local track.
pub trait CaptureHandle: Send {
    fn stop(&mut self);
}

/// A running playback of one remote participant.
pub trait AudioSink: Send {
    fn close(&mut self);
}

#[async_trait]
pub trait AudioBackend: Send + Sync {
    async fn start_capture(
        &self,
        constraints: &AudioConstraints,
        track: LocalAudioTrack,
    ) -> Result<Box<dyn CaptureHandle>, MediaError>;

    async fn open_sink(
        &self,
        constraints: &AudioConstraints,
        peer: &str,
        remote: Arc<dyn RemoteAudio>,
    ) -> Result<Box<dyn AudioSink>, MediaError>;
}

struct LocalCapture {
    track: LocalAudioTrack,
    handle: Box<dyn CaptureHandle>,
}

pub struct MediaSessionManager {
    backend: Arc<dyn AudioBackend>,
    constraints: Mutex<AudioConstraints>,
    local: Mutex<Option<LocalCapture>>,
    sinks: Mutex<HashMap<SessionId, Box<dyn AudioSink>>>,
}

impl MediaSessionManager {
    pub fn new(backend: Arc<dyn AudioBackend>) -> Self {
        Self {
            backend,
            constraints: Mutex::new(AudioConstraints::default()),
            local: Mutex::new(None),
            sinks: Mutex::new(HashMap::new()),
        }
    }

    /// Start the microphone, or hand back the capture already running.
    pub async fn acquire_local_audio(
        &self,
        constraints: &AudioConstraints,
    ) -> Result<LocalAudioTrack, MediaError> {
        let mut local = self.local.lock().await;
        if let Some(capture) = local.as_ref() {
            return Ok(capture.track.clone());
        }

        let track = LocalAudioTrack::new();
        let handle = self
            .backend
            .start_capture(constraints, track.clone())
            .await?;
        *self.constraints.lock().await = constraints.clone();
        info!("Local audio capture started");
        *local = Some(LocalCapture {
            track: track.clone(),
            handle,
        });
        Ok(track)
    }

    pub async fn local_track(&self) -> Option<LocalAudioTrack> {
        self.local.lock().await.as_ref().map(|c| c.track.clone())
    }

    /// Open the output sink for `peer`, replacing any sink it already has.
    pub async fn attach_remote(
        &self,
        peer: &str,
        remote: Arc<dyn RemoteAudio>,
    ) -> Result<(), MediaError> {
        let mut sinks = self.sinks.lock().await;
        if let Some(mut old) = sinks.remove(peer) {
            debug!(peer, "Replacing existing sink");
            old.close();
        }
        let constraints = self.constraints.lock().await.clone();
        let sink = self.backend.open_sink(&constraints, peer, remote).await?;
        sinks.insert(peer.to_string(), sink);
        debug!(peer, live = sinks.len(), "Sink attached");
        Ok(())
    }

    /// Release the sink for `peer`. Returns whether one existed.
    pub async fn teardown(&self, peer: &str) -> bool {
        match self.sinks.lock().await.remove(peer) {
            Some(mut sink) => {
                sink.close();
                debug!(peer, "Sink released");
                true
            }
            None => false,
        }
    }

    /// Flip the shared track's enabled flag. Returns the new muted state.
    pub async fn toggle_mute(&self) -> bool {
        match self.local.lock().await.as_ref() {
            Some(capture) => {
                let muted = capture.track.is_enabled();
                capture.track.set_enabled(!muted);
                info!(muted, "Local audio mute toggled");
                muted
            }
            None => {
                warn!("Mute toggled without local audio");
                false
            }
        }
    }

    pub async fn is_muted(&self) -> bool {
        self.local
            .lock()
            .await
            .as_ref()
            .is_some_and(|c| !c.track.is_enabled())
    }

    /// Sorted ids of peers with a live sink.
    pub async fn live_sinks(&self) -> Vec<SessionId> {
        let mut peers: Vec<_> = self.sinks.lock().await.keys().cloned().collect();
        peers.sort();
        peers
    }

    /// Close every sink and stop the capture.
    pub async fn release_all(&self) {
        for (peer, mut sink) in self.sinks.lock().await.drain() {
            debug!(peer = %peer, "Sink released");
            sink.close();
        }
        if let Some(mut capture) = self.local.lock().await.take() {
            capture.handle.stop();
            info!("Local audio capture stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{RecordingBackend, SilentRemote};

    fn manager(backend: &Arc<RecordingBackend>) -> MediaSessionManager {
        MediaSessionManager::new(backend.clone())
    }

    #[tokio::test]
    async fn capture_is_a_singleton() {
        let backend = Arc::new(RecordingBackend::new());
        let media = manager(&backend);
        let first = media.acquire_local_audio(&AudioConstraints::default()).await.unwrap();
        let second = media.acquire_local_audio(&AudioConstraints::default()).await.unwrap();
        assert!(first.same_track(&second));
        assert_eq!(backend.captures_started(), 1);
    }

    #[tokio::test]
    async fn acquisition_errors_pass_through() {
        let backend = Arc::new(RecordingBackend::failing(MediaError::PermissionDenied(
            "blocked".into(),
        )));
        let media = manager(&backend);
        let err = media
            .acquire_local_audio(&AudioConstraints::default())
            .await
            .unwrap_err();
        assert_eq!(err, MediaError::PermissionDenied("blocked".into()));
        assert!(media.local_track().await.is_none());
    }

    #[tokio::test]
    async fn reattaching_closes_previous_sink() {
        let backend = Arc::new(RecordingBackend::new());
        let media = manager(&backend);
        media.attach_remote("b", Arc::new(SilentRemote)).await.unwrap();
        media.attach_remote("b", Arc::new(SilentRemote)).await.unwrap();
        assert_eq!(media.live_sinks().await, vec!["b".to_string()]);
        assert_eq!(backend.sinks_opened(), 2);
        assert_eq!(backend.sinks_closed(), 1);
    }

    #[tokio::test]
    async fn toggle_mute_flips_shared_track() {
        let backend = Arc::new(RecordingBackend::new());
        let media = manager(&backend);
        let track = media.acquire_local_audio(&AudioConstraints::default()).await.unwrap();

        assert!(media.toggle_mute().await);
        assert!(!track.is_enabled());
        assert!(media.is_muted().await);

        assert!(!media.toggle_mute().await);
        assert!(track.is_enabled());
    }

    #[tokio::test]
    async fn release_all_stops_everything() {
        let backend = Arc::new(RecordingBackend::new());
        let media = manager(&backend);
        media.acquire_local_audio(&AudioConstraints::default()).await.unwrap();
        media.attach_remote("b", Arc::new(SilentRemote)).await.unwrap();
        media.attach_remote("c", Arc::new(SilentRemote)).await.unwrap();

        media.release_all().await;
        assert!(media.live_sinks().await.is_empty());
        assert_eq!(backend.sinks_closed(), 2);
        assert_eq!(backend.captures_stopped(), 1);
        assert!(!media.teardown("b").await);
    }
}
