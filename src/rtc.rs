//! Peer links backed by webrtc-rs peer connections.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_remote::TrackRemote;

use crate::error::NegotiationError;
use crate::link::{LinkEvent, LinkEventKind, LinkState, PeerConnector, PeerLink, RemoteAudio};
use crate::media::LocalAudioTrack;

pub struct RtcConnector {
    api: API,
    config: RTCConfiguration,
}

impl RtcConnector {
    pub fn new(ice_servers: &[String]) -> Result<Self, NegotiationError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let mut config = RTCConfiguration::default();
        if !ice_servers.is_empty() {
            config.ice_servers = vec![RTCIceServer {
                urls: ice_servers.to_vec(),
                ..Default::default()
            }];
        }
        Ok(Self { api, config })
    }
}

fn link_state(state: RTCPeerConnectionState) -> Option<LinkState> {
    match state {
        RTCPeerConnectionState::Connected => Some(LinkState::Connected),
        RTCPeerConnectionState::Disconnected => Some(LinkState::Disconnected),
        RTCPeerConnectionState::Failed => Some(LinkState::Failed),
        RTCPeerConnectionState::Closed => Some(LinkState::Closed),
        _ => None,
    }
}

#[async_trait]
impl PeerConnector for RtcConnector {
    async fn open(
        &self,
        peer: &str,
        attempt: u32,
        local: &LocalAudioTrack,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Result<Arc<dyn PeerLink>, NegotiationError> {
        let pc = Arc::new(self.api.new_peer_connection(self.config.clone()).await?);

        let sender = pc.add_track(local.track_local()).await?;
        // RTCP has to be read for interceptors like NACK to work.
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while sender.read(&mut buf).await.is_ok() {}
        });

        let emitter = Emitter {
            peer: peer.to_string(),
            attempt,
            events,
        };

        let on_candidate = emitter.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let emitter = on_candidate.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate
                    .to_json()
                    .map_err(NegotiationError::from)
                    .and_then(|init| serde_json::to_value(init).map_err(NegotiationError::from))
                {
                    Ok(value) => emitter.emit(LinkEventKind::LocalCandidate(value)),
                    Err(e) => warn!(peer = %emitter.peer, error = %e, "Dropping local candidate"),
                }
            })
        }));

        let on_state = emitter.clone();
        pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            let emitter = on_state.clone();
            Box::pin(async move {
                debug!(peer = %emitter.peer, attempt = emitter.attempt, state = %s, "Peer connection state");
                if let Some(state) = link_state(s) {
                    emitter.emit(LinkEventKind::State(state));
                }
            })
        }));

        let on_track = emitter;
        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let emitter = on_track.clone();
                Box::pin(async move {
                    if track.kind() != RTPCodecType::Audio {
                        return;
                    }
                    info!(
                        peer = %emitter.peer,
                        codec = %track.codec().capability.mime_type,
                        "Remote audio track"
                    );
                    emitter.emit(LinkEventKind::RemoteTrack(Arc::new(RtcRemoteAudio { track })));
                })
            },
        ));

        Ok(Arc::new(RtcPeerLink {
            peer: peer.to_string(),
            pc,
        }))
    }
}

#[derive(Clone)]
struct Emitter {
    peer: String,
    attempt: u32,
    events: mpsc::UnboundedSender<LinkEvent>,
}

impl Emitter {
    fn emit(&self, kind: LinkEventKind) {
        let _ = self.events.send(LinkEvent {
            peer: self.peer.clone(),
            attempt: self.attempt,
            kind,
        });
    }
}

struct RtcPeerLink {
    peer: String,
    pc: Arc<RTCPeerConnection>,
}

#[async_trait]
impl PeerLink for RtcPeerLink {
    async fn create_offer(&self) -> Result<serde_json::Value, NegotiationError> {
        let offer = self.pc.create_offer(None).await?;
        self.pc.set_local_description(offer.clone()).await?;
        Ok(serde_json::to_value(offer)?)
    }

    async fn accept_offer(
        &self,
        offer: serde_json::Value,
    ) -> Result<serde_json::Value, NegotiationError> {
        let offer: RTCSessionDescription = serde_json::from_value(offer)?;
        self.pc.set_remote_description(offer).await?;

        let answer = self.pc.create_answer(None).await?;
        self.pc.set_local_description(answer.clone()).await?;
        Ok(serde_json::to_value(answer)?)
    }

    async fn accept_answer(&self, answer: serde_json::Value) -> Result<(), NegotiationError> {
        let answer: RTCSessionDescription = serde_json::from_value(answer)?;
        self.pc.set_remote_description(answer).await?;
        Ok(())
    }

    async fn add_remote_candidate(
        &self,
        candidate: serde_json::Value,
    ) -> Result<(), NegotiationError> {
        let candidate: RTCIceCandidateInit = serde_json::from_value(candidate)?;
        self.pc.add_ice_candidate(candidate).await?;
        Ok(())
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            debug!(peer = %self.peer, error = %e, "Error closing peer connection");
        }
    }
}

struct RtcRemoteAudio {
    track: Arc<TrackRemote>,
}

#[async_trait]
impl RemoteAudio for RtcRemoteAudio {
    async fn read_packet(&self) -> Option<Bytes> {
        match self.track.read_rtp().await {
            Ok((packet, _)) => Some(packet.payload),
            Err(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_settled_connection_states_are_reported() {
        assert_eq!(
            link_state(RTCPeerConnectionState::Connected),
            Some(LinkState::Connected)
        );
        assert_eq!(
            link_state(RTCPeerConnectionState::Failed),
            Some(LinkState::Failed)
        );
        assert_eq!(link_state(RTCPeerConnectionState::Connecting), None);
        assert_eq!(link_state(RTCPeerConnectionState::New), None);
    }

    #[tokio::test]
    async fn two_links_exchange_descriptions() {
        let connector = RtcConnector::new(&[]).unwrap();
        let track = LocalAudioTrack::new();
        let (tx, _rx) = mpsc::unbounded_channel();

        let a = connector.open("b", 1, &track, tx.clone()).await.unwrap();
        let b = connector.open("a", 1, &track, tx).await.unwrap();

        let offer = a.create_offer().await.unwrap();
        assert_eq!(offer["type"], "offer");
        let answer = b.accept_offer(offer).await.unwrap();
        assert_eq!(answer["type"], "answer");
        a.accept_answer(answer).await.unwrap();

        a.close().await;
        b.close().await;
    }
}
