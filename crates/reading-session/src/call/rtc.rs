//! [`MediaBackend`] over webrtc-rs peer connections.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::debug;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use super::{CallError, LinkSignal, LinkState, MediaBackend, PeerLink};
use crate::protocol::{IceCandidate, SdpKind, SessionDescription};

const STREAM_ID: &str = "reading-sync";

#[derive(Debug, Clone, Deserialize)]
pub struct CallConfig {
    #[serde(default = "default_ice_servers")]
    pub ice_servers: Vec<String>,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ice_servers: default_ice_servers(),
        }
    }
}

fn default_ice_servers() -> Vec<String> {
    vec!["stun:stun.l.google.com:19302".to_string()]
}

#[derive(Clone)]
struct LocalTracks {
    video: Arc<TrackLocalStaticSample>,
    audio: Arc<TrackLocalStaticSample>,
}

pub struct WebRtcMedia {
    api: API,
    config: CallConfig,
    local: Mutex<Option<LocalTracks>>,
}

impl WebRtcMedia {
    pub fn new(config: CallConfig) -> Result<Arc<Self>, CallError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(peer_error)?;
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(peer_error)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();
        Ok(Arc::new(Self {
            api,
            config,
            local: Mutex::new(None),
        }))
    }

    /// Video and audio tracks a capture pipeline writes samples into.
    pub fn local_tracks(
        &self,
    ) -> Option<(Arc<TrackLocalStaticSample>, Arc<TrackLocalStaticSample>)> {
        self.local
            .lock()
            .as_ref()
            .map(|tracks| (Arc::clone(&tracks.video), Arc::clone(&tracks.audio)))
    }

    fn rtc_configuration(&self) -> RTCConfiguration {
        let ice_servers = if self.config.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: self.config.ice_servers.clone(),
                ..Default::default()
            }]
        };
        RTCConfiguration {
            ice_servers,
            ..Default::default()
        }
    }
}

fn peer_error(err: webrtc::Error) -> CallError {
    CallError::Peer(err.to_string())
}

fn link_state(state: RTCPeerConnectionState) -> Option<LinkState> {
    match state {
        RTCPeerConnectionState::Connecting => Some(LinkState::Connecting),
        RTCPeerConnectionState::Connected => Some(LinkState::Connected),
        RTCPeerConnectionState::Failed => Some(LinkState::Failed),
        RTCPeerConnectionState::Closed => Some(LinkState::Closed),
        _ => None,
    }
}

#[async_trait]
impl MediaBackend for WebRtcMedia {
    async fn acquire_local_media(&self) -> Result<(), CallError> {
        let video = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: 90000,
                ..Default::default()
            },
            "video".to_owned(),
            STREAM_ID.to_owned(),
        ));
        let audio = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48000,
                channels: 2,
                ..Default::default()
            },
            "audio".to_owned(),
            STREAM_ID.to_owned(),
        ));
        *self.local.lock() = Some(LocalTracks { video, audio });
        Ok(())
    }

    async fn release_local_media(&self) {
        self.local.lock().take();
    }

    fn has_local_media(&self) -> bool {
        self.local.lock().is_some()
    }

    async fn connect(
        &self,
        remote_id: &str,
        signals: mpsc::UnboundedSender<LinkSignal>,
    ) -> Result<Arc<dyn PeerLink>, CallError> {
        let pc = Arc::new(
            self.api
                .new_peer_connection(self.rtc_configuration())
                .await
                .map_err(peer_error)?,
        );

        let tracks = self.local.lock().clone();
        match tracks {
            Some(tracks) => {
                for track in [tracks.video, tracks.audio] {
                    pc.add_track(track as Arc<dyn TrackLocal + Send + Sync>)
                        .await
                        .map_err(peer_error)?;
                }
            }
            None => {
                for kind in [RTPCodecType::Video, RTPCodecType::Audio] {
                    pc.add_transceiver_from_kind(
                        kind,
                        Some(RTCRtpTransceiverInit {
                            direction: RTCRtpTransceiverDirection::Recvonly,
                            send_encodings: Vec::new(),
                        }),
                    )
                    .await
                    .map_err(peer_error)?;
                }
            }
        }

        let candidate_tx = signals.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            let tx = candidate_tx.clone();
            Box::pin(async move {
                if let Some(candidate) = candidate {
                    if let Ok(init) = candidate.to_json() {
                        let _ = tx.send(LinkSignal::LocalCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_m_line_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        }));
                    }
                }
            })
        }));

        let state_tx = signals.clone();
        let state_remote = remote_id.to_string();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let tx = state_tx.clone();
            let remote = state_remote.clone();
            Box::pin(async move {
                debug!(
                    target = "reading_session::call",
                    participant_id = %remote,
                    ?state,
                    "peer connection state changed"
                );
                if let Some(state) = link_state(state) {
                    let _ = tx.send(LinkSignal::StateChanged(state));
                }
            })
        }));

        let track_tx = signals;
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let tx = track_tx.clone();
            Box::pin(async move {
                let _ = tx.send(LinkSignal::RemoteTrack(track.kind().to_string()));
            })
        }));

        Ok(Arc::new(WebRtcLink { pc }))
    }
}

struct WebRtcLink {
    pc: Arc<RTCPeerConnection>,
}

#[async_trait]
impl PeerLink for WebRtcLink {
    async fn create_offer(&self) -> Result<SessionDescription, CallError> {
        let offer = self.pc.create_offer(None).await.map_err(peer_error)?;
        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(peer_error)?;
        Ok(SessionDescription {
            kind: SdpKind::Offer,
            sdp: offer.sdp,
        })
    }

    async fn accept_offer(
        &self,
        offer: SessionDescription,
    ) -> Result<SessionDescription, CallError> {
        if offer.kind != SdpKind::Offer {
            return Err(CallError::Signaling("expected an sdp offer".into()));
        }
        let remote = RTCSessionDescription::offer(offer.sdp).map_err(peer_error)?;
        self.pc
            .set_remote_description(remote)
            .await
            .map_err(peer_error)?;
        let answer = self.pc.create_answer(None).await.map_err(peer_error)?;
        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(peer_error)?;
        Ok(SessionDescription {
            kind: SdpKind::Answer,
            sdp: answer.sdp,
        })
    }

    async fn accept_answer(&self, answer: SessionDescription) -> Result<(), CallError> {
        if answer.kind != SdpKind::Answer {
            return Err(CallError::Signaling("expected an sdp answer".into()));
        }
        let remote = RTCSessionDescription::answer(answer.sdp).map_err(peer_error)?;
        self.pc
            .set_remote_description(remote)
            .await
            .map_err(peer_error)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), CallError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_m_line_index,
                username_fragment: candidate.username_fragment,
            })
            .await
            .map_err(peer_error)
    }

    async fn close(&self) {
        if let Err(err) = self.pc.close().await {
            debug!(
                target = "reading_session::call",
                error = %err,
                "peer connection close failed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_states_are_not_reported() {
        assert_eq!(link_state(RTCPeerConnectionState::New), None);
        assert_eq!(link_state(RTCPeerConnectionState::Disconnected), None);
        assert_eq!(
            link_state(RTCPeerConnectionState::Failed),
            Some(LinkState::Failed)
        );
    }

    #[tokio::test]
    async fn offer_carries_local_tracks() {
        let media = WebRtcMedia::new(CallConfig { ice_servers: Vec::new() }).unwrap();
        media.acquire_local_media().await.unwrap();
        assert!(media.has_local_media());

        let (tx, _rx) = mpsc::unbounded_channel();
        let link = media.connect("peer-b", tx).await.unwrap();
        let offer = link.create_offer().await.unwrap();
        assert_eq!(offer.kind, SdpKind::Offer);
        assert!(offer.sdp.starts_with("v=0"));
        assert!(offer.sdp.contains("m=video"));
        assert!(offer.sdp.contains("m=audio"));
        link.close().await;

        media.release_local_media().await;
        assert!(!media.has_local_media());
    }
}
