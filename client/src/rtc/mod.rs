//! WebRTC Peer Connections
//!
//! [`PeerConnector`] backed by the `webrtc` crate. Every platform callback is
//! forwarded to the mesh dispatch loop through the connection's
//! [`PeerEventSink`].

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use mesh_common::{IceCandidate, SdpType, SessionDescription};
use tracing::{debug, info};
use webrtc::{
    api::{
        interceptor_registry::register_default_interceptors, media_engine::MediaEngine, APIBuilder,
        API,
    },
    ice_transport::{
        ice_candidate::{RTCIceCandidate, RTCIceCandidateInit},
        ice_server::RTCIceServer,
    },
    interceptor::registry::Registry,
    peer_connection::{
        configuration::RTCConfiguration, peer_connection_state::RTCPeerConnectionState,
        sdp::session_description::RTCSessionDescription, signaling_state::RTCSignalingState,
        RTCPeerConnection,
    },
    rtp_transceiver::{
        rtp_codec::{RTCRtpCodecParameters, RTPCodecType},
        rtp_transceiver_direction::RTCRtpTransceiverDirection,
        RTCRtpTransceiverInit,
    },
    track::{track_local::TrackLocal, track_remote::TrackRemote},
};

use crate::audio::{opus_capability, LocalAudioTrack, RemoteAudioSource};
use crate::peer::{
    PeerConnection, PeerConnectionState, PeerConnector, PeerError, PeerEventSink, PeerSignal,
    SignalingState,
};

/// Dynamic payload type browsers use for Opus.
const OPUS_PAYLOAD_TYPE: u8 = 111;

/// Connector sharing one configured WebRTC API across all peers.
pub struct WebRtcConnector {
    api: Arc<API>,
}

impl WebRtcConnector {
    /// Create a connector with an Opus-only media engine.
    pub fn new() -> Result<Self, PeerError> {
        let mut media_engine = MediaEngine::default();

        media_engine
            .register_codec(
                RTCRtpCodecParameters {
                    capability: opus_capability(),
                    payload_type: OPUS_PAYLOAD_TYPE,
                    ..Default::default()
                },
                RTPCodecType::Audio,
            )
            .map_err(|e| PeerError::Api(e.to_string()))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| PeerError::Api(e.to_string()))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        info!("WebRTC connector initialized");

        Ok(Self { api: Arc::new(api) })
    }

    /// STUN-only configuration; no TURN fallback.
    fn rtc_config(ice_servers: &[String]) -> RTCConfiguration {
        let ice_servers = if ice_servers.is_empty() {
            vec![]
        } else {
            vec![RTCIceServer {
                urls: ice_servers.to_vec(),
                ..Default::default()
            }]
        };

        RTCConfiguration {
            ice_servers,
            ..Default::default()
        }
    }
}

#[async_trait]
impl PeerConnector for WebRtcConnector {
    async fn connect(
        &self,
        ice_servers: &[String],
        events: PeerEventSink,
    ) -> Result<Arc<dyn PeerConnection>, PeerError> {
        let pc = Arc::new(
            self.api
                .new_peer_connection(Self::rtc_config(ice_servers))
                .await?,
        );

        wire_callbacks(&pc, &events);

        debug!(
            participant = %events.participant(),
            connection = %events.connection(),
            "Peer connection created"
        );

        Ok(Arc::new(WebRtcPeer { pc }))
    }
}

/// Forward the connection's callbacks to the dispatch loop.
fn wire_callbacks(pc: &Arc<RTCPeerConnection>, events: &PeerEventSink) {
    let sink = events.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let sink = sink.clone();
        Box::pin(async move {
            // `None` marks the end of gathering
            let Some(candidate) = candidate else {
                return;
            };
            match candidate.to_json() {
                Ok(init) => {
                    sink.emit(PeerSignal::LocalCandidate(from_init(init)));
                }
                Err(e) => {
                    debug!("Failed to serialize local candidate: {}", e);
                }
            }
        })
    }));

    let sink = events.clone();
    pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
        let sink = sink.clone();
        Box::pin(async move {
            debug!(participant = %sink.participant(), "Peer connection state changed: {:?}", s);
            sink.emit(PeerSignal::StateChanged(map_state(s)));
        })
    }));

    let sink = events.clone();
    pc.on_track(Box::new(move |track: Arc<TrackRemote>, _receiver, _transceiver| {
        let sink = sink.clone();
        Box::pin(async move {
            info!(
                participant = %sink.participant(),
                "Remote track received: {} ({})",
                track.kind(),
                track.codec().capability.mime_type
            );
            sink.emit(PeerSignal::RemoteTrack(Box::new(WebRtcRemoteAudio { track })));
        })
    }));
}

const fn map_state(state: RTCPeerConnectionState) -> PeerConnectionState {
    match state {
        RTCPeerConnectionState::Connecting => PeerConnectionState::Connecting,
        RTCPeerConnectionState::Connected => PeerConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => PeerConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => PeerConnectionState::Failed,
        RTCPeerConnectionState::Closed => PeerConnectionState::Closed,
        _ => PeerConnectionState::New,
    }
}

fn from_init(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    }
}

fn to_init(candidate: IceCandidate) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: candidate.candidate,
        sdp_mid: candidate.sdp_mid,
        sdp_mline_index: candidate.sdp_mline_index,
        username_fragment: candidate.username_fragment,
    }
}

fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription, PeerError> {
    match desc.kind {
        SdpType::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpType::Answer => RTCSessionDescription::answer(desc.sdp),
    }
    .map_err(|e| PeerError::Sdp(e.to_string()))
}

/// A `webrtc` peer connection.
pub struct WebRtcPeer {
    pc: Arc<RTCPeerConnection>,
}

#[async_trait]
impl PeerConnection for WebRtcPeer {
    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| PeerError::Sdp(e.to_string()))?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| PeerError::Sdp(e.to_string()))?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        self.pc
            .set_local_description(to_rtc(desc)?)
            .await
            .map_err(|e| PeerError::Sdp(e.to_string()))?;
        debug!("Local description set");
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        self.pc
            .set_remote_description(to_rtc(desc)?)
            .await
            .map_err(|e| PeerError::Sdp(e.to_string()))?;
        debug!("Remote description set");
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        self.pc
            .add_ice_candidate(to_init(candidate))
            .await
            .map_err(|e| PeerError::Ice(e.to_string()))
    }

    async fn has_remote_description(&self) -> bool {
        self.pc.remote_description().await.is_some()
    }

    fn signaling_state(&self) -> SignalingState {
        match self.pc.signaling_state() {
            RTCSignalingState::Stable => SignalingState::Stable,
            RTCSignalingState::HaveLocalOffer => SignalingState::HaveLocalOffer,
            RTCSignalingState::HaveRemoteOffer => SignalingState::HaveRemoteOffer,
            RTCSignalingState::Closed => SignalingState::Closed,
            _ => SignalingState::Other,
        }
    }

    async fn attach_track(&self, track: Arc<LocalAudioTrack>) -> Result<(), PeerError> {
        let sender = self
            .pc
            .add_track(track.rtp_track() as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| PeerError::Track(e.to_string()))?;

        // Drain RTCP so interceptors keep running
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while sender.read(&mut buf).await.is_ok() {}
        });

        Ok(())
    }

    async fn add_receive_only_audio(&self) -> Result<(), PeerError> {
        self.pc
            .add_transceiver_from_kind(
                RTPCodecType::Audio,
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Recvonly,
                    send_encodings: vec![],
                }),
            )
            .await
            .map_err(|e| PeerError::Track(e.to_string()))?;
        Ok(())
    }

    async fn close(&self) -> Result<(), PeerError> {
        self.pc.close().await?;
        Ok(())
    }
}

/// Encoded Opus payloads read from a remote RTP track.
struct WebRtcRemoteAudio {
    track: Arc<TrackRemote>,
}

#[async_trait]
impl RemoteAudioSource for WebRtcRemoteAudio {
    async fn next_packet(&mut self) -> Option<Bytes> {
        match self.track.read_rtp().await {
            Ok((packet, _)) => Some(packet.payload),
            Err(e) => {
                debug!("Remote track ended: {}", e);
                None
            }
        }
    }
}
