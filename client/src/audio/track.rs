//! Local Audio Track
//!
//! The single outbound microphone track. It is attached, not copied, to every
//! outbound peer connection; its `enabled` bit is the canonical "is
//! transmitting" state.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::watch;
use tracing::debug;
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use super::{CHANNELS, FRAME_SIZE_MS, SAMPLE_RATE};
use crate::peer::PeerError;

/// Opus capability shared by the outbound track and the media engine.
pub(crate) fn opus_capability() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: "audio/opus".to_string(),
        clock_rate: SAMPLE_RATE,
        channels: CHANNELS,
        sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
        rtcp_feedback: vec![],
    }
}

/// Shared outbound microphone track.
pub struct LocalAudioTrack {
    id: String,
    enabled: watch::Sender<bool>,
    rtp: Arc<TrackLocalStaticSample>,
}

impl LocalAudioTrack {
    /// New track, always starting disabled.
    pub fn new() -> Self {
        let id = uuid::Uuid::now_v7().to_string();
        let rtp = Arc::new(TrackLocalStaticSample::new(
            opus_capability(),
            "audio".to_string(),
            format!("mesh-{id}"),
        ));
        let (enabled, _) = watch::channel(false);

        Self { id, enabled, rtp }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_enabled(&self) -> bool {
        *self.enabled.borrow()
    }

    /// Set the enabled bit, returning the previous value.
    pub fn set_enabled(&self, enabled: bool) -> bool {
        let previous = self.enabled.send_replace(enabled);
        if previous != enabled {
            debug!(track = %self.id, enabled, "Local track toggled");
        }
        previous
    }

    /// Observe the enabled bit.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.enabled.subscribe()
    }

    /// WebRTC track handed to peer connections.
    pub fn rtp_track(&self) -> Arc<TrackLocalStaticSample> {
        self.rtp.clone()
    }

    /// Write one encoded frame to every attached connection.
    ///
    /// Frames captured while disabled are discarded; returns whether the frame
    /// was sent.
    pub async fn write_frame(&self, frame: Bytes) -> Result<bool, PeerError> {
        if !self.is_enabled() {
            return Ok(false);
        }

        self.rtp
            .write_sample(&Sample {
                data: frame,
                duration: Duration::from_millis(FRAME_SIZE_MS as u64),
                ..Default::default()
            })
            .await
            .map_err(|e| PeerError::Track(e.to_string()))?;

        Ok(true)
    }
}

impl std::fmt::Debug for LocalAudioTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalAudioTrack")
            .field("id", &self.id)
            .field("enabled", &self.is_enabled())
            .finish_non_exhaustive()
    }
}

impl Default for LocalAudioTrack {
    fn default() -> Self {
        Self::new()
    }
}
