//! Relay Protocol
//!
//! Events exchanged over team-scoped relay channels. Every frame is
//! `{ channel, sender, message: { event, data } }`; payload fields are
//! camelCase so browser and native participants can share a mesh.

use serde::{Deserialize, Serialize};

use crate::types::{ChannelName, ParticipantId, TeamId};

/// Relay event names.
pub mod events {
    pub const VOICE_ENABLED: &str = "voice:enabled";
    pub const VOICE_DISABLED: &str = "voice:disabled";
    pub const FORCE_MUTE: &str = "voice:force-mute";
    pub const OFFER: &str = "signal:offer";
    pub const ANSWER: &str = "signal:answer";
    pub const ICE_CANDIDATE: &str = "signal:iceCandidate";
    pub const USER_JOINED: &str = "voice:user-joined";
    pub const SPECTATOR_JOINED: &str = "voice:spectator-joined";
    pub const SPECTATOR_LEFT: &str = "voice:spectator-left";

    /// Events bound for the whole lifetime of a channel subscription.
    pub const CONTROL: [&str; 3] = [VOICE_ENABLED, VOICE_DISABLED, FORCE_MUTE];

    /// Events bound only while the channel's team has voice enabled.
    pub const SIGNALING: [&str; 6] = [
        OFFER,
        ANSWER,
        ICE_CANDIDATE,
        USER_JOINED,
        SPECTATOR_JOINED,
        SPECTATOR_LEFT,
    ];
}

/// SDP type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// Session description in its browser JSON form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate in its browser JSON form (`RTCIceCandidateInit`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    /// Candidate with only the candidate line set.
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }
}

/// `voice:enabled` / `voice:disabled`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeamPayload {
    pub team_id: TeamId,
}

/// `voice:force-mute`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForceMutePayload {
    pub target_user_id: ParticipantId,
}

/// `signal:offer` / `signal:answer`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SdpPayload {
    pub from_user_id: ParticipantId,
    pub to_user_id: ParticipantId,
    pub sdp: SessionDescription,
}

/// `signal:iceCandidate`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidatePayload {
    pub from_user_id: ParticipantId,
    pub to_user_id: ParticipantId,
    pub candidate: IceCandidate,
}

/// `voice:user-joined`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserJoinedPayload {
    pub user_id: ParticipantId,
}

/// `voice:spectator-joined` / `voice:spectator-left`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpectatorPayload {
    pub spectator_id: ParticipantId,
}

/// Every event carried on a voice signaling channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum RelayEvent {
    #[serde(rename = "voice:enabled")]
    VoiceEnabled(TeamPayload),
    #[serde(rename = "voice:disabled")]
    VoiceDisabled(TeamPayload),
    #[serde(rename = "voice:force-mute")]
    ForceMute(ForceMutePayload),
    #[serde(rename = "signal:offer")]
    Offer(SdpPayload),
    #[serde(rename = "signal:answer")]
    Answer(SdpPayload),
    #[serde(rename = "signal:iceCandidate")]
    IceCandidate(CandidatePayload),
    #[serde(rename = "voice:user-joined")]
    UserJoined(UserJoinedPayload),
    #[serde(rename = "voice:spectator-joined")]
    SpectatorJoined(SpectatorPayload),
    #[serde(rename = "voice:spectator-left")]
    SpectatorLeft(SpectatorPayload),
}

impl RelayEvent {
    /// Wire name of this event, used as the binding key.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::VoiceEnabled(_) => events::VOICE_ENABLED,
            Self::VoiceDisabled(_) => events::VOICE_DISABLED,
            Self::ForceMute(_) => events::FORCE_MUTE,
            Self::Offer(_) => events::OFFER,
            Self::Answer(_) => events::ANSWER,
            Self::IceCandidate(_) => events::ICE_CANDIDATE,
            Self::UserJoined(_) => events::USER_JOINED,
            Self::SpectatorJoined(_) => events::SPECTATOR_JOINED,
            Self::SpectatorLeft(_) => events::SPECTATOR_LEFT,
        }
    }

    /// Recipient of a point-to-point signaling message.
    pub const fn addressed_to(&self) -> Option<&ParticipantId> {
        match self {
            Self::Offer(p) | Self::Answer(p) => Some(&p.to_user_id),
            Self::IceCandidate(p) => Some(&p.to_user_id),
            _ => None,
        }
    }

    /// Overwrite the `fromUserId` of signaling payloads with `sender`.
    pub fn stamp_sender(&mut self, sender: &ParticipantId) {
        match self {
            Self::Offer(p) | Self::Answer(p) => p.from_user_id = sender.clone(),
            Self::IceCandidate(p) => p.from_user_id = sender.clone(),
            _ => {}
        }
    }
}

/// Envelope exchanged with the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayFrame {
    pub channel: ChannelName,
    /// Publishing participant; absent for authority broadcasts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<ParticipantId>,
    pub message: RelayEvent,
}
