//! Authority Context and UI Status

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use super::ids::{ParticipantId, TeamId};

/// State pushed by the team/moderation authority.
///
/// The mesh reacts to every change of this value; it never mutates it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeshContext {
    /// Local participant.
    pub self_id: ParticipantId,
    /// Team assignment, if any.
    pub team: Option<TeamId>,
    /// Whether the local participant is a moderator.
    #[serde(default)]
    pub moderator: bool,
    /// Teams the moderator is observing (receive-only).
    #[serde(default)]
    pub spectating: BTreeSet<TeamId>,
    /// Snapshot of teams whose voice flag is on.
    #[serde(default)]
    pub voice_enabled: BTreeSet<TeamId>,
}

impl MeshContext {
    /// Context for a plain team member.
    pub fn member(self_id: impl Into<ParticipantId>, team: impl Into<TeamId>) -> Self {
        Self {
            self_id: self_id.into(),
            team: Some(team.into()),
            moderator: false,
            spectating: BTreeSet::new(),
            voice_enabled: BTreeSet::new(),
        }
    }

    /// Context for a moderator observing the given teams.
    pub fn moderator<I, T>(self_id: impl Into<ParticipantId>, spectating: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<TeamId>,
    {
        Self {
            self_id: self_id.into(),
            team: None,
            moderator: true,
            spectating: spectating.into_iter().map(Into::into).collect(),
            voice_enabled: BTreeSet::new(),
        }
    }

    /// Mark a team's voice flag as on in the snapshot.
    #[must_use]
    pub fn with_voice_enabled(mut self, team: impl Into<TeamId>) -> Self {
        self.voice_enabled.insert(team.into());
        self
    }

    /// Whether this context only observes teams and never transmits.
    pub fn is_spectator(&self) -> bool {
        self.moderator && !self.spectating.is_empty()
    }
}

/// Reason local audio capture could not be acquired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureErrorKind {
    /// The user or OS refused microphone access.
    PermissionDenied,
    /// No usable input device.
    DeviceNotFound,
    /// Any other capture failure.
    Capture,
}

/// Read-only projection of mesh state for the UI layer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeshStatus {
    /// Last capture failure, cleared on the next successful acquisition.
    pub capture_error: Option<CaptureErrorKind>,
    /// Whether the local track is currently enabled.
    pub transmitting: bool,
    /// Voice flag per joined team.
    pub voice_enabled: BTreeMap<TeamId, bool>,
    /// Peers whose connection reached `connected`.
    pub connected_peers: usize,
    /// Participants visible per joined team.
    pub roster: BTreeMap<TeamId, BTreeSet<ParticipantId>>,
}
