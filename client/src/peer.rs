//! Peer Connection Seam
//!
//! Platform boundary between the mesh and a WebRTC implementation. Platform
//! callbacks (local ICE candidates, connection state, inbound tracks) are not
//! handled in place; they are forwarded to the mesh dispatch loop as
//! [`PeerSignal`]s tagged with the connection that produced them.
//!
//! The callback channel is unbounded. `RTCPeerConnection::close` runs the
//! state-change handler inline, and the loop that calls `close` is the one
//! draining the channel, so forwarding must never wait for room.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use mesh_common::{IceCandidate, ParticipantId, SessionDescription};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

use crate::audio::{LocalAudioTrack, RemoteAudioSource};
use crate::mesh::MeshEvent;

/// Peer connection errors
#[derive(Error, Debug)]
pub enum PeerError {
    #[error("WebRTC API error: {0}")]
    Api(String),
    #[error("SDP error: {0}")]
    Sdp(String),
    #[error("ICE error: {0}")]
    Ice(String),
    #[error("Track error: {0}")]
    Track(String),
    #[error("Peer connection closed")]
    Closed,
}

impl From<webrtc::Error> for PeerError {
    fn from(err: webrtc::Error) -> Self {
        Self::Api(err.to_string())
    }
}

/// Identity of one connection object.
///
/// A participant can be connected, removed and reconnected; callbacks from an
/// earlier connection carry its old id and are dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(pub(crate) u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Offer/answer negotiation state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    Closed,
    Other,
}

/// Transport state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// A platform callback, delivered to the mesh dispatch loop.
pub enum PeerSignal {
    /// A local ICE candidate to send to the remote participant.
    LocalCandidate(IceCandidate),
    /// The connection changed transport state.
    StateChanged(PeerConnectionState),
    /// The remote participant's audio arrived.
    RemoteTrack(Box<dyn RemoteAudioSource>),
}

impl fmt::Debug for PeerSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LocalCandidate(c) => f.debug_tuple("LocalCandidate").field(c).finish(),
            Self::StateChanged(s) => f.debug_tuple("StateChanged").field(s).finish(),
            Self::RemoteTrack(_) => f.write_str("RemoteTrack(..)"),
        }
    }
}

/// Where a connection reports its callbacks.
#[derive(Clone)]
pub struct PeerEventSink {
    participant: ParticipantId,
    connection: ConnectionId,
    tx: mpsc::UnboundedSender<MeshEvent>,
}

impl PeerEventSink {
    pub(crate) const fn new(
        participant: ParticipantId,
        connection: ConnectionId,
        tx: mpsc::UnboundedSender<MeshEvent>,
    ) -> Self {
        Self {
            participant,
            connection,
            tx,
        }
    }

    pub const fn participant(&self) -> &ParticipantId {
        &self.participant
    }

    pub const fn connection(&self) -> ConnectionId {
        self.connection
    }

    /// Forward a callback to the dispatch loop.
    pub fn emit(&self, signal: PeerSignal) {
        let event = MeshEvent::Peer {
            participant: self.participant.clone(),
            connection: self.connection,
            signal,
        };
        if self.tx.send(event).is_err() {
            debug!(
                participant = %self.participant,
                connection = %self.connection,
                "Mesh stopped, dropping peer callback"
            );
        }
    }
}

/// One direct connection to a remote participant.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, PeerError>;

    async fn create_answer(&self) -> Result<SessionDescription, PeerError>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), PeerError>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError>;

    /// Fails if no remote description has been set yet.
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError>;

    async fn has_remote_description(&self) -> bool;

    fn signaling_state(&self) -> SignalingState;

    /// Attach the shared outbound track (sendrecv audio).
    async fn attach_track(&self, track: Arc<LocalAudioTrack>) -> Result<(), PeerError>;

    /// Negotiate audio without sending any (recvonly).
    async fn add_receive_only_audio(&self) -> Result<(), PeerError>;

    async fn close(&self) -> Result<(), PeerError>;
}

/// Factory for peer connections.
#[async_trait]
pub trait PeerConnector: Send + Sync {
    /// Build a connection using the given STUN resolvers, reporting its
    /// callbacks to `events`.
    async fn connect(
        &self,
        ice_servers: &[String],
        events: PeerEventSink,
    ) -> Result<Arc<dyn PeerConnection>, PeerError>;
}
