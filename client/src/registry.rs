//! Peer Connection Registry
//!
//! Sole owner of the participant → connection map. Every entry is created and
//! destroyed here; the orchestrator only asks for transitions and publishes
//! the [`Outbound`] messages they produce.
//!
//! Callbacks are tagged with the [`ConnectionId`] of the connection that
//! raised them. A callback whose id no longer matches the registered entry
//! comes from a removed connection and is ignored.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use mesh_common::{
    CandidatePayload, ChannelName, IceCandidate, ParticipantId, RelayEvent, SdpPayload,
    SessionDescription,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::audio::{AudioOutput, LocalAudioTrack, PlaybackSink};
use crate::config::MeshConfig;
use crate::ice::IceCandidateBuffer;
use crate::mesh::MeshEvent;
use crate::peer::{
    ConnectionId, PeerConnection, PeerConnectionState, PeerConnector, PeerError, PeerEventSink,
    PeerSignal, SignalingState,
};

/// Which side of the offer/answer exchange created the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationRole {
    Initiator,
    Responder,
}

/// Outbound media for a new connection.
#[derive(Clone)]
pub enum AudioDirection {
    /// Attach the shared local track.
    SendRecv(Arc<LocalAudioTrack>),
    /// Receive only; spectators and participants without a microphone.
    ReceiveOnly,
}

/// A message the orchestrator must publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    pub channel: ChannelName,
    pub event: RelayEvent,
}

struct PeerEntry {
    channel: ChannelName,
    role: NegotiationRole,
    id: ConnectionId,
    connection: Arc<dyn PeerConnection>,
    state: PeerConnectionState,
    playback: Option<Box<dyn PlaybackSink>>,
}

/// Result of [`PeerRegistry::create`].
pub struct PeerHandle {
    pub connection: Arc<dyn PeerConnection>,
    pub id: ConnectionId,
    /// False when the participant already had a connection.
    pub created: bool,
}

pub struct PeerRegistry {
    self_id: ParticipantId,
    connector: Arc<dyn PeerConnector>,
    output: Arc<dyn AudioOutput>,
    ice_servers: Vec<String>,
    events: mpsc::UnboundedSender<MeshEvent>,
    peers: HashMap<ParticipantId, PeerEntry>,
    candidates: IceCandidateBuffer,
    next_id: u64,
}

impl PeerRegistry {
    pub fn new(
        config: &MeshConfig,
        self_id: ParticipantId,
        connector: Arc<dyn PeerConnector>,
        output: Arc<dyn AudioOutput>,
        events: mpsc::UnboundedSender<MeshEvent>,
    ) -> Self {
        Self {
            self_id,
            connector,
            output,
            ice_servers: config.stun_servers.clone(),
            events,
            peers: HashMap::new(),
            candidates: IceCandidateBuffer::new(config.ice_buffer_cap, config.ice_buffer_ttl),
            next_id: 0,
        }
    }

    pub const fn self_id(&self) -> &ParticipantId {
        &self.self_id
    }

    /// Change the local identity. Only valid with no peers registered.
    pub fn set_self_id(&mut self, self_id: ParticipantId) {
        debug_assert!(self.peers.is_empty());
        self.self_id = self_id;
    }

    /// Get or create the connection to `participant`.
    ///
    /// A second call for a registered participant returns the existing
    /// connection untouched.
    pub async fn create(
        &mut self,
        participant: &ParticipantId,
        channel: &ChannelName,
        role: NegotiationRole,
        audio: AudioDirection,
    ) -> Result<PeerHandle, PeerError> {
        if let Some(entry) = self.peers.get(participant) {
            return Ok(PeerHandle {
                connection: entry.connection.clone(),
                id: entry.id,
                created: false,
            });
        }

        self.next_id += 1;
        let id = ConnectionId(self.next_id);
        let sink = PeerEventSink::new(participant.clone(), id, self.events.clone());
        let connection = self.connector.connect(&self.ice_servers, sink).await?;

        let attached = match audio {
            AudioDirection::SendRecv(track) => connection.attach_track(track).await,
            AudioDirection::ReceiveOnly => connection.add_receive_only_audio().await,
        };
        if let Err(e) = attached {
            let _ = connection.close().await;
            return Err(e);
        }

        self.peers.insert(
            participant.clone(),
            PeerEntry {
                channel: channel.clone(),
                role,
                id,
                connection: connection.clone(),
                state: PeerConnectionState::New,
                playback: None,
            },
        );
        info!(participant = %participant, connection = %id, ?role, "Peer created");

        Ok(PeerHandle {
            connection,
            id,
            created: true,
        })
    }

    /// Create a connection to `participant` and produce the offer.
    ///
    /// Returns `None` if the participant is already registered.
    pub async fn initiate(
        &mut self,
        participant: &ParticipantId,
        channel: &ChannelName,
        audio: AudioDirection,
    ) -> Result<Option<Outbound>, PeerError> {
        let handle = self
            .create(participant, channel, NegotiationRole::Initiator, audio)
            .await?;
        if !handle.created {
            debug!(participant = %participant, "Peer already registered, not initiating");
            return Ok(None);
        }

        match make_offer(handle.connection.as_ref()).await {
            Ok(sdp) => {
                debug!(participant = %participant, "Publishing offer");
                Ok(Some(Outbound {
                    channel: channel.clone(),
                    event: RelayEvent::Offer(SdpPayload {
                        from_user_id: self.self_id.clone(),
                        to_user_id: participant.clone(),
                        sdp,
                    }),
                }))
            }
            Err(e) => {
                self.remove(participant).await;
                Err(e)
            }
        }
    }

    /// Apply a remote offer and produce the answer.
    ///
    /// An offer that collides with our own pending offer is resolved by id:
    /// the participant with the greater id drops its offer and answers, the
    /// other ignores the incoming offer. Returns `None` when ignored.
    pub async fn accept_offer(
        &mut self,
        participant: &ParticipantId,
        channel: &ChannelName,
        sdp: SessionDescription,
        audio: AudioDirection,
    ) -> Result<Option<Outbound>, PeerError> {
        if let Some(entry) = self.peers.get(participant) {
            match entry.connection.signaling_state() {
                SignalingState::Stable => {}
                SignalingState::HaveLocalOffer if self.self_id > *participant => {
                    // Buffered candidates belong to the remote offer, keep them
                    info!(participant = %participant, "Offer collision, yielding to remote offer");
                    self.close_entry(participant).await;
                }
                state => {
                    warn!(participant = %participant, ?state, "Ignoring offer during negotiation");
                    return Ok(None);
                }
            }
        }

        let handle = self
            .create(participant, channel, NegotiationRole::Responder, audio)
            .await?;
        let connection = handle.connection;

        let answer = match self.answer(participant, connection.as_ref(), sdp).await {
            Ok(answer) => answer,
            Err(e) => {
                self.remove_if_current(participant, handle.id).await;
                return Err(e);
            }
        };

        debug!(participant = %participant, "Publishing answer");
        Ok(Some(Outbound {
            channel: channel.clone(),
            event: RelayEvent::Answer(SdpPayload {
                from_user_id: self.self_id.clone(),
                to_user_id: participant.clone(),
                sdp: answer,
            }),
        }))
    }

    async fn answer(
        &mut self,
        participant: &ParticipantId,
        connection: &dyn PeerConnection,
        offer: SessionDescription,
    ) -> Result<SessionDescription, PeerError> {
        connection.set_remote_description(offer).await?;
        self.candidates
            .drain_if_ready(participant, connection)
            .await;
        let answer = connection.create_answer().await?;
        connection.set_local_description(answer.clone()).await?;
        Ok(answer)
    }

    /// Apply a remote answer.
    ///
    /// Only applied while our offer is outstanding; duplicate and late
    /// answers are ignored. Returns whether the answer was applied.
    pub async fn accept_answer(
        &mut self,
        participant: &ParticipantId,
        sdp: SessionDescription,
    ) -> Result<bool, PeerError> {
        let Some(entry) = self.peers.get(participant) else {
            debug!(participant = %participant, "Answer for unknown peer");
            return Ok(false);
        };

        let state = entry.connection.signaling_state();
        if state != SignalingState::HaveLocalOffer {
            debug!(participant = %participant, ?state, "Ignoring answer outside have-local-offer");
            return Ok(false);
        }

        let connection = entry.connection.clone();
        let id = entry.id;
        if let Err(e) = connection.set_remote_description(sdp).await {
            self.remove_if_current(participant, id).await;
            return Err(e);
        }
        self.candidates
            .drain_if_ready(participant, connection.as_ref())
            .await;
        Ok(true)
    }

    /// Buffer a remote candidate, applying it at once if the connection is
    /// ready. Returns the number of candidates applied.
    pub async fn add_remote_candidate(
        &mut self,
        participant: &ParticipantId,
        candidate: IceCandidate,
    ) -> usize {
        self.candidates.add(participant, candidate);

        let Some(connection) = self.peers.get(participant).map(|e| e.connection.clone()) else {
            debug!(participant = %participant, "Buffered candidate for unknown peer");
            return 0;
        };
        self.candidates
            .drain_if_ready(participant, connection.as_ref())
            .await
    }

    /// Handle a platform callback. Returns a message to publish, if any.
    pub async fn on_peer_signal(
        &mut self,
        participant: &ParticipantId,
        id: ConnectionId,
        signal: PeerSignal,
    ) -> Option<Outbound> {
        let Some(entry) = self.peers.get_mut(participant) else {
            debug!(participant = %participant, connection = %id, "Callback for removed peer");
            return None;
        };
        if entry.id != id {
            debug!(participant = %participant, connection = %id, "Callback from stale connection");
            return None;
        }

        match signal {
            PeerSignal::LocalCandidate(candidate) => Some(Outbound {
                channel: entry.channel.clone(),
                event: RelayEvent::IceCandidate(CandidatePayload {
                    from_user_id: self.self_id.clone(),
                    to_user_id: participant.clone(),
                    candidate,
                }),
            }),
            PeerSignal::StateChanged(state) => {
                entry.state = state;
                match state {
                    PeerConnectionState::Connected => {
                        info!(participant = %participant, role = ?entry.role, "Peer connected");
                    }
                    PeerConnectionState::Failed | PeerConnectionState::Disconnected => {
                        warn!(participant = %participant, ?state, "Peer connection lost");
                        self.remove(participant).await;
                    }
                    _ => {}
                }
                None
            }
            PeerSignal::RemoteTrack(source) => {
                match self.output.play(participant, source) {
                    Ok(sink) => entry.playback = Some(sink),
                    Err(e) => {
                        warn!(participant = %participant, error = %e, "Failed to play remote audio");
                    }
                }
                None
            }
        }
    }

    /// Tear down the connection and playback for `participant`.
    pub async fn remove(&mut self, participant: &ParticipantId) -> bool {
        self.candidates.discard(participant);
        self.close_entry(participant).await
    }

    async fn close_entry(&mut self, participant: &ParticipantId) -> bool {
        let Some(entry) = self.peers.remove(participant) else {
            return false;
        };

        drop(entry.playback);
        if let Err(e) = entry.connection.close().await {
            debug!(participant = %participant, error = %e, "Error closing peer connection");
        }
        info!(participant = %participant, connection = %entry.id, "Peer removed");
        true
    }

    async fn remove_if_current(&mut self, participant: &ParticipantId, id: ConnectionId) {
        if self.peers.get(participant).is_some_and(|e| e.id == id) {
            self.remove(participant).await;
        }
    }

    /// Remove every peer reached through `channel`.
    pub async fn remove_channel(&mut self, channel: &ChannelName) -> Vec<ParticipantId> {
        let doomed: Vec<ParticipantId> = self
            .peers
            .iter()
            .filter(|(_, e)| e.channel == *channel)
            .map(|(p, _)| p.clone())
            .collect();

        for participant in &doomed {
            self.remove(participant).await;
        }
        doomed
    }

    /// Remove every peer and drop all buffered candidates.
    pub async fn clear(&mut self) {
        let all: Vec<ParticipantId> = self.peers.keys().cloned().collect();
        for participant in &all {
            self.remove(participant).await;
        }
        self.candidates.clear();
    }

    /// Drop stale buffered candidates.
    pub fn expire_candidates(&mut self) -> usize {
        self.candidates.expire()
    }

    pub fn contains(&self, participant: &ParticipantId) -> bool {
        self.peers.contains_key(participant)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn connection(&self, participant: &ParticipantId) -> Option<Arc<dyn PeerConnection>> {
        self.peers.get(participant).map(|e| e.connection.clone())
    }

    pub fn state(&self, participant: &ParticipantId) -> Option<PeerConnectionState> {
        self.peers.get(participant).map(|e| e.state)
    }

    pub fn pending_candidates(&self, participant: &ParticipantId) -> usize {
        self.candidates.pending(participant)
    }

    pub fn connected_count(&self) -> usize {
        self.peers
            .values()
            .filter(|e| e.state == PeerConnectionState::Connected)
            .count()
    }

    /// Participants reached through `channel`.
    pub fn participants_on(&self, channel: &ChannelName) -> BTreeSet<ParticipantId> {
        self.peers
            .iter()
            .filter(|(_, e)| e.channel == *channel)
            .map(|(p, _)| p.clone())
            .collect()
    }
}

async fn make_offer(connection: &dyn PeerConnection) -> Result<SessionDescription, PeerError> {
    let offer = connection.create_offer().await?;
    connection.set_local_description(offer.clone()).await?;
    Ok(offer)
}
