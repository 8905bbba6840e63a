//! Test doubles for the platform seams.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use mesh_common::{IceCandidate, ParticipantId, SdpType, SessionDescription};
use tokio::sync::mpsc;

use crate::audio::{
    AudioError, AudioOutput, CaptureStream, LocalAudioTrack, MicrophoneSource, PlaybackSink,
    RemoteAudioSource,
};
use crate::peer::{
    ConnectionId, PeerConnection, PeerConnectionState, PeerConnector, PeerError, PeerEventSink,
    PeerSignal, SignalingState,
};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Microphone that counts hardware opens and stops.
#[derive(Default)]
pub struct FakeMicrophone {
    failure: Mutex<Option<AudioError>>,
    opens: AtomicUsize,
    stops: Arc<AtomicUsize>,
}

impl FakeMicrophone {
    pub fn failing(error: AudioError) -> Self {
        let mic = Self::default();
        mic.set_failure(Some(error));
        mic
    }

    pub fn set_failure(&self, error: Option<AudioError>) {
        *lock(&self.failure) = error;
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

struct FakeCapture {
    stops: Arc<AtomicUsize>,
    stopped: bool,
}

impl CaptureStream for FakeCapture {
    fn stop(&mut self) {
        if !std::mem::replace(&mut self.stopped, true) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }
}

impl Drop for FakeCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

#[async_trait]
impl MicrophoneSource for FakeMicrophone {
    async fn open(
        &self,
        _frames: mpsc::Sender<Bytes>,
    ) -> Result<Box<dyn CaptureStream>, AudioError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = lock(&self.failure).clone() {
            return Err(error);
        }
        Ok(Box::new(FakeCapture {
            stops: self.stops.clone(),
            stopped: false,
        }))
    }
}

/// Remote source that ends immediately.
pub struct SilentRemoteAudio;

#[async_trait]
impl RemoteAudioSource for SilentRemoteAudio {
    async fn next_packet(&mut self) -> Option<Bytes> {
        None
    }
}

/// Output that records who was played and how many sinks are alive.
#[derive(Default)]
pub struct RecordingOutput {
    played: Mutex<Vec<ParticipantId>>,
    live: Arc<AtomicUsize>,
}

impl RecordingOutput {
    pub fn played(&self) -> Vec<ParticipantId> {
        lock(&self.played).clone()
    }

    /// Sinks not yet dropped.
    pub fn playing(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}

struct RecordingSink {
    live: Arc<AtomicUsize>,
}

impl PlaybackSink for RecordingSink {}

impl Drop for RecordingSink {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

impl AudioOutput for RecordingOutput {
    fn play(
        &self,
        participant: &ParticipantId,
        _source: Box<dyn RemoteAudioSource>,
    ) -> Result<Box<dyn PlaybackSink>, AudioError> {
        lock(&self.played).push(participant.clone());
        self.live.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(RecordingSink {
            live: self.live.clone(),
        }))
    }
}

#[derive(Default)]
struct PeerState {
    signaling: Option<SignalingState>,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    tracks: Vec<String>,
    receive_only: bool,
    closed: bool,
    applied: Vec<IceCandidate>,
    rejected: Vec<IceCandidate>,
}

/// Connection following the offer/answer state machine without any media.
///
/// When created by an auto-connecting [`FakeConnector`], it reports one local
/// candidate after its local description is set and reports `Connected`
/// plus a remote track once negotiation completes.
pub struct FakePeer {
    participant: ParticipantId,
    events: PeerEventSink,
    auto: bool,
    state: Mutex<PeerState>,
}

impl FakePeer {
    fn new(events: PeerEventSink, auto: bool) -> Self {
        Self {
            participant: events.participant().clone(),
            events,
            auto,
            state: Mutex::new(PeerState::default()),
        }
    }

    /// A peer not wired to any dispatch loop.
    pub fn detached(participant: &str) -> Self {
        let (tx, _rx) = mpsc::unbounded_channel();
        Self::new(PeerEventSink::new(participant.into(), ConnectionId(0), tx), false)
    }

    pub fn participant(&self) -> &ParticipantId {
        &self.participant
    }

    pub fn connection(&self) -> ConnectionId {
        self.events.connection()
    }

    /// Raise a platform callback as this connection.
    pub fn report(&self, signal: PeerSignal) {
        self.events.emit(signal);
    }

    pub fn attached_tracks(&self) -> Vec<String> {
        lock(&self.state).tracks.clone()
    }

    pub fn is_receive_only(&self) -> bool {
        lock(&self.state).receive_only
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }

    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        lock(&self.state).applied.clone()
    }

    /// Candidates offered before a remote description existed.
    pub fn rejected_candidates(&self) -> Vec<IceCandidate> {
        lock(&self.state).rejected.clone()
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        lock(&self.state).local.clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        lock(&self.state).remote.clone()
    }

    fn spawn_emit(&self, signals: Vec<PeerSignal>) {
        if !self.auto {
            return;
        }
        let sink = self.events.clone();
        tokio::spawn(async move {
            for signal in signals {
                sink.emit(signal);
            }
        });
    }

    fn negotiated(&self) {
        self.spawn_emit(vec![
            PeerSignal::StateChanged(PeerConnectionState::Connected),
            PeerSignal::RemoteTrack(Box::new(SilentRemoteAudio)),
        ]);
    }

    fn local_candidate(&self) {
        let candidate = IceCandidate {
            candidate: format!(
                "candidate:{} 1 udp 2122260223 192.0.2.1 9 typ host",
                self.connection()
            ),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        };
        self.spawn_emit(vec![PeerSignal::LocalCandidate(candidate)]);
    }
}

#[async_trait]
impl PeerConnection for FakePeer {
    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        let state = lock(&self.state);
        if state.closed {
            return Err(PeerError::Closed);
        }
        Ok(SessionDescription::offer(format!(
            "v=0 offer-to-{}",
            self.participant
        )))
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        let state = lock(&self.state);
        if state.signaling != Some(SignalingState::HaveRemoteOffer) {
            return Err(PeerError::Sdp("no remote offer".into()));
        }
        Ok(SessionDescription::answer(format!(
            "v=0 answer-to-{}",
            self.participant
        )))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        let completed = {
            let mut state = lock(&self.state);
            let current = state.signaling.unwrap_or(SignalingState::Stable);
            let (next, completed) = match (desc.kind, current) {
                (SdpType::Offer, SignalingState::Stable) => (SignalingState::HaveLocalOffer, false),
                (SdpType::Answer, SignalingState::HaveRemoteOffer) => (SignalingState::Stable, true),
                _ => return Err(PeerError::Sdp(format!("cannot apply local {:?}", desc.kind))),
            };
            state.signaling = Some(next);
            state.local = Some(desc);
            completed
        };

        self.local_candidate();
        if completed {
            self.negotiated();
        }
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        let completed = {
            let mut state = lock(&self.state);
            let current = state.signaling.unwrap_or(SignalingState::Stable);
            let (next, completed) = match (desc.kind, current) {
                (SdpType::Offer, SignalingState::Stable) => (SignalingState::HaveRemoteOffer, false),
                (SdpType::Answer, SignalingState::HaveLocalOffer) => (SignalingState::Stable, true),
                _ => return Err(PeerError::Sdp(format!("cannot apply remote {:?}", desc.kind))),
            };
            state.signaling = Some(next);
            state.remote = Some(desc);
            completed
        };

        if completed {
            self.negotiated();
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        let mut state = lock(&self.state);
        if state.remote.is_none() {
            state.rejected.push(candidate);
            return Err(PeerError::Ice("remote description not set".into()));
        }
        state.applied.push(candidate);
        Ok(())
    }

    async fn has_remote_description(&self) -> bool {
        lock(&self.state).remote.is_some()
    }

    fn signaling_state(&self) -> SignalingState {
        let state = lock(&self.state);
        if state.closed {
            SignalingState::Closed
        } else {
            state.signaling.unwrap_or(SignalingState::Stable)
        }
    }

    async fn attach_track(&self, track: Arc<LocalAudioTrack>) -> Result<(), PeerError> {
        lock(&self.state).tracks.push(track.id().to_string());
        Ok(())
    }

    async fn add_receive_only_audio(&self) -> Result<(), PeerError> {
        lock(&self.state).receive_only = true;
        Ok(())
    }

    async fn close(&self) -> Result<(), PeerError> {
        lock(&self.state).closed = true;
        Ok(())
    }
}

/// Connector handing out [`FakePeer`]s and remembering all of them.
pub struct FakeConnector {
    auto: bool,
    peers: Mutex<Vec<Arc<FakePeer>>>,
    failures: Mutex<HashMap<ParticipantId, usize>>,
}

impl FakeConnector {
    /// Peers report candidates, connection and tracks on their own.
    pub fn new() -> Self {
        Self {
            auto: true,
            peers: Mutex::new(Vec::new()),
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Peers never raise callbacks unless told to.
    pub fn manual() -> Self {
        Self {
            auto: false,
            ..Self::new()
        }
    }

    /// Make the next connection attempt toward `participant` fail.
    pub fn fail_next(&self, participant: impl Into<ParticipantId>) {
        *lock(&self.failures).entry(participant.into()).or_default() += 1;
    }

    pub fn connects(&self) -> usize {
        lock(&self.peers).len()
    }

    pub fn peers(&self) -> Vec<Arc<FakePeer>> {
        lock(&self.peers).clone()
    }

    /// Most recent connection toward `participant`.
    pub fn latest(&self, participant: &ParticipantId) -> Option<Arc<FakePeer>> {
        lock(&self.peers)
            .iter()
            .rev()
            .find(|p| p.participant() == participant)
            .cloned()
    }
}

impl Default for FakeConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PeerConnector for FakeConnector {
    async fn connect(
        &self,
        _ice_servers: &[String],
        events: PeerEventSink,
    ) -> Result<Arc<dyn PeerConnection>, PeerError> {
        {
            let mut failures = lock(&self.failures);
            if let Some(pending) = failures.get_mut(events.participant()) {
                if *pending > 0 {
                    *pending -= 1;
                    return Err(PeerError::Api("scripted failure".into()));
                }
            }
        }

        let peer = Arc::new(FakePeer::new(events, self.auto));
        lock(&self.peers).push(peer.clone());
        Ok(peer)
    }
}
