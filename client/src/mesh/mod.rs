//! Mesh Orchestrator
//!
//! Owns every other component and mutates them from a single dispatch loop.
//! Relay frames, peer connection callbacks and authority commands all arrive
//! as [`MeshEvent`]s, so state only changes between awaits of that loop.
//! Peer callbacks use their own unbounded channel: the loop awaits
//! `close()` during teardown, and closing raises a callback.
//!
//! Channel plan: a moderator with a non-empty spectator set joins each
//! spectated team's channel receive-only; anyone else with a team joins that
//! team's channel as a member. Each joined channel carries two binding groups:
//! control events for as long as the subscription lives, and signaling events
//! only while the team's voice flag is on.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use mesh_common::{
    events, ChannelName, MeshContext, MeshStatus, ParticipantId, RelayEvent, RelayFrame,
    SpectatorPayload, TeamId, UserJoinedPayload,
};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::audio::{AudioCaptureManager, AudioOutput, MicrophoneSource};
use crate::config::MeshConfig;
use crate::error::MeshError;
use crate::peer::{ConnectionId, PeerConnector, PeerSignal};
use crate::ptt::{self, KeyEvent, PushToTalk};
use crate::registry::{AudioDirection, PeerRegistry};
use crate::relay::{BindingId, Handler, RelayTransport, SignalRelayClient};

#[cfg(test)]
mod tests;

/// Everything the dispatch loop reacts to.
#[derive(Debug)]
pub enum MeshEvent {
    /// A frame delivered by a bound relay event.
    Relay(RelayFrame),
    /// A platform callback from one peer connection.
    Peer {
        participant: ParticipantId,
        connection: ConnectionId,
        signal: PeerSignal,
    },
    Command(MeshCommand),
}

#[derive(Debug)]
pub enum MeshCommand {
    /// The authority pushed a new context.
    UpdateContext(MeshContext),
    Stop,
}

/// How the local participant takes part in a team's channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelMode {
    /// Own team: sends and receives.
    Member,
    /// Spectated team: receive-only, never transmits.
    Spectator,
}

/// Channels to join for `context`.
pub fn channel_plan(context: &MeshContext) -> BTreeMap<TeamId, ChannelMode> {
    if context.is_spectator() {
        return context
            .spectating
            .iter()
            .map(|team| (team.clone(), ChannelMode::Spectator))
            .collect();
    }

    context
        .team
        .iter()
        .map(|team| (team.clone(), ChannelMode::Member))
        .collect()
}

/// Collaborators injected into the orchestrator.
pub struct MeshDeps {
    pub config: MeshConfig,
    pub transport: Arc<dyn RelayTransport>,
    pub connector: Arc<dyn PeerConnector>,
    pub microphone: Arc<dyn MicrophoneSource>,
    pub output: Arc<dyn AudioOutput>,
}

/// Builder for a running mesh.
pub struct MeshOrchestrator {
    deps: MeshDeps,
}

impl MeshOrchestrator {
    pub const fn new(deps: MeshDeps) -> Self {
        Self { deps }
    }

    /// Spawn the dispatch loop and push-to-talk task for `context`.
    pub fn start(self, context: MeshContext) -> MeshHandle {
        let MeshDeps {
            config,
            transport,
            connector,
            microphone,
            output,
        } = self.deps;

        let (events_tx, events_rx) = mpsc::channel(config.event_capacity);
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let (keys_tx, keys_rx) = mpsc::channel(32);
        let (status_tx, status_rx) = watch::channel(MeshStatus::default());

        let capture = AudioCaptureManager::new(microphone);
        let ptt = tokio::spawn(ptt::run(
            PushToTalk::new(config.ptt_key.clone(), config.ptt_debounce),
            keys_rx,
            capture.subscribe(),
        ));

        let registry = PeerRegistry::new(
            &config,
            context.self_id.clone(),
            connector,
            output,
            peer_tx,
        );

        let mesh = Mesh {
            context: MeshContext {
                self_id: context.self_id.clone(),
                team: None,
                moderator: false,
                spectating: BTreeSet::new(),
                voice_enabled: BTreeSet::new(),
            },
            relay: SignalRelayClient::new(transport),
            registry,
            capture,
            channels: BTreeMap::new(),
            events: events_tx.clone(),
            status: status_tx,
            sweep_every: (config.ice_buffer_ttl / 2).max(Duration::from_secs(1)),
        };

        info!(participant = %context.self_id, "Starting voice mesh");
        let dispatch = tokio::spawn(mesh.run(context, events_rx, peer_rx));

        MeshHandle {
            events: events_tx,
            keys: keys_tx,
            status: status_rx,
            dispatch: Some(dispatch),
            ptt: Some(ptt),
        }
    }
}

/// Control surface of a running mesh.
///
/// Dropping the handle without [`MeshHandle::stop`] aborts the mesh tasks.
pub struct MeshHandle {
    events: mpsc::Sender<MeshEvent>,
    keys: mpsc::Sender<KeyEvent>,
    status: watch::Receiver<MeshStatus>,
    dispatch: Option<JoinHandle<()>>,
    ptt: Option<JoinHandle<()>>,
}

impl MeshHandle {
    /// Push a new authority context.
    pub async fn update_context(&self, context: MeshContext) -> Result<(), MeshError> {
        self.events
            .send(MeshEvent::Command(MeshCommand::UpdateContext(context)))
            .await
            .map_err(|_| MeshError::Stopped)
    }

    /// Forward a global key event to push-to-talk.
    pub async fn key_event(&self, event: KeyEvent) -> Result<(), MeshError> {
        self.keys.send(event).await.map_err(|_| MeshError::Stopped)
    }

    /// Read-only projection for the UI.
    pub fn status(&self) -> watch::Receiver<MeshStatus> {
        self.status.clone()
    }

    /// Tear everything down and wait for the mesh tasks to finish.
    pub async fn stop(mut self) -> Result<(), MeshError> {
        self.events
            .send(MeshEvent::Command(MeshCommand::Stop))
            .await
            .map_err(|_| MeshError::Stopped)?;

        if let Some(dispatch) = self.dispatch.take() {
            if let Err(e) = dispatch.await {
                warn!(error = %e, "Mesh dispatch task failed");
            }
        }
        if let Some(ptt) = self.ptt.take() {
            if let Err(e) = ptt.await {
                warn!(error = %e, "Push-to-talk task failed");
            }
        }
        info!("Voice mesh stopped");
        Ok(())
    }
}

impl Drop for MeshHandle {
    fn drop(&mut self) {
        if let Some(dispatch) = self.dispatch.take() {
            dispatch.abort();
        }
        if let Some(ptt) = self.ptt.take() {
            ptt.abort();
        }
    }
}

struct JoinedChannel {
    name: ChannelName,
    mode: ChannelMode,
    voice_enabled: bool,
    control: Vec<(&'static str, BindingId)>,
    signaling: Vec<(&'static str, BindingId)>,
    /// Peers reached through a spectator announcement on this channel.
    spectators: BTreeSet<ParticipantId>,
}

/// State owned by the dispatch loop.
struct Mesh {
    context: MeshContext,
    relay: SignalRelayClient,
    registry: PeerRegistry,
    capture: AudioCaptureManager,
    channels: BTreeMap<TeamId, JoinedChannel>,
    events: mpsc::Sender<MeshEvent>,
    status: watch::Sender<MeshStatus>,
    sweep_every: Duration,
}

/// Relay handler forwarding frames into the dispatch loop.
fn forward_to(events: mpsc::Sender<MeshEvent>) -> Handler {
    Arc::new(move |frame| {
        let events = events.clone();
        Box::pin(async move {
            if events.send(MeshEvent::Relay(frame)).await.is_err() {
                debug!("Mesh stopped, dropping relay frame");
            }
        })
    })
}

/// Resolves when the watched track's enabled bit changes.
async fn track_toggled(enabled: &mut Option<watch::Receiver<bool>>) {
    match enabled {
        Some(rx) => {
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
        None => std::future::pending().await,
    }
}

impl Mesh {
    async fn run(
        mut self,
        context: MeshContext,
        mut events: mpsc::Receiver<MeshEvent>,
        mut peer_events: mpsc::UnboundedReceiver<MeshEvent>,
    ) {
        self.apply_context(context).await;

        let mut sweep = tokio::time::interval(self.sweep_every);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            // Subscribe before publishing so no toggle is missed
            let mut enabled = self.capture.track().map(|t| t.subscribe());
            self.publish_status();

            tokio::select! {
                event = events.recv() => match event {
                    Some(MeshEvent::Command(MeshCommand::Stop)) | None => break,
                    Some(event) => self.dispatch(event).await,
                },
                Some(event) = peer_events.recv() => self.dispatch(event).await,
                () = track_toggled(&mut enabled) => {}
                _ = sweep.tick() => {
                    let expired = self.registry.expire_candidates();
                    if expired > 0 {
                        debug!(expired, "Expired buffered ICE candidates");
                    }
                }
            }
        }

        self.shutdown().await;
    }

    async fn dispatch(&mut self, event: MeshEvent) {
        match event {
            MeshEvent::Relay(frame) => self.on_frame(frame).await,
            MeshEvent::Peer {
                participant,
                connection,
                signal,
            } => {
                if let Some(out) = self
                    .registry
                    .on_peer_signal(&participant, connection, signal)
                    .await
                {
                    self.publish(&out.channel, out.event).await;
                }
            }
            MeshEvent::Command(MeshCommand::UpdateContext(context)) => {
                self.apply_context(context).await;
            }
            MeshEvent::Command(MeshCommand::Stop) => {}
        }
    }

    /// React to a new authority context.
    ///
    /// Identity, team or moderator changes tear everything down before the
    /// new plan is joined. Spectator set changes only touch the teams that
    /// were added or removed.
    async fn apply_context(&mut self, next: MeshContext) {
        let previous = std::mem::replace(&mut self.context, next);
        let current = &self.context;

        let reset = previous.self_id != current.self_id
            || previous.team != current.team
            || previous.moderator != current.moderator;
        if reset {
            self.leave_all().await;
            if previous.self_id != self.context.self_id {
                self.registry.set_self_id(self.context.self_id.clone());
            }
        }

        let plan = channel_plan(&self.context);
        let stale: Vec<TeamId> = self
            .channels
            .iter()
            .filter(|(team, joined)| plan.get(*team) != Some(&joined.mode))
            .map(|(team, _)| team.clone())
            .collect();
        for team in &stale {
            self.leave(team).await;
        }

        for (team, mode) in plan {
            if self.channels.contains_key(&team) {
                // Authority snapshot changed for a channel we keep
                let was = previous.voice_enabled.contains(&team);
                let now = self.context.voice_enabled.contains(&team);
                if was != now {
                    self.set_voice(&team, now).await;
                }
            } else {
                self.join(team, mode).await;
            }
        }
    }

    async fn join(&mut self, team: TeamId, mode: ChannelMode) {
        let name = ChannelName::for_team(&team);
        if let Err(e) = self.relay.subscribe(&name).await {
            warn!(channel = %name, error = %e, "Failed to subscribe to team channel");
            return;
        }

        let control = self.bind_group(&name, &events::CONTROL);
        self.channels.insert(
            team.clone(),
            JoinedChannel {
                name: name.clone(),
                mode,
                voice_enabled: false,
                control,
                signaling: Vec::new(),
                spectators: BTreeSet::new(),
            },
        );
        info!(team = %team, channel = %name, ?mode, "Joined team channel");

        if self.context.voice_enabled.contains(&team) {
            self.set_voice(&team, true).await;
        }
    }

    async fn leave(&mut self, team: &TeamId) {
        let Some(joined) = self.channels.remove(team) else {
            return;
        };

        if joined.mode == ChannelMode::Spectator && joined.voice_enabled {
            let spectator_id = self.context.self_id.clone();
            self.publish(
                &joined.name,
                RelayEvent::SpectatorLeft(SpectatorPayload { spectator_id }),
            )
            .await;
        }

        for (event, id) in joined.control.iter().chain(&joined.signaling) {
            self.relay.unbind(&joined.name, event, *id);
        }
        let removed = self.registry.remove_channel(&joined.name).await;
        if let Err(e) = self.relay.unsubscribe(&joined.name).await {
            warn!(channel = %joined.name, error = %e, "Failed to unsubscribe from team channel");
        }
        if joined.mode == ChannelMode::Member && joined.voice_enabled {
            self.sync_capture().await;
        }

        info!(team = %team, peers = removed.len(), "Left team channel");
    }

    async fn leave_all(&mut self) {
        let teams: Vec<TeamId> = self.channels.keys().cloned().collect();
        for team in &teams {
            self.leave(team).await;
        }
        self.registry.clear().await;
        self.sync_capture().await;
    }

    fn bind_group(
        &mut self,
        channel: &ChannelName,
        group: &[&'static str],
    ) -> Vec<(&'static str, BindingId)> {
        group
            .iter()
            .filter_map(|event| {
                match self
                    .relay
                    .bind(channel, event, forward_to(self.events.clone()))
                {
                    Ok(id) => Some((*event, id)),
                    Err(e) => {
                        warn!(channel = %channel, event, error = %e, "Failed to bind relay event");
                        None
                    }
                }
            })
            .collect()
    }

    /// Turn mesh activity for `team` on or off.
    async fn set_voice(&mut self, team: &TeamId, enabled: bool) {
        let Some(joined) = self.channels.get_mut(team) else {
            return;
        };
        if joined.voice_enabled == enabled {
            return;
        }
        joined.voice_enabled = enabled;
        let name = joined.name.clone();
        let mode = joined.mode;
        info!(team = %team, enabled, "Team voice toggled");

        if enabled {
            let signaling = self.bind_group(&name, &events::SIGNALING);
            if let Some(joined) = self.channels.get_mut(team) {
                joined.signaling = signaling;
            }

            // Capture must exist before peers start offering to us
            self.sync_capture().await;

            let self_id = self.context.self_id.clone();
            let announce = match mode {
                ChannelMode::Member => RelayEvent::UserJoined(UserJoinedPayload { user_id: self_id }),
                ChannelMode::Spectator => {
                    RelayEvent::SpectatorJoined(SpectatorPayload {
                        spectator_id: self_id,
                    })
                }
            };
            self.publish(&name, announce).await;
        } else {
            let signaling = self
                .channels
                .get_mut(team)
                .map(|joined| {
                    joined.spectators.clear();
                    std::mem::take(&mut joined.signaling)
                })
                .unwrap_or_default();
            for (event, id) in signaling {
                self.relay.unbind(&name, event, id);
            }

            let removed = self.registry.remove_channel(&name).await;
            debug!(team = %team, peers = removed.len(), "Removed peers after voice disabled");
            self.sync_capture().await;
        }
    }

    /// Hold the microphone exactly while a member channel has voice on.
    async fn sync_capture(&mut self) {
        let wanted = self
            .channels
            .values()
            .any(|c| c.mode == ChannelMode::Member && c.voice_enabled);
        if wanted == self.capture.is_active() {
            return;
        }

        if let Err(e) = self.capture.set_active(wanted).await {
            warn!(error = %e, "Continuing without local audio");
        }
    }

    async fn on_frame(&mut self, frame: RelayFrame) {
        let RelayFrame {
            channel,
            sender,
            message,
        } = frame;
        let self_id = self.context.self_id.clone();

        let Some((team, mode, voice_enabled)) = self.lookup(&channel) else {
            debug!(channel = %channel, "Frame for channel not joined");
            return;
        };
        if sender.as_ref() == Some(&self_id) {
            return;
        }
        if message.addressed_to().is_some_and(|to| *to != self_id) {
            return;
        }

        match message {
            RelayEvent::VoiceEnabled(p) | RelayEvent::VoiceDisabled(p) if p.team_id != team => {
                warn!(channel = %channel, team = %p.team_id, "Voice toggle for another team");
            }
            RelayEvent::VoiceEnabled(_) => self.set_voice(&team, true).await,
            RelayEvent::VoiceDisabled(_) => self.set_voice(&team, false).await,
            RelayEvent::ForceMute(p) => {
                if p.target_user_id == self_id {
                    self.force_mute();
                }
            }
            signal if voice_enabled => {
                self.on_signal(&channel, mode, &self_id, signal).await;
            }
            signal => {
                debug!(channel = %channel, event = signal.name(), "Signaling while voice disabled");
            }
        }
    }

    fn lookup(&self, channel: &ChannelName) -> Option<(TeamId, ChannelMode, bool)> {
        let team = channel.team()?;
        let joined = self.channels.get(&team)?;
        (joined.name == *channel).then_some((team, joined.mode, joined.voice_enabled))
    }

    fn spectators_on(&mut self, channel: &ChannelName) -> Option<&mut BTreeSet<ParticipantId>> {
        let joined = self.channels.get_mut(&channel.team()?)?;
        (joined.name == *channel).then_some(&mut joined.spectators)
    }

    fn force_mute(&self) {
        if let Some(track) = self.capture.track() {
            if track.set_enabled(false) {
                info!("Force-muted by moderator");
            }
        }
    }

    fn audio_direction(&self, mode: ChannelMode) -> AudioDirection {
        match (mode, self.capture.track()) {
            (ChannelMode::Member, Some(track)) => AudioDirection::SendRecv(track),
            _ => AudioDirection::ReceiveOnly,
        }
    }

    async fn on_signal(
        &mut self,
        channel: &ChannelName,
        mode: ChannelMode,
        self_id: &ParticipantId,
        event: RelayEvent,
    ) {
        match event {
            RelayEvent::UserJoined(p) => {
                if p.user_id == *self_id || self.registry.contains(&p.user_id) {
                    return;
                }
                if let Some(spectators) = self.spectators_on(channel) {
                    spectators.remove(&p.user_id);
                }
                self.initiate(&p.user_id, channel, mode).await;
            }
            RelayEvent::SpectatorJoined(p) => {
                // Members initiate toward spectators, never the reverse
                if mode != ChannelMode::Member
                    || p.spectator_id == *self_id
                    || self.registry.contains(&p.spectator_id)
                {
                    return;
                }
                if let Some(spectators) = self.spectators_on(channel) {
                    spectators.insert(p.spectator_id.clone());
                }
                self.initiate(&p.spectator_id, channel, mode).await;
            }
            RelayEvent::SpectatorLeft(p) => {
                let was_spectator = self
                    .spectators_on(channel)
                    .is_some_and(|spectators| spectators.remove(&p.spectator_id));
                if !was_spectator
                    || !self.registry.participants_on(channel).contains(&p.spectator_id)
                {
                    debug!(participant = %p.spectator_id, "Spectator left without a spectator peer");
                    return;
                }
                self.registry.remove(&p.spectator_id).await;
            }
            RelayEvent::Offer(p) => {
                debug!(from = %p.from_user_id, "Received offer");
                let audio = self.audio_direction(mode);
                match self
                    .registry
                    .accept_offer(&p.from_user_id, channel, p.sdp, audio)
                    .await
                {
                    Ok(Some(out)) => self.publish(&out.channel, out.event).await,
                    Ok(None) => {}
                    Err(e) => {
                        warn!(participant = %p.from_user_id, error = %e, "Failed to answer offer");
                    }
                }
            }
            RelayEvent::Answer(p) => {
                debug!(from = %p.from_user_id, "Received answer");
                if let Err(e) = self.registry.accept_answer(&p.from_user_id, p.sdp).await {
                    warn!(participant = %p.from_user_id, error = %e, "Failed to apply answer");
                }
            }
            RelayEvent::IceCandidate(p) => {
                self.registry
                    .add_remote_candidate(&p.from_user_id, p.candidate)
                    .await;
            }
            RelayEvent::VoiceEnabled(_) | RelayEvent::VoiceDisabled(_) | RelayEvent::ForceMute(_) => {}
        }
    }

    async fn initiate(&mut self, participant: &ParticipantId, channel: &ChannelName, mode: ChannelMode) {
        let audio = self.audio_direction(mode);
        match self.registry.initiate(participant, channel, audio).await {
            Ok(Some(out)) => self.publish(&out.channel, out.event).await,
            Ok(None) => {}
            Err(e) => {
                warn!(participant = %participant, error = %e, "Failed to initiate peer connection");
            }
        }
    }

    async fn publish(&self, channel: &ChannelName, event: RelayEvent) {
        let name = event.name();
        if let Err(e) = self
            .relay
            .publish(channel, &self.context.self_id, event)
            .await
        {
            warn!(channel = %channel, event = name, error = %e, "Failed to publish relay event");
        }
    }

    fn publish_status(&self) {
        let self_id = &self.context.self_id;
        let status = MeshStatus {
            capture_error: self.capture.last_error(),
            transmitting: self.capture.track().is_some_and(|t| t.is_enabled()),
            voice_enabled: self
                .channels
                .iter()
                .map(|(team, joined)| (team.clone(), joined.voice_enabled))
                .collect(),
            connected_peers: self.registry.connected_count(),
            roster: self
                .channels
                .iter()
                .map(|(team, joined)| {
                    let mut visible = self.registry.participants_on(&joined.name);
                    if joined.mode == ChannelMode::Member && joined.voice_enabled {
                        visible.insert(self_id.clone());
                    }
                    (team.clone(), visible)
                })
                .collect(),
        };

        self.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }

    async fn shutdown(&mut self) {
        self.leave_all().await;
        self.publish_status();
    }
}
