use std::sync::Arc;
use std::time::Duration;

use mesh_common::{
    events, CaptureErrorKind, ChannelName, ForceMutePayload, MeshContext, MeshStatus,
    ParticipantId, RelayEvent, RelayFrame, SdpPayload, SessionDescription, SpectatorPayload,
    TeamId, TeamPayload, UserJoinedPayload,
};
use tokio::sync::watch;
use tokio::time::{sleep, timeout};

use super::*;
use crate::audio::AudioError;
use crate::peer::{PeerConnectionState, PeerSignal};
use crate::ptt::KeyEvent;
use crate::relay::{MemoryRelayHub, RelayOp};
use crate::testing::{FakeConnector, FakeMicrophone, RecordingOutput};

const WAIT: Duration = Duration::from_secs(5);

struct Node {
    handle: MeshHandle,
    connector: Arc<FakeConnector>,
    microphone: Arc<FakeMicrophone>,
    output: Arc<RecordingOutput>,
    status: watch::Receiver<MeshStatus>,
}

fn spawn_node(hub: &MemoryRelayHub, context: MeshContext) -> Node {
    spawn_node_with(hub, context, FakeMicrophone::default())
}

fn spawn_node_with(hub: &MemoryRelayHub, context: MeshContext, mic: FakeMicrophone) -> Node {
    let connector = Arc::new(FakeConnector::new());
    let microphone = Arc::new(mic);
    let output = Arc::new(RecordingOutput::default());

    let handle = MeshOrchestrator::new(MeshDeps {
        config: MeshConfig::default_for_test(),
        transport: Arc::new(hub.client(context.self_id.clone())),
        connector: connector.clone(),
        microphone: microphone.clone(),
        output: output.clone(),
    })
    .start(context);
    let status = handle.status();

    Node {
        handle,
        connector,
        microphone,
        output,
        status,
    }
}

async fn wait_status(
    status: &mut watch::Receiver<MeshStatus>,
    what: &str,
    pred: impl Fn(&MeshStatus) -> bool,
) -> MeshStatus {
    let waited = timeout(WAIT, async {
        status.wait_for(|s| pred(s)).await.map(|s| (*s).clone())
    })
    .await;

    match waited {
        Ok(Ok(current)) => current,
        Ok(Err(_)) => panic!("mesh stopped while waiting for {what}"),
        Err(_) => panic!("timed out waiting for {what}: {:?}", *status.borrow()),
    }
}

async fn eventually(what: &str, cond: impl Fn() -> bool) {
    let polled = timeout(WAIT, async {
        while !cond() {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(polled.is_ok(), "timed out waiting for {what}");
}

fn team(name: &str) -> TeamId {
    TeamId::from(name)
}

fn channel(name: &str) -> ChannelName {
    ChannelName::for_team(&team(name))
}

fn pid(name: &str) -> ParticipantId {
    ParticipantId::from(name)
}

fn voice_on(status: &MeshStatus, name: &str) -> bool {
    status.voice_enabled.get(&team(name)) == Some(&true)
}

fn ops_of(hub: &MemoryRelayHub, who: &str) -> Vec<RelayOp> {
    hub.ops()
        .into_iter()
        .filter(|op| match op {
            RelayOp::Subscribe { participant, .. } | RelayOp::Unsubscribe { participant, .. } => {
                participant.as_str() == who
            }
        })
        .collect()
}

#[test]
fn test_channel_plan_member_and_spectator() {
    let plan = channel_plan(&MeshContext::member("a", "red"));
    assert_eq!(plan.get(&team("red")), Some(&ChannelMode::Member));
    assert_eq!(plan.len(), 1);

    let plan = channel_plan(&MeshContext::moderator("m", ["red", "blue"]));
    assert_eq!(plan.get(&team("red")), Some(&ChannelMode::Spectator));
    assert_eq!(plan.get(&team("blue")), Some(&ChannelMode::Spectator));

    // A moderator not spectating talks in their own team
    let mut ctx = MeshContext::member("m", "green");
    ctx.moderator = true;
    assert_eq!(
        channel_plan(&ctx).get(&team("green")),
        Some(&ChannelMode::Member)
    );

    let mut lonely = MeshContext::member("x", "red");
    lonely.team = None;
    assert!(channel_plan(&lonely).is_empty());
}

#[test]
fn test_dispatch_state_can_cross_threads() {
    fn assert_send_sync<T: Send + Sync>() {}
    assert_send_sync::<Mesh>();
    assert_send_sync::<MeshHandle>();
}

#[tokio::test]
async fn test_two_members_negotiate_and_connect() {
    let hub = MemoryRelayHub::new();

    let mut a = spawn_node(&hub, MeshContext::member("a", "red").with_voice_enabled("red"));
    wait_status(&mut a.status, "a joined red", |s| voice_on(s, "red")).await;

    let mut b = spawn_node(&hub, MeshContext::member("b", "red").with_voice_enabled("red"));

    wait_status(&mut a.status, "a connected", |s| s.connected_peers == 1).await;
    let b_status = wait_status(&mut b.status, "b connected", |s| s.connected_peers == 1).await;
    assert_eq!(
        b_status.roster.get(&team("red")),
        Some(&[pid("a"), pid("b")].into_iter().collect())
    );

    let offers = hub.published_events(events::OFFER);
    assert_eq!(offers.len(), 1);
    match &offers[0].message {
        RelayEvent::Offer(p) => {
            assert_eq!(p.from_user_id, pid("a"));
            assert_eq!(p.to_user_id, pid("b"));
        }
        other => panic!("unexpected event: {other:?}"),
    }

    let answers = hub.published_events(events::ANSWER);
    assert_eq!(answers.len(), 1);
    assert_eq!(answers[0].sender, Some(pid("b")));

    // Candidates only ever hit connections with a remote description
    let a_to_b = a.connector.latest(&pid("b")).unwrap();
    let b_to_a = b.connector.latest(&pid("a")).unwrap();
    eventually("candidates applied", || {
        a_to_b.applied_candidates().len() == 1 && b_to_a.applied_candidates().len() == 1
    })
    .await;
    assert!(a_to_b.rejected_candidates().is_empty());
    assert!(b_to_a.rejected_candidates().is_empty());

    // Both sides send their microphone and play the other
    assert_eq!(a_to_b.attached_tracks().len(), 1);
    assert_eq!(b_to_a.attached_tracks().len(), 1);
    eventually("remote audio playing", || {
        a.output.playing() == 1 && b.output.playing() == 1
    })
    .await;
    assert_eq!(a.output.played(), vec![pid("b")]);
    assert_eq!(b.output.played(), vec![pid("a")]);
    assert_eq!(a.microphone.opens(), 1);

    a.handle.stop().await.unwrap();
    b.handle.stop().await.unwrap();
}

#[tokio::test]
async fn test_moderator_drops_one_spectated_team() {
    let hub = MemoryRelayHub::new();

    let mut red = spawn_node(&hub, MeshContext::member("r1", "red").with_voice_enabled("red"));
    let mut blue = spawn_node(&hub, MeshContext::member("b1", "blue").with_voice_enabled("blue"));
    wait_status(&mut red.status, "r1 joined", |s| voice_on(s, "red")).await;
    wait_status(&mut blue.status, "b1 joined", |s| voice_on(s, "blue")).await;

    let spectating = MeshContext::moderator("m", ["red", "blue"])
        .with_voice_enabled("red")
        .with_voice_enabled("blue");
    let mut m = spawn_node(&hub, spectating);
    wait_status(&mut m.status, "m connected to both", |s| s.connected_peers == 2).await;

    // Spectators never send audio
    for peer in m.connector.peers() {
        assert!(peer.is_receive_only());
        assert!(peer.attached_tracks().is_empty());
    }
    assert_eq!(m.microphone.opens(), 0);

    m.handle
        .update_context(MeshContext::moderator("m", ["blue"]).with_voice_enabled("blue"))
        .await
        .unwrap();

    let status = wait_status(&mut m.status, "red dropped", |s| {
        !s.voice_enabled.contains_key(&team("red"))
    })
    .await;
    assert_eq!(status.connected_peers, 1);
    assert_eq!(
        status.roster.get(&team("blue")),
        Some(&[pid("b1")].into_iter().collect())
    );
    assert!(m.connector.latest(&pid("r1")).unwrap().is_closed());
    assert!(!m.connector.latest(&pid("b1")).unwrap().is_closed());

    // The red member hears that the spectator left
    wait_status(&mut red.status, "r1 lost spectator", |s| s.connected_peers == 0).await;
    wait_status(&mut blue.status, "b1 kept spectator", |s| s.connected_peers == 1).await;
    assert_eq!(hub.subscriber_count(&channel("red")), 1);

    m.handle.stop().await.unwrap();
    red.handle.stop().await.unwrap();
    blue.handle.stop().await.unwrap();
}

#[tokio::test]
async fn test_force_mute_targets_only_self() {
    let hub = MemoryRelayHub::new();
    let mut a = spawn_node(&hub, MeshContext::member("a", "red").with_voice_enabled("red"));
    wait_status(&mut a.status, "a joined", |s| voice_on(s, "red")).await;

    a.handle.key_event(KeyEvent::down("v")).await.unwrap();
    wait_status(&mut a.status, "transmitting", |s| s.transmitting).await;

    let mute = |target: &str| {
        RelayEvent::ForceMute(ForceMutePayload {
            target_user_id: pid(target),
        })
    };

    hub.broadcast(&channel("red"), mute("someone-else"));
    sleep(Duration::from_millis(50)).await;
    assert!(a.status.borrow().transmitting);

    hub.broadcast(&channel("red"), mute("a"));
    wait_status(&mut a.status, "force-muted", |s| !s.transmitting).await;

    // Still subscribed and still holding the microphone
    assert_eq!(hub.subscriber_count(&channel("red")), 1);
    assert_eq!(a.microphone.stops(), 0);

    a.handle.stop().await.unwrap();
}

#[tokio::test]
async fn test_team_change_leaves_before_joining() {
    let hub = MemoryRelayHub::new();

    let mut a = spawn_node(&hub, MeshContext::member("a", "red").with_voice_enabled("red"));
    wait_status(&mut a.status, "a joined", |s| voice_on(s, "red")).await;
    let mut b = spawn_node(&hub, MeshContext::member("b", "red").with_voice_enabled("red"));
    wait_status(&mut a.status, "a connected", |s| s.connected_peers == 1).await;
    wait_status(&mut b.status, "b connected", |s| s.connected_peers == 1).await;

    a.handle
        .update_context(MeshContext::member("a", "blue").with_voice_enabled("blue"))
        .await
        .unwrap();
    let status = wait_status(&mut a.status, "a moved to blue", |s| voice_on(s, "blue")).await;

    assert_eq!(status.connected_peers, 0);
    assert!(!status.roster.contains_key(&team("red")));
    assert!(a.connector.latest(&pid("b")).unwrap().is_closed());

    assert_eq!(
        ops_of(&hub, "a"),
        vec![
            RelayOp::Subscribe {
                participant: pid("a"),
                channel: channel("red"),
            },
            RelayOp::Unsubscribe {
                participant: pid("a"),
                channel: channel("red"),
            },
            RelayOp::Subscribe {
                participant: pid("a"),
                channel: channel("blue"),
            },
        ]
    );

    // Microphone released with the old team and acquired afresh
    assert_eq!(a.microphone.stops(), 1);
    assert_eq!(a.microphone.opens(), 2);

    a.handle.stop().await.unwrap();
    b.handle.stop().await.unwrap();
}

#[tokio::test]
async fn test_voice_disable_tears_down_and_enable_reconnects() {
    let hub = MemoryRelayHub::new();

    let mut a = spawn_node(&hub, MeshContext::member("a", "red").with_voice_enabled("red"));
    wait_status(&mut a.status, "a joined", |s| voice_on(s, "red")).await;
    let mut b = spawn_node(&hub, MeshContext::member("b", "red").with_voice_enabled("red"));
    wait_status(&mut a.status, "a connected", |s| s.connected_peers == 1).await;
    wait_status(&mut b.status, "b connected", |s| s.connected_peers == 1).await;

    hub.broadcast(
        &channel("red"),
        RelayEvent::VoiceDisabled(TeamPayload { team_id: team("red") }),
    );

    let status = wait_status(&mut a.status, "a voice off", |s| !voice_on(s, "red")).await;
    assert_eq!(status.connected_peers, 0);
    assert_eq!(a.output.playing(), 0);
    eventually("a released mic", || a.microphone.stops() == 1).await;
    // Control events keep flowing on the same subscription
    assert_eq!(hub.subscriber_count(&channel("red")), 2);

    hub.broadcast(
        &channel("red"),
        RelayEvent::VoiceEnabled(TeamPayload { team_id: team("red") }),
    );

    wait_status(&mut a.status, "a reconnected", |s| {
        voice_on(s, "red") && s.connected_peers == 1
    })
    .await;
    wait_status(&mut b.status, "b reconnected", |s| s.connected_peers == 1).await;
    assert_eq!(a.microphone.opens(), 2);

    a.handle.stop().await.unwrap();
    b.handle.stop().await.unwrap();
}

#[tokio::test]
async fn test_capture_failure_degrades_to_receive_only() {
    let hub = MemoryRelayHub::new();

    let mut a = spawn_node_with(
        &hub,
        MeshContext::member("a", "red").with_voice_enabled("red"),
        FakeMicrophone::failing(AudioError::PermissionDenied),
    );
    let status = wait_status(&mut a.status, "a joined", |s| voice_on(s, "red")).await;
    assert_eq!(status.capture_error, Some(CaptureErrorKind::PermissionDenied));
    assert!(!status.transmitting);

    let mut b = spawn_node(&hub, MeshContext::member("b", "red").with_voice_enabled("red"));
    wait_status(&mut a.status, "a connected", |s| s.connected_peers == 1).await;
    wait_status(&mut b.status, "b connected", |s| s.connected_peers == 1).await;

    let a_to_b = a.connector.latest(&pid("b")).unwrap();
    assert!(a_to_b.is_receive_only());
    assert!(a_to_b.attached_tracks().is_empty());
    assert_eq!(b.connector.latest(&pid("a")).unwrap().attached_tracks().len(), 1);
    eventually("a hears b", || a.output.played() == vec![pid("b")]).await;

    // PTT has nothing to gate
    a.handle.key_event(KeyEvent::down("v")).await.unwrap();
    sleep(Duration::from_millis(100)).await;
    assert!(!a.status.borrow().transmitting);

    a.handle.stop().await.unwrap();
    b.handle.stop().await.unwrap();
}

#[tokio::test]
async fn test_ignores_echo_and_foreign_recipients() {
    let hub = MemoryRelayHub::new();
    let mut a = spawn_node(&hub, MeshContext::member("a", "red").with_voice_enabled("red"));
    wait_status(&mut a.status, "a joined", |s| voice_on(s, "red")).await;

    let outsider = hub.client("x");
    let red = channel("red");

    // Offer meant for someone else
    outsider
        .publish(RelayFrame {
            channel: red.clone(),
            sender: Some(pid("x")),
            message: RelayEvent::Offer(SdpPayload {
                from_user_id: pid("x"),
                to_user_id: pid("z"),
                sdp: SessionDescription::offer("v=0"),
            }),
        })
        .await
        .unwrap();

    // A frame claiming to come from ourselves
    outsider
        .publish(RelayFrame {
            channel: red.clone(),
            sender: Some(pid("a")),
            message: RelayEvent::UserJoined(UserJoinedPayload { user_id: pid("q") }),
        })
        .await
        .unwrap();

    // A genuine join; frames are handled in order so this one comes last
    outsider
        .publish(RelayFrame {
            channel: red.clone(),
            sender: Some(pid("x")),
            message: RelayEvent::UserJoined(UserJoinedPayload { user_id: pid("x") }),
        })
        .await
        .unwrap();

    eventually("offer toward x", || hub.published_events(events::OFFER).len() == 2).await;
    assert_eq!(a.connector.connects(), 1);
    assert!(a.connector.latest(&pid("x")).is_some());
    assert!(a.connector.latest(&pid("z")).is_none());
    assert!(a.connector.latest(&pid("q")).is_none());

    let offers = hub.published_events(events::OFFER);
    assert_eq!(offers.len(), 2);
    assert_eq!(offers[1].sender, Some(pid("a")));

    a.handle.stop().await.unwrap();
}

#[tokio::test]
async fn test_signaling_ignored_until_voice_enabled() {
    let hub = MemoryRelayHub::new();
    let mut a = spawn_node(&hub, MeshContext::member("a", "red"));
    let status = wait_status(&mut a.status, "a joined", |s| {
        s.voice_enabled.contains_key(&team("red"))
    })
    .await;
    assert!(!voice_on(&status, "red"));
    assert_eq!(a.microphone.opens(), 0);

    hub.broadcast(
        &channel("red"),
        RelayEvent::UserJoined(UserJoinedPayload { user_id: pid("x") }),
    );
    sleep(Duration::from_millis(50)).await;
    assert_eq!(a.connector.connects(), 0);

    hub.broadcast(
        &channel("red"),
        RelayEvent::VoiceEnabled(TeamPayload { team_id: team("red") }),
    );
    wait_status(&mut a.status, "voice on", |s| voice_on(s, "red")).await;
    assert_eq!(a.microphone.opens(), 1);

    let joined = hub.published_events(events::USER_JOINED);
    assert_eq!(joined.last().map(|f| f.sender.clone()), Some(Some(pid("a"))));

    a.handle.stop().await.unwrap();
}

#[tokio::test]
async fn test_stop_releases_everything() {
    let hub = MemoryRelayHub::new();
    let mut a = spawn_node(&hub, MeshContext::member("a", "red").with_voice_enabled("red"));
    wait_status(&mut a.status, "a joined", |s| voice_on(s, "red")).await;
    let mut b = spawn_node(&hub, MeshContext::member("b", "red").with_voice_enabled("red"));
    wait_status(&mut a.status, "a connected", |s| s.connected_peers == 1).await;

    let status = a.status.clone();
    a.handle.stop().await.unwrap();

    assert_eq!(a.microphone.stops(), 1);
    assert_eq!(a.output.playing(), 0);
    assert!(a.connector.latest(&pid("b")).unwrap().is_closed());
    assert_eq!(hub.subscriber_count(&channel("red")), 1);
    assert!(status.borrow().roster.is_empty());

    wait_status(&mut b.status, "b still joined", |s| voice_on(s, "red")).await;
    b.handle.stop().await.unwrap();
}

#[tokio::test]
async fn test_failed_peer_removed_until_next_join() {
    let hub = MemoryRelayHub::new();
    let mut a = spawn_node(&hub, MeshContext::member("a", "red").with_voice_enabled("red"));
    wait_status(&mut a.status, "a joined", |s| voice_on(s, "red")).await;
    let mut b = spawn_node(&hub, MeshContext::member("b", "red").with_voice_enabled("red"));
    wait_status(&mut a.status, "a connected", |s| s.connected_peers == 1).await;
    wait_status(&mut b.status, "b connected", |s| s.connected_peers == 1).await;

    // The link drops on both ends
    let a_to_b = a.connector.latest(&pid("b")).unwrap();
    let b_to_a = b.connector.latest(&pid("a")).unwrap();
    a_to_b.report(PeerSignal::StateChanged(PeerConnectionState::Failed));
    b_to_a.report(PeerSignal::StateChanged(PeerConnectionState::Failed));

    let status = wait_status(&mut a.status, "a dropped b", |s| s.connected_peers == 0).await;
    assert_eq!(
        status.roster.get(&team("red")),
        Some(&[pid("a")].into_iter().collect())
    );
    wait_status(&mut b.status, "b dropped a", |s| s.connected_peers == 0).await;
    assert!(a_to_b.is_closed());
    assert!(b_to_a.is_closed());
    assert_eq!(a.output.playing(), 0);

    // A join that cannot get a connection is not retried either
    a.connector.fail_next("b");
    let join = || RelayEvent::UserJoined(UserJoinedPayload { user_id: pid("b") });
    hub.broadcast(&channel("red"), join());
    hub.broadcast(&channel("red"), join());

    wait_status(&mut a.status, "a reconnected", |s| s.connected_peers == 1).await;
    wait_status(&mut b.status, "b reconnected", |s| s.connected_peers == 1).await;

    // One offer for the first join, one for the rejoin, none for the failures
    let offers = hub.published_events(events::OFFER);
    assert_eq!(offers.len(), 2);
    assert_eq!(a.connector.connects(), 2);
    assert_eq!(b.connector.connects(), 2);

    let fresh = a.connector.latest(&pid("b")).unwrap();
    assert!(!fresh.is_closed());
    assert_eq!(
        fresh.local_description().map(|d| d.sdp),
        Some("v=0 offer-to-b".to_string())
    );
    assert_eq!(
        fresh.remote_description().map(|d| d.sdp),
        Some("v=0 answer-to-a".to_string())
    );

    a.handle.stop().await.unwrap();
    b.handle.stop().await.unwrap();
}

#[tokio::test]
async fn test_spectator_left_only_drops_spectator_peers() {
    let hub = MemoryRelayHub::new();
    let mut a = spawn_node(&hub, MeshContext::member("a", "red").with_voice_enabled("red"));
    wait_status(&mut a.status, "a joined", |s| voice_on(s, "red")).await;
    let mut b = spawn_node(&hub, MeshContext::member("b", "red").with_voice_enabled("red"));
    wait_status(&mut a.status, "a connected to b", |s| s.connected_peers == 1).await;

    let mut m = spawn_node(
        &hub,
        MeshContext::moderator("m", ["red"]).with_voice_enabled("red"),
    );
    wait_status(&mut m.status, "m connected", |s| s.connected_peers == 2).await;
    wait_status(&mut a.status, "a connected to m", |s| s.connected_peers == 2).await;

    // A spectator-left naming a member leaves the member connection alone
    hub.broadcast(
        &channel("red"),
        RelayEvent::SpectatorLeft(SpectatorPayload {
            spectator_id: pid("b"),
        }),
    );
    sleep(Duration::from_millis(50)).await;
    assert_eq!(a.status.borrow().connected_peers, 2);
    assert!(!a.connector.latest(&pid("b")).unwrap().is_closed());

    hub.broadcast(
        &channel("red"),
        RelayEvent::SpectatorLeft(SpectatorPayload {
            spectator_id: pid("m"),
        }),
    );
    wait_status(&mut a.status, "a dropped m", |s| s.connected_peers == 1).await;
    assert!(a.connector.latest(&pid("m")).unwrap().is_closed());
    assert!(!a.connector.latest(&pid("b")).unwrap().is_closed());

    m.handle.stop().await.unwrap();
    a.handle.stop().await.unwrap();
    b.handle.stop().await.unwrap();
}
