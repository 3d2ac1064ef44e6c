//! End-to-end room scenarios on the simulated backends.
//!
//! Time is paused: sleeps advance the clock instantly once every task is idle.

use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;
use watchroom_common::config::{VoiceConfig, VoiceStrategy};
use watchroom_common::{Member, UserId};
use watchroom_voice::encoder::RelayFrame;
use watchroom_voice::peer::{HealthState, TransportMode};
use watchroom_voice::signaling::{OutboundSignal, SessionDescription};
use watchroom_voice::sim::{
    LinkScript, ManualClock, RecordingPlayback, RecordingSignaling, SimBus, SimCaptureDevice,
    SimTransportFactory,
};
use watchroom_voice::transport::ConnectionState;
use watchroom_voice::{
    InboundSignal, RoomTransport, SignalingChannel, VoiceBackends, VoiceHandle, VoiceSession,
    VoiceStatus,
};

fn config() -> VoiceConfig {
    VoiceConfig {
        noise_suppression: false,
        ..VoiceConfig::default()
    }
}

fn roster(me: UserId, others: &[UserId]) -> Vec<Member> {
    let mut members = vec![Member::new(me, "me", true)];
    members.extend(others.iter().map(|id| Member::new(*id, "peer", false)));
    members
}

/// One member driven by hand: outbound signals are recorded, transports
/// only report what the test tells them to.
struct Solo {
    me: UserId,
    handle: VoiceHandle,
    sent: Arc<RecordingSignaling>,
    factory: Arc<SimTransportFactory>,
    device: Arc<SimCaptureDevice>,
    clock: Arc<ManualClock>,
}

impl Solo {
    fn new(others: &[UserId]) -> Self {
        Self::with_config(others, config())
    }

    fn with_config(others: &[UserId], config: VoiceConfig) -> Self {
        let me = Uuid::new_v4();
        let sent = Arc::new(RecordingSignaling::new());
        let factory = Arc::new(SimTransportFactory::new(LinkScript::Silent));
        let device = Arc::new(SimCaptureDevice::tone(48_000, 220.0, 0.4));
        let clock = Arc::new(ManualClock::new());
        let handle = VoiceSession::spawn(
            config,
            me,
            Uuid::new_v4(),
            roster(me, others),
            VoiceBackends {
                signaling: sent.clone(),
                capture: device.clone(),
                transports: factory.clone(),
                clock: clock.clone(),
                playback: Arc::new(RecordingPlayback::new()),
            },
        );
        Self {
            me,
            handle,
            sent,
            factory,
            device,
            clock,
        }
    }

    async fn answer_from(&self, peer: UserId) {
        self.handle
            .deliver(InboundSignal::Answer {
                user_id: peer,
                answer: SessionDescription::answer("v=0\r\ns=remote\r\n"),
            })
            .unwrap();
        self.settle().await;
    }

    fn report(&self, peer: UserId, state: ConnectionState) {
        self.factory.transport(peer).unwrap().report(state);
    }

    /// Wait until every queued command has been processed.
    async fn settle(&self) {
        self.handle.snapshot().await.unwrap();
    }

    fn total_offers(&self) -> usize {
        self.sent
            .signals()
            .iter()
            .filter(|s| matches!(s, OutboundSignal::Offer { .. }))
            .count()
    }
}

fn chunk_100ms() -> Vec<u8> {
    RelayFrame::new(Uuid::nil(), vec![2_000; 1_600], 16_000).to_bytes()
}

#[tokio::test(start_paused = true)]
async fn enabling_mic_offers_exactly_once_to_the_only_peer() {
    let b = Uuid::new_v4();
    let a = Solo::new(&[b]);

    a.handle.set_mic_enabled(true).await.unwrap();
    a.settle().await;

    assert_eq!(a.sent.offers_to(b), 1);
    assert_eq!(a.total_offers(), 1);
    assert!(a
        .sent
        .signals()
        .iter()
        .any(|s| matches!(s, OutboundSignal::MicEnabled { user_id } if *user_id == a.me)));
    assert_eq!(a.handle.status(), VoiceStatus::Connecting);
}

#[tokio::test(start_paused = true)]
async fn immediate_failure_of_only_link_falls_back_to_relay() {
    let bus = SimBus::new();
    let room = Uuid::new_v4();
    let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
    let members = vec![Member::new(a, "a", false), Member::new(b, "b", false)];

    let spawn = |me: UserId| {
        let handle = VoiceSession::spawn(
            config(),
            me,
            room,
            members.clone(),
            VoiceBackends {
                signaling: bus.channel(me),
                capture: Arc::new(SimCaptureDevice::tone(48_000, 330.0, 0.4)),
                transports: Arc::new(SimTransportFactory::new(LinkScript::Fail {
                    after: Duration::ZERO,
                })),
                clock: Arc::new(ManualClock::new()),
                playback: Arc::new(RecordingPlayback::new()),
            },
        );
        bus.attach(handle.clone());
        handle
    };
    let alice = spawn(a);
    let bob = spawn(b);

    alice.set_mic_enabled(true).await.unwrap();
    bob.set_mic_enabled(true).await.unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;

    let snap = alice.snapshot().await.unwrap();
    assert!(snap.all_direct_failed);
    assert_eq!(snap.fallbacks, 1);
    assert_eq!(snap.room_transport, RoomTransport::Relay);
    assert!(snap.relay_sending);
    assert_eq!(snap.status, VoiceStatus::ConnectedRelay);
    assert_eq!(snap.link(&b).unwrap().transport_mode, TransportMode::Relay);

    // bob hears alice through the relay
    tokio::time::sleep(Duration::from_secs(2)).await;
    let heard = bob.snapshot().await.unwrap();
    assert!(heard.queue(&a).is_some_and(|q| q.played > 0));

    alice.leave().await.unwrap();
    bob.leave().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn one_healthy_peer_keeps_the_mesh() {
    let (b, c) = (Uuid::new_v4(), Uuid::new_v4());
    let a = Solo::new(&[b, c]);
    a.handle.set_mic_enabled(true).await.unwrap();
    a.answer_from(b).await;
    a.answer_from(c).await;

    a.report(b, ConnectionState::Checking);
    a.report(b, ConnectionState::Connected);
    a.report(c, ConnectionState::Checking);
    a.report(c, ConnectionState::Failed);
    a.settle().await;

    let snap = a.handle.snapshot().await.unwrap();
    assert!(!snap.all_direct_failed);
    assert_eq!(snap.fallbacks, 0);
    assert!(!snap.relay_sending);
    assert_eq!(snap.room_transport, RoomTransport::Mesh);
    assert_eq!(snap.status, VoiceStatus::ConnectedDirect);

    let healthy = snap.link(&b).unwrap();
    assert!(healthy.transport_open);
    assert_eq!(healthy.health, HealthState::Healthy);
    let failed = snap.link(&c).unwrap();
    assert!(!failed.transport_open);
    assert_eq!(failed.health, HealthState::Failed);
    assert!(a.factory.transport(c).unwrap().is_closed());
    assert!(!a.factory.transport(b).unwrap().is_closed());
}

#[tokio::test(start_paused = true)]
async fn relay_backlog_past_bound_drops_and_resets() {
    let x = Uuid::new_v4();
    let a = Solo::new(&[x]);

    for _ in 0..6 {
        a.handle
            .deliver(InboundSignal::AudioChunk {
                user_id: x,
                audio_data: chunk_100ms(),
                sample_rate: Some(16_000),
            })
            .unwrap();
    }
    let snap = a.handle.snapshot().await.unwrap();
    assert_eq!(snap.queue(&x).unwrap().queued_ms, 600);

    a.handle
        .deliver(InboundSignal::AudioChunk {
            user_id: x,
            audio_data: chunk_100ms(),
            sample_rate: None,
        })
        .unwrap();
    let snap = a.handle.snapshot().await.unwrap();
    let queue = snap.queue(&x).unwrap();
    assert_eq!(queue.dropped, 1);
    assert_eq!(queue.played, 6);
    assert_eq!(queue.queued_ms, 0);
    assert_eq!(a.clock.scheduled().len(), 6);

    a.clock.advance(Duration::from_millis(40));
    a.handle
        .deliver(InboundSignal::AudioChunk {
            user_id: x,
            audio_data: chunk_100ms(),
            sample_rate: None,
        })
        .unwrap();
    a.settle().await;
    let last = a.clock.scheduled().pop().unwrap();
    assert_eq!(last.at, Duration::from_millis(40));
}

#[tokio::test(start_paused = true)]
async fn relay_flood_is_bounded_while_the_session_is_busy() {
    let x = Uuid::new_v4();
    let a = Solo::new(&[x]);
    let chunk = || InboundSignal::AudioChunk {
        user_id: x,
        audio_data: chunk_100ms(),
        sample_rate: None,
    };

    // nothing runs the session task between these sends
    for _ in 0..300 {
        a.handle.deliver(chunk()).unwrap();
    }
    let snap = a.handle.snapshot().await.unwrap();
    let queue = snap.queue(&x).unwrap();
    assert_eq!(queue.played + queue.dropped, 256);
    assert_eq!(snap.relay_chunks_refused, 44);

    a.handle.deliver(chunk()).unwrap();
    let snap = a.handle.snapshot().await.unwrap();
    let queue = snap.queue(&x).unwrap();
    assert_eq!(queue.played + queue.dropped, 257);
    assert_eq!(snap.relay_chunks_refused, 44);
}

#[tokio::test(start_paused = true)]
async fn malformed_relay_frame_keeps_the_timeline() {
    let x = Uuid::new_v4();
    let a = Solo::new(&[x]);
    a.handle
        .deliver(InboundSignal::AudioChunk {
            user_id: x,
            audio_data: chunk_100ms(),
            sample_rate: None,
        })
        .unwrap();
    a.handle
        .deliver(InboundSignal::AudioChunk {
            user_id: x,
            audio_data: vec![7],
            sample_rate: None,
        })
        .unwrap();

    let snap = a.handle.snapshot().await.unwrap();
    let queue = snap.queue(&x).unwrap();
    assert_eq!(queue.played, 1);
    assert_eq!(queue.queued_ms, 100);
}

#[tokio::test(start_paused = true)]
async fn short_disconnect_inside_window_never_falls_back() {
    let b = Uuid::new_v4();
    let a = Solo::new(&[b]);
    a.handle.set_mic_enabled(true).await.unwrap();
    a.answer_from(b).await;
    a.report(b, ConnectionState::Connected);
    a.report(b, ConnectionState::Disconnected);
    a.settle().await;

    tokio::time::sleep(Duration::from_millis(4_900)).await;
    let snap = a.handle.snapshot().await.unwrap();
    assert_eq!(snap.link(&b).unwrap().health, HealthState::Suspect);
    assert!(snap.link(&b).unwrap().suspect_for_ms.is_some());
    assert!(!snap.all_direct_failed);
    assert_eq!(snap.fallbacks, 0);

    a.report(b, ConnectionState::Connected);
    a.settle().await;
    tokio::time::sleep(Duration::from_secs(10)).await;

    let snap = a.handle.snapshot().await.unwrap();
    assert_eq!(snap.link(&b).unwrap().health, HealthState::Healthy);
    assert_eq!(snap.fallbacks, 0);
    assert!(!snap.relay_sending);
}

#[tokio::test(start_paused = true)]
async fn disconnect_past_window_fails_the_link() {
    let b = Uuid::new_v4();
    let a = Solo::new(&[b]);
    a.handle.set_mic_enabled(true).await.unwrap();
    a.answer_from(b).await;
    a.report(b, ConnectionState::Connected);
    a.report(b, ConnectionState::Disconnected);
    a.settle().await;

    tokio::time::sleep(Duration::from_millis(5_100)).await;
    let snap = a.handle.snapshot().await.unwrap();
    let link = snap.link(&b).unwrap();
    assert_eq!(link.health, HealthState::Failed);
    assert!(!link.transport_open);
    assert_eq!(snap.fallbacks, 1);
    assert!(snap.relay_sending);
}

#[tokio::test(start_paused = true)]
async fn whole_mesh_outage_falls_back_exactly_once() {
    let peers = [Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4()];
    let a = Solo::new(&peers);
    a.handle.set_mic_enabled(true).await.unwrap();
    for peer in &peers {
        a.answer_from(*peer).await;
        a.report(*peer, ConnectionState::Connected);
    }
    a.settle().await;

    for peer in &peers {
        a.report(*peer, ConnectionState::Failed);
    }
    a.settle().await;
    tokio::time::sleep(Duration::from_secs(6)).await;

    let snap = a.handle.snapshot().await.unwrap();
    assert_eq!(snap.fallbacks, 1);
    assert!(snap.all_direct_failed);
    assert!(snap.relay_sending);
    assert!(snap.links.iter().all(|l| l.transport_mode == TransportMode::Relay));
}

#[tokio::test(start_paused = true)]
async fn muting_keeps_links_and_unmuting_does_not_reoffer() {
    let b = Uuid::new_v4();
    let a = Solo::new(&[b]);
    a.handle.set_mic_enabled(true).await.unwrap();
    a.answer_from(b).await;
    a.report(b, ConnectionState::Connected);
    a.settle().await;

    a.handle.set_mic_enabled(false).await.unwrap();
    let snap = a.handle.snapshot().await.unwrap();
    assert!(!snap.mic_enabled);
    assert!(snap.mic_acquired);
    assert!(snap.link(&b).unwrap().transport_open);
    assert_eq!(a.device.open_count(), 1);

    a.handle.set_mic_enabled(true).await.unwrap();
    a.settle().await;
    assert_eq!(a.sent.offers_to(b), 1);
    assert_eq!(a.device.acquire_calls(), 1);
    assert_eq!(a.factory.created(), 1);
    assert_eq!(a.factory.transport(b).unwrap().offers_created(), 1);
}

#[tokio::test(start_paused = true)]
async fn relay_audio_from_a_directly_heard_peer_is_skipped() {
    let b = Uuid::new_v4();
    let a = Solo::new(&[b]);
    a.handle.set_mic_enabled(true).await.unwrap();
    a.answer_from(b).await;
    a.report(b, ConnectionState::Connected);
    a.handle
        .deliver(InboundSignal::AudioChunk {
            user_id: b,
            audio_data: chunk_100ms(),
            sample_rate: None,
        })
        .unwrap();

    let snap = a.handle.snapshot().await.unwrap();
    assert!(snap.queue(&b).is_none());
    assert!(a.clock.scheduled().is_empty());
}

#[tokio::test(start_paused = true)]
async fn membership_changes_open_and_close_links() {
    let (b, c) = (Uuid::new_v4(), Uuid::new_v4());
    let a = Solo::new(&[b]);
    a.handle.set_mic_enabled(true).await.unwrap();
    a.settle().await;

    a.handle
        .deliver(InboundSignal::AudioChunk {
            user_id: b,
            audio_data: chunk_100ms(),
            sample_rate: None,
        })
        .unwrap();
    let snap = a.handle.snapshot().await.unwrap();
    assert!(snap.queue(&b).is_some());

    a.handle.members_changed(roster(a.me, &[c])).unwrap();
    let snap = a.handle.snapshot().await.unwrap();
    assert!(snap.link(&b).is_none());
    assert!(snap.queue(&b).is_none());
    assert!(snap.link(&c).is_some());
    assert!(a.factory.transport(b).unwrap().is_closed());
    assert_eq!(a.sent.offers_to(c), 1);
}

#[tokio::test(start_paused = true)]
async fn departed_peer_hysteresis_never_fires() {
    let (b, c) = (Uuid::new_v4(), Uuid::new_v4());
    let a = Solo::new(&[b, c]);
    a.handle.set_mic_enabled(true).await.unwrap();
    a.answer_from(b).await;
    a.answer_from(c).await;
    a.report(b, ConnectionState::Connected);
    a.report(c, ConnectionState::Connected);
    a.report(b, ConnectionState::Disconnected);
    a.settle().await;
    let snap = a.handle.snapshot().await.unwrap();
    assert_eq!(snap.link(&b).unwrap().health, HealthState::Suspect);

    a.handle.members_changed(roster(a.me, &[c])).unwrap();
    let before = a.handle.snapshot().await.unwrap();
    assert!(before.link(&b).is_none());
    assert!(a.factory.transport(b).unwrap().is_closed());

    tokio::time::sleep(Duration::from_secs(6)).await;

    let after = a.handle.snapshot().await.unwrap();
    assert!(after.link(&b).is_none());
    assert_eq!(after.fallbacks, 0);
    assert_eq!(after.room_transport, RoomTransport::Mesh);
    assert!(!after.relay_sending);
    assert_eq!(after.status, VoiceStatus::ConnectedDirect);
    assert_eq!(after.links.len(), before.links.len());
    assert_eq!(after.link(&c).unwrap().health, HealthState::Healthy);
}

#[tokio::test(start_paused = true)]
async fn lost_offer_leaves_only_that_link_pending() {
    let bus = SimBus::new();
    let room = Uuid::new_v4();
    let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
    let members = vec![
        Member::new(a, "a", false),
        Member::new(b, "b", false),
        Member::new(c, "c", false),
    ];
    bus.sever(a, b);

    let mut handles = Vec::new();
    for me in [a, b, c] {
        let handle = VoiceSession::spawn(
            config(),
            me,
            room,
            members.clone(),
            VoiceBackends {
                signaling: bus.channel(me),
                capture: Arc::new(SimCaptureDevice::silent(48_000)),
                transports: Arc::new(SimTransportFactory::new(LinkScript::connect())),
                clock: Arc::new(ManualClock::new()),
                playback: Arc::new(RecordingPlayback::new()),
            },
        );
        bus.attach(handle.clone());
        handles.push(handle);
    }

    handles[0].set_mic_enabled(true).await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;

    let snap = handles[0].snapshot().await.unwrap();
    let pending = snap.link(&b).unwrap();
    assert!(pending.transport_open);
    assert_eq!(pending.health, HealthState::Pending);
    assert_eq!(pending.connection_state, ConnectionState::New);
    assert_eq!(snap.link(&c).unwrap().health, HealthState::Healthy);
    assert_eq!(snap.status, VoiceStatus::ConnectedDirect);
    assert_eq!(snap.fallbacks, 0);
    assert!(!snap.relay_sending);
    assert!(bus.dropped() > 0);

    let unreached = handles[1].snapshot().await.unwrap();
    assert!(unreached.link(&a).is_none());
    for handle in &handles {
        handle.leave().await.unwrap();
    }
}

#[tokio::test(start_paused = true)]
async fn failing_signaling_sends_are_contained() {
    let (b, c) = (Uuid::new_v4(), Uuid::new_v4());
    let a = Solo::new(&[b, c]);
    a.sent.fail_sends(true);
    a.handle.set_mic_enabled(true).await.unwrap();
    a.settle().await;

    let snap = a.handle.snapshot().await.unwrap();
    assert_eq!(a.total_offers(), 0);
    assert!(snap.link(&b).unwrap().transport_open);
    assert!(snap.link(&c).unwrap().transport_open);
    assert_eq!(snap.fallbacks, 0);
    assert_eq!(snap.status, VoiceStatus::Connecting);

    // the session keeps working once the channel recovers
    a.sent.fail_sends(false);
    a.answer_from(b).await;
    a.report(b, ConnectionState::Connected);
    let snap = a.handle.snapshot().await.unwrap();
    assert_eq!(snap.status, VoiceStatus::ConnectedDirect);
}

#[tokio::test(start_paused = true)]
async fn safety_net_relay_stops_once_a_direct_link_is_up() {
    let a = Solo::new(&[]);
    a.handle.set_mic_enabled(true).await.unwrap();
    let snap = a.handle.snapshot().await.unwrap();
    assert!(snap.relay_sending);

    let b = Uuid::new_v4();
    a.handle.members_changed(roster(a.me, &[b])).unwrap();
    a.answer_from(b).await;
    a.report(b, ConnectionState::Connected);

    let snap = a.handle.snapshot().await.unwrap();
    assert!(!snap.relay_sending);
    assert_eq!(snap.status, VoiceStatus::ConnectedDirect);
}

#[tokio::test(start_paused = true)]
async fn fallback_without_mic_keeps_listening() {
    let b = Uuid::new_v4();
    let a = Solo::new(&[b]);
    a.handle
        .deliver(InboundSignal::Offer {
            user_id: b,
            offer: SessionDescription::offer("v=0\r\ns=remote\r\n"),
        })
        .unwrap();
    a.settle().await;
    a.report(b, ConnectionState::Failed);

    let snap = a.handle.snapshot().await.unwrap();
    assert_eq!(snap.room_transport, RoomTransport::Relay);
    assert!(!snap.relay_sending);
    assert_eq!(snap.status, VoiceStatus::ConnectedRelay);

    // turning the mic on now goes straight to the relay
    a.handle.set_mic_enabled(true).await.unwrap();
    let snap = a.handle.snapshot().await.unwrap();
    assert!(snap.relay_sending);
    assert_eq!(a.sent.offers_to(b), 0);
}

#[tokio::test(start_paused = true)]
async fn server_only_members_talk_through_the_relay() {
    let bus = SimBus::new();
    let room = Uuid::new_v4();
    let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
    let members = vec![Member::new(a, "a", false), Member::new(b, "b", false)];
    let cfg = VoiceConfig {
        strategy: VoiceStrategy::ServerOnly,
        ..config()
    };

    let factories = [
        Arc::new(SimTransportFactory::new(LinkScript::connect())),
        Arc::new(SimTransportFactory::new(LinkScript::connect())),
    ];
    let mut handles = Vec::new();
    for (me, factory) in [a, b].into_iter().zip(factories.iter()) {
        let handle = VoiceSession::spawn(
            cfg.clone(),
            me,
            room,
            members.clone(),
            VoiceBackends {
                signaling: bus.channel(me),
                capture: Arc::new(SimCaptureDevice::tone(48_000, 440.0, 0.4)),
                transports: factory.clone(),
                clock: Arc::new(ManualClock::new()),
                playback: Arc::new(RecordingPlayback::new()),
            },
        );
        bus.attach(handle.clone());
        handles.push(handle);
    }

    handles[0].set_mic_enabled(true).await.unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;

    let listener = handles[1].snapshot().await.unwrap();
    assert!(listener.queue(&a).is_some_and(|q| q.played > 0));
    assert!(factories.iter().all(|f| f.created() == 0));
    for handle in &handles {
        handle.leave().await.unwrap();
    }
}

#[tokio::test(start_paused = true)]
async fn two_members_connect_directly_over_the_bus() {
    let bus = SimBus::new();
    let room = Uuid::new_v4();
    let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
    let members = vec![Member::new(a, "a", false), Member::new(b, "b", false)];

    let mut handles = Vec::new();
    for me in [a, b] {
        let handle = VoiceSession::spawn(
            config(),
            me,
            room,
            members.clone(),
            VoiceBackends {
                signaling: bus.channel(me),
                capture: Arc::new(SimCaptureDevice::silent(48_000)),
                transports: Arc::new(SimTransportFactory::new(LinkScript::connect())),
                clock: Arc::new(ManualClock::new()),
                playback: Arc::new(RecordingPlayback::new()),
            },
        );
        bus.attach(handle.clone());
        handles.push(handle);
    }

    let (ra, rb) = tokio::join!(
        handles[0].set_mic_enabled(true),
        handles[1].set_mic_enabled(true)
    );
    ra.unwrap();
    rb.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;

    for (handle, peer) in handles.iter().zip([b, a]) {
        let snap = handle.snapshot().await.unwrap();
        assert_eq!(snap.status, VoiceStatus::ConnectedDirect);
        assert_eq!(snap.link(&peer).unwrap().transport_mode, TransportMode::Direct);
        assert!(!snap.relay_sending);
    }
    assert!(bus.delivered() > 0);
    for handle in &handles {
        handle.leave().await.unwrap();
    }
}

#[tokio::test(start_paused = true)]
async fn signaling_outage_pauses_relay_sends() {
    let a = Solo::new(&[]);
    a.sent.set_connected(false);
    a.handle.set_mic_enabled(true).await.unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(a.sent.audio_chunks(), 0);

    a.sent.set_connected(true);
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(a.sent.audio_chunks() > 0);
    assert!(a.sent.is_connected());
}
