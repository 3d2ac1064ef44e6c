//! Voice session: the per-room decision loop.
//!
//! One task owns every piece of voice state for a room (local source, peer
//! links, health, relay encoder and scheduler). Everything that happens,
//! whether a UI toggle, a signaling message, a transport callback or a timer,
//! becomes a [`SessionCommand`] processed in order. Nothing else mutates that
//! state.
//!
//! The UI sees a coarse [`VoiceStatus`] on a watch channel and talks to the
//! loop through a cloneable [`VoiceHandle`].

use crate::capture::{AudioCaptureDevice, LocalAudioSource, LocalTrack};
use crate::encoder::{RelaySender, RelayStatsSnapshot};
use crate::health::{HealthMonitor, HealthTransition};
use crate::peer::{
    HealthState, Initiation, OfferOutcome, PeerConnectionManager, PeerLink, TransportMode,
};
use crate::playback::{AudioClock, DirectPlayback};
use crate::scheduler::RelayScheduler;
use crate::signaling::{
    DEFAULT_CHUNK_SAMPLE_RATE, InboundSignal, SignalingChannel, SignalingConsumer,
};
use crate::transport::{
    ConnectionState, EventSink, LinkEvent, RemoteTrack, TransportEvent, TransportFactory,
};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use watchroom_common::config::{VoiceConfig, VoiceStrategy};
use watchroom_common::models::others;
use watchroom_common::{Member, RoomId, UserId, VoiceError, VoiceResult};

/// Inbound relay chunks allowed to wait in the command queue at once.
const MAX_QUEUED_RELAY_CHUNKS: usize = 256;

/// Milliseconds for diagnostics, saturating instead of wrapping.
fn whole_millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Coarse state shown to the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "message", rename_all = "kebab-case")]
pub enum VoiceStatus {
    Idle,
    Connecting,
    ConnectedDirect,
    ConnectedRelay,
    Error(String),
}

impl VoiceStatus {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::ConnectedDirect => "connected-direct",
            Self::ConnectedRelay => "connected-relay",
            Self::Error(_) => "error",
        }
    }
}

/// Which path the room as a whole uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomTransport {
    Mesh,
    Relay,
}

/// Platform capabilities a session runs on.
#[derive(Clone)]
pub struct VoiceBackends {
    pub signaling: Arc<dyn SignalingChannel>,
    pub capture: Arc<dyn AudioCaptureDevice>,
    pub transports: Arc<dyn TransportFactory>,
    pub clock: Arc<dyn AudioClock>,
    pub playback: Arc<dyn DirectPlayback>,
}

/// Commands processed by the session task.
#[derive(Debug)]
enum SessionCommand {
    SetMic {
        enabled: bool,
        reply: oneshot::Sender<VoiceResult<()>>,
    },
    SetSpeaker {
        enabled: bool,
    },
    Members(Vec<Member>),
    Signal(InboundSignal),
    Link(LinkEvent),
    HysteresisExpired {
        peer: UserId,
        epoch: u64,
        generation: u64,
    },
    CaptureAcquired(VoiceResult<LocalTrack>),
    Snapshot(oneshot::Sender<SessionSnapshot>),
    Leave(oneshot::Sender<()>),
}

/// Point-in-time view of one link.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkSnapshot {
    pub peer_id: UserId,
    pub transport_mode: TransportMode,
    pub connection_state: ConnectionState,
    pub health: HealthState,
    pub transport_open: bool,
    pub sending_audio: bool,
    pub receiving_audio: bool,
    pub suspect_for_ms: Option<u64>,
}

/// Point-in-time view of one relay playback timeline.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueSnapshot {
    pub peer_id: UserId,
    /// Backlog ahead of the output clock.
    pub queued_ms: u64,
    pub played: u64,
    pub dropped: u64,
}

/// Everything the session knows, for diagnostics and tests.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub self_id: UserId,
    pub room_id: RoomId,
    pub status: VoiceStatus,
    pub strategy: VoiceStrategy,
    pub room_transport: RoomTransport,
    pub mic_enabled: bool,
    pub mic_acquired: bool,
    pub speaker_enabled: bool,
    pub relay_sending: bool,
    pub relay_stats: Option<RelayStatsSnapshot>,
    pub all_direct_failed: bool,
    pub fallbacks: u64,
    pub links: Vec<LinkSnapshot>,
    pub queues: Vec<QueueSnapshot>,
    /// Relay chunks refused because the session was backlogged.
    pub relay_chunks_refused: u64,
}

impl SessionSnapshot {
    pub fn link(&self, peer: &UserId) -> Option<&LinkSnapshot> {
        self.links.iter().find(|l| l.peer_id == *peer)
    }

    pub fn queue(&self, peer: &UserId) -> Option<&QueueSnapshot> {
        self.queues.iter().find(|q| q.peer_id == *peer)
    }
}

/// Admission count for relay audio sitting in the command queue. Control
/// messages share the queue and keep their order; only audio is refused.
#[derive(Debug, Default)]
struct RelayInbox {
    queued: AtomicUsize,
    refused: AtomicU64,
}

impl RelayInbox {
    fn admit(&self) -> bool {
        let admitted = self
            .queued
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < MAX_QUEUED_RELAY_CHUNKS).then_some(n + 1)
            })
            .is_ok();
        if !admitted {
            self.refused.fetch_add(1, Ordering::Relaxed);
        }
        admitted
    }

    fn taken(&self) {
        let _ = self
            .queued
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    fn refused(&self) -> u64 {
        self.refused.load(Ordering::Relaxed)
    }
}

/// Client side of a running session.
#[derive(Clone)]
pub struct VoiceHandle {
    commands: mpsc::UnboundedSender<SessionCommand>,
    inbox: Arc<RelayInbox>,
    status: watch::Receiver<VoiceStatus>,
    self_id: UserId,
    room_id: RoomId,
}

impl VoiceHandle {
    pub fn self_id(&self) -> UserId {
        self.self_id
    }

    pub fn room_id(&self) -> RoomId {
        self.room_id
    }

    fn send(&self, command: SessionCommand) -> VoiceResult<()> {
        self.commands
            .send(command)
            .map_err(|_| VoiceError::ChannelClosed)
    }

    /// Turn the microphone on or off. Enabling waits for the device;
    /// a refused device is reported here and leaves the mic off.
    pub async fn set_mic_enabled(&self, enabled: bool) -> VoiceResult<()> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::SetMic { enabled, reply })?;
        rx.await.map_err(|_| VoiceError::ChannelClosed)?
    }

    pub fn set_speaker_enabled(&self, enabled: bool) -> VoiceResult<()> {
        self.send(SessionCommand::SetSpeaker { enabled })
    }

    /// The room's full member list changed.
    pub fn members_changed(&self, members: Vec<Member>) -> VoiceResult<()> {
        self.send(SessionCommand::Members(members))
    }

    /// Hand an inbound voice message to the session. Relay audio arriving
    /// while the session is backlogged is dropped.
    pub fn deliver(&self, signal: InboundSignal) -> VoiceResult<()> {
        if matches!(signal, InboundSignal::AudioChunk { .. }) && !self.inbox.admit() {
            tracing::debug!(peer = %signal.sender(), "Session backlogged, dropping relay chunk");
            return Ok(());
        }
        self.send(SessionCommand::Signal(signal))
    }

    /// Decode and deliver a raw `voice:*` event from the room channel.
    pub fn deliver_raw(&self, event: &str, data: serde_json::Value) -> VoiceResult<()> {
        let signal = InboundSignal::decode(event, data).inspect_err(|e| {
            tracing::warn!(event, error = %e, "Dropping undecodable voice message");
        })?;
        self.deliver(signal)
    }

    pub fn status(&self) -> VoiceStatus {
        self.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<VoiceStatus> {
        self.status.clone()
    }

    pub async fn snapshot(&self) -> VoiceResult<SessionSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::Snapshot(reply))?;
        rx.await.map_err(|_| VoiceError::ChannelClosed)
    }

    /// Leave the room: release the microphone and close everything.
    pub async fn leave(&self) -> VoiceResult<()> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::Leave(reply))?;
        rx.await.map_err(|_| VoiceError::ChannelClosed)
    }
}

/// State owned by the session task.
pub struct VoiceSession {
    config: VoiceConfig,
    signaling: SignalingConsumer,
    source: LocalAudioSource,
    peers: PeerConnectionManager,
    health: HealthMonitor,
    scheduler: RelayScheduler,
    playback: Arc<dyn DirectPlayback>,
    relay: Option<RelaySender>,
    room_transport: RoomTransport,
    members: Vec<Member>,
    mic_enabled: bool,
    speaker_enabled: bool,
    acquiring: bool,
    mic_waiters: Vec<oneshot::Sender<VoiceResult<()>>>,
    direct_playing: HashSet<UserId>,
    /// The running relay was started only because nobody else was in the room.
    safety_net: bool,
    last_error: Option<String>,
    fallbacks: u64,
    commands: mpsc::WeakUnboundedSender<SessionCommand>,
    inbox: Arc<RelayInbox>,
    status: watch::Sender<VoiceStatus>,
}

impl VoiceSession {
    /// Start a session for `self_id` in `room_id`. The task ends on
    /// [`VoiceHandle::leave`] or when every handle is dropped.
    pub fn spawn(
        config: VoiceConfig,
        self_id: UserId,
        room_id: RoomId,
        members: Vec<Member>,
        backends: VoiceBackends,
    ) -> VoiceHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(VoiceStatus::Idle);
        let weak = tx.downgrade();
        let inbox = Arc::new(RelayInbox::default());

        let sink: EventSink = {
            let weak = weak.clone();
            Arc::new(move |event| match weak.upgrade() {
                Some(tx) => tx.send(SessionCommand::Link(event)).is_ok(),
                None => false,
            })
        };

        let signaling = SignalingConsumer::new(backends.signaling, self_id, room_id);
        let room_transport = match config.strategy {
            VoiceStrategy::WebrtcFallback => RoomTransport::Mesh,
            VoiceStrategy::ServerOnly => RoomTransport::Relay,
        };

        let session = Self {
            peers: PeerConnectionManager::new(
                backends.transports,
                signaling.clone(),
                config.ice_servers.clone(),
                sink,
            ),
            health: HealthMonitor::new(config.hysteresis()),
            scheduler: RelayScheduler::new(backends.clock, config.max_queue_delay()),
            source: LocalAudioSource::new(backends.capture),
            playback: backends.playback,
            signaling,
            relay: None,
            room_transport,
            members,
            mic_enabled: false,
            speaker_enabled: true,
            acquiring: false,
            mic_waiters: Vec::new(),
            direct_playing: HashSet::new(),
            safety_net: false,
            last_error: None,
            fallbacks: 0,
            commands: weak,
            inbox: inbox.clone(),
            status: status_tx,
            config,
        };

        tracing::info!(
            room = %room_id,
            user = %self_id,
            strategy = ?session.config.strategy,
            "Voice session started"
        );
        tokio::spawn(session.run(rx));

        VoiceHandle {
            commands: tx,
            inbox,
            status: status_rx,
            self_id,
            room_id,
        }
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<SessionCommand>) {
        self.refresh_status();
        while let Some(command) = commands.recv().await {
            if !self.handle(command).await {
                return;
            }
            self.refresh_status();
        }
        self.teardown();
    }

    async fn handle(&mut self, command: SessionCommand) -> bool {
        match command {
            SessionCommand::SetMic {
                enabled: true,
                reply,
            } => self.enable_mic(reply).await,
            SessionCommand::SetMic {
                enabled: false,
                reply,
            } => {
                self.disable_mic();
                let _ = reply.send(Ok(()));
            }
            SessionCommand::SetSpeaker { enabled } => self.set_speaker(enabled),
            SessionCommand::Members(members) => self.members_changed(members).await,
            SessionCommand::Signal(signal) => {
                if matches!(signal, InboundSignal::AudioChunk { .. }) {
                    self.inbox.taken();
                }
                self.on_signal(signal).await
            }
            SessionCommand::Link(event) => self.on_link_event(event).await,
            SessionCommand::HysteresisExpired {
                peer,
                epoch,
                generation,
            } => self.on_hysteresis_expired(peer, epoch, generation),
            SessionCommand::CaptureAcquired(result) => self.on_capture_acquired(result).await,
            SessionCommand::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            SessionCommand::Leave(reply) => {
                self.teardown();
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    // === Microphone ===

    async fn enable_mic(&mut self, reply: oneshot::Sender<VoiceResult<()>>) {
        self.mic_enabled = true;
        self.last_error = None;

        if self.source.is_active() {
            self.source.unmute();
            self.after_mic_ready().await;
            let _ = reply.send(Ok(()));
            return;
        }

        self.mic_waiters.push(reply);
        if self.acquiring {
            return;
        }
        self.acquiring = true;
        self.refresh_status();

        // the permission prompt must not stall signaling for other peers
        let device = self.source.device();
        let commands = self.commands.clone();
        tokio::spawn(async move {
            let result = device.acquire().await;
            let Some(tx) = commands.upgrade() else {
                if let Ok(track) = &result {
                    device.release(track);
                    track.stop();
                }
                return;
            };
            if let Err(mpsc::error::SendError(SessionCommand::CaptureAcquired(Ok(track)))) =
                tx.send(SessionCommand::CaptureAcquired(result))
            {
                device.release(&track);
                track.stop();
            }
        });
    }

    async fn on_capture_acquired(&mut self, result: VoiceResult<LocalTrack>) {
        self.acquiring = false;
        let waiters = std::mem::take(&mut self.mic_waiters);

        match result {
            Ok(track) => {
                self.source.install(track);
                if self.mic_enabled {
                    self.after_mic_ready().await;
                } else {
                    // disabled while the prompt was open: keep the device warm but silent
                    self.source.mute();
                }
                for waiter in waiters {
                    let _ = waiter.send(Ok(()));
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "Microphone could not be acquired");
                self.mic_enabled = false;
                self.last_error = Some(e.to_string());
                let message = match &e {
                    VoiceError::Device { message } => message.clone(),
                    other => other.to_string(),
                };
                let mut first = Some(e);
                for waiter in waiters {
                    let err = first
                        .take()
                        .unwrap_or_else(|| VoiceError::device(message.clone()));
                    let _ = waiter.send(Err(err));
                }
            }
        }
    }

    async fn after_mic_ready(&mut self) {
        if let Err(e) = self.signaling.announce_mic().await {
            tracing::warn!(error = %e, "Mic announcement not sent");
        }

        if self.room_transport == RoomTransport::Relay {
            self.start_relay();
            return;
        }

        let peers: Vec<UserId> = others(&self.members, self.signaling.self_id())
            .map(|m| m.id)
            .collect();
        if peers.is_empty() {
            tracing::info!("No one else in the room, relaying until a direct link comes up");
            if self.start_relay() {
                self.safety_net = true;
            }
            return;
        }

        self.connect_all(peers).await;
    }

    fn disable_mic(&mut self) {
        self.mic_enabled = false;
        self.last_error = None;
        self.source.mute();
        self.stop_relay();
        let pruned = self.peers.prune_closed();
        if !pruned.is_empty() {
            tracing::debug!(count = pruned.len(), "Dropped records of closed links");
        }
    }

    // === Relay send ===

    fn start_relay(&mut self) -> bool {
        let Some(track) = self.source.sending_track() else {
            let err = VoiceError::relay_start("microphone is not enabled");
            tracing::warn!(error = %err, "Relay not started");
            self.last_error = Some(err.to_string());
            return false;
        };
        if self
            .relay
            .as_ref()
            .is_some_and(|relay| relay.track_id() == track.id())
        {
            return true;
        }

        match RelaySender::start(track, self.signaling.clone(), &self.config) {
            Ok(sender) => {
                self.relay = Some(sender);
                true
            }
            Err(e) => {
                tracing::warn!(error = %e, "Relay not started");
                self.last_error = Some(e.to_string());
                false
            }
        }
    }

    fn stop_relay(&mut self) {
        if let Some(relay) = self.relay.take() {
            relay.stop();
        }
        self.safety_net = false;
    }

    // === Direct links ===

    /// Offer to every peer first; the room-wide decision waits until each
    /// of them has had its attempt.
    async fn connect_all(&mut self, peers: Vec<UserId>) {
        let mut abandoned = 0usize;
        for peer in peers {
            if !self.connect(peer).await {
                abandoned += 1;
            }
        }
        if abandoned > 0 {
            self.reevaluate_fallback();
        }
    }

    /// Returns `false` when the direct attempt for `peer` was abandoned.
    async fn connect(&mut self, peer: UserId) -> bool {
        match self
            .peers
            .initiate_connection(peer, self.source.track())
            .await
        {
            Initiation::Sent | Initiation::Renegotiated | Initiation::AlreadyLinked => true,
            Initiation::Failed(e) => {
                tracing::warn!(peer = %peer, error = %e, "Direct attempt abandoned");
                self.close_failed_peer(peer);
                false
            }
        }
    }

    async fn on_link_event(&mut self, event: LinkEvent) {
        let LinkEvent { peer, epoch, event } = event;
        if !self.peers.accepts_epoch(&peer, epoch) {
            tracing::trace!(peer = %peer, epoch, "Ignoring event from a closed transport");
            return;
        }

        match event {
            TransportEvent::LocalCandidate(candidate) => {
                self.peers.send_local_candidate(peer, candidate).await;
            }
            TransportEvent::Track(track) => {
                tracing::info!(peer = %peer, track = %track.id, "Direct audio received");
                self.peers.set_remote_track(&peer, track.clone());
                if self.speaker_enabled {
                    self.start_direct_playback(&track);
                }
            }
            TransportEvent::StateChanged(state) => self.on_state_changed(peer, epoch, state),
        }
    }

    fn on_state_changed(&mut self, peer: UserId, epoch: u64, state: ConnectionState) {
        let Some(link) = self.peers.get_mut(&peer) else {
            return;
        };
        let transition = self.health.observe(link, state, Instant::now());
        tracing::debug!(peer = %peer, ?state, ?transition, "Link state reported");

        match transition {
            HealthTransition::Unchanged => {}
            HealthTransition::Connected | HealthTransition::Recovered => {
                link.transport_mode = TransportMode::Direct;
                tracing::info!(
                    peer = %peer,
                    recovered = transition == HealthTransition::Recovered,
                    "Direct link healthy"
                );
                self.health.rearm();
                if self.safety_net {
                    tracing::info!("Direct link up, stopping safety-net relay");
                    self.stop_relay();
                }
            }
            HealthTransition::Suspect { generation, .. } => {
                let window = self.health.window();
                let commands = self.commands.clone();
                let timer = tokio::spawn(async move {
                    tokio::time::sleep(window).await;
                    if let Some(tx) = commands.upgrade() {
                        let _ = tx.send(SessionCommand::HysteresisExpired {
                            peer,
                            epoch,
                            generation,
                        });
                    }
                });
                link.set_hysteresis(timer.abort_handle());
                tracing::info!(
                    peer = %peer,
                    ?window,
                    "Direct link disconnected, waiting for recovery"
                );
            }
            HealthTransition::Failed => self.on_peer_failed(peer),
        }
    }

    fn on_hysteresis_expired(&mut self, peer: UserId, epoch: u64, generation: u64) {
        if !self.peers.accepts_epoch(&peer, epoch) {
            return;
        }
        let expired = match self.peers.get_mut(&peer) {
            Some(link) => self.health.expire(link, generation),
            None => false,
        };
        if expired {
            self.on_peer_failed(peer);
        }
    }

    fn on_peer_failed(&mut self, peer: UserId) {
        self.close_failed_peer(peer);
        self.reevaluate_fallback();
    }

    /// Close one failed link without touching any other.
    fn close_failed_peer(&mut self, peer: UserId) {
        self.peers.close_transport(&peer);
        self.stop_direct_playback(peer);
        tracing::warn!(peer = %peer, "Direct link failed");

        if self.room_transport == RoomTransport::Relay {
            if let Some(link) = self.peers.get_mut(&peer) {
                link.transport_mode = TransportMode::Relay;
            }
        }
    }

    fn reevaluate_fallback(&mut self) {
        if self.config.strategy == VoiceStrategy::ServerOnly {
            return;
        }
        if self.health.evaluate_fallback(self.peers.links()) {
            self.engage_relay();
        } else if self.room_transport == RoomTransport::Mesh {
            tracing::info!("Other direct links still usable, staying on mesh");
        }
    }

    /// Every direct link is down: move the room onto the server relay.
    fn engage_relay(&mut self) {
        self.fallbacks += 1;
        self.room_transport = RoomTransport::Relay;
        tracing::warn!(
            links = self.peers.len(),
            "All direct links failed, falling back to server relay"
        );

        let dead: Vec<UserId> = self
            .peers
            .links()
            .filter(|l| !HealthMonitor::is_alive(l))
            .map(PeerLink::peer_id)
            .collect();
        for peer in dead {
            self.peers.close_transport(&peer);
            self.stop_direct_playback(peer);
            if let Some(link) = self.peers.get_mut(&peer) {
                link.transport_mode = TransportMode::Relay;
            }
        }

        self.safety_net = false;
        if self.mic_enabled && !self.acquiring {
            self.start_relay();
        }
    }

    // === Inbound signaling ===

    async fn on_signal(&mut self, signal: InboundSignal) {
        if !self.signaling.accept(&signal) {
            return;
        }
        if let Err(e) = signal.validate() {
            tracing::warn!(peer = %signal.sender(), error = %e, "Dropping malformed voice message");
            return;
        }

        match signal {
            InboundSignal::Offer { user_id, offer } => {
                match self
                    .peers
                    .handle_offer(user_id, offer, self.source.track())
                    .await
                {
                    Ok(OfferOutcome::Answered) => {
                        tracing::debug!(peer = %user_id, "Answered offer");
                    }
                    Ok(OfferOutcome::Ignored) => {}
                    Err(e @ VoiceError::Transport { .. }) => {
                        tracing::warn!(peer = %user_id, error = %e, "Could not answer offer");
                        self.on_peer_failed(user_id);
                    }
                    Err(e) => {
                        tracing::warn!(peer = %user_id, error = %e, "Dropping offer");
                    }
                }
            }
            InboundSignal::Answer { user_id, answer } => {
                if let Err(e) = self.peers.handle_answer(user_id, answer).await {
                    tracing::warn!(peer = %user_id, error = %e, "Dropping answer");
                }
            }
            InboundSignal::Ice { user_id, candidate } => {
                if let Err(e) = self.peers.handle_ice_candidate(user_id, candidate).await {
                    tracing::warn!(peer = %user_id, error = %e, "Dropping candidate");
                }
            }
            InboundSignal::MicEnabled { user_id } => {
                tracing::debug!(peer = %user_id, "Peer enabled microphone");
            }
            InboundSignal::AudioChunk {
                user_id,
                audio_data,
                sample_rate,
            } => {
                let rate = sample_rate.unwrap_or(DEFAULT_CHUNK_SAMPLE_RATE);
                self.on_relay_chunk(user_id, &audio_data, rate);
            }
        }
    }

    /// Relay audio from a peer we also hear directly would play twice.
    fn relay_playback_allowed(&self, peer: &UserId) -> bool {
        if self.config.strategy == VoiceStrategy::ServerOnly {
            return true;
        }
        self.peers
            .get(peer)
            .is_none_or(|link| link.transport_mode() != TransportMode::Direct)
    }

    fn on_relay_chunk(&mut self, peer: UserId, audio_data: &[u8], sample_rate: u32) {
        if !self.relay_playback_allowed(&peer) {
            tracing::trace!(peer = %peer, "Relay chunk skipped, peer is heard directly");
            return;
        }
        if let Err(e) = self.scheduler.handle_chunk(peer, audio_data, sample_rate) {
            tracing::warn!(peer = %peer, error = %e, "Dropping relay frame");
        }
    }

    // === Membership and output ===

    async fn members_changed(&mut self, members: Vec<Member>) {
        let self_id = self.signaling.self_id();
        let present: HashSet<UserId> = others(&members, self_id).map(|m| m.id).collect();
        self.members = members;

        let mut departed = false;
        for peer in self.peers.peer_ids() {
            if !present.contains(&peer) {
                self.peers.remove(&peer);
                self.stop_direct_playback(peer);
                tracing::info!(peer = %peer, "Peer left the room");
                departed = true;
            }
        }
        let stale_queues: Vec<UserId> = self
            .scheduler
            .queues()
            .map(|(peer, _)| *peer)
            .filter(|peer| !present.contains(peer))
            .collect();
        for peer in stale_queues {
            self.scheduler.remove_peer(&peer);
        }

        if departed
            && self.room_transport == RoomTransport::Mesh
            && self.health.evaluate_fallback(self.peers.links())
        {
            self.engage_relay();
        }

        if self.room_transport != RoomTransport::Mesh
            || !self.mic_enabled
            || self.source.sending_track().is_none()
        {
            return;
        }
        let mut joined: Vec<UserId> = present
            .into_iter()
            .filter(|peer| !self.peers.contains(peer))
            .collect();
        joined.sort();
        self.connect_all(joined).await;
    }

    fn set_speaker(&mut self, enabled: bool) {
        self.speaker_enabled = enabled;
        self.scheduler.set_speaker_enabled(enabled);

        let tracks: Vec<RemoteTrack> = self
            .peers
            .links()
            .filter_map(|l| l.remote_track().cloned())
            .collect();
        for track in tracks {
            match (enabled, self.direct_playing.contains(&track.peer)) {
                (true, true) => self.playback.set_muted(track.peer, false),
                (true, false) => self.start_direct_playback(&track),
                (false, true) => self.playback.set_muted(track.peer, true),
                (false, false) => {}
            }
        }
        tracing::info!(enabled, "Speaker toggled");
    }

    fn start_direct_playback(&mut self, track: &RemoteTrack) {
        self.playback.play(track);
        self.direct_playing.insert(track.peer);
    }

    fn stop_direct_playback(&mut self, peer: UserId) {
        if self.direct_playing.remove(&peer) {
            self.playback.stop(peer);
        }
    }

    // === Status ===

    fn current_status(&self) -> VoiceStatus {
        if let Some(message) = &self.last_error {
            return VoiceStatus::Error(message.clone());
        }
        if self.acquiring {
            return VoiceStatus::Connecting;
        }
        if self.peers.links().any(|l| l.health() == HealthState::Healthy) {
            return VoiceStatus::ConnectedDirect;
        }
        if self.relay.is_some() || self.room_transport == RoomTransport::Relay {
            return VoiceStatus::ConnectedRelay;
        }
        if self.mic_enabled || self.peers.links().any(PeerLink::is_transport_open) {
            return VoiceStatus::Connecting;
        }
        VoiceStatus::Idle
    }

    fn refresh_status(&self) {
        let next = self.current_status();
        self.status.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            tracing::info!(from = current.label(), to = next.label(), "Voice status changed");
            *current = next;
            true
        });
    }

    fn snapshot(&self) -> SessionSnapshot {
        let now = Instant::now();
        let clock_now = self.scheduler.clock().now();

        let mut links: Vec<LinkSnapshot> = self
            .peers
            .links()
            .map(|l| LinkSnapshot {
                peer_id: l.peer_id(),
                transport_mode: l.transport_mode(),
                connection_state: l.connection_state(),
                health: l.health(),
                transport_open: l.is_transport_open(),
                sending_audio: l.has_local_track(),
                receiving_audio: l.remote_track().is_some(),
                suspect_for_ms: l
                    .suspect_since()
                    .map(|since| whole_millis(now.duration_since(since))),
            })
            .collect();
        links.sort_by_key(|l| l.peer_id);

        let mut queues: Vec<QueueSnapshot> = self
            .scheduler
            .queues()
            .map(|(peer, queue)| QueueSnapshot {
                peer_id: *peer,
                queued_ms: queue
                    .next_play_time
                    .map(|next| whole_millis(next.saturating_sub(clock_now)))
                    .unwrap_or(0),
                played: queue.played,
                dropped: queue.dropped,
            })
            .collect();
        queues.sort_by_key(|q| q.peer_id);

        SessionSnapshot {
            self_id: self.signaling.self_id(),
            room_id: self.signaling.room_id(),
            status: self.current_status(),
            strategy: self.config.strategy,
            room_transport: self.room_transport,
            mic_enabled: self.mic_enabled,
            mic_acquired: self.source.is_active(),
            speaker_enabled: self.speaker_enabled,
            relay_sending: self.relay.is_some(),
            relay_stats: self.relay.as_ref().map(RelaySender::stats),
            all_direct_failed: HealthMonitor::all_direct_failed(self.peers.links()),
            fallbacks: self.fallbacks,
            links,
            queues,
            relay_chunks_refused: self.inbox.refused(),
        }
    }

    fn teardown(&mut self) {
        self.stop_relay();
        for peer in self.direct_playing.drain() {
            self.playback.stop(peer);
        }
        self.peers.clear();
        self.scheduler.clear();
        self.source.release();
        self.mic_enabled = false;
        self.acquiring = false;
        self.last_error = None;
        for waiter in self.mic_waiters.drain(..) {
            let _ = waiter.send(Err(VoiceError::ChannelClosed));
        }
        self.status.send_replace(VoiceStatus::Idle);
        tracing::info!(room = %self.signaling.room_id(), "Voice session closed");
    }
}
