//! In-process backends for tests and the `watchroom-sim` binary.
//!
//! Nothing here touches real hardware or the network: capture produces a
//! synthetic tone (or silence), transports follow a [`LinkScript`], and the
//! [`SimBus`] routes signaling between sessions the way the room server would.

use crate::capture::{AudioBlock, AudioCaptureDevice, LocalTrack};
use crate::playback::{AudioClock, DirectPlayback};
use crate::session::VoiceHandle;
use crate::signaling::{
    IceCandidate, OutboundSignal, SdpType, SessionDescription, SignalingChannel,
};
use crate::transport::{
    ConnectionState, DirectTransport, RemoteTrack, TransportEvent, TransportEvents,
    TransportFactory,
};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use uuid::Uuid;
use watchroom_common::config::IceServerConfig;
use watchroom_common::{UserId, VoiceError, VoiceResult};

/// 20 ms capture blocks.
const BLOCK_MILLIS: u64 = 20;

// ---------------------------------------------------------------------------
// Capture
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
enum Waveform {
    Silence,
    Tone { frequency: f32, amplitude: f32 },
}

/// A synthetic microphone.
pub struct SimCaptureDevice {
    sample_rate: u32,
    waveform: Waveform,
    denied: bool,
    acquire_delay: Duration,
    acquire_calls: AtomicUsize,
    open: Mutex<HashMap<Uuid, AbortHandle>>,
}

impl SimCaptureDevice {
    fn build(sample_rate: u32, waveform: Waveform) -> Self {
        Self {
            sample_rate,
            waveform,
            denied: false,
            acquire_delay: Duration::ZERO,
            acquire_calls: AtomicUsize::new(0),
            open: Mutex::new(HashMap::new()),
        }
    }

    pub fn silent(sample_rate: u32) -> Self {
        Self::build(sample_rate, Waveform::Silence)
    }

    pub fn tone(sample_rate: u32, frequency: f32, amplitude: f32) -> Self {
        Self::build(
            sample_rate,
            Waveform::Tone {
                frequency,
                amplitude,
            },
        )
    }

    /// A device whose permission prompt is always refused.
    pub fn denied() -> Self {
        Self {
            denied: true,
            ..Self::silent(48_000)
        }
    }

    /// Simulate a slow permission prompt.
    pub fn with_acquire_delay(mut self, delay: Duration) -> Self {
        self.acquire_delay = delay;
        self
    }

    pub fn acquire_calls(&self) -> usize {
        self.acquire_calls.load(Ordering::SeqCst)
    }

    /// Tracks acquired and not yet released.
    pub fn open_count(&self) -> usize {
        self.open.lock().map(|open| open.len()).unwrap_or(0)
    }

    fn spawn_generator(&self, track: LocalTrack) -> AbortHandle {
        let waveform = self.waveform;
        let rate = self.sample_rate;
        let block_len = (rate as u64 * BLOCK_MILLIS / 1_000) as usize;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(BLOCK_MILLIS));
            let mut phase = 0.0_f32;
            loop {
                ticker.tick().await;
                if !track.is_live() {
                    break;
                }
                let block: Vec<f32> = match waveform {
                    Waveform::Silence => vec![0.0; block_len],
                    Waveform::Tone {
                        frequency,
                        amplitude,
                    } => {
                        let step = std::f32::consts::TAU * frequency / rate as f32;
                        (0..block_len)
                            .map(|_| {
                                phase = (phase + step) % std::f32::consts::TAU;
                                phase.sin() * amplitude
                            })
                            .collect()
                    }
                };
                track.push(AudioBlock::from(block));
            }
        })
        .abort_handle()
    }
}

#[async_trait]
impl AudioCaptureDevice for SimCaptureDevice {
    async fn acquire(&self) -> VoiceResult<LocalTrack> {
        self.acquire_calls.fetch_add(1, Ordering::SeqCst);
        if !self.acquire_delay.is_zero() {
            tokio::time::sleep(self.acquire_delay).await;
        }
        if self.denied {
            return Err(VoiceError::device("permission denied"));
        }

        let track = LocalTrack::new(self.sample_rate);
        let generator = self.spawn_generator(track.clone());
        if let Ok(mut open) = self.open.lock() {
            open.insert(track.id(), generator);
        }
        Ok(track)
    }

    fn release(&self, track: &LocalTrack) {
        let generator = self.open.lock().ok().and_then(|mut open| open.remove(&track.id()));
        if let Some(generator) = generator {
            generator.abort();
        }
    }
}

// ---------------------------------------------------------------------------
// Direct transports
// ---------------------------------------------------------------------------

/// How a simulated direct link behaves once both descriptions are known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkScript {
    /// Reports nothing; drive it with [`SimTransport::report`].
    Silent,
    /// checking, then connected after `after`.
    Connect { after: Duration },
    /// checking, then failed after `after`.
    Fail { after: Duration },
    /// Connects, then drops to disconnected after `drop_after` and either
    /// recovers after `outage` or stays down.
    Flap {
        connect_after: Duration,
        drop_after: Duration,
        outage: Option<Duration>,
    },
}

impl LinkScript {
    pub fn connect() -> Self {
        Self::Connect {
            after: Duration::from_millis(150),
        }
    }

    pub fn fail() -> Self {
        Self::Fail {
            after: Duration::from_millis(200),
        }
    }
}

/// A scripted transport.
pub struct SimTransport {
    peer: UserId,
    events: TransportEvents,
    script: LinkScript,
    closed: AtomicBool,
    track_announced: AtomicBool,
    candidates: Mutex<Vec<IceCandidate>>,
    local_tracks: Mutex<Vec<Uuid>>,
    runner: Mutex<Option<AbortHandle>>,
    offers: AtomicUsize,
}

impl SimTransport {
    fn new(peer: UserId, events: TransportEvents, script: LinkScript) -> Self {
        Self {
            peer,
            events,
            script,
            closed: AtomicBool::new(false),
            track_announced: AtomicBool::new(false),
            candidates: Mutex::new(Vec::new()),
            local_tracks: Mutex::new(Vec::new()),
            runner: Mutex::new(None),
            offers: AtomicUsize::new(0),
        }
    }

    pub fn peer(&self) -> UserId {
        self.peer
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Remote candidates applied so far.
    pub fn candidates(&self) -> Vec<IceCandidate> {
        self.candidates.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn local_tracks(&self) -> Vec<Uuid> {
        self.local_tracks.lock().map(|t| t.clone()).unwrap_or_default()
    }

    pub fn offers_created(&self) -> usize {
        self.offers.load(Ordering::SeqCst)
    }

    /// Push a raw connectivity state as the network would.
    pub fn report(&self, state: ConnectionState) {
        if self.is_closed() {
            return;
        }
        self.events.state(state);
        if state.is_connected() && !self.track_announced.swap(true, Ordering::SeqCst) {
            self.events.emit(TransportEvent::Track(RemoteTrack {
                id: format!("audio-{}", self.peer),
                peer: self.peer,
            }));
        }
    }

    fn describe(&self, kind: SdpType) -> SessionDescription {
        let direction = if self.local_tracks().is_empty() {
            "recvonly"
        } else {
            "sendrecv"
        };
        let sdp = format!(
            "v=0\r\no=- {} 2 IN IP4 127.0.0.1\r\ns=watchroom\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\na={direction}\r\n",
            self.peer.as_u128() as u64
        );
        SessionDescription { kind, sdp }
    }

    fn gather(&self) {
        self.events.emit(TransportEvent::LocalCandidate(IceCandidate {
            candidate: format!("candidate:1 1 udp 2122260223 10.0.0.1 {} typ host", 40_000 + (self.peer.as_u128() % 1_000) as u16),
            sdp_mid: Some("0".into()),
            sdp_m_line_index: Some(0),
        }));
    }

    fn start_script(self: &Arc<Self>) {
        let Ok(mut runner) = self.runner.lock() else {
            return;
        };
        if runner.is_some() || self.script == LinkScript::Silent {
            return;
        }
        let transport = self.clone();
        let script = self.script;
        let handle = tokio::spawn(async move {
            transport.report(ConnectionState::Checking);
            match script {
                LinkScript::Silent => {}
                LinkScript::Connect { after } => {
                    tokio::time::sleep(after).await;
                    transport.report(ConnectionState::Connected);
                }
                LinkScript::Fail { after } => {
                    tokio::time::sleep(after).await;
                    transport.report(ConnectionState::Failed);
                }
                LinkScript::Flap {
                    connect_after,
                    drop_after,
                    outage,
                } => {
                    tokio::time::sleep(connect_after).await;
                    transport.report(ConnectionState::Connected);
                    tokio::time::sleep(drop_after).await;
                    transport.report(ConnectionState::Disconnected);
                    if let Some(outage) = outage {
                        tokio::time::sleep(outage).await;
                        transport.report(ConnectionState::Connected);
                    }
                }
            }
        });
        *runner = Some(handle.abort_handle());
    }
}

/// `Arc` wrapper so the script runner can hold the transport.
struct SharedTransport(Arc<SimTransport>);

#[async_trait]
impl DirectTransport for SharedTransport {
    async fn create_offer(&self) -> VoiceResult<SessionDescription> {
        if self.0.is_closed() {
            return Err(VoiceError::transport(self.0.peer, "transport closed"));
        }
        self.0.offers.fetch_add(1, Ordering::SeqCst);
        self.0.gather();
        Ok(self.0.describe(SdpType::Offer))
    }

    async fn create_answer(&self) -> VoiceResult<SessionDescription> {
        if self.0.is_closed() {
            return Err(VoiceError::transport(self.0.peer, "transport closed"));
        }
        self.0.gather();
        Ok(self.0.describe(SdpType::Answer))
    }

    async fn apply_remote_description(&self, desc: SessionDescription) -> VoiceResult<()> {
        if !desc.sdp.starts_with("v=0") {
            return Err(VoiceError::protocol("session description is not SDP"));
        }
        self.0.start_script();
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> VoiceResult<()> {
        if !candidate.candidate.starts_with("candidate:") {
            return Err(VoiceError::protocol("malformed candidate"));
        }
        if let Ok(mut candidates) = self.0.candidates.lock() {
            candidates.push(candidate);
        }
        Ok(())
    }

    fn attach_local_track(&self, track: &LocalTrack) {
        if let Ok(mut tracks) = self.0.local_tracks.lock() {
            tracks.push(track.id());
        }
    }

    fn close(&self) {
        self.0.closed.store(true, Ordering::SeqCst);
        if let Some(runner) = self.0.runner.lock().ok().and_then(|mut r| r.take()) {
            runner.abort();
        }
    }
}

/// Creates [`SimTransport`]s, scripted per peer.
pub struct SimTransportFactory {
    default_script: LinkScript,
    scripts: Mutex<HashMap<UserId, LinkScript>>,
    refused: Mutex<HashSet<UserId>>,
    transports: Mutex<HashMap<UserId, Arc<SimTransport>>>,
    created: AtomicUsize,
}

impl SimTransportFactory {
    pub fn new(default_script: LinkScript) -> Self {
        Self {
            default_script,
            scripts: Mutex::new(HashMap::new()),
            refused: Mutex::new(HashSet::new()),
            transports: Mutex::new(HashMap::new()),
            created: AtomicUsize::new(0),
        }
    }

    /// Script used for transports to `peer` created from now on.
    pub fn script(&self, peer: UserId, script: LinkScript) {
        if let Ok(mut scripts) = self.scripts.lock() {
            scripts.insert(peer, script);
        }
    }

    /// Behave as if direct media were unsupported for `peer`.
    pub fn refuse(&self, peer: UserId) {
        if let Ok(mut refused) = self.refused.lock() {
            refused.insert(peer);
        }
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    /// The most recent transport created for `peer`.
    pub fn transport(&self, peer: UserId) -> Option<Arc<SimTransport>> {
        self.transports.lock().ok()?.get(&peer).cloned()
    }
}

impl TransportFactory for SimTransportFactory {
    fn create(
        &self,
        peer: UserId,
        ice_servers: &[IceServerConfig],
        events: TransportEvents,
    ) -> VoiceResult<Arc<dyn DirectTransport>> {
        let refused = self.refused.lock().is_ok_and(|r| r.contains(&peer));
        if refused {
            return Err(VoiceError::transport(peer, "direct media unsupported"));
        }

        let script = self
            .scripts
            .lock()
            .ok()
            .and_then(|s| s.get(&peer).copied())
            .unwrap_or(self.default_script);
        tracing::trace!(peer = %peer, servers = ice_servers.len(), ?script, "Sim transport created");

        let transport = Arc::new(SimTransport::new(peer, events, script));
        if let Ok(mut transports) = self.transports.lock() {
            transports.insert(peer, transport.clone());
        }
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(SharedTransport(transport)))
    }
}

// ---------------------------------------------------------------------------
// Signaling
// ---------------------------------------------------------------------------

/// Records every outbound signal instead of sending it.
#[derive(Default)]
pub struct RecordingSignaling {
    sent: Mutex<Vec<OutboundSignal>>,
    disconnected: AtomicBool,
    failing: AtomicBool,
}

impl RecordingSignaling {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signals(&self) -> Vec<OutboundSignal> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn offers_to(&self, peer: UserId) -> usize {
        self.signals()
            .iter()
            .filter(|s| {
                matches!(s, OutboundSignal::Offer { target_user_id, .. } if *target_user_id == peer)
            })
            .count()
    }

    pub fn audio_chunks(&self) -> usize {
        self.signals()
            .iter()
            .filter(|s| matches!(s, OutboundSignal::AudioChunk { .. }))
            .count()
    }

    pub fn set_connected(&self, connected: bool) {
        self.disconnected.store(!connected, Ordering::SeqCst);
    }

    /// Make every emit fail.
    pub fn fail_sends(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl SignalingChannel for RecordingSignaling {
    async fn emit(&self, signal: OutboundSignal) -> VoiceResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(VoiceError::ChannelClosed);
        }
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(signal);
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        !self.disconnected.load(Ordering::SeqCst)
    }
}

/// An in-memory room server: routes point-to-point signals to their target
/// and broadcasts the rest to every member, sender included.
#[derive(Clone, Default)]
pub struct SimBus {
    inner: Arc<BusInner>,
}

#[derive(Default)]
struct BusInner {
    members: Mutex<HashMap<UserId, VoiceHandle>>,
    severed: Mutex<HashSet<(UserId, UserId)>>,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl SimBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// The signaling channel a member sends through.
    pub fn channel(&self, user: UserId) -> Arc<dyn SignalingChannel> {
        Arc::new(BusChannel {
            bus: self.clone(),
            user,
        })
    }

    pub fn attach(&self, handle: VoiceHandle) {
        if let Ok(mut members) = self.inner.members.lock() {
            members.insert(handle.self_id(), handle);
        }
    }

    pub fn detach(&self, user: &UserId) {
        if let Ok(mut members) = self.inner.members.lock() {
            members.remove(user);
        }
    }

    /// Drop point-to-point signaling between `a` and `b` in both directions.
    pub fn sever(&self, a: UserId, b: UserId) {
        if let Ok(mut severed) = self.inner.severed.lock() {
            severed.insert((a, b));
            severed.insert((b, a));
        }
    }

    pub fn delivered(&self) -> u64 {
        self.inner.delivered.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    fn route(&self, from: UserId, signal: OutboundSignal) {
        let targets: Vec<VoiceHandle> = {
            let Ok(members) = self.inner.members.lock() else {
                return;
            };
            match signal.target() {
                Some(target) => {
                    let severed = self
                        .inner
                        .severed
                        .lock()
                        .is_ok_and(|s| s.contains(&(from, target)));
                    if severed {
                        self.inner.dropped.fetch_add(1, Ordering::Relaxed);
                        return;
                    }
                    members.get(&target).cloned().into_iter().collect()
                }
                None => members.values().cloned().collect(),
            }
        };

        let inbound = signal.delivered_from(from);
        for handle in targets {
            match handle.deliver(inbound.clone()) {
                Ok(()) => {
                    self.inner.delivered.fetch_add(1, Ordering::Relaxed);
                }
                Err(_) => {
                    self.inner.dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }
}

struct BusChannel {
    bus: SimBus,
    user: UserId,
}

#[async_trait]
impl SignalingChannel for BusChannel {
    async fn emit(&self, signal: OutboundSignal) -> VoiceResult<()> {
        self.bus.route(self.user, signal);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

/// One scheduled relay buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledAudio {
    pub peer: UserId,
    pub at: Duration,
    pub samples: usize,
    pub sample_rate: u32,
}

/// A clock that only moves when told to.
#[derive(Default)]
pub struct ManualClock {
    now: Mutex<Duration>,
    scheduled: Mutex<Vec<ScheduledAudio>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, by: Duration) {
        if let Ok(mut now) = self.now.lock() {
            *now += by;
        }
    }

    pub fn set(&self, at: Duration) {
        if let Ok(mut now) = self.now.lock() {
            *now = at;
        }
    }

    pub fn scheduled(&self) -> Vec<ScheduledAudio> {
        self.scheduled.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

impl AudioClock for ManualClock {
    fn now(&self) -> Duration {
        self.now.lock().map(|n| *n).unwrap_or_default()
    }

    fn schedule_at(&self, peer: UserId, at: Duration, samples: AudioBlock, sample_rate: u32) {
        if let Ok(mut scheduled) = self.scheduled.lock() {
            scheduled.push(ScheduledAudio {
                peer,
                at,
                samples: samples.len(),
                sample_rate,
            });
        }
    }
}

/// Output clock backed by tokio time; counts what it would have played.
pub struct TokioAudioClock {
    origin: Instant,
    buffers: AtomicU64,
    samples: AtomicU64,
}

impl TokioAudioClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            buffers: AtomicU64::new(0),
            samples: AtomicU64::new(0),
        }
    }

    pub fn buffers(&self) -> u64 {
        self.buffers.load(Ordering::Relaxed)
    }

    pub fn samples(&self) -> u64 {
        self.samples.load(Ordering::Relaxed)
    }
}

impl Default for TokioAudioClock {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioClock for TokioAudioClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    fn schedule_at(&self, peer: UserId, at: Duration, samples: AudioBlock, sample_rate: u32) {
        self.buffers.fetch_add(1, Ordering::Relaxed);
        self.samples.fetch_add(samples.len() as u64, Ordering::Relaxed);
        tracing::trace!(peer = %peer, at = ?at, sample_rate, "Relay audio scheduled");
    }
}

/// Remembers which direct streams are playing and muted.
#[derive(Default)]
pub struct RecordingPlayback {
    playing: Mutex<HashMap<UserId, bool>>,
}

impl RecordingPlayback {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_playing(&self, peer: &UserId) -> bool {
        self.playing.lock().is_ok_and(|p| p.contains_key(peer))
    }

    pub fn is_muted(&self, peer: &UserId) -> bool {
        self.playing
            .lock()
            .is_ok_and(|p| p.get(peer).copied().unwrap_or(false))
    }

    pub fn playing(&self) -> usize {
        self.playing.lock().map(|p| p.len()).unwrap_or(0)
    }
}

impl DirectPlayback for RecordingPlayback {
    fn play(&self, track: &RemoteTrack) {
        if let Ok(mut playing) = self.playing.lock() {
            playing.insert(track.peer, false);
        }
    }

    fn set_muted(&self, peer: UserId, muted: bool) {
        if let Ok(mut playing) = self.playing.lock() {
            if let Some(state) = playing.get_mut(&peer) {
                *state = muted;
            }
        }
    }

    fn stop(&self, peer: UserId) {
        if let Ok(mut playing) = self.playing.lock() {
            playing.remove(&peer);
        }
    }
}
