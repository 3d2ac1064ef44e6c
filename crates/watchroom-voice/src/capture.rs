//! Local microphone capture.
//!
//! A [`LocalTrack`] is the live handle to captured audio: the device pushes
//! float blocks into it, direct transports attach it, and the relay encoder
//! subscribes to it. [`LocalAudioSource`] is the single per-session owner of
//! the track and the only thing that changes its muted/acquired state.

use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast;
use uuid::Uuid;
use watchroom_common::VoiceResult;

/// A block of mono float samples in -1.0..=1.0.
pub type AudioBlock = Arc<[f32]>;

const TRACK_BUFFER_BLOCKS: usize = 64;

/// Live captured audio.
#[derive(Clone)]
pub struct LocalTrack {
    inner: Arc<TrackInner>,
}

struct TrackInner {
    id: Uuid,
    sample_rate: u32,
    blocks: broadcast::Sender<AudioBlock>,
    enabled: AtomicBool,
    live: AtomicBool,
}

impl LocalTrack {
    pub fn new(sample_rate: u32) -> Self {
        let (blocks, _) = broadcast::channel(TRACK_BUFFER_BLOCKS);
        Self {
            inner: Arc::new(TrackInner {
                id: Uuid::new_v4(),
                sample_rate,
                blocks,
                enabled: AtomicBool::new(true),
                live: AtomicBool::new(true),
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn sample_rate(&self) -> u32 {
        self.inner.sample_rate
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::Acquire)
    }

    /// False once the device has been released.
    pub fn is_live(&self) -> bool {
        self.inner.live.load(Ordering::Acquire)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AudioBlock> {
        self.inner.blocks.subscribe()
    }

    /// Device side: publish a captured block. Muted or ended tracks swallow it.
    /// Returns the number of subscribers that received the block.
    pub fn push(&self, block: AudioBlock) -> usize {
        if !self.is_enabled() || !self.is_live() {
            return 0;
        }
        self.inner.blocks.send(block).unwrap_or(0)
    }

    fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::Release);
    }

    /// Ends the track for good.
    pub fn stop(&self) {
        self.inner.live.store(false, Ordering::Release);
    }
}

impl std::fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.id())
            .field("sample_rate", &self.sample_rate())
            .field("enabled", &self.is_enabled())
            .field("live", &self.is_live())
            .finish()
    }
}

/// Platform microphone.
#[async_trait]
pub trait AudioCaptureDevice: Send + Sync {
    /// Open the microphone. May wait on hardware or a permission prompt.
    async fn acquire(&self) -> VoiceResult<LocalTrack>;

    /// Close the microphone and free the hardware.
    fn release(&self, track: &LocalTrack);

    /// Hardware hint that the track was muted; the device stays open.
    fn mute(&self, _track: &LocalTrack) {}

    fn unmute(&self, _track: &LocalTrack) {}
}

/// The session's single local audio source.
pub struct LocalAudioSource {
    device: Arc<dyn AudioCaptureDevice>,
    track: Option<LocalTrack>,
}

impl LocalAudioSource {
    pub fn new(device: Arc<dyn AudioCaptureDevice>) -> Self {
        Self {
            device,
            track: None,
        }
    }

    pub fn device(&self) -> Arc<dyn AudioCaptureDevice> {
        self.device.clone()
    }

    pub fn is_active(&self) -> bool {
        self.track.is_some()
    }

    pub fn is_muted(&self) -> bool {
        self.track.as_ref().is_some_and(|t| !t.is_enabled())
    }

    pub fn track(&self) -> Option<&LocalTrack> {
        self.track.as_ref()
    }

    /// An enabled, live track: the precondition for relay sending.
    pub fn sending_track(&self) -> Option<&LocalTrack> {
        self.track
            .as_ref()
            .filter(|t| t.is_enabled() && t.is_live())
    }

    /// Acquire the device in place. Returns the existing track if already active.
    pub async fn acquire(&mut self) -> VoiceResult<LocalTrack> {
        if let Some(track) = &self.track {
            return Ok(track.clone());
        }
        let track = self.device.acquire().await?;
        Ok(self.install(track))
    }

    /// Adopt a track acquired elsewhere. A second track is released at once so
    /// that at most one source exists.
    pub fn install(&mut self, track: LocalTrack) -> LocalTrack {
        if let Some(existing) = &self.track {
            if existing.id() != track.id() {
                tracing::warn!(track = %track.id(), "Duplicate capture track released");
                self.device.release(&track);
                track.stop();
            }
            return existing.clone();
        }
        tracing::info!(track = %track.id(), rate = track.sample_rate(), "Microphone acquired");
        self.track = Some(track.clone());
        track
    }

    pub fn mute(&mut self) {
        if let Some(track) = &self.track {
            track.set_enabled(false);
            self.device.mute(track);
            tracing::info!(track = %track.id(), "Microphone muted");
        }
    }

    pub fn unmute(&mut self) {
        if let Some(track) = &self.track {
            track.set_enabled(true);
            self.device.unmute(track);
            tracing::info!(track = %track.id(), "Microphone unmuted");
        }
    }

    /// Free the hardware. Only done on room leave or teardown.
    pub fn release(&mut self) {
        if let Some(track) = self.track.take() {
            self.device.release(&track);
            track.stop();
            tracing::info!(track = %track.id(), "Microphone released");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimCaptureDevice;

    #[test]
    fn muted_track_swallows_blocks() {
        let track = LocalTrack::new(48_000);
        let mut rx = track.subscribe();
        track.set_enabled(false);
        assert_eq!(track.push(Arc::from(vec![0.5_f32; 4])), 0);
        assert!(rx.try_recv().is_err());

        track.set_enabled(true);
        assert_eq!(track.push(Arc::from(vec![0.5_f32; 4])), 1);
        assert_eq!(rx.try_recv().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn mute_keeps_device_open() {
        let device = Arc::new(SimCaptureDevice::silent(48_000));
        let mut source = LocalAudioSource::new(device.clone());
        let track = source.acquire().await.unwrap();

        source.mute();
        assert!(source.is_active());
        assert!(source.is_muted());
        assert!(track.is_live());
        assert!(source.sending_track().is_none());
        assert_eq!(device.open_count(), 1);

        source.unmute();
        assert!(source.sending_track().is_some());
    }

    #[tokio::test]
    async fn acquire_is_idempotent_and_install_keeps_one_track() {
        let device = Arc::new(SimCaptureDevice::silent(48_000));
        let mut source = LocalAudioSource::new(device.clone());
        let first = source.acquire().await.unwrap();
        let again = source.acquire().await.unwrap();
        assert_eq!(first.id(), again.id());
        assert_eq!(device.acquire_calls(), 1);

        let stray = LocalTrack::new(48_000);
        let kept = source.install(stray.clone());
        assert_eq!(kept.id(), first.id());
        assert!(!stray.is_live());
    }

    #[tokio::test]
    async fn release_stops_track() {
        let device = Arc::new(SimCaptureDevice::silent(48_000));
        let mut source = LocalAudioSource::new(device.clone());
        let track = source.acquire().await.unwrap();
        source.release();
        assert!(!source.is_active());
        assert!(!track.is_live());
        assert_eq!(device.open_count(), 0);
    }
}
