//! Relay playback scheduling.
//!
//! Each sending peer gets its own timeline on the output clock. Frames are
//! laid back to back; when the backlog grows past the bound the frame is
//! dropped and the timeline snaps to "now".

use crate::capture::AudioBlock;
use crate::encoder::RelayFrame;
use crate::playback::AudioClock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use watchroom_common::{UserId, VoiceResult};

/// Per-peer playback timeline.
#[derive(Debug, Default, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackQueue {
    /// Clock position at which the next frame should start.
    pub next_play_time: Option<Duration>,
    pub played: u64,
    pub dropped: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleOutcome {
    Scheduled { at: Duration },
    DroppedStale { queue_delay: Duration },
    /// Speaker output is off; the frame was decoded and discarded.
    Muted,
}

pub struct RelayScheduler {
    clock: Arc<dyn AudioClock>,
    max_queue_delay: Duration,
    queues: HashMap<UserId, PlaybackQueue>,
    speaker_enabled: bool,
}

impl RelayScheduler {
    pub fn new(clock: Arc<dyn AudioClock>, max_queue_delay: Duration) -> Self {
        Self {
            clock,
            max_queue_delay,
            queues: HashMap::new(),
            speaker_enabled: true,
        }
    }

    pub fn clock(&self) -> Arc<dyn AudioClock> {
        self.clock.clone()
    }

    /// Decode and schedule one relay chunk from `peer`.
    ///
    /// A malformed chunk is rejected without touching the peer's timeline.
    pub fn handle_chunk(
        &mut self,
        peer: UserId,
        audio_data: &[u8],
        sample_rate: u32,
    ) -> VoiceResult<ScheduleOutcome> {
        let frame = RelayFrame::from_bytes(peer, audio_data, sample_rate)?;
        if !self.speaker_enabled {
            return Ok(ScheduleOutcome::Muted);
        }

        let now = self.clock.now();
        let queue = self.queues.entry(peer).or_default();
        let next = queue.next_play_time.unwrap_or(now);
        let queue_delay = next.saturating_sub(now);

        if queue_delay > self.max_queue_delay {
            queue.next_play_time = Some(now);
            queue.dropped += 1;
            tracing::warn!(
                peer = %peer,
                ?queue_delay,
                "Dropping stale relay frame"
            );
            return Ok(ScheduleOutcome::DroppedStale { queue_delay });
        }

        let at = next.max(now);
        queue.next_play_time = Some(at + frame.duration());
        queue.played += 1;

        let samples: AudioBlock = frame.to_float().into();
        self.clock.schedule_at(peer, at, samples, frame.sample_rate);
        Ok(ScheduleOutcome::Scheduled { at })
    }

    /// Muting keeps every timeline so that output resumes without a rebuild.
    pub fn set_speaker_enabled(&mut self, enabled: bool) {
        self.speaker_enabled = enabled;
    }

    pub fn speaker_enabled(&self) -> bool {
        self.speaker_enabled
    }

    pub fn queue(&self, peer: &UserId) -> Option<&PlaybackQueue> {
        self.queues.get(peer)
    }

    pub fn next_play_time(&self, peer: &UserId) -> Option<Duration> {
        self.queues.get(peer).and_then(|q| q.next_play_time)
    }

    pub fn queues(&self) -> impl Iterator<Item = (&UserId, &PlaybackQueue)> {
        self.queues.iter()
    }

    pub fn remove_peer(&mut self, peer: &UserId) -> bool {
        self.queues.remove(peer).is_some()
    }

    pub fn clear(&mut self) {
        self.queues.clear();
    }
}
