//! Audio output capabilities.
//!
//! Direct links hand their remote track straight to [`DirectPlayback`] (the
//! transport already jitter-buffers). Relay frames are placed on an
//! [`AudioClock`] timeline by the relay scheduler.

use crate::capture::AudioBlock;
use crate::transport::RemoteTrack;
use std::time::Duration;
use watchroom_common::UserId;

/// A monotonic audio output clock.
pub trait AudioClock: Send + Sync {
    /// Current position of the output clock, measured from its origin.
    fn now(&self) -> Duration;

    /// Play `samples` for `peer` starting exactly at `at` on this clock.
    fn schedule_at(&self, peer: UserId, at: Duration, samples: AudioBlock, sample_rate: u32);
}

/// Renders remote tracks received over direct links.
pub trait DirectPlayback: Send + Sync {
    fn play(&self, track: &RemoteTrack);

    /// Silence a peer's stream without detaching it.
    fn set_muted(&self, peer: UserId, muted: bool);

    fn stop(&self, peer: UserId);
}
