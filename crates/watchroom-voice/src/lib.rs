//! # watchroom-voice
//!
//! Voice chat for watch rooms.
//!
//! Architecture: mesh first, server relay as fallback
//! - Every member holds one direct link to every other member (no central negotiator)
//! - Link health goes healthy → suspect → failed, with a hysteresis window on disconnects
//! - Only when *every* direct link is gone does the room switch to relaying PCM16
//!   chunks through the signaling server
//! - Relay audio is denoised (RNNoise), downsampled to 16 kHz and silence-gated
//!   before it leaves the device; receivers schedule it per speaker on an audio clock
//! - Muting keeps the microphone open so toggling is instant; only leaving releases it
//!
//! Platform pieces (microphone, direct transport, audio output) are traits; the
//! [`sim`] module provides in-process implementations.

pub mod capture;
pub mod encoder;
pub mod health;
pub mod peer;
pub mod playback;
pub mod scheduler;
pub mod session;
pub mod signaling;
pub mod sim;
pub mod transport;

pub use session::{
    LinkSnapshot, QueueSnapshot, RoomTransport, SessionSnapshot, VoiceBackends, VoiceHandle,
    VoiceSession, VoiceStatus,
};
pub use signaling::{InboundSignal, OutboundSignal, SignalingChannel};
