//! Centralized error types for watchroom voice.
//!
//! Uses `thiserror` for the taxonomy. Every variant except `Device`, `Config`,
//! `ChannelClosed` and `Internal` is contained to a single peer or a single frame
//! and must never tear down the room session.

use uuid::Uuid;

/// Core error type used across the voice crates.
#[derive(Debug, thiserror::Error)]
pub enum VoiceError {
    // === Local device ===
    #[error("Microphone unavailable: {message}")]
    Device { message: String },

    // === Per-peer errors ===
    #[error("Signaling protocol error: {message}")]
    SignalingProtocol { message: String },

    #[error("Direct transport to {peer} failed: {message}")]
    Transport { peer: Uuid, message: String },

    // === Relay ===
    #[error("Relay could not start: {reason}")]
    RelayStart { reason: String },

    #[error("Malformed relay frame: {message}")]
    PlaybackDecode { message: String },

    // === Infrastructure ===
    #[error("Voice session is no longer running")]
    ChannelClosed,

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl VoiceError {
    pub fn device(message: impl Into<String>) -> Self {
        Self::Device {
            message: message.into(),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::SignalingProtocol {
            message: message.into(),
        }
    }

    pub fn transport(peer: Uuid, message: impl Into<String>) -> Self {
        Self::Transport {
            peer,
            message: message.into(),
        }
    }

    pub fn relay_start(reason: impl Into<String>) -> Self {
        Self::RelayStart {
            reason: reason.into(),
        }
    }

    pub fn decode(message: impl Into<String>) -> Self {
        Self::PlaybackDecode {
            message: message.into(),
        }
    }

    /// Error code string for programmatic handling by the UI layer.
    pub fn error_code(&self) -> &str {
        match self {
            Self::Device { .. } => "DEVICE_ERROR",
            Self::SignalingProtocol { .. } => "SIGNALING_PROTOCOL_ERROR",
            Self::Transport { .. } => "TRANSPORT_FAILURE",
            Self::RelayStart { .. } => "RELAY_START_FAILURE",
            Self::PlaybackDecode { .. } => "PLAYBACK_DECODE_ERROR",
            Self::ChannelClosed => "CHANNEL_CLOSED",
            Self::Config(_) => "CONFIG_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Whether the failure is confined to one peer link or one frame.
    pub fn is_peer_local(&self) -> bool {
        matches!(
            self,
            Self::SignalingProtocol { .. } | Self::Transport { .. } | Self::PlaybackDecode { .. }
        )
    }
}

impl From<serde_json::Error> for VoiceError {
    fn from(e: serde_json::Error) -> Self {
        Self::protocol(e.to_string())
    }
}

/// Convenience type alias for Results using VoiceError.
pub type VoiceResult<T> = Result<T, VoiceError>;
