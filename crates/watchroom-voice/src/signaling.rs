//! Voice signaling over the room's existing message channel.
//!
//! Carries five kinds of message:
//! - SDP offer/answer exchange for direct links (point-to-point)
//! - ICE candidate exchange (point-to-point)
//! - Mic-enabled notices (broadcast, informational)
//! - Relay audio chunks (broadcast to the room)
//!
//! The channel itself (connect, reconnect, membership) is owned by the room
//! layer. This module only gives it a typed face.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use watchroom_common::{RoomId, UserId, VoiceError, VoiceResult};

/// Default relay sample rate assumed when a chunk omits it.
pub const DEFAULT_CHUNK_SAMPLE_RATE: u32 = 16_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// A session description as exchanged between members.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// A connectivity candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default)]
    pub sdp_m_line_index: Option<u32>,
}

/// Messages this member emits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all_fields = "camelCase")]
pub enum OutboundSignal {
    #[serde(rename = "voice:offer")]
    Offer {
        target_user_id: UserId,
        offer: SessionDescription,
    },

    #[serde(rename = "voice:answer")]
    Answer {
        target_user_id: UserId,
        answer: SessionDescription,
    },

    #[serde(rename = "voice:ice")]
    Ice {
        target_user_id: UserId,
        candidate: IceCandidate,
    },

    #[serde(rename = "voice:mic-enabled")]
    MicEnabled { user_id: UserId },

    /// Relay audio, little-endian PCM16 mono. The server stamps the sender id.
    #[serde(rename = "voice:audio-chunk")]
    AudioChunk {
        room_id: RoomId,
        audio_data: Vec<u8>,
        sample_rate: u32,
    },
}

impl OutboundSignal {
    /// Point-to-point recipient, or `None` for room broadcasts.
    pub fn target(&self) -> Option<UserId> {
        match self {
            Self::Offer { target_user_id, .. }
            | Self::Answer { target_user_id, .. }
            | Self::Ice { target_user_id, .. } => Some(*target_user_id),
            Self::MicEnabled { .. } | Self::AudioChunk { .. } => None,
        }
    }

    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Offer { .. } => "voice:offer",
            Self::Answer { .. } => "voice:answer",
            Self::Ice { .. } => "voice:ice",
            Self::MicEnabled { .. } => "voice:mic-enabled",
            Self::AudioChunk { .. } => "voice:audio-chunk",
        }
    }

    /// What the recipient observes once the room server has stamped the sender.
    pub fn delivered_from(self, sender: UserId) -> InboundSignal {
        match self {
            Self::Offer { offer, .. } => InboundSignal::Offer {
                user_id: sender,
                offer,
            },
            Self::Answer { answer, .. } => InboundSignal::Answer {
                user_id: sender,
                answer,
            },
            Self::Ice { candidate, .. } => InboundSignal::Ice {
                user_id: sender,
                candidate,
            },
            Self::MicEnabled { user_id } => InboundSignal::MicEnabled { user_id },
            Self::AudioChunk {
                audio_data,
                sample_rate,
                ..
            } => InboundSignal::AudioChunk {
                user_id: sender,
                audio_data,
                sample_rate: Some(sample_rate),
            },
        }
    }
}

/// Messages delivered to this member, stamped with the sender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all_fields = "camelCase")]
pub enum InboundSignal {
    #[serde(rename = "voice:offer")]
    Offer {
        user_id: UserId,
        offer: SessionDescription,
    },

    #[serde(rename = "voice:answer")]
    Answer {
        user_id: UserId,
        answer: SessionDescription,
    },

    #[serde(rename = "voice:ice")]
    Ice {
        user_id: UserId,
        candidate: IceCandidate,
    },

    #[serde(rename = "voice:mic-enabled")]
    MicEnabled { user_id: UserId },

    #[serde(rename = "voice:audio-chunk")]
    AudioChunk {
        user_id: UserId,
        audio_data: Vec<u8>,
        #[serde(default)]
        sample_rate: Option<u32>,
    },
}

impl InboundSignal {
    /// Decode an event name and its payload as received from the channel.
    pub fn decode(event: &str, data: serde_json::Value) -> VoiceResult<Self> {
        if !event.starts_with("voice:") {
            return Err(VoiceError::protocol(format!("not a voice event: {event}")));
        }
        let envelope = serde_json::json!({ "event": event, "data": data });
        Ok(serde_json::from_value(envelope)?)
    }

    /// Decode a full `{"event": .., "data": ..}` envelope.
    pub fn from_json(text: &str) -> VoiceResult<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn sender(&self) -> UserId {
        match self {
            Self::Offer { user_id, .. }
            | Self::Answer { user_id, .. }
            | Self::Ice { user_id, .. }
            | Self::MicEnabled { user_id }
            | Self::AudioChunk { user_id, .. } => *user_id,
        }
    }

    /// Offer, answer and candidate must carry the matching SDP kind and a non-empty body.
    pub fn validate(&self) -> VoiceResult<()> {
        match self {
            Self::Offer { offer, .. } if offer.kind != SdpType::Offer => {
                Err(VoiceError::protocol("offer carries an answer description"))
            }
            Self::Answer { answer, .. } if answer.kind != SdpType::Answer => {
                Err(VoiceError::protocol("answer carries an offer description"))
            }
            Self::Offer { offer: desc, .. } | Self::Answer { answer: desc, .. }
                if desc.sdp.trim().is_empty() =>
            {
                Err(VoiceError::protocol("empty session description"))
            }
            Self::Ice { candidate, .. } if candidate.candidate.trim().is_empty() => {
                Err(VoiceError::protocol("empty ICE candidate"))
            }
            _ => Ok(()),
        }
    }
}

/// The room's bidirectional message channel, as seen by the voice core.
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    async fn emit(&self, signal: OutboundSignal) -> VoiceResult<()>;

    /// Whether the underlying channel is currently connected.
    fn is_connected(&self) -> bool {
        true
    }
}

/// Typed sender bound to one member of one room.
#[derive(Clone)]
pub struct SignalingConsumer {
    channel: Arc<dyn SignalingChannel>,
    self_id: UserId,
    room_id: RoomId,
}

impl SignalingConsumer {
    pub fn new(channel: Arc<dyn SignalingChannel>, self_id: UserId, room_id: RoomId) -> Self {
        Self {
            channel,
            self_id,
            room_id,
        }
    }

    pub fn self_id(&self) -> UserId {
        self.self_id
    }

    pub fn room_id(&self) -> RoomId {
        self.room_id
    }

    pub fn is_connected(&self) -> bool {
        self.channel.is_connected()
    }

    pub async fn send_offer(&self, peer: UserId, offer: SessionDescription) -> VoiceResult<()> {
        tracing::debug!(peer = %peer, "Sending offer");
        self.channel
            .emit(OutboundSignal::Offer {
                target_user_id: peer,
                offer,
            })
            .await
    }

    pub async fn send_answer(&self, peer: UserId, answer: SessionDescription) -> VoiceResult<()> {
        tracing::debug!(peer = %peer, "Sending answer");
        self.channel
            .emit(OutboundSignal::Answer {
                target_user_id: peer,
                answer,
            })
            .await
    }

    pub async fn send_ice(&self, peer: UserId, candidate: IceCandidate) -> VoiceResult<()> {
        self.channel
            .emit(OutboundSignal::Ice {
                target_user_id: peer,
                candidate,
            })
            .await
    }

    pub async fn announce_mic(&self) -> VoiceResult<()> {
        self.channel
            .emit(OutboundSignal::MicEnabled {
                user_id: self.self_id,
            })
            .await
    }

    pub async fn send_audio_chunk(&self, audio_data: Vec<u8>, sample_rate: u32) -> VoiceResult<()> {
        self.channel
            .emit(OutboundSignal::AudioChunk {
                room_id: self.room_id,
                audio_data,
                sample_rate,
            })
            .await
    }

    /// Drop messages that echo our own traffic (relay audio comes back to the sender).
    pub fn accept(&self, signal: &InboundSignal) -> bool {
        signal.sender() != self.self_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn outbound_offer_uses_channel_field_names() {
        let target = Uuid::new_v4();
        let json = serde_json::to_value(OutboundSignal::Offer {
            target_user_id: target,
            offer: SessionDescription::offer("v=0"),
        })
        .unwrap();

        assert_eq!(json["event"], "voice:offer");
        assert_eq!(json["data"]["targetUserId"], target.to_string());
        assert_eq!(json["data"]["offer"]["type"], "offer");
        assert_eq!(json["data"]["offer"]["sdp"], "v=0");
    }

    #[test]
    fn decodes_audio_chunk_without_sample_rate() {
        let sender = Uuid::new_v4();
        let signal = InboundSignal::decode(
            "voice:audio-chunk",
            serde_json::json!({ "userId": sender, "audioData": [1, 0, 255, 127] }),
        )
        .unwrap();

        match signal {
            InboundSignal::AudioChunk {
                user_id,
                audio_data,
                sample_rate,
            } => {
                assert_eq!(user_id, sender);
                assert_eq!(audio_data, vec![1, 0, 255, 127]);
                assert_eq!(sample_rate, None);
            }
            other => panic!("unexpected signal {other:?}"),
        }
    }

    #[test]
    fn candidate_uses_browser_field_names() {
        let json = serde_json::json!({
            "candidate": "candidate:1 1 udp 2122260223 10.0.0.2 54321 typ host",
            "sdpMid": "0",
            "sdpMLineIndex": 0
        });
        let c: IceCandidate = serde_json::from_value(json).unwrap();
        assert_eq!(c.sdp_mid.as_deref(), Some("0"));
        assert_eq!(c.sdp_m_line_index, Some(0));
    }

    #[test]
    fn rejects_malformed_payloads() {
        assert!(InboundSignal::decode("voice:offer", serde_json::json!({ "userId": 3 })).is_err());
        assert!(InboundSignal::decode("chat:message", serde_json::json!({})).is_err());
        assert!(InboundSignal::from_json("{not json").is_err());
    }

    #[test]
    fn validate_catches_mismatched_descriptions() {
        let bad = InboundSignal::Offer {
            user_id: Uuid::nil(),
            offer: SessionDescription::answer("v=0"),
        };
        assert!(bad.validate().is_err());

        let empty = InboundSignal::Answer {
            user_id: Uuid::nil(),
            answer: SessionDescription::answer("  "),
        };
        assert!(empty.validate().is_err());

        let ok = InboundSignal::Answer {
            user_id: Uuid::nil(),
            answer: SessionDescription::answer("v=0"),
        };
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn delivered_from_stamps_sender() {
        let sender = Uuid::new_v4();
        let inbound = OutboundSignal::AudioChunk {
            room_id: Uuid::nil(),
            audio_data: vec![0, 1],
            sample_rate: 16_000,
        }
        .delivered_from(sender);
        assert_eq!(inbound.sender(), sender);
    }
}
