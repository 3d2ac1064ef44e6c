//! # watchroom-common
//!
//! Shared configuration, error handling and room models used across the watchroom crates.
//! No voice logic lives here, just primitives and contracts.

pub mod config;
pub mod error;
pub mod models;

pub use error::{VoiceError, VoiceResult};
pub use models::{Member, RoomId, UserId};
