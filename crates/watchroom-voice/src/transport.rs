//! Direct (peer-to-peer) media transport capability.
//!
//! A transport is one point-to-point audio connection to another member.
//! Its callbacks (state changes, remote tracks, local candidates) are not
//! invoked re-entrantly: the transport posts [`LinkEvent`]s into an
//! [`EventSink`] and the session handles them in its own loop.

use crate::capture::LocalTrack;
use crate::signaling::{IceCandidate, SessionDescription};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use watchroom_common::config::IceServerConfig;
use watchroom_common::{UserId, VoiceResult};

/// Raw connectivity state as reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    /// `connected` and `completed` both mean media can flow.
    pub fn is_connected(self) -> bool {
        matches!(self, Self::Connected | Self::Completed)
    }

    pub fn is_negotiating(self) -> bool {
        matches!(self, Self::Checking)
    }
}

/// Inbound audio from a peer over its direct link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub id: String,
    pub peer: UserId,
}

/// Something a transport observed.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    StateChanged(ConnectionState),
    LocalCandidate(IceCandidate),
    Track(RemoteTrack),
}

/// A transport event tagged with the link it came from.
///
/// `epoch` identifies the transport instance; events from a transport that
/// has since been replaced or closed are ignored.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkEvent {
    pub peer: UserId,
    pub epoch: u64,
    pub event: TransportEvent,
}

/// Where link events go. Returns `false` once the session is gone.
pub type EventSink = Arc<dyn Fn(LinkEvent) -> bool + Send + Sync>;

/// The event handle given to one transport instance.
#[derive(Clone)]
pub struct TransportEvents {
    peer: UserId,
    epoch: u64,
    sink: EventSink,
}

impl TransportEvents {
    pub fn new(peer: UserId, epoch: u64, sink: EventSink) -> Self {
        Self { peer, epoch, sink }
    }

    pub fn peer(&self) -> UserId {
        self.peer
    }

    pub fn emit(&self, event: TransportEvent) -> bool {
        (self.sink)(LinkEvent {
            peer: self.peer,
            epoch: self.epoch,
            event,
        })
    }

    pub fn state(&self, state: ConnectionState) -> bool {
        self.emit(TransportEvent::StateChanged(state))
    }
}

/// One direct audio connection.
///
/// Methods only do local work (SDP generation, applying descriptions);
/// connectivity progress is reported through [`TransportEvents`].
#[async_trait]
pub trait DirectTransport: Send + Sync {
    async fn create_offer(&self) -> VoiceResult<SessionDescription>;

    async fn create_answer(&self) -> VoiceResult<SessionDescription>;

    async fn apply_remote_description(&self, desc: SessionDescription) -> VoiceResult<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> VoiceResult<()>;

    fn attach_local_track(&self, track: &LocalTrack);

    fn close(&self);
}

/// Creates transports. Fails when direct media is unsupported in this environment.
pub trait TransportFactory: Send + Sync {
    fn create(
        &self,
        peer: UserId,
        ice_servers: &[IceServerConfig],
        events: TransportEvents,
    ) -> VoiceResult<Arc<dyn DirectTransport>>;
}
