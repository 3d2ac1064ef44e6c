//! Peer connection manager: one direct transport per other member.
//!
//! Full mesh, no central negotiator. Each member offers to every peer it
//! learns about while its mic is on; a member without a mic still answers
//! (listen-only). Offer collisions are settled by id order: the member with
//! the lower id is "polite" and answers the incoming offer instead of its own.
//!
//! All signaling failures here are per-peer. Nothing in this module can stop
//! another peer's link.

use crate::capture::LocalTrack;
use crate::signaling::{IceCandidate, SessionDescription, SignalingConsumer};
use crate::transport::{
    ConnectionState, DirectTransport, EventSink, RemoteTrack, TransportEvents, TransportFactory,
};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use uuid::Uuid;
use watchroom_common::config::IceServerConfig;
use watchroom_common::{UserId, VoiceError, VoiceResult};

/// Candidates held while the remote description is still missing.
const MAX_PENDING_CANDIDATES: usize = 64;

/// Which path currently carries audio to and from a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    Direct,
    Relay,
    None,
}

/// Health of a direct link, derived from raw connectivity reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    /// Not yet connected and nothing has gone wrong.
    Pending,
    Healthy,
    /// Disconnected, inside the hysteresis window.
    Suspect,
    Failed,
}

/// One direct link to another member.
pub struct PeerLink {
    pub(crate) peer_id: UserId,
    pub(crate) transport_mode: TransportMode,
    pub(crate) connection_state: ConnectionState,
    pub(crate) health: HealthState,
    pub(crate) suspect_since: Option<Instant>,
    pub(crate) suspect_generation: u64,
    pub(crate) epoch: u64,
    transport: Option<Arc<dyn DirectTransport>>,
    local_track: Option<Uuid>,
    remote_track: Option<RemoteTrack>,
    awaiting_answer: bool,
    remote_described: bool,
    pending_candidates: Vec<IceCandidate>,
    hysteresis: Option<AbortHandle>,
}

impl PeerLink {
    fn new(peer_id: UserId, epoch: u64, transport: Arc<dyn DirectTransport>) -> Self {
        Self {
            peer_id,
            transport_mode: TransportMode::None,
            connection_state: ConnectionState::New,
            health: HealthState::Pending,
            suspect_since: None,
            suspect_generation: 0,
            epoch,
            transport: Some(transport),
            local_track: None,
            remote_track: None,
            awaiting_answer: false,
            remote_described: false,
            pending_candidates: Vec::new(),
            hysteresis: None,
        }
    }

    /// A record for a peer whose transport could not be created.
    fn unreachable(peer_id: UserId, epoch: u64) -> Self {
        Self {
            peer_id,
            transport_mode: TransportMode::None,
            connection_state: ConnectionState::Failed,
            health: HealthState::Failed,
            suspect_since: None,
            suspect_generation: 0,
            epoch,
            transport: None,
            local_track: None,
            remote_track: None,
            awaiting_answer: false,
            remote_described: false,
            pending_candidates: Vec::new(),
            hysteresis: None,
        }
    }

    pub fn peer_id(&self) -> UserId {
        self.peer_id
    }

    pub fn transport_mode(&self) -> TransportMode {
        self.transport_mode
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection_state
    }

    pub fn health(&self) -> HealthState {
        self.health
    }

    pub fn suspect_since(&self) -> Option<Instant> {
        self.suspect_since
    }

    pub fn is_transport_open(&self) -> bool {
        self.transport.is_some()
    }

    /// Transport open and an exchange under way: ICE checking, or an offer
    /// or answer in flight before the first state report.
    pub fn is_negotiating(&self) -> bool {
        if !self.is_transport_open() {
            return false;
        }
        match self.connection_state {
            ConnectionState::New => self.awaiting_answer || self.remote_described,
            state => state.is_negotiating(),
        }
    }

    pub fn remote_track(&self) -> Option<&RemoteTrack> {
        self.remote_track.as_ref()
    }

    pub fn has_local_track(&self) -> bool {
        self.local_track.is_some()
    }

    pub(crate) fn set_hysteresis(&mut self, handle: AbortHandle) {
        self.cancel_hysteresis();
        self.hysteresis = Some(handle);
    }

    pub(crate) fn cancel_hysteresis(&mut self) {
        if let Some(timer) = self.hysteresis.take() {
            timer.abort();
        }
    }

    fn attach(&mut self, transport: &Arc<dyn DirectTransport>, local: Option<&LocalTrack>) {
        if let Some(track) = local {
            if self.local_track != Some(track.id()) {
                transport.attach_local_track(track);
                self.local_track = Some(track.id());
            }
        }
    }

    fn close(&mut self) -> bool {
        self.cancel_hysteresis();
        self.awaiting_answer = false;
        self.remote_described = false;
        self.pending_candidates.clear();
        self.remote_track = None;
        self.local_track = None;
        self.suspect_since = None;
        match self.transport.take() {
            Some(transport) => {
                transport.close();
                true
            }
            None => false,
        }
    }
}

impl Drop for PeerLink {
    fn drop(&mut self) {
        self.close();
    }
}

/// Result of [`PeerConnectionManager::initiate_connection`].
#[derive(Debug)]
pub enum Initiation {
    /// A fresh offer went out.
    Sent,
    /// The existing link gained the local track and was re-offered.
    Renegotiated,
    /// A link already exists; nothing was sent.
    AlreadyLinked,
    /// The direct attempt for this peer is over; it is eligible for relay.
    Failed(VoiceError),
}

/// Result of [`PeerConnectionManager::handle_offer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferOutcome {
    Answered,
    /// Colliding offer from a peer we outrank; ours stands.
    Ignored,
}

/// Owns every [`PeerLink`] of one session.
pub struct PeerConnectionManager {
    links: HashMap<UserId, PeerLink>,
    factory: Arc<dyn TransportFactory>,
    signaling: SignalingConsumer,
    ice_servers: Vec<IceServerConfig>,
    sink: EventSink,
    next_epoch: u64,
}

impl PeerConnectionManager {
    pub fn new(
        factory: Arc<dyn TransportFactory>,
        signaling: SignalingConsumer,
        ice_servers: Vec<IceServerConfig>,
        sink: EventSink,
    ) -> Self {
        Self {
            links: HashMap::new(),
            factory,
            signaling,
            ice_servers,
            sink,
            next_epoch: 1,
        }
    }

    pub fn get(&self, peer: &UserId) -> Option<&PeerLink> {
        self.links.get(peer)
    }

    pub fn get_mut(&mut self, peer: &UserId) -> Option<&mut PeerLink> {
        self.links.get_mut(peer)
    }

    pub fn contains(&self, peer: &UserId) -> bool {
        self.links.contains_key(peer)
    }

    pub fn links(&self) -> impl Iterator<Item = &PeerLink> {
        self.links.values()
    }

    pub fn peer_ids(&self) -> Vec<UserId> {
        self.links.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Whether an event tagged `epoch` comes from the peer's current, open transport.
    pub fn accepts_epoch(&self, peer: &UserId, epoch: u64) -> bool {
        self.links
            .get(peer)
            .is_some_and(|l| l.epoch == epoch && l.transport.is_some())
    }

    /// Replace (or create) the peer's link with a brand-new transport.
    fn open_link(&mut self, peer: UserId) -> VoiceResult<Arc<dyn DirectTransport>> {
        let epoch = self.next_epoch;
        self.next_epoch += 1;

        if let Some(mut old) = self.links.remove(&peer) {
            old.close();
        }

        let events = TransportEvents::new(peer, epoch, self.sink.clone());
        match self.factory.create(peer, &self.ice_servers, events) {
            Ok(transport) => {
                self.links
                    .insert(peer, PeerLink::new(peer, epoch, transport.clone()));
                tracing::info!(peer = %peer, epoch, "Direct link created");
                Ok(transport)
            }
            Err(e) => {
                tracing::warn!(peer = %peer, error = %e, "Direct transport unavailable");
                self.links.insert(peer, PeerLink::unreachable(peer, epoch));
                Err(VoiceError::transport(peer, e.to_string()))
            }
        }
    }

    /// Offer a direct link to `peer`. A no-op while a link already exists,
    /// except that a link opened without local audio is re-offered once the
    /// mic track becomes available.
    pub async fn initiate_connection(
        &mut self,
        peer: UserId,
        local: Option<&LocalTrack>,
    ) -> Initiation {
        if let Some(link) = self.links.get_mut(&peer) {
            let Some(transport) = link.transport.clone() else {
                return Initiation::AlreadyLinked;
            };
            let needs_track = local.is_some_and(|t| link.local_track != Some(t.id()));
            if !needs_track || link.awaiting_answer {
                if needs_track {
                    link.attach(&transport, local);
                }
                return Initiation::AlreadyLinked;
            }

            link.attach(&transport, local);
            return match self.send_offer(peer, transport).await {
                Ok(()) => {
                    tracing::info!(peer = %peer, "Renegotiating link with local audio");
                    Initiation::Renegotiated
                }
                Err(e) => Initiation::Failed(e),
            };
        }

        let transport = match self.open_link(peer) {
            Ok(t) => t,
            Err(e) => return Initiation::Failed(e),
        };
        if let Some(link) = self.links.get_mut(&peer) {
            link.attach(&transport, local);
        }

        match self.send_offer(peer, transport).await {
            Ok(()) => {
                tracing::info!(peer = %peer, with_audio = local.is_some(), "Sent offer");
                Initiation::Sent
            }
            Err(e) => Initiation::Failed(e),
        }
    }

    async fn send_offer(
        &mut self,
        peer: UserId,
        transport: Arc<dyn DirectTransport>,
    ) -> VoiceResult<()> {
        let offer = match transport.create_offer().await {
            Ok(offer) => offer,
            Err(e) => {
                self.close_transport(&peer);
                return Err(VoiceError::transport(peer, e.to_string()));
            }
        };

        if let Some(link) = self.links.get_mut(&peer) {
            link.awaiting_answer = true;
        }

        // a lost offer leaves the link pending; the channel may redeliver or the peer re-offer
        if let Err(e) = self.signaling.send_offer(peer, offer).await {
            tracing::warn!(peer = %peer, error = %e, "Offer could not be sent");
        }
        Ok(())
    }

    /// Answer a remote offer, creating or reusing the link. Works without local
    /// audio (listen-only answer). A repeated offer renegotiates the same link.
    pub async fn handle_offer(
        &mut self,
        peer: UserId,
        offer: SessionDescription,
        local: Option<&LocalTrack>,
    ) -> VoiceResult<OfferOutcome> {
        let existing = self
            .links
            .get(&peer)
            .and_then(|l| l.transport.clone().map(|t| (t, l.awaiting_answer)));

        let transport = match existing {
            Some((_, true)) if self.signaling.self_id() > peer => {
                tracing::debug!(peer = %peer, "Offer collision, keeping our offer");
                return Ok(OfferOutcome::Ignored);
            }
            Some((_, true)) => {
                tracing::debug!(peer = %peer, "Offer collision, answering theirs");
                self.open_link(peer)?
            }
            Some((transport, false)) => transport,
            None => self.open_link(peer)?,
        };

        let fresh = self
            .links
            .get(&peer)
            .is_some_and(|l| !l.remote_described && l.connection_state == ConnectionState::New);
        if let Some(link) = self.links.get_mut(&peer) {
            link.attach(&transport, local);
        }
        if local.is_none() {
            tracing::debug!(peer = %peer, "Answering without local audio");
        }

        if let Err(e) = transport.apply_remote_description(offer).await {
            if fresh {
                // an unusable first offer leaves no link behind
                self.remove(&peer);
            }
            return Err(VoiceError::protocol(format!("offer from {peer}: {e}")));
        }
        self.mark_described(&peer, &transport).await;

        let answer = match transport.create_answer().await {
            Ok(answer) => answer,
            Err(e) => {
                self.close_transport(&peer);
                return Err(VoiceError::transport(peer, e.to_string()));
            }
        };
        if let Err(e) = self.signaling.send_answer(peer, answer).await {
            tracing::warn!(peer = %peer, error = %e, "Answer could not be sent");
        }
        Ok(OfferOutcome::Answered)
    }

    /// Apply the answer to our outstanding offer. Unknown peers are ignored.
    pub async fn handle_answer(
        &mut self,
        peer: UserId,
        answer: SessionDescription,
    ) -> VoiceResult<()> {
        let Some(link) = self.links.get_mut(&peer) else {
            tracing::debug!(peer = %peer, "Answer for unknown link ignored");
            return Ok(());
        };
        let Some(transport) = link.transport.clone() else {
            return Ok(());
        };
        if !link.awaiting_answer {
            return Err(VoiceError::protocol(format!(
                "unexpected answer from {peer}"
            )));
        }

        transport
            .apply_remote_description(answer)
            .await
            .map_err(|e| VoiceError::protocol(format!("answer from {peer}: {e}")))?;
        if let Some(link) = self.links.get_mut(&peer) {
            link.awaiting_answer = false;
        }
        self.mark_described(&peer, &transport).await;
        Ok(())
    }

    /// Add a remote candidate. Held until the remote description is known;
    /// unknown peers are ignored.
    pub async fn handle_ice_candidate(
        &mut self,
        peer: UserId,
        candidate: IceCandidate,
    ) -> VoiceResult<()> {
        let Some(link) = self.links.get_mut(&peer) else {
            return Ok(());
        };
        let Some(transport) = link.transport.clone() else {
            return Ok(());
        };
        if !link.remote_described {
            if link.pending_candidates.len() >= MAX_PENDING_CANDIDATES {
                link.pending_candidates.remove(0);
            }
            link.pending_candidates.push(candidate);
            return Ok(());
        }

        transport
            .add_ice_candidate(candidate)
            .await
            .map_err(|e| VoiceError::protocol(format!("candidate from {peer}: {e}")))
    }

    async fn mark_described(&mut self, peer: &UserId, transport: &Arc<dyn DirectTransport>) {
        let pending = match self.links.get_mut(peer) {
            Some(link) => {
                link.remote_described = true;
                std::mem::take(&mut link.pending_candidates)
            }
            None => return,
        };
        for candidate in pending {
            if let Err(e) = transport.add_ice_candidate(candidate).await {
                tracing::warn!(peer = %peer, error = %e, "Dropping buffered candidate");
            }
        }
    }

    /// Forward a locally gathered candidate to the peer.
    pub async fn send_local_candidate(&self, peer: UserId, candidate: IceCandidate) {
        if let Err(e) = self.signaling.send_ice(peer, candidate).await {
            tracing::warn!(peer = %peer, error = %e, "Candidate could not be sent");
        }
    }

    /// Register the peer's inbound direct audio.
    pub fn set_remote_track(&mut self, peer: &UserId, track: RemoteTrack) -> bool {
        match self.links.get_mut(peer) {
            Some(link) => {
                link.remote_track = Some(track);
                true
            }
            None => false,
        }
    }

    /// Close the peer's transport but keep its record as failed.
    pub fn close_transport(&mut self, peer: &UserId) -> bool {
        let Some(link) = self.links.get_mut(peer) else {
            return false;
        };
        let closed = link.close();
        link.health = HealthState::Failed;
        link.transport_mode = TransportMode::None;
        if closed {
            tracing::info!(peer = %peer, "Direct link closed");
        }
        closed
    }

    /// Destroy the peer's link entirely.
    pub fn remove(&mut self, peer: &UserId) -> Option<UserId> {
        self.links.remove(peer).map(|mut link| {
            link.close();
            tracing::info!(peer = %peer, "Direct link removed");
            link.peer_id
        })
    }

    /// Drop records of links whose transport is already gone.
    pub fn prune_closed(&mut self) -> Vec<UserId> {
        let closed: Vec<UserId> = self
            .links
            .values()
            .filter(|l| l.transport.is_none())
            .map(|l| l.peer_id)
            .collect();
        for peer in &closed {
            self.links.remove(peer);
        }
        closed
    }

    pub fn clear(&mut self) {
        for (_, mut link) in self.links.drain() {
            link.close();
        }
    }
}
