//! Connection health: raw transport states in, per-link health and the
//! room-wide "every direct link failed" decision out.
//!
//! `connected` and `completed` collapse to healthy. `disconnected` makes a
//! link suspect for the hysteresis window; only expiry of that window (still
//! disconnected) or an explicit `failed` report fails the link.

use crate::peer::{HealthState, PeerLink};
use crate::transport::ConnectionState;
use std::time::Duration;
use tokio::time::Instant;

/// What a state report did to a link's health.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthTransition {
    Unchanged,
    /// First time the link carried media.
    Connected,
    /// Back to healthy inside the hysteresis window.
    Recovered,
    /// Entered suspicion; a timer for `generation` must be armed.
    Suspect { since: Instant, generation: u64 },
    Failed,
}

#[derive(Debug)]
pub struct HealthMonitor {
    window: Duration,
    fallback_raised: bool,
}

impl HealthMonitor {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            fallback_raised: false,
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Apply a raw state report to `link`.
    pub fn observe(
        &self,
        link: &mut PeerLink,
        state: ConnectionState,
        now: Instant,
    ) -> HealthTransition {
        link.connection_state = state;

        match state {
            s if s.is_connected() => {
                link.cancel_hysteresis();
                link.suspect_since = None;
                let transition = match link.health {
                    HealthState::Healthy => HealthTransition::Unchanged,
                    HealthState::Suspect => HealthTransition::Recovered,
                    HealthState::Pending | HealthState::Failed => HealthTransition::Connected,
                };
                link.health = HealthState::Healthy;
                transition
            }
            ConnectionState::Disconnected => match link.health {
                HealthState::Healthy | HealthState::Pending => {
                    link.suspect_generation += 1;
                    link.suspect_since = Some(now);
                    link.health = HealthState::Suspect;
                    HealthTransition::Suspect {
                        since: now,
                        generation: link.suspect_generation,
                    }
                }
                HealthState::Suspect | HealthState::Failed => HealthTransition::Unchanged,
            },
            ConnectionState::Failed => {
                link.cancel_hysteresis();
                if link.health == HealthState::Failed {
                    return HealthTransition::Unchanged;
                }
                link.health = HealthState::Failed;
                HealthTransition::Failed
            }
            _ => HealthTransition::Unchanged,
        }
    }

    /// The hysteresis timer for `generation` fired. Fails the link only if the
    /// suspicion it was armed for is still current.
    pub fn expire(&self, link: &mut PeerLink, generation: u64) -> bool {
        let current = link.health == HealthState::Suspect
            && link.suspect_generation == generation
            && link.connection_state == ConnectionState::Disconnected;
        if current {
            tracing::info!(
                peer = %link.peer_id,
                window = ?self.window,
                "Link stayed disconnected past hysteresis window"
            );
            link.health = HealthState::Failed;
            link.suspect_since = None;
        }
        current
    }

    /// A link that may still carry or soon carry direct audio.
    ///
    /// Suspect links count: they are inside their hysteresis window and have
    /// not failed yet. So do links whose offer or answer is still in flight.
    pub fn is_alive(link: &PeerLink) -> bool {
        if !link.is_transport_open() {
            return false;
        }
        matches!(link.health, HealthState::Healthy | HealthState::Suspect)
            || link.is_negotiating()
    }

    /// True when at least one link exists and none of them is alive.
    pub fn all_direct_failed<'a>(links: impl IntoIterator<Item = &'a PeerLink>) -> bool {
        let mut any = false;
        for link in links {
            if Self::is_alive(link) {
                return false;
            }
            any = true;
        }
        any
    }

    /// Called after a link failed. Returns `true` exactly once per outage.
    pub fn evaluate_fallback<'a>(
        &mut self,
        links: impl IntoIterator<Item = &'a PeerLink>,
    ) -> bool {
        if self.fallback_raised {
            return false;
        }
        if Self::all_direct_failed(links) {
            self.fallback_raised = true;
            return true;
        }
        false
    }

    pub fn fallback_raised(&self) -> bool {
        self.fallback_raised
    }

    /// A link became healthy again; a later outage may raise the flag anew.
    pub fn rearm(&mut self) {
        if self.fallback_raised {
            tracing::debug!("Direct fallback re-armed");
        }
        self.fallback_raised = false;
    }
}
