//! Bootstrap tracking for host construction.
//!
//! Bootstrap peers are trusted ONLY for peer introductions, not for data.
//! Every round received from any peer is verified independently.
//!
//! Construction succeeds once one bootstrap dial connects, and fails only when
//! every bootstrap dial has failed (or the bootstrap timeout expires with none
//! connected). With no bootstrap peers configured there is nothing to wait for.

use libp2p::swarm::ConnectionId;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Phases of the bootstrap process.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BootstrapPhase {
    /// Not started yet.
    NotStarted,
    /// Dials to bootstrap peers are in flight.
    Dialing,
    /// At least one bootstrap peer is connected, or none were configured.
    Complete,
    /// Could not connect to any bootstrap peer.
    Failed { reason: String },
}

/// Tracks the outcome of the initial bootstrap dials.
#[derive(Clone, Debug)]
pub struct BootstrapState {
    /// Current phase of bootstrapping.
    pub phase: BootstrapPhase,
    /// Number of bootstrap peers we tried to dial.
    pub peers_attempted: usize,
    /// Number of bootstrap peers successfully connected.
    pub peers_connected: usize,
    /// Number of bootstrap dials that failed.
    pub connection_failures: usize,
    pending: HashSet<ConnectionId>,
}

impl BootstrapState {
    pub fn new() -> Self {
        Self {
            phase: BootstrapPhase::NotStarted,
            peers_attempted: 0,
            peers_connected: 0,
            connection_failures: 0,
            pending: HashSet::new(),
        }
    }

    /// Begin tracking. `attempted` counts every configured peer, `in_flight`
    /// holds the dials that were actually started (the rest failed synchronously).
    pub fn start(&mut self, attempted: usize, in_flight: impl IntoIterator<Item = ConnectionId>) {
        self.peers_attempted = attempted;
        self.pending = in_flight.into_iter().collect();
        self.connection_failures = attempted - self.pending.len();
        self.phase = BootstrapPhase::Dialing;
        if attempted == 0 {
            self.phase = BootstrapPhase::Complete;
        } else {
            self.settle_if_exhausted();
        }
    }

    /// A connection was established. Returns true if it was a bootstrap dial.
    pub fn on_connected(&mut self, connection: ConnectionId) -> bool {
        if !self.pending.remove(&connection) {
            return false;
        }
        self.peers_connected += 1;
        if self.phase == BootstrapPhase::Dialing {
            self.phase = BootstrapPhase::Complete;
        }
        true
    }

    /// A dial failed. Returns true if it was a bootstrap dial.
    pub fn on_failed(&mut self, connection: ConnectionId) -> bool {
        if !self.pending.remove(&connection) {
            return false;
        }
        self.connection_failures += 1;
        self.settle_if_exhausted();
        true
    }

    /// The bootstrap timeout expired.
    pub fn on_timeout(&mut self) {
        if self.phase == BootstrapPhase::Dialing {
            self.pending.clear();
            self.phase = BootstrapPhase::Failed {
                reason: format!(
                    "timed out with {} of {} bootstrap peers connected",
                    self.peers_connected, self.peers_attempted
                ),
            };
        }
    }

    fn settle_if_exhausted(&mut self) {
        if self.phase == BootstrapPhase::Dialing
            && self.pending.is_empty()
            && self.peers_connected == 0
        {
            self.phase = BootstrapPhase::Failed {
                reason: format!("all {} bootstrap dials failed", self.peers_attempted),
            };
        }
    }

    /// Whether bootstrap is complete (we have a peer or needed none).
    pub fn is_complete(&self) -> bool {
        self.phase == BootstrapPhase::Complete
    }

    /// Whether bootstrap has failed.
    pub fn is_failed(&self) -> bool {
        matches!(self.phase, BootstrapPhase::Failed { .. })
    }

    /// Whether construction can stop waiting.
    pub fn is_settled(&self) -> bool {
        self.is_complete() || self.is_failed()
    }

    /// One-line summary for logs.
    pub fn log_state(&self) -> String {
        match &self.phase {
            BootstrapPhase::NotStarted => "Bootstrap not started".to_string(),
            BootstrapPhase::Dialing => format!(
                "Dialing bootstrap peers... ({} connected, {} failed of {})",
                self.peers_connected, self.connection_failures, self.peers_attempted
            ),
            BootstrapPhase::Complete => format!(
                "Bootstrap complete: {} of {} bootstrap peers connected",
                self.peers_connected, self.peers_attempted
            ),
            BootstrapPhase::Failed { reason } => {
                format!("Bootstrap failed: {}", reason)
            }
        }
    }
}

impl Default for BootstrapState {
    fn default() -> Self {
        Self::new()
    }
}
