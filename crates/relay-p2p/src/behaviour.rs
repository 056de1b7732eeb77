//! libp2p network behaviour for the beacon relay.
//!
//! Defines the composite behaviour that combines:
//! - GossipSub for the per-chain round topics
//! - Identify for peer identification
//! - Ping for connection keep-alive and latency
//!
//! The behaviour also carries peer scoring so that peers which keep sending
//! rounds that fail validation get disconnected.

use crate::error::TransportError;
use crate::transport::TransportConfig;
use libp2p::{
    gossipsub, identify, identity::Keypair, ping,
    swarm::NetworkBehaviour,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::Duration;

/// Identify protocol version advertised by relay nodes.
pub const IDENTIFY_PROTOCOL: &str = "/beacon-relay/0.1.0";

/// The composite network behaviour for the relay.
#[derive(NetworkBehaviour)]
pub struct RelayBehaviour {
    /// GossipSub carrying serialized rounds, one topic per chain.
    pub gossipsub: gossipsub::Behaviour,

    /// Identify protocol for exchanging peer information.
    pub identify: identify::Behaviour,

    /// Ping for keeping connections alive and measuring latency.
    pub ping: ping::Behaviour,
}

impl RelayBehaviour {
    pub fn new(
        keypair: &Keypair,
        gossipsub_config: gossipsub::Config,
    ) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let gossipsub = gossipsub::Behaviour::new(
            gossipsub::MessageAuthenticity::Signed(keypair.clone()),
            gossipsub_config,
        )?;
        Ok(Self {
            gossipsub,
            identify: identify::Behaviour::new(create_identify_config(keypair.public())),
            ping: ping::Behaviour::new(ping::Config::new()),
        })
    }
}

/// Peer scoring: which peers give us valid vs invalid rounds.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PeerScore {
    /// Total messages received from this peer.
    pub messages_received: u64,
    /// Messages that passed topic validation.
    pub messages_valid: u64,
    /// Messages that failed topic validation.
    pub messages_invalid: u64,
    /// Smoothed ping latency in milliseconds.
    pub avg_latency_ms: f64,
}

impl PeerScore {
    pub fn new() -> Self {
        Self {
            messages_received: 0,
            messages_valid: 0,
            messages_invalid: 0,
            avg_latency_ms: 0.0,
        }
    }

    pub fn record(&mut self, valid: bool) {
        self.messages_received += 1;
        if valid {
            self.messages_valid += 1;
        } else {
            self.messages_invalid += 1;
        }
    }

    /// Fold a ping round-trip into the moving average.
    pub fn record_latency(&mut self, rtt: Duration) {
        let sample = rtt.as_secs_f64() * 1000.0;
        if self.avg_latency_ms == 0.0 {
            self.avg_latency_ms = sample;
        } else {
            self.avg_latency_ms = self.avg_latency_ms * 0.8 + sample * 0.2;
        }
    }

    /// Calculate a reputation score (0.0 - 1.0).
    /// Higher is better. Peers with many invalid messages get scored down.
    pub fn reputation(&self) -> f64 {
        if self.messages_received == 0 {
            return 0.5; // Neutral for new peers
        }
        self.messages_valid as f64 / self.messages_received as f64
    }

    /// Whether this peer should be disconnected due to bad behavior.
    pub fn should_disconnect(&self) -> bool {
        // Disconnect if more than 50% of messages are invalid and we have enough data
        self.messages_received >= 10 && self.reputation() < 0.5
    }
}

impl Default for PeerScore {
    fn default() -> Self {
        Self::new()
    }
}

/// Gossip message id: SHA256 of the payload.
///
/// Two bridges publishing the same round produce the same id, so the mesh
/// carries each round once no matter how many bridges feed it.
pub fn content_message_id(message: &gossipsub::Message) -> gossipsub::MessageId {
    gossipsub::MessageId::from(Sha256::digest(&message.data).to_vec())
}

/// Create the GossipSub configuration for round topics.
///
/// Messages are held until the host reports a validation result, which is
/// what lets topic validators stop bad rounds from being forwarded.
pub fn create_gossipsub_config(config: &TransportConfig) -> Result<gossipsub::Config, TransportError> {
    gossipsub::ConfigBuilder::default()
        .heartbeat_interval(Duration::from_millis(config.heartbeat_interval_ms))
        .validation_mode(gossipsub::ValidationMode::Strict)
        .validate_messages()
        .message_id_fn(content_message_id)
        .max_transmit_size(config.max_transmit_size)
        .build()
        .map_err(|e| TransportError::Build(format!("gossipsub config: {:?}", e)))
}

/// Create identify configuration for the relay.
pub fn create_identify_config(local_public_key: libp2p::identity::PublicKey) -> identify::Config {
    identify::Config::new(IDENTIFY_PROTOCOL.to_string(), local_public_key)
}
