//! Topic naming and gossip message types.
//!
//! Every bridge and client of a chain derives the same topic name from the
//! chain identifier, so independently started nodes rendezvous without any
//! directory lookup.
//!
//! Received messages are raw bytes. This module does NOT interpret or trust
//! any data. Decoding and validation belong to the caller.

use libp2p::PeerId;
use serde::{Deserialize, Serialize};

/// Prefix shared by all round topics.
pub const TOPIC_PREFIX: &str = "/beacon-relay/pubsub/v0.0.0/";

/// The topic name for a chain.
///
/// Format: /beacon-relay/pubsub/v0.0.0/{chain_id}
pub fn topic_name(chain_id: &str) -> String {
    format!("{}{}", TOPIC_PREFIX, chain_id)
}

/// The chain identifier a topic name belongs to, if it is a round topic.
pub fn chain_from_topic(topic: &str) -> Option<&str> {
    topic
        .strip_prefix(TOPIC_PREFIX)
        .filter(|chain| !chain.is_empty())
}

/// A message received on a round topic that passed the topic validator.
#[derive(Clone, Debug)]
pub struct GossipMessage {
    /// The topic this message was received on.
    pub topic: String,
    /// The raw message bytes.
    pub data: Vec<u8>,
    /// The peer that originally published the message.
    pub source_peer: Option<PeerId>,
    /// The peer that propagated this message to us.
    pub propagation_peer: PeerId,
    /// Content-addressed message id.
    pub message_id: Vec<u8>,
}

/// Statistics about gossip message processing.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GossipStats {
    /// Total messages received on the topic.
    pub messages_received: u64,
    /// Messages that decoded and verified.
    pub messages_valid: u64,
    /// Messages that failed decoding, format or signature checks.
    pub messages_invalid: u64,
    /// Valid messages at or below the last accepted round.
    pub messages_duplicate: u64,
    /// Rounds handed to watcher channels (counted per watcher).
    pub rounds_delivered: u64,
    /// Rounds dropped because a watcher's buffer was full.
    pub rounds_dropped: u64,
}

impl GossipStats {
    /// Log a summary of gossip statistics.
    pub fn summary(&self) -> String {
        format!(
            "Gossip: {} received ({} valid, {} invalid, {} duplicate) | {} delivered, {} dropped",
            self.messages_received,
            self.messages_valid,
            self.messages_invalid,
            self.messages_duplicate,
            self.rounds_delivered,
            self.rounds_dropped,
        )
    }
}
