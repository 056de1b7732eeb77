//! # Relay P2P
//!
//! Peer-to-peer layer of the beacon relay. Builds a libp2p host over TCP with
//! Noise and Yamux, and exposes GossipSub topics as a small pub/sub API.
//!
//! ## Architecture
//!
//! - One tokio task owns the swarm; `Host`, `PubSub` and `Topic` are handles
//!   that talk to it over a command channel
//! - The node identity and a cache of known peers live on disk
//! - Topic validators run inside the swarm task, before a message is
//!   delivered locally or forwarded to the mesh
//!
//! ## Trust Model
//!
//! The P2P layer trusts NOTHING. Peers can:
//! - Send invalid rounds: rejected by the topic validator, and repeat
//!   offenders are disconnected
//! - Replay old rounds: content-addressed message ids collapse duplicates,
//!   and round ordering is enforced above this layer
//! - Go away: bootstrap peers are redialled while the host is isolated
//!
//! Bootstrap peers are trusted ONLY for peer introductions, never for data.

pub mod behaviour;
pub mod bootstrap;
pub mod datastore;
mod driver;
pub mod error;
pub mod identity;
pub mod pubsub;
pub mod topic;
pub mod transport;

pub use behaviour::{content_message_id, PeerScore, RelayBehaviour};
pub use bootstrap::{BootstrapPhase, BootstrapState};
pub use datastore::Datastore;
pub use error::{StorageError, TransportError};
pub use identity::load_or_create_identity;
pub use pubsub::{PubSub, Subscription, Topic, TopicValidator};
pub use topic::{chain_from_topic, topic_name, GossipMessage, GossipStats, TOPIC_PREFIX};
pub use transport::{construct_host, parse_multiaddr, Host, TransportConfig};

pub use libp2p::{Multiaddr, PeerId};
