//! # Relay Gossip
//!
//! Relays randomness beacon rounds from a source service to many consumers
//! over libp2p gossipsub.
//!
//! - [`GossipRelayNode`] (the bridge) streams rounds from a [`BeaconSource`],
//!   validates them and publishes each new round on the chain's topic.
//! - [`Client`] subscribes to that topic and hands validated rounds to any
//!   number of watchers, each through its own channel.
//!
//! Both ends validate independently with `relay-core`: a round is delivered
//! only if it is well-formed, signed by the chain's group key and newer than
//! everything accepted before it.

pub mod backoff;
pub mod bridge;
pub mod client;
pub mod config;
pub mod error;
pub mod source;

pub use backoff::Backoff;
pub use bridge::{BridgeState, GossipRelayNode};
pub use client::Client;
pub use config::{BackoffConfig, ClientConfig, GossipRelayConfig, SourceConfig};
pub use error::{Error, Result};
pub use source::{BeaconSource, HttpSource, RoundStream, SourceError};

pub use relay_core::{ChainInfo, Round};
pub use relay_p2p::{topic_name, Multiaddr, PubSub, TransportConfig};
