//! Construction-time failures of the transport layer.

use std::path::PathBuf;
use thiserror::Error;

/// Local storage failures: identity key and peer datastore.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Failed to access {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Identity key at {} is corrupt: {reason}", .path.display())]
    CorruptIdentity { path: PathBuf, reason: String },

    #[error("Peer datastore at {} is corrupt: {reason}", .path.display())]
    CorruptDatastore { path: PathBuf, reason: String },
}

/// Network-side failures: building the host, binding, bootstrapping, gossip.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Invalid multiaddress {addr}: {reason}")]
    InvalidAddress { addr: String, reason: String },

    #[error("Failed to build libp2p host: {0}")]
    Build(String),

    #[error("Cannot listen on {addr}: {reason}")]
    Listen { addr: String, reason: String },

    #[error("None of the {attempted} bootstrap peers could be reached")]
    BootstrapUnreachable { attempted: usize },

    #[error("Failed to subscribe to topic {topic}: {reason}")]
    Subscribe { topic: String, reason: String },

    #[error("Failed to publish on topic {topic}: {reason}")]
    Publish { topic: String, reason: String },

    #[error("Host is shut down")]
    Closed,
}
