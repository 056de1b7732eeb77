//! Construction-time errors of the bridge and client.
//!
//! Steady-state failures never show up here: source outages are retried by
//! the bridge and invalid gossip is dropped by the client.

use relay_p2p::{StorageError, TransportError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

pub type Result<T> = std::result::Result<T, Error>;
