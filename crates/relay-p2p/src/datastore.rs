//! Peer datastore kept in the relay's data directory.
//!
//! Remembers addresses of peers this node successfully dialed so a restarted
//! node can rejoin the mesh even when its configured bootstrap peers are gone.
//! Entries are hints only: they are dialed best-effort and never count toward
//! bootstrap success.

use crate::error::StorageError;
use libp2p::Multiaddr;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// File name of the peer cache inside the data directory.
pub const PEERS_FILE: &str = "peers.json";

/// Upper bound on remembered peer addresses.
pub const MAX_KNOWN_PEERS: usize = 64;

#[derive(Default, Serialize, Deserialize)]
struct PeerRecords {
    peers: Vec<String>,
}

pub struct Datastore {
    dir: PathBuf,
    peers: BTreeSet<String>,
    dirty: bool,
}

impl Datastore {
    /// Open (creating if needed) the datastore under `dir`.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StorageError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|source| StorageError::Io {
            path: dir.clone(),
            source,
        })?;

        let file = dir.join(PEERS_FILE);
        let peers = match fs::read(&file) {
            Ok(bytes) => {
                let records: PeerRecords =
                    serde_json::from_slice(&bytes).map_err(|e| StorageError::CorruptDatastore {
                        path: file.clone(),
                        reason: e.to_string(),
                    })?;
                records.peers.into_iter().collect()
            }
            Err(e) if e.kind() == ErrorKind::NotFound => BTreeSet::new(),
            Err(source) => return Err(StorageError::Io { path: file, source }),
        };

        debug!(dir = %dir.display(), known = peers.len(), "opened peer datastore");
        Ok(Self {
            dir,
            peers,
            dirty: false,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Remembered peer addresses. Entries that no longer parse are skipped.
    pub fn known_peers(&self) -> Vec<Multiaddr> {
        self.peers
            .iter()
            .filter_map(|s| match s.parse::<Multiaddr>() {
                Ok(addr) => Some(addr),
                Err(e) => {
                    warn!(addr = %s, error = %e, "skipping unparsable cached peer");
                    None
                }
            })
            .collect()
    }

    /// Remember a dialable peer address.
    pub fn record_peer(&mut self, addr: &Multiaddr) {
        if self.peers.len() >= MAX_KNOWN_PEERS {
            return;
        }
        if self.peers.insert(addr.to_string()) {
            self.dirty = true;
        }
    }

    /// Write the peer cache if anything changed since the last flush.
    pub fn flush(&mut self) -> Result<(), StorageError> {
        if !self.dirty {
            return Ok(());
        }
        let file = self.dir.join(PEERS_FILE);
        let tmp = self.dir.join(format!("{}.tmp", PEERS_FILE));
        let records = PeerRecords {
            peers: self.peers.iter().cloned().collect(),
        };
        let bytes = serde_json::to_vec_pretty(&records).map_err(|e| {
            StorageError::CorruptDatastore {
                path: file.clone(),
                reason: e.to_string(),
            }
        })?;

        fs::write(&tmp, bytes).map_err(|source| StorageError::Io {
            path: tmp.clone(),
            source,
        })?;
        fs::rename(&tmp, &file).map_err(|source| StorageError::Io {
            path: file.clone(),
            source,
        })?;
        self.dirty = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer_addr() -> Multiaddr {
        let peer_id = libp2p::identity::Keypair::generate_ed25519()
            .public()
            .to_peer_id();
        format!("/ip4/127.0.0.1/tcp/4001/p2p/{}", peer_id)
            .parse()
            .unwrap()
    }

    #[test]
    fn test_datastore_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let addr = peer_addr();

        let mut store = Datastore::open(dir.path()).unwrap();
        assert!(store.known_peers().is_empty());
        store.record_peer(&addr);
        store.record_peer(&addr);
        store.flush().unwrap();

        let reopened = Datastore::open(dir.path()).unwrap();
        assert_eq!(reopened.known_peers(), vec![addr]);
    }

    #[test]
    fn test_datastore_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a").join("b");
        let store = Datastore::open(&nested).unwrap();
        assert!(nested.is_dir());
        assert_eq!(store.dir(), nested.as_path());
    }

    #[test]
    fn test_corrupt_datastore_rejected() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(PEERS_FILE), b"{ nope").unwrap();
        assert!(matches!(
            Datastore::open(dir.path()),
            Err(StorageError::CorruptDatastore { .. })
        ));
    }

    #[test]
    fn test_unparsable_entries_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let json = format!(r#"{{"peers":["garbage","{}"]}}"#, peer_addr());
        fs::write(dir.path().join(PEERS_FILE), json).unwrap();

        let store = Datastore::open(dir.path()).unwrap();
        assert_eq!(store.known_peers().len(), 1);
    }

    #[test]
    fn test_clean_flush_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = Datastore::open(dir.path()).unwrap();
        store.flush().unwrap();
        assert!(!dir.path().join(PEERS_FILE).exists());
    }
}
