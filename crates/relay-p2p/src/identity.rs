//! Persistent libp2p identity.
//!
//! The relay's peer id must survive restarts so that other nodes can keep it
//! in their bootstrap lists. The key is stored protobuf-encoded, as libp2p
//! itself encodes keypairs.

use crate::error::StorageError;
use libp2p::identity::Keypair;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use tracing::info;

/// Load the keypair at `path`, or generate an Ed25519 keypair and persist it there.
pub fn load_or_create_identity(path: &Path) -> Result<Keypair, StorageError> {
    match fs::read(path) {
        Ok(bytes) => {
            let keypair = Keypair::from_protobuf_encoding(&bytes).map_err(|e| {
                StorageError::CorruptIdentity {
                    path: path.to_path_buf(),
                    reason: e.to_string(),
                }
            })?;
            info!(
                peer_id = %keypair.public().to_peer_id(),
                path = %path.display(),
                "loaded relay identity"
            );
            Ok(keypair)
        }
        Err(e) if e.kind() == ErrorKind::NotFound => create_identity(path),
        Err(source) => Err(StorageError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

fn create_identity(path: &Path) -> Result<Keypair, StorageError> {
    let io_err = |source| StorageError::Io {
        path: path.to_path_buf(),
        source,
    };

    let keypair = Keypair::generate_ed25519();
    let bytes = keypair
        .to_protobuf_encoding()
        .map_err(|e| StorageError::CorruptIdentity {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
    }
    fs::write(path, bytes).map_err(io_err)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(io_err)?;
    }

    info!(
        peer_id = %keypair.public().to_peer_id(),
        path = %path.display(),
        "generated new relay identity"
    );
    Ok(keypair)
}
