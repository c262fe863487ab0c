//! libp2p keypair persistence

use std::fs;
use std::path::{Path, PathBuf};

use libp2p::identity::Keypair;
use tracing::info;

use crate::paths::default_keystore_dir;
use crate::{KeystoreError, Result};

/// Default location of the node identity
pub fn default_key_path() -> PathBuf {
    default_keystore_dir().join("node.key")
}

/// Load the keypair at `path`, generating and saving a fresh Ed25519 key if
/// the file does not exist.
pub fn load_or_generate_keypair(path: &Path) -> Result<Keypair> {
    if path.exists() {
        let bytes = fs::read(path)?;
        let keypair = Keypair::from_protobuf_encoding(&bytes).map_err(|e| KeystoreError::Decode {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        info!("Loaded identity {} from {:?}", keypair.public().to_peer_id(), path);
        return Ok(keypair);
    }

    let keypair = Keypair::generate_ed25519();
    save_keypair(&keypair, path)?;
    info!("Generated identity {} at {:?}", keypair.public().to_peer_id(), path);
    Ok(keypair)
}

/// Write `keypair` to `path`, owner-readable only on unix
pub fn save_keypair(keypair: &Keypair, path: &Path) -> Result<()> {
    let bytes = keypair
        .to_protobuf_encoding()
        .map_err(|e| KeystoreError::Encode(e.to_string()))?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    fs::write(path, bytes)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}
