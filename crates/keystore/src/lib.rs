//! CircuitCraft Keystore
//!
//! Node identity storage and path utilities shared by the CircuitCraft apps.
//!
//! ## Features
//!
//! - libp2p Ed25519 keypair loading/generation (protobuf encoding on disk)
//! - Path expansion (`~`)
//! - Platform config directory lookup

mod keypair;
mod paths;

pub use keypair::{default_key_path, load_or_generate_keypair, save_keypair};
pub use paths::{default_config_dir, default_keystore_dir, expand_path};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum KeystoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid key file {path}: {reason}")]
    Decode { path: String, reason: String },

    #[error("Failed to encode keypair: {0}")]
    Encode(String),
}

pub type Result<T> = std::result::Result<T, KeystoreError>;
