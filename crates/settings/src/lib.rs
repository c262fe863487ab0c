//! CircuitCraft Settings
//!
//! Persistent configuration for the CircuitCraft apps.
//!
//! ## Features
//!
//! - Network, relay, dialer and circuit settings (see [`CircuitCraftConfig`])
//! - Node identity location
//! - Cross-platform config file storage
//! - JSON serialization
//!
//! ## Usage
//!
//! ```no_run
//! use circuitcraft_settings::Settings;
//!
//! // Load or create default settings
//! let mut settings = Settings::load_or_default()?;
//!
//! // Serve circuits for other peers
//! settings.config.relay.enabled = true;
//!
//! // Save settings
//! settings.save()?;
//! # Ok::<(), circuitcraft_settings::SettingsError>(())
//! ```

mod config;

pub use circuitcraft_core::CircuitCraftConfig;
pub use config::{IdentitySettings, Settings};

use std::path::PathBuf;

use circuitcraft_keystore::default_config_dir;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("Failed to read settings: {0}")]
    ReadError(std::io::Error),

    #[error("Failed to write settings: {0}")]
    WriteError(std::io::Error),

    #[error("Failed to parse settings: {0}")]
    ParseError(serde_json::Error),

    #[error("Failed to create config directory: {0}")]
    CreateDirError(std::io::Error),
}

pub type Result<T> = std::result::Result<T, SettingsError>;

/// Get the default settings file path
pub fn default_settings_path() -> PathBuf {
    default_config_dir().join("settings.json")
}
