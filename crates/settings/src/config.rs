//! Settings file

use std::path::{Path, PathBuf};

use circuitcraft_core::CircuitCraftConfig;
use circuitcraft_keystore::{default_key_path, expand_path};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{default_settings_path, Result, SettingsError};

/// Main settings structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Network, relay, dialer and circuit configuration
    #[serde(flatten)]
    pub config: CircuitCraftConfig,

    #[serde(default)]
    pub identity: IdentitySettings,

    /// Custom settings file path (not serialized)
    #[serde(skip)]
    config_path: Option<PathBuf>,
}

impl Settings {
    /// Load settings from the default path, or create defaults
    pub fn load_or_default() -> Result<Self> {
        Self::load_from(&default_settings_path())
    }

    /// Load settings from a specific path, or create defaults
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut settings = if path.exists() {
            let content = std::fs::read_to_string(path).map_err(SettingsError::ReadError)?;
            let settings: Settings = serde_json::from_str(&content).map_err(SettingsError::ParseError)?;
            info!("Loaded settings from {:?}", path);
            settings
        } else {
            Self::default()
        };
        settings.config_path = Some(path.to_path_buf());
        Ok(settings)
    }

    /// Save settings to the path they were loaded from (or the default)
    pub fn save(&self) -> Result<()> {
        let path = self.config_path.clone().unwrap_or_else(default_settings_path);
        self.save_to(&path)
    }

    /// Save settings to a specific path
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(SettingsError::CreateDirError)?;
            }
        }

        let content = serde_json::to_string_pretty(self).map_err(SettingsError::ParseError)?;
        std::fs::write(path, content).map_err(SettingsError::WriteError)?;
        info!("Saved settings to {:?}", path);
        Ok(())
    }

    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }
}

/// Where the node identity lives
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IdentitySettings {
    /// Keyfile path; `~` is expanded
    #[serde(default)]
    pub keyfile: Option<String>,
}

impl IdentitySettings {
    pub fn key_path(&self) -> PathBuf {
        self.keyfile
            .as_deref()
            .map(expand_path)
            .unwrap_or_else(default_key_path)
    }
}
