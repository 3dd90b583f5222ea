//! Application settings, stored as TOML under the user config directory.

use crate::input::{KeyMap, PointerSettings};
use crate::lifecycle::LifecycleSettings;
use crate::transport::TransportParams;
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const CONFIG_DIR: &str = "padpilot";
const CONFIG_FILE: &str = "config.toml";

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct CommandDirs {
    pub scripted_dir: PathBuf,
    pub hardware_dir: PathBuf,
}

impl Default for CommandDirs {
    fn default() -> Self {
        let base = base_dir();
        Self {
            scripted_dir: base.join("commands"),
            hardware_dir: base.join("mcu_commands"),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub serial: TransportParams,
    pub commands: CommandDirs,
    pub lifecycle: LifecycleSettings,
    pub keyboard: KeyMap,
    pub pointer: PointerSettings,
}

fn base_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| {
            warn!("Could not determine config directory, using current directory");
            PathBuf::from(".")
        })
        .join(CONFIG_DIR)
}

impl AppConfig {
    pub fn default_path() -> PathBuf {
        base_dir().join(CONFIG_FILE)
    }

    /// Writes the defaults to `path` unless a file is already there.
    pub async fn ensure_default(path: &Path) -> Result<()> {
        if tokio::fs::try_exists(path)
            .await
            .map_err(|e| eyre!("Failed to check config file {}: {}", path.display(), e))?
        {
            return Ok(());
        }

        info!("Creating default configuration at {}", path.display());
        AppConfig::default().save(path).await
    }

    /// Reads `path`, falling back to the defaults if it does not exist.
    pub async fn load(path: &Path) -> Result<Self> {
        if !tokio::fs::try_exists(path)
            .await
            .map_err(|e| eyre!("Failed to check config file {}: {}", path.display(), e))?
        {
            debug!("No config at {}, using defaults", path.display());
            return Ok(AppConfig::default());
        }

        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;
        let config = toml::from_str(&content)
            .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;
        debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| eyre!("Failed to create config directory: {}", e))?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| eyre!("Failed to serialize config: {}", e))?;
        tokio::fs::write(path, content)
            .await
            .map_err(|e| eyre!("Failed to write config file {}: {}", path.display(), e))?;
        debug!("Saved config to {}", path.display());
        Ok(())
    }

    /// Remembers the port that was just opened successfully.
    pub async fn remember_serial(&mut self, params: &TransportParams, path: &Path) -> Result<()> {
        if &self.serial == params {
            return Ok(());
        }
        self.serial = params.clone();
        self.save(path).await
    }
}
