//! Configuration management for Plugrun.
//!
//! Handles loading and saving configuration from TOML files.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::plugin::debounce::DEFAULT_UPDATE_DEBOUNCE;
use crate::plugin::repository::default_repositories;
use crate::plugin::{ManagerOptions, Repository};

/// Application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Runtime settings
    pub runtime: RuntimeConfig,

    /// Repositories always offered in the repository list
    pub repositories: RepositoriesConfig,

    /// Where documents are persisted
    pub storage: StorageConfig,

    /// HTTP client settings
    pub http: HttpConfig,
}

/// Plugin runtime settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Seconds to wait for a sandbox handshake
    pub connect_timeout_secs: u64,

    /// Quiet period before an operation update runs, in milliseconds
    pub update_debounce_ms: u64,

    /// Workspace selected when none has been chosen
    pub default_workspace: String,
}

/// Repository list settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RepositoriesConfig {
    /// Merged into the stored repository list on load
    pub defaults: Vec<Repository>,
}

/// Storage settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Data directory (supports `~` and environment variables)
    pub data_dir: Option<String>,
}

/// HTTP client settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Request timeout in seconds
    pub timeout_secs: u64,

    /// User agent sent with every request
    pub user_agent: String,
}

impl Config {
    /// Load configuration from the default location.
    ///
    /// Looks for config in:
    /// 1. `.plugrun.toml` in current directory
    /// 2. `~/.config/plugrun/config.toml`
    /// 3. Falls back to defaults
    pub fn load() -> anyhow::Result<Self> {
        let local_config = PathBuf::from(".plugrun.toml");
        if local_config.exists() {
            return Self::load_from_file(&local_config);
        }

        if let Some(config_dir) = Self::config_dir() {
            let global_config = config_dir.join("config.toml");
            if global_config.exists() {
                return Self::load_from_file(&global_config);
            }
        }

        Ok(Self::default())
    }

    /// Load configuration from a specific file.
    pub fn load_from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Invalid config file {}: {e}", path.display()))?;
        Ok(config)
    }

    /// Save configuration to the global config file.
    pub fn save(&self) -> anyhow::Result<PathBuf> {
        let dir = Self::config_dir().ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        std::fs::create_dir_all(&dir)?;

        let config_path = dir.join("config.toml");
        std::fs::write(&config_path, toml::to_string_pretty(self)?)?;
        Ok(config_path)
    }

    /// Get the config directory path.
    pub fn config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("plugrun"))
    }

    /// Resolved data directory: the configured one, else the platform default.
    pub fn data_dir(&self) -> anyhow::Result<PathBuf> {
        match self.storage.data_dir {
            Some(ref dir) => {
                let expanded = shellexpand::full(dir)
                    .map_err(|e| anyhow::anyhow!("Invalid data directory {dir}: {e}"))?;
                Ok(PathBuf::from(expanded.as_ref()))
            }
            None => dirs::data_dir()
                .map(|d| d.join("plugrun"))
                .ok_or_else(|| anyhow::anyhow!("Could not determine data directory")),
        }
    }

    /// Options for the plugin manager.
    pub fn manager_options(&self) -> ManagerOptions {
        ManagerOptions {
            connect_timeout: Duration::from_secs(self.runtime.connect_timeout_secs),
            update_debounce: Duration::from_millis(self.runtime.update_debounce_ms),
            default_workspace: self.runtime.default_workspace.clone(),
            default_repositories: self.repositories.defaults.clone(),
        }
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http.timeout_secs)
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 30,
            update_debounce_ms: DEFAULT_UPDATE_DEBOUNCE.as_millis() as u64,
            default_workspace: "default".to_string(),
        }
    }
}

impl Default for RepositoriesConfig {
    fn default() -> Self {
        Self { defaults: default_repositories() }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { data_dir: None }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self { timeout_secs: 30, user_agent: format!("plugrun/{}", env!("CARGO_PKG_VERSION")) }
    }
}
