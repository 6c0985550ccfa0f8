//! Application configuration
//!
//! Configuration is loaded once, at construction, from:
//! 1. Default values
//! 2. Config file (~/.config/depot/config.toml)
//! 3. Environment variables (DEPOT_* prefix)
//!
//! Environment variables take precedence over config file values.
//! There is no hot reload.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::backend::BackendKind;
use crate::model::{CollectionOverride, Registry};

/// Environment variable prefix
const ENV_PREFIX: &str = "DEPOT";

/// Name of the structured data file inside `data_dir`
const DATA_FILE: &str = "depot.json";

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding the data file
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Remote document store URL (optional)
    #[serde(default)]
    pub connection_string: Option<String>,

    /// Force a backend regardless of the connection string
    #[serde(default)]
    pub backend: Option<BackendKind>,

    /// Database (namespace) name on the remote store
    #[serde(default = "default_database")]
    pub database: String,

    /// API key sent to the remote store
    #[serde(default)]
    pub api_key: Option<String>,

    /// Upper bound on the remote connection check during initialization
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Seed default users and bins into a fresh local data file
    #[serde(default = "default_true")]
    pub seed_defaults: bool,

    #[serde(default)]
    pub sync: SyncConfig,

    #[serde(default)]
    pub retention: RetentionConfig,

    /// Per-collection overrides of key field, write policy and durability
    #[serde(default)]
    pub collections: BTreeMap<String, CollectionOverride>,
}

/// Flush timing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Quiet period after the last write before a flush
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    /// Interval of the unconditional full flush
    #[serde(default = "default_full_sync_interval_secs")]
    pub full_sync_interval_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
            full_sync_interval_secs: default_full_sync_interval_secs(),
        }
    }
}

impl SyncConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn full_sync_interval(&self) -> Duration {
        Duration::from_secs(self.full_sync_interval_secs)
    }
}

/// Maximum entries kept per append log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Per driver
    #[serde(default = "default_driver_messages")]
    pub driver_messages: usize,
    #[serde(default = "default_chat_audit")]
    pub chat_audit: usize,
    #[serde(default = "default_client_errors")]
    pub client_errors: usize,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            driver_messages: default_driver_messages(),
            chat_audit: default_chat_audit(),
            client_errors: default_client_errors(),
        }
    }
}

/// Remote document store settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteConfig {
    pub url: String,
    pub database: String,
    pub api_key: Option<String>,
    pub connect_timeout: Duration,
}

/// Backend chosen once from configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendConfig {
    Remote(RemoteConfig),
    Local(PathBuf),
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            connection_string: None,
            backend: None,
            database: default_database(),
            api_key: None,
            connect_timeout_ms: default_connect_timeout_ms(),
            seed_defaults: true,
            sync: SyncConfig::default(),
            retention: RetentionConfig::default(),
            collections: BTreeMap::new(),
        }
    }
}

impl Config {
    /// Load configuration from default location and environment
    ///
    /// Order of precedence (highest to lowest):
    /// 1. Environment variables (DEPOT_DATA_DIR, DEPOT_CONNECTION_STRING, ...)
    /// 2. Config file (~/.config/depot/config.toml or DEPOT_CONFIG)
    /// 3. Default values
    pub fn load() -> Result<Self> {
        Self::load_from_path(&Self::config_file_path())
    }

    /// Load configuration from a specific path
    ///
    /// Environment variables are still applied as overrides.
    /// If the file doesn't exist, defaults are used.
    pub fn load_from_path(path: &PathBuf) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {:?}", path))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        config.ensure_data_dir()?;
        Ok(config)
    }

    /// Load configuration from a TOML string (useful for testing)
    pub fn load_from_str(toml_content: &str) -> Result<Self> {
        let mut config: Config =
            toml::from_str(toml_content).context("Failed to parse config TOML")?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Defaults rooted at `data_dir`, ignoring file and environment
    pub fn for_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var(format!("{}_DATA_DIR", ENV_PREFIX)) {
            self.data_dir = PathBuf::from(val);
        }

        if let Ok(val) = std::env::var(format!("{}_CONNECTION_STRING", ENV_PREFIX)) {
            self.connection_string = if val.is_empty() { None } else { Some(val) };
        }

        if let Ok(val) = std::env::var(format!("{}_BACKEND", ENV_PREFIX)) {
            self.backend = match val.to_ascii_lowercase().as_str() {
                "remote" => Some(BackendKind::Remote),
                "local" => Some(BackendKind::Local),
                "" => None,
                other => {
                    warn!("Ignoring unknown {}_BACKEND value '{}'", ENV_PREFIX, other);
                    self.backend
                }
            };
        }

        if let Ok(val) = std::env::var(format!("{}_DATABASE", ENV_PREFIX)) {
            if !val.is_empty() {
                self.database = val;
            }
        }

        if let Ok(val) = std::env::var(format!("{}_API_KEY", ENV_PREFIX)) {
            self.api_key = if val.is_empty() { None } else { Some(val) };
        }
    }

    /// Ensure data directory exists
    fn ensure_data_dir(&self) -> Result<()> {
        if !self.data_dir.exists() {
            std::fs::create_dir_all(&self.data_dir)
                .with_context(|| format!("Failed to create data directory: {:?}", self.data_dir))?;
        }
        Ok(())
    }

    /// Get the config file path
    ///
    /// Can be overridden with DEPOT_CONFIG environment variable
    pub fn config_file_path() -> PathBuf {
        if let Ok(path) = std::env::var(format!("{}_CONFIG", ENV_PREFIX)) {
            return PathBuf::from(path);
        }

        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("depot")
            .join("config.toml")
    }

    /// Path of the structured data file (local backend and backup target)
    pub fn data_path(&self) -> PathBuf {
        self.data_dir.join(DATA_FILE)
    }

    /// Key registry with this configuration's overrides applied
    pub fn registry(&self) -> Registry {
        Registry::with_overrides(&self.collections)
    }

    /// Resolve which backend to use
    ///
    /// An explicit override wins. Without one, an http(s) connection string
    /// selects the remote store and anything else the local file.
    pub fn backend_config(&self) -> BackendConfig {
        let url = self
            .connection_string
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty());

        let remote = |url: &str| {
            BackendConfig::Remote(RemoteConfig {
                url: url.trim_end_matches('/').to_string(),
                database: self.database.clone(),
                api_key: self.api_key.clone(),
                connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            })
        };

        match (self.backend, url) {
            (Some(BackendKind::Local), _) => BackendConfig::Local(self.data_path()),
            (Some(BackendKind::Remote), Some(url)) => remote(url),
            (Some(BackendKind::Remote), None) => {
                warn!("Remote backend requested without a connection string, using local file");
                BackendConfig::Local(self.data_path())
            }
            (None, Some(url)) if url.starts_with("http://") || url.starts_with("https://") => {
                remote(url)
            }
            (None, _) => BackendConfig::Local(self.data_path()),
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("depot")
}

fn default_database() -> String {
    "depot".to_string()
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_true() -> bool {
    true
}

fn default_debounce_ms() -> u64 {
    5_000
}

fn default_full_sync_interval_secs() -> u64 {
    300
}

fn default_driver_messages() -> usize {
    500
}

fn default_chat_audit() -> usize {
    1_000
}

fn default_client_errors() -> usize {
    500
}
