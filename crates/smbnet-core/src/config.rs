//! Configuration for the SMB network filesystem
//!
//! Supports TOML configuration files with sensible defaults.
//! Configuration is loaded from:
//! - macOS: ~/Library/Application Support/org.smbnet.smbnet/config.toml
//! - Linux: ~/.config/smbnet/config.toml

use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Mount settings
    pub mount: MountConfig,
    /// Discovery scan settings
    pub scan: ScanConfig,
    /// Remote client settings
    pub remote: RemoteConfig,
}

/// Mount configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MountConfig {
    /// Default mount point (optional)
    pub mount_point: Option<PathBuf>,
    /// Volume name reported to the host
    pub volume_name: String,
    /// Reject every write to shares
    pub read_only: bool,
    /// Attribute and entry TTL in seconds
    pub attr_ttl_secs: u64,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            mount_point: None,
            volume_name: "SMB Network".into(),
            read_only: false,
            attr_ttl_secs: crate::DEFAULT_ATTR_TTL_SECS,
        }
    }
}

/// Discovery scan configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Minimum time between the last finished scan and a new scan request
    pub request_interval_secs: u64,
    /// Minimum time between two scans performed by the scanner
    pub scan_interval_secs: u64,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            request_interval_secs: 5,
            scan_interval_secs: 10,
        }
    }
}

impl ScanConfig {
    pub fn request_interval(&self) -> Duration {
        Duration::from_secs(self.request_interval_secs)
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs)
    }
}

/// Remote client configuration
///
/// The simulated network served by `smbnet-mount` only checks `username`
/// against each share's user list; the other fields are for a protocol
/// client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub username: String,
    pub password: String,
    /// Workgroup to authenticate against (client default if None)
    pub workgroup: Option<String>,
    /// Verbosity of the remote client's own logging
    pub debug_level: u8,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            username: "guest".into(),
            password: String::new(),
            workgroup: None,
            debug_level: 0,
        }
    }
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Self {
        match Self::default_path() {
            Some(path) => Self::load_from(&path).unwrap_or_else(|e| {
                warn!("Failed to load config from {:?}: {}, using defaults", path, e);
                Self::default()
            }),
            None => {
                debug!("No config directory found, using defaults");
                Self::default()
            }
        }
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            debug!("Config file {:?} not found, using defaults", path);
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;

        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;

        info!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Save configuration to a specific path
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Io(e.to_string()))?;
        }

        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))?;

        std::fs::write(path, content).map_err(|e| ConfigError::Io(e.to_string()))?;

        info!("Saved config to {:?}", path);
        Ok(())
    }

    /// Get the default config file path
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("org", "smbnet", "smbnet")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Generate a sample configuration file content
    pub fn sample() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_else(|_| String::new())
    }
}

/// Configuration errors
#[derive(Debug, Clone)]
pub enum ConfigError {
    /// I/O error
    Io(String),
    /// Parse error
    Parse(String),
    /// Serialization error
    Serialize(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "I/O error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Serialize(e) => write!(f, "Serialization error: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}
