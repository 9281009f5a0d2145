//! Engine configuration
//!
//! Loaded from a TOML file; every field has a default so an empty or
//! missing file is a valid configuration.
//!
//! ```toml
//! data_dir = "/home/alice/.masq/data"
//! handshake_timeout_secs = 60
//! device_name = "laptop"
//!
//! [kdf]
//! memory_kib = 19456
//! iterations = 2
//! parallelism = 1
//!
//! [network]
//! bootstrap_peers = ["<64 hex chars>"]
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use iroh::EndpointId;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::crypto::KdfParams;
use crate::error::{MasqError, MasqResult};

fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".masq")
        .join("data")
}

fn default_handshake_timeout_secs() -> u64 {
    60
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MasqConfig {
    /// Directory holding the vault database
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// How long pairing and app handshakes wait for the other side
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,

    /// Name given to this device's record when it joins a profile by pull
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,

    /// Password KDF cost for new profiles
    #[serde(default)]
    pub kdf: KdfParams,

    #[serde(default)]
    pub network: NetworkConfig,
}

impl Default for MasqConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            handshake_timeout_secs: default_handshake_timeout_secs(),
            device_name: None,
            kdf: KdfParams::default(),
            network: NetworkConfig::default(),
        }
    }
}

/// Peer-to-peer settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Endpoint ids dialed for every channel (hex)
    #[serde(default)]
    pub bootstrap_peers: Vec<String>,
}

impl MasqConfig {
    /// Configuration rooted at `data_dir` with defaults elsewhere.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    /// Load from `path`; a missing file yields the defaults.
    pub fn load(path: &Path) -> MasqResult<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }
        Self::from_file(path)
    }

    pub fn from_file(path: &Path) -> MasqResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> MasqResult<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| MasqError::Config(format!("Invalid config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> MasqResult<String> {
        toml::to_string_pretty(self)
            .map_err(|e| MasqError::Config(format!("Failed to serialize config: {}", e)))
    }

    pub fn validate(&self) -> MasqResult<()> {
        if self.handshake_timeout_secs == 0 {
            return Err(MasqError::Config(
                "handshake_timeout_secs must be positive".to_string(),
            ));
        }
        self.bootstrap_peers()?;
        Ok(())
    }

    /// Default location of the config file.
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".masq")
            .join("config.toml")
    }

    /// Path of the vault database file.
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("masq.redb")
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn bootstrap_peers(&self) -> MasqResult<Vec<EndpointId>> {
        self.network
            .bootstrap_peers
            .iter()
            .map(|s| {
                s.parse::<EndpointId>()
                    .map_err(|e| MasqError::Config(format!("Invalid bootstrap peer {}: {}", s, e)))
            })
            .collect()
    }
}
