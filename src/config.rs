//! Configuration loaded from YAML.
//!
//! Tokens and CDM credentials are passed explicitly into the clients built
//! from this struct; nothing reads them from global state.
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::vault::FileKeyVault;

/// Top-level configuration.
///
/// ```yaml
/// access_token: eyJh...
/// media_user_token: Ag...
/// vault_path: /srv/wvkeys/keys.json
/// timeout_secs: 30
/// workers: 4
/// cdm:
///   host: http://127.0.0.1:8786
///   secret: some-secret
///   device: my_device
///   system_id: 4464
///   security_level: 3
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Bearer token for the catalog and playback endpoints.
    pub access_token: String,
    /// Subscription token sent as `media-user-token`.
    pub media_user_token: String,
    /// Key vault file; defaults to the user's data directory.
    #[serde(default)]
    pub vault_path: Option<PathBuf>,
    /// Per-request timeout in seconds, applied to every license round.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Number of items acquired in parallel.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Remote CDM connection.
    pub cdm: RemoteCdmConfig,
}

/// Connection details for a pywidevine serve-compatible remote CDM.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteCdmConfig {
    pub host: String,
    pub secret: String,
    /// Device name as exposed by the server (file stem of the .wvd).
    pub device: String,
    pub system_id: u32,
    pub security_level: u8,
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_workers() -> usize {
    1
}

impl Config {
    pub fn from_yaml(data: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(data)?;
        if config.timeout_secs == 0 {
            return Err(Error::Other("timeout_secs must be greater than zero".to_string()));
        }
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path)?;
        Self::from_yaml(&data)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Configured vault path, falling back to the platform data directory.
    pub fn vault_path(&self) -> Result<PathBuf> {
        self.vault_path
            .clone()
            .or_else(FileKeyVault::default_path)
            .ok_or_else(|| Error::Other("No data directory available for the key vault".to_string()))
    }
}
