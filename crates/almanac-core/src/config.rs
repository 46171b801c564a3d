//! Instance configuration.
//!
//! Human-editable YAML, loaded once at startup and never hot-reloaded.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Default cap on body bytes returned by a `get` with `all=true`: 100 MiB.
pub const DEFAULT_MAX_BODY_SIZE_TO_GET_ALL: u64 = 100 * 1024 * 1024;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub repo: RepoConfig,
    pub identity: IdentityConfig,
    pub api: ApiConfig,
    pub registry: RegistryConfig,
    /// Named remotes: name to address.
    pub remotes: BTreeMap<String, String>,
    /// Feature flags; unknown flags read as disabled.
    pub features: BTreeMap<String, bool>,
    pub limits: Limits,
    pub p2p: P2pConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RepoConfig {
    /// Repo root directory. `None` keeps everything in memory.
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    pub peername: String,
    /// PKCS#8 Ed25519 private key, PEM. Key generation is out of scope;
    /// the operator supplies both halves.
    pub private_key_pem: Option<String>,
    /// SPKI Ed25519 public key, PEM.
    pub public_key_pem: Option<String>,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            peername: "peer".to_string(),
            private_key_pem: None,
            public_key_pem: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub listen: String,
    /// Read/write deadline for HTTP handlers, seconds.
    pub timeout_seconds: u64,
    pub websocket_enabled: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:2503".to_string(),
            timeout_seconds: 15,
            websocket_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Registry base address. `None` disables registry resolution.
    pub location: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    pub max_body_size_to_get_all: u64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_body_size_to_get_all: DEFAULT_MAX_BODY_SIZE_TO_GET_ALL,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct P2pConfig {
    pub enabled: bool,
}

impl Config {
    /// Load from a YAML file.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::internal(format!("reading config {}: {e}", path.display())))?;
        serde_yaml::from_str(&raw)
            .map_err(|e| Error::validation(format!("parsing config {}: {e}", path.display())))
    }

    pub fn feature_enabled(&self, flag: &str) -> bool {
        self.features.get(flag).copied().unwrap_or(false)
    }
}
