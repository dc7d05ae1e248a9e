//! Runtime configuration

use crate::ProxyError;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Which side of the validation protocol this process plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Accepts plain application traffic and initiates obfuscated tunnels
    /// towards a remote server role. Never validates inbound connections.
    Client,
    /// Accepts obfuscated tunnels, validates every inbound connection and
    /// pairs it with the real upstream service.
    Server,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Client => write!(f, "client"),
            Role::Server => write!(f, "server"),
        }
    }
}

/// Main portshade configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Operating role
    pub role: Role,

    /// Local listen address
    pub listen: SocketAddr,

    /// Upstream host every accepted connection is paired with
    pub upstream_host: String,

    /// Upstream port
    pub upstream_port: u16,

    /// Relay copy buffer size in bytes
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// Interval between statistics snapshots
    #[serde(default = "default_save_interval", with = "humantime_serde")]
    pub save_interval: Duration,

    /// Root directory holding the seed and persisted statistics
    #[serde(default = "default_root")]
    pub root: PathBuf,
}

fn default_buffer_size() -> usize {
    4096
}

fn default_save_interval() -> Duration {
    Duration::from_secs(10 * 60)
}

fn default_root() -> PathBuf {
    PathBuf::from("portshade")
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 7070))
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            role: Role::Client,
            listen: default_listen(),
            upstream_host: String::new(),
            upstream_port: 0,
            buffer_size: default_buffer_size(),
            save_interval: default_save_interval(),
            root: default_root(),
        }
    }
}

impl ProxyConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self, ProxyError> {
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Save configuration to a TOML file
    pub fn to_file(&self, path: &Path) -> Result<(), ProxyError> {
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ProxyError> {
        if self.upstream_host.is_empty() {
            return Err(ProxyError::InvalidConfig(
                "upstream host must be set".to_string(),
            ));
        }
        if self.upstream_port == 0 {
            return Err(ProxyError::InvalidConfig(
                "upstream port must be set".to_string(),
            ));
        }
        if self.buffer_size == 0 {
            return Err(ProxyError::InvalidConfig(
                "relay buffer size must be at least 1 byte".to_string(),
            ));
        }
        if self.save_interval < Duration::from_secs(1) {
            return Err(ProxyError::InvalidConfig(
                "statistics save interval must be at least 1s".to_string(),
            ));
        }
        Ok(())
    }
}
