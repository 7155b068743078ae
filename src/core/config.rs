use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::utils::{P2PError, Result};

pub const DEFAULT_SERVER_PORT: u16 = 6000;
pub const DEFAULT_TRANSFER_BASE_PORT: u16 = 5000;

/// Directory server settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub port: u16,
    pub max_connections: usize,
    pub handshake_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0".to_string(),
            port: DEFAULT_SERVER_PORT,
            max_connections: 256,
            handshake_timeout_secs: 10,
        }
    }
}

impl ServerConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        load_json(path)
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind_addr, self.port)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }
}

/// Settings for one peer process.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerConfig {
    pub server_addr: String,
    pub shared_dir: PathBuf,
    /// First port tried for the transfer listener; `0` lets the OS pick.
    pub transfer_base_port: u16,
    /// Address put in download requests instead of the local address of
    /// the server connection.
    pub advertise_addr: Option<IpAddr>,
    pub connect_timeout_secs: u64,
    pub header_timeout_secs: u64,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            server_addr: format!("127.0.0.1:{}", DEFAULT_SERVER_PORT),
            shared_dir: PathBuf::from("./localFiles"),
            transfer_base_port: DEFAULT_TRANSFER_BASE_PORT,
            advertise_addr: None,
            connect_timeout_secs: 10,
            header_timeout_secs: 10,
        }
    }
}

impl PeerConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        load_json(path)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn header_timeout(&self) -> Duration {
        Duration::from_secs(self.header_timeout_secs)
    }
}

fn load_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| P2PError::ConfigError(format!("Failed to read {:?}: {}", path, e)))?;
    serde_json::from_str(&raw)
        .map_err(|e| P2PError::ConfigError(format!("Invalid config {:?}: {}", path, e)))
}
