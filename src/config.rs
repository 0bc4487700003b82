use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::protocol::{timeouts, DEFAULT_PORT, LISTEN_BACKLOG};

/// How a successful Put is acknowledged
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PutAck {
    /// No response bytes; the peer sees the connection close.
    #[default]
    Implicit,
    /// A single `None` opcode byte before closing.
    Explicit,
}

/// Where committed and staged files live
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub working_dir: PathBuf,
    /// Best on the same filesystem as `working_dir`; otherwise commits copy first
    pub staging_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            working_dir: PathBuf::from("files"),
            staging_dir: PathBuf::from("files").join(".staging"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnnounceConfig {
    pub enabled: bool,
    /// Advertised host name; the machine hostname when unset
    pub host_name: Option<String>,
    /// Interface name or IPv4 address the broadcasts are sent from
    pub interface: Option<String>,
    pub target: SocketAddr,
    pub interval_ms: u64,
}

impl Default for AnnounceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host_name: None,
            interface: None,
            target: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::BROADCAST, DEFAULT_PORT)),
            interval_ms: timeouts::ANNOUNCE_INTERVAL_MS,
        }
    }
}

impl AnnounceConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Configured host name, falling back to the machine hostname
    pub fn resolved_host_name(&self) -> String {
        if let Some(name) = self.host_name.as_deref().filter(|n| !n.trim().is_empty()) {
            return name.to_string();
        }
        hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "lanshare".to_string())
    }
}

/// Daemon configuration, passed explicitly to the repository and the
/// dispatcher at construction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    pub backlog: i32,
    pub idle_timeout_ms: u64,
    pub put_ack: PutAck,
    pub storage: StorageConfig,
    pub announce: AnnounceConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, DEFAULT_PORT)),
            backlog: LISTEN_BACKLOG,
            idle_timeout_ms: timeouts::IDLE_MS,
            put_ack: PutAck::Implicit,
            storage: StorageConfig::default(),
            announce: AnnounceConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Load from a TOML file; missing keys take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        let config: ServerConfig =
            toml::from_str(&text).with_context(|| format!("parse config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.backlog <= 0 {
            anyhow::bail!("backlog must be positive, got {}", self.backlog);
        }
        if self.idle_timeout_ms == 0 {
            anyhow::bail!("idle_timeout_ms must be positive");
        }
        if self.announce.interval_ms == 0 {
            anyhow::bail!("announce.interval_ms must be positive");
        }
        if self.storage.working_dir.as_os_str().is_empty() {
            anyhow::bail!("storage.working_dir must not be empty");
        }
        if self.storage.staging_dir.as_os_str().is_empty() {
            anyhow::bail!("storage.staging_dir must not be empty");
        }
        Ok(())
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}
