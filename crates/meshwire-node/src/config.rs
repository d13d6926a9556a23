//! Node configuration

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Component, Path, PathBuf};

/// Default config file location
pub const DEFAULT_CONFIG_PATH: &str = "~/.meshwire/config.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Listener configuration
    pub node: NodeConfig,

    /// Shared directory configuration
    pub sync: SyncConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Interface to listen on
    pub listen_host: String,
    /// TCP port; 0 picks an ephemeral one
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Directory served to peers and merged into by sync
    pub shared_dir: String,
    /// Where snapshot archives are staged; keep it outside shared_dir
    pub staging_dir: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_host: "0.0.0.0".to_string(),
            port: 0,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            shared_dir: "data".to_string(),
            staging_dir: "~/.meshwire/staging".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load `path` if it exists, otherwise fall back to defaults
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            tracing::debug!("No config at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    /// Write configuration to a file
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let toml = toml::to_string_pretty(self)?;
        std::fs::write(path, toml)?;
        Ok(())
    }

    pub fn listen_addr(&self) -> anyhow::Result<SocketAddr> {
        let host: std::net::IpAddr = self
            .node
            .listen_host
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid listen host {}: {}", self.node.listen_host, e))?;
        Ok(SocketAddr::new(host, self.node.port))
    }

    pub fn shared_dir(&self) -> PathBuf {
        expand_path(&self.sync.shared_dir)
    }

    pub fn staging_dir(&self) -> PathBuf {
        expand_path(&self.sync.staging_dir)
    }

    /// Reject a staging directory that sits inside the shared directory,
    /// where snapshots would pick up their own archives
    pub fn check_dirs(&self) -> anyhow::Result<()> {
        let shared = normalize(&self.shared_dir())?;
        let staging = normalize(&self.staging_dir())?;
        if staging.starts_with(&shared) {
            anyhow::bail!(
                "Staging directory {} must not be inside the shared directory {}",
                staging.display(),
                shared.display()
            );
        }
        Ok(())
    }
}

/// Make `path` absolute and fold `.` and `..` without touching the filesystem
fn normalize(path: &Path) -> anyhow::Result<PathBuf> {
    let absolute = std::path::absolute(path)?;
    let mut normalized = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other),
        }
    }
    Ok(normalized)
}

/// Expand a leading `~/` to the home directory
pub fn expand_path(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
