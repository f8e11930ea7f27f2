use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::PathBuf;
use tracing::info;

/// Lowest VXLAN network identifier handed out to overlay networks.
pub const VXLAN_ID_START: u32 = 256;

/// Highest VXLAN network identifier (24-bit field).
pub const VXLAN_ID_END: u32 = (1 << 24) - 1;

/// Default UDP/TCP port for cluster gossip.
pub const DEFAULT_GOSSIP_PORT: u16 = 7946;

// ---------------------------------------------------------------------------
// OverlayConfig
// ---------------------------------------------------------------------------

/// Driver configuration stored at `~/.ovnet/config.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OverlayConfig {
    /// Address the gossip layer listens on. Falls back to `advertise_address`.
    pub bind_address: Option<IpAddr>,
    /// Address other hosts use to reach this one. Also this host's VTEP.
    pub advertise_address: Option<IpAddr>,
    pub gossip_port: u16,
    /// Path of the SQLite file backing the local store. Defaults to
    /// `~/.ovnet/local.db`.
    pub local_store_path: Option<PathBuf>,
    /// Directory for rolled log files. Defaults to `~/.ovnet/logs/`.
    pub log_dir: Option<PathBuf>,
    pub vxlan_id_start: u32,
    pub vxlan_id_end: u32,
    pub log_level: String,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            bind_address: None,
            advertise_address: None,
            gossip_port: DEFAULT_GOSSIP_PORT,
            local_store_path: None,
            log_dir: None,
            vxlan_id_start: VXLAN_ID_START,
            vxlan_id_end: VXLAN_ID_END,
            log_level: "info".into(),
        }
    }
}

impl OverlayConfig {
    /// Returns the base config directory: `~/.ovnet/`
    pub fn base_dir() -> Result<PathBuf> {
        let home = dirs::home_dir().context("Could not determine home directory")?;
        Ok(home.join(".ovnet"))
    }

    /// Returns the config file path: `~/.ovnet/config.json`
    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::base_dir()?.join("config.json"))
    }

    /// Returns the logs directory: `~/.ovnet/logs/`
    pub fn logs_dir() -> Result<PathBuf> {
        Ok(Self::base_dir()?.join("logs"))
    }

    /// Returns the default local store path: `~/.ovnet/local.db`
    pub fn default_store_path() -> Result<PathBuf> {
        Ok(Self::base_dir()?.join("local.db"))
    }

    /// Loads config from `~/.ovnet/config.json`, or creates a default one.
    pub fn load() -> Result<Self> {
        let base = Self::base_dir()?;
        std::fs::create_dir_all(&base)
            .with_context(|| format!("Failed to create directory: {}", base.display()))?;
        Self::load_from_path(&Self::config_path()?)
    }

    /// Load config from a specific file path, writing defaults if it is missing.
    pub fn load_from_path(path: &PathBuf) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config: {}", path.display()))?;
            let config: Self =
                serde_json::from_str(&content).with_context(|| "Failed to parse config.json")?;
            config.validate()?;
            info!("Loaded config from {}", path.display());
            Ok(config)
        } else {
            let config = Self::default();
            config.save_to_path(path)?;
            info!("Created default config at {}", path.display());
            Ok(config)
        }
    }

    /// Save config to a specific file path.
    pub fn save_to_path(&self, path: &PathBuf) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config: {}", path.display()))?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.vxlan_id_start < VXLAN_ID_START || self.vxlan_id_end > VXLAN_ID_END {
            bail!(
                "VXLAN id range {}-{} outside {VXLAN_ID_START}-{VXLAN_ID_END}",
                self.vxlan_id_start,
                self.vxlan_id_end
            );
        }
        if self.vxlan_id_start > self.vxlan_id_end {
            bail!(
                "VXLAN id range is empty: {} > {}",
                self.vxlan_id_start,
                self.vxlan_id_end
            );
        }
        if self.gossip_port == 0 {
            bail!("Gossip port must be non-zero");
        }
        Ok(())
    }

    /// The local store file this config selects.
    pub fn store_path(&self) -> Result<PathBuf> {
        match &self.local_store_path {
            Some(path) => Ok(path.clone()),
            None => Self::default_store_path(),
        }
    }

    /// The directory log files roll into.
    pub fn log_directory(&self) -> Result<PathBuf> {
        match &self.log_dir {
            Some(dir) => Ok(dir.clone()),
            None => Self::logs_dir(),
        }
    }

    /// The address gossip binds to.
    pub fn effective_bind_address(&self) -> Option<IpAddr> {
        self.bind_address.or(self.advertise_address)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
