use anyhow::{Context, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::mesh::{MeshConfig, DEFAULT_NETWORK_ID, DEFAULT_RELAY_URL, DEFAULT_STUN_SERVER};

const DEVICE_ID_PREFIX: &str = "mms-";
const DEVICE_ID_LEN: usize = 8;
const BASE36: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub mesh: MeshSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Stable id this device announces on the relay
    #[serde(default = "generate_device_id")]
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshSettings {
    #[serde(default = "default_relay_url")]
    pub relay_url: String,
    #[serde(default = "default_network_id")]
    pub network_id: String,
    #[serde(default = "default_stun_servers")]
    pub stun_servers: Vec<String>,
    /// Seconds a closed session stays listed before it is dropped (0 = until peer leaves)
    #[serde(default = "default_session_grace_secs")]
    pub session_grace_secs: u64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_relay_url() -> String {
    DEFAULT_RELAY_URL.to_string()
}

fn default_network_id() -> String {
    DEFAULT_NETWORK_ID.to_string()
}

fn default_stun_servers() -> Vec<String> {
    vec![DEFAULT_STUN_SERVER.to_string()]
}

fn default_session_grace_secs() -> u64 {
    30
}

fn default_enabled() -> bool {
    true
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            id: generate_device_id(),
        }
    }
}

impl Default for MeshSettings {
    fn default() -> Self {
        Self {
            relay_url: default_relay_url(),
            network_id: default_network_id(),
            stun_servers: default_stun_servers(),
            session_grace_secs: default_session_grace_secs(),
            enabled: default_enabled(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device: DeviceConfig::default(),
            mesh: MeshSettings::default(),
        }
    }
}

impl Config {
    /// Load config from ~/.lanshare/config.toml, creating it on first run
    pub fn load() -> Result<Self> {
        Self::load_from(&get_config_path())
    }

    /// Load config from `path`, or create and save a default one there
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = fs::read_to_string(path).context("Failed to read config file")?;
            let table: toml::Table =
                toml::from_str(&content).context("Failed to parse config file")?;
            let has_id = table
                .get("device")
                .and_then(|device| device.get("id"))
                .is_some();
            let config: Config = table
                .try_into()
                .context("Failed to parse config file")?;
            // Persist a device id that was missing from the file
            if !has_id {
                config.save_to(path)?;
            }
            Ok(config)
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    /// Save config to ~/.lanshare/config.toml
    pub fn save(&self) -> Result<()> {
        self.save_to(&get_config_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)
            .with_context(|| format!("Failed to write {}", path.display()))?;

        Ok(())
    }

    /// Settings for the peer mesh
    pub fn mesh_config(&self) -> MeshConfig {
        let session_grace = match self.mesh.session_grace_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };
        MeshConfig {
            relay_url: self.mesh.relay_url.clone(),
            default_network_id: self.mesh.network_id.clone(),
            stun_servers: self.mesh.stun_servers.clone(),
            session_grace,
            ..MeshConfig::default()
        }
    }
}

/// Generate a device id: `mms-` followed by 8 random base36 characters
pub fn generate_device_id() -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..DEVICE_ID_LEN)
        .map(|_| BASE36[rng.gen_range(0..BASE36.len())] as char)
        .collect();
    format!("{}{}", DEVICE_ID_PREFIX, suffix)
}

/// Get the lanshare directory (~/.lanshare)
pub fn get_lanshare_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".lanshare")
}

/// Get the config file path (~/.lanshare/config.toml)
pub fn get_config_path() -> PathBuf {
    get_lanshare_dir().join("config.toml")
}
