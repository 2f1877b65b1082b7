use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub backend: BackendConfig,
    pub identity: IdentityConfig,
    pub peripheral: PeripheralConfig,
    pub gatt: GattConfig,
    pub wifi: WifiConfig,
    pub provisioner: Option<ProvisionerConfig>,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// WebSocket endpoint of the relay backend
    pub url: String,
    /// HTTP endpoint used to claim this homebase for an account
    pub claim_url: String,
    pub reconnect_secs: u64,
    pub claim_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    pub device_id_path: PathBuf,
    pub token_path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PeripheralConfig {
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GattConfig {
    pub enabled: bool,
    pub bind: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WifiConfig {
    pub interface: String,
    pub join_timeout_secs: u64,
}

/// External program launched on `start_provisioning`
#[derive(Debug, Clone, Deserialize)]
pub struct ProvisionerConfig {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file {:?}: {}", path, e))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Failed to parse config file {:?}: {}", path, e))?;
        Ok(config)
    }

    /// Like `load`, but a missing file means built-in defaults.
    /// A file that exists and cannot be read or parsed is still an error.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        match std::fs::metadata(path) {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                eprintln!("Warning: Config file {:?} not found", path);
                eprintln!("Using default configuration");
                Ok(Self::default())
            }
            _ => Self::load(path),
        }
    }
}

impl BackendConfig {
    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_secs(self.reconnect_secs)
    }

    pub fn claim_timeout(&self) -> Duration {
        Duration::from_secs(self.claim_timeout_secs)
    }
}

impl PeripheralConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8081".to_string(),
            claim_url: "http://127.0.0.1:3001/homebase/claim".to_string(),
            reconnect_secs: 5,
            claim_timeout_secs: 10,
        }
    }
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            device_id_path: PathBuf::from("/etc/homebase-id"),
            token_path: PathBuf::from("/etc/homebase-token"),
        }
    }
}

impl Default for PeripheralConfig {
    fn default() -> Self {
        Self { timeout_secs: 3 }
    }
}

impl Default for GattConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: "127.0.0.1:7070".to_string(),
        }
    }
}

impl Default for WifiConfig {
    fn default() -> Self {
        Self {
            interface: "wlan0".to_string(),
            join_timeout_secs: 30,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}
