//! Joining the WiFi network delivered over BLE

use crate::config::WifiConfig;
use anyhow::{Context, Result};
use std::future::Future;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Attempts to join a wireless network
pub trait NetworkJoiner: Send + Sync + 'static {
    /// `Ok(false)` and `Err(_)` are both a failed join
    fn join(&self, ssid: &str, passphrase: &str) -> impl Future<Output = Result<bool>> + Send;
}

/// Joins through NetworkManager's `nmcli`
pub struct NmcliJoiner {
    interface: String,
    wait: Duration,
}

impl NmcliJoiner {
    pub fn new(config: &WifiConfig) -> Self {
        Self {
            interface: config.interface.clone(),
            wait: Duration::from_secs(config.join_timeout_secs),
        }
    }

    /// Drops a saved profile for `ssid` so a new passphrase takes effect
    fn delete_args(ssid: &str) -> Vec<String> {
        vec![
            "connection".to_string(),
            "delete".to_string(),
            ssid.to_string(),
        ]
    }

    fn args(&self, ssid: &str, passphrase: &str) -> Vec<String> {
        vec![
            "--wait".to_string(),
            self.wait.as_secs().to_string(),
            "device".to_string(),
            "wifi".to_string(),
            "connect".to_string(),
            ssid.to_string(),
            "password".to_string(),
            passphrase.to_string(),
            "ifname".to_string(),
            self.interface.clone(),
        ]
    }
}

impl NetworkJoiner for NmcliJoiner {
    async fn join(&self, ssid: &str, passphrase: &str) -> Result<bool> {
        info!("Joining WiFi network {:?} on {}", ssid, self.interface);

        // No saved profile is the usual case; only the connect result counts
        let delete = Command::new("nmcli")
            .args(Self::delete_args(ssid))
            .kill_on_drop(true)
            .output();
        match tokio::time::timeout(self.wait, delete).await {
            Ok(Ok(output)) if output.status.success() => {
                info!("Removed saved profile for {:?}", ssid)
            }
            Ok(Ok(output)) => debug!("No saved profile for {:?} ({})", ssid, output.status),
            Ok(Err(e)) => debug!("nmcli connection delete failed to run: {}", e),
            Err(_) => warn!("nmcli connection delete did not finish in time"),
        }

        let run = Command::new("nmcli")
            .args(self.args(ssid, passphrase))
            .kill_on_drop(true)
            .output();

        // nmcli enforces --wait itself; the outer bound covers a hung binary
        let output = tokio::time::timeout(self.wait + Duration::from_secs(5), run)
            .await
            .context("nmcli did not finish in time")?
            .context("failed to run nmcli")?;

        if output.status.success() {
            info!("Joined WiFi network {:?}", ssid);
            Ok(true)
        } else {
            warn!(
                "nmcli exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
            Ok(false)
        }
    }
}
