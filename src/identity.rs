//! Persisted homebase identity
//!
//! The device id and the relay auth token live in two plain files
//! (one value each, surrounding whitespace ignored). Both are required
//! at startup; the token is rewritten after a successful claim.

use crate::config::IdentityConfig;
use anyhow::{Context, Result};
use std::path::Path;
use tracing::info;

#[derive(Debug, Clone)]
pub struct DeviceIdentity {
    pub device_id: String,
    pub token: String,
}

impl DeviceIdentity {
    /// Read both identity files. Any missing or empty value is an error.
    pub fn load(config: &IdentityConfig) -> Result<Self> {
        let device_id = read_value(&config.device_id_path).context("device id")?;
        let token = read_value(&config.token_path).context("relay token")?;
        info!(
            "Loaded identity for homebase {} from {:?}",
            device_id, config.device_id_path
        );
        Ok(Self { device_id, token })
    }
}

/// Replace the stored relay token with a freshly claimed one
pub fn store_token(path: &Path, token: &str) -> Result<()> {
    std::fs::write(path, format!("{}\n", token))
        .with_context(|| format!("failed to write token to {:?}", path))?;
    info!("Stored new relay token at {:?}", path);
    Ok(())
}

fn read_value(path: &Path) -> Result<String> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {:?}", path))?;
    let value = raw.trim();
    if value.is_empty() {
        anyhow::bail!("{:?} is empty", path);
    }
    Ok(value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn write(dir: &tempfile::TempDir, name: &str, content: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_load_trims_values() {
        let dir = tempfile::tempdir().unwrap();
        let config = IdentityConfig {
            device_id_path: write(&dir, "id", "hb-42\n"),
            token_path: write(&dir, "token", "  eyJhbGciOi\n"),
        };

        let identity = DeviceIdentity::load(&config).unwrap();
        assert_eq!(identity.device_id, "hb-42");
        assert_eq!(identity.token, "eyJhbGciOi");
    }

    #[test]
    fn test_missing_token_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let config = IdentityConfig {
            device_id_path: write(&dir, "id", "hb-42"),
            token_path: dir.path().join("absent"),
        };

        assert!(DeviceIdentity::load(&config).is_err());
    }

    #[test]
    fn test_empty_device_id_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let config = IdentityConfig {
            device_id_path: write(&dir, "id", "   \n"),
            token_path: write(&dir, "token", "tok"),
        };

        assert!(DeviceIdentity::load(&config).is_err());
    }

    #[test]
    fn test_store_token_round_trips_through_load() {
        let dir = tempfile::tempdir().unwrap();
        let config = IdentityConfig {
            device_id_path: write(&dir, "id", "hb-42"),
            token_path: write(&dir, "token", "old"),
        };

        store_token(&config.token_path, "new-token").unwrap();
        let identity = DeviceIdentity::load(&config).unwrap();
        assert_eq!(identity.token, "new-token");
    }
}
