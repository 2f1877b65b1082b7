//! HTTP calls to sprinkler peripherals on the LAN
//!
//! Peripherals are addressed by their mDNS name (`esp32-xxxx.local`) and
//! expose `POST /led{zone}/{on|off}` with a JSON `{"key": ...}` body plus a
//! `GET /ping` health check. Only the status code matters.

use anyhow::{Context, Result};
use reqwest::Client;
use serde_json::json;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

pub trait PeripheralGateway: Send + Sync + 'static {
    /// Switch `zone` on or off; returns the HTTP status
    fn set_zone(
        &self,
        lan_name: &str,
        zone: u8,
        on: bool,
        key: &str,
    ) -> impl Future<Output = Result<u16>> + Send;

    /// Probe `/ping`; returns the HTTP status
    fn ping(&self, lan_name: &str) -> impl Future<Output = Result<u16>> + Send;
}

pub struct HttpPeripheral {
    http: Client,
}

impl HttpPeripheral {
    pub fn new(timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build peripheral HTTP client")?;
        Ok(Self { http })
    }
}

pub fn zone_url(lan_name: &str, zone: u8, on: bool) -> String {
    format!(
        "http://{}/led{}/{}",
        lan_name,
        zone,
        if on { "on" } else { "off" }
    )
}

pub fn ping_url(lan_name: &str) -> String {
    format!("http://{}/ping", lan_name)
}

impl PeripheralGateway for HttpPeripheral {
    async fn set_zone(&self, lan_name: &str, zone: u8, on: bool, key: &str) -> Result<u16> {
        let url = zone_url(lan_name, zone, on);
        debug!("POST {}", url);

        let resp = self
            .http
            .post(&url)
            .json(&json!({ "key": key }))
            .send()
            .await
            .with_context(|| format!("POST {} failed", url))?;

        Ok(resp.status().as_u16())
    }

    async fn ping(&self, lan_name: &str) -> Result<u16> {
        let url = ping_url(lan_name);
        debug!("GET {}", url);

        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET {} failed", url))?;

        Ok(resp.status().as_u16())
    }
}
