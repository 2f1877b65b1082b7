//! Claiming this homebase for the account behind a user token

use crate::config::BackendConfig;
use anyhow::{Context, Result};
use reqwest::{Client, StatusCode};
use serde_json::json;
use std::future::Future;
use tracing::{info, warn};

/// Binds a device identity to an account on the backend
pub trait BackendClaimer: Send + Sync + 'static {
    /// `Ok(false)` and `Err(_)` are both a failed claim
    fn claim(&self, device_id: &str, token: &str) -> impl Future<Output = Result<bool>> + Send;
}

/// `POST {claim_url}` with bearer auth
pub struct HttpClaimer {
    http: Client,
    url: String,
}

impl HttpClaimer {
    pub fn new(config: &BackendConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(config.claim_timeout())
            .build()
            .context("failed to build claim HTTP client")?;

        Ok(Self {
            http,
            url: config.claim_url.clone(),
        })
    }
}

impl BackendClaimer for HttpClaimer {
    async fn claim(&self, device_id: &str, token: &str) -> Result<bool> {
        info!("Claiming homebase {} at {}", device_id, self.url);

        let resp = self
            .http
            .post(&self.url)
            .bearer_auth(token)
            .json(&json!({ "homebaseId": device_id }))
            .send()
            .await
            .context("failed to send claim request")?;

        let status = resp.status();
        if status == StatusCode::OK {
            info!("Homebase {} claimed", device_id);
            return Ok(true);
        }

        let body_text = resp.text().await.unwrap_or_default();
        warn!("Claim failed with status {}: {}", status, body_text);
        Ok(false)
    }
}
