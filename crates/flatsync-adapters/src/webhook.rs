use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use flatsync_core::{ListingKind, Result, SyncError};
use serde::Serialize;
use tracing::{info, instrument};

use crate::Delivery;

#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub url: String,
    pub token: Option<String>,
    pub timeout: Duration,
}

impl WebhookConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: None,
            timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    kind: ListingKind,
    ids: Vec<&'a str>,
}

/// Posts the ready id set of one kind to the downstream consumer.
#[derive(Debug, Clone)]
pub struct WebhookDelivery {
    client: reqwest::Client,
    config: WebhookConfig,
}

impl WebhookDelivery {
    pub fn new(config: WebhookConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| SyncError::Config(format!("building webhook client: {e}")))?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl Delivery for WebhookDelivery {
    #[instrument(skip(self, ids), fields(count = ids.len()))]
    async fn deliver(&self, kind: ListingKind, ids: &BTreeSet<String>) -> Result<()> {
        let payload = WebhookPayload {
            kind,
            ids: ids.iter().map(String::as_str).collect(),
        };
        let mut request = self.client.post(&self.config.url).json(&payload);
        if let Some(token) = &self.config.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| SyncError::Delivery(format!("webhook request failed: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(SyncError::Delivery(format!(
                "webhook answered {status} for {} ids",
                ids.len()
            )));
        }

        info!(%kind, count = ids.len(), "webhook accepted listing ids");
        Ok(())
    }
}
