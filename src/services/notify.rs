//! New-content notification sinks.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Serialize;

use crate::error::{AppError, Result};
use crate::models::NotifyConfig;

/// Receives a call for every source that gained new items in a run.
///
/// Failures are logged by the caller and never affect the run.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify_new_content(&self, source_id: &str, new_count: usize) -> Result<()>;
}

/// Writes notifications to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl NotificationSink for LogNotifier {
    async fn notify_new_content(&self, source_id: &str, new_count: usize) -> Result<()> {
        log::info!("[{}] {} new items", source_id, new_count);
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    event: &'static str,
    source_id: &'a str,
    new_items: usize,
    timestamp: DateTime<Utc>,
}

/// POSTs a JSON payload to a webhook, retrying with backoff.
#[derive(Clone)]
pub struct WebhookNotifier {
    url: String,
    client: Client,
    timeout: Duration,
    max_retries: u8,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, client: Client) -> Self {
        Self {
            url: url.into(),
            client,
            timeout: Duration::from_secs(5),
            max_retries: 3,
        }
    }

    /// Build from `[notify]`; `None` when no webhook is configured.
    pub fn from_config(config: &NotifyConfig, client: Client) -> Option<Self> {
        config.webhook_url.as_ref().map(|url| {
            Self::new(url.clone(), client)
                .with_timeout(config.timeout_secs)
                .with_retries(config.max_retries)
        })
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout = Duration::from_secs(secs);
        self
    }

    pub fn with_retries(mut self, retries: u8) -> Self {
        self.max_retries = retries.max(1);
        self
    }
}

#[async_trait]
impl NotificationSink for WebhookNotifier {
    async fn notify_new_content(&self, source_id: &str, new_count: usize) -> Result<()> {
        let payload = WebhookPayload {
            event: "new_content",
            source_id,
            new_items: new_count,
            timestamp: Utc::now(),
        };

        let mut attempt: u8 = 0;
        loop {
            attempt += 1;
            let result = self
                .client
                .post(&self.url)
                .timeout(self.timeout)
                .json(&payload)
                .send()
                .await
                .and_then(|rsp| rsp.error_for_status());

            match result {
                Ok(_) => return Ok(()),
                Err(e) if attempt < self.max_retries => {
                    log::debug!(
                        "Webhook attempt {} for {} failed: {}",
                        attempt,
                        source_id,
                        e
                    );
                    tokio::time::sleep(Duration::from_millis(500u64 << (attempt - 1).min(6))).await;
                }
                Err(e) => return Err(AppError::Http(e)),
            }
        }
    }
}
