use anyhow::{Context, Result};
use reqwest::Client;
use std::time::Duration;

use super::Notifier;
use crate::model::FoundItem;

pub struct SlackNotifier {
    webhook_url: String,
    client: Client,
    timeout: Duration,
    max_retries: u8,
}

impl SlackNotifier {
    pub fn new(url: String) -> Self {
        Self {
            webhook_url: url,
            client: Client::new(),
            timeout: Duration::from_secs(5),
            max_retries: 3,
        }
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout = Duration::from_secs(secs);
        self
    }

    pub fn with_retries(mut self, n: u8) -> Self {
        self.max_retries = n.max(1);
        self
    }

    async fn post_once(&self, body: &serde_json::Value) -> Result<()> {
        self.client
            .post(&self.webhook_url)
            .timeout(self.timeout)
            .json(body)
            .send()
            .await
            .context("slack post")?
            .error_for_status()
            .context("slack non-2xx")?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl Notifier for SlackNotifier {
    fn name(&self) -> &'static str {
        "slack"
    }

    async fn send(&self, item: &FoundItem) -> Result<()> {
        let text = format!(
            "*Found:* {}\nPrice: {}\nOrigin: {}\n<{}>",
            item.title, item.price, item.origin, item.url
        );
        let body = serde_json::json!({ "text": text });

        let mut attempt: u8 = 0;
        loop {
            attempt += 1;
            match self.post_once(&body).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < self.max_retries => {
                    tracing::debug!(attempt, error = %e, "slack send failed, retrying");
                    tokio::time::sleep(Duration::from_millis(500u64 << (attempt - 1))).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
