//! Human alerting for found items: a relevance gate in front of a fan-out
//! to every configured channel.

pub mod discord;
pub mod slack;

use anyhow::Result;
use serde::Deserialize;
use tracing::{info, warn};

use crate::model::FoundItem;

pub use discord::DiscordNotifier;
pub use slack::SlackNotifier;

#[async_trait::async_trait]
pub trait Notifier: Send + Sync {
    fn name(&self) -> &'static str;

    async fn send(&self, item: &FoundItem) -> Result<()>;
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NotifySettings {
    pub discord_webhook: Option<String>,
    pub slack_webhook: Option<String>,
    pub timeout_secs: u64,
    pub retries: u8,
    pub relevance: RelevanceFilter,
}

impl Default for NotifySettings {
    fn default() -> Self {
        Self {
            discord_webhook: None,
            slack_webhook: None,
            timeout_secs: 5,
            retries: 3,
            relevance: RelevanceFilter::default(),
        }
    }
}

/// Only items on the preferred marketplace, naming a watched model, at or
/// below the alert ceiling reach a human.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelevanceFilter {
    pub url_marker: String,
    pub models: Vec<String>,
    pub max_price: f64,
}

impl Default for RelevanceFilter {
    fn default() -> Self {
        Self {
            url_marker: "www.amazon.".to_string(),
            models: vec!["3060".into(), "3070".into(), "3080".into()],
            max_price: 850.0,
        }
    }
}

impl RelevanceFilter {
    pub fn is_relevant(&self, item: &FoundItem) -> bool {
        if !item.url.contains(&self.url_marker) {
            return false;
        }
        if !self.models.iter().any(|m| item.title.contains(m.as_str())) {
            return false;
        }
        !matches!(item.parsed_price, Some(p) if p > self.max_price)
    }
}

/// Writes every relevant item to the log.
pub struct LogNotifier;

#[async_trait::async_trait]
impl Notifier for LogNotifier {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn send(&self, item: &FoundItem) -> Result<()> {
        info!(
            url = %item.url,
            title = %item.title,
            price = %item.price,
            origin = %item.origin,
            "item found"
        );
        Ok(())
    }
}

pub struct NotifierMux {
    notifiers: Vec<Box<dyn Notifier>>,
    relevance: RelevanceFilter,
}

impl NotifierMux {
    pub fn new(relevance: RelevanceFilter) -> Self {
        Self {
            notifiers: vec![Box::new(LogNotifier)],
            relevance,
        }
    }

    /// Log notifier always; webhooks from settings, falling back to
    /// `DISCORD_WEBHOOK_URL` / `SLACK_WEBHOOK_URL`.
    pub fn from_settings(settings: &NotifySettings) -> Self {
        let mut mux = Self::new(settings.relevance.clone());
        let discord = settings
            .discord_webhook
            .clone()
            .or_else(|| std::env::var("DISCORD_WEBHOOK_URL").ok());
        if let Some(url) = discord {
            mux.push(Box::new(
                DiscordNotifier::new(url)
                    .with_timeout(settings.timeout_secs)
                    .with_retries(settings.retries),
            ));
        }
        let slack = settings
            .slack_webhook
            .clone()
            .or_else(|| std::env::var("SLACK_WEBHOOK_URL").ok());
        if let Some(url) = slack {
            mux.push(Box::new(
                SlackNotifier::new(url)
                    .with_timeout(settings.timeout_secs)
                    .with_retries(settings.retries),
            ));
        }
        mux
    }

    pub fn push(&mut self, notifier: Box<dyn Notifier>) {
        self.notifiers.push(notifier);
    }

    pub fn len(&self) -> usize {
        self.notifiers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.notifiers.is_empty()
    }

    /// Returns how many channels accepted the item; 0 when filtered out.
    /// A failing channel is logged and does not stop the others.
    pub async fn notify(&self, item: &FoundItem) -> usize {
        if !self.relevance.is_relevant(item) {
            return 0;
        }
        let mut delivered = 0;
        for n in &self.notifiers {
            match n.send(item).await {
                Ok(()) => delivered += 1,
                Err(e) => warn!(channel = n.name(), error = %e, "notification failed"),
            }
        }
        delivered
    }
}
