//! Stream watcher over a social feed of restock posts.
//!
//! Alert accounts post a title line, one or two (often shortened) links and
//! a price. Each post from a followed account is turned into a found item;
//! posts whose link does not lead to the marketplace are only logged.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{ErrorClass, WatchResult};
use crate::identity::is_product_url;
use crate::lifecycle::close_quietly;
use crate::model::{now_ms, FoundItem, Heartbeat};
use crate::price::PriceParser;
use crate::watcher::{Capability, Watcher, WatcherCore};

pub const SOCIAL_ORIGIN: &str = "social";

static LINK_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)https?://[^\s.]+\.[^\s:]{2,}|www\.[^\s:]+\.[^\s:]{2,}").expect("link regex")
});

static PRICE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[€£][\d,]+\.?\d{0,2}").expect("price regex"));

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Post {
    pub author: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamData {
    /// The connection is alive but nothing was posted.
    KeepAlive,
    Post(Post),
}

#[async_trait]
pub trait StreamSource: Send + Sync {
    async fn connect(&self) -> WatchResult<()>;

    /// Next piece of data; `None` once the stream ended. Must be cancel safe.
    async fn next(&self) -> WatchResult<Option<StreamData>>;

    async fn close(&self) -> WatchResult<()> {
        Ok(())
    }
}

/// Expands shortened links (one redirect hop).
#[async_trait]
pub trait LinkResolver: Send + Sync {
    async fn resolve(&self, link: &str) -> WatchResult<String>;
}

/// Takes every link at face value.
pub struct FaceValue;

#[async_trait]
impl LinkResolver for FaceValue {
    async fn resolve(&self, link: &str) -> WatchResult<String> {
        Ok(link.to_string())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SocialWatcherSettings {
    /// Stream endpoint answering newline-delimited JSON posts.
    pub endpoint: String,
    pub bearer_token: Option<String>,
    /// Only posts by these accounts count; empty accepts everyone.
    pub accounts: Vec<String>,
    pub reconnect_delay_secs: u64,
}

impl Default for SocialWatcherSettings {
    fn default() -> Self {
        Self {
            endpoint: "https://api.twitter.com/2/tweets/search/stream?expansions=author_id".to_string(),
            bearer_token: None,
            accounts: vec!["PartAlert".to_string(), "DropSentry".to_string()],
            reconnect_delay_secs: 15,
        }
    }
}

/// Text after the first `": "` of the first line.
pub fn post_title(text: &str) -> String {
    let first = text.lines().next().unwrap_or_default();
    match first.split_once(": ") {
        Some((_, title)) => title.trim().to_string(),
        None => first.trim().to_string(),
    }
}

pub fn post_links(text: &str) -> Vec<&str> {
    LINK_RE.find_iter(text).map(|m| m.as_str()).collect()
}

/// The single price in the post; none when missing or ambiguous.
pub fn post_price(text: &str) -> Option<&str> {
    let mut prices = PRICE_RE.find_iter(text);
    match (prices.next(), prices.next()) {
        (Some(p), None) => Some(p.as_str()),
        _ => None,
    }
}

/// Alert-site redirect pages carry the marketplace and product id in the
/// query; those become a direct product link.
pub fn unwrap_alert_redirect(link: &str) -> String {
    if !link.contains("partalert.net/product") {
        return link.to_string();
    }
    let Ok(url) = Url::parse(link) else {
        return link.to_string();
    };
    let param = |name: &str| {
        url.query_pairs()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.into_owned())
    };
    match (param("asin"), param("tld")) {
        (Some(asin), Some(tld)) => {
            let direct = format!("https://www.amazon{tld}/dp/{asin}");
            info!(from = %link, to = %direct, "alert redirect unwrapped");
            direct
        }
        _ => link.to_string(),
    }
}

async fn pick_link(links: &[&str], resolver: &dyn LinkResolver) -> WatchResult<String> {
    let first = resolver.resolve(links[0]).await?;
    if is_product_url(&first) {
        return Ok(first);
    }
    if let Some(second) = links.get(1) {
        let second = resolver.resolve(second).await?;
        if is_product_url(&second) {
            return Ok(second);
        }
    }
    Ok(first)
}

/// `None` when the post carries no usable link.
pub async fn extract_item(
    text: &str,
    resolver: &dyn LinkResolver,
    prices: &PriceParser,
) -> WatchResult<Option<FoundItem>> {
    let links = post_links(text);
    if links.is_empty() || links.len() > 2 {
        debug!(links = links.len(), "post without a usable link");
        return Ok(None);
    }
    let url = unwrap_alert_redirect(&pick_link(&links, resolver).await?);
    let price = post_price(text).map(str::to_string);
    let parsed_price = price.as_deref().and_then(|p| prices.parse(p).ok());
    Ok(Some(FoundItem {
        time: now_ms(),
        valid: url.contains("amazon"),
        url,
        title: post_title(text),
        price: price.unwrap_or_default(),
        parsed_price,
        origin: SOCIAL_ORIGIN.to_string(),
        price_limit: None,
    }))
}

pub struct SocialWatcher {
    core: WatcherCore,
    settings: SocialWatcherSettings,
    source: Arc<dyn StreamSource>,
    resolver: Arc<dyn LinkResolver>,
    prices: PriceParser,
}

impl SocialWatcher {
    pub fn new(
        settings: SocialWatcherSettings,
        source: Arc<dyn StreamSource>,
        resolver: Arc<dyn LinkResolver>,
        prices: PriceParser,
    ) -> Self {
        Self {
            core: WatcherCore::new("social-watcher"),
            settings,
            source,
            resolver,
            prices,
        }
    }

    fn follows(&self, author: &str) -> bool {
        self.settings.accounts.is_empty()
            || self
                .settings
                .accounts
                .iter()
                .any(|a| a.eq_ignore_ascii_case(author))
    }

    async fn on_post(&self, post: Post) {
        if !self.follows(&post.author) {
            info!(author = %post.author, "post ignored, account not followed");
            return;
        }
        match extract_item(&post.text, self.resolver.as_ref(), &self.prices).await {
            Ok(Some(item)) if item.valid => {
                info!(author = %post.author, title = %item.title, url = %item.url, "item posted");
                self.core.emit_found(item);
            }
            Ok(Some(item)) => {
                info!(author = %post.author, url = %item.url, "posted link is not on the marketplace");
            }
            Ok(None) => {}
            Err(e) => warn!(author = %post.author, error = %e, "post could not be read"),
        }
    }

    async fn reconnect(&self) {
        info!(delay_secs = self.settings.reconnect_delay_secs, "reconnecting to the post stream");
        if !self
            .core
            .nap(Duration::from_secs(self.settings.reconnect_delay_secs))
            .await
        {
            return;
        }
        if let Err(e) = self.source.connect().await {
            warn!(error = %e, "post stream reconnect failed");
        }
    }
}

#[async_trait]
impl Watcher for SocialWatcher {
    fn core(&self) -> &WatcherCore {
        &self.core
    }

    fn capability(&self) -> Capability {
        Capability::Stream
    }

    async fn prepare(&self) -> WatchResult<()> {
        self.source.connect().await?;
        info!(accounts = ?self.settings.accounts, "connected to the post stream");
        Ok(())
    }

    async fn start(&self) -> WatchResult<()> {
        while !self.core.should_stop() {
            let next = tokio::select! {
                _ = self.core.stopped() => break,
                next = self.source.next() => next,
            };
            match next {
                Ok(Some(data)) => {
                    self.core.emit_heartbeat(Heartbeat::stream(SOCIAL_ORIGIN));
                    if let StreamData::Post(post) = data {
                        self.on_post(post).await;
                    }
                }
                Ok(None) => {
                    warn!("post stream ended");
                    self.reconnect().await;
                }
                Err(e) if matches!(e.class(), ErrorClass::Transient | ErrorClass::SessionInvalidating) => {
                    warn!(error = %e, "post stream failed");
                    self.reconnect().await;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn has_shutdown(&self) -> bool {
        true
    }

    async fn shutdown(&self) -> WatchResult<()> {
        close_quietly(SOCIAL_ORIGIN, self.source.close()).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const POST: &str = "https://t.co/NxVwCMUWBi: Gigabyte GeForce RTX 3070 VISION OC - Scheda grafica\n\
                        https://www.amazon.it/_itm/dp/B08KHHF881?tag=x\n\
                        Price: €838.19 as of 0:58:47 UTC\n\
                        #ad #pa_rtx3070";

    #[test]
    fn title_is_the_first_line_after_the_prefix() {
        assert_eq!(post_title(POST), "Gigabyte GeForce RTX 3070 VISION OC - Scheda grafica");
        assert_eq!(post_title("just a line"), "just a line");
    }

    #[test]
    fn links_and_the_single_price() {
        assert_eq!(
            post_links(POST),
            vec!["https://t.co/NxVwCMUWBi", "https://www.amazon.it/_itm/dp/B08KHHF881?tag=x"]
        );
        assert_eq!(post_price(POST), Some("€838.19"));
        assert_eq!(post_price("was €900.00 now €838.19"), None);
        assert_eq!(post_price("no price"), None);
    }

    #[test]
    fn alert_redirects_become_product_links() {
        let link = "https://alert.partalert.net/product?asin=B08LNWPYRS&smid=A1AT7YVPFBWXBL&tld=.es&token=0B9E";
        assert_eq!(unwrap_alert_redirect(link), "https://www.amazon.es/dp/B08LNWPYRS");
        assert_eq!(
            unwrap_alert_redirect("https://www.ebuyer.com/1136701-evga"),
            "https://www.ebuyer.com/1136701-evga"
        );
    }

    #[tokio::test]
    async fn product_link_wins_over_the_first_link() {
        let item = extract_item(POST, &FaceValue, &PriceParser::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(item.url, "https://www.amazon.it/_itm/dp/B08KHHF881?tag=x");
        assert!(item.valid);
        assert_eq!(item.parsed_price, Some(838.19));
        assert_eq!(item.origin, SOCIAL_ORIGIN);
    }

    #[tokio::test]
    async fn off_marketplace_links_are_invalid() {
        let text = "Alert: EVGA RTX 3070 XC3\nhttps://www.ebuyer.com/1136701-evga-geforce-rtx-3070\n£599.99";
        let item = extract_item(text, &FaceValue, &PriceParser::default())
            .await
            .unwrap()
            .unwrap();
        assert!(!item.valid);
        assert_eq!(item.title, "EVGA RTX 3070 XC3");
        assert!(extract_item("nothing to see", &FaceValue, &PriceParser::default())
            .await
            .unwrap()
            .is_none());
    }
}
