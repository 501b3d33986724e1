//! Stock-cache watcher: polls the alert site's per-model stock lists.
//!
//! Each list is one poller. In-stock entries with a realistic price become
//! found items, once per (item, price).

use async_trait::async_trait;
use futures::future::join_all;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{WatchError, WatchResult};
use crate::identity::product_url;
use crate::lifecycle::{with_retry_on_timeout, MAX_TIMEOUT_ATTEMPTS};
use crate::model::{now_ms, FoundItem, Heartbeat, ObservedSearches};
use crate::pauser::Pauser;
use crate::price::PriceParser;
use crate::watcher::poll::{run_poll_loop, CycleOutcome, PollPolicy, PollTarget};
use crate::watcher::{Capability, SeenPrices, Watcher, WatcherCore};

pub const PART_ALERT_ORIGIN: &str = "part-alert";
pub const PART_ALERT_DOMAIN: &str = "partalert.net";

static ENTRY_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Amazon\.([a-z.]+)-(\w{10})").expect("entry id regex"));

/// One row of a stock list, e.g. id `Amazon.it-B08KHHF881`, price `€1,799.00`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StockEntry {
    pub availability: String,
    pub id: String,
    pub name: String,
    pub price: String,
    #[serde(default)]
    pub url: Option<String>,
}

impl StockEntry {
    pub fn in_stock(&self) -> bool {
        self.availability == "in_stock"
    }

    /// Direct product link derived from the entry id.
    pub fn product_link(&self) -> Option<String> {
        let caps = ENTRY_ID_RE.captures(&self.id)?;
        Some(product_url(&caps[1], &caps[2]))
    }
}

#[async_trait]
pub trait StockFeed: Send + Sync {
    async fn stock(&self, url: &str) -> WatchResult<Vec<StockEntry>>;
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StockList {
    pub term: String,
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PartAlertWatcherSettings {
    pub lists: Vec<StockList>,
    pub price_min: f64,
    pub price_max: f64,
    pub interval_ms: u64,
    pub jitter_ms: u64,
}

impl Default for PartAlertWatcherSettings {
    fn default() -> Self {
        let list = |term: &str, model: &str| StockList {
            term: term.to_string(),
            url: format!("https://api.partalert.net/stock-cache/{model}"),
        };
        Self {
            lists: vec![
                list("3060 Ti", "rtx3060ti"),
                list("3070", "rtx3070"),
                list("3080", "rtx3080"),
            ],
            price_min: 350.0,
            price_max: 850.0,
            interval_ms: 1000,
            jitter_ms: 2000,
        }
    }
}

struct Shared {
    core: WatcherCore,
    feed: Arc<dyn StockFeed>,
    seen: SeenPrices,
    price: PriceParser,
    settings: PartAlertWatcherSettings,
}

struct StockPoller {
    log_id: String,
    list: StockList,
    shared: Arc<Shared>,
}

#[async_trait]
impl PollTarget for StockPoller {
    fn log_id(&self) -> &str {
        &self.log_id
    }

    async fn poll_once(&self) -> WatchResult<CycleOutcome> {
        let entries = self.shared.feed.stock(&self.list.url).await?;
        let core = &self.shared.core;
        let settings = &self.shared.settings;
        core.emit_heartbeat(Heartbeat::search(PART_ALERT_ORIGIN, PART_ALERT_DOMAIN, &self.list.term));

        for entry in entries.into_iter().filter(StockEntry::in_stock) {
            let Ok(eur) = self.shared.price.parse(&entry.price) else {
                debug!(id = %entry.id, price = %entry.price, "unreadable stock price");
                continue;
            };
            if eur <= settings.price_min || eur >= settings.price_max {
                continue;
            }
            let Some(url) = entry.product_link() else {
                debug!(id = %entry.id, "stock entry is not a marketplace item");
                continue;
            };
            if !self.shared.seen.is_new(&url, Some(eur)) {
                continue;
            }
            info!(term = %self.list.term, %url, price = %entry.price, "in stock on the alert list");
            core.emit_found(FoundItem {
                time: now_ms(),
                url,
                title: entry.name,
                price: entry.price,
                parsed_price: Some(eur),
                origin: PART_ALERT_ORIGIN.to_string(),
                valid: true,
                price_limit: Some(settings.price_max),
            });
        }
        Ok(CycleOutcome::Continue)
    }

    async fn refresh_session(&self) -> WatchResult<()> {
        self.shared.feed.stock(&self.list.url).await.map(|_| ())
    }
}

pub struct PartAlertWatcher {
    shared: Arc<Shared>,
    pauser: Arc<Pauser>,
    policy: PollPolicy,
    pollers: Mutex<Vec<Arc<StockPoller>>>,
}

impl PartAlertWatcher {
    pub fn new(
        settings: PartAlertWatcherSettings,
        feed: Arc<dyn StockFeed>,
        pauser: Arc<Pauser>,
        price: PriceParser,
    ) -> Self {
        let policy = PollPolicy {
            interval: Duration::from_millis(settings.interval_ms),
            jitter: Duration::from_millis(settings.jitter_ms),
            ..PollPolicy::default()
        };
        Self {
            shared: Arc::new(Shared {
                core: WatcherCore::new("part-alert-watcher"),
                feed,
                seen: SeenPrices::new(),
                price,
                settings,
            }),
            pauser,
            policy,
            pollers: Mutex::new(Vec::new()),
        }
    }

    pub fn with_policy(mut self, policy: PollPolicy) -> Self {
        self.policy = policy;
        self
    }
}

#[async_trait]
impl Watcher for PartAlertWatcher {
    fn core(&self) -> &WatcherCore {
        &self.shared.core
    }

    fn capability(&self) -> Capability {
        Capability::Search(ObservedSearches {
            terms: self.shared.settings.lists.iter().map(|l| l.term.clone()).collect(),
            domains: vec![PART_ALERT_DOMAIN.to_string()],
        })
    }

    async fn prepare(&self) -> WatchResult<()> {
        for list in &self.shared.settings.lists {
            // first fetch warms up the edge cache in front of the lists
            with_retry_on_timeout(&list.url, MAX_TIMEOUT_ATTEMPTS, || self.shared.feed.stock(&list.url))
                .await?;
            self.pollers
                .lock()
                .expect("pollers mutex poisoned")
                .push(Arc::new(StockPoller {
                    log_id: format!("part-alert/{}", list.term),
                    list: list.clone(),
                    shared: self.shared.clone(),
                }));
        }
        info!(lists = self.shared.settings.lists.len(), "part-alert watcher prepared");
        Ok(())
    }

    async fn start(&self) -> WatchResult<()> {
        let pollers = self.pollers.lock().expect("pollers mutex poisoned").clone();
        let handles = pollers.into_iter().map(|poller| {
            let pauser = self.pauser.clone();
            let policy = self.policy.clone();
            tokio::spawn(async move {
                run_poll_loop(&poller.shared.core, &pauser, &policy, poller.as_ref()).await
            })
        });
        let mut first_err = None;
        for joined in join_all(handles).await {
            let res = joined.map_err(|e| WatchError::Structural(format!("poller task: {e}")))?;
            if let Err(e) = res {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}
