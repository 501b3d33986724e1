// src/watcher/product.rs
//! Link watcher polling product pages over plain HTTP.
//!
//! One poller per (product × marketplace). Pollers are prepared group by
//! group (`group_size` products at a time) and then run independently.
//! A hit is followed by a cool-down so the same page is not hammered, and
//! found items pass a watcher-level dedup window (10 minutes by default).

use async_trait::async_trait;
use futures::future::join_all;
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::dedup::DeduplicationWindow;
use crate::error::{WatchError, WatchResult};
use crate::identity::{product_url, ItemIdentity};
use crate::lifecycle::{close_quietly, with_retry_on_timeout, MAX_TIMEOUT_ATTEMPTS};
use crate::model::{now_ms, FoundItem, Heartbeat, ObservedLink};
use crate::pauser::Pauser;
use crate::price::PriceParser;
use crate::watcher::poll::{run_poll_loop, CycleOutcome, PollPolicy, PollTarget};
use crate::watcher::{Capability, Watcher, WatcherCore};

pub const PRODUCT_ORIGIN: &str = "product-rest";

const TLD_RATE_EVERY: u64 = 500;
const OVERALL_RATE_EVERY: u64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MerchantVerdict {
    FromPreferred,
    NotFromPreferred,
    MaybeOtherOffers,
    NoMerchantElement,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PageVerdict {
    pub merchant: MerchantVerdict,
    pub price: Option<String>,
}

/// A page session owned by exactly one poller.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    /// Opens the marketplace root (cookies, consent) before polling starts.
    async fn open_root(&self) -> WatchResult<()>;

    /// Fetches a product page. A captcha surfaces as `WatchError::Captcha`.
    async fn fetch(&self, url: &str) -> WatchResult<PageVerdict>;

    async fn refresh_session(&self) -> WatchResult<()>;

    async fn close(&self) -> WatchResult<()> {
        Ok(())
    }
}

pub trait PageFetcherFactory: Send + Sync {
    fn create(&self, log_id: &str, tld: &str) -> WatchResult<Arc<dyn PageFetcher>>;
}

#[async_trait]
pub trait CaptchaSolver: Send + Sync {
    async fn solve(&self, log_id: &str, url: &str) -> WatchResult<()>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchedProduct {
    pub product_id: String,
    pub title: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub buy_price: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProductWatcherSettings {
    pub tlds: Vec<String>,
    pub products: Vec<WatchedProduct>,
    pub group_size: usize,
    pub interval_ms: u64,
    pub jitter_ms: u64,
    pub cooldown_secs: u64,
    pub dedup_window_secs: i64,
    /// Outbound proxy for the page sessions; polling without one is allowed
    /// but logged.
    pub proxy: Option<String>,
}

impl Default for ProductWatcherSettings {
    fn default() -> Self {
        Self {
            tlds: vec!["it".into(), "de".into(), "fr".into(), "es".into(), "co.uk".into()],
            products: Vec::new(),
            group_size: 4,
            interval_ms: 2000,
            jitter_ms: 3000,
            cooldown_secs: 300,
            dedup_window_secs: 600,
            proxy: None,
        }
    }
}

struct Shared {
    core: WatcherCore,
    dedup: DeduplicationWindow<ItemIdentity>,
    price: PriceParser,
    cooldown: Duration,
    captcha: Option<Arc<dyn CaptchaSolver>>,
    per_tld: Mutex<HashMap<String, u64>>,
    overall: AtomicU64,
    started: Instant,
}

impl Shared {
    fn record_heartbeat(&self, tld: &str, hb: Heartbeat) {
        let tld_count = {
            let mut per_tld = self.per_tld.lock().expect("rate counters mutex poisoned");
            let n = per_tld.entry(tld.to_string()).or_insert(0);
            *n += 1;
            *n
        };
        let elapsed = self.started.elapsed();
        let minutes = (elapsed.as_secs_f64() / 60.0).max(1.0 / 60.0);
        if tld_count % TLD_RATE_EVERY == 0 {
            info!(
                tld,
                checks = tld_count,
                per_minute = (tld_count as f64 / minutes).round() as u64,
                running_secs = elapsed.as_secs(),
                "checks done on marketplace"
            );
        }
        let overall = self.overall.fetch_add(1, Ordering::Relaxed) + 1;
        if overall % OVERALL_RATE_EVERY == 0 {
            info!(
                checks = overall,
                per_minute = (overall as f64 / minutes).round() as u64,
                running_secs = elapsed.as_secs(),
                "checks done among all marketplaces"
            );
        }
        self.core.emit_heartbeat(hb);
    }
}

struct ProductPoller {
    log_id: String,
    tld: String,
    url: String,
    title: String,
    buy_price: Option<f64>,
    identity: ItemIdentity,
    fetcher: Arc<dyn PageFetcher>,
    shared: Arc<Shared>,
}

#[async_trait]
impl PollTarget for ProductPoller {
    fn log_id(&self) -> &str {
        &self.log_id
    }

    async fn poll_once(&self) -> WatchResult<CycleOutcome> {
        let verdict = self.fetcher.fetch(&self.url).await?;
        self.shared.record_heartbeat(
            &self.tld,
            Heartbeat::link(PRODUCT_ORIGIN, &self.url, &self.title),
        );

        match verdict.merchant {
            MerchantVerdict::FromPreferred => {
                let parsed = match self.shared.price.parse_opt(verdict.price.as_deref()) {
                    Ok(p) => p,
                    Err(e) => {
                        debug!(id = %self.log_id, error = %e, "price unreadable");
                        None
                    }
                };
                if self.shared.dedup.is_recent_duplicate(&self.identity) {
                    counter!("watch_dedup_suppressed_total", "scope" => "product").increment(1);
                } else {
                    self.shared.core.emit_found(FoundItem {
                        time: now_ms(),
                        url: self.url.clone(),
                        title: self.title.clone(),
                        price: verdict.price.unwrap_or_default(),
                        parsed_price: parsed,
                        origin: PRODUCT_ORIGIN.to_string(),
                        valid: true,
                        price_limit: self.buy_price,
                    });
                }
                Ok(CycleOutcome::CoolDown(self.shared.cooldown))
            }
            MerchantVerdict::NoMerchantElement => {
                warn!(id = %self.log_id, url = %self.url, "no merchant element, probably not available");
                Ok(CycleOutcome::Continue)
            }
            MerchantVerdict::NotFromPreferred | MerchantVerdict::MaybeOtherOffers => {
                Ok(CycleOutcome::Continue)
            }
        }
    }

    async fn refresh_session(&self) -> WatchResult<()> {
        self.fetcher.refresh_session().await
    }

    async fn solve_challenge(&self, at: &str) -> WatchResult<()> {
        match &self.shared.captcha {
            Some(solver) => solver.solve(&self.log_id, at).await,
            None => self.fetcher.refresh_session().await,
        }
    }
}

pub struct ProductWatcher {
    shared: Arc<Shared>,
    settings: ProductWatcherSettings,
    factory: Arc<dyn PageFetcherFactory>,
    pauser: Arc<Pauser>,
    policy: PollPolicy,
    pollers: Mutex<Vec<Arc<ProductPoller>>>,
}

impl ProductWatcher {
    pub fn new(
        settings: ProductWatcherSettings,
        factory: Arc<dyn PageFetcherFactory>,
        pauser: Arc<Pauser>,
        price: PriceParser,
    ) -> Self {
        let policy = PollPolicy {
            interval: Duration::from_millis(settings.interval_ms),
            jitter: Duration::from_millis(settings.jitter_ms),
            ..PollPolicy::default()
        };
        if settings.proxy.is_none() {
            warn!("product watcher runs without a proxy, blocks are more likely");
        }
        Self {
            shared: Arc::new(Shared {
                core: WatcherCore::new("product-watcher"),
                dedup: DeduplicationWindow::new(settings.dedup_window_secs),
                price,
                cooldown: Duration::from_secs(settings.cooldown_secs),
                captcha: None,
                per_tld: Mutex::new(HashMap::new()),
                overall: AtomicU64::new(0),
                started: Instant::now(),
            }),
            settings,
            factory,
            pauser,
            policy,
            pollers: Mutex::new(Vec::new()),
        }
    }

    /// Only valid before the watcher is shared.
    pub fn with_captcha_solver(mut self, solver: Arc<dyn CaptchaSolver>) -> Self {
        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            shared.captcha = Some(solver);
        }
        self
    }

    pub fn with_policy(mut self, policy: PollPolicy) -> Self {
        self.policy = policy;
        self
    }

    async fn prepare_poller(&self, product: &WatchedProduct, tld: &str) -> WatchResult<Arc<ProductPoller>> {
        let identity = ItemIdentity::new(tld, &product.product_id);
        let log_id = identity.log_id("rest-poller");
        let fetcher = self.factory.create(&log_id, tld)?;
        with_retry_on_timeout(&log_id, MAX_TIMEOUT_ATTEMPTS, || fetcher.open_root()).await?;
        let url = product_url(tld, &product.product_id);
        info!(id = %log_id, %url, title = %product.title, "page ready");
        Ok(Arc::new(ProductPoller {
            log_id,
            tld: tld.to_string(),
            url,
            title: product.title.clone(),
            buy_price: product.buy_price,
            identity,
            fetcher,
            shared: self.shared.clone(),
        }))
    }
}

#[async_trait]
impl Watcher for ProductWatcher {
    fn core(&self) -> &WatcherCore {
        &self.shared.core
    }

    fn capability(&self) -> Capability {
        let mut links = Vec::new();
        for p in &self.settings.products {
            for tld in &self.settings.tlds {
                links.push(ObservedLink {
                    url: product_url(tld, &p.product_id),
                    title: format!("{} ({} at {})", p.title, p.product_id, tld),
                    category: p.category.clone(),
                    origin: PRODUCT_ORIGIN.to_string(),
                    buy_price: p.buy_price,
                });
            }
        }
        Capability::Link(links)
    }

    async fn prepare(&self) -> WatchResult<()> {
        let started = Instant::now();
        let group_size = self.settings.group_size.max(1);
        for (group, chunk) in self.settings.products.chunks(group_size).enumerate() {
            debug!(group, products = chunk.len(), "preparing product group");
            for product in chunk {
                let prepared = join_all(
                    self.settings
                        .tlds
                        .iter()
                        .map(|tld| self.prepare_poller(product, tld)),
                )
                .await;
                let mut pollers = self.pollers.lock().expect("pollers mutex poisoned");
                for poller in prepared {
                    pollers.push(poller?);
                }
            }
        }
        info!(
            pollers = self.pollers.lock().expect("pollers mutex poisoned").len(),
            took_ms = started.elapsed().as_millis() as u64,
            "product watcher prepared"
        );
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

    fn has_shutdown(&self) -> bool {
        true
    }

    async fn shutdown(&self) -> WatchResult<()> {
        let pollers = self.pollers.lock().expect("pollers mutex poisoned").clone();
        for poller in pollers {
            close_quietly(&poller.log_id, poller.fetcher.close()).await;
        }
        Ok(())
    }
}
