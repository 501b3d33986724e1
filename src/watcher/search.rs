//! Search watcher: every configured domain × every term, one poller each.

use async_trait::async_trait;
use futures::future::join_all;
use serde::Deserialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{WatchError, WatchResult};
use crate::identity::ItemIdentity;
use crate::lifecycle::{with_retry_on_timeout, MAX_TIMEOUT_ATTEMPTS};
use crate::model::{now_ms, FoundItem, Heartbeat, ObservedSearches};
use crate::pauser::Pauser;
use crate::price::PriceParser;
use crate::watcher::poll::{run_poll_loop, CycleOutcome, PollPolicy, PollTarget};
use crate::watcher::{Capability, SeenPrices, Watcher, WatcherCore};

pub const SEARCH_ORIGIN: &str = "search";

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SearchResult {
    pub title: String,
    pub url: String,
    #[serde(default)]
    pub price: Option<String>,
}

#[async_trait]
pub trait SearchFetcher: Send + Sync {
    async fn search(&self, domain: &str, term: &str) -> WatchResult<Vec<SearchResult>>;

    async fn refresh_session(&self, domain: &str) -> WatchResult<()>;
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SearchWatcherSettings {
    pub domains: Vec<String>,
    pub terms: Vec<String>,
    /// Results outside `(price_min, price_max)` are not realistic purchases.
    pub price_min: f64,
    pub price_max: f64,
    pub excluded_terms: Vec<String>,
    /// A result must name exactly one of these models.
    pub models: Vec<String>,
    pub interval_ms: u64,
    pub jitter_ms: u64,
}

impl Default for SearchWatcherSettings {
    fn default() -> Self {
        Self {
            domains: Vec::new(),
            terms: Vec::new(),
            price_min: 340.0,
            price_max: 900.0,
            excluded_terms: ["ssd", "printer", "nvme", "dell", "i7", "i5", "i9", "i3", "windows"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            models: ["3060", "3070", "3080", "3090", "6700", "6800", "6900"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            interval_ms: 3000,
            jitter_ms: 2000,
        }
    }
}

impl SearchWatcherSettings {
    pub fn is_relevant(&self, title: &str, eur_price: f64) -> bool {
        let lower = title.to_lowercase();
        if self.excluded_terms.iter().any(|t| lower.contains(t.as_str())) {
            return false;
        }
        let models = self.models.iter().filter(|m| title.contains(m.as_str())).count();
        models == 1 && eur_price > self.price_min && eur_price < self.price_max
    }
}

struct Shared {
    core: WatcherCore,
    fetcher: Arc<dyn SearchFetcher>,
    seen: SeenPrices,
    price: PriceParser,
    settings: SearchWatcherSettings,
}

struct SearchPoller {
    log_id: String,
    domain: String,
    term: String,
    shared: Arc<Shared>,
}

#[async_trait]
impl PollTarget for SearchPoller {
    fn log_id(&self) -> &str {
        &self.log_id
    }

    async fn poll_once(&self) -> WatchResult<CycleOutcome> {
        let results = self.shared.fetcher.search(&self.domain, &self.term).await?;
        let core = &self.shared.core;
        core.emit_heartbeat(Heartbeat::search(SEARCH_ORIGIN, &self.domain, &self.term));

        for r in results {
            let Some(eur) = r.price.as_deref().and_then(|p| self.shared.price.parse(p).ok()) else {
                continue;
            };
            if !self.shared.settings.is_relevant(&r.title, eur) {
                continue;
            }
            let key = ItemIdentity::from_url(&r.url).to_string();
            if !self.shared.seen.is_new(&key, Some(eur)) {
                continue;
            }
            core.emit_found(FoundItem {
                time: now_ms(),
                url: r.url,
                title: r.title,
                price: r.price.unwrap_or_default(),
                parsed_price: Some(eur),
                origin: SEARCH_ORIGIN.to_string(),
                valid: true,
                price_limit: Some(self.shared.settings.price_max),
            });
        }
        Ok(CycleOutcome::Continue)
    }

    async fn refresh_session(&self) -> WatchResult<()> {
        self.shared.fetcher.refresh_session(&self.domain).await
    }
}

pub struct SearchWatcher {
    shared: Arc<Shared>,
    pauser: Arc<Pauser>,
    policy: PollPolicy,
    pollers: Mutex<Vec<Arc<SearchPoller>>>,
}

impl SearchWatcher {
    pub fn new(
        settings: SearchWatcherSettings,
        fetcher: Arc<dyn SearchFetcher>,
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
                core: WatcherCore::new("search-watcher"),
                fetcher,
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
impl Watcher for SearchWatcher {
    fn core(&self) -> &WatcherCore {
        &self.shared.core
    }

    fn capability(&self) -> Capability {
        Capability::Search(ObservedSearches {
            terms: self.shared.settings.terms.clone(),
            domains: self.shared.settings.domains.clone(),
        })
    }

    async fn prepare(&self) -> WatchResult<()> {
        let settings = &self.shared.settings;
        for domain in &settings.domains {
            with_retry_on_timeout(domain, MAX_TIMEOUT_ATTEMPTS, || {
                self.shared.fetcher.refresh_session(domain)
            })
            .await?;
            for term in &settings.terms {
                let log_id = format!("search/{domain}/{term}");
                debug!(id = %log_id, "search poller ready");
                self.pollers
                    .lock()
                    .expect("pollers mutex poisoned")
                    .push(Arc::new(SearchPoller {
                        log_id,
                        domain: domain.clone(),
                        term: term.clone(),
                        shared: self.shared.clone(),
                    }));
            }
        }
        info!(
            domains = settings.domains.len(),
            terms = settings.terms.len(),
            "search watcher prepared"
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
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relevance_needs_one_model_and_a_realistic_price() {
        let s = SearchWatcherSettings::default();
        assert!(s.is_relevant("MSI GeForce RTX 3070 Gaming X", 650.0));
        assert!(!s.is_relevant("RTX 3070 vs 3080 bundle", 650.0));
        assert!(!s.is_relevant("Gaming PC i7 RTX 3070", 650.0));
        assert!(!s.is_relevant("RTX 3070", 950.0));
        assert!(!s.is_relevant("RTX 3070", 120.0));
    }
}
