//! Wiring: turns a loaded config and a bundle name into running parts.

use anyhow::{bail, Context, Result};
use metrics::counter;
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::{AppConfig, BundleConfig, WatcherKind};
use crate::dedup::DeduplicationWindow;
use crate::identity::ItemIdentity;
use crate::model::FoundItem;
use crate::notify::NotifierMux;
use crate::pauser::Pauser;
use crate::price::PriceParser;
use crate::purchase::{PurchaseCoordinator, Strategy};
use crate::session::{
    HtmlSearchFetcher, HttpLinkResolver, HttpPageFetcherFactory, HttpPostStream, HttpSessionFactory,
    HttpStockFeed, SseRemoteFeed,
};
use crate::watcher::partalert::PartAlertWatcher;
use crate::watcher::product::ProductWatcher;
use crate::watcher::remote::RemoteWatcher;
use crate::watcher::search::SearchWatcher;
use crate::watcher::social::SocialWatcher;
use crate::watcher::{Watcher, WatcherAggregator};

/// Fallback for `watchers.social.bearer_token`.
pub const SOCIAL_TOKEN_ENV: &str = "SOCIAL_BEARER_TOKEN";

pub fn build_watchers(
    config: &AppConfig,
    bundle: &BundleConfig,
    pauser: &Arc<Pauser>,
    prices: PriceParser,
) -> Result<Vec<Arc<dyn Watcher>>> {
    let mut watchers: Vec<Arc<dyn Watcher>> = Vec::with_capacity(bundle.watchers.len());
    for kind in &bundle.watchers {
        let watcher: Arc<dyn Watcher> = match kind {
            WatcherKind::Product => {
                let mut settings = config.watchers.product.clone();
                settings.dedup_window_secs = config.dedup.product_window_secs;
                let factory = Arc::new(HttpPageFetcherFactory::new(
                    config.http.clone(),
                    settings.proxy.clone(),
                ));
                Arc::new(ProductWatcher::new(settings, factory, pauser.clone(), prices))
            }
            WatcherKind::Search => {
                let fetcher = HtmlSearchFetcher::new(&config.http).context("search fetcher")?;
                Arc::new(SearchWatcher::new(
                    config.watchers.search.clone(),
                    Arc::new(fetcher),
                    pauser.clone(),
                    prices,
                ))
            }
            WatcherKind::Remote => {
                let settings = config.watchers.remote.clone();
                if settings.address.trim().is_empty() {
                    bail!("remote watcher requested but watchers.remote.address is empty");
                }
                let feed = Arc::new(SseRemoteFeed::new(settings.address.clone()));
                Arc::new(RemoteWatcher::new(settings, feed))
            }
            WatcherKind::Social => {
                let mut settings = config.watchers.social.clone();
                if settings.bearer_token.is_none() {
                    settings.bearer_token = std::env::var(SOCIAL_TOKEN_ENV).ok();
                }
                let source = Arc::new(HttpPostStream::new(
                    settings.endpoint.clone(),
                    settings.bearer_token.clone(),
                ));
                let resolver = HttpLinkResolver::new(&config.http).context("link resolver")?;
                Arc::new(SocialWatcher::new(settings, source, Arc::new(resolver), prices))
            }
            WatcherKind::PartAlert => {
                let feed = HttpStockFeed::new(&config.http).context("stock feed")?;
                Arc::new(PartAlertWatcher::new(
                    config.watchers.part_alert.clone(),
                    Arc::new(feed),
                    pauser.clone(),
                    prices,
                ))
            }
        };
        watchers.push(watcher);
    }
    Ok(watchers)
}

/// `None` when the bundle does not buy or no buyer is configured.
pub fn build_coordinator(
    config: &AppConfig,
    bundle: &BundleConfig,
    pauser: &Arc<Pauser>,
    prices: PriceParser,
) -> Option<Arc<PurchaseCoordinator>> {
    if !bundle.should_buy || config.buyers.is_empty() {
        return None;
    }
    let proxy = config.watchers.product.proxy.clone();
    let strategies = config
        .buyers
        .iter()
        .map(|b| Strategy {
            id: b.id.clone(),
            check_type: b.check_type,
            factory: Arc::new(HttpSessionFactory::new(config.http.clone(), proxy.clone(), prices)),
        })
        .collect();
    Some(Arc::new(PurchaseCoordinator::new(
        strategies,
        config.policy.clone(),
        pauser.clone(),
        config.attempt.clone(),
    )))
}

/// Fans each found item out to the purchase coordinator (when buying) and to
/// the notifiers. Repeats of one identity inside the window are dropped.
pub struct Dispatcher {
    dedup: DeduplicationWindow<ItemIdentity>,
    notifier: NotifierMux,
    coordinator: Option<Arc<PurchaseCoordinator>>,
}

impl Dispatcher {
    pub fn new(
        window_secs: i64,
        notifier: NotifierMux,
        coordinator: Option<Arc<PurchaseCoordinator>>,
    ) -> Self {
        Self {
            dedup: DeduplicationWindow::new(window_secs),
            notifier,
            coordinator,
        }
    }

    /// Returns false when the item was a recent duplicate.
    pub async fn dispatch(&self, item: FoundItem) -> bool {
        let identity = ItemIdentity::from_url(&item.url);
        if self.dedup.is_recent_duplicate(&identity) {
            counter!("watch_dedup_suppressed_total", "scope" => "dispatch").increment(1);
            debug!(%identity, origin = %item.origin, "duplicate found item dropped");
            return false;
        }
        // The race starts before any webhook round trip.
        if let Some(c) = &self.coordinator {
            let c = c.clone();
            let item = item.clone();
            tokio::spawn(async move {
                c.attempt_purchase(&item).await;
            });
        }
        let delivered = self.notifier.notify(&item).await;
        info!(%identity, title = %item.title, price = %item.price, delivered, "found item dispatched");
        true
    }

    /// Subscribes to the aggregator's found-item bus.
    pub fn attach(self: &Arc<Self>, aggregator: &WatcherAggregator) {
        let me = self.clone();
        aggregator.found_items().subscribe_async(move |item| {
            let me = me.clone();
            async move {
                me.dispatch(item).await;
            }
        });
    }
}
