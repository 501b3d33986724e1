//! Purchase-attempt coordination.
//!
//! One attempt per item identity at a time: cheap title/price filters, then
//! every configured strategy races to see the item available, the first
//! favorable scrape wins and its page runs the claim flow.

pub mod availability;
pub mod claim;
pub mod filters;
pub mod strategy;

use async_trait::async_trait;
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use crate::bus::EventBus;
use crate::error::WatchResult;
use crate::identity::{is_product_url, product_url, ItemIdentity};
use crate::lifecycle::close_quietly;
use crate::model::{now_ms, FoundItem, ProductInfo, SharedPurchaseStatus};
use crate::pauser::Pauser;

use self::availability::is_from_preferred;
use self::claim::{buy_now, ClaimOptions, ClaimPage};
use self::filters::{is_placeholder_title, product_to_offer, Offer, OfferLocation, PurchasePolicy};
use self::strategy::{first_success, plan_pages, CheckType, FetchOtherSellers, Refresher};

/// A page owned by exactly one strategy for the duration of one attempt.
#[async_trait]
pub trait ProductSession: ClaimPage {
    async fn navigate(&self, url: &str) -> WatchResult<()>;

    /// Scrapes the current page; `None` when nothing usable was found.
    async fn fetch_info(&self, other_sellers: FetchOtherSellers) -> WatchResult<Option<ProductInfo>>;

    async fn close(&self) -> WatchResult<()>;
}

#[async_trait]
pub trait SessionFactory: Send + Sync {
    /// One-time setup (logging in, warming cookies). Startup-fatal on failure.
    async fn boot(&self) -> WatchResult<()> {
        Ok(())
    }

    async fn open(&self, log_id: &str) -> WatchResult<Arc<dyn ProductSession>>;
}

#[derive(Clone)]
pub struct Strategy {
    pub id: String,
    pub check_type: CheckType,
    pub factory: Arc<dyn SessionFactory>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AttemptSettings {
    /// How long strategies keep refreshing before giving up.
    pub refresh_minutes: u64,
    /// Wall-clock budget for the whole claim flow.
    pub purchase_minutes: u64,
    pub refresh_pause_ms: u64,
    /// Stop right before the final confirm click.
    pub test_run: bool,
    pub max_claim_rounds: u32,
}

impl Default for AttemptSettings {
    fn default() -> Self {
        Self {
            refresh_minutes: 10,
            purchase_minutes: 5,
            refresh_pause_ms: 140,
            test_run: false,
            max_claim_rounds: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PurchaseOutcome {
    DroppedInFlight,
    RejectedTitle,
    RejectedPrice,
    NoStrategies,
    NotAvailable,
    NotFromPreferred,
    DeliveryTrouble,
    RejectedAfterRace,
    Claimed { strategy: String, test_run: bool },
    ClaimFailed { strategy: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct PurchaseResult {
    pub time: u64,
    pub url: String,
    pub title: String,
    pub identity: ItemIdentity,
    pub outcome: PurchaseOutcome,
}

/// Removes the identity from the in-flight set on every exit path.
struct InFlightGuard<'a> {
    set: &'a Mutex<HashSet<ItemIdentity>>,
    identity: ItemIdentity,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.set
            .lock()
            .expect("in-flight mutex poisoned")
            .remove(&self.identity);
    }
}

struct OpenPage {
    strategy: String,
    log_id: String,
    session: Arc<dyn ProductSession>,
}

pub struct PurchaseCoordinator {
    strategies: Vec<Strategy>,
    policy: PurchasePolicy,
    pauser: Arc<Pauser>,
    settings: AttemptSettings,
    in_flight: Mutex<HashSet<ItemIdentity>>,
    results: EventBus<PurchaseResult>,
    entries: AtomicU64,
    launches: AtomicU64,
}

impl PurchaseCoordinator {
    pub fn new(
        strategies: Vec<Strategy>,
        policy: PurchasePolicy,
        pauser: Arc<Pauser>,
        settings: AttemptSettings,
    ) -> Self {
        Self {
            strategies,
            policy,
            pauser,
            settings,
            in_flight: Mutex::new(HashSet::new()),
            results: EventBus::new(),
            entries: AtomicU64::new(0),
            launches: AtomicU64::new(0),
        }
    }

    pub fn results(&self) -> &EventBus<PurchaseResult> {
        &self.results
    }

    /// Calls to `attempt_purchase`.
    pub fn entries(&self) -> u64 {
        self.entries.load(Ordering::SeqCst)
    }

    /// Attempts that got past the filters and the in-flight check.
    pub fn launches(&self) -> u64 {
        self.launches.load(Ordering::SeqCst)
    }

    pub fn is_in_flight(&self, identity: &ItemIdentity) -> bool {
        self.in_flight
            .lock()
            .expect("in-flight mutex poisoned")
            .contains(identity)
    }

    pub fn strategy_count(&self) -> usize {
        self.strategies.len()
    }

    pub async fn prepare(&self) -> WatchResult<()> {
        for s in &self.strategies {
            s.factory.boot().await?;
            info!(strategy = %s.id, check_type = ?s.check_type, "strategy ready");
        }
        Ok(())
    }

    pub async fn attempt_purchase(&self, item: &FoundItem) -> PurchaseOutcome {
        self.entries.fetch_add(1, Ordering::SeqCst);
        counter!("purchase_attempts_total").increment(1);
        let identity = ItemIdentity::from_url(&item.url);
        let id = identity.log_id("attempt");

        if self.is_in_flight(&identity) {
            info!(%id, "attempt already in flight, dropping");
            counter!("purchase_attempts_inflight_dropped_total").increment(1);
            return PurchaseOutcome::DroppedInFlight;
        }
        if !self.policy.is_good_title(&item.title) {
            info!(%id, title = %item.title, "title does not identify one variant");
            counter!("purchase_attempts_rejected_total", "reason" => "title").increment(1);
            return PurchaseOutcome::RejectedTitle;
        }
        if let Some(price) = item.parsed_price {
            let offer = Offer {
                title: item.title.clone(),
                eur_price: Some(price),
                location: OfferLocation::DirectBuy,
            };
            if !is_placeholder_title(&item.title) && !self.policy.is_good_purchase(&offer) {
                info!(%id, price, "reported price not acceptable");
                counter!("purchase_attempts_rejected_total", "reason" => "price").increment(1);
                return PurchaseOutcome::RejectedPrice;
            }
        }

        let _guard = {
            let mut set = self.in_flight.lock().expect("in-flight mutex poisoned");
            if !set.insert(identity.clone()) {
                info!(%id, "attempt already in flight, dropping");
                counter!("purchase_attempts_inflight_dropped_total").increment(1);
                return PurchaseOutcome::DroppedInFlight;
            }
            InFlightGuard {
                set: &self.in_flight,
                identity: identity.clone(),
            }
        };
        self.launches.fetch_add(1, Ordering::SeqCst);

        let outcome = self.run_attempt(item, &identity).await;
        match &outcome {
            PurchaseOutcome::Claimed { .. } => {
                counter!("purchase_success_total").increment(1);
                info!(%id, ?outcome, "purchase attempt finished");
            }
            PurchaseOutcome::ClaimFailed { .. } => error!(%id, ?outcome, "purchase attempt finished"),
            _ => info!(%id, ?outcome, "purchase attempt finished"),
        }
        self.results.publish(PurchaseResult {
            time: now_ms(),
            url: item.url.clone(),
            title: item.title.clone(),
            identity,
            outcome: outcome.clone(),
        });
        outcome
    }

    async fn open_pages(&self, identity: &ItemIdentity, url: &str) -> Vec<(OpenPage, strategy::PagePlan)> {
        let mut pages = Vec::new();
        for s in &self.strategies {
            for (n, plan) in plan_pages(s.check_type, url).into_iter().enumerate() {
                let log_id = identity.log_id(&format!("{}-{n}", s.id));
                match s.factory.open(&log_id).await {
                    Ok(session) => pages.push((
                        OpenPage {
                            strategy: s.id.clone(),
                            log_id,
                            session,
                        },
                        plan,
                    )),
                    Err(e) => warn!(id = %log_id, error = %e, "could not open strategy page, skipping"),
                }
            }
        }
        pages
    }

    async fn run_attempt(&self, item: &FoundItem, identity: &ItemIdentity) -> PurchaseOutcome {
        if self.strategies.is_empty() {
            warn!(item = %identity, "no purchase strategies configured");
            return PurchaseOutcome::NoStrategies;
        }
        let url = if is_product_url(&item.url) {
            product_url(&identity.tld, &identity.product_id)
        } else {
            item.url.clone()
        };

        let planned = self.open_pages(identity, &url).await;
        if planned.is_empty() {
            return PurchaseOutcome::NoStrategies;
        }

        let shared = Arc::new(SharedPurchaseStatus::new());
        let deadline = Instant::now() + Duration::from_secs(self.settings.refresh_minutes * 60);
        let mut pages = Vec::with_capacity(planned.len());
        let mut stops = Vec::with_capacity(planned.len());
        let mut handles = Vec::with_capacity(planned.len());
        for (page, plan) in planned {
            let stop = Arc::new(AtomicBool::new(false));
            let refresher = Refresher {
                log_id: page.log_id.clone(),
                plan,
                session: page.session.clone(),
                reported_price: item.parsed_price,
                shared: shared.clone(),
                stop: stop.clone(),
                deadline,
                pauser: self.pauser.clone(),
                refresh_pause: Duration::from_millis(self.settings.refresh_pause_ms),
            };
            handles.push(tokio::spawn(refresher.run()));
            stops.push(stop);
            pages.push(page);
        }

        let outcome = match first_success(handles, &stops).await {
            None => {
                info!(item = %identity, "no strategy saw the item available");
                if shared.is_not_preferred() {
                    PurchaseOutcome::NotFromPreferred
                } else {
                    PurchaseOutcome::NotAvailable
                }
            }
            Some((winner, info)) => self.claim(&pages[winner], identity, &info).await,
        };

        for page in &pages {
            close_quietly(&page.log_id, page.session.close()).await;
        }
        outcome
    }

    async fn claim(&self, page: &OpenPage, identity: &ItemIdentity, info: &ProductInfo) -> PurchaseOutcome {
        let id = page.log_id.as_str();
        if !is_from_preferred(info) {
            info!(id, "not sold by the preferred source, stopping");
            return PurchaseOutcome::NotFromPreferred;
        }
        if info.source.has_delivery_troubles {
            warn!(id, "preferred source reports delivery troubles, stopping");
            return PurchaseOutcome::DeliveryTrouble;
        }
        let Some(offer) = product_to_offer(info) else {
            return PurchaseOutcome::NotFromPreferred;
        };
        if !self.policy.is_good_title(&offer.title) || !self.policy.is_good_purchase(&offer) {
            info!(id, title = %offer.title, price = ?offer.eur_price, "offer rejected after the race");
            return PurchaseOutcome::RejectedAfterRace;
        }

        let mut opts = ClaimOptions::new(
            id,
            &identity.product_id,
            offer.location,
            Duration::from_secs(self.settings.purchase_minutes * 60),
        );
        opts.test_run = self.settings.test_run;
        opts.max_rounds = self.settings.max_claim_rounds;

        match buy_now(page.session.as_ref(), &opts, &self.policy, &self.pauser).await {
            Ok(true) => PurchaseOutcome::Claimed {
                strategy: page.strategy.clone(),
                test_run: self.settings.test_run,
            },
            Ok(false) => PurchaseOutcome::ClaimFailed {
                strategy: page.strategy.clone(),
            },
            Err(e) => {
                error!(id, error = %e, "claim failed");
                PurchaseOutcome::ClaimFailed {
                    strategy: page.strategy.clone(),
                }
            }
        }
    }
}
