// tests/purchase_race.rs
//
// Purchase coordination against scripted in-memory pages.
//
// Covered:
// - filters reject before anything is launched
// - one attempt per identity while in flight, released on cancellation
// - a winning page runs the claim flow (test run stops at checkout)
// - another seller at the reported price ends the attempt
// - claim flow: vanished item retried, unclear state, nothing recognised
// - refreshers back off on an unreachable page and survive a failed first load
// - a stalled page cannot hold the claim past its stop time
// - dispatch starts the race before slow notifications, once per window

use async_trait::async_trait;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use availability_watch::app::Dispatcher;
use availability_watch::error::{WatchError, WatchResult};
use availability_watch::identity::ItemIdentity;
use availability_watch::model::{
    ComputedProductInfo, FoundItem, ProductInfo, RawProductInfo, SharedPurchaseStatus,
};
use availability_watch::notify::{Notifier, NotifierMux, RelevanceFilter};
use availability_watch::pauser::Pauser;
use availability_watch::purchase::claim::{buy_now, ClaimAction, ClaimOptions, ClaimPage, Marker, UrlPattern};
use availability_watch::purchase::filters::{OfferLocation, PurchasePolicy};
use availability_watch::purchase::strategy::{plan_pages, CheckType, FetchOtherSellers, Refresher};
use availability_watch::purchase::{
    AttemptSettings, ProductSession, PurchaseCoordinator, PurchaseOutcome, SessionFactory, Strategy,
};

const URL: &str = "https://www.amazon.it/dp/B08KHHF881";

#[derive(Clone, Copy)]
enum Shelf {
    Empty,
    Preferred,
    OtherSeller(f64),
}

#[derive(Default)]
struct FakeSession {
    shelf: Mutex<Option<Shelf>>,
    present: Mutex<HashSet<Marker>>,
    urls: Mutex<VecDeque<String>>,
    markers: Mutex<VecDeque<Marker>>,
    clicks: Mutex<Vec<ClaimAction>>,
    fetches: AtomicUsize,
    navigations: AtomicUsize,
    /// Navigations still failing with a refused connection.
    unreachable_for: AtomicUsize,
    /// Marker waits hang instead of answering.
    stall: AtomicBool,
    closed: AtomicBool,
}

impl FakeSession {
    fn new(shelf: Shelf) -> Arc<Self> {
        let s = Self::default();
        *s.shelf.lock().unwrap() = Some(shelf);
        s.present.lock().unwrap().insert(Marker::BuyNowButton);
        Arc::new(s)
    }

    fn after_clicks(&self, markers: &[Marker]) {
        self.markers.lock().unwrap().extend(markers.iter().copied());
    }

    fn show(&self, marker: Marker) {
        self.present.lock().unwrap().insert(marker);
    }

    fn clicks(&self) -> Vec<ClaimAction> {
        self.clicks.lock().unwrap().clone()
    }
}

#[async_trait]
impl ClaimPage for FakeSession {
    async fn current_url(&self) -> WatchResult<String> {
        Ok(URL.to_string())
    }

    async fn click(&self, action: ClaimAction) -> WatchResult<()> {
        self.clicks.lock().unwrap().push(action);
        Ok(())
    }

    async fn wait_for_url(&self, _patterns: &[UrlPattern]) -> WatchResult<Option<String>> {
        Ok(self.urls.lock().unwrap().pop_front())
    }

    async fn wait_for_marker(&self, _markers: &[Marker]) -> WatchResult<Option<Marker>> {
        if self.stall.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        Ok(self.markers.lock().unwrap().pop_front())
    }

    async fn has_marker(&self, marker: Marker) -> WatchResult<bool> {
        Ok(self.present.lock().unwrap().contains(&marker))
    }

    async fn which_marker(&self, markers: &[Marker]) -> WatchResult<Option<Marker>> {
        let present = self.present.lock().unwrap();
        Ok(markers.iter().copied().find(|m| present.contains(m)))
    }

    async fn cart_total(&self) -> WatchResult<Option<String>> {
        Ok(Some("499,00 €".into()))
    }

    async fn go_back(&self) -> WatchResult<()> {
        Ok(())
    }

    async fn wait_checkout_ready(&self) -> WatchResult<()> {
        Ok(())
    }
}

#[async_trait]
impl ProductSession for FakeSession {
    async fn navigate(&self, _url: &str) -> WatchResult<()> {
        self.navigations.fetch_add(1, Ordering::SeqCst);
        if self.closed.load(Ordering::SeqCst) {
            return Err(WatchError::Closed);
        }
        let refused = self
            .unreachable_for
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(WatchError::Transient("connection refused".into()));
        }
        Ok(())
    }

    async fn fetch_info(&self, _other_sellers: FetchOtherSellers) -> WatchResult<Option<ProductInfo>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let shelf = self.shelf.lock().unwrap().unwrap_or(Shelf::Empty);
        let source = RawProductInfo {
            title: "Gigabyte GeForce RTX 3070 Gaming OC".into(),
            product_id: "B08KHHF881".into(),
            has_buy_now_button: true,
            ..Default::default()
        };
        let computed = match shelf {
            Shelf::Empty => return Ok(None),
            Shelf::Preferred => ComputedProductInfo {
                eur_price: Some(499.0),
                is_available: true,
                is_from_preferred: true,
                is_available_from_preferred: true,
                ..Default::default()
            },
            Shelf::OtherSeller(price) => ComputedProductInfo {
                eur_price: Some(price),
                is_available: true,
                ..Default::default()
            },
        };
        Ok(Some(ProductInfo { source, computed }))
    }

    async fn close(&self) -> WatchResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(WatchError::Closed);
        }
        Ok(())
    }
}

struct FakeFactory {
    session: Arc<FakeSession>,
}

#[async_trait]
impl SessionFactory for FakeFactory {
    async fn open(&self, _log_id: &str) -> WatchResult<Arc<dyn ProductSession>> {
        let session: Arc<dyn ProductSession> = self.session.clone();
        Ok(session)
    }
}

fn coordinator(session: &Arc<FakeSession>, check_type: CheckType, settings: AttemptSettings) -> PurchaseCoordinator {
    let factory = Arc::new(FakeFactory {
        session: session.clone(),
    });
    PurchaseCoordinator::new(
        vec![Strategy {
            id: "buyer-a".into(),
            check_type,
            factory,
        }],
        PurchasePolicy::default(),
        Arc::new(Pauser::new()),
        settings,
    )
}

fn quick_settings() -> AttemptSettings {
    AttemptSettings {
        refresh_minutes: 1,
        purchase_minutes: 1,
        refresh_pause_ms: 1,
        test_run: true,
        max_claim_rounds: 3,
    }
}

fn item(title: &str, price: Option<f64>) -> FoundItem {
    FoundItem {
        time: 0,
        url: URL.into(),
        title: title.into(),
        price: price.map(|p| format!("{p},00 €")).unwrap_or_default(),
        parsed_price: price,
        origin: "test".into(),
        valid: true,
        price_limit: None,
    }
}

#[tokio::test]
async fn filters_reject_before_launching() {
    let session = FakeSession::new(Shelf::Preferred);
    let c = coordinator(&session, CheckType::DirectOnly, quick_settings());

    let bundle = item("RTX 3070 and RTX 3080 combo", Some(700.0));
    assert_eq!(c.attempt_purchase(&bundle).await, PurchaseOutcome::RejectedTitle);

    let pricey = item("Gigabyte RTX 3070", Some(999.0));
    assert_eq!(c.attempt_purchase(&pricey).await, PurchaseOutcome::RejectedPrice);

    assert_eq!(c.entries(), 2);
    assert_eq!(c.launches(), 0);
    assert_eq!(session.fetches.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn no_strategies_means_nothing_to_race() {
    let c = PurchaseCoordinator::new(
        Vec::new(),
        PurchasePolicy::default(),
        Arc::new(Pauser::new()),
        quick_settings(),
    );
    let outcome = c.attempt_purchase(&item("Gigabyte RTX 3070", Some(499.0))).await;
    assert_eq!(outcome, PurchaseOutcome::NoStrategies);
}

#[tokio::test]
async fn winning_page_claims_in_a_test_run() {
    let session = FakeSession::new(Shelf::Preferred);
    session.show(Marker::CheckoutPlace);
    session.after_clicks(&[Marker::CheckoutPlace]);
    let c = coordinator(&session, CheckType::DirectOnly, quick_settings());

    let outcome = c.attempt_purchase(&item("Gigabyte RTX 3070", Some(499.0))).await;

    assert_eq!(
        outcome,
        PurchaseOutcome::Claimed {
            strategy: "buyer-a".into(),
            test_run: true
        }
    );
    // test runs never press the final button
    assert_eq!(session.clicks(), vec![ClaimAction::BuyNow]);
    assert!(session.closed.load(Ordering::SeqCst));
    assert!(!c.is_in_flight(&ItemIdentity::from_url(URL)));
}

#[tokio::test]
async fn other_seller_at_reported_price_ends_the_attempt() {
    let session = FakeSession::new(Shelf::OtherSeller(500.0));
    let c = coordinator(&session, CheckType::DirectOnly, quick_settings());

    let outcome = c.attempt_purchase(&item("Gigabyte RTX 3070", Some(499.0))).await;

    assert_eq!(outcome, PurchaseOutcome::NotFromPreferred);
    assert!(session.clicks().is_empty());
}

#[tokio::test]
async fn one_attempt_per_identity_while_in_flight() {
    let session = FakeSession::new(Shelf::Empty);
    let c = Arc::new(coordinator(&session, CheckType::DirectOnly, quick_settings()));

    let first = {
        let c = c.clone();
        tokio::spawn(async move { c.attempt_purchase(&item("Gigabyte RTX 3070", Some(499.0))).await })
    };
    for _ in 0..200 {
        if c.launches() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(c.launches(), 1);

    // same product, different link shape
    let mut again = item("Gigabyte RTX 3070", Some(499.0));
    again.url = "https://www.amazon.it/gp/product/B08KHHF881?tag=x".into();
    assert_eq!(c.attempt_purchase(&again).await, PurchaseOutcome::DroppedInFlight);
    assert_eq!(c.entries(), 2);
    assert_eq!(c.launches(), 1);

    // cancelling the attempt releases the identity
    first.abort();
    let _ = first.await;
    assert!(!c.is_in_flight(&ItemIdentity::from_url(URL)));
}

fn claim_options(test_run: bool) -> ClaimOptions {
    let mut opts = ClaimOptions::new(
        "it/B08KHHF881/claim",
        "B08KHHF881",
        OfferLocation::DirectBuy,
        Duration::from_secs(60),
    );
    opts.test_run = test_run;
    opts
}

#[tokio::test]
async fn vanished_item_is_retried_after_a_recheck() {
    let session = FakeSession::new(Shelf::Preferred);
    session.after_clicks(&[Marker::ChangeQuantity, Marker::PurchaseConfirmed]);
    let pauser = Pauser::new();

    let bought = buy_now(session.as_ref(), &claim_options(false), &PurchasePolicy::default(), &pauser)
        .await
        .unwrap();

    assert!(bought);
    assert_eq!(session.clicks(), vec![ClaimAction::BuyNow, ClaimAction::BuyNow]);
    assert_eq!(session.fetches.load(Ordering::SeqCst), 1, "one recheck before the retry");
}

#[tokio::test]
async fn recheck_stops_when_the_item_is_gone() {
    let session = FakeSession::new(Shelf::Preferred);
    session.after_clicks(&[Marker::ChangeQuantity]);
    *session.shelf.lock().unwrap() = Some(Shelf::Empty);
    let pauser = Pauser::new();

    let bought = buy_now(session.as_ref(), &claim_options(false), &PurchasePolicy::default(), &pauser)
        .await
        .unwrap();
    assert!(!bought);
}

#[tokio::test]
async fn ambiguous_page_is_an_error() {
    let session = FakeSession::new(Shelf::Preferred);
    session
        .urls
        .lock()
        .unwrap()
        .push_back("https://www.amazon.it/gp/cart/view.html?next=/gp/buy/spc/handlers/display.html".into());
    let pauser = Pauser::new();

    let err = buy_now(session.as_ref(), &claim_options(false), &PurchasePolicy::default(), &pauser)
        .await
        .unwrap_err();
    assert!(matches!(err, WatchError::Structural(_)));
}

#[tokio::test]
async fn nothing_recognised_after_the_click_is_an_error() {
    let session = FakeSession::new(Shelf::Preferred);
    let pauser = Pauser::new();

    let err = buy_now(session.as_ref(), &claim_options(false), &PurchasePolicy::default(), &pauser)
        .await
        .unwrap_err();
    assert!(matches!(err, WatchError::Structural(m) if m.contains("no page change")));
}

#[tokio::test]
async fn missing_buy_button_gives_up() {
    let session = FakeSession::new(Shelf::Preferred);
    session.present.lock().unwrap().clear();
    let pauser = Pauser::new();

    let bought = buy_now(session.as_ref(), &claim_options(true), &PurchasePolicy::default(), &pauser)
        .await
        .unwrap();
    assert!(!bought);
    assert!(session.clicks().is_empty());
}

#[tokio::test]
async fn stalled_page_cannot_outlive_the_stop_time() {
    let session = FakeSession::new(Shelf::Preferred);
    session.stall.store(true, Ordering::SeqCst);
    let opts = ClaimOptions::new(
        "it/B08KHHF881/claim",
        "B08KHHF881",
        OfferLocation::DirectBuy,
        Duration::from_millis(200),
    );
    let pauser = Pauser::new();

    let bought = tokio::time::timeout(
        Duration::from_secs(5),
        buy_now(session.as_ref(), &opts, &PurchasePolicy::default(), &pauser),
    )
    .await
    .expect("claim should stop at its stop time")
    .unwrap();
    assert!(!bought);
    assert_eq!(session.clicks(), vec![ClaimAction::BuyNow]);
}

fn refresher(session: &Arc<FakeSession>, budget: Duration) -> Refresher {
    Refresher {
        log_id: "it/B08KHHF881/buyer-a-0".into(),
        plan: plan_pages(CheckType::DirectOnly, URL).remove(0),
        session: session.clone(),
        reported_price: Some(499.0),
        shared: Arc::new(SharedPurchaseStatus::new()),
        stop: Arc::new(AtomicBool::new(false)),
        deadline: Instant::now() + budget,
        pauser: Arc::new(Pauser::new()),
        refresh_pause: Duration::from_millis(1),
    }
}

#[tokio::test]
async fn unreachable_page_is_retried_with_a_pause() {
    let session = FakeSession::new(Shelf::Preferred);
    session.unreachable_for.store(usize::MAX, Ordering::SeqCst);

    let res = refresher(&session, Duration::from_millis(500)).run().await;

    assert!(matches!(res, Err(WatchError::Timeout(_))), "got {res:?}");
    let navigations = session.navigations.load(Ordering::SeqCst);
    assert!((2..=20).contains(&navigations), "navigated {navigations} times");
    assert_eq!(session.fetches.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn failed_first_load_does_not_end_the_strategy() {
    let session = FakeSession::new(Shelf::Preferred);
    session.unreachable_for.store(2, Ordering::SeqCst);

    let found = refresher(&session, Duration::from_secs(10))
        .run()
        .await
        .unwrap()
        .expect("item shows up once the page loads");

    assert!(found.computed.is_available_from_preferred);
    assert_eq!(session.navigations.load(Ordering::SeqCst), 3);
}

struct SlowWebhook {
    sent: Arc<AtomicUsize>,
}

#[async_trait]
impl Notifier for SlowWebhook {
    fn name(&self) -> &'static str {
        "slow-webhook"
    }

    async fn send(&self, _item: &FoundItem) -> anyhow::Result<()> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        self.sent.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn dispatch_starts_the_race_before_slow_notifications() {
    let session = FakeSession::new(Shelf::Preferred);
    session.show(Marker::CheckoutPlace);
    session.after_clicks(&[Marker::CheckoutPlace]);
    let c = Arc::new(coordinator(&session, CheckType::DirectOnly, quick_settings()));
    let sent = Arc::new(AtomicUsize::new(0));
    let mut notifier = NotifierMux::new(RelevanceFilter::default());
    notifier.push(Box::new(SlowWebhook { sent: sent.clone() }));
    let d = Arc::new(Dispatcher::new(60, notifier, Some(c.clone())));

    let first = {
        let d = d.clone();
        tokio::spawn(async move { d.dispatch(item("Gigabyte RTX 3070", Some(499.0))).await })
    };
    for _ in 0..200 {
        if c.launches() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(c.entries(), 1);
    assert_eq!(c.launches(), 1);
    assert!(!first.is_finished(), "webhook still being delivered");
    assert_eq!(sent.load(Ordering::SeqCst), 0);

    // same product through another link shape, inside the window
    let mut again = item("Gigabyte RTX 3070", Some(499.0));
    again.url = "https://www.amazon.it/gp/product/B08KHHF881?tag=x".into();
    assert!(!d.dispatch(again).await);
    assert_eq!(c.entries(), 1);

    first.abort();
}
