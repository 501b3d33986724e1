//! Purchase-claim state machine.
//!
//! After each click the page is resolved by racing "the URL changed to a
//! known page" against "a known marker appeared". Exactly one state
//! predicate must hold for the winning signal, otherwise the page state is
//! unclear and the attempt fails. Intermediate steps (add-on offers, consent
//! upsells) loop back into the race with a reduced candidate set; a vanished
//! item goes back to the product page and retries, for a bounded number of
//! rounds and within the attempt's stop time.

use async_trait::async_trait;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use crate::error::{WatchError, WatchResult};
use crate::pauser::Pauser;
use crate::purchase::filters::{product_to_offer, OfferLocation, PurchasePolicy};
use crate::purchase::strategy::FetchOtherSellers;
use crate::purchase::ProductSession;

const RACE_RETRIES: usize = 3;
const GO_BACK_STEPS: usize = 3;

/// Page addresses the flow can land on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UrlPattern {
    Upsell,
    Cart,
    Checkout,
    ThankYou,
    Vanished,
}

impl UrlPattern {
    pub const ALL: [UrlPattern; 5] = [
        UrlPattern::Upsell,
        UrlPattern::Cart,
        UrlPattern::Checkout,
        UrlPattern::ThankYou,
        UrlPattern::Vanished,
    ];

    /// Every fragment must appear in the URL.
    pub fn fragments(self) -> &'static [&'static str] {
        match self {
            UrlPattern::Upsell => &["/buy/primeinterstitial/"],
            UrlPattern::Cart => &["/gp/cart/view.html"],
            UrlPattern::Checkout => &["/gp/buy/spc/handlers/display.html"],
            UrlPattern::ThankYou => &["/gp/buy/thankyou/handlers/display.html"],
            UrlPattern::Vanished => &["/gp/buy/itemselect/handlers/display.html", "useCase=outOfStock"],
        }
    }

    pub fn matches(self, url: &str) -> bool {
        self.fragments().iter().all(|f| url.contains(f))
    }
}

/// Page elements the flow reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Marker {
    BuyNowButton,
    QuickOfferAddToCart,
    QuickBuyConfirm,
    UpsellDecline,
    UpsellDeclineAlt,
    CartItems,
    CartProceed,
    AddOnPane,
    AddOnDecline,
    CheckoutSubmit,
    CheckoutPlace,
    PurchaseConfirmed,
    ChangeQuantity,
}

impl Marker {
    /// Markers that identify a page after a click.
    pub const STATE_MARKERS: [Marker; 10] = [
        Marker::QuickBuyConfirm,
        Marker::UpsellDecline,
        Marker::UpsellDeclineAlt,
        Marker::CartItems,
        Marker::CartProceed,
        Marker::AddOnPane,
        Marker::CheckoutSubmit,
        Marker::CheckoutPlace,
        Marker::PurchaseConfirmed,
        Marker::ChangeQuantity,
    ];

    pub fn selector(self) -> &'static str {
        match self {
            Marker::BuyNowButton => "#buy-now-button",
            Marker::QuickOfferAddToCart => "#mbc-buybutton-addtocart-1-announce",
            Marker::QuickBuyConfirm => "#turbo-checkout-pyo-button",
            Marker::UpsellDecline => "#prime-declineCTA",
            Marker::UpsellDeclineAlt => "#prime-no-thanks",
            Marker::CartItems => "#sc-active-cart",
            Marker::CartProceed => "#hlb-ptc-btn-native",
            Marker::AddOnPane => "#attach-warranty-pane:not(.aok-hidden)",
            Marker::AddOnDecline => "#attachSiNoCoverage-announce",
            Marker::CheckoutSubmit => "#submitOrderButtonId",
            Marker::CheckoutPlace => "#placeYourOrder",
            Marker::PurchaseConfirmed => "#widget-purchaseConfirmationStatus",
            Marker::ChangeQuantity => "#changeQuantityFormId",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimAction {
    BuyNow,
    AddFromOtherSellers,
    AddQuickOffer,
    ConfirmQuickBuy,
    DeclineAddOn,
    DeclineUpsell(Marker),
    ProceedFromCart,
    ProceedFromCartOverview,
    PlaceOrder(Marker),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    Url(String),
    Marker(Marker),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimState {
    QuickConfirmDialog,
    AddOnOffer,
    ConsentUpsell,
    CartSummary,
    CheckoutPage,
    VanishedError,
    Success,
}

/// The page operations the claim flow drives.
#[async_trait]
pub trait ClaimPage: Send + Sync {
    async fn current_url(&self) -> WatchResult<String>;

    async fn click(&self, action: ClaimAction) -> WatchResult<()>;

    /// The new URL once it matches one of `patterns`; `None` on its own timeout.
    async fn wait_for_url(&self, patterns: &[UrlPattern]) -> WatchResult<Option<String>>;

    /// The first of `markers` to appear; `None` on its own timeout.
    async fn wait_for_marker(&self, markers: &[Marker]) -> WatchResult<Option<Marker>>;

    async fn has_marker(&self, marker: Marker) -> WatchResult<bool>;

    async fn which_marker(&self, markers: &[Marker]) -> WatchResult<Option<Marker>>;

    /// Subtotal shown on the cart summary, `None` for an empty cart.
    async fn cart_total(&self) -> WatchResult<Option<String>>;

    async fn go_back(&self) -> WatchResult<()>;

    /// Waits for the checkout page to finish loading.
    async fn wait_checkout_ready(&self) -> WatchResult<()>;
}

/// Maps a winning signal to exactly one state.
pub fn resolve_state(signal: &Signal) -> WatchResult<ClaimState> {
    let url = |p: UrlPattern| matches!(signal, Signal::Url(u) if p.matches(u));
    let marker = |ms: &[Marker]| matches!(signal, Signal::Marker(m) if ms.contains(m));

    let predicates = [
        (ClaimState::QuickConfirmDialog, marker(&[Marker::QuickBuyConfirm])),
        (ClaimState::AddOnOffer, marker(&[Marker::AddOnPane])),
        (
            ClaimState::ConsentUpsell,
            url(UrlPattern::Upsell) || marker(&[Marker::UpsellDecline, Marker::UpsellDeclineAlt]),
        ),
        (
            ClaimState::CartSummary,
            url(UrlPattern::Cart) || marker(&[Marker::CartItems, Marker::CartProceed]),
        ),
        (
            ClaimState::CheckoutPage,
            url(UrlPattern::Checkout) || marker(&[Marker::CheckoutSubmit, Marker::CheckoutPlace]),
        ),
        (
            ClaimState::Success,
            url(UrlPattern::ThankYou) || marker(&[Marker::PurchaseConfirmed]),
        ),
        (
            ClaimState::VanishedError,
            url(UrlPattern::Vanished) || marker(&[Marker::ChangeQuantity]),
        ),
    ];

    let mut matching = predicates.iter().filter(|(_, hit)| *hit).map(|(s, _)| *s);
    match (matching.next(), matching.next()) {
        (Some(state), None) => Ok(state),
        _ => Err(WatchError::Structural(format!(
            "page state unclear after {signal:?}"
        ))),
    }
}

/// Races the URL monitor against the marker monitor. A side that gives up
/// (`None`) leaves the other one running; `None` only when both gave up.
pub async fn race_signal<P: ClaimPage + ?Sized>(
    page: &P,
    urls: &[UrlPattern],
    markers: &[Marker],
) -> WatchResult<Option<Signal>> {
    let url_wait = page.wait_for_url(urls);
    let marker_wait = page.wait_for_marker(markers);
    tokio::pin!(url_wait);
    tokio::pin!(marker_wait);
    let mut url_done = false;
    let mut marker_done = false;

    while !(url_done && marker_done) {
        tokio::select! {
            res = &mut url_wait, if !url_done => match res? {
                Some(u) => return Ok(Some(Signal::Url(u))),
                None => url_done = true,
            },
            res = &mut marker_wait, if !marker_done => match res? {
                Some(m) => return Ok(Some(Signal::Marker(m))),
                None => marker_done = true,
            },
        }
    }
    Ok(None)
}

/// Clicks and, concurrently, waits for the page to settle in one state.
pub async fn wait_for_winner<P: ClaimPage + ?Sized>(
    page: &P,
    log_id: &str,
    action: ClaimAction,
    urls: &[UrlPattern],
    markers: &[Marker],
) -> WatchResult<ClaimState> {
    let (clicked, mut winner) = tokio::join!(page.click(action), race_signal(page, urls, markers));
    clicked?;

    let mut retries = 0;
    let signal = loop {
        match winner? {
            Some(signal) => break signal,
            None if retries < RACE_RETRIES => {
                retries += 1;
                warn!(id = log_id, ?action, retries, "nothing recognised yet, waiting again");
                winner = race_signal(page, urls, markers).await;
            }
            None => {
                error!(id = log_id, ?action, "no page change recognised");
                return Err(WatchError::Structural("no page change recognised".into()));
            }
        }
    };

    let state = resolve_state(&signal).map_err(|e| {
        error!(id = log_id, ?signal, "page state unclear");
        e
    })?;
    info!(id = log_id, ?state, ?signal, "page state resolved");
    Ok(state)
}

#[derive(Debug, Clone)]
pub struct ClaimOptions {
    pub log_id: String,
    pub product_id: String,
    pub location: OfferLocation,
    pub stop_at: Instant,
    pub test_run: bool,
    pub max_rounds: u32,
}

impl ClaimOptions {
    pub fn new(log_id: &str, product_id: &str, location: OfferLocation, budget: Duration) -> Self {
        Self {
            log_id: log_id.to_string(),
            product_id: product_id.to_string(),
            location,
            stop_at: Instant::now() + budget,
            test_run: false,
            max_rounds: 5,
        }
    }
}

async fn go_back_to_product<P: ClaimPage + ?Sized>(page: &P, opts: &ClaimOptions) -> WatchResult<()> {
    let needle = format!("/{}", opts.product_id);
    for _ in 0..GO_BACK_STEPS {
        let current = page.current_url().await?;
        let path = current.split('?').next().unwrap_or_default();
        if path.contains(&needle) {
            return Ok(());
        }
        info!(id = %opts.log_id, at = path, "going back to the product page");
        page.go_back().await?;
    }
    Ok(())
}

enum Round {
    Done(bool),
    /// Back on the product page; recheck the offer and go again.
    Retry,
}

async fn claim_round<S: ProductSession + ?Sized>(
    session: &S,
    opts: &ClaimOptions,
    policy: &PurchasePolicy,
    pauser: &Pauser,
    recheck: bool,
) -> WatchResult<Round> {
    let id = opts.log_id.as_str();
    if recheck {
        let fetch = match opts.location {
            OfferLocation::OtherSellers => FetchOtherSellers::Always,
            _ => FetchOtherSellers::Never,
        };
        let info = session.fetch_info(fetch).await?;
        let Some(offer) = info.as_ref().and_then(product_to_offer) else {
            info!(id, "rechecked, no longer sold by the preferred source");
            return Ok(Round::Done(false));
        };
        if !opts.test_run && !policy.is_good_purchase(&offer) {
            info!(id, "rechecked, offer rejected this time");
            return Ok(Round::Done(false));
        }
    }
    pauser.pause_check().await;

    let trigger = match opts.location {
        OfferLocation::DirectBuy => {
            if !session.has_marker(Marker::BuyNowButton).await? {
                error!(id, "no buy now button");
                return Ok(Round::Done(false));
            }
            ClaimAction::BuyNow
        }
        OfferLocation::OtherSellersQuickOffer => {
            if !session.has_marker(Marker::QuickOfferAddToCart).await? {
                error!(id, "no add to cart button for the quick offer");
                return Ok(Round::Done(false));
            }
            ClaimAction::AddQuickOffer
        }
        OfferLocation::OtherSellers => ClaimAction::AddFromOtherSellers,
    };

    let mut urls = UrlPattern::ALL.to_vec();
    let mut markers = Marker::STATE_MARKERS.to_vec();
    let mut state = wait_for_winner(session, id, trigger, &urls, &markers).await?;
    pauser.pause_check().await;

    if state == ClaimState::QuickConfirmDialog {
        if !session.has_marker(Marker::QuickBuyConfirm).await? {
            error!(id, "quick checkout button expected but missing");
            return Ok(Round::Done(false));
        }
        if !opts.test_run {
            session.click(ClaimAction::ConfirmQuickBuy).await?;
        }
        info!(id, test_run = opts.test_run, "purchase made through quick checkout");
        return Ok(Round::Done(true));
    }

    if state == ClaimState::AddOnOffer {
        if session.has_marker(Marker::AddOnDecline).await? {
            info!(id, "declining add-on");
            markers.retain(|m| *m != Marker::AddOnPane);
            state = wait_for_winner(session, id, ClaimAction::DeclineAddOn, &urls, &markers).await?;
        } else {
            error!(id, "add-on offered but no decline button");
        }
    }
    pauser.pause_check().await;

    if state == ClaimState::ConsentUpsell {
        match session
            .which_marker(&[Marker::UpsellDecline, Marker::UpsellDeclineAlt])
            .await?
        {
            Some(decline) => {
                info!(id, "declining upsell");
                markers.retain(|m| *m != decline);
                urls.retain(|u| *u != UrlPattern::Upsell);
                state = wait_for_winner(session, id, ClaimAction::DeclineUpsell(decline), &urls, &markers)
                    .await?;
            }
            None => error!(id, "upsell page without a decline button"),
        }
    }
    pauser.pause_check().await;

    if state == ClaimState::CartSummary {
        let proceed = match session
            .which_marker(&[Marker::CartItems, Marker::CartProceed])
            .await?
        {
            None => {
                warn!(id, "cart summary without items or proceed link");
                None
            }
            Some(Marker::CartItems) => match session.cart_total().await? {
                None => {
                    warn!(id, "empty cart returned");
                    None
                }
                Some(total) => {
                    info!(id, %total, "cart found, proceeding");
                    Some(ClaimAction::ProceedFromCart)
                }
            },
            Some(_) => Some(ClaimAction::ProceedFromCartOverview),
        };
        let Some(proceed) = proceed else {
            go_back_to_product(session, opts).await?;
            return Ok(Round::Retry);
        };
        state = wait_for_winner(session, id, proceed, &urls, &markers).await?;
        if state != ClaimState::CheckoutPage {
            info!(id, ?state, "lost at the cart");
            go_back_to_product(session, opts).await?;
            return Ok(Round::Retry);
        }
    }
    pauser.pause_check().await;

    if state == ClaimState::CheckoutPage {
        let Some(place) = session
            .which_marker(&[Marker::CheckoutSubmit, Marker::CheckoutPlace])
            .await?
        else {
            error!(id, "checkout page without a place order button");
            return Ok(Round::Done(false));
        };
        session.wait_checkout_ready().await?;
        if opts.test_run {
            info!(id, "test run, purchase would have been made at checkout");
            return Ok(Round::Done(true));
        }
        state = wait_for_winner(session, id, ClaimAction::PlaceOrder(place), &urls, &markers).await?;
    }
    pauser.pause_check().await;

    match state {
        ClaimState::VanishedError => {
            warn!(id, "item vanished at checkout, going back and trying again");
            go_back_to_product(session, opts).await?;
            Ok(Round::Retry)
        }
        ClaimState::Success => {
            info!(id, "purchase made");
            Ok(Round::Done(true))
        }
        other => {
            error!(id, state = ?other, "claim did not succeed");
            Ok(Round::Done(false))
        }
    }
}

/// Runs the claim flow on an already-open product page. `Ok(true)` when the
/// purchase was made (or would have been, in a test run). Every round is
/// capped by `stop_at`.
pub async fn buy_now<S: ProductSession + ?Sized>(
    session: &S,
    opts: &ClaimOptions,
    policy: &PurchasePolicy,
    pauser: &Pauser,
) -> WatchResult<bool> {
    let id = opts.log_id.as_str();
    let stop_at = tokio::time::Instant::from_std(opts.stop_at);
    let mut recheck = false;

    for round in 0..opts.max_rounds {
        pauser.pause_check().await;
        if Instant::now() > opts.stop_at {
            error!(id, "time for buying is over, not trying anymore");
            return Ok(false);
        }
        info!(id, round, location = ?opts.location, test_run = opts.test_run, "attempting purchase");

        match tokio::time::timeout_at(stop_at, claim_round(session, opts, policy, pauser, recheck)).await {
            Err(_) => {
                error!(id, round, "time for buying ran out mid-round");
                return Ok(false);
            }
            Ok(res) => match res? {
                Round::Done(bought) => return Ok(bought),
                Round::Retry => recheck = true,
            },
        }
    }

    error!(id, rounds = opts.max_rounds, "claim rounds exhausted");
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_predicate_resolves() {
        let s = Signal::Url("https://www.amazon.it/gp/cart/view.html?ref=x".into());
        assert_eq!(resolve_state(&s).unwrap(), ClaimState::CartSummary);
        let s = Signal::Marker(Marker::CheckoutPlace);
        assert_eq!(resolve_state(&s).unwrap(), ClaimState::CheckoutPage);
        let s = Signal::Url(
            "https://www.amazon.it/gp/buy/itemselect/handlers/display.html?useCase=outOfStock".into(),
        );
        assert_eq!(resolve_state(&s).unwrap(), ClaimState::VanishedError);
    }

    #[test]
    fn two_true_predicates_are_an_unclear_state() {
        let s = Signal::Url(
            "https://www.amazon.it/gp/cart/view.html?next=/gp/buy/spc/handlers/display.html".into(),
        );
        assert!(matches!(resolve_state(&s), Err(WatchError::Structural(_))));
    }

    #[test]
    fn zero_true_predicates_are_an_unclear_state() {
        let s = Signal::Url("https://www.amazon.it/gp/help".into());
        assert!(resolve_state(&s).is_err());
        let s = Signal::Marker(Marker::BuyNowButton);
        assert!(resolve_state(&s).is_err());
    }

    #[test]
    fn vanished_needs_both_fragments() {
        assert!(!UrlPattern::Vanished.matches("/gp/buy/itemselect/handlers/display.html"));
    }
}
