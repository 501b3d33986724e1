use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Client;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{build_client, get_html, html, site_root};
use crate::config::HttpSettings;
use crate::error::{WatchError, WatchResult};
use crate::identity::extract_product_id;
use crate::model::{ComputedProductInfo, ProductInfo, RawProductInfo};
use crate::price::PriceParser;
use crate::purchase::claim::{ClaimAction, ClaimPage, Marker, UrlPattern};
use crate::purchase::strategy::FetchOtherSellers;
use crate::purchase::{ProductSession, SessionFactory};
use crate::watcher::product::{MerchantVerdict, PageFetcher, PageFetcherFactory, PageVerdict};

static AVAILABILITY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"<div id="availability"[^>]*>(?:\s*<[^>]+>)*\s*([^<]+?)\s*<"#).expect("availability regex")
});

/// Availability text hinting that delivery is not guaranteed.
const DELIVERY_TROUBLE_HINTS: &[&str] = &["non disponibile", "not available", "nicht verfügbar", "indisponible", "no disponible"];

// ---------------------------------------------------------------------------
// Watcher pages
// ---------------------------------------------------------------------------

pub struct HttpPageFetcher {
    log_id: String,
    tld: String,
    client: Client,
}

impl HttpPageFetcher {
    async fn load(&self, url: &str) -> WatchResult<String> {
        let body = get_html(&self.client, url).await?;
        if html::has_captcha(&body) {
            return Err(WatchError::Captcha(url.to_string()));
        }
        Ok(body)
    }
}

#[async_trait]
impl PageFetcher for HttpPageFetcher {
    async fn open_root(&self) -> WatchResult<()> {
        self.load(&site_root(&self.tld)).await?;
        debug!(id = %self.log_id, "root page opened");
        Ok(())
    }

    async fn fetch(&self, url: &str) -> WatchResult<PageVerdict> {
        let body = self.load(url).await?;
        Ok(PageVerdict {
            merchant: html::merchant_verdict(&body),
            price: html::first_price(&body),
        })
    }

    async fn refresh_session(&self) -> WatchResult<()> {
        info!(id = %self.log_id, "refreshing session from the root page");
        self.open_root().await
    }
}

pub struct HttpPageFetcherFactory {
    http: HttpSettings,
    proxy: Option<String>,
}

impl HttpPageFetcherFactory {
    pub fn new(http: HttpSettings, proxy: Option<String>) -> Self {
        Self { http, proxy }
    }
}

impl PageFetcherFactory for HttpPageFetcherFactory {
    fn create(&self, log_id: &str, tld: &str) -> WatchResult<Arc<dyn PageFetcher>> {
        Ok(Arc::new(HttpPageFetcher {
            log_id: log_id.to_string(),
            tld: tld.to_string(),
            client: build_client(&self.http, self.proxy.as_deref())?,
        }))
    }
}

// ---------------------------------------------------------------------------
// Purchase sessions
// ---------------------------------------------------------------------------

/// Builds the uniform product snapshot from a product page.
pub fn parse_product(body: &str, url: &str, fetch: FetchOtherSellers, prices: &PriceParser) -> ProductInfo {
    let verdict = html::merchant_verdict(body);
    let price = html::first_price(body);
    let eur_price = price.as_deref().and_then(|p| prices.parse(p).ok());
    let availability = AVAILABILITY
        .captures(body)
        .map(|c| c[1].trim().to_string())
        .unwrap_or_default();
    let lower = availability.to_lowercase();

    let source = RawProductInfo {
        title: html::product_title(body).unwrap_or_default(),
        product_id: extract_product_id(url).unwrap_or_default(),
        price,
        has_delivery_troubles: DELIVERY_TROUBLE_HINTS.iter().any(|h| lower.contains(h)),
        availability,
        merchant_info: html::merchant_text(body),
        has_buy_now_button: body.contains("id=\"buy-now-button\""),
        has_other_sellers: body.contains("/gp/offer-listing/"),
        ..Default::default()
    };

    let is_from_preferred = verdict == MerchantVerdict::FromPreferred;
    let is_available_from_preferred = is_from_preferred && eur_price.is_some();
    let read_tray = match fetch {
        FetchOtherSellers::Never => false,
        FetchOtherSellers::Always | FetchOtherSellers::Both => true,
        FetchOtherSellers::WhenNotAvailable => !is_available_from_preferred,
    };
    let other_sellers = if read_tray {
        html::other_sellers(body, prices)
    } else {
        Vec::new()
    };

    ProductInfo {
        computed: ComputedProductInfo {
            eur_price,
            is_available: verdict != MerchantVerdict::NoMerchantElement && eur_price.is_some(),
            is_from_preferred,
            is_available_from_preferred,
            has_offerings: source.has_other_sellers || !other_sellers.is_empty(),
            is_preferred_among_other_sellers: other_sellers.iter().any(|o| o.is_preferred),
            other_sellers,
            ..Default::default()
        },
        source,
    }
}

fn marker_present(body: &str, marker: Marker) -> bool {
    let id = marker
        .selector()
        .trim_start_matches('#')
        .split(':')
        .next()
        .unwrap_or_default();
    body.contains(&format!("id=\"{id}\""))
}

#[derive(Default)]
struct PageState {
    url: String,
    body: String,
    closed: bool,
}

pub struct HttpProductSession {
    log_id: String,
    client: Client,
    prices: PriceParser,
    state: Mutex<PageState>,
}

impl HttpProductSession {
    fn unsupported(&self, what: &str) -> WatchError {
        WatchError::Unsupported(format!("{}: {what} needs a browser session", self.log_id))
    }
}

#[async_trait]
impl ClaimPage for HttpProductSession {
    async fn current_url(&self) -> WatchResult<String> {
        Ok(self.state.lock().await.url.clone())
    }

    async fn click(&self, action: ClaimAction) -> WatchResult<()> {
        Err(self.unsupported(&format!("{action:?}")))
    }

    async fn wait_for_url(&self, _patterns: &[UrlPattern]) -> WatchResult<Option<String>> {
        Ok(None)
    }

    async fn wait_for_marker(&self, _markers: &[Marker]) -> WatchResult<Option<Marker>> {
        Ok(None)
    }

    async fn has_marker(&self, marker: Marker) -> WatchResult<bool> {
        Ok(marker_present(&self.state.lock().await.body, marker))
    }

    async fn which_marker(&self, markers: &[Marker]) -> WatchResult<Option<Marker>> {
        let state = self.state.lock().await;
        Ok(markers.iter().copied().find(|m| marker_present(&state.body, *m)))
    }

    async fn cart_total(&self) -> WatchResult<Option<String>> {
        Ok(None)
    }

    async fn go_back(&self) -> WatchResult<()> {
        Err(self.unsupported("going back"))
    }

    async fn wait_checkout_ready(&self) -> WatchResult<()> {
        Ok(())
    }
}

#[async_trait]
impl ProductSession for HttpProductSession {
    async fn navigate(&self, url: &str) -> WatchResult<()> {
        if self.state.lock().await.closed {
            return Err(WatchError::Closed);
        }
        let body = get_html(&self.client, url).await?;
        if html::has_captcha(&body) {
            return Err(WatchError::Captcha(url.to_string()));
        }
        let mut state = self.state.lock().await;
        state.url = url.to_string();
        state.body = body;
        Ok(())
    }

    async fn fetch_info(&self, other_sellers: FetchOtherSellers) -> WatchResult<Option<ProductInfo>> {
        let state = self.state.lock().await;
        if state.body.is_empty() {
            return Ok(None);
        }
        Ok(Some(parse_product(&state.body, &state.url, other_sellers, &self.prices)))
    }

    async fn close(&self) -> WatchResult<()> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(WatchError::Closed);
        }
        *state = PageState {
            closed: true,
            ..PageState::default()
        };
        Ok(())
    }
}

pub struct HttpSessionFactory {
    http: HttpSettings,
    proxy: Option<String>,
    prices: PriceParser,
}

impl HttpSessionFactory {
    pub fn new(http: HttpSettings, proxy: Option<String>, prices: PriceParser) -> Self {
        Self { http, proxy, prices }
    }
}

#[async_trait]
impl SessionFactory for HttpSessionFactory {
    async fn boot(&self) -> WatchResult<()> {
        build_client(&self.http, self.proxy.as_deref()).map(|_| ())
    }

    async fn open(&self, log_id: &str) -> WatchResult<Arc<dyn ProductSession>> {
        Ok(Arc::new(HttpProductSession {
            log_id: log_id.to_string(),
            client: build_client(&self.http, self.proxy.as_deref())?,
            prices: self.prices,
            state: Mutex::new(PageState::default()),
        }))
    }
}
