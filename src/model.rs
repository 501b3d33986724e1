//! # Data model
//! Events flowing from watchers to the dispatch core, the static descriptors
//! of what is being observed, and the product snapshot consumed by the
//! purchase strategies.
//!
//! The JSON shapes match what the status UI and remote relays exchange:
//! heartbeats are tagged by `type`, found items use camelCase keys.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU8, Ordering};

/// Current UNIX time in milliseconds.
pub fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkRef {
    pub url: String,
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchRef {
    pub domain: String,
    pub term: String,
}

/// Liveness pulse from one monitored target, emitted once per successful poll.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Heartbeat {
    Link {
        time: u64,
        origin: String,
        link: LinkRef,
    },
    Search {
        time: u64,
        origin: String,
        search: SearchRef,
    },
    Stream {
        time: u64,
        origin: String,
    },
}

impl Heartbeat {
    pub fn link(origin: &str, url: &str, title: &str) -> Self {
        Heartbeat::Link {
            time: now_ms(),
            origin: origin.to_string(),
            link: LinkRef {
                url: url.to_string(),
                title: title.to_string(),
            },
        }
    }

    pub fn search(origin: &str, domain: &str, term: &str) -> Self {
        Heartbeat::Search {
            time: now_ms(),
            origin: origin.to_string(),
            search: SearchRef {
                domain: domain.to_string(),
                term: term.to_string(),
            },
        }
    }

    pub fn stream(origin: &str) -> Self {
        Heartbeat::Stream {
            time: now_ms(),
            origin: origin.to_string(),
        }
    }

    pub fn time(&self) -> u64 {
        match self {
            Heartbeat::Link { time, .. }
            | Heartbeat::Search { time, .. }
            | Heartbeat::Stream { time, .. } => *time,
        }
    }

    pub fn origin(&self) -> &str {
        match self {
            Heartbeat::Link { origin, .. }
            | Heartbeat::Search { origin, .. }
            | Heartbeat::Stream { origin, .. } => origin,
        }
    }
}

/// A candidate purchase opportunity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FoundItem {
    pub time: u64,
    pub url: String,
    pub title: String,
    /// Raw display string, e.g. "7,99 €" or "£84.69". Empty when unknown.
    #[serde(default)]
    pub price: String,
    /// Price normalized to EUR, when the raw string could be parsed.
    #[serde(default)]
    pub parsed_price: Option<f64>,
    pub origin: String,
    pub valid: bool,
    #[serde(default)]
    pub price_limit: Option<f64>,
}

/// What a link watcher observes (read-only after construction).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObservedLink {
    pub url: String,
    pub title: String,
    #[serde(default)]
    pub category: String,
    pub origin: String,
    #[serde(default)]
    pub buy_price: Option<f64>,
}

/// What a search watcher observes: every domain × every term.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservedSearches {
    pub terms: Vec<String>,
    pub domains: Vec<String>,
}

// ---------------------------------------------------------------------------
// Product snapshot (produced by the scraper collaborator)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawProductInfo {
    pub title: String,
    pub product_id: String,
    /// Full price string, e.g. "7,99 €" or "£23.99".
    pub price: Option<String>,
    pub availability: String,
    /// The dispatched-from / sold-by text.
    pub merchant_info: String,
    pub has_buy_now_button: bool,
    pub has_delivery_troubles: bool,
    pub has_other_sellers: bool,
    pub has_quick_other_offer: bool,
    pub quick_other_offer_price: Option<String>,
    pub quick_other_offer_seller: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Condition {
    New,
    LikeNew,
    VeryGood,
    Good,
    Acceptable,
    Renewed,
    Unknown,
}

const NEW_WORDS: &[&str] = &["new", "neuf", "nuovo", "nuevo", "neu"];
const USED_WORDS: &[&str] = &["used", "occasion", "usato", "usado", "como", "gebraucht"];
const VERY_GOOD_WORDS: &[&str] = &["very good", "très bon", "ottime", "muy bueno", "como nuevo", "sehr gut"];
const GOOD_WORDS: &[&str] = &["good", "très", "buone", "bueno", "gut"];
const ACCEPTABLE_WORDS: &[&str] = &["acceptable", "correct", "accettabile", "aceptable", "akzeptabel"];
const RENEWED_WORDS: &[&str] = &[
    "renews",
    "refurbished",
    "reconditionné",
    "ricondizionato",
    "reacondicionados",
    "generalüberholte",
];

impl Condition {
    /// Reads a condition label in any of the supported marketplace languages.
    pub fn parse(raw: &str) -> Self {
        let lower = raw.to_lowercase();
        let any = |words: &[&str]| words.iter().any(|w| lower.contains(w));
        let is_new = any(NEW_WORDS) && !lower.contains("renew");
        let is_used = any(USED_WORDS);

        match (is_new, is_used) {
            (true, true) => Condition::LikeNew,
            (true, false) => Condition::New,
            (false, true) if any(VERY_GOOD_WORDS) => Condition::VeryGood,
            (false, true) if any(GOOD_WORDS) => Condition::Good,
            (false, true) if any(ACCEPTABLE_WORDS) => Condition::Acceptable,
            _ if any(RENEWED_WORDS) => Condition::Renewed,
            _ => Condition::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OtherSeller {
    pub seller: String,
    pub price: String,
    pub eur_price: Option<f64>,
    pub courier: String,
    pub condition: String,
    pub parsed_condition: Condition,
    /// Sold and shipped by the preferred source.
    pub is_preferred: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComputedProductInfo {
    pub eur_price: Option<f64>,
    pub is_available: bool,
    pub is_from_preferred: bool,
    pub is_available_from_preferred: bool,
    pub has_offerings: bool,
    pub other_sellers: Vec<OtherSeller>,
    pub is_preferred_among_other_sellers: bool,
    pub is_preferred_in_quick_offer: bool,
    pub quick_offer_eur_price: Option<f64>,
}

/// Normalized snapshot of one scrape. Strategies only look at `computed`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProductInfo {
    pub source: RawProductInfo,
    pub computed: ComputedProductInfo,
}

// ---------------------------------------------------------------------------
// Shared purchase status
// ---------------------------------------------------------------------------

const UNSET: u8 = 0;
const PREFERRED: u8 = 1;
const NOT_PREFERRED: u8 = 2;

/// Tri-state flag shared by every strategy racing for one item.
///
/// Written at most once (compare-and-set from unset); once it reads
/// `Some(false)` every sibling abandons on its next check.
#[derive(Debug, Default)]
pub struct SharedPurchaseStatus {
    sold_from_preferred: AtomicU8,
}

impl SharedPurchaseStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<bool> {
        match self.sold_from_preferred.load(Ordering::Acquire) {
            PREFERRED => Some(true),
            NOT_PREFERRED => Some(false),
            _ => None,
        }
    }

    /// Returns true if this call was the one that set the flag.
    pub fn try_set(&self, sold_from_preferred: bool) -> bool {
        let value = if sold_from_preferred {
            PREFERRED
        } else {
            NOT_PREFERRED
        };
        self.sold_from_preferred
            .compare_exchange(UNSET, value, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn mark_not_preferred(&self) -> bool {
        self.try_set(false)
    }

    pub fn is_not_preferred(&self) -> bool {
        self.get() == Some(false)
    }
}
