//! Substring and regex extraction over raw product/search HTML.
//!
//! No DOM: the pages are large and only a handful of ids matter.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::model::{Condition, OtherSeller};
use crate::price::PriceParser;
use crate::watcher::product::MerchantVerdict;
use crate::watcher::search::SearchResult;

const MERCHANT_INFO: &str = "<div id=\"merchant-info\"";
const SOLD_BY: &str = "<div id=\"aod-offer-soldBy\" ";
const OFFER_BLOCK: &str = "<div id=\"aod-offer\" ";
const SEARCH_RESULT: &str = "data-component-type=\"s-search-result\"";
const PREFERRED_SELLER: &str = "Amazon";

static OFFSCREEN_PRICE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"<span class="a-offscreen">\s*([^<]+?)\s*</span>"#).expect("price regex"));
static PRODUCT_TITLE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"<span id="productTitle"[^>]*>\s*([^<]+?)\s*</span>"#).expect("title regex"));
static RESULT_TITLE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"<h2[^>]*>.*?<span[^>]*>\s*([^<]+?)\s*</span>"#).expect("result title regex"));
static RESULT_LINK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"<a class="a-link-normal[^"]*"[^>]*href="([^"]+)""#).expect("result link regex"));
static TAGS: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]+>").expect("tag regex"));
static OFFER_HEADING: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"id="aod-offer-heading"[^>]*>(?:\s*<[^>]+>)*\s*([^<]+?)\s*<"#).expect("heading regex"));

fn decode(s: &str) -> String {
    s.replace("&nbsp;", " ")
        .replace("&amp;", "&")
        .replace("&#39;", "'")
        .replace("&quot;", "\"")
        .trim()
        .to_string()
}

pub fn has_captcha(html: &str) -> bool {
    html.contains("\"captchacharacters\"") || html.contains("/errors/validateCaptcha")
}

/// Sold-by text naming the preferred source, with no links and no import marker.
fn names_preferred(content: &str) -> bool {
    content.contains(PREFERRED_SELLER) && !content.contains("US")
}

/// Reads the buy-box merchant block.
pub fn merchant_verdict(html: &str) -> MerchantVerdict {
    let Some(start) = html.find(MERCHANT_INFO) else {
        return MerchantVerdict::NoMerchantElement;
    };
    let end = html[start..].find('>').map_or(html.len(), |i| start + i + 1);
    let has_other_sellers = html.contains("/gp/offer-listing/");
    let not_preferred = if has_other_sellers {
        MerchantVerdict::MaybeOtherOffers
    } else {
        MerchantVerdict::NotFromPreferred
    };

    let rest = &html[end..];
    let next_div = rest.find("<div ").unwrap_or(usize::MAX);
    let next_close = rest.find("</div>").unwrap_or(rest.len());
    if next_div < next_close {
        return not_preferred;
    }
    let content = &rest[..next_close];
    // a help link inside the block is still the preferred source
    if content.contains("</a>") && !content.contains("/gp/help/customer/display.html") {
        return not_preferred;
    }
    if names_preferred(content) {
        MerchantVerdict::FromPreferred
    } else {
        MerchantVerdict::NotFromPreferred
    }
}

pub fn first_price(html: &str) -> Option<String> {
    OFFSCREEN_PRICE.captures(html).map(|c| decode(&c[1]))
}

pub fn product_title(html: &str) -> Option<String> {
    PRODUCT_TITLE.captures(html).map(|c| decode(&c[1]))
}

pub fn merchant_text(html: &str) -> String {
    let Some(start) = html.find(MERCHANT_INFO) else {
        return String::new();
    };
    let block = &html[start..];
    let close = block.find("</div>").unwrap_or(block.len());
    let text = TAGS.replace_all(&block[..close], " ");
    decode(&text.split_whitespace().collect::<Vec<_>>().join(" "))
}

/// Offers listed in the other-sellers tray.
pub fn other_sellers(html: &str, prices: &PriceParser) -> Vec<OtherSeller> {
    html.split(OFFER_BLOCK)
        .skip(1)
        .map(|block| {
            let sold_by = block
                .find(SOLD_BY)
                .map(|i| &block[i..])
                .unwrap_or_default();
            let sold_by_end = sold_by.find("</div>").unwrap_or(sold_by.len());
            let sold_by = &sold_by[..sold_by_end];
            let is_preferred = !sold_by.contains("<a ") && names_preferred(sold_by);
            let price = first_price(block).unwrap_or_default();
            let condition = OFFER_HEADING
                .captures(block)
                .map(|c| decode(&c[1]))
                .unwrap_or_default();
            OtherSeller {
                seller: if is_preferred {
                    PREFERRED_SELLER.to_string()
                } else {
                    String::new()
                },
                eur_price: prices.parse(&price).ok(),
                price,
                courier: String::new(),
                parsed_condition: Condition::parse(&condition),
                condition,
                is_preferred,
            }
        })
        .collect()
}

/// Result tiles of a search page. Relative links are resolved against `origin`.
pub fn search_results(html: &str, origin: &str) -> Vec<SearchResult> {
    html.split(SEARCH_RESULT)
        .skip(1)
        .filter_map(|tile| {
            let title = RESULT_TITLE.captures(tile).map(|c| decode(&c[1]))?;
            let href = RESULT_LINK.captures(tile).map(|c| decode(&c[1]))?;
            let url = if href.starts_with('/') {
                format!("{}{}", origin.trim_end_matches('/'), href)
            } else {
                href
            };
            Some(SearchResult {
                title,
                url,
                price: first_price(tile),
            })
        })
        .collect()
}
