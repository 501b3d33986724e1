// src/identity.rs
//! Normalized identity of a product: marketplace domain + product id.
//! Every dedup window and the in-flight attempt set key on this, never on the
//! raw URL (tracking params, slugs and `gp/product` vs `dp` variants collapse).

use once_cell::sync::OnceCell;
use regex::Regex;
use reqwest::Url;
use serde::Serialize;
use std::fmt;

static PRODUCT_URL_RE: OnceCell<Regex> = OnceCell::new();

fn product_url_re() -> &'static Regex {
    PRODUCT_URL_RE.get_or_init(|| {
        Regex::new(r"^https?://www\.amazon\.([a-z.]+)/([\w-]+/)?(dp|gp/product)/(\w+/)?(\w{10})")
            .expect("product url regex")
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ItemIdentity {
    /// Marketplace suffix (`it`, `co.uk`) or the bare host for unknown sites.
    pub tld: String,
    pub product_id: String,
}

impl ItemIdentity {
    pub fn new(tld: impl Into<String>, product_id: impl Into<String>) -> Self {
        Self {
            tld: tld.into(),
            product_id: product_id.into(),
        }
    }

    /// Derives the identity from any URL variant. Unknown shapes fall back to
    /// host + path with query and fragment stripped.
    pub fn from_url(url: &str) -> Self {
        if let Some(caps) = product_url_re().captures(url) {
            return Self::new(&caps[1], &caps[5]);
        }
        match Url::parse(url) {
            Ok(parsed) => {
                let host = parsed.host_str().unwrap_or_default().to_ascii_lowercase();
                let path = parsed.path().trim_end_matches('/').to_string();
                Self::new(host, path)
            }
            Err(_) => Self::new("", url.trim()),
        }
    }

    /// Log identifier: `<role>/<tld>/<product-id>`, with `co.uk` shortened to `uk`.
    pub fn log_id(&self, role: &str) -> String {
        let tld = if self.tld == "co.uk" { "uk" } else { &self.tld };
        format!("{role}/{tld}/{}", self.product_id)
    }
}

impl fmt::Display for ItemIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.tld, self.product_id)
    }
}

pub fn is_product_url(url: &str) -> bool {
    product_url_re().is_match(url)
}

pub fn extract_product_id(url: &str) -> Option<String> {
    product_url_re()
        .captures(url)
        .map(|caps| caps[5].to_string())
}

/// Canonical product page for a product id on a marketplace.
pub fn product_url(tld: &str, product_id: &str) -> String {
    format!("https://www.amazon.{tld}/dp/{product_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_variants_collapse_to_one_identity() {
        let a = ItemIdentity::from_url("https://www.amazon.it/dp/B08KHHF881?tag=x&psc=1");
        let b = ItemIdentity::from_url(
            "https://www.amazon.it/Gigabyte-GeForce-3070/dp/B08KHHF881/ref=sr_1_1",
        );
        let c = ItemIdentity::from_url("https://www.amazon.it/gp/product/B08KHHF881");
        assert_eq!(a, b);
        assert_eq!(a, c);
        assert_eq!(a.to_string(), "it/B08KHHF881");
    }

    #[test]
    fn different_marketplaces_are_different_items() {
        let it = ItemIdentity::from_url("https://www.amazon.it/dp/B08KHHF881");
        let uk = ItemIdentity::from_url("https://www.amazon.co.uk/dp/B08KHHF881");
        assert_ne!(it, uk);
        assert_eq!(uk.log_id("buyer"), "buyer/uk/B08KHHF881");
    }

    #[test]
    fn unknown_urls_drop_query_string() {
        let a = ItemIdentity::from_url("https://shop.example.com/p/rtx-3080?utm=1");
        let b = ItemIdentity::from_url("https://SHOP.example.com/p/rtx-3080/");
        assert_eq!(a, b);
        assert_eq!(a.tld, "shop.example.com");
    }

    #[test]
    fn extracts_product_id() {
        assert_eq!(
            extract_product_id("https://www.amazon.de/dp/B08HR3Y5GQ").as_deref(),
            Some("B08HR3Y5GQ")
        );
        assert!(!is_product_url("https://www.amazon.de/s?k=3080"));
    }
}
