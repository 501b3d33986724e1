//! Pure pre-filters deciding whether an offer is worth claiming.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::model::ProductInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OfferLocation {
    /// The main buy box, sold by the preferred source.
    DirectBuy,
    /// The other-sellers tray.
    OtherSellers,
    /// The single quick offer shown below the buy box.
    OtherSellersQuickOffer,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Offer {
    pub title: String,
    pub eur_price: Option<f64>,
    pub location: OfferLocation,
}

/// First matching rule decides; `patterns` are matched on the lowercased title.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PriceCap {
    pub patterns: Vec<String>,
    pub below: f64,
}

impl PriceCap {
    fn new(patterns: &[&str], below: f64) -> Self {
        Self {
            patterns: patterns.iter().map(|p| p.to_string()).collect(),
            below,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PurchasePolicy {
    /// A title must name exactly one of these.
    pub title_models: Vec<String>,
    /// Titles naming more than one of these are ambiguous bundles.
    pub known_models: Vec<String>,
    pub excluded_brands: Vec<String>,
    pub min_price: f64,
    pub price_caps: Vec<PriceCap>,
}

impl Default for PurchasePolicy {
    fn default() -> Self {
        let strings = |xs: &[&str]| xs.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        Self {
            title_models: strings(&["3060", "3070", "3080"]),
            known_models: strings(&["3060", "3070", "3080", "3090", "6700", "6800", "6900"]),
            excluded_brands: strings(&["pny", "palit"]),
            min_price: 100.0,
            price_caps: vec![
                PriceCap::new(&["3060ti", "3060 ti"], 800.0),
                PriceCap::new(&["3060"], 700.0),
                PriceCap::new(&["3070"], 850.0),
                PriceCap::new(&["3080ti", "3080 ti"], 1500.0),
                PriceCap::new(&["3080"], 1200.0),
            ],
        }
    }
}

/// Placeholder titles such as `<console link B08...>` carry no information.
pub fn is_placeholder_title(title: &str) -> bool {
    title.starts_with('<') && title.ends_with('>')
}

impl PurchasePolicy {
    pub fn is_good_title(&self, title: &str) -> bool {
        if is_placeholder_title(title) {
            debug!(title, "no extracted title, accepting");
            return true;
        }
        self.title_models
            .iter()
            .filter(|m| title.contains(m.as_str()))
            .count()
            == 1
    }

    pub fn is_good_purchase(&self, offer: &Offer) -> bool {
        let Some(price) = offer.eur_price else {
            info!(title = %offer.title, "offer without a price, rejecting");
            return false;
        };
        let title = offer.title.to_lowercase();

        let models = self
            .known_models
            .iter()
            .filter(|m| title.contains(m.as_str()))
            .count();
        if models > 1 {
            info!(%title, "too many models in the title");
            return false;
        }
        if self.excluded_brands.iter().any(|b| title.contains(b.as_str())) {
            info!(%title, "excluded brand");
            return false;
        }
        if price < self.min_price {
            info!(%title, price, "price suspiciously low");
            return false;
        }

        match self
            .price_caps
            .iter()
            .find(|cap| cap.patterns.iter().any(|p| title.contains(p.as_str())))
        {
            Some(cap) => {
                let good = price < cap.below;
                info!(%title, price, cap = cap.below, good, "price checked against cap");
                good
            }
            None => {
                info!(%title, "no price rule for this title");
                false
            }
        }
    }
}

/// Simplified view of what can be claimed from a scrape, if anything is sold
/// by the preferred source.
pub fn product_to_offer(info: &ProductInfo) -> Option<Offer> {
    let title = info.source.title.clone();
    let c = &info.computed;
    if c.is_available_from_preferred {
        return Some(Offer {
            title,
            eur_price: c.eur_price,
            location: OfferLocation::DirectBuy,
        });
    }
    if c.is_preferred_in_quick_offer {
        return Some(Offer {
            title,
            eur_price: c.quick_offer_eur_price,
            location: OfferLocation::OtherSellersQuickOffer,
        });
    }
    c.other_sellers
        .iter()
        .find(|os| os.is_preferred)
        .map(|os| Offer {
            title,
            eur_price: os.eur_price,
            location: OfferLocation::OtherSellers,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ComputedProductInfo, Condition, OtherSeller, RawProductInfo};

    fn offer(title: &str, price: f64) -> Offer {
        Offer {
            title: title.into(),
            eur_price: Some(price),
            location: OfferLocation::DirectBuy,
        }
    }

    #[test]
    fn title_must_name_exactly_one_variant() {
        let p = PurchasePolicy::default();
        assert!(p.is_good_title("ZOTAC GeForce RTX 3070 Twin Edge"));
        assert!(!p.is_good_title("RTX 3070 / 3080 comparison bundle"));
        assert!(!p.is_good_title("Radeon RX 6800"));
        assert!(p.is_good_title("<console link B08KHHF881>"));
    }

    #[test]
    fn price_caps_follow_rule_order() {
        let p = PurchasePolicy::default();
        assert!(p.is_good_purchase(&offer("RTX 3060 Ti Eagle", 750.0)));
        assert!(!p.is_good_purchase(&offer("RTX 3060 Eagle", 750.0)));
        assert!(p.is_good_purchase(&offer("RTX 3070", 849.0)));
        assert!(!p.is_good_purchase(&offer("RTX 3070", 850.0)));
        assert!(p.is_good_purchase(&offer("RTX 3080 Ti", 1400.0)));
        assert!(!p.is_good_purchase(&offer("RTX 3080", 1400.0)));
    }

    #[test]
    fn rejects_bundles_brands_cheap_and_unpriced() {
        let p = PurchasePolicy::default();
        assert!(!p.is_good_purchase(&offer("RTX 3070 + RX 6800 bundle", 800.0)));
        assert!(!p.is_good_purchase(&offer("PNY RTX 3070", 600.0)));
        assert!(!p.is_good_purchase(&offer("RTX 3070", 50.0)));
        assert!(!p.is_good_purchase(&Offer {
            title: "RTX 3070".into(),
            eur_price: None,
            location: OfferLocation::DirectBuy,
        }));
    }

    #[test]
    fn offer_prefers_direct_then_quick_then_tray() {
        let mut info = ProductInfo {
            source: RawProductInfo {
                title: "RTX 3070".into(),
                ..Default::default()
            },
            computed: ComputedProductInfo {
                other_sellers: vec![OtherSeller {
                    seller: "Preferred".into(),
                    price: "799,00 €".into(),
                    eur_price: Some(799.0),
                    courier: "Preferred".into(),
                    condition: "New".into(),
                    parsed_condition: Condition::New,
                    is_preferred: true,
                }],
                ..Default::default()
            },
        };
        assert_eq!(product_to_offer(&info).unwrap().location, OfferLocation::OtherSellers);

        info.computed.is_preferred_in_quick_offer = true;
        info.computed.quick_offer_eur_price = Some(780.0);
        let o = product_to_offer(&info).unwrap();
        assert_eq!(o.location, OfferLocation::OtherSellersQuickOffer);
        assert_eq!(o.eur_price, Some(780.0));

        info.computed.is_available_from_preferred = true;
        assert_eq!(product_to_offer(&info).unwrap().location, OfferLocation::DirectBuy);

        assert!(product_to_offer(&ProductInfo::default()).is_none());
    }
}
