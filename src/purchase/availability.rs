use crate::model::{Condition, ProductInfo};

/// Relative tolerance when matching a reported price against scraped ones.
const PRICE_TOLERANCE: f64 = 0.05;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Availability {
    NotAvailable,
    FromPreferred,
    FromOtherSellers,
}

/// True when the preferred source sells the item, whatever the price.
pub fn is_from_preferred(info: &ProductInfo) -> bool {
    let c = &info.computed;
    c.is_available_from_preferred
        || c.is_preferred_in_quick_offer
        || c.other_sellers
            .iter()
            .any(|os| os.is_preferred && os.parsed_condition == Condition::New)
}

/// `reported_price` is the price announced by the watcher; a scraped offer
/// within ±5% of it from someone else means the alert was about that seller.
pub fn classify(info: Option<&ProductInfo>, reported_price: Option<f64>) -> Availability {
    let Some(info) = info else {
        return Availability::NotAvailable;
    };
    if is_from_preferred(info) {
        return Availability::FromPreferred;
    }
    let Some(reported) = reported_price else {
        return Availability::NotAvailable;
    };
    let same = |p: Option<f64>| {
        p.is_some_and(|p| p > reported * (1.0 - PRICE_TOLERANCE) && p < reported * (1.0 + PRICE_TOLERANCE))
    };
    let c = &info.computed;
    if same(c.eur_price)
        || same(c.quick_offer_eur_price)
        || c.other_sellers.iter().any(|os| same(os.eur_price))
    {
        return Availability::FromOtherSellers;
    }
    Availability::NotAvailable
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ComputedProductInfo, OtherSeller};

    fn seller(preferred: bool, condition: Condition, price: f64) -> OtherSeller {
        OtherSeller {
            seller: if preferred { "Preferred" } else { "Someone" }.into(),
            price: String::new(),
            eur_price: Some(price),
            courier: String::new(),
            condition: String::new(),
            parsed_condition: condition,
            is_preferred: preferred,
        }
    }

    #[test]
    fn preferred_wins_regardless_of_price() {
        let info = ProductInfo {
            computed: ComputedProductInfo {
                other_sellers: vec![seller(true, Condition::New, 2000.0)],
                ..Default::default()
            },
            ..Default::default()
        };
        assert_eq!(classify(Some(&info), Some(700.0)), Availability::FromPreferred);
    }

    #[test]
    fn used_preferred_offer_does_not_count() {
        let info = ProductInfo {
            computed: ComputedProductInfo {
                other_sellers: vec![seller(true, Condition::LikeNew, 700.0)],
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(!is_from_preferred(&info));
        assert_eq!(classify(Some(&info), Some(710.0)), Availability::FromOtherSellers);
        assert_eq!(classify(Some(&info), Some(800.0)), Availability::NotAvailable);
        assert_eq!(classify(Some(&info), None), Availability::NotAvailable);
        assert_eq!(classify(None, Some(700.0)), Availability::NotAvailable);
    }
}
