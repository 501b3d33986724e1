//! Display-price parsing, normalized to EUR.
//!
//! Supported shapes:
//! - trailing euro (`7,99 €`, `1.924,54€`): comma decimal, dots are grouping
//! - leading euro (`€1,925.89`): dot decimal, commas only group thousands
//! - leading pound (`£84.69`): dot decimal, converted with the configured rate
//!
//! Anything else is an error; money is never guessed.

use crate::error::{WatchError, WatchResult};

pub const DEFAULT_GBP_TO_EUR: f64 = 1.17;

#[derive(Debug, Clone, Copy)]
pub struct PriceParser {
    pub gbp_to_eur: f64,
}

impl Default for PriceParser {
    fn default() -> Self {
        Self {
            gbp_to_eur: DEFAULT_GBP_TO_EUR,
        }
    }
}

impl PriceParser {
    pub fn new(gbp_to_eur: f64) -> Self {
        Self { gbp_to_eur }
    }

    pub fn parse(&self, raw: &str) -> WatchResult<f64> {
        let price = raw.trim();
        if price.ends_with('€') {
            let kept: String = price
                .chars()
                .filter(|c| c.is_ascii_digit() || *c == ',')
                .collect();
            // Only the last comma is a decimal separator.
            let normalized = match kept.rfind(',') {
                Some(idx) => format!("{}.{}", kept[..idx].replace(',', ""), &kept[idx + 1..]),
                None => kept,
            };
            return to_number(raw, &normalized);
        }
        if let Some(rest) = price.strip_prefix('€') {
            return dot_decimal(raw, rest);
        }
        if let Some(rest) = price.strip_prefix('£') {
            let gbp = dot_decimal(raw, rest)?;
            return Ok(round2(gbp * self.gbp_to_eur));
        }
        Err(WatchError::Price(raw.to_string()))
    }

    /// Like [`parse`](Self::parse), but `None` for a missing price.
    pub fn parse_opt(&self, raw: Option<&str>) -> WatchResult<Option<f64>> {
        raw.map(|r| self.parse(r)).transpose()
    }
}

/// `1,925.89`: commas may only group thousands, the dot is the decimal point.
/// `1.925,89` is refused rather than read as 1.92589.
fn dot_decimal(raw: &str, body: &str) -> WatchResult<f64> {
    let body: String = body.chars().filter(|c| !c.is_whitespace()).collect();
    let (whole, fraction) = match body.split_once('.') {
        Some((w, f)) => (w, Some(f)),
        None => (body.as_str(), None),
    };
    let grouped = whole.split(',').skip(1).all(|g| g.len() == 3);
    let plain_fraction = fraction.map_or(true, |f| !f.is_empty() && f.chars().all(|c| c.is_ascii_digit()));
    if !grouped || !plain_fraction {
        return Err(WatchError::Price(raw.to_string()));
    }
    let cleaned = match fraction {
        Some(f) => format!("{}.{f}", whole.replace(',', "")),
        None => whole.replace(',', ""),
    };
    to_number(raw, &cleaned)
}

fn to_number(raw: &str, cleaned: &str) -> WatchResult<f64> {
    cleaned
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| WatchError::Price(raw.to_string()))
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}
