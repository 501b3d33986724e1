// src/config/mod.rs
//! Startup configuration, read once.
//!
//! Lookup order: `$WATCH_CONFIG_PATH`, then `config/watch.toml`, then
//! `config/watch.json`, then built-in defaults. TOML or JSON is chosen from
//! the file extension; files without a known extension are sniffed.

use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::{env, fs};

use crate::notify::NotifySettings;
use crate::price::DEFAULT_GBP_TO_EUR;
use crate::purchase::filters::PurchasePolicy;
use crate::purchase::strategy::CheckType;
use crate::purchase::AttemptSettings;
use crate::watcher::partalert::PartAlertWatcherSettings;
use crate::watcher::product::ProductWatcherSettings;
use crate::watcher::remote::RemoteWatcherSettings;
use crate::watcher::search::SearchWatcherSettings;
use crate::watcher::social::SocialWatcherSettings;

pub const ENV_CONFIG_PATH: &str = "WATCH_CONFIG_PATH";
pub const DEFAULT_TOML_PATH: &str = "config/watch.toml";
pub const DEFAULT_JSON_PATH: &str = "config/watch.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatcherKind {
    Product,
    Search,
    Remote,
    Social,
    PartAlert,
}

/// A named set of watchers started together.
#[derive(Debug, Clone, Deserialize)]
pub struct BundleConfig {
    pub watchers: Vec<WatcherKind>,
    /// Found items also trigger purchase attempts.
    #[serde(default)]
    pub should_buy: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WatcherSections {
    pub product: ProductWatcherSettings,
    pub search: SearchWatcherSettings,
    pub remote: RemoteWatcherSettings,
    pub social: SocialWatcherSettings,
    pub part_alert: PartAlertWatcherSettings,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct BuyerConfig {
    pub id: String,
    pub check_type: CheckType,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DedupSettings {
    pub dispatch_window_secs: i64,
    pub product_window_secs: i64,
}

impl Default for DedupSettings {
    fn default() -> Self {
        Self {
            dispatch_window_secs: 60,
            product_window_secs: 600,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExchangeSettings {
    pub gbp_to_eur: f64,
}

impl Default for ExchangeSettings {
    fn default() -> Self {
        Self {
            gbp_to_eur: DEFAULT_GBP_TO_EUR,
        }
    }
}

/// Knobs for the HTTP reference collaborators.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpSettings {
    pub user_agent: String,
    pub timeout_secs: u64,
    /// `{domain}` and `{term}` are substituted; the endpoint answers a JSON
    /// array of search results.
    pub search_url_template: String,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            user_agent: "Mozilla/5.0 (X11; Linux x86_64; rv:124.0) Gecko/20100101 Firefox/124.0"
                .to_string(),
            timeout_secs: 10,
            search_url_template: String::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub bundles: BTreeMap<String, BundleConfig>,
    pub watchers: WatcherSections,
    pub buyers: Vec<BuyerConfig>,
    pub attempt: AttemptSettings,
    pub dedup: DedupSettings,
    pub exchange: ExchangeSettings,
    pub notify: NotifySettings,
    pub policy: PurchasePolicy,
    pub http: HttpSettings,
}

impl Default for AppConfig {
    fn default() -> Self {
        let mut bundles = BTreeMap::new();
        bundles.insert(
            "watch".to_string(),
            BundleConfig {
                watchers: vec![WatcherKind::Product, WatcherKind::Search],
                should_buy: false,
            },
        );
        bundles.insert(
            "buy".to_string(),
            BundleConfig {
                watchers: vec![WatcherKind::Product],
                should_buy: true,
            },
        );
        bundles.insert(
            "relay".to_string(),
            BundleConfig {
                watchers: vec![WatcherKind::Remote],
                should_buy: true,
            },
        );
        Self {
            bundles,
            watchers: WatcherSections::default(),
            buyers: vec![BuyerConfig {
                id: "buyer-a".to_string(),
                check_type: CheckType::DirectAndOtherConcurrently,
            }],
            attempt: AttemptSettings::default(),
            dedup: DedupSettings::default(),
            exchange: ExchangeSettings::default(),
            notify: NotifySettings::default(),
            policy: PurchasePolicy::default(),
            http: HttpSettings::default(),
        }
    }
}

impl AppConfig {
    /// Loads from the first source that exists.
    pub fn load() -> Result<Self> {
        if let Ok(p) = env::var(ENV_CONFIG_PATH) {
            return Self::load_from_file(&p).with_context(|| format!("{ENV_CONFIG_PATH}={p}"));
        }
        for candidate in [DEFAULT_TOML_PATH, DEFAULT_JSON_PATH] {
            if Path::new(candidate).exists() {
                return Self::load_from_file(candidate);
            }
        }
        tracing::info!("no config file found, using defaults");
        let cfg = Self::default();
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path: PathBuf = path.as_ref().to_path_buf();
        let data = fs::read_to_string(&path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let cfg = match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Self::parse_toml(&data)?,
            Some("json") => Self::parse_json(&data)?,
            _ if data.trim_start().starts_with('{') => Self::parse_json(&data)?,
            _ => Self::parse_toml(&data)?,
        };
        tracing::info!(path = %path.display(), bundles = cfg.bundles.len(), "config loaded");
        Ok(cfg)
    }

    pub fn parse_toml(data: &str) -> Result<Self> {
        let cfg: AppConfig = toml::from_str(data).context("parsing TOML config")?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn parse_json(data: &str) -> Result<Self> {
        let cfg: AppConfig = serde_json::from_str(data).context("parsing JSON config")?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        let mut ids = HashSet::new();
        for b in &self.buyers {
            if b.id.trim().is_empty() {
                bail!("buyer with an empty id");
            }
            if !ids.insert(b.id.as_str()) {
                bail!("duplicate buyer id {:?}", b.id);
            }
        }
        if self.exchange.gbp_to_eur <= 0.0 {
            bail!("exchange.gbp_to_eur must be positive");
        }
        if self.dedup.dispatch_window_secs < 0 || self.dedup.product_window_secs < 0 {
            bail!("dedup windows must not be negative");
        }
        if self.watchers.product.group_size == 0 {
            bail!("watchers.product.group_size must be at least 1");
        }
        let stock = &self.watchers.part_alert;
        if stock.price_min >= stock.price_max {
            bail!("watchers.part_alert.price_min must be below price_max");
        }
        Ok(())
    }

    pub fn bundle(&self, name: &str) -> Result<&BundleConfig> {
        self.bundles.get(name).ok_or_else(|| {
            let known: Vec<&str> = self.bundles.keys().map(String::as_str).collect();
            anyhow!("unknown bundle {name:?}, known: {}", known.join(", "))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = AppConfig::default();
        cfg.validate().unwrap();
        assert!(cfg.bundle("watch").is_ok());
        assert!(cfg.bundle("nope").is_err());
        assert_eq!(cfg.dedup.dispatch_window_secs, 60);
        assert_eq!(cfg.exchange.gbp_to_eur, 1.17);
    }

    #[test]
    fn toml_sections_override_defaults() {
        let cfg = AppConfig::parse_toml(
            r#"
            [bundles.night]
            watchers = ["search", "remote"]
            should_buy = true

            [[buyers]]
            id = "buyer-b"
            check_type = "direct_only"

            [attempt]
            test_run = true

            [watchers.search]
            domains = ["amazon.it"]
            terms = ["rtx 3070"]
            "#,
        )
        .unwrap();
        let night = cfg.bundle("night").unwrap();
        assert!(night.should_buy);
        assert_eq!(night.watchers, vec![WatcherKind::Search, WatcherKind::Remote]);
        assert_eq!(cfg.buyers[0].check_type, CheckType::DirectOnly);
        assert!(cfg.attempt.test_run);
        assert_eq!(cfg.attempt.refresh_minutes, 10);
        assert_eq!(cfg.watchers.search.terms, vec!["rtx 3070".to_string()]);
    }

    #[test]
    fn duplicate_buyers_are_rejected() {
        let err = AppConfig::parse_json(
            r#"{"buyers":[{"id":"a","check_type":"direct_only"},{"id":"a","check_type":"direct_then_other"}]}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("duplicate buyer"));
    }
}
