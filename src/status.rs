//! # Heartbeat status
//! Per-source liveness statistics for the status page: latest heartbeat,
//! average delay between heartbeats, and the average over the last few.
//!
//! Sources are links (keyed by URL) and searches (keyed by domain and term).
//! Stream heartbeats carry no source and are ignored.

use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;

use crate::model::{now_ms, FoundItem, Heartbeat};

/// Size of the recent-delay ring.
pub const LAST_N: usize = 10;
const FOUND_ITEMS_CAP: usize = 1000;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SourceKey {
    Link { url: String },
    Search { domain: String, term: String },
}

impl SourceKey {
    pub fn of(hb: &Heartbeat) -> Option<Self> {
        match hb {
            Heartbeat::Link { link, .. } => Some(SourceKey::Link {
                url: link.url.clone(),
            }),
            Heartbeat::Search { search, .. } => Some(SourceKey::Search {
                domain: search.domain.clone(),
                term: search.term.clone(),
            }),
            Heartbeat::Stream { .. } => None,
        }
    }
}

#[derive(Debug, Clone)]
struct SourceStats {
    last: Heartbeat,
    last_seen_ms: u64,
    delay_sum_ms: u64,
    count: u64,
    recent: VecDeque<u64>,
}

impl SourceStats {
    fn average_secs(&self) -> Option<f64> {
        (self.count > 0).then(|| self.delay_sum_ms as f64 / 1000.0 / self.count as f64)
    }

    fn recent_average_secs(&self) -> Option<f64> {
        (!self.recent.is_empty())
            .then(|| self.recent.iter().sum::<u64>() as f64 / 1000.0 / self.recent.len() as f64)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceStatus {
    pub source: SourceKey,
    pub last: Heartbeat,
    pub count: u64,
    pub average_delay_secs: Option<f64>,
    pub recent_average_delay_secs: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub sources: Vec<SourceStatus>,
    pub found_items: usize,
}

#[derive(Debug, Default)]
pub struct HeartbeatStatusStore {
    sources: Mutex<BTreeMap<SourceKey, SourceStats>>,
    found: Mutex<VecDeque<FoundItem>>,
}

impl HeartbeatStatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_heartbeat(&self, hb: &Heartbeat) {
        self.add_heartbeat_at(hb, now_ms());
    }

    /// The delay recorded is the time since the previous heartbeat of the
    /// same source was received; the first one only seeds the entry.
    pub fn add_heartbeat_at(&self, hb: &Heartbeat, received_ms: u64) {
        let Some(key) = SourceKey::of(hb) else {
            return;
        };
        let mut sources = self.sources.lock().expect("status mutex poisoned");
        match sources.get_mut(&key) {
            Some(stats) => {
                let delay = received_ms.saturating_sub(stats.last_seen_ms);
                stats.delay_sum_ms += delay;
                stats.count += 1;
                stats.recent.push_back(delay);
                if stats.recent.len() > LAST_N {
                    stats.recent.pop_front();
                }
                stats.last = hb.clone();
                stats.last_seen_ms = received_ms;
            }
            None => {
                sources.insert(
                    key,
                    SourceStats {
                        last: hb.clone(),
                        last_seen_ms: received_ms,
                        delay_sum_ms: 0,
                        count: 0,
                        recent: VecDeque::with_capacity(LAST_N + 1),
                    },
                );
            }
        }
    }

    pub fn latest(&self, key: &SourceKey) -> Option<Heartbeat> {
        let sources = self.sources.lock().expect("status mutex poisoned");
        sources.get(key).map(|s| s.last.clone())
    }

    pub fn average_delay_secs(&self, key: &SourceKey) -> Option<f64> {
        let sources = self.sources.lock().expect("status mutex poisoned");
        sources.get(key).and_then(SourceStats::average_secs)
    }

    pub fn recent_average_delay_secs(&self, key: &SourceKey) -> Option<f64> {
        let sources = self.sources.lock().expect("status mutex poisoned");
        sources.get(key).and_then(SourceStats::recent_average_secs)
    }

    pub fn push_found_item(&self, item: FoundItem) {
        let mut found = self.found.lock().expect("status mutex poisoned");
        found.push_back(item);
        if found.len() > FOUND_ITEMS_CAP {
            found.pop_front();
        }
    }

    pub fn found_items(&self) -> Vec<FoundItem> {
        let found = self.found.lock().expect("status mutex poisoned");
        found.iter().cloned().collect()
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        let sources = self.sources.lock().expect("status mutex poisoned");
        let found_items = self.found.lock().expect("status mutex poisoned").len();
        StatusSnapshot {
            sources: sources
                .iter()
                .map(|(key, s)| SourceStatus {
                    source: key.clone(),
                    last: s.last.clone(),
                    count: s.count,
                    average_delay_secs: s.average_secs(),
                    recent_average_delay_secs: s.recent_average_secs(),
                })
                .collect(),
            found_items,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn link_key() -> SourceKey {
        SourceKey::Link {
            url: "https://www.amazon.it/dp/B08KHHF881".into(),
        }
    }

    #[test]
    fn delays_are_averaged_overall_and_over_the_last_ten() {
        let store = HeartbeatStatusStore::new();
        let hb = Heartbeat::link("product-rest", "https://www.amazon.it/dp/B08KHHF881", "3070");

        store.add_heartbeat_at(&hb, 0);
        assert_eq!(store.average_delay_secs(&link_key()), None);

        // 10 delays of 1s, then 10 delays of 3s
        let mut t = 0;
        for _ in 0..10 {
            t += 1000;
            store.add_heartbeat_at(&hb, t);
        }
        for _ in 0..10 {
            t += 3000;
            store.add_heartbeat_at(&hb, t);
        }
        assert_eq!(store.average_delay_secs(&link_key()), Some(2.0));
        assert_eq!(store.recent_average_delay_secs(&link_key()), Some(3.0));
        assert_eq!(store.latest(&link_key()), Some(hb));
    }

    #[test]
    fn stream_heartbeats_are_ignored_and_searches_are_keyed_by_pair() {
        let store = HeartbeatStatusStore::new();
        store.add_heartbeat_at(&Heartbeat::stream("relay"), 10);
        store.add_heartbeat_at(&Heartbeat::search("search", "amazon.it", "rtx 3070"), 10);
        store.add_heartbeat_at(&Heartbeat::search("search", "amazon.it", "rtx 3080"), 20);
        store.add_heartbeat_at(&Heartbeat::search("search", "amazon.it", "rtx 3070"), 2010);

        let snap = store.snapshot();
        assert_eq!(snap.sources.len(), 2);
        let key = SourceKey::Search {
            domain: "amazon.it".into(),
            term: "rtx 3070".into(),
        };
        assert_eq!(store.average_delay_secs(&key), Some(2.0));
    }
}
