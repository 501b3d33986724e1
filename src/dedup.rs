use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;

/// Short-lived membership cache suppressing repeats of the same key.
///
/// A key seen for the first time is recorded and passes; the same key within
/// `window` is reported as a duplicate. Expired entries are evicted lazily on
/// access, so no timer task is needed.
#[derive(Debug)]
pub struct DeduplicationWindow<K> {
    window: Duration,
    seen: Mutex<HashMap<K, DateTime<Utc>>>,
}

impl<K> DeduplicationWindow<K>
where
    K: Eq + Hash + Clone,
{
    pub fn new(window_secs: i64) -> Self {
        Self {
            window: Duration::seconds(window_secs),
            seen: Mutex::new(HashMap::new()),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn is_recent_duplicate(&self, key: &K) -> bool {
        self.is_recent_duplicate_at(key, Utc::now())
    }

    /// Check-and-record under one lock acquisition.
    pub fn is_recent_duplicate_at(&self, key: &K, now: DateTime<Utc>) -> bool {
        let mut seen = self.seen.lock().expect("dedup mutex poisoned");
        seen.retain(|_, at| now - *at < self.window);
        if seen.contains_key(key) {
            return true;
        }
        seen.insert(key.clone(), now);
        false
    }

    pub fn len(&self) -> usize {
        self.seen.lock().expect("dedup mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::ItemIdentity;

    #[test]
    fn same_identity_collapses_within_window() {
        let w = DeduplicationWindow::new(60);
        let t0 = Utc::now();
        let a = ItemIdentity::from_url("https://www.amazon.it/dp/B08KHHF881?tag=a");
        let b = ItemIdentity::from_url("https://www.amazon.it/x/dp/B08KHHF881");

        assert!(!w.is_recent_duplicate_at(&a, t0));
        assert!(w.is_recent_duplicate_at(&b, t0 + Duration::seconds(30)));
        assert!(w.is_recent_duplicate_at(&a, t0 + Duration::seconds(59)));
    }

    #[test]
    fn different_items_and_expired_items_pass() {
        let w = DeduplicationWindow::new(60);
        let t0 = Utc::now();
        assert!(!w.is_recent_duplicate_at(&"a".to_string(), t0));
        assert!(!w.is_recent_duplicate_at(&"b".to_string(), t0));
        assert!(!w.is_recent_duplicate_at(&"a".to_string(), t0 + Duration::seconds(60)));
        assert_eq!(w.len(), 1);
    }
}
