//! Composition root for every registered watcher.
//!
//! Built explicitly at process start and passed down; events of every watcher
//! are relayed unmodified onto the aggregator's own buses.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::bus::EventBus;
use crate::error::{WatchError, WatchResult};
use crate::lifecycle::with_shutdown_swallow;
use crate::model::{FoundItem, Heartbeat, ObservedLink, ObservedSearches};
use crate::watcher::{Watcher, WatcherState};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

pub struct WatcherAggregator {
    watchers: Mutex<Vec<Arc<dyn Watcher>>>,
    bootstrapped: AtomicBool,
    started: AtomicBool,
    heartbeats: EventBus<Heartbeat>,
    found: EventBus<FoundItem>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Default for WatcherAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl WatcherAggregator {
    pub fn new() -> Self {
        Self {
            watchers: Mutex::new(Vec::new()),
            bootstrapped: AtomicBool::new(false),
            started: AtomicBool::new(false),
            heartbeats: EventBus::new(),
            found: EventBus::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn heartbeats(&self) -> &EventBus<Heartbeat> {
        &self.heartbeats
    }

    pub fn found_items(&self) -> &EventBus<FoundItem> {
        &self.found
    }

    pub fn add_watcher(&self, watcher: Arc<dyn Watcher>) -> WatchResult<()> {
        if self.bootstrapped.load(Ordering::SeqCst) {
            return Err(WatchError::Lifecycle(format!(
                "cannot add watcher {} after bootstrap",
                watcher.id()
            )));
        }
        let hb_out = self.heartbeats.clone();
        watcher
            .core()
            .heartbeats()
            .subscribe(move |hb| hb_out.publish(hb.clone()));
        let found_out = self.found.clone();
        watcher
            .core()
            .found_items()
            .subscribe(move |item| found_out.publish(item.clone()));

        self.watchers
            .lock()
            .expect("aggregator mutex poisoned")
            .push(watcher);
        Ok(())
    }

    pub fn add_watchers(&self, watchers: impl IntoIterator<Item = Arc<dyn Watcher>>) -> WatchResult<()> {
        for w in watchers {
            self.add_watcher(w)?;
        }
        Ok(())
    }

    pub fn watcher_count(&self) -> usize {
        self.snapshot().len()
    }

    fn snapshot(&self) -> Vec<Arc<dyn Watcher>> {
        self.watchers
            .lock()
            .expect("aggregator mutex poisoned")
            .clone()
    }

    /// Prepares every watcher sequentially, in registration order. The first
    /// failure aborts the whole bootstrap.
    pub async fn prepare(&self) -> WatchResult<()> {
        if self.bootstrapped.swap(true, Ordering::SeqCst) {
            return Err(WatchError::Lifecycle("already prepared, cannot prepare twice".into()));
        }
        for watcher in self.snapshot() {
            info!(id = %watcher.id(), "preparing watcher");
            watcher.prepare().await.map_err(|e| {
                error!(id = %watcher.id(), error = %e, "watcher failed to prepare");
                e
            })?;
            watcher.core().set_state(WatcherState::Prepared);
        }
        Ok(())
    }

    /// Launches every watcher's loop and returns immediately. Loop failures
    /// are logged per watcher, never propagated.
    pub fn start(&self) -> WatchResult<()> {
        if !self.bootstrapped.load(Ordering::SeqCst) {
            return Err(WatchError::Lifecycle(
                "cannot start monitoring without preparing first".into(),
            ));
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(WatchError::Lifecycle("already started".into()));
        }
        let mut tasks = self.tasks.lock().expect("aggregator mutex poisoned");
        for watcher in self.snapshot() {
            watcher.core().set_state(WatcherState::Running);
            tasks.push(tokio::spawn(async move {
                let core = watcher.core();
                match with_shutdown_swallow(core, watcher.start()).await {
                    Ok(_) => info!(id = %core.id(), "watcher loop ended"),
                    Err(e) => error!(id = %core.id(), error = %e, "watcher loop failed"),
                }
            }));
        }
        Ok(())
    }

    pub fn links(&self) -> Vec<ObservedLink> {
        self.snapshot()
            .iter()
            .filter_map(|w| w.links())
            .flatten()
            .collect()
    }

    /// Deduplicated and sorted, so equal configurations give identical output.
    pub fn searches(&self) -> ObservedSearches {
        let mut terms = BTreeSet::new();
        let mut domains = BTreeSet::new();
        for s in self.snapshot().iter().filter_map(|w| w.searches()) {
            terms.extend(s.terms);
            domains.extend(s.domains);
        }
        ObservedSearches {
            terms: terms.into_iter().collect(),
            domains: domains.into_iter().collect(),
        }
    }

    /// Destroys every watcher (each exactly once) and waits for the loops to
    /// wind down, up to a grace period.
    pub async fn shutdown(&self) {
        for watcher in self.snapshot() {
            watcher.destroy().await;
        }
        let tasks: Vec<_> = self
            .tasks
            .lock()
            .expect("aggregator mutex poisoned")
            .drain(..)
            .collect();
        let joined = tokio::time::timeout(SHUTDOWN_GRACE, futures::future::join_all(tasks)).await;
        if joined.is_err() {
            warn!("some watcher loops did not stop within the grace period");
        }
        self.heartbeats.clear();
        self.found.clear();
        info!("all watchers destroyed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watcher::{Capability, WatcherCore};
    use async_trait::async_trait;

    struct Searchy {
        core: WatcherCore,
        domains: Vec<&'static str>,
        terms: Vec<&'static str>,
    }

    #[async_trait]
    impl Watcher for Searchy {
        fn core(&self) -> &WatcherCore {
            &self.core
        }
        fn capability(&self) -> Capability {
            Capability::Search(ObservedSearches {
                terms: self.terms.iter().map(|s| s.to_string()).collect(),
                domains: self.domains.iter().map(|s| s.to_string()).collect(),
            })
        }
        async fn prepare(&self) -> WatchResult<()> {
            Ok(())
        }
        async fn start(&self) -> WatchResult<()> {
            Ok(())
        }
    }

    #[test]
    fn searches_are_merged_sorted_and_deduplicated() {
        let agg = WatcherAggregator::new();
        agg.add_watcher(Arc::new(Searchy {
            core: WatcherCore::new("a"),
            domains: vec!["b", "a"],
            terms: vec!["y", "x"],
        }))
        .unwrap();
        agg.add_watcher(Arc::new(Searchy {
            core: WatcherCore::new("b"),
            domains: vec!["a"],
            terms: vec!["x"],
        }))
        .unwrap();
        let s = agg.searches();
        assert_eq!(s.domains, vec!["a", "b"]);
        assert_eq!(s.terms, vec!["x", "y"]);
        assert!(agg.links().is_empty());
    }
}
