//! # Watchers
//! A watcher polls or streams from exactly one source and emits heartbeats
//! and found items on its two buses.
//!
//! Lifecycle: `Constructed → Prepared → Running → ShuttingDown → Destroyed`.
//! `prepare()` completes before `start()`; `destroy()` runs at most once,
//! wipes the listeners and awaits the optional `shutdown()`.

pub mod aggregator;
pub mod partalert;
pub mod poll;
pub mod product;
pub mod remote;
pub mod search;
pub mod social;

use async_trait::async_trait;
use metrics::counter;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::bus::EventBus;
use crate::error::WatchResult;
use crate::lifecycle::with_shutdown_swallow;
use crate::model::{FoundItem, Heartbeat, ObservedLink, ObservedSearches};

pub use aggregator::WatcherAggregator;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherState {
    Constructed,
    Prepared,
    Running,
    ShuttingDown,
    Destroyed,
}

/// What a watcher can be asked about.
#[derive(Debug, Clone, PartialEq)]
pub enum Capability {
    Link(Vec<ObservedLink>),
    Search(ObservedSearches),
    Stream,
}

/// State shared by every watcher kind: buses, lifecycle state, stop flag.
pub struct WatcherCore {
    id: String,
    heartbeats: EventBus<Heartbeat>,
    found: EventBus<FoundItem>,
    state: Mutex<WatcherState>,
    stop: AtomicBool,
    wake: Notify,
}

impl WatcherCore {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            heartbeats: EventBus::new(),
            found: EventBus::new(),
            state: Mutex::new(WatcherState::Constructed),
            stop: AtomicBool::new(false),
            wake: Notify::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn heartbeats(&self) -> &EventBus<Heartbeat> {
        &self.heartbeats
    }

    pub fn found_items(&self) -> &EventBus<FoundItem> {
        &self.found
    }

    pub fn state(&self) -> WatcherState {
        *self.state.lock().expect("watcher state mutex poisoned")
    }

    pub fn set_state(&self, state: WatcherState) {
        *self.state.lock().expect("watcher state mutex poisoned") = state;
    }

    pub fn is_shutting_down(&self) -> bool {
        matches!(
            self.state(),
            WatcherState::ShuttingDown | WatcherState::Destroyed
        )
    }

    /// Moves to `ShuttingDown`; false if shutdown had already begun.
    pub fn begin_shutdown(&self) -> bool {
        let mut state = self.state.lock().expect("watcher state mutex poisoned");
        if matches!(*state, WatcherState::ShuttingDown | WatcherState::Destroyed) {
            return false;
        }
        *state = WatcherState::ShuttingDown;
        true
    }

    pub fn should_stop(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.wake.notify_waiters();
    }

    /// Sleeps for `d` unless a stop is requested first. Returns false when
    /// the loop should exit.
    pub async fn nap(&self, d: Duration) -> bool {
        // Registered before the flag check so a concurrent stop is not missed.
        let woken = self.wake.notified();
        if self.should_stop() {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(d) => !self.should_stop(),
            _ = woken => false,
        }
    }

    /// Resolves once a stop has been requested.
    pub async fn stopped(&self) {
        loop {
            let woken = self.wake.notified();
            if self.should_stop() {
                return;
            }
            woken.await;
        }
    }

    pub fn emit_heartbeat(&self, hb: Heartbeat) {
        counter!("watch_heartbeats_total", "origin" => hb.origin().to_string()).increment(1);
        self.heartbeats.publish(hb);
    }

    pub fn emit_found(&self, item: FoundItem) {
        counter!("watch_items_found_total", "origin" => item.origin.clone()).increment(1);
        debug!(id = %self.id, url = %item.url, price = %item.price, "item found");
        self.found.publish(item);
    }
}

#[async_trait]
pub trait Watcher: Send + Sync {
    fn core(&self) -> &WatcherCore;

    fn capability(&self) -> Capability;

    /// One-time setup. Must not emit events.
    async fn prepare(&self) -> WatchResult<()>;

    /// The polling/streaming loop. Returns on stop or on a fatal error.
    async fn start(&self) -> WatchResult<()>;

    /// Whether `shutdown()` does anything beyond the default stop flag.
    fn has_shutdown(&self) -> bool {
        false
    }

    async fn shutdown(&self) -> WatchResult<()> {
        Ok(())
    }

    fn id(&self) -> &str {
        self.core().id()
    }

    fn links(&self) -> Option<Vec<ObservedLink>> {
        match self.capability() {
            Capability::Link(links) => Some(links),
            _ => None,
        }
    }

    fn searches(&self) -> Option<ObservedSearches> {
        match self.capability() {
            Capability::Search(searches) => Some(searches),
            _ => None,
        }
    }

    /// Idempotent teardown; never fails from the caller's perspective.
    async fn destroy(&self) {
        let core = self.core();
        if !core.begin_shutdown() {
            return;
        }
        core.request_stop();
        core.heartbeats().clear();
        core.found_items().clear();
        if self.has_shutdown() {
            if let Err(e) = with_shutdown_swallow(core, self.shutdown()).await {
                warn!(id = %core.id(), error = %e, "shutdown failed");
            }
        }
        core.set_state(WatcherState::Destroyed);
    }
}

/// Every price (in cents) ever seen per item; `is_new` is true only for a
/// never-seen item or a price not seen before for it.
#[derive(Debug, Default)]
pub struct SeenPrices {
    seen: Mutex<HashMap<String, HashSet<Option<i64>>>>,
}

impl SeenPrices {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_new(&self, key: &str, price: Option<f64>) -> bool {
        let cents = price.map(|p| (p * 100.0).round() as i64);
        let mut seen = self.seen.lock().expect("seen prices mutex poisoned");
        seen.entry(key.to_string()).or_default().insert(cents)
    }
}
