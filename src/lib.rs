// src/lib.rs
// Public library surface for the binary and the integration tests.

pub mod api;
pub mod app;
pub mod bus;
pub mod config;
pub mod console;
pub mod dedup;
pub mod error;
pub mod identity;
pub mod lifecycle;
pub mod metrics;
pub mod model;
pub mod pauser;
pub mod price;
pub mod status;

// Watchers and the aggregator composing them
pub mod watcher;

// Purchase racing and the claim flow
pub mod purchase;

// HTTP reference collaborators (pages, search, relay)
pub mod session;

pub mod notify;

// ---- Re-exports for stable public API ----
pub use crate::api::router;
pub use crate::error::{WatchError, WatchResult};
pub use crate::notify::NotifierMux;
pub use crate::watcher::WatcherAggregator;
