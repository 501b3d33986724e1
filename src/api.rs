//! HTTP surface for the status UI: introspection snapshots plus a
//! server-sent event stream of everything the aggregator relays.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_stream::{wrappers::BroadcastStream, Stream, StreamExt};
use tower_http::cors::CorsLayer;
use tracing::debug;

use crate::model::{FoundItem, ObservedLink, ObservedSearches};
use crate::status::{HeartbeatStatusStore, StatusSnapshot};
use crate::watcher::remote::RemoteEvent;
use crate::watcher::WatcherAggregator;

const EVENTS_CAPACITY: usize = 1024;

#[derive(Clone)]
pub struct AppState {
    pub aggregator: Arc<WatcherAggregator>,
    pub status: Arc<HeartbeatStatusStore>,
    pub events: broadcast::Sender<RemoteEvent>,
    pub started: DateTime<Utc>,
    pub bundle: String,
}

impl AppState {
    pub fn new(aggregator: Arc<WatcherAggregator>, status: Arc<HeartbeatStatusStore>, bundle: &str) -> Self {
        let (events, _) = broadcast::channel(EVENTS_CAPACITY);
        Self {
            aggregator,
            status,
            events,
            started: Utc::now(),
            bundle: bundle.to_string(),
        }
    }

    /// Feeds the status store and the event stream from the aggregator.
    pub fn attach(&self) {
        let status = self.status.clone();
        let events = self.events.clone();
        self.aggregator.heartbeats().subscribe(move |hb| {
            status.add_heartbeat(hb);
            // no subscribers is fine
            let _ = events.send(RemoteEvent::Heartbeat(hb.clone()));
        });
        let status = self.status.clone();
        let events = self.events.clone();
        self.aggregator.found_items().subscribe(move |item| {
            status.push_found_item(item.clone());
            let _ = events.send(RemoteEvent::ItemFound(item.clone()));
        });
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/health", get(|| async { "ok" }))
        .route("/monitored_links", get(monitored_links))
        .route("/monitored_searches", get(monitored_searches))
        .route("/status", get(status))
        .route("/found_items", get(found_items))
        .route("/events", get(events))
        .layer(CorsLayer::very_permissive())
        .with_state(state)
}

#[derive(Serialize)]
struct IndexResp {
    started: DateTime<Utc>,
    bundle: String,
    watchers: usize,
}

async fn index(State(state): State<AppState>) -> Json<IndexResp> {
    Json(IndexResp {
        started: state.started,
        bundle: state.bundle.clone(),
        watchers: state.aggregator.watcher_count(),
    })
}

async fn monitored_links(State(state): State<AppState>) -> Json<Vec<ObservedLink>> {
    Json(state.aggregator.links())
}

async fn monitored_searches(State(state): State<AppState>) -> Json<ObservedSearches> {
    Json(state.aggregator.searches())
}

async fn status(State(state): State<AppState>) -> Json<StatusSnapshot> {
    Json(state.status.snapshot())
}

async fn found_items(State(state): State<AppState>) -> Json<Vec<FoundItem>> {
    Json(state.status.found_items())
}

fn to_sse(event: RemoteEvent) -> Option<Event> {
    let built = match &event {
        RemoteEvent::Heartbeat(hb) => Event::default().event("heartbeat").json_data(hb),
        RemoteEvent::ItemFound(item) => Event::default().event("item_found").json_data(item),
    };
    built.ok()
}

async fn events(State(state): State<AppState>) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = BroadcastStream::new(state.events.subscribe()).filter_map(|msg| match msg {
        Ok(event) => to_sse(event).map(Ok),
        Err(lagged) => {
            debug!(error = %lagged, "slow event subscriber skipped events");
            None
        }
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}
