// tests/api_http.rs
//
// HTTP-level tests for the status Router without opening sockets.
// We exercise the router directly via tower::ServiceExt::oneshot.
//
// Covered:
// - GET /health
// - GET /monitored_searches, /monitored_links
// - GET /status and /found_items fed through the aggregator buses
// - GET /events answers as an event stream

use async_trait::async_trait;
use axum::{
    body::{self, Body},
    http::{Request, StatusCode},
    Router,
};
use serde_json::Value as Json;
use std::sync::Arc;
use tower::ServiceExt as _; // for `oneshot`

use availability_watch::api::{self, AppState};
use availability_watch::error::WatchResult;
use availability_watch::model::{FoundItem, Heartbeat};
use availability_watch::pauser::Pauser;
use availability_watch::price::PriceParser;
use availability_watch::status::HeartbeatStatusStore;
use availability_watch::watcher::search::{SearchFetcher, SearchResult, SearchWatcher, SearchWatcherSettings};
use availability_watch::watcher::WatcherAggregator;

const BODY_LIMIT: usize = 1024 * 1024; // 1MB, safe for tests

struct Nothing;

#[async_trait]
impl SearchFetcher for Nothing {
    async fn search(&self, _domain: &str, _term: &str) -> WatchResult<Vec<SearchResult>> {
        Ok(Vec::new())
    }

    async fn refresh_session(&self, _domain: &str) -> WatchResult<()> {
        Ok(())
    }
}

/// Same wiring as the binary, minus the listener.
fn test_state() -> AppState {
    let aggregator = Arc::new(WatcherAggregator::new());
    let settings = SearchWatcherSettings {
        domains: vec!["amazon.it".into(), "amazon.de".into()],
        terms: vec!["rtx 3080".into(), "rtx 3070".into()],
        ..SearchWatcherSettings::default()
    };
    aggregator
        .add_watcher(Arc::new(SearchWatcher::new(
            settings,
            Arc::new(Nothing),
            Arc::new(Pauser::new()),
            PriceParser::default(),
        )))
        .expect("add search watcher");
    let state = AppState::new(aggregator, Arc::new(HeartbeatStatusStore::new()), "watch");
    state.attach();
    state
}

async fn get(app: Router, uri: &str) -> (StatusCode, Vec<u8>) {
    let req = Request::builder()
        .method("GET")
        .uri(uri)
        .body(Body::empty())
        .expect("build request");
    let resp = app.oneshot(req).await.expect("oneshot");
    let status = resp.status();
    let bytes = body::to_bytes(resp.into_body(), BODY_LIMIT)
        .await
        .expect("read body")
        .to_vec();
    (status, bytes)
}

async fn get_json(app: Router, uri: &str) -> Json {
    let (status, bytes) = get(app, uri).await;
    assert_eq!(status, StatusCode::OK, "{uri} should be 200");
    serde_json::from_slice(&bytes).expect("json body")
}

#[tokio::test]
async fn api_health_returns_200_and_ok_body() {
    let app = api::router(test_state());
    let (status, bytes) = get(app, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(String::from_utf8(bytes).expect("utf8"), "ok");
}

#[tokio::test]
async fn api_lists_sorted_searches_and_no_links() {
    let state = test_state();
    let v = get_json(api::router(state.clone()), "/monitored_searches").await;
    assert_eq!(v["domains"], serde_json::json!(["amazon.de", "amazon.it"]));
    assert_eq!(v["terms"], serde_json::json!(["rtx 3070", "rtx 3080"]));

    let links = get_json(api::router(state), "/monitored_links").await;
    assert_eq!(links, serde_json::json!([]));
}

#[tokio::test]
async fn api_status_reflects_heartbeats_and_found_items() {
    let state = test_state();
    let hb = Heartbeat::search("search", "amazon.it", "rtx 3070");
    state.aggregator.heartbeats().publish(hb.clone());
    state.aggregator.heartbeats().publish(hb);
    state.aggregator.heartbeats().publish(Heartbeat::stream("relay"));
    state.aggregator.found_items().publish(FoundItem {
        time: 1,
        url: "https://www.amazon.it/dp/B08KHHF881".into(),
        title: "RTX 3070".into(),
        price: "499,00 €".into(),
        parsed_price: Some(499.0),
        origin: "search".into(),
        valid: true,
        price_limit: None,
    });

    let v = get_json(api::router(state.clone()), "/status").await;
    let sources = v["sources"].as_array().expect("sources array");
    assert_eq!(sources.len(), 1, "stream heartbeats have no source");
    assert_eq!(sources[0]["source"]["type"], "search");
    assert_eq!(sources[0]["count"], 1);
    assert_eq!(v["found_items"], 1);

    let items = get_json(api::router(state), "/found_items").await;
    assert_eq!(items[0]["parsedPrice"], 499.0);
}

#[tokio::test]
async fn api_events_is_an_event_stream() {
    let app = api::router(test_state());
    let req = Request::builder()
        .method("GET")
        .uri("/events")
        .body(Body::empty())
        .expect("build request");
    let resp = app.oneshot(req).await.expect("oneshot");
    assert_eq!(resp.status(), StatusCode::OK);
    let ct = resp
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    assert!(ct.starts_with("text/event-stream"), "content-type was {ct}");
}
