use anyhow::{Context, Result};
use axum::{routing::get, Router};
use metrics::{describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;

static DESCRIBED: OnceCell<()> = OnceCell::new();

/// Registers help texts once per process.
pub fn describe() {
    DESCRIBED.get_or_init(|| {
        describe_counter!("watch_heartbeats_total", "Heartbeats emitted, by origin");
        describe_counter!("watch_items_found_total", "Found items emitted, by origin");
        describe_counter!(
            "watch_dedup_suppressed_total",
            "Found items dropped as recent duplicates, by scope"
        );
        describe_counter!("purchase_attempts_total", "Calls into the purchase coordinator");
        describe_counter!(
            "purchase_attempts_rejected_total",
            "Attempts rejected by the title/price filters, by reason"
        );
        describe_counter!(
            "purchase_attempts_inflight_dropped_total",
            "Attempts dropped because one for the same item was running"
        );
        describe_counter!("purchase_success_total", "Claims that completed");
        describe_counter!("strategy_refreshes_total", "Strategy page refreshes");
        describe_gauge!("watch_paused", "1 while the global pause is on");
    });
}

pub struct Metrics {
    pub handle: PrometheusHandle,
}

impl Metrics {
    /// Installs the global Prometheus recorder. Only one per process.
    pub fn init() -> Result<Self> {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .context("prometheus: install recorder")?;
        describe();
        gauge!("watch_paused").set(0.0);
        Ok(Self { handle })
    }

    /// Returns a router exposing `/metrics` with the Prometheus exposition format.
    pub fn router(&self) -> Router {
        let handle = self.handle.clone();
        Router::new().route(
            "/metrics",
            get(move || {
                let h = handle.clone();
                async move { h.render() }
            }),
        )
    }
}
