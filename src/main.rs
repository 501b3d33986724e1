//! Availability watch: binary entrypoint.
//! Loads the config, starts one bundle of watchers and serves the status API.

use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::BufReader;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use availability_watch::api::{router, AppState};
use availability_watch::app::{build_coordinator, build_watchers, Dispatcher};
use availability_watch::config::{AppConfig, ENV_CONFIG_PATH};
use availability_watch::console::run_console;
use availability_watch::metrics::Metrics;
use availability_watch::notify::NotifierMux;
use availability_watch::pauser::Pauser;
use availability_watch::price::PriceParser;
use availability_watch::status::HeartbeatStatusStore;
use availability_watch::watcher::WatcherAggregator;

#[derive(Debug, Parser)]
#[command(name = "availability-watch", about = "Watches restocks and races purchases")]
struct Cli {
    /// Bundle of watchers to run, as named in the config.
    #[arg(long, default_value = "watch")]
    bundle: String,

    /// Port of the status API.
    #[arg(long, default_value_t = 3000)]
    port: u16,

    /// Config file (TOML or JSON); overrides WATCH_CONFIG_PATH.
    #[arg(long)]
    config: Option<String>,

    /// Emit JSON log lines.
    #[arg(long)]
    json: bool,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("availability_watch=info,warn"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer().compact()).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env in local/dev; no-op when absent.
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    init_tracing(cli.json);

    let config = match &cli.config {
        Some(path) => AppConfig::load_from_file(path)
            .with_context(|| format!("--config {path} ({ENV_CONFIG_PATH} ignored)"))?,
        None => AppConfig::load()?,
    };
    let bundle = config.bundle(&cli.bundle)?.clone();
    let metrics = Metrics::init()?;

    let pauser = Arc::new(Pauser::new());
    let prices = PriceParser::new(config.exchange.gbp_to_eur);

    let aggregator = Arc::new(WatcherAggregator::new());
    aggregator.add_watchers(build_watchers(&config, &bundle, &pauser, prices)?)?;

    let coordinator = build_coordinator(&config, &bundle, &pauser, prices);
    if let Some(c) = &coordinator {
        c.prepare().await.context("preparing purchase strategies")?;
    }
    let dispatcher = Arc::new(Dispatcher::new(
        config.dedup.dispatch_window_secs,
        NotifierMux::from_settings(&config.notify),
        coordinator.clone(),
    ));
    dispatcher.attach(&aggregator);

    aggregator.prepare().await.context("preparing watchers")?;

    let status = Arc::new(HeartbeatStatusStore::new());
    let state = AppState::new(aggregator.clone(), status, &cli.bundle);
    state.attach();

    aggregator.start()?;
    info!(bundle = %cli.bundle, watchers = aggregator.watcher_count(), buying = coordinator.is_some(), "bundle started");

    let app = router(state).merge(metrics.router());
    let addr = SocketAddr::from(([0, 0, 0, 0], cli.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(%addr, "status api listening");
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "status api stopped");
        }
    });

    tokio::spawn(run_console(
        BufReader::new(tokio::io::stdin()),
        pauser.clone(),
        coordinator.clone(),
    ));

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutting down, press ctrl-c again to exit immediately");
    tokio::select! {
        _ = aggregator.shutdown() => info!("watchers stopped"),
        _ = tokio::signal::ctrl_c() => warn!("second ctrl-c, exiting now"),
    }
    Ok(())
}
