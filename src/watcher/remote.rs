//! Stream watcher relaying the events of another running instance.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::{ErrorClass, WatchResult};
use crate::lifecycle::close_quietly;
use crate::model::{now_ms, FoundItem, Heartbeat};
use crate::watcher::{Capability, Watcher, WatcherCore};

const MINUTE_MS: u64 = 60_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum RemoteEvent {
    Heartbeat(Heartbeat),
    ItemFound(FoundItem),
}

#[async_trait]
pub trait RemoteFeed: Send + Sync {
    async fn connect(&self) -> WatchResult<()>;

    /// Next relayed event; `None` once the stream ended. Must be cancel safe.
    async fn next_event(&self) -> WatchResult<Option<RemoteEvent>>;

    async fn close(&self) -> WatchResult<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RemoteWatcherSettings {
    pub address: String,
    pub disconnect_alert_secs: u64,
    pub check_every_secs: u64,
    pub reconnect_delay_secs: u64,
}

impl Default for RemoteWatcherSettings {
    fn default() -> Self {
        Self {
            address: String::new(),
            disconnect_alert_secs: 600,
            check_every_secs: 60,
            reconnect_delay_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Healthy,
    Silent { minutes: u64, warn: bool },
    Recovered,
}

/// Tracks the gap since the last relayed heartbeat.
#[derive(Debug)]
pub struct LivenessMonitor {
    alert_after_ms: u64,
    last_heartbeat_ms: u64,
    disconnected: bool,
}

impl LivenessMonitor {
    pub fn new(alert_after: Duration, now_ms: u64) -> Self {
        Self {
            alert_after_ms: alert_after.as_millis() as u64,
            last_heartbeat_ms: now_ms,
            disconnected: false,
        }
    }

    pub fn record(&mut self, now_ms: u64) {
        self.last_heartbeat_ms = now_ms;
    }

    /// Warns every five minutes of silence once the alert threshold passed.
    pub fn check(&mut self, now_ms: u64) -> Liveness {
        let gap = now_ms.saturating_sub(self.last_heartbeat_ms);
        if gap > self.alert_after_ms {
            self.disconnected = true;
            let minutes = gap / MINUTE_MS;
            return Liveness::Silent {
                minutes,
                warn: minutes % 5 == 0,
            };
        }
        if self.disconnected {
            self.disconnected = false;
            return Liveness::Recovered;
        }
        Liveness::Healthy
    }
}

pub struct RemoteWatcher {
    core: WatcherCore,
    settings: RemoteWatcherSettings,
    feed: Arc<dyn RemoteFeed>,
}

impl RemoteWatcher {
    pub fn new(settings: RemoteWatcherSettings, feed: Arc<dyn RemoteFeed>) -> Self {
        Self {
            core: WatcherCore::new(format!("remote/{}", settings.address)),
            settings,
            feed,
        }
    }

    async fn reconnect(&self) {
        if !self
            .core
            .nap(Duration::from_secs(self.settings.reconnect_delay_secs))
            .await
        {
            return;
        }
        if let Err(e) = self.feed.connect().await {
            warn!(address = %self.settings.address, error = %e, "reconnect failed");
        }
    }
}

#[async_trait]
impl Watcher for RemoteWatcher {
    fn core(&self) -> &WatcherCore {
        &self.core
    }

    fn capability(&self) -> Capability {
        Capability::Stream
    }

    async fn prepare(&self) -> WatchResult<()> {
        self.feed.connect().await?;
        info!(address = %self.settings.address, "connected to remote watcher");
        Ok(())
    }

    async fn start(&self) -> WatchResult<()> {
        let address = &self.settings.address;
        let mut monitor = LivenessMonitor::new(
            Duration::from_secs(self.settings.disconnect_alert_secs),
            now_ms(),
        );
        let mut ticker =
            tokio::time::interval(Duration::from_secs(self.settings.check_every_secs.max(1)));
        ticker.tick().await;

        while !self.core.should_stop() {
            tokio::select! {
                _ = self.core.stopped() => break,
                _ = ticker.tick() => match monitor.check(now_ms()) {
                    Liveness::Silent { minutes, warn: true } => {
                        warn!(%address, minutes, "no news from the remote server");
                    }
                    Liveness::Recovered => info!(%address, "connectivity from the remote server is back"),
                    _ => {}
                },
                event = self.feed.next_event() => match event {
                    Ok(Some(RemoteEvent::Heartbeat(hb))) => {
                        monitor.record(now_ms());
                        self.core.emit_heartbeat(hb);
                    }
                    Ok(Some(RemoteEvent::ItemFound(item))) => self.core.emit_found(item),
                    Ok(None) => {
                        warn!(%address, "remote stream ended, reconnecting");
                        self.reconnect().await;
                    }
                    Err(e) if matches!(e.class(), ErrorClass::Transient | ErrorClass::SessionInvalidating) => {
                        warn!(%address, error = %e, "remote stream failed, reconnecting");
                        self.reconnect().await;
                    }
                    Err(e) => return Err(e),
                },
            }
        }
        Ok(())
    }

    fn has_shutdown(&self) -> bool {
        true
    }

    async fn shutdown(&self) -> WatchResult<()> {
        close_quietly(&self.settings.address, self.feed.close()).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn liveness_warns_every_five_minutes_then_recovers() {
        let t0 = 1_000_000;
        let mut m = LivenessMonitor::new(Duration::from_secs(600), t0);
        assert_eq!(m.check(t0 + 5 * MINUTE_MS), Liveness::Healthy);
        assert_eq!(
            m.check(t0 + 11 * MINUTE_MS),
            Liveness::Silent { minutes: 11, warn: false }
        );
        assert_eq!(
            m.check(t0 + 15 * MINUTE_MS),
            Liveness::Silent { minutes: 15, warn: true }
        );
        m.record(t0 + 16 * MINUTE_MS);
        assert_eq!(m.check(t0 + 17 * MINUTE_MS), Liveness::Recovered);
        assert_eq!(m.check(t0 + 18 * MINUTE_MS), Liveness::Healthy);
    }

    #[test]
    fn remote_events_are_tagged() {
        let ev = RemoteEvent::Heartbeat(Heartbeat::stream("relay"));
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["event"], "heartbeat");
        assert_eq!(v["data"]["type"], "stream");
    }
}
