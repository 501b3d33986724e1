use metrics::gauge;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::info;

const PAUSE_STEP: Duration = Duration::from_millis(500);

/// Process-wide pause switch. One instance is shared (`Arc<Pauser>`) by every
/// polling loop, strategy and claim step.
#[derive(Debug, Default)]
pub struct Pauser {
    paused: AtomicBool,
}

impl Pauser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pause(&self) {
        info!("pausing all refreshers");
        self.paused.store(true, Ordering::SeqCst);
        gauge!("watch_paused").set(1.0);
    }

    pub fn resume(&self) {
        info!("resuming all refreshers");
        self.paused.store(false, Ordering::SeqCst);
        gauge!("watch_paused").set(0.0);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Wait point: returns immediately unless paused, otherwise sleeps in
    /// fixed steps until resumed.
    pub async fn pause_check(&self) {
        while self.is_paused() {
            tokio::time::sleep(PAUSE_STEP).await;
        }
    }

    /// [`pause_check`](Self::pause_check) that also gives up once `stopped`
    /// resolves. False when stopped while paused.
    pub async fn pause_check_or<F>(&self, stopped: F) -> bool
    where
        F: Future<Output = ()>,
    {
        if !self.is_paused() {
            return true;
        }
        tokio::select! {
            _ = self.pause_check() => true,
            _ = stopped => false,
        }
    }
}
