//! Shared polling loop with the failure policy every polling watcher follows:
//!
//! - transient errors back off and retry
//! - a block or captcha triggers a session refresh / challenge solve first;
//!   two consecutive recovery failures are fatal for that poller
//! - structural and fatal errors leave the loop
//! - any error raised once shutdown began ends the loop quietly

use async_trait::async_trait;
use rand::Rng;
use std::time::Duration;
use tracing::{debug, error, warn};

use crate::error::{ErrorClass, WatchError, WatchResult};
use crate::pauser::Pauser;
use crate::watcher::WatcherCore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Sleep the regular interval.
    Continue,
    /// Sleep a longer, explicit time (e.g. after a hit, to avoid hammering).
    CoolDown(Duration),
}

#[derive(Debug, Clone)]
pub struct PollPolicy {
    pub interval: Duration,
    pub jitter: Duration,
    pub backoff: Duration,
    pub max_backoff: Duration,
    pub max_recovery_failures: u32,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            jitter: Duration::from_secs(3),
            backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            max_recovery_failures: 2,
        }
    }
}

impl PollPolicy {
    pub fn next_delay(&self) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return self.interval;
        }
        self.interval + Duration::from_millis(rand::rng().random_range(0..jitter_ms))
    }
}

/// One pollable target (a product page, a search) owned by a watcher.
#[async_trait]
pub trait PollTarget: Send + Sync {
    fn log_id(&self) -> &str;

    async fn poll_once(&self) -> WatchResult<CycleOutcome>;

    /// Re-fetch the root page and rotate cookies/headers.
    async fn refresh_session(&self) -> WatchResult<()>;

    async fn solve_challenge(&self, _at: &str) -> WatchResult<()> {
        self.refresh_session().await
    }
}

pub async fn run_poll_loop(
    core: &WatcherCore,
    pauser: &Pauser,
    policy: &PollPolicy,
    target: &dyn PollTarget,
) -> WatchResult<()> {
    let id = target.log_id();
    let mut backoff = policy.backoff;
    let mut recovery_failures = 0u32;

    while !core.should_stop() {
        if !pauser.pause_check_or(core.stopped()).await || core.should_stop() {
            break;
        }

        let err = match target.poll_once().await {
            Ok(outcome) => {
                backoff = policy.backoff;
                recovery_failures = 0;
                let delay = match outcome {
                    CycleOutcome::Continue => policy.next_delay(),
                    CycleOutcome::CoolDown(d) => d,
                };
                if !core.nap(delay).await {
                    break;
                }
                continue;
            }
            Err(e) => e,
        };

        if core.is_shutting_down() {
            debug!(id, error = %err, "poll error during shutdown ignored");
            break;
        }

        match err.class() {
            ErrorClass::Transient => {
                debug!(id, error = %err, backoff_ms = backoff.as_millis() as u64, "transient failure");
                if !core.nap(backoff).await {
                    break;
                }
                backoff = (backoff * 2).min(policy.max_backoff);
            }
            ErrorClass::SessionInvalidating | ErrorClass::Challenge => {
                warn!(id, error = %err, "session needs recovery");
                let recovered = match &err {
                    WatchError::Captcha(at) => target.solve_challenge(at).await,
                    _ => target.refresh_session().await,
                };
                match recovered {
                    Ok(()) => recovery_failures = 0,
                    Err(re) => {
                        recovery_failures += 1;
                        if recovery_failures >= policy.max_recovery_failures {
                            error!(id, error = %re, "session recovery failed twice, giving up");
                            return Err(re);
                        }
                        warn!(id, error = %re, "session recovery failed");
                        if !core.nap(backoff).await {
                            break;
                        }
                    }
                }
            }
            ErrorClass::Structural | ErrorClass::Fatal | ErrorClass::Closed => {
                error!(id, error = %err, "poller stopped");
                return Err(err);
            }
        }
    }
    Ok(())
}
