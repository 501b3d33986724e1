//! "Refresh until available" loop run by each strategy page, and the
//! first-success race between them.

use futures::stream::{FuturesUnordered, StreamExt};
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{ErrorClass, WatchError, WatchResult};
use crate::model::{ProductInfo, SharedPurchaseStatus};
use crate::pauser::Pauser;
use crate::purchase::availability::{classify, Availability};
use crate::purchase::ProductSession;

const RATE_LOG_EVERY: u64 = 25;
const OTHER_SELLERS_DELAY: Duration = Duration::from_millis(1400);
const RETRY_PAUSE_FLOOR: Duration = Duration::from_millis(50);
const RETRY_PAUSE_CAP: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckType {
    DirectOnly,
    DirectThenOther,
    DirectAndOtherConcurrently,
    DirectAndOtherTogether,
}

/// Whether a scrape also opens the other-sellers tray.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOtherSellers {
    Never,
    Always,
    /// Only when the buy box shows nothing from the preferred source.
    WhenNotAvailable,
    /// Buy box and tray from the same page load.
    Both,
}

/// One page a strategy keeps refreshing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PagePlan {
    pub url: String,
    pub fetch: FetchOtherSellers,
    pub delay: Duration,
}

fn with_param(url: &str, param: &str) -> String {
    let sep = if url.contains('?') { '&' } else { '?' };
    format!("{url}{sep}{param}")
}

/// Pages opened for one strategy. Checking concurrently uses two pages, the
/// tray page starting a little later.
pub fn plan_pages(check: CheckType, url: &str) -> Vec<PagePlan> {
    match check {
        CheckType::DirectAndOtherConcurrently => vec![
            PagePlan {
                url: with_param(url, "aod=0"),
                fetch: FetchOtherSellers::Never,
                delay: Duration::ZERO,
            },
            PagePlan {
                url: with_param(url, "aod=1"),
                fetch: FetchOtherSellers::Always,
                delay: OTHER_SELLERS_DELAY,
            },
        ],
        CheckType::DirectThenOther => vec![PagePlan {
            url: url.to_string(),
            fetch: FetchOtherSellers::WhenNotAvailable,
            delay: Duration::ZERO,
        }],
        CheckType::DirectOnly => vec![PagePlan {
            url: url.to_string(),
            fetch: FetchOtherSellers::Never,
            delay: Duration::ZERO,
        }],
        CheckType::DirectAndOtherTogether => vec![PagePlan {
            url: with_param(url, "aod=1"),
            fetch: FetchOtherSellers::Both,
            delay: Duration::ZERO,
        }],
    }
}

/// Keeps one strategy page fresh until the item shows up.
pub struct Refresher {
    pub log_id: String,
    pub plan: PagePlan,
    pub session: Arc<dyn ProductSession>,
    pub reported_price: Option<f64>,
    pub shared: Arc<SharedPurchaseStatus>,
    pub stop: Arc<AtomicBool>,
    pub deadline: Instant,
    pub pauser: Arc<Pauser>,
    pub refresh_pause: Duration,
}

impl Refresher {
    fn stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    async fn refresh(&self) -> WatchResult<Option<ProductInfo>> {
        self.session.navigate(&self.plan.url).await?;
        tokio::time::sleep(self.refresh_pause).await;
        self.session.fetch_info(self.plan.fetch).await
    }

    /// `Ok(Some)` with a favorable scrape; `Ok(None)` when told to stop or
    /// when a sibling found the item is not from the preferred source;
    /// `Err(Timeout)` once the deadline passed.
    pub async fn run(self) -> WatchResult<Option<ProductInfo>> {
        let id = self.log_id.as_str();
        if !self.plan.delay.is_zero() {
            tokio::time::sleep(self.plan.delay).await;
        }
        self.pauser.pause_check().await;
        if self.stopped() {
            return Ok(None);
        }

        let started = Instant::now();
        let mut info = None;
        let mut availability = Availability::NotAvailable;
        let mut refreshes: u64 = 0;
        let mut retry_pause = self.refresh_pause;

        while availability == Availability::NotAvailable
            && Instant::now() < self.deadline
            && !self.stopped()
        {
            if self.shared.is_not_preferred() {
                info!(id, "another page found it is not sold by the preferred source, abandoning");
                return Ok(None);
            }
            self.pauser.pause_check().await;
            refreshes += 1;
            counter!("strategy_refreshes_total").increment(1);

            match self.refresh().await {
                Ok(fresh) => {
                    info = fresh;
                    retry_pause = self.refresh_pause;
                }
                Err(e) if e.class() == ErrorClass::Transient => {
                    debug!(id, error = %e, pause_ms = retry_pause.as_millis() as u64, "refresh failed, trying again");
                    tokio::time::sleep(retry_pause).await;
                    retry_pause = (retry_pause * 2).clamp(RETRY_PAUSE_FLOOR, RETRY_PAUSE_CAP);
                    continue;
                }
                Err(e) => return Err(e),
            }
            availability = classify(info.as_ref(), self.reported_price);

            if refreshes % RATE_LOG_EVERY == 0 {
                let secs = started.elapsed().as_secs_f64().max(0.001);
                info!(id, refreshes, rate = refreshes as f64 / secs, "refreshing");
            }
        }

        if self.stopped() {
            debug!(id, "stopped by the race");
            return Ok(None);
        }
        match availability {
            Availability::NotAvailable => {
                warn!(id, refreshes, "item did not show up before the deadline");
                Err(WatchError::Timeout(format!("{id}: still not available")))
            }
            Availability::FromOtherSellers => {
                info!(id, "available, but not from the preferred source");
                self.shared.mark_not_preferred();
                Ok(info)
            }
            Availability::FromPreferred => {
                info!(id, refreshes, "available from the preferred source");
                Ok(info)
            }
        }
    }
}

fn stop_all(stops: &[Arc<AtomicBool>]) {
    for stop in stops {
        stop.store(true, Ordering::SeqCst);
    }
}

/// Resolves with the index and value of the first task producing `Some`.
/// Every stop flag is raised as soon as there is a winner, or once all
/// tasks finished without one. Losing tasks are not aborted.
pub async fn first_success<T>(
    handles: Vec<JoinHandle<WatchResult<Option<T>>>>,
    stops: &[Arc<AtomicBool>],
) -> Option<(usize, T)>
where
    T: Send + 'static,
{
    let mut pending: FuturesUnordered<_> = handles
        .into_iter()
        .enumerate()
        .map(|(i, h)| async move { (i, h.await) })
        .collect();

    while let Some((i, joined)) = pending.next().await {
        match joined {
            Ok(Ok(Some(value))) => {
                stop_all(stops);
                return Some((i, value));
            }
            Ok(Ok(None)) => debug!(strategy = i, "strategy gave up"),
            Ok(Err(e)) => warn!(strategy = i, error = %e, "strategy failed"),
            Err(e) => warn!(strategy = i, error = %e, "strategy task panicked"),
        }
    }
    stop_all(stops);
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn concurrent_check_opens_two_pages() {
        let plans = plan_pages(
            CheckType::DirectAndOtherConcurrently,
            "https://www.amazon.it/dp/B08KHHF881",
        );
        assert_eq!(plans.len(), 2);
        assert_eq!(plans[0].url, "https://www.amazon.it/dp/B08KHHF881?aod=0");
        assert_eq!(plans[1].url, "https://www.amazon.it/dp/B08KHHF881?aod=1");
        assert_eq!(plans[1].delay, Duration::from_millis(1400));
        assert_eq!(plans[1].fetch, FetchOtherSellers::Always);
    }

    #[test]
    fn single_page_plans() {
        let url = "https://www.amazon.de/dp/B08KHHF881?th=1";
        assert_eq!(plan_pages(CheckType::DirectOnly, url)[0].fetch, FetchOtherSellers::Never);
        assert_eq!(
            plan_pages(CheckType::DirectThenOther, url)[0].fetch,
            FetchOtherSellers::WhenNotAvailable
        );
        let together = plan_pages(CheckType::DirectAndOtherTogether, url);
        assert_eq!(together[0].url, "https://www.amazon.de/dp/B08KHHF881?th=1&aod=1");
        assert_eq!(together[0].fetch, FetchOtherSellers::Both);
    }

    #[tokio::test]
    async fn first_success_stops_everyone() {
        let stops: Vec<_> = (0..3).map(|_| Arc::new(AtomicBool::new(false))).collect();
        let slow_stop = stops[2].clone();
        let handles = vec![
            tokio::spawn(async { Err::<Option<u32>, _>(WatchError::Timeout("a".into())) }),
            tokio::spawn(async { Ok(Some(7u32)) }),
            tokio::spawn(async move {
                while !slow_stop.load(Ordering::SeqCst) {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
                Ok(None)
            }),
        ];
        let winner = first_success(handles, &stops).await;
        assert_eq!(winner, Some((1, 7)));
        assert!(stops.iter().all(|s| s.load(Ordering::SeqCst)));
    }

    #[tokio::test]
    async fn no_winner_when_all_fail() {
        let stops = vec![Arc::new(AtomicBool::new(false))];
        let handles = vec![tokio::spawn(async { Ok::<Option<u32>, WatchError>(None) })];
        assert_eq!(first_success(handles, &stops).await, None);
        assert!(stops[0].load(Ordering::SeqCst));
    }
}
