//! Cross-cutting wrappers applied at call sites: swallow failures raised by
//! the shutdown race, retry on timeouts, tolerate double close.

use std::future::Future;
use tracing::{debug, warn};

use crate::error::{WatchError, WatchResult};
use crate::watcher::WatcherCore;

pub const MAX_TIMEOUT_ATTEMPTS: usize = 5;

/// Runs `fut`; an error is swallowed (`Ok(None)`) if and only if the watcher
/// is already shutting down when the error surfaces.
pub async fn with_shutdown_swallow<T, F>(core: &WatcherCore, fut: F) -> WatchResult<Option<T>>
where
    F: Future<Output = WatchResult<T>>,
{
    match fut.await {
        Ok(v) => Ok(Some(v)),
        Err(e) if core.is_shutting_down() => {
            debug!(id = %core.id(), error = %e, "error swallowed during shutdown");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

/// Retries `op` while it fails with a timeout, up to `max_attempts` calls.
/// Any other error is returned immediately.
pub async fn with_retry_on_timeout<T, F, Fut>(id: &str, max_attempts: usize, mut op: F) -> WatchResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = WatchResult<T>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_timeout() && attempt < max_attempts => {
                warn!(id, attempt, error = %e, "ignoring timeout, retrying");
            }
            Err(e) => {
                if !e.is_timeout() {
                    warn!(id, attempt, error = %e, "not a timeout, giving up");
                }
                return Err(e);
            }
        }
    }
}

/// Closes a page/session; an already-closed resource is not an error.
pub async fn close_quietly<F>(id: &str, fut: F)
where
    F: Future<Output = WatchResult<()>>,
{
    match fut.await {
        Ok(()) => {}
        Err(WatchError::Closed) => debug!(id, "already closed"),
        Err(e) => warn!(id, error = %e, "close failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watcher::WatcherState;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn retries_timeouts_then_succeeds() {
        let calls = AtomicUsize::new(0);
        let out = with_retry_on_timeout("t", MAX_TIMEOUT_ATTEMPTS, || async {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            if n < 2 {
                Err(WatchError::Timeout("slow".into()))
            } else {
                Ok(n)
            }
        })
        .await
        .unwrap();
        assert_eq!(out, 2);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts_and_on_other_errors() {
        let calls = AtomicUsize::new(0);
        let res: WatchResult<()> = with_retry_on_timeout("t", 3, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(WatchError::Timeout("slow".into()))
        })
        .await;
        assert!(res.unwrap_err().is_timeout());
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let calls = AtomicUsize::new(0);
        let res: WatchResult<()> = with_retry_on_timeout("t", 3, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(WatchError::Gone("x".into()))
        })
        .await;
        assert!(matches!(res, Err(WatchError::Gone(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn swallows_only_while_shutting_down() {
        let core = WatcherCore::new("w");
        let res = with_shutdown_swallow(&core, async { Err::<(), _>(WatchError::Closed) }).await;
        assert!(res.is_err());

        core.set_state(WatcherState::ShuttingDown);
        let res = with_shutdown_swallow(&core, async { Err::<(), _>(WatchError::Closed) }).await;
        assert!(matches!(res, Ok(None)));
    }
}
