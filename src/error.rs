//! Typed errors shared by watchers, strategies and collaborators.
//!
//! Every error maps onto one [`ErrorClass`]; the polling loops decide what to
//! do from the class alone (retry, refresh the session, or give up).

use thiserror::Error;

/// How a failure must be handled by the loop that observed it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Timeouts, resets, DNS misses: retry after a backoff sleep.
    Transient,
    /// The remote side blocked us: refresh the session before resuming.
    SessionInvalidating,
    /// A captcha must be solved before the loop continues.
    Challenge,
    /// Page layout or state assumptions violated: fatal for the current attempt.
    Structural,
    /// Nothing left to poll (gone resource, bad config, lifecycle misuse).
    Fatal,
    /// The page/session was already closed underneath us.
    Closed,
}

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("bot detection triggered: {0}")]
    BotDetected(String),

    #[error("captcha challenge at {0}")]
    Captcha(String),

    #[error("resource no longer exists: {0}")]
    Gone(String),

    #[error("page or session already closed")]
    Closed,

    #[error("unexpected page state: {0}")]
    Structural(String),

    #[error("unsupported operation: {0}")]
    Unsupported(String),

    #[error("price not recognised: {0:?}")]
    Price(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("lifecycle violation: {0}")]
    Lifecycle(String),
}

impl WatchError {
    pub fn class(&self) -> ErrorClass {
        match self {
            WatchError::Transient(_) | WatchError::Timeout(_) => ErrorClass::Transient,
            WatchError::BotDetected(_) => ErrorClass::SessionInvalidating,
            WatchError::Captcha(_) => ErrorClass::Challenge,
            WatchError::Structural(_) | WatchError::Unsupported(_) | WatchError::Price(_) => {
                ErrorClass::Structural
            }
            WatchError::Gone(_) | WatchError::Config(_) | WatchError::Lifecycle(_) => {
                ErrorClass::Fatal
            }
            WatchError::Closed => ErrorClass::Closed,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, WatchError::Timeout(_))
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, WatchError::Closed)
    }

    /// Maps a reqwest failure onto the taxonomy (used by the HTTP collaborators).
    pub fn from_http(url: &str, err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            return WatchError::Timeout(url.to_string());
        }
        if let Some(status) = err.status() {
            return Self::from_status(url, status.as_u16());
        }
        WatchError::Transient(format!("{url}: {err}"))
    }

    pub fn from_status(url: &str, status: u16) -> Self {
        match status {
            404 | 410 => WatchError::Gone(url.to_string()),
            403 | 429 | 503 => WatchError::BotDetected(format!("{url} answered {status}")),
            500..=599 => WatchError::Transient(format!("{url} answered {status}")),
            _ => WatchError::Structural(format!("{url} answered {status}")),
        }
    }
}

pub type WatchResult<T> = Result<T, WatchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_map_to_classes() {
        assert_eq!(WatchError::from_status("u", 404).class(), ErrorClass::Fatal);
        assert_eq!(
            WatchError::from_status("u", 503).class(),
            ErrorClass::SessionInvalidating
        );
        assert_eq!(WatchError::from_status("u", 502).class(), ErrorClass::Transient);
        assert_eq!(WatchError::from_status("u", 302).class(), ErrorClass::Structural);
    }

    #[test]
    fn timeout_is_transient() {
        let e = WatchError::Timeout("x".into());
        assert!(e.is_timeout());
        assert_eq!(e.class(), ErrorClass::Transient);
    }
}
