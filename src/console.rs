//! Operator console: `pause`, `resume`, or a pasted product link.

use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{info, warn};

use crate::identity::{extract_product_id, is_product_url};
use crate::model::{now_ms, FoundItem};
use crate::pauser::Pauser;
use crate::purchase::PurchaseCoordinator;

pub const CONSOLE_ORIGIN: &str = "console";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Pause,
    Resume,
    Purchase(String),
    Unknown(String),
}

impl ConsoleCommand {
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        if is_product_url(line) {
            return Some(ConsoleCommand::Purchase(line.to_string()));
        }
        Some(match line.to_ascii_lowercase().as_str() {
            "pause" => ConsoleCommand::Pause,
            "resume" => ConsoleCommand::Resume,
            _ => ConsoleCommand::Unknown(line.to_string()),
        })
    }
}

/// The synthetic item a pasted link becomes.
pub fn console_item(url: &str) -> FoundItem {
    let id = extract_product_id(url).unwrap_or_default();
    FoundItem {
        time: now_ms(),
        url: url.to_string(),
        title: format!("<console link {id}>"),
        price: String::new(),
        parsed_price: None,
        origin: CONSOLE_ORIGIN.to_string(),
        valid: true,
        price_limit: None,
    }
}

/// Reads commands until the input closes. Purchases run in their own task.
pub async fn run_console<R>(input: R, pauser: Arc<Pauser>, coordinator: Option<Arc<PurchaseCoordinator>>)
where
    R: AsyncBufRead + Unpin,
{
    let hint = if coordinator.is_some() {
        "paste a product link to attempt a purchase, or "
    } else {
        ""
    };
    info!("console ready: {hint}write 'pause' / 'resume' to change all pollers");

    let mut lines = input.lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "console input failed");
                break;
            }
        };
        match ConsoleCommand::parse(&line) {
            None => {}
            Some(ConsoleCommand::Pause) => pauser.pause(),
            Some(ConsoleCommand::Resume) => pauser.resume(),
            Some(ConsoleCommand::Purchase(url)) => match &coordinator {
                Some(c) => {
                    let item = console_item(&url);
                    info!(url = %item.url, "product link pasted, attempting purchase");
                    let c = c.clone();
                    tokio::spawn(async move {
                        c.attempt_purchase(&item).await;
                    });
                }
                None => info!("no purchase strategies in this bundle, ignoring link"),
            },
            Some(ConsoleCommand::Unknown(cmd)) => warn!(%cmd, "unknown console command"),
        }
    }
    info!("console input closed");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_are_case_insensitive() {
        assert_eq!(ConsoleCommand::parse(" PAUSE "), Some(ConsoleCommand::Pause));
        assert_eq!(ConsoleCommand::parse("Resume"), Some(ConsoleCommand::Resume));
        assert_eq!(ConsoleCommand::parse(""), None);
        assert_eq!(
            ConsoleCommand::parse("mute"),
            Some(ConsoleCommand::Unknown("mute".into()))
        );
    }

    #[test]
    fn pasted_links_become_console_items() {
        let url = "https://www.amazon.it/_itm/dp/B08KHFZN9P";
        assert_eq!(
            ConsoleCommand::parse(url),
            Some(ConsoleCommand::Purchase(url.into()))
        );
        let item = console_item(url);
        assert_eq!(item.title, "<console link B08KHFZN9P>");
        assert_eq!(item.origin, "console");
    }

    #[tokio::test]
    async fn pause_and_resume_from_input() {
        let pauser = Arc::new(Pauser::new());
        run_console(&b"pause\n"[..], pauser.clone(), None).await;
        assert!(pauser.is_paused());
        run_console(&b"resume\n"[..], pauser.clone(), None).await;
        assert!(!pauser.is_paused());
    }
}
