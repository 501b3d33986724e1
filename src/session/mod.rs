//! HTTP reference implementations of the page/session collaborators.
//!
//! Plain `reqwest` sessions with their own cookie jar. They cover polling,
//! searching, relaying, post streams, stock lists and availability checks;
//! the click-driven claim flow needs a scripted browser and reports
//! `Unsupported` here.

pub mod html;
pub mod pages;
pub mod relay;
pub mod search;
pub mod social;
pub mod stock;

use reqwest::{Client, Proxy};
use std::time::Duration;

use crate::config::HttpSettings;
use crate::error::{WatchError, WatchResult};

pub use pages::{HttpPageFetcher, HttpPageFetcherFactory, HttpProductSession, HttpSessionFactory};
pub use relay::SseRemoteFeed;
pub use search::HtmlSearchFetcher;
pub use social::{HttpLinkResolver, HttpPostStream};
pub use stock::HttpStockFeed;

/// Marketplace root for a tld (`it`, `co.uk`) or a bare domain (`amazon.it`).
pub fn site_root(tld_or_domain: &str) -> String {
    if tld_or_domain.contains("amazon.") {
        format!("https://www.{tld_or_domain}/")
    } else {
        format!("https://www.amazon.{tld_or_domain}/")
    }
}

/// One client per session: each keeps its own cookies.
pub fn build_client(http: &HttpSettings, proxy: Option<&str>) -> WatchResult<Client> {
    let mut builder = Client::builder()
        .cookie_store(true)
        .user_agent(http.user_agent.clone())
        .timeout(Duration::from_secs(http.timeout_secs));
    if let Some(p) = proxy {
        let proxy = Proxy::all(p).map_err(|e| WatchError::Config(format!("proxy {p}: {e}")))?;
        builder = builder.proxy(proxy);
    }
    builder
        .build()
        .map_err(|e| WatchError::Config(format!("http client: {e}")))
}

/// GET returning the body, with status codes mapped onto the error taxonomy.
pub(crate) async fn get_html(client: &Client, url: &str) -> WatchResult<String> {
    let rsp = client
        .get(url)
        .send()
        .await
        .map_err(|e| WatchError::from_http(url, &e))?;
    let status = rsp.status();
    if !status.is_success() {
        return Err(WatchError::from_status(url, status.as_u16()));
    }
    rsp.text().await.map_err(|e| WatchError::from_http(url, &e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roots() {
        assert_eq!(site_root("co.uk"), "https://www.amazon.co.uk/");
        assert_eq!(site_root("amazon.de"), "https://www.amazon.de/");
    }
}
