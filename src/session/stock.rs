//! Stock lists served as a JSON array.

use async_trait::async_trait;
use reqwest::Client;

use crate::config::HttpSettings;
use crate::error::{WatchError, WatchResult};
use crate::session::build_client;
use crate::watcher::partalert::{StockEntry, StockFeed};

pub struct HttpStockFeed {
    client: Client,
}

impl HttpStockFeed {
    pub fn new(http: &HttpSettings) -> WatchResult<Self> {
        Ok(Self {
            client: build_client(http, None)?,
        })
    }
}

#[async_trait]
impl StockFeed for HttpStockFeed {
    async fn stock(&self, url: &str) -> WatchResult<Vec<StockEntry>> {
        let rsp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| WatchError::from_http(url, &e))?;
        let status = rsp.status();
        if !status.is_success() {
            return Err(WatchError::from_status(url, status.as_u16()));
        }
        rsp.json()
            .await
            .map_err(|e| WatchError::Structural(format!("{url}: stock list unreadable: {e}")))
    }
}
