use async_trait::async_trait;
use reqwest::{Client, Url};
use tracing::info;

use super::{build_client, get_html, html, site_root};
use crate::config::HttpSettings;
use crate::error::{WatchError, WatchResult};
use crate::watcher::search::{SearchFetcher, SearchResult};

/// Scrapes the marketplace's own search result pages.
pub struct HtmlSearchFetcher {
    client: Client,
    /// `{domain}` is substituted; empty means `https://www.{domain}/s`.
    template: String,
}

impl HtmlSearchFetcher {
    pub fn new(http: &HttpSettings) -> WatchResult<Self> {
        Ok(Self {
            client: build_client(http, None)?,
            template: http.search_url_template.clone(),
        })
    }

    pub fn search_url(&self, domain: &str, term: &str) -> WatchResult<Url> {
        let base = if self.template.is_empty() {
            format!("{}s", site_root(domain))
        } else {
            self.template.replace("{domain}", domain)
        };
        Url::parse_with_params(&base, &[("k", term)])
            .map_err(|e| WatchError::Config(format!("search url {base}: {e}")))
    }
}

#[async_trait]
impl SearchFetcher for HtmlSearchFetcher {
    async fn search(&self, domain: &str, term: &str) -> WatchResult<Vec<SearchResult>> {
        let url = self.search_url(domain, term)?;
        let body = get_html(&self.client, url.as_str()).await?;
        if html::has_captcha(&body) {
            return Err(WatchError::Captcha(url.to_string()));
        }
        Ok(html::search_results(&body, &site_root(domain)))
    }

    async fn refresh_session(&self, domain: &str) -> WatchResult<()> {
        get_html(&self.client, &site_root(domain)).await?;
        info!(id = domain, "search session refreshed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_urls_encode_the_term() {
        let f = HtmlSearchFetcher::new(&HttpSettings::default()).unwrap();
        let url = f.search_url("amazon.it", "rtx 3070").unwrap();
        assert_eq!(url.as_str(), "https://www.amazon.it/s?k=rtx+3070");
    }
}
