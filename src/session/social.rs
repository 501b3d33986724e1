//! Filtered post stream over HTTP (newline-delimited JSON) and the
//! redirect-following resolver for shortened links.

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use reqwest::{redirect, Client};
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::HttpSettings;
use crate::error::{WatchError, WatchResult};
use crate::watcher::social::{LinkResolver, Post, StreamData, StreamSource};

#[derive(Debug, Deserialize)]
struct Envelope {
    data: Option<PostData>,
    #[serde(default)]
    includes: Includes,
    errors: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct PostData {
    text: String,
    #[serde(default)]
    author_id: String,
}

#[derive(Debug, Default, Deserialize)]
struct Includes {
    #[serde(default)]
    users: Vec<User>,
}

#[derive(Debug, Deserialize)]
struct User {
    id: String,
    username: String,
}

/// One line of the stream. Blank lines are keep-alives; an error payload
/// means the stream must be reopened.
pub fn parse_line(line: &str) -> WatchResult<Option<StreamData>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(Some(StreamData::KeepAlive));
    }
    let envelope: Envelope = serde_json::from_str(line)
        .map_err(|e| WatchError::Structural(format!("post stream line: {e}")))?;
    if let Some(errors) = envelope.errors {
        return Err(WatchError::Transient(format!("post stream reported {errors}")));
    }
    let Some(data) = envelope.data else {
        debug!("post stream line without data");
        return Ok(None);
    };
    let author = envelope
        .includes
        .users
        .into_iter()
        .find(|u| u.id == data.author_id)
        .map(|u| u.username)
        .unwrap_or(data.author_id);
    Ok(Some(StreamData::Post(Post {
        author,
        text: data.text,
    })))
}

struct Connection {
    body: BoxStream<'static, reqwest::Result<Vec<u8>>>,
    buf: Vec<u8>,
}

impl Connection {
    fn take_line(&mut self) -> Option<String> {
        let pos = self.buf.iter().position(|b| *b == b'\n')?;
        let raw: Vec<u8> = self.buf.drain(..pos + 1).collect();
        Some(String::from_utf8_lossy(&raw).into_owned())
    }
}

pub struct HttpPostStream {
    endpoint: String,
    bearer_token: Option<String>,
    client: Client,
    conn: Mutex<Option<Connection>>,
}

impl HttpPostStream {
    pub fn new(endpoint: impl Into<String>, bearer_token: Option<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            bearer_token,
            client: Client::new(),
            conn: Mutex::new(None),
        }
    }
}

#[async_trait]
impl StreamSource for HttpPostStream {
    async fn connect(&self) -> WatchResult<()> {
        let mut req = self.client.get(&self.endpoint);
        if let Some(token) = &self.bearer_token {
            req = req.bearer_auth(token);
        }
        let rsp = req
            .send()
            .await
            .map_err(|e| WatchError::from_http(&self.endpoint, &e))?;
        let status = rsp.status();
        if status.as_u16() == 429 {
            return Err(WatchError::Transient(format!(
                "{} refuses more connections for now",
                self.endpoint
            )));
        }
        if !status.is_success() {
            return Err(WatchError::from_status(&self.endpoint, status.as_u16()));
        }
        let body = rsp.bytes_stream().map(|chunk| chunk.map(|b| b.to_vec())).boxed();
        *self.conn.lock().await = Some(Connection {
            body,
            buf: Vec::new(),
        });
        info!(endpoint = %self.endpoint, "post stream connected");
        Ok(())
    }

    async fn next(&self) -> WatchResult<Option<StreamData>> {
        let mut guard = self.conn.lock().await;
        let Some(conn) = guard.as_mut() else {
            return Ok(None);
        };
        loop {
            while let Some(line) = conn.take_line() {
                match parse_line(&line) {
                    Ok(Some(data)) => return Ok(Some(data)),
                    Ok(None) => {}
                    Err(e @ WatchError::Transient(_)) => {
                        *guard = None;
                        return Err(e);
                    }
                    Err(e) => warn!(error = %e, "unreadable post skipped"),
                }
            }
            match conn.body.next().await {
                Some(Ok(chunk)) => conn.buf.extend_from_slice(&chunk),
                Some(Err(e)) => {
                    *guard = None;
                    return Err(WatchError::Transient(format!("post stream: {e}")));
                }
                None => {
                    *guard = None;
                    return Ok(None);
                }
            }
        }
    }

    async fn close(&self) -> WatchResult<()> {
        match self.conn.lock().await.take() {
            Some(_) => Ok(()),
            None => Err(WatchError::Closed),
        }
    }
}

/// Follows exactly one redirect hop without fetching the target.
pub struct HttpLinkResolver {
    client: Client,
}

impl HttpLinkResolver {
    pub fn new(http: &HttpSettings) -> WatchResult<Self> {
        let client = Client::builder()
            .redirect(redirect::Policy::none())
            .user_agent(http.user_agent.clone())
            .timeout(std::time::Duration::from_secs(http.timeout_secs))
            .build()
            .map_err(|e| WatchError::Config(format!("http client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl LinkResolver for HttpLinkResolver {
    async fn resolve(&self, link: &str) -> WatchResult<String> {
        let rsp = self
            .client
            .get(link)
            .send()
            .await
            .map_err(|e| WatchError::from_http(link, &e))?;
        if !rsp.status().is_redirection() {
            return Ok(link.to_string());
        }
        let target = rsp
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        Ok(target.unwrap_or_else(|| link.to_string()))
    }
}
