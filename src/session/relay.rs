//! Reads the `/events` stream of another running instance.

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use reqwest::Client;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{WatchError, WatchResult};
use crate::model::{FoundItem, Heartbeat};
use crate::watcher::remote::{RemoteEvent, RemoteFeed};

/// One `event:`/`data:` frame of a server-sent event stream.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SseFrame {
    pub event: String,
    pub data: String,
}

/// Parses one frame (the text between two blank lines). Comment-only
/// frames, such as keep-alives, yield `None`.
pub fn parse_frame(raw: &str) -> Option<SseFrame> {
    let mut frame = SseFrame::default();
    let mut data_lines = Vec::new();
    for line in raw.lines() {
        if line.starts_with(':') {
            continue;
        }
        let (field, value) = line.split_once(':').unwrap_or((line, ""));
        let value = value.strip_prefix(' ').unwrap_or(value);
        match field {
            "event" => frame.event = value.to_string(),
            "data" => data_lines.push(value),
            _ => {}
        }
    }
    if data_lines.is_empty() {
        return None;
    }
    frame.data = data_lines.join("\n");
    Some(frame)
}

pub fn frame_to_event(frame: &SseFrame) -> WatchResult<Option<RemoteEvent>> {
    let malformed = |e: serde_json::Error| WatchError::Structural(format!("relay {}: {e}", frame.event));
    match frame.event.as_str() {
        "heartbeat" => serde_json::from_str::<Heartbeat>(&frame.data)
            .map(|hb| Some(RemoteEvent::Heartbeat(hb)))
            .map_err(malformed),
        "item_found" => serde_json::from_str::<FoundItem>(&frame.data)
            .map(|item| Some(RemoteEvent::ItemFound(item)))
            .map_err(malformed),
        _ => Ok(None),
    }
}

struct Connection {
    body: BoxStream<'static, reqwest::Result<Vec<u8>>>,
    buf: Vec<u8>,
}

impl Connection {
    /// Splits the next complete frame off the buffer.
    fn take_frame(&mut self) -> Option<String> {
        let pos = self.buf.windows(2).position(|w| w == b"\n\n")?;
        let raw: Vec<u8> = self.buf.drain(..pos + 2).collect();
        Some(String::from_utf8_lossy(&raw).replace("\r\n", "\n"))
    }
}

pub struct SseRemoteFeed {
    address: String,
    client: Client,
    conn: Mutex<Option<Connection>>,
}

impl SseRemoteFeed {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            client: Client::new(),
            conn: Mutex::new(None),
        }
    }

    fn events_url(&self) -> String {
        format!("{}/events", self.address.trim_end_matches('/'))
    }
}

#[async_trait]
impl RemoteFeed for SseRemoteFeed {
    async fn connect(&self) -> WatchResult<()> {
        let url = self.events_url();
        let rsp = self
            .client
            .get(&url)
            .header("accept", "text/event-stream")
            .send()
            .await
            .map_err(|e| WatchError::from_http(&url, &e))?;
        if !rsp.status().is_success() {
            return Err(WatchError::from_status(&url, rsp.status().as_u16()));
        }
        let body = rsp.bytes_stream().map(|chunk| chunk.map(|b| b.to_vec())).boxed();
        *self.conn.lock().await = Some(Connection {
            body,
            buf: Vec::new(),
        });
        info!(%url, "relay stream connected");
        Ok(())
    }

    /// Bytes are buffered before any frame is parsed, so dropping this
    /// future between chunks loses nothing.
    async fn next_event(&self) -> WatchResult<Option<RemoteEvent>> {
        let mut guard = self.conn.lock().await;
        let Some(conn) = guard.as_mut() else {
            return Ok(None);
        };
        loop {
            while let Some(raw) = conn.take_frame() {
                let Some(frame) = parse_frame(&raw) else {
                    continue;
                };
                match frame_to_event(&frame) {
                    Ok(Some(event)) => return Ok(Some(event)),
                    Ok(None) => debug!(event = %frame.event, "ignoring relay event"),
                    Err(e) => warn!(error = %e, "malformed relay event skipped"),
                }
            }
            match conn.body.next().await {
                Some(Ok(chunk)) => conn.buf.extend_from_slice(&chunk),
                Some(Err(e)) => {
                    *guard = None;
                    return Err(WatchError::Transient(format!("relay stream: {e}")));
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_and_keepalives() {
        assert_eq!(parse_frame(":\n"), None);
        let f = parse_frame("event: heartbeat\ndata: {\"a\":1}\n").unwrap();
        assert_eq!(f.event, "heartbeat");
        assert_eq!(f.data, "{\"a\":1}");
    }

    #[test]
    fn heartbeat_frames_become_events() {
        let hb = Heartbeat::stream("relay");
        let frame = SseFrame {
            event: "heartbeat".into(),
            data: serde_json::to_string(&hb).unwrap(),
        };
        assert_eq!(
            frame_to_event(&frame).unwrap(),
            Some(RemoteEvent::Heartbeat(hb))
        );
        let other = SseFrame {
            event: "purchase".into(),
            data: "{}".into(),
        };
        assert_eq!(frame_to_event(&other).unwrap(), None);
    }

    #[test]
    fn buffered_bytes_split_into_frames() {
        let mut conn = Connection {
            body: futures::stream::empty().boxed(),
            buf: b"event: heartbeat\ndata: 1\n\n: keep\n\nevent: x".to_vec(),
        };
        assert_eq!(conn.take_frame().unwrap(), "event: heartbeat\ndata: 1\n\n");
        assert_eq!(conn.take_frame().unwrap(), ": keep\n\n");
        assert_eq!(conn.take_frame(), None);
    }
}
