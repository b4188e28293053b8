//! Persistent ChatHub socket session.
//!
//! `ChatHub::open` connects, performs the protocol handshake, and waits for
//! the acknowledgement (an empty structured frame) before declaring the
//! session ready. A spawned heartbeat task keeps the socket alive; a reader
//! task parses record-delimited frames into a channel. `close` aborts both
//! tasks before closing the socket, so no path can leave a dangling
//! heartbeat or a detached listener behind.

use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use crate::protocol::{is_handshake_ack, split_records, HANDSHAKE_FRAME, PING_FRAME};
use crate::{Result, SydneyError};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Default hub endpoint.
pub const DEFAULT_HUB_URL: &str = "wss://sydney.bing.com/sydney/ChatHub";

/// Derive the hub URL from an optional reverse-proxy host.
pub fn hub_url(reverse_proxy_host: Option<&str>) -> String {
    match reverse_proxy_host {
        Some(host) => {
            let ws_host = host
                .replace("https://", "wss://")
                .replace("http://", "ws://");
            format!("{}/sydney/ChatHub", ws_host.trim_end_matches('/'))
        }
        None => DEFAULT_HUB_URL.to_string(),
    }
}

/// How to open a hub session.
#[derive(Debug, Clone)]
pub struct ChatHubConfig {
    pub url: String,
    /// Extra request headers for the upgrade (cookie, forwarded-for, ...).
    pub headers: Vec<(String, String)>,
    /// Keep-alive period (the service expects ~15s).
    pub heartbeat_interval: Duration,
    /// Bound on connect + handshake acknowledgement.
    pub handshake_timeout: Duration,
}

impl Default for ChatHubConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_HUB_URL.to_string(),
            headers: Vec::new(),
            heartbeat_interval: Duration::from_secs(15),
            handshake_timeout: Duration::from_secs(15),
        }
    }
}

/// An open, acknowledged hub session, exclusively owned by one in-flight
/// turn and never reused.
pub struct ChatHub {
    writer: Arc<Mutex<SplitSink<WsStream, WsMessage>>>,
    frames: mpsc::Receiver<serde_json::Value>,
    heartbeat: JoinHandle<()>,
    reader: JoinHandle<()>,
}

impl ChatHub {
    /// Connect, handshake, and start the heartbeat + reader tasks.
    pub async fn open(config: &ChatHubConfig) -> Result<Self> {
        let mut request = config
            .url
            .clone()
            .into_client_request()
            .map_err(|e| SydneyError::Handshake(e.to_string()))?;
        for (name, value) in &config.headers {
            let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) else {
                warn!(header = %name, "skipping malformed upgrade header");
                continue;
            };
            request.headers_mut().insert(name, value);
        }

        let mut stream = tokio::time::timeout(config.handshake_timeout, connect_async(request))
            .await
            .map_err(|_| SydneyError::Handshake("connect timed out".into()))?
            .map_err(|e| SydneyError::Handshake(e.to_string()))?
            .0;

        debug!(url = %config.url, "performing hub handshake");
        stream
            .send(WsMessage::Text(HANDSHAKE_FRAME.into()))
            .await
            .map_err(|e| SydneyError::Handshake(e.to_string()))?;
        tokio::time::timeout(config.handshake_timeout, wait_for_ack(&mut stream))
            .await
            .map_err(|_| SydneyError::Handshake("no handshake acknowledgement".into()))??;

        let (write, read) = stream.split();
        let writer = Arc::new(Mutex::new(write));

        let (frame_tx, frames) = mpsc::channel(64);
        let reader = tokio::spawn(reader_task(read, frame_tx));
        let heartbeat = tokio::spawn(heartbeat_task(
            Arc::clone(&writer),
            config.heartbeat_interval,
        ));

        Ok(Self {
            writer,
            frames,
            heartbeat,
            reader,
        })
    }

    /// Send one outbound frame.
    pub async fn send(&self, frame: &serde_json::Value) -> Result<()> {
        let json = serde_json::to_string(frame).map_err(|e| SydneyError::Network(e.to_string()))?;
        self.writer
            .lock()
            .await
            .send(WsMessage::Text(json.into()))
            .await
            .map_err(|e| SydneyError::Network(e.to_string()))
    }

    /// Next parsed inbound frame; `None` once the transport is gone.
    pub async fn recv(&mut self) -> Option<serde_json::Value> {
        self.frames.recv().await
    }

    /// Inbound frame channel, for callers racing frame arrival against
    /// other triggers (see `exchange::drive`).
    pub fn frames_mut(&mut self) -> &mut mpsc::Receiver<serde_json::Value> {
        &mut self.frames
    }

    /// Tear the session down: heartbeat cancelled and reader detached
    /// first, then the socket closed. Safe to call on every exit path.
    pub async fn close(&mut self) {
        self.heartbeat.abort();
        self.reader.abort();
        self.frames.close();
        let _ = self.writer.lock().await.send(WsMessage::Close(None)).await;
        debug!("hub session closed");
    }
}

impl Drop for ChatHub {
    fn drop(&mut self) {
        self.heartbeat.abort();
        self.reader.abort();
    }
}

async fn wait_for_ack(stream: &mut WsStream) -> Result<()> {
    while let Some(message) = stream.next().await {
        match message {
            Ok(WsMessage::Text(text)) => {
                if split_records(&text).iter().any(is_handshake_ack) {
                    debug!("hub handshake acknowledged");
                    return Ok(());
                }
            }
            Ok(WsMessage::Close(_)) => {
                return Err(SydneyError::Handshake(
                    "closed before acknowledgement".into(),
                ))
            }
            Err(e) => return Err(SydneyError::Handshake(e.to_string())),
            _ => {}
        }
    }
    Err(SydneyError::Handshake(
        "connection ended before acknowledgement".into(),
    ))
}

async fn reader_task(mut read: SplitStream<WsStream>, frames: mpsc::Sender<serde_json::Value>) {
    while let Some(message) = read.next().await {
        match message {
            Ok(WsMessage::Text(text)) => {
                for frame in split_records(&text) {
                    if frames.send(frame).await.is_err() {
                        return;
                    }
                }
            }
            Ok(WsMessage::Close(_)) => break,
            Err(e) => {
                warn!(error = %e, "hub socket error");
                break;
            }
            _ => {}
        }
    }
}

async fn heartbeat_task<S>(writer: Arc<Mutex<S>>, interval: Duration)
where
    S: futures_util::Sink<WsMessage> + Unpin,
{
    let mut ticker = tokio::time::interval(interval);
    // The first tick fires immediately; the service wants a fixed cadence.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let mut writer = writer.lock().await;
        if writer.send(WsMessage::Text(PING_FRAME.into())).await.is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::RECORD_SEPARATOR;
    use tokio::net::TcpListener;

    fn ack_record() -> String {
        format!("{{}}{RECORD_SEPARATOR}")
    }

    async fn bind() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/sydney/ChatHub", listener.local_addr().unwrap());
        (listener, url)
    }

    fn config(url: String, heartbeat: Duration) -> ChatHubConfig {
        ChatHubConfig {
            url,
            headers: vec![("x-forwarded-for".into(), "104.28.215.7".into())],
            heartbeat_interval: heartbeat,
            handshake_timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn hub_url_swaps_scheme_for_reverse_proxy() {
        assert_eq!(hub_url(None), DEFAULT_HUB_URL);
        assert_eq!(
            hub_url(Some("https://proxy.example.com/")),
            "wss://proxy.example.com/sydney/ChatHub"
        );
        assert_eq!(
            hub_url(Some("http://127.0.0.1:8080")),
            "ws://127.0.0.1:8080/sydney/ChatHub"
        );
    }

    #[tokio::test]
    async fn open_handshakes_then_forwards_frames() {
        let (listener, url) = bind().await;
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(socket).await.unwrap();

            let first = ws.next().await.unwrap().unwrap();
            assert_eq!(first.to_text().unwrap(), HANDSHAKE_FRAME);
            ws.send(WsMessage::Text(ack_record().into())).await.unwrap();

            let frame = format!("{{\"type\":1,\"arguments\":[]}}{RECORD_SEPARATOR}");
            ws.send(WsMessage::Text(frame.into())).await.unwrap();
            // Keep the connection open until the client closes.
            while let Some(Ok(msg)) = ws.next().await {
                if msg.is_close() {
                    break;
                }
            }
        });

        let mut hub = ChatHub::open(&config(url, Duration::from_secs(30)))
            .await
            .unwrap();
        let frame = hub.recv().await.unwrap();
        assert_eq!(frame["type"], 1);
        hub.close().await;
        server.await.unwrap();
    }

    #[tokio::test]
    async fn heartbeat_frames_arrive_and_stop_after_close() {
        let (listener, url) = bind().await;
        let (seen_tx, mut seen) = mpsc::channel::<String>(16);
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(socket).await.unwrap();
            let _handshake = ws.next().await.unwrap().unwrap();
            ws.send(WsMessage::Text(ack_record().into())).await.unwrap();
            while let Some(Ok(msg)) = ws.next().await {
                if msg.is_close() {
                    break;
                }
                if let Ok(text) = msg.to_text() {
                    let _ = seen_tx.send(text.to_string()).await;
                }
            }
        });

        let mut hub = ChatHub::open(&config(url, Duration::from_millis(50)))
            .await
            .unwrap();
        let ping = tokio::time::timeout(Duration::from_secs(2), seen.recv())
            .await
            .expect("expected a heartbeat")
            .unwrap();
        assert_eq!(ping, PING_FRAME);

        hub.close().await;
        server.await.unwrap();
        // The server loop has ended on Close; drain anything buffered and
        // verify the stream is finished, i.e. no dangling heartbeat timer.
        while let Some(frame) = seen.recv().await {
            assert_eq!(frame, PING_FRAME);
        }
    }

    #[tokio::test]
    async fn close_before_ack_fails_the_open() {
        let (listener, url) = bind().await;
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(socket).await.unwrap();
            let _handshake = ws.next().await;
            ws.close(None).await.unwrap();
        });

        let Err(err) = ChatHub::open(&config(url, Duration::from_secs(30))).await else {
            panic!("open succeeded despite the early close");
        };
        assert!(matches!(err, SydneyError::Handshake(_)));
    }

    #[tokio::test]
    async fn outbound_frames_reach_the_server() {
        let (listener, url) = bind().await;
        let (seen_tx, mut seen) = mpsc::channel::<String>(4);
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(socket).await.unwrap();
            let _handshake = ws.next().await.unwrap().unwrap();
            ws.send(WsMessage::Text(ack_record().into())).await.unwrap();
            while let Some(Ok(msg)) = ws.next().await {
                if msg.is_close() {
                    break;
                }
                let _ = seen_tx.send(msg.to_text().unwrap().to_string()).await;
            }
        });

        let mut hub = ChatHub::open(&config(url, Duration::from_secs(30)))
            .await
            .unwrap();
        hub.send(&serde_json::json!({ "type": 4, "target": "chat" }))
            .await
            .unwrap();
        let sent = tokio::time::timeout(Duration::from_secs(2), seen.recv())
            .await
            .unwrap()
            .unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&sent).unwrap();
        assert_eq!(parsed["target"], "chat");
        hub.close().await;
    }
}
