use anyhow::Result;
use async_trait::async_trait;
use futures_util::StreamExt;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::comment::{map_push_payload, Comment};
use crate::config::ConfigStore;

pub const DEFAULT_PUSH_URL: &str = "ws://localhost:11180/sub";

/// Fixed reconnect interval. No exponential growth: this is a single
/// long-lived session against a local aggregator, not a high-fan-out client.
const RECONNECT_DELAY: Duration = Duration::from_secs(3);

/// Lifecycle of the push connection, published through a watch channel so the
/// reconnect logic is observable without a real socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Open,
    Closing,
    ReconnectScheduled,
}

/// One inbound payload-bearing frame.
#[derive(Debug, Clone)]
pub enum SocketFrame {
    Text(String),
    Binary(Vec<u8>),
}

/// An established socket connection.
#[async_trait]
pub trait SocketStream: Send {
    /// Next payload frame. `None` means the peer closed the connection.
    async fn next_frame(&mut self) -> Option<Result<SocketFrame>>;

    async fn close(&mut self);
}

/// Capability to open socket connections. Injected so the transport's
/// reconnect behavior is testable with scripted connections.
#[async_trait]
pub trait SocketConnector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Box<dyn SocketStream>>;
}

// ========================================================================
// tokio-tungstenite backed implementation
// ========================================================================

pub struct TungsteniteConnector;

struct TungsteniteStream {
    inner: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl SocketConnector for TungsteniteConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn SocketStream>> {
        let (stream, _) = connect_async(url).await?;
        Ok(Box::new(TungsteniteStream { inner: stream }))
    }
}

#[async_trait]
impl SocketStream for TungsteniteStream {
    async fn next_frame(&mut self) -> Option<Result<SocketFrame>> {
        loop {
            match self.inner.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(SocketFrame::Text(text))),
                Ok(Message::Binary(bytes)) => {
                    return Some(Ok(SocketFrame::Binary(bytes.to_vec())))
                }
                Ok(Message::Close(_)) => return None,
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => continue,
                Err(error) => return Some(Err(error.into())),
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.inner.close(None).await;
    }
}

// ========================================================================
// Push transport
// ========================================================================

/// Persistent-connection comment feed. One run task owns the socket, the
/// per-connection dedup set, and the connection state; normalized comment
/// batches are emitted over the flume channel.
pub struct PushTransport {
    connector: Arc<dyn SocketConnector>,
    store: ConfigStore,
    comments_tx: flume::Sender<Vec<Comment>>,
    reconnect_delay: Duration,
}

impl PushTransport {
    pub fn new(
        connector: Arc<dyn SocketConnector>,
        store: ConfigStore,
        comments_tx: flume::Sender<Vec<Comment>>,
    ) -> Self {
        Self {
            connector,
            store,
            comments_tx,
            reconnect_delay: RECONNECT_DELAY,
        }
    }

    #[cfg(test)]
    fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Spawn the connection run task. `fallback_url` is consulted when the
    /// store holds no socket URL at (re)connect time.
    pub fn start(self, fallback_url: String) -> PushHandle {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(run_connection(
            self.connector,
            self.store,
            self.comments_tx,
            fallback_url,
            self.reconnect_delay,
            state_tx,
            shutdown_rx,
        ));

        PushHandle {
            state_rx,
            shutdown_tx,
            task,
        }
    }
}

/// Handle to a running push session. Dropping it without `stop()` aborts
/// nothing; call `stop()` to tear the connection down.
pub struct PushHandle {
    state_rx: watch::Receiver<ConnectionState>,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl PushHandle {
    pub fn connection_state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Cancel any pending reconnect, close the socket if open, and wait for
    /// the run task to finish.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.task.await;
    }
}

async fn run_connection(
    connector: Arc<dyn SocketConnector>,
    store: ConfigStore,
    comments_tx: flume::Sender<Vec<Comment>>,
    fallback_url: String,
    reconnect_delay: Duration,
    state_tx: watch::Sender<ConnectionState>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut processed_ids: HashSet<String> = HashSet::new();
    // The dedup window resets at session start and after every connection
    // that reached OPEN, never between failed attempts.
    let mut fresh_window = true;

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let _ = state_tx.send(ConnectionState::Connecting);
        if fresh_window {
            processed_ids.clear();
            fresh_window = false;
        }

        let url = resolve_push_url(&store, &fallback_url).await;
        match connector.connect(&url).await {
            Ok(mut stream) => {
                let _ = state_tx.send(ConnectionState::Open);
                fresh_window = true;
                tracing::info!("Push comment feed connected: {}", url);

                loop {
                    tokio::select! {
                        _ = shutdown_rx.changed() => {
                            let _ = state_tx.send(ConnectionState::Closing);
                            stream.close().await;
                            let _ = state_tx.send(ConnectionState::Disconnected);
                            return;
                        }
                        frame = stream.next_frame() => match frame {
                            Some(Ok(frame)) => {
                                handle_frame(frame, &mut processed_ids, &comments_tx);
                            }
                            Some(Err(error)) => {
                                tracing::warn!("Push feed socket error: {}", error);
                                break;
                            }
                            None => {
                                tracing::info!("Push feed connection closed");
                                break;
                            }
                        }
                    }
                }
            }
            Err(error) => {
                tracing::warn!("Failed to connect push feed at {}: {}", url, error);
            }
        }

        let _ = state_tx.send(ConnectionState::ReconnectScheduled);
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            _ = tokio::time::sleep(reconnect_delay) => {}
        }
    }

    let _ = state_tx.send(ConnectionState::Disconnected);
}

/// URL resolution order: current configured value (read fresh, not captured
/// at start) → fallback passed to `start` → fixed default endpoint.
async fn resolve_push_url(store: &ConfigStore, fallback_url: &str) -> String {
    let configured = store.config().await.socket_url;
    let configured = configured.trim();
    if !configured.is_empty() {
        return configured.to_string();
    }

    let fallback = fallback_url.trim();
    if !fallback.is_empty() {
        return fallback.to_string();
    }

    DEFAULT_PUSH_URL.to_string()
}

fn handle_frame(
    frame: SocketFrame,
    processed_ids: &mut HashSet<String>,
    comments_tx: &flume::Sender<Vec<Comment>>,
) {
    let text = match frame {
        SocketFrame::Text(text) => text,
        SocketFrame::Binary(bytes) => match String::from_utf8(bytes) {
            Ok(text) => text,
            Err(_) => return,
        },
    };

    let payload: serde_json::Value = match serde_json::from_str(&text) {
        Ok(value) => value,
        Err(error) => {
            tracing::warn!("Malformed push frame: {}", error);
            return;
        }
    };

    let comments = map_push_payload(&payload, Some(processed_ids));
    if comments.is_empty() {
        return;
    }

    if comments_tx.send(comments).is_err() {
        tracing::debug!("Comment channel closed; dropping batch");
    }
}
