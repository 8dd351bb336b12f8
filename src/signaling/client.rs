//! WebSocket Client für den Relay-Server
//!
//! Spricht ein kleines JSON-Protokoll mit einem Key-Value-Relay:
//! - `publish` / `subscribe` / `read` vom Client
//! - `value` / `read_result` / `error` / `pong` vom Server
//!
//! Der Client implementiert [`SignalingTransport`], die Orchestrierung
//! sieht nur den Vertrag.

use super::transport::{SignalingTransport, TransportError, ValueReceiver};
use futures::future::{BoxFuture, FutureExt};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;

/// Maximale Wartezeit auf ein `read_result`
const READ_TIMEOUT_SECS: u64 = 10;

/// Intervall für Heartbeats (Idle-Timeouts am Relay vermeiden)
const HEARTBEAT_INTERVAL_SECS: u64 = 25;

// ============================================================================
// WIRE FRAMES
// ============================================================================

/// Client → Server
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientFrame {
    Publish {
        key: String,
        value: Option<String>,
    },
    Subscribe {
        key: String,
    },
    Read {
        key: String,
        #[serde(rename = "requestId")]
        request_id: u64,
    },
    Ping,
}

/// Server → Client
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServerFrame {
    /// Schreibvorgang auf einen abonnierten Key
    Value { key: String, value: Option<String> },

    /// Antwort auf `read`
    ReadResult {
        #[serde(rename = "requestId")]
        request_id: u64,
        value: Option<String>,
    },

    /// Fehler (optional einer Leseanfrage zugeordnet)
    Error {
        code: i32,
        message: String,
        #[serde(rename = "requestId", default)]
        request_id: Option<u64>,
    },

    Pong,
}

// ============================================================================
// CLIENT STATE
// ============================================================================

#[derive(Default)]
struct RelayState {
    is_connected: bool,
    subscribers: HashMap<String, Vec<mpsc::UnboundedSender<Option<String>>>>,
    pending_reads: HashMap<u64, oneshot::Sender<Result<Option<String>, TransportError>>>,
    next_request_id: u64,
}

// ============================================================================
// WEBSOCKET RELAY
// ============================================================================

/// Relay-Transport über eine WebSocket-Verbindung
pub struct WebSocketRelay {
    server_url: String,
    state: Arc<Mutex<RelayState>>,
    tx: mpsc::Sender<String>,
}

impl WebSocketRelay {
    /// Baut die Verbindung auf und startet Read-, Write- und Heartbeat-Task
    pub async fn connect(server_url: &str) -> Result<Arc<Self>, TransportError> {
        let ws_url = Self::websocket_url(server_url)?;

        tracing::info!("Connecting to relay: {}", ws_url);

        let (ws_stream, _) = connect_async(ws_url.as_str())
            .await
            .map_err(|_| TransportError::NotConnected)?;

        let (mut write, mut read) = ws_stream.split();
        let (tx, mut rx) = mpsc::channel::<String>(100);

        let state = Arc::new(Mutex::new(RelayState {
            is_connected: true,
            ..Default::default()
        }));

        // Read-Task
        let state_clone = Arc::clone(&state);
        tokio::spawn(async move {
            while let Some(msg_result) = read.next().await {
                match msg_result {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ServerFrame>(&text) {
                        Ok(frame) => Self::handle_server_frame(frame, &state_clone),
                        Err(e) => tracing::warn!("Dropping unreadable relay frame: {}", e),
                    },
                    Ok(Message::Close(_)) => {
                        tracing::info!("Relay closed the connection");
                        break;
                    }
                    Err(e) => {
                        tracing::error!("Relay WebSocket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }

            Self::mark_disconnected(&state_clone);
        });

        // Write-Task
        let state_clone = Arc::clone(&state);
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if let Err(e) = write.send(Message::Text(frame)).await {
                    tracing::error!("Failed to send relay frame: {}", e);
                    break;
                }
            }
            Self::mark_disconnected(&state_clone);
        });

        let relay = Arc::new(Self {
            server_url: server_url.to_string(),
            state,
            tx,
        });
        Self::start_heartbeat(&relay);

        Ok(relay)
    }

    /// Prüft ob verbunden
    pub fn is_connected(&self) -> bool {
        self.state.lock().is_connected
    }

    /// Leitet die WebSocket-URL aus der konfigurierten Relay-URL ab
    fn websocket_url(server_url: &str) -> Result<Url, TransportError> {
        let mut url = Url::parse(server_url).map_err(|e| TransportError::Relay {
            code: 0,
            message: format!("invalid relay url {}: {}", server_url, e),
        })?;

        let scheme = match url.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            other => {
                return Err(TransportError::Relay {
                    code: 0,
                    message: format!("unsupported relay scheme: {}", other),
                })
            }
        };
        url.set_scheme(scheme).map_err(|_| TransportError::Relay {
            code: 0,
            message: format!("cannot switch {} to {}", server_url, scheme),
        })?;

        Ok(url)
    }

    fn send_frame(&self, frame: &ClientFrame) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }

        let text = serde_json::to_string(frame).map_err(|e| TransportError::Relay {
            code: 0,
            message: e.to_string(),
        })?;

        // try_send ist non-blocking
        self.tx.try_send(text).map_err(|e| TransportError::PublishFailed {
            key: frame_key(frame),
            reason: e.to_string(),
        })
    }

    /// Verarbeitet eingehende Server-Frames
    fn handle_server_frame(frame: ServerFrame, state: &Arc<Mutex<RelayState>>) {
        match frame {
            ServerFrame::Value { key, value } => {
                let mut s = state.lock();
                if let Some(subscribers) = s.subscribers.get_mut(&key) {
                    subscribers.retain(|tx| tx.send(value.clone()).is_ok());
                }
            }

            ServerFrame::ReadResult { request_id, value } => {
                if let Some(reply) = state.lock().pending_reads.remove(&request_id) {
                    let _ = reply.send(Ok(value));
                }
            }

            ServerFrame::Error {
                code,
                message,
                request_id,
            } => {
                tracing::error!("Relay error {}: {}", code, message);
                let pending = request_id.and_then(|id| state.lock().pending_reads.remove(&id));
                if let Some(reply) = pending {
                    let _ = reply.send(Err(TransportError::Relay { code, message }));
                }
            }

            ServerFrame::Pong => {
                // Heartbeat-Response - nichts zu tun
            }
        }
    }

    fn mark_disconnected(state: &Arc<Mutex<RelayState>>) {
        let mut s = state.lock();
        if !s.is_connected {
            return;
        }
        s.is_connected = false;
        // Abonnenten sehen einen geschlossenen Kanal
        s.subscribers.clear();
        for (_, reply) in s.pending_reads.drain() {
            let _ = reply.send(Err(TransportError::NotConnected));
        }
        tracing::info!("Relay disconnected");
    }

    /// Startet einen Heartbeat-Task
    fn start_heartbeat(relay: &Arc<Self>) {
        let relay = Arc::downgrade(relay);
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(tokio::time::Duration::from_secs(HEARTBEAT_INTERVAL_SECS));
            loop {
                interval.tick().await;
                let Some(client) = relay.upgrade() else {
                    break;
                };
                if !client.is_connected() {
                    tracing::info!("Heartbeat: relay disconnected, stopping heartbeat task");
                    break;
                }
                if let Err(e) = client.send_frame(&ClientFrame::Ping) {
                    tracing::warn!("Failed to send heartbeat: {}", e);
                }
            }
        });
    }
}

fn frame_key(frame: &ClientFrame) -> String {
    match frame {
        ClientFrame::Publish { key, .. }
        | ClientFrame::Subscribe { key }
        | ClientFrame::Read { key, .. } => key.clone(),
        ClientFrame::Ping => String::new(),
    }
}

impl SignalingTransport for WebSocketRelay {
    fn publish(&self, key: &str, value: Option<String>) -> Result<(), TransportError> {
        self.send_frame(&ClientFrame::Publish {
            key: key.to_string(),
            value,
        })
    }

    fn subscribe(&self, key: &str) -> Result<ValueReceiver, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let first = {
            let mut s = self.state.lock();
            if !s.is_connected {
                return Err(TransportError::NotConnected);
            }
            let subscribers = s.subscribers.entry(key.to_string()).or_default();
            subscribers.push(tx);
            subscribers.len() == 1
        };

        if first {
            self.send_frame(&ClientFrame::Subscribe {
                key: key.to_string(),
            })
            .map_err(|_| TransportError::SubscribeFailed(key.to_string()))?;
        }
        Ok(rx)
    }

    fn read_once(&self, key: &str) -> BoxFuture<'static, Result<Option<String>, TransportError>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let request_id = {
            let mut s = self.state.lock();
            s.next_request_id += 1;
            let id = s.next_request_id;
            s.pending_reads.insert(id, reply_tx);
            id
        };

        let sent = self.send_frame(&ClientFrame::Read {
            key: key.to_string(),
            request_id,
        });
        let state = Arc::clone(&self.state);
        let key = key.to_string();

        async move {
            if let Err(e) = sent {
                state.lock().pending_reads.remove(&request_id);
                return Err(e);
            }

            match tokio::time::timeout(
                tokio::time::Duration::from_secs(READ_TIMEOUT_SECS),
                reply_rx,
            )
            .await
            {
                Ok(Ok(result)) => result,
                Ok(Err(_)) => Err(TransportError::NotConnected),
                Err(_) => {
                    state.lock().pending_reads.remove(&request_id);
                    Err(TransportError::ReadFailed {
                        key,
                        reason: "Timeout".to_string(),
                    })
                }
            }
        }
        .boxed()
    }
}

impl std::fmt::Debug for WebSocketRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketRelay")
            .field("server_url", &self.server_url)
            .field("is_connected", &self.is_connected())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
