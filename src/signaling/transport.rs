//! Transport-Vertrag für das Relay
//!
//! Das Relay ist ein Key-Value-Store mit Realtime-Sync:
//! - `publish` schreibt einen Wert (last-write-wins, fire-and-forget)
//! - `subscribe` liefert jeden folgenden Schreibvorgang auf einen Key
//! - `read_once` liest den aktuellen Wert einmalig

use futures::future::{self, BoxFuture, FutureExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Not connected to relay")]
    NotConnected,

    #[error("Failed to publish to {key}: {reason}")]
    PublishFailed { key: String, reason: String },

    #[error("Failed to subscribe to {0}")]
    SubscribeFailed(String),

    #[error("Failed to read {key}: {reason}")]
    ReadFailed { key: String, reason: String },

    #[error("Relay error: {code} - {message}")]
    Relay { code: i32, message: String },
}

// ============================================================================
// TRANSPORT CONTRACT
// ============================================================================

/// Empfänger für alle Schreibvorgänge auf einen Key (`None` = geleert)
pub type ValueReceiver = mpsc::UnboundedReceiver<Option<String>>;

/// Generischer Pub/Sub Key-Value-Kanal
pub trait SignalingTransport: Send + Sync {
    /// Schreibt `value` unter `key`. `Ok` heißt nur, dass der Schreibvorgang
    /// angenommen wurde; `None` leert den Key.
    fn publish(&self, key: &str, value: Option<String>) -> Result<(), TransportError>;

    /// Abonniert alle künftigen Schreibvorgänge auf `key`
    fn subscribe(&self, key: &str) -> Result<ValueReceiver, TransportError>;

    /// Liest den aktuellen Wert von `key` einmalig
    fn read_once(&self, key: &str) -> BoxFuture<'static, Result<Option<String>, TransportError>>;
}

// ============================================================================
// IN-MEMORY RELAY
// ============================================================================

#[derive(Default)]
struct RelayStore {
    values: HashMap<String, String>,
    subscribers: HashMap<String, Vec<mpsc::UnboundedSender<Option<String>>>>,
    offline: bool,
}

/// Relay im Prozess, für lokale Loopback-Anrufe und Tests
#[derive(Clone, Default)]
pub struct MemoryRelay {
    store: Arc<Mutex<RelayStore>>,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Aktueller Wert eines Keys
    pub fn value(&self, key: &str) -> Option<String> {
        self.store.lock().values.get(key).cloned()
    }

    /// Simuliert einen Verbindungsabbruch: Schreibvorgänge schlagen fehl
    pub fn set_offline(&self, offline: bool) {
        self.store.lock().offline = offline;
    }
}

impl SignalingTransport for MemoryRelay {
    fn publish(&self, key: &str, value: Option<String>) -> Result<(), TransportError> {
        let mut store = self.store.lock();
        if store.offline {
            return Err(TransportError::NotConnected);
        }

        match &value {
            Some(v) => {
                store.values.insert(key.to_string(), v.clone());
            }
            None => {
                store.values.remove(key);
            }
        }

        if let Some(subscribers) = store.subscribers.get_mut(key) {
            subscribers.retain(|tx| tx.send(value.clone()).is_ok());
        }

        tracing::trace!("Relay write on {}", key);
        Ok(())
    }

    fn subscribe(&self, key: &str) -> Result<ValueReceiver, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.store
            .lock()
            .subscribers
            .entry(key.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }

    fn read_once(&self, key: &str) -> BoxFuture<'static, Result<Option<String>, TransportError>> {
        let store = self.store.lock();
        let result = if store.offline {
            Err(TransportError::NotConnected)
        } else {
            Ok(store.values.get(key).cloned())
        };
        future::ready(result).boxed()
    }
}

// ============================================================================
// TESTS
// ============================================================================
