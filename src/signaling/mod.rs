//! Signaling Module - Relay-Codec und Transport
//!
//! Dieses Modul verwaltet die Kommunikation über das Relay:
//! - Signaling-Nachrichten kodieren und dekodieren
//! - Transport-Vertrag (publish / subscribe / read_once)
//! - WebSocket-Relay und In-Memory-Relay
//! - Login und Online-Status
//!

mod client;
mod messages;
mod presence;
mod transport;

pub use client::WebSocketRelay;
pub use messages::*;
pub use presence::{log_off, login, set_status, status_of, LoginError};
pub use transport::{MemoryRelay, SignalingTransport, TransportError, ValueReceiver};
