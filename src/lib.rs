//! Relaycall - Zwei-Parteien-Anrufe über ein Key-Value-Relay
//!
//! Ein Endpunkt besteht aus:
//! - Signaling über ein Relay (eine Mailbox pro Identität)
//! - WebRTC für Audio und Video
//! - Audio Route Manager mit Bluetooth-SCO-Steuerung
//!
//! Alle Zustandsänderungen laufen über eine einzige Control-Schleife,
//! siehe [`endpoint`].

pub mod audio_route;
pub mod call_engine;
pub mod config;
pub mod control;
pub mod endpoint;
pub mod signaling;

#[cfg(test)]
mod testing;

pub use config::Config;
pub use control::{CallEvent, CallIntent, EndReason};
pub use endpoint::{Endpoint, EndpointError, EndpointHandle, EndpointSnapshot};

use tracing_subscriber::EnvFilter;

/// Initialisiert das Logging
///
/// `RUST_LOG` hat Vorrang vor `filter`. Ein zweiter Aufruf ist wirkungslos.
pub fn init_logging(filter: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(filter))
        .unwrap_or_else(|_| EnvFilter::new(config::DEFAULT_LOG_FILTER));

    let _ = tracing_subscriber::fmt().with_env_filter(env_filter).try_init();
}
