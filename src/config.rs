//! Konfiguration
//!
//! Wird als `config.json` aus dem Plattform-Konfigurationsverzeichnis
//! gelesen. Fehlende Felder bekommen ihre Standardwerte, Umgebungsvariablen
//! überschreiben die Datei.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Standard-Relay für lokale Tests
pub const DEFAULT_RELAY_URL: &str = "ws://127.0.0.1:8787";

/// Standard Logging-Direktive
pub const DEFAULT_LOG_FILTER: &str = "relaycall=debug,webrtc=warn";

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid config value: {0}")]
    Invalid(String),
}

// ============================================================================
// CONFIG SECTIONS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub relay_url: String,
    pub ice_servers: Vec<IceServerConfig>,
    pub signaling: SignalingConfig,
    pub audio: AudioConfig,
    pub bluetooth: BluetoothConfig,
    pub log_filter: Option<String>,
}

/// STUN / TURN Server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub credential: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalingConfig {
    /// Anrufanfragen älter als das gelten als alte Mailbox-Werte
    pub stale_event_secs: u64,
    /// Eingehende Anrufe ohne Accept annehmen
    pub auto_accept: bool,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            stale_event_secs: 60,
            auto_accept: false,
        }
    }
}

/// Lautsprecher-Voreinstellung
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpeakerphoneMode {
    /// Lautsprecher als Standard, Proximity-Regel aktiv
    #[default]
    Auto,
    #[serde(alias = "true")]
    On,
    #[serde(alias = "false")]
    Off,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub speakerphone: SpeakerphoneMode,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BluetoothConfig {
    pub sco_timeout_ms: u64,
    pub max_sco_attempts: u32,
}

impl BluetoothConfig {
    pub fn sco_timeout(&self) -> Duration {
        Duration::from_millis(self.sco_timeout_ms)
    }
}

impl Default for BluetoothConfig {
    fn default() -> Self {
        Self {
            sco_timeout_ms: 4000,
            max_sco_attempts: 2,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            relay_url: DEFAULT_RELAY_URL.to_string(),
            ice_servers: vec![IceServerConfig {
                urls: vec![
                    "stun:stun.l.google.com:19302".to_string(),
                    "stun:stun1.l.google.com:19302".to_string(),
                ],
                username: String::new(),
                credential: String::new(),
            }],
            signaling: SignalingConfig::default(),
            audio: AudioConfig::default(),
            bluetooth: BluetoothConfig::default(),
            log_filter: None,
        }
    }
}

// ============================================================================
// LOADING
// ============================================================================

impl Config {
    /// Lädt die Konfiguration aus dem Plattform-Verzeichnis
    ///
    /// Fehlt die Datei, gelten die Standardwerte.
    pub fn load() -> Result<Self, ConfigError> {
        let config = match Self::config_path() {
            Some(path) if path.exists() => Self::from_file(&path)?,
            _ => Self::default(),
        };
        config.with_env_overrides().validated()
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        tracing::debug!("Loading config from {}", path.display());
        Self::from_json_str(&content)
    }

    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_json::from_str(json)?;
        config.validated()
    }

    /// Pfad zu `config.json`
    pub fn config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("io", "relaycall", "relaycall")
            .map(|dirs| dirs.config_dir().join("config.json"))
    }

    /// Logging-Direktive aus Config oder Standard
    pub fn log_filter(&self) -> &str {
        self.log_filter.as_deref().unwrap_or(DEFAULT_LOG_FILTER)
    }

    fn with_env_overrides(mut self) -> Self {
        if let Ok(url) = std::env::var("RELAY_URL") {
            if !url.trim().is_empty() {
                self.relay_url = url;
            }
        }
        self
    }

    fn validated(self) -> Result<Self, ConfigError> {
        if self.relay_url.trim().is_empty() {
            return Err(ConfigError::Invalid("relay_url is empty".to_string()));
        }
        if self.bluetooth.sco_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "bluetooth.sco_timeout_ms must be positive".to_string(),
            ));
        }
        if self.ice_servers.iter().any(|s| s.urls.is_empty()) {
            return Err(ConfigError::Invalid(
                "ice server without urls".to_string(),
            ));
        }
        Ok(self)
    }
}

// ============================================================================
// TESTS
// ============================================================================
