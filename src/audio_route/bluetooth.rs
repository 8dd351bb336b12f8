//! Bluetooth SCO Manager
//!
//! Zustandsmaschine für den Sprach-Link zu einem Bluetooth-Headset:
//! Handshake mit begrenzter Zahl an Versuchen und festem Timeout.
//! Gehört exklusiv dem Audio Route Manager.

use super::hardware::{BluetoothHardware, DeviceEvent};
use crate::config::BluetoothConfig;
use crate::control::{ControlEvent, ControlSender};
use serde::Serialize;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Zustand des Bluetooth-Links
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BluetoothLinkState {
    /// Nicht gestartet bzw. Bluetooth für diese Session nicht nutzbar
    Uninitialized,
    /// Headset-Profil konnte nicht geöffnet werden
    Error,
    HeadsetUnavailable,
    HeadsetAvailable,
    ScoConnecting,
    ScoConnected,
    ScoDisconnecting,
}

// ============================================================================
// SCO TIMER
// ============================================================================

/// Abbrechbarer Timer. Jedes Scharfschalten bekommt ein neues Token, damit
/// ein verspätetes Timeout nie einen späteren Handshake trifft.
#[derive(Default)]
struct ScoTimer {
    handle: Option<JoinHandle<()>>,
    token: u64,
}

impl ScoTimer {
    fn arm(&mut self, after: Duration, control_tx: &ControlSender) {
        self.cancel();
        self.token = self.token.wrapping_add(1);
        let token = self.token;
        let tx = control_tx.clone();

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                self.handle = Some(runtime.spawn(async move {
                    tokio::time::sleep(after).await;
                    let _ = tx.send(ControlEvent::ScoTimeout(token));
                }));
            }
            Err(_) => tracing::warn!("No async runtime, SCO timeout not armed"),
        }
    }

    fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    /// Verbraucht den Timer, wenn `token` der scharfgeschaltete ist
    fn fire(&mut self, token: u64) -> bool {
        if self.handle.is_some() && token == self.token {
            self.handle = None;
            true
        } else {
            false
        }
    }
}

// ============================================================================
// BLUETOOTH SCO MANAGER
// ============================================================================

pub struct BluetoothScoManager {
    hardware: Box<dyn BluetoothHardware>,
    state: BluetoothLinkState,
    sco_attempts: u32,
    max_sco_attempts: u32,
    sco_timeout: Duration,
    /// Profil-Proxy wurde geöffnet
    profile_open: bool,
    /// Profil-Service ist verbunden
    profile_connected: bool,
    connected_device: Option<String>,
    timer: ScoTimer,
    control_tx: ControlSender,
}

impl BluetoothScoManager {
    pub fn new(
        hardware: Box<dyn BluetoothHardware>,
        config: &BluetoothConfig,
        control_tx: ControlSender,
    ) -> Self {
        Self {
            hardware,
            state: BluetoothLinkState::Uninitialized,
            sco_attempts: 0,
            max_sco_attempts: config.max_sco_attempts,
            sco_timeout: config.sco_timeout(),
            profile_open: false,
            profile_connected: false,
            connected_device: None,
            timer: ScoTimer::default(),
            control_tx,
        }
    }

    pub fn state(&self) -> BluetoothLinkState {
        self.state
    }

    pub fn sco_attempts(&self) -> u32 {
        self.sco_attempts
    }

    pub fn connected_device(&self) -> Option<&str> {
        self.connected_device.as_deref()
    }

    /// Bluetooth zählt als verfügbares Gerät
    pub fn is_available(&self) -> bool {
        matches!(
            self.state,
            BluetoothLinkState::HeadsetAvailable
                | BluetoothLinkState::ScoConnecting
                | BluetoothLinkState::ScoConnected
        )
    }

    /// Startet den Manager. Ohne Adapter oder ohne SCO außerhalb von
    /// Telefonaten bleibt er `Uninitialized`.
    pub fn start(&mut self) {
        if self.state != BluetoothLinkState::Uninitialized {
            tracing::warn!("Bluetooth manager already started ({:?})", self.state);
            return;
        }

        self.sco_attempts = 0;
        self.profile_connected = false;
        self.connected_device = None;

        if !self.hardware.has_adapter() {
            tracing::info!("No Bluetooth adapter");
            return;
        }
        if !self.hardware.is_sco_available_off_call() {
            tracing::warn!("Bluetooth SCO not available off call");
            return;
        }
        if !self.hardware.open_headset_profile() {
            tracing::error!("Failed to open Bluetooth headset profile");
            self.state = BluetoothLinkState::Error;
            return;
        }

        self.profile_open = true;
        self.state = BluetoothLinkState::HeadsetUnavailable;
        tracing::debug!("Bluetooth manager started");
    }

    /// Idempotent
    pub fn stop(&mut self) {
        if self.state == BluetoothLinkState::Uninitialized {
            return;
        }

        self.stop_sco_audio();
        self.timer.cancel();
        if self.profile_open {
            self.hardware.close_headset_profile();
            self.profile_open = false;
        }
        self.profile_connected = false;
        self.state = BluetoothLinkState::Uninitialized;
        tracing::debug!("Bluetooth manager stopped");
    }

    pub fn release(&mut self) {
        self.stop();
        self.timer.cancel();
        self.connected_device = None;
    }

    /// Startet den SCO-Handshake
    ///
    /// `false` ohne Hardware-Zugriff, wenn die Versuche aufgebraucht sind
    /// oder kein Headset bereit ist.
    pub fn start_sco_audio(&mut self) -> bool {
        if self.sco_attempts >= self.max_sco_attempts {
            tracing::warn!("Max SCO connection attempts reached");
            return false;
        }
        if self.state != BluetoothLinkState::HeadsetAvailable {
            tracing::warn!("Cannot start SCO in state {:?}", self.state);
            return false;
        }

        self.state = BluetoothLinkState::ScoConnecting;
        self.hardware.start_sco();
        self.sco_attempts += 1;
        self.timer.arm(self.sco_timeout, &self.control_tx);
        tracing::info!("SCO connecting (attempt {})", self.sco_attempts);
        true
    }

    pub fn stop_sco_audio(&mut self) {
        if !matches!(
            self.state,
            BluetoothLinkState::ScoConnecting | BluetoothLinkState::ScoConnected
        ) {
            return;
        }

        self.timer.cancel();
        self.hardware.stop_sco();
        self.state = BluetoothLinkState::ScoDisconnecting;
        tracing::debug!("SCO disconnecting");
    }

    /// Übernimmt das erste verbundene Headset
    pub fn update_device(&mut self) {
        if self.state == BluetoothLinkState::Uninitialized || !self.profile_connected {
            return;
        }

        match self.hardware.connected_headsets().into_iter().next() {
            Some(device) => {
                tracing::debug!("Bluetooth headset available: {}", device);
                self.connected_device = Some(device);
                self.state = BluetoothLinkState::HeadsetAvailable;
            }
            None => {
                self.connected_device = None;
                self.state = BluetoothLinkState::HeadsetUnavailable;
            }
        }
    }

    /// Verarbeitet ein Bluetooth-Ereignis. `true` wenn die Geräteauswahl
    /// neu berechnet werden muss.
    pub fn handle_event(&mut self, event: &DeviceEvent) -> bool {
        if matches!(
            self.state,
            BluetoothLinkState::Uninitialized | BluetoothLinkState::Error
        ) {
            return false;
        }

        match *event {
            DeviceEvent::BluetoothServiceConnected => {
                tracing::debug!("Bluetooth headset profile connected");
                self.profile_connected = true;
                true
            }
            DeviceEvent::BluetoothServiceDisconnected => {
                tracing::debug!("Bluetooth headset profile disconnected");
                self.stop_sco_audio();
                self.profile_connected = false;
                self.connected_device = None;
                self.state = BluetoothLinkState::HeadsetUnavailable;
                true
            }
            DeviceEvent::BluetoothHeadsetConnectionChanged { connected: true } => {
                self.sco_attempts = 0;
                true
            }
            DeviceEvent::BluetoothHeadsetConnectionChanged { connected: false } => {
                self.stop_sco_audio();
                true
            }
            DeviceEvent::BluetoothAudioStateChanged {
                connected: true, ..
            } => {
                self.timer.cancel();
                if self.state == BluetoothLinkState::ScoConnecting {
                    tracing::info!("SCO connected");
                    self.state = BluetoothLinkState::ScoConnected;
                    self.sco_attempts = 0;
                    true
                } else {
                    false
                }
            }
            DeviceEvent::BluetoothAudioStateChanged {
                connected: false,
                sticky,
            } => self.on_audio_disconnected(sticky),
            DeviceEvent::WiredHeadsetPlugged(_) | DeviceEvent::ProximityChanged { .. } => false,
        }
    }

    fn on_audio_disconnected(&mut self, sticky: bool) -> bool {
        if sticky {
            tracing::debug!("Ignoring sticky SCO disconnect");
            return false;
        }

        match self.state {
            BluetoothLinkState::ScoDisconnecting => true,
            BluetoothLinkState::ScoConnected => {
                tracing::info!("SCO link dropped by headset");
                self.stop_sco_audio();
                true
            }
            state => {
                tracing::debug!("Ignoring SCO disconnect in state {:?}", state);
                false
            }
        }
    }

    /// SCO-Timeout. Ein Link bleibt nie über das Timeout hinaus hängen.
    pub fn handle_timeout(&mut self, token: u64) -> bool {
        if !self.timer.fire(token) {
            tracing::trace!("Ignoring stale SCO timeout {}", token);
            return false;
        }
        if self.state != BluetoothLinkState::ScoConnecting || !self.profile_connected {
            return false;
        }

        let connected = self
            .hardware
            .connected_headsets()
            .first()
            .is_some_and(|device| self.hardware.is_audio_connected(device));

        if connected {
            tracing::info!("SCO connected at timeout");
            self.state = BluetoothLinkState::ScoConnected;
            self.sco_attempts = 0;
        } else {
            tracing::warn!("SCO connection timed out");
            self.stop_sco_audio();
        }
        true
    }

    #[cfg(test)]
    pub(crate) fn timer_armed(&self) -> bool {
        self.timer.handle.is_some()
    }
}

impl Drop for BluetoothScoManager {
    fn drop(&mut self) {
        self.timer.cancel();
    }
}

// ============================================================================
// TESTS
// ============================================================================
