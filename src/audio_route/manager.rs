//! Audio Route Manager
//!
//! Entscheidet, welches physische Gerät den Anruf trägt, und hält das
//! Geräte-Inventar über asynchrone Hardware-Ereignisse hinweg korrekt.
//! Nach jedem Ereignis läuft [`AudioRouteManager::recompute`]; ohne neue
//! Eingaben ändert ein weiterer Lauf weder Hardware noch Abonnenten.

use super::bluetooth::{BluetoothLinkState, BluetoothScoManager};
use super::hardware::{AudioDevice, AudioHardware, BluetoothHardware, DeviceEvent};
use crate::config::{AudioConfig, BluetoothConfig, SpeakerphoneMode};
use crate::control::{CallEvent, ControlSender, RouteIntent};
use crate::signaling::MediaKind;
use serde::Serialize;
use std::collections::BTreeSet;
use tokio::sync::broadcast;

/// Geräteauswahl zu einem Zeitpunkt
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AudioRouteState {
    pub available: BTreeSet<AudioDevice>,
    pub selected: AudioDevice,
    pub user_preferred: AudioDevice,
    pub default_device: AudioDevice,
}

/// Zustand vor dem Start, wird beim Stop wiederhergestellt
#[derive(Debug, Clone, Copy)]
struct SavedAudioState {
    speakerphone_on: bool,
    microphone_mute: bool,
}

pub struct AudioRouteManager {
    hardware: Box<dyn AudioHardware>,
    bluetooth: BluetoothScoManager,
    speakerphone: SpeakerphoneMode,
    /// Standardgerät außerhalb eines Audio-Anrufs
    configured_default: AudioDevice,
    running: bool,
    state: AudioRouteState,
    has_wired_headset: bool,
    /// Letzter Wert des Annäherungssensors
    proximity_near: Option<bool>,
    user_selected_this_session: bool,
    /// Verbundener Anruf
    active_call: Option<MediaKind>,
    saved: Option<SavedAudioState>,
    focus_granted: bool,
    events: broadcast::Sender<CallEvent>,
}

impl AudioRouteManager {
    pub fn new(
        hardware: Box<dyn AudioHardware>,
        bluetooth: Box<dyn BluetoothHardware>,
        audio: &AudioConfig,
        bluetooth_config: &BluetoothConfig,
        control_tx: ControlSender,
        events: broadcast::Sender<CallEvent>,
    ) -> Self {
        let default_device = match audio.speakerphone {
            SpeakerphoneMode::Off if hardware.has_earpiece() => AudioDevice::Earpiece,
            _ => AudioDevice::SpeakerPhone,
        };

        Self {
            hardware,
            bluetooth: BluetoothScoManager::new(bluetooth, bluetooth_config, control_tx),
            speakerphone: audio.speakerphone,
            configured_default: default_device,
            running: false,
            state: AudioRouteState {
                available: BTreeSet::new(),
                selected: AudioDevice::None,
                user_preferred: AudioDevice::None,
                default_device,
            },
            has_wired_headset: false,
            proximity_near: None,
            user_selected_this_session: false,
            active_call: None,
            saved: None,
            focus_granted: false,
            events,
        }
    }

    pub fn state(&self) -> &AudioRouteState {
        &self.state
    }

    pub fn bluetooth_state(&self) -> BluetoothLinkState {
        self.bluetooth.state()
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn active_call(&self) -> Option<MediaKind> {
        self.active_call
    }

    // ========================================================================
    // LIFECYCLE
    // ========================================================================

    pub fn start(&mut self) {
        if self.running {
            tracing::warn!("Audio route manager already running");
            return;
        }
        self.running = true;

        self.saved = Some(SavedAudioState {
            speakerphone_on: self.hardware.is_speakerphone_on(),
            microphone_mute: self.hardware.is_microphone_mute(),
        });

        self.focus_granted = self.hardware.request_audio_focus();
        if !self.focus_granted {
            tracing::warn!("Audio focus request failed");
        }
        self.hardware.set_communication_mode(true);
        self.hardware.set_microphone_mute(false);

        self.state.available.clear();
        self.state.selected = AudioDevice::None;
        self.state.user_preferred = AudioDevice::None;
        self.state.default_device = self.configured_default;
        self.user_selected_this_session = false;
        self.proximity_near = None;
        self.has_wired_headset = self.hardware.has_wired_headset();

        self.bluetooth.start();
        tracing::info!("Audio route manager started");
        self.recompute();
    }

    /// Idempotent
    pub fn stop(&mut self) {
        if !self.running {
            tracing::debug!("Audio route manager not running");
            return;
        }
        self.running = false;
        self.active_call = None;
        self.state.default_device = self.configured_default;

        self.bluetooth.stop();

        if let Some(saved) = self.saved.take() {
            self.hardware.set_speakerphone_on(saved.speakerphone_on);
            self.hardware.set_microphone_mute(saved.microphone_mute);
        }
        self.hardware.set_communication_mode(false);
        if self.focus_granted {
            self.hardware.abandon_audio_focus();
            self.focus_granted = false;
        }
        tracing::info!("Audio route manager stopped");
    }

    pub fn release(&mut self) {
        self.stop();
        self.bluetooth.release();
        self.state.available.clear();
        self.state.selected = AudioDevice::None;
    }

    /// Hinweise des Orchestrators
    pub fn handle_route_intent(&mut self, intent: RouteIntent) {
        match intent {
            RouteIntent::CallStarted => self.start(),
            RouteIntent::CallConnected(kind) => self.on_call_connected(kind),
            RouteIntent::CallEnded => self.stop(),
        }
    }

    /// Reine Audio-Anrufe laufen standardmäßig über den Hörer, nur für
    /// diese Session
    pub fn on_call_connected(&mut self, kind: MediaKind) {
        if !self.running {
            tracing::warn!("Call connected without audio session");
            return;
        }
        self.active_call = Some(kind);
        if kind == MediaKind::Audio && self.speakerphone != SpeakerphoneMode::On {
            if let Some(device) = self.valid_default(AudioDevice::Earpiece) {
                self.state.default_device = device;
                self.recompute();
            }
        }
    }

    // ========================================================================
    // COMMANDS
    // ========================================================================

    /// Setzt das Standardgerät, auch für folgende Anrufe
    pub fn set_default_audio_device(&mut self, device: AudioDevice) {
        let Some(device) = self.valid_default(device) else {
            return;
        };

        self.configured_default = device;
        self.state.default_device = device;
        tracing::debug!("Default audio device: {:?}", device);
        self.recompute();
    }

    /// Nur SpeakerPhone und Earpiece sind gültige Standardgeräte
    fn valid_default(&self, device: AudioDevice) -> Option<AudioDevice> {
        match device {
            AudioDevice::SpeakerPhone => Some(device),
            AudioDevice::Earpiece if self.hardware.has_earpiece() => Some(device),
            AudioDevice::Earpiece => Some(AudioDevice::SpeakerPhone),
            other => {
                tracing::warn!("Invalid default audio device: {:?}", other);
                None
            }
        }
    }

    pub fn select_audio_device(&mut self, device: AudioDevice) {
        if !self.state.available.contains(&device) {
            tracing::warn!("Audio device not available: {:?}", device);
            return;
        }

        self.state.user_preferred = device;
        self.user_selected_this_session = true;
        tracing::info!("User selected {:?}", device);
        self.recompute();
    }

    // ========================================================================
    // HARDWARE EVENTS
    // ========================================================================

    pub fn handle_device_event(&mut self, event: DeviceEvent) {
        match event {
            DeviceEvent::WiredHeadsetPlugged(plugged) => {
                tracing::debug!("Wired headset plugged: {}", plugged);
                self.has_wired_headset = plugged;
                self.recompute();
            }
            DeviceEvent::ProximityChanged { near } => {
                self.proximity_near = Some(near);
                self.recompute();
            }
            bluetooth_event => {
                if self.bluetooth.handle_event(&bluetooth_event) {
                    self.recompute();
                }
            }
        }
    }

    pub fn handle_sco_timeout(&mut self, token: u64) {
        if self.bluetooth.handle_timeout(token) {
            self.recompute();
        }
    }

    // ========================================================================
    // RECOMPUTE
    // ========================================================================

    /// Berechnet verfügbare Geräte und Auswahl neu
    pub fn recompute(&mut self) {
        if !self.running {
            return;
        }

        // Verfügbare Geräte aus Hardware-Fakten
        if matches!(
            self.bluetooth.state(),
            BluetoothLinkState::HeadsetAvailable
                | BluetoothLinkState::HeadsetUnavailable
                | BluetoothLinkState::ScoDisconnecting
        ) {
            self.bluetooth.update_device();
        }
        let mut available = self.current_devices();

        // Nutzerwunsch abgleichen
        let mut preferred = self.state.user_preferred;
        if self.has_wired_headset && preferred == AudioDevice::SpeakerPhone {
            preferred = AudioDevice::WiredHeadset;
        } else if !self.has_wired_headset && preferred == AudioDevice::WiredHeadset {
            preferred = AudioDevice::SpeakerPhone;
        }
        if preferred != AudioDevice::None && !available.contains(&preferred) {
            preferred = AudioDevice::None;
        }

        // Bluetooth-Link
        let wants_bluetooth = matches!(preferred, AudioDevice::None | AudioDevice::Bluetooth);
        let link = self.bluetooth.state();
        let should_stop = !wants_bluetooth
            && matches!(
                link,
                BluetoothLinkState::ScoConnected | BluetoothLinkState::ScoConnecting
            );
        let should_start = wants_bluetooth && link == BluetoothLinkState::HeadsetAvailable;

        if should_stop {
            self.bluetooth.stop_sco_audio();
            self.bluetooth.update_device();
        } else if should_start && !self.bluetooth.start_sco_audio() {
            available.remove(&AudioDevice::Bluetooth);
            if preferred == AudioDevice::Bluetooth {
                preferred = AudioDevice::None;
            }
        }
        self.state.user_preferred = preferred;

        let selected = self.select_device(&available);
        let changed = available != self.state.available || selected != self.state.selected;
        if !changed {
            return;
        }

        let speaker_on = selected == AudioDevice::SpeakerPhone;
        if self.hardware.is_speakerphone_on() != speaker_on {
            self.hardware.set_speakerphone_on(speaker_on);
        }

        tracing::info!("Audio route: {:?} of {:?}", selected, available);
        self.state.available = available.clone();
        self.state.selected = selected;
        let _ = self.events.send(CallEvent::AudioRouteChanged {
            selected,
            available,
        });
    }

    fn current_devices(&self) -> BTreeSet<AudioDevice> {
        let mut devices = BTreeSet::new();
        if self.bluetooth.is_available() {
            devices.insert(AudioDevice::Bluetooth);
        }
        if self.has_wired_headset {
            devices.insert(AudioDevice::WiredHeadset);
        } else {
            devices.insert(AudioDevice::SpeakerPhone);
            if self.hardware.has_earpiece() {
                devices.insert(AudioDevice::Earpiece);
            }
        }
        devices
    }

    fn select_device(&self, available: &BTreeSet<AudioDevice>) -> AudioDevice {
        let preferred = self.state.user_preferred;

        let device = if self.bluetooth.state() == BluetoothLinkState::ScoConnected
            && available.contains(&AudioDevice::Bluetooth)
        {
            AudioDevice::Bluetooth
        } else if self.has_wired_headset {
            AudioDevice::WiredHeadset
        } else if matches!(preferred, AudioDevice::SpeakerPhone | AudioDevice::Earpiece) {
            preferred
        } else {
            self.default_with_proximity(available)
        };

        if available.contains(&device) {
            device
        } else if available.contains(&AudioDevice::SpeakerPhone) {
            AudioDevice::SpeakerPhone
        } else {
            available.iter().next().copied().unwrap_or(AudioDevice::None)
        }
    }

    /// Näherungsregel: nur Hörer und Lautsprecher vorhanden, keine
    /// Nutzerauswahl in dieser Session
    fn default_with_proximity(&self, available: &BTreeSet<AudioDevice>) -> AudioDevice {
        let only_builtin = available.len() == 2
            && available.contains(&AudioDevice::Earpiece)
            && available.contains(&AudioDevice::SpeakerPhone);

        match self.proximity_near {
            Some(near)
                if self.speakerphone == SpeakerphoneMode::Auto
                    && only_builtin
                    && !self.user_selected_this_session
                    && self.state.user_preferred == AudioDevice::None =>
            {
                if near {
                    AudioDevice::Earpiece
                } else {
                    AudioDevice::SpeakerPhone
                }
            }
            _ => self.state.default_device,
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
