//! Host-Audio für Desktop-Endpunkte
//!
//! Ersatz für die Audioschicht eines Telefons: `cpal` liefert die
//! Ausgabegeräte, ein Kopfhörer-Ausgang zählt als Kabel-Headset. Einen
//! Hörer gibt es nicht, Bluetooth-SCO ebenso wenig.

use super::hardware::{AudioHardware, BluetoothHardware};
use cpal::traits::{DeviceTrait, HostTrait};

/// Namensbestandteile, die auf Kopfhörer hinweisen
const HEADSET_HINTS: &[&str] = &["headset", "headphone", "earphone", "kopfhörer"];

/// Erkennt Kopfhörer-Ausgänge am Gerätenamen
pub fn is_headset_name(name: &str) -> bool {
    let name = name.to_lowercase();
    HEADSET_HINTS.iter().any(|hint| name.contains(hint))
}

/// Namen aller Ausgabegeräte des Standard-Hosts
pub fn output_device_names() -> Vec<String> {
    let host = cpal::default_host();
    match host.output_devices() {
        Ok(devices) => devices.filter_map(|d| d.name().ok()).collect(),
        Err(e) => {
            tracing::warn!("Failed to enumerate output devices: {}", e);
            Vec::new()
        }
    }
}

// ============================================================================
// HOST AUDIO HARDWARE
// ============================================================================

#[derive(Debug, Default)]
pub struct HostAudioHardware {
    speakerphone_on: bool,
    microphone_mute: bool,
    communication_mode: bool,
    has_focus: bool,
}

impl HostAudioHardware {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AudioHardware for HostAudioHardware {
    fn has_earpiece(&self) -> bool {
        false
    }

    fn has_wired_headset(&self) -> bool {
        output_device_names().iter().any(|name| is_headset_name(name))
    }

    fn is_speakerphone_on(&self) -> bool {
        self.speakerphone_on
    }

    fn set_speakerphone_on(&mut self, on: bool) {
        tracing::debug!("Speaker output: {}", on);
        self.speakerphone_on = on;
    }

    fn is_microphone_mute(&self) -> bool {
        self.microphone_mute
    }

    fn set_microphone_mute(&mut self, mute: bool) {
        self.microphone_mute = mute;
    }

    fn set_communication_mode(&mut self, enabled: bool) {
        self.communication_mode = enabled;
    }

    fn request_audio_focus(&mut self) -> bool {
        self.has_focus = true;
        true
    }

    fn abandon_audio_focus(&mut self) {
        self.has_focus = false;
    }
}

// ============================================================================
// NO BLUETOOTH
// ============================================================================

/// Plattform ohne Bluetooth-Headset-Profil
#[derive(Debug, Default, Clone, Copy)]
pub struct NoBluetooth;

impl BluetoothHardware for NoBluetooth {
    fn has_adapter(&self) -> bool {
        false
    }

    fn is_sco_available_off_call(&self) -> bool {
        false
    }

    fn open_headset_profile(&mut self) -> bool {
        false
    }

    fn close_headset_profile(&mut self) {}

    fn connected_headsets(&self) -> Vec<String> {
        Vec::new()
    }

    fn is_audio_connected(&self, _device: &str) -> bool {
        false
    }

    fn start_sco(&mut self) {}

    fn stop_sco(&mut self) {}
}

// ============================================================================
// TESTS
// ============================================================================
