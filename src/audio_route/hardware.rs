//! Hardware-Verträge für Audio und Bluetooth
//!
//! Die Traits kapseln die Plattform-Audioschicht. Fehlende Hardware wird
//! als `false` bzw. leere Liste gemeldet, nie als Fehler.

use serde::{Deserialize, Serialize};

/// Physisches Audiogerät eines Anrufs
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum AudioDevice {
    SpeakerPhone,
    WiredHeadset,
    Earpiece,
    Bluetooth,
    None,
}

/// Asynchrone Hardware-Benachrichtigungen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceEvent {
    /// Kabel-Headset ein- oder ausgesteckt
    WiredHeadsetPlugged(bool),
    /// Annäherungssensor
    ProximityChanged { near: bool },
    /// Headset-Profil des Bluetooth-Stacks verbunden
    BluetoothServiceConnected,
    BluetoothServiceDisconnected,
    /// Verbindungszustand eines Bluetooth-Headsets
    BluetoothHeadsetConnectionChanged { connected: bool },
    /// SCO-Audio-Link auf- oder abgebaut. `sticky` markiert eine alte
    /// Meldung, die beim Registrieren erneut zugestellt wird.
    BluetoothAudioStateChanged { connected: bool, sticky: bool },
}

/// Plattform-Audioschicht
pub trait AudioHardware: Send {
    /// Gerät hat Telefonie-Hardware (Hörer)
    fn has_earpiece(&self) -> bool;

    fn has_wired_headset(&self) -> bool;

    fn is_speakerphone_on(&self) -> bool;

    fn set_speakerphone_on(&mut self, on: bool);

    fn is_microphone_mute(&self) -> bool;

    fn set_microphone_mute(&mut self, mute: bool);

    /// Kommunikationsmodus (VoIP) an oder aus
    fn set_communication_mode(&mut self, enabled: bool);

    /// `true` wenn der Audio-Fokus gewährt wurde
    fn request_audio_focus(&mut self) -> bool;

    fn abandon_audio_focus(&mut self);
}

/// Bluetooth-Headset-Schicht
pub trait BluetoothHardware: Send {
    /// Ein Bluetooth-Adapter ist vorhanden und eingeschaltet
    fn has_adapter(&self) -> bool;

    /// SCO-Audio ist außerhalb eines Telefonanrufs nutzbar
    fn is_sco_available_off_call(&self) -> bool;

    /// Öffnet das Headset-Profil; `false` bei Fehler
    fn open_headset_profile(&mut self) -> bool;

    fn close_headset_profile(&mut self);

    /// Verbundene Headsets
    fn connected_headsets(&self) -> Vec<String>;

    /// SCO-Audio ist zu `device` verbunden
    fn is_audio_connected(&self, device: &str) -> bool;

    fn start_sco(&mut self);

    fn stop_sco(&mut self);
}
