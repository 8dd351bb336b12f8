//! Audio Route Module - Geräteauswahl
//!
//! Dieses Modul verwaltet:
//! - Hardware-Verträge (Audio, Bluetooth)
//! - Den Bluetooth SCO Manager
//! - Den Audio Route Manager
//! - Host-Audio für Desktop-Endpunkte

mod bluetooth;
mod hardware;
mod host;
mod manager;

pub use bluetooth::{BluetoothLinkState, BluetoothScoManager};
pub use hardware::{AudioDevice, AudioHardware, BluetoothHardware, DeviceEvent};
pub use host::{is_headset_name, output_device_names, HostAudioHardware, NoBluetooth};
pub use manager::{AudioRouteManager, AudioRouteState};
