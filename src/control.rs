//! Control-Events
//!
//! Alle Zustandsänderungen laufen über einen einzigen Kanal: Hardware-
//! Callbacks, Relay-Werte, Media-Completions und Timer werden als
//! [`ControlEvent`] eingereiht und von einer Task nacheinander verarbeitet.

use crate::audio_route::{AudioDevice, DeviceEvent};
use crate::call_engine::{MediaEvent, OrchestratorError};
use crate::endpoint::EndpointSnapshot;
use crate::signaling::MediaKind;
use std::collections::BTreeSet;
use tokio::sync::{mpsc, oneshot};

/// Sender in die Control-Schleife
pub type ControlSender = mpsc::UnboundedSender<ControlEvent>;

/// Empfänger der Control-Schleife
pub type ControlReceiver = mpsc::UnboundedReceiver<ControlEvent>;

/// Antwortkanal für Intents
pub type IntentReply = oneshot::Sender<Result<(), OrchestratorError>>;

/// Erstellt den Control-Kanal
pub fn control_channel() -> (ControlSender, ControlReceiver) {
    mpsc::unbounded_channel()
}

// ============================================================================
// CONTROL EVENTS
// ============================================================================

#[derive(Debug)]
pub enum ControlEvent {
    /// Absicht von UI / Session-Steuerung
    Intent {
        intent: CallIntent,
        reply: Option<IntentReply>,
    },

    /// Neuer Wert in der eigenen Mailbox (`None` = geleert)
    Relay(Option<String>),

    /// Completion oder Callback der Media Engine
    Media(MediaEvent),

    /// Hardware-Ereignis
    Device(DeviceEvent),

    /// Hinweis des Orchestrators an den Audio Route Manager
    Route(RouteIntent),

    /// SCO-Handshake Timeout (Token des scharfgeschalteten Timers)
    ScoTimeout(u64),

    /// Zustandsabfrage
    Snapshot(oneshot::Sender<EndpointSnapshot>),

    Shutdown,
}

/// Absichten der UI
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallIntent {
    PlaceCall { target: String, kind: MediaKind },
    Accept,
    Reject,
    HangUp,
    SetMuted(bool),
    SetVideoEnabled(bool),
    SelectAudioDevice(AudioDevice),
    SetDefaultAudioDevice(AudioDevice),
}

/// Was der Orchestrator dem Audio Route Manager mitteilt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteIntent {
    CallStarted,
    CallConnected(MediaKind),
    CallEnded,
}

// ============================================================================
// CORE EVENTS
// ============================================================================

/// Grund für das Ende eines Anrufs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    LocalHangUp,
    RemoteHangUp,
    Rejected,
    NegotiationFailed,
    ConnectionFailed,
    Shutdown,
}

/// Events für UI- und Service-Kollaborateure
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallEvent {
    CallReceived {
        sender: String,
        kind: MediaKind,
    },
    CallConnected {
        remote: String,
        kind: MediaKind,
    },
    CallEnded {
        remote: String,
        reason: EndReason,
    },
    AudioRouteChanged {
        selected: AudioDevice,
        available: BTreeSet<AudioDevice>,
    },
    Error(String),
}
