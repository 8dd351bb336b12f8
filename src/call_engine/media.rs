//! Media Engine Vertrag
//!
//! Die Media Engine (Capture, Encoding, Transport) ist ein externer
//! Kollaborateur. Der Orchestrator gibt nur Kommandos; alle asynchronen
//! Ergebnisse und Callbacks kommen als [`MediaEvent`] über den
//! Control-Kanal zurück, markiert mit der [`CallId`] des Anrufs.

use super::session::CallId;
use crate::signaling::{IceCandidate, MediaKind};
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("Media engine not prepared for this call")]
    NotPrepared,

    #[error("Failed to create session description: {0}")]
    CreateDescription(String),

    #[error("Failed to apply session description: {0}")]
    ApplyDescription(String),

    #[error("Invalid SDP: {0}")]
    InvalidSdp(String),

    #[error("WebRTC error: {0}")]
    WebRTC(String),
}

// ============================================================================
// SESSION DESCRIPTION
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpType {
    Offer,
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: String) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp,
        }
    }

    pub fn answer(sdp: String) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp,
        }
    }
}

// ============================================================================
// MEDIA EVENTS
// ============================================================================

/// Verbindungszustand des Peer-Transports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnectivity {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaEventKind {
    /// Ergebnis von `create_offer` / `create_answer`
    DescriptionCreated(Result<SessionDescription, MediaError>),
    /// Ergebnis von `set_local_description`
    LocalDescriptionApplied(Result<SessionDescription, MediaError>),
    /// Ergebnis von `set_remote_description`
    RemoteDescriptionApplied(Result<SdpType, MediaError>),
    /// Lokaler Kandidat gefunden
    IceCandidateDiscovered(IceCandidate),
    ConnectivityChanged(PeerConnectivity),
    RemoteStreamAdded(MediaKind),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaEvent {
    pub call_id: CallId,
    pub kind: MediaEventKind,
}

impl MediaEvent {
    pub fn new(call_id: CallId, kind: MediaEventKind) -> Self {
        Self { call_id, kind }
    }
}

// ============================================================================
// MEDIA ENGINE CONTRACT
// ============================================================================

/// Kommandoschnittstelle zur Media Engine
///
/// Keine Methode blockiert. Methoden ohne Rückgabewert melden ihr Ergebnis
/// asynchron als [`MediaEvent`].
pub trait MediaEngine: Send {
    /// Baut die Pipeline für einen neuen Anruf auf (ersetzt eine alte)
    fn prepare(&mut self, call_id: CallId, kind: MediaKind) -> Result<(), MediaError>;

    fn create_offer(&mut self, call_id: CallId);

    fn create_answer(&mut self, call_id: CallId);

    fn set_local_description(&mut self, call_id: CallId, description: SessionDescription);

    fn set_remote_description(&mut self, call_id: CallId, description: SessionDescription);

    /// Best-effort, ohne Completion
    fn add_ice_candidate(&mut self, call_id: CallId, candidate: IceCandidate);

    fn set_audio_muted(&mut self, muted: bool);

    fn set_video_enabled(&mut self, enabled: bool);

    /// Gibt alle Ressourcen des laufenden Anrufs frei. Idempotent.
    fn release(&mut self);
}
