//! Call Engine Module - Session-Aushandlung
//!
//! Dieses Modul verwaltet:
//! - Die aktuelle Call Session
//! - Den Vertrag zur Media Engine
//! - Den Negotiation Orchestrator (Offer / Answer / Candidates)
//! - Die WebRTC-basierte Media Engine

mod media;
mod orchestrator;
mod session;
mod webrtc;

pub use media::{
    MediaEngine, MediaError, MediaEvent, MediaEventKind, PeerConnectivity, SdpType,
    SessionDescription,
};
pub use orchestrator::{NegotiationOrchestrator, OrchestratorError};
pub use session::{CallId, CallSession, NegotiationState, Role};
pub use self::webrtc::{ice_servers_from_config, WebRtcMediaEngine};
