//! Call Session
//!
//! Es existiert höchstens eine Session pro Endpunkt. Sie gehört exklusiv
//! dem Negotiation Orchestrator.

use crate::signaling::MediaKind;
use uuid::Uuid;

/// Kennung eines Anrufs, wird an Media-Completions angehängt
pub type CallId = Uuid;

/// Rolle in der Aushandlung
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Erstellt das Offer
    Caller,
    /// Beantwortet das Offer
    Callee,
}

/// Zustand der Session-Aushandlung
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    /// Kein Offer unterwegs (Callee: klingelt)
    Idle,
    /// Offer wird erzeugt
    Offering,
    /// Offer gesendet, warte auf Answer
    AwaitingAnswer,
    /// Offer empfangen, Answer wird erzeugt / ist gesendet
    Answering,
    /// Transport steht
    Connected,
    /// Anruf beendet
    Ended,
}

impl NegotiationState {
    pub fn is_terminal(self) -> bool {
        self == NegotiationState::Ended
    }
}

/// Ein Anruf mit genau einem Gegenüber
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSession {
    pub id: CallId,
    pub local_identity: String,
    pub remote_identity: String,
    pub role: Role,
    pub media_kind: MediaKind,
    pub state: NegotiationState,
    /// Callee hat angenommen (Caller immer)
    pub accepted: bool,
    /// Remote Offer ist in der Media Engine gesetzt
    pub remote_offer_applied: bool,
}

impl CallSession {
    /// Ausgehender Anruf
    pub fn outgoing(local: &str, remote: &str, kind: MediaKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            local_identity: local.to_string(),
            remote_identity: remote.to_string(),
            role: Role::Caller,
            media_kind: kind,
            state: NegotiationState::Offering,
            accepted: true,
            remote_offer_applied: false,
        }
    }

    /// Eingehender Anruf
    pub fn incoming(local: &str, remote: &str, kind: MediaKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            local_identity: local.to_string(),
            remote_identity: remote.to_string(),
            role: Role::Callee,
            media_kind: kind,
            state: NegotiationState::Idle,
            accepted: false,
            remote_offer_applied: false,
        }
    }

    pub fn is_active(&self) -> bool {
        !self.state.is_terminal()
    }

    pub fn is_with(&self, identity: &str) -> bool {
        self.remote_identity == identity
    }
}
