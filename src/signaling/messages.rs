//! Relay-Codec für Signaling-Nachrichten
//!
//! Eine Nachricht liegt im Relay als JSON-String in der Mailbox des Ziels
//! (`<identity>/latest_event`). Die Mailbox hält nur den letzten Wert,
//! es gibt keine Queue und keine garantierte Reihenfolge.

use chrono::Utc;
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Malformed signaling message: {0}")]
    MalformedMessage(String),

    #[error("Malformed ICE candidate: {0}")]
    MalformedCandidate(String),

    #[error("Failed to encode message: {0}")]
    Encode(String),
}

// ============================================================================
// RELAY KEYS
// ============================================================================

/// Mailbox mit der zuletzt an `identity` gesendeten Nachricht
pub fn mailbox_key(identity: &str) -> String {
    format!("{}/latest_event", identity)
}

/// Online-Status von `identity`
pub fn status_key(identity: &str) -> String {
    format!("{}/status", identity)
}

/// Credential-Record von `identity`
pub fn password_key(identity: &str) -> String {
    format!("{}/password", identity)
}

// ============================================================================
// MESSAGE TYPES
// ============================================================================

/// Art der Medien eines Anrufs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    /// Leitet die Medienart aus einem SDP-Blob ab (Video sobald eine
    /// `m=video` Zeile vorkommt)
    pub fn from_sdp(sdp: &str) -> Self {
        if sdp.lines().any(|line| line.trim_start().starts_with("m=video")) {
            MediaKind::Video
        } else {
            MediaKind::Audio
        }
    }
}

/// Typ einer Signaling-Nachricht
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageType {
    StartVideoCall,
    StartAudioCall,
    Offer,
    Answer,
    #[serde(rename = "IceCandidates")]
    IceCandidate,
    EndCall,
}

impl MessageType {
    /// StartCall-Typ für die gegebene Medienart
    pub fn start_call(kind: MediaKind) -> Self {
        match kind {
            MediaKind::Audio => MessageType::StartAudioCall,
            MediaKind::Video => MessageType::StartVideoCall,
        }
    }

    /// Medienart einer StartCall-Nachricht
    pub fn requested_media(self) -> Option<MediaKind> {
        match self {
            MessageType::StartAudioCall => Some(MediaKind::Audio),
            MessageType::StartVideoCall => Some(MediaKind::Video),
            _ => None,
        }
    }
}

/// Eine Nachricht im Relay
///
/// `sender` und `timestamp` setzt ausschließlich der sendende Orchestrator
/// über [`SignalingMessage::stamped`] direkt vor dem Versand.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalingMessage {
    #[serde(rename = "type")]
    pub msg_type: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    pub target: String,
    #[serde(rename = "data", default, deserialize_with = "null_as_empty")]
    pub payload: String,
    #[serde(rename = "timeStamp", default)]
    pub timestamp: i64,
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

impl SignalingMessage {
    fn new(msg_type: MessageType, target: String, payload: String) -> Self {
        Self {
            msg_type,
            sender: None,
            target,
            payload,
            timestamp: 0,
        }
    }

    /// Anrufanfrage
    pub fn start_call(target: String, kind: MediaKind) -> Self {
        Self::new(MessageType::start_call(kind), target, String::new())
    }

    /// SDP Offer
    pub fn offer(target: String, sdp: String) -> Self {
        Self::new(MessageType::Offer, target, sdp)
    }

    /// SDP Answer
    pub fn answer(target: String, sdp: String) -> Self {
        Self::new(MessageType::Answer, target, sdp)
    }

    /// ICE Candidate, serialisiert als JSON-Descriptor
    pub fn ice_candidate(target: String, candidate: &IceCandidate) -> Result<Self, CodecError> {
        let payload =
            serde_json::to_string(candidate).map_err(|e| CodecError::Encode(e.to_string()))?;
        Ok(Self::new(MessageType::IceCandidate, target, payload))
    }

    /// Anruf beenden
    pub fn end_call(target: String) -> Self {
        Self::new(MessageType::EndCall, target, String::new())
    }

    /// Setzt Absender und Zeitstempel unmittelbar vor dem Versand
    pub fn stamped(mut self, sender: &str) -> Self {
        self.sender = Some(sender.to_string());
        self.timestamp = Utc::now().timestamp_millis();
        self
    }

    /// Prüft ob die Nachricht älter als `max_age_ms` ist
    pub fn is_stale(&self, now_ms: i64, max_age_ms: i64) -> bool {
        now_ms - self.timestamp > max_age_ms
    }

    /// Dekodiert den Payload einer IceCandidate-Nachricht
    pub fn candidate(&self) -> Result<IceCandidate, CodecError> {
        if self.msg_type != MessageType::IceCandidate {
            return Err(CodecError::MalformedCandidate(format!(
                "message of type {:?} carries no candidate",
                self.msg_type
            )));
        }
        IceCandidate::decode(&self.payload)
    }

    /// Kodiert die Nachricht in die Wertdarstellung des Relays
    pub fn encode(&self) -> Result<String, CodecError> {
        serde_json::to_string(self).map_err(|e| CodecError::Encode(e.to_string()))
    }

    /// Dekodiert einen Mailbox-Wert
    pub fn decode(value: &str) -> Result<Self, CodecError> {
        serde_json::from_str(value).map_err(|e| CodecError::MalformedMessage(e.to_string()))
    }
}

// ============================================================================
// ICE CANDIDATE
// ============================================================================

/// Netzwerkpfad-Kandidat wie er zwischen den Peers ausgetauscht wird
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_m_line_index: Option<u16>,
    #[serde(rename = "sdp")]
    pub candidate: String,
}

impl IceCandidate {
    pub fn decode(payload: &str) -> Result<Self, CodecError> {
        let candidate: IceCandidate = serde_json::from_str(payload)
            .map_err(|e| CodecError::MalformedCandidate(e.to_string()))?;
        if candidate.candidate.trim().is_empty() {
            return Err(CodecError::MalformedCandidate(
                "empty candidate line".to_string(),
            ));
        }
        Ok(candidate)
    }
}

// ============================================================================
// PRESENCE
// ============================================================================

/// Status eines Benutzers im Relay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UserStatus {
    Online,
    Offline,
    InCall,
}

impl UserStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            UserStatus::Online => "ONLINE",
            UserStatus::Offline => "OFFLINE",
            UserStatus::InCall => "IN_CALL",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().trim_matches('"') {
            "ONLINE" => Some(UserStatus::Online),
            "OFFLINE" => Some(UserStatus::Offline),
            "IN_CALL" => Some(UserStatus::InCall),
            _ => None,
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
