//! Negotiation Orchestrator
//!
//! Treibt genau eine [`CallSession`] durch Offer / Answer / Candidate bis
//! zur Verbindung oder zum Ende. Einzige Seiteneffekte sind die Media
//! Engine und der Signaling Transport. Jeder asynchrone Schritt kommt als
//! [`MediaEvent`] zurück und wird hier als eigener Zustandsübergang
//! behandelt.

use super::media::{
    MediaEngine, MediaError, MediaEvent, MediaEventKind, PeerConnectivity, SdpType,
    SessionDescription,
};
use super::session::{CallSession, NegotiationState, Role};
use crate::config::SignalingConfig;
use crate::control::{CallEvent, ControlEvent, ControlSender, EndReason, RouteIntent};
use crate::signaling::{
    mailbox_key, set_status, CodecError, MediaKind, MessageType, SignalingMessage,
    SignalingTransport, TransportError, UserStatus,
};
use chrono::Utc;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OrchestratorError {
    #[error("Already in a call")]
    AlreadyInCall,

    #[error("No active call")]
    NoActiveCall,

    #[error("No incoming call to answer")]
    NoIncomingCall,

    #[error("Invalid call target: {0}")]
    InvalidTarget(String),

    #[error(transparent)]
    Media(#[from] MediaError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

// ============================================================================
// ORCHESTRATOR
// ============================================================================

pub struct NegotiationOrchestrator {
    local_identity: String,
    settings: SignalingConfig,
    transport: Arc<dyn SignalingTransport>,
    media: Box<dyn MediaEngine>,
    session: Option<CallSession>,
    control_tx: ControlSender,
    events: broadcast::Sender<CallEvent>,
}

impl NegotiationOrchestrator {
    pub fn new(
        local_identity: String,
        settings: SignalingConfig,
        transport: Arc<dyn SignalingTransport>,
        media: Box<dyn MediaEngine>,
        control_tx: ControlSender,
        events: broadcast::Sender<CallEvent>,
    ) -> Self {
        Self {
            local_identity,
            settings,
            transport,
            media,
            session: None,
            control_tx,
            events,
        }
    }

    pub fn local_identity(&self) -> &str {
        &self.local_identity
    }

    /// Aktuelle oder zuletzt beendete Session
    pub fn session(&self) -> Option<&CallSession> {
        self.session.as_ref()
    }

    pub fn negotiation_state(&self) -> Option<NegotiationState> {
        self.session.as_ref().map(|s| s.state)
    }

    fn active_session(&self) -> Option<&CallSession> {
        self.session.as_ref().filter(|s| s.is_active())
    }

    fn active_session_mut(&mut self) -> Option<&mut CallSession> {
        self.session.as_mut().filter(|s| s.is_active())
    }

    // ========================================================================
    // INTENTS
    // ========================================================================

    /// Startet einen ausgehenden Anruf
    ///
    /// Sendet zuerst die Anrufanfrage, danach wird das Offer erzeugt. Das
    /// Offer geht erst raus, wenn die Media Engine es lokal gesetzt hat.
    pub fn place_call(&mut self, target: &str, kind: MediaKind) -> Result<(), OrchestratorError> {
        let target = target.trim();
        if target.is_empty() || target == self.local_identity {
            return Err(OrchestratorError::InvalidTarget(target.to_string()));
        }
        if self.active_session().is_some() {
            return Err(OrchestratorError::AlreadyInCall);
        }

        let session = CallSession::outgoing(&self.local_identity, target, kind);
        let call_id = session.id;
        self.media.prepare(call_id, kind)?;

        tracing::info!("Calling {} ({:?}, call {})", target, kind, call_id);
        self.session = Some(session);
        self.notify_route(RouteIntent::CallStarted);

        self.send_or_report(SignalingMessage::start_call(target.to_string(), kind));
        self.media.create_offer(call_id);
        Ok(())
    }

    /// Nimmt den eingehenden Anruf an
    pub fn accept(&mut self) -> Result<(), OrchestratorError> {
        let session = self
            .active_session_mut()
            .filter(|s| s.role == Role::Callee && !s.accepted)
            .ok_or(OrchestratorError::NoIncomingCall)?;

        session.accepted = true;
        let call_id = session.id;
        let offer_ready = session.remote_offer_applied;
        tracing::info!("Accepted call from {}", session.remote_identity);

        if offer_ready {
            self.media.create_answer(call_id);
        }
        Ok(())
    }

    /// Lehnt den eingehenden Anruf ab
    pub fn reject(&mut self) -> Result<(), OrchestratorError> {
        let is_ringing = self
            .active_session()
            .is_some_and(|s| s.role == Role::Callee && !s.accepted);
        if !is_ringing {
            return Err(OrchestratorError::NoIncomingCall);
        }

        self.end_session(EndReason::Rejected, true);
        Ok(())
    }

    /// Beendet den laufenden Anruf
    pub fn hang_up(&mut self) -> Result<(), OrchestratorError> {
        if self.active_session().is_none() {
            return Err(OrchestratorError::NoActiveCall);
        }

        self.end_session(EndReason::LocalHangUp, true);
        Ok(())
    }

    pub fn set_muted(&mut self, muted: bool) -> Result<(), OrchestratorError> {
        if self.active_session().is_none() {
            return Err(OrchestratorError::NoActiveCall);
        }
        tracing::debug!("Microphone muted: {}", muted);
        self.media.set_audio_muted(muted);
        Ok(())
    }

    pub fn set_video_enabled(&mut self, enabled: bool) -> Result<(), OrchestratorError> {
        if self.active_session().is_none() {
            return Err(OrchestratorError::NoActiveCall);
        }
        tracing::debug!("Camera enabled: {}", enabled);
        self.media.set_video_enabled(enabled);
        Ok(())
    }

    /// Beendet einen laufenden Anruf beim Herunterfahren
    pub fn shutdown(&mut self) {
        if self.active_session().is_some() {
            self.end_session(EndReason::Shutdown, true);
        }
        self.media.release();
    }

    // ========================================================================
    // INBOUND RELAY MESSAGES
    // ========================================================================

    /// Verarbeitet einen neuen Wert der eigenen Mailbox
    pub fn handle_relay_value(&mut self, value: Option<String>) {
        let Some(value) = value else {
            tracing::trace!("Mailbox cleared");
            return;
        };

        let message = match SignalingMessage::decode(&value) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!("Dropping undecodable relay value: {}", e);
                return;
            }
        };

        if message.target != self.local_identity {
            tracing::debug!("Dropping message addressed to {}", message.target);
            return;
        }
        let sender = match message.sender.clone() {
            Some(sender) if !sender.is_empty() && sender != self.local_identity => sender,
            _ => {
                tracing::debug!("Dropping {:?} without usable sender", message.msg_type);
                return;
            }
        };

        tracing::debug!("Received {:?} from {}", message.msg_type, sender);

        match message.msg_type {
            MessageType::StartAudioCall | MessageType::StartVideoCall => {
                self.on_call_request(&sender, &message)
            }
            MessageType::Offer => self.on_offer(&sender, message.payload),
            MessageType::Answer => self.on_answer(&sender, message.payload),
            MessageType::IceCandidate => self.on_candidate(&sender, &message),
            MessageType::EndCall => self.on_end_call(&sender),
        }
    }

    fn on_call_request(&mut self, sender: &str, message: &SignalingMessage) {
        let max_age_ms = (self.settings.stale_event_secs as i64).saturating_mul(1000);
        if message.timestamp > 0 && message.is_stale(Utc::now().timestamp_millis(), max_age_ms) {
            tracing::debug!("Ignoring stale call request from {}", sender);
            return;
        }

        if let Some(session) = self.active_session() {
            if session.is_with(sender) {
                tracing::debug!("Duplicate call request from {}", sender);
            } else {
                tracing::warn!(
                    "Ignoring call request from {} while in call with {}",
                    sender,
                    session.remote_identity
                );
            }
            return;
        }

        let kind = message.msg_type.requested_media().unwrap_or(MediaKind::Audio);
        self.open_incoming(sender, kind);
    }

    fn on_offer(&mut self, sender: &str, sdp: String) {
        match self.active_session() {
            Some(session) if !session.is_with(sender) => {
                tracing::warn!("Dropping offer from {}: busy", sender);
                return;
            }
            Some(session) if session.state == NegotiationState::Connected => {
                tracing::info!("Dropping offer from {}: renegotiation unsupported", sender);
                return;
            }
            Some(_) => {}
            None => {
                if !self.open_incoming(sender, MediaKind::from_sdp(&sdp)) {
                    return;
                }
            }
        }

        let Some(session) = self.active_session_mut() else {
            return;
        };

        if session.role == Role::Caller {
            // Gegenseite übernimmt das Offer auf unsere Anfrage hin
            tracing::info!("{} answered our call request with an offer", sender);
            session.role = Role::Callee;
            session.accepted = true;
        }
        session.state = NegotiationState::Answering;
        session.remote_offer_applied = false;
        let call_id = session.id;

        self.media
            .set_remote_description(call_id, SessionDescription::offer(sdp));
    }

    fn on_answer(&mut self, sender: &str, sdp: String) {
        let Some(session) = self.active_session() else {
            tracing::debug!("Ignoring answer from {}: no call", sender);
            return;
        };
        if !session.is_with(sender) || session.state != NegotiationState::AwaitingAnswer {
            tracing::debug!(
                "Ignoring answer from {} in state {:?}",
                sender,
                session.state
            );
            return;
        }

        let call_id = session.id;
        self.media
            .set_remote_description(call_id, SessionDescription::answer(sdp));
    }

    fn on_candidate(&mut self, sender: &str, message: &SignalingMessage) {
        let Some(call_id) = self
            .active_session()
            .filter(|s| s.is_with(sender))
            .map(|s| s.id)
        else {
            tracing::debug!("Ignoring candidate from {}: no matching call", sender);
            return;
        };

        match message.candidate() {
            Ok(candidate) => self.media.add_ice_candidate(call_id, candidate),
            Err(e) => tracing::warn!("Dropping candidate from {}: {}", sender, e),
        }
    }

    fn on_end_call(&mut self, sender: &str) {
        if self.active_session().is_some_and(|s| s.is_with(sender)) {
            tracing::info!("{} ended the call", sender);
            self.end_session(EndReason::RemoteHangUp, false);
        } else {
            tracing::debug!("Ignoring end call from {}", sender);
        }
    }

    /// Legt eine eingehende Session an. `false` wenn die Media Engine
    /// nicht vorbereitet werden konnte.
    fn open_incoming(&mut self, sender: &str, kind: MediaKind) -> bool {
        let mut session = CallSession::incoming(&self.local_identity, sender, kind);
        if let Err(e) = self.media.prepare(session.id, kind) {
            tracing::error!("Cannot take call from {}: {}", sender, e);
            self.emit(CallEvent::Error(e.to_string()));
            return false;
        }

        session.accepted = self.settings.auto_accept;
        tracing::info!("Incoming {:?} call from {}", kind, sender);
        self.session = Some(session);
        self.notify_route(RouteIntent::CallStarted);
        self.emit(CallEvent::CallReceived {
            sender: sender.to_string(),
            kind,
        });
        true
    }

    // ========================================================================
    // MEDIA ENGINE COMPLETIONS
    // ========================================================================

    pub fn handle_media_event(&mut self, event: MediaEvent) {
        let Some(session) = self.active_session() else {
            tracing::debug!("Dropping media event without active call");
            return;
        };
        if session.id != event.call_id {
            tracing::debug!("Dropping stale media event of call {}", event.call_id);
            return;
        }
        let remote = session.remote_identity.clone();
        let state = session.state;

        match event.kind {
            MediaEventKind::DescriptionCreated(Ok(description))
                if description.sdp_type == SdpType::Offer && state != NegotiationState::Offering =>
            {
                // Gegenseite hat inzwischen selbst ein Offer geschickt
                tracing::debug!("Dropping local offer created in state {:?}", state);
            }
            MediaEventKind::DescriptionCreated(Ok(description)) => {
                self.media.set_local_description(event.call_id, description);
            }
            MediaEventKind::DescriptionCreated(Err(e))
            | MediaEventKind::LocalDescriptionApplied(Err(e)) => self.fail_negotiation(e),
            MediaEventKind::LocalDescriptionApplied(Ok(description)) => {
                self.on_local_description(description)
            }
            MediaEventKind::RemoteDescriptionApplied(Ok(sdp_type)) => {
                self.on_remote_description(sdp_type)
            }
            MediaEventKind::RemoteDescriptionApplied(Err(e)) => {
                tracing::warn!("Remote description rejected: {}", e);
            }
            MediaEventKind::IceCandidateDiscovered(candidate) => {
                match SignalingMessage::ice_candidate(remote, &candidate) {
                    Ok(message) => self.send_or_report(message),
                    Err(e) => tracing::warn!("Cannot encode local candidate: {}", e),
                }
            }
            MediaEventKind::ConnectivityChanged(PeerConnectivity::Connected) => {
                self.on_connected()
            }
            MediaEventKind::ConnectivityChanged(PeerConnectivity::Failed) => {
                tracing::warn!("Peer connection failed");
                self.end_session(EndReason::ConnectionFailed, true);
            }
            MediaEventKind::ConnectivityChanged(state) => {
                tracing::debug!("Peer connectivity: {:?}", state);
            }
            MediaEventKind::RemoteStreamAdded(kind) => {
                tracing::info!("Remote {:?} stream added", kind);
            }
        }
    }

    fn on_local_description(&mut self, description: SessionDescription) {
        let Some(session) = self.active_session_mut() else {
            return;
        };
        let remote = session.remote_identity.clone();

        let message = match description.sdp_type {
            SdpType::Offer => {
                if session.state != NegotiationState::Offering {
                    tracing::debug!("Local offer ready in state {:?}, not sent", session.state);
                    return;
                }
                session.state = NegotiationState::AwaitingAnswer;
                SignalingMessage::offer(remote, description.sdp)
            }
            SdpType::Answer => SignalingMessage::answer(remote, description.sdp),
        };

        tracing::debug!("Sending {:?}", message.msg_type);
        self.send_or_report(message);
    }

    fn on_remote_description(&mut self, sdp_type: SdpType) {
        let Some(session) = self.active_session_mut() else {
            return;
        };

        match sdp_type {
            SdpType::Offer => {
                if session.state != NegotiationState::Answering {
                    return;
                }
                session.remote_offer_applied = true;
                let call_id = session.id;
                if session.accepted {
                    self.media.create_answer(call_id);
                } else {
                    tracing::debug!("Offer applied, waiting for accept");
                }
            }
            SdpType::Answer => tracing::debug!("Remote answer applied"),
        }
    }

    fn on_connected(&mut self) {
        let Some(session) = self.active_session_mut() else {
            return;
        };
        if session.state == NegotiationState::Connected {
            return;
        }

        session.state = NegotiationState::Connected;
        let remote = session.remote_identity.clone();
        let kind = session.media_kind;
        tracing::info!("Call with {} connected", remote);

        // Alte Events dürfen beim nächsten Verbinden nicht erneut greifen
        if let Err(e) = self
            .transport
            .publish(&mailbox_key(&self.local_identity), None)
        {
            tracing::warn!("Failed to clear mailbox: {}", e);
        }
        if let Err(e) = set_status(self.transport.as_ref(), &self.local_identity, UserStatus::InCall)
        {
            tracing::warn!("Failed to update status: {}", e);
        }

        self.emit(CallEvent::CallConnected { remote, kind });
        self.notify_route(RouteIntent::CallConnected(kind));
    }

    fn fail_negotiation(&mut self, error: MediaError) {
        tracing::error!("Negotiation failed: {}", error);
        self.emit(CallEvent::Error(error.to_string()));
        self.end_session(EndReason::NegotiationFailed, true);
    }

    // ========================================================================
    // TEARDOWN
    // ========================================================================

    /// Beendet die aktive Session. Danach ist der Orchestrator sofort
    /// bereit für einen neuen Anruf.
    fn end_session(&mut self, reason: EndReason, notify_remote: bool) {
        let Some(session) = self.active_session_mut() else {
            return;
        };
        session.state = NegotiationState::Ended;
        let remote = session.remote_identity.clone();

        if notify_remote {
            self.send_or_report(SignalingMessage::end_call(remote.clone()));
        }

        self.media.release();
        tracing::info!("Call with {} ended ({:?})", remote, reason);

        self.emit(CallEvent::CallEnded { remote, reason });
        self.notify_route(RouteIntent::CallEnded);

        if let Err(e) = set_status(self.transport.as_ref(), &self.local_identity, UserStatus::Online)
        {
            tracing::warn!("Failed to update status: {}", e);
        }
    }

    // ========================================================================
    // PRIVATE METHODS
    // ========================================================================

    /// Stempelt und veröffentlicht eine Nachricht in der Mailbox des Ziels
    fn send(&self, message: SignalingMessage) -> Result<(), OrchestratorError> {
        let message = message.stamped(&self.local_identity);
        let value = message.encode()?;
        self.transport
            .publish(&mailbox_key(&message.target), Some(value))?;
        Ok(())
    }

    /// Versandfehler sind nie fatal für die Session
    fn send_or_report(&self, message: SignalingMessage) {
        let msg_type = message.msg_type;
        if let Err(e) = self.send(message) {
            tracing::warn!("Failed to send {:?}: {}", msg_type, e);
            self.emit(CallEvent::Error(e.to_string()));
        }
    }

    fn emit(&self, event: CallEvent) {
        let _ = self.events.send(event);
    }

    fn notify_route(&self, intent: RouteIntent) {
        let _ = self.control_tx.send(ControlEvent::Route(intent));
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::{control_channel, ControlReceiver};
    use crate::signaling::{IceCandidate, MemoryRelay, ValueReceiver};
    use crate::testing::{fake_sdp, FakeMediaEngine, MediaCall, MediaRecorder};

    struct Harness {
        orch: NegotiationOrchestrator,
        recorder: MediaRecorder,
        relay: MemoryRelay,
        control_rx: ControlReceiver,
        events: broadcast::Receiver<CallEvent>,
        outbox: ValueReceiver,
    }

    fn harness_with(settings: SignalingConfig) -> Harness {
        build_harness(settings, false)
    }

    /// Die Fake Engine liefert Completions selbst, `pump` verarbeitet sie
    fn live_harness() -> Harness {
        build_harness(SignalingConfig::default(), true)
    }

    fn build_harness(settings: SignalingConfig, autocomplete: bool) -> Harness {
        let relay = MemoryRelay::new();
        let outbox = relay.subscribe(&mailbox_key("bob")).unwrap();
        let (control_tx, control_rx) = control_channel();
        let (engine, recorder) = if autocomplete {
            FakeMediaEngine::autocomplete(control_tx.clone())
        } else {
            FakeMediaEngine::new()
        };
        let (events_tx, events) = broadcast::channel(64);

        let orch = NegotiationOrchestrator::new(
            "alice".to_string(),
            settings,
            Arc::new(relay.clone()),
            Box::new(engine),
            control_tx,
            events_tx,
        );

        Harness {
            orch,
            recorder,
            relay,
            control_rx,
            events,
            outbox,
        }
    }

    fn harness() -> Harness {
        harness_with(SignalingConfig::default())
    }

    impl Harness {
        /// Alle seit dem letzten Aufruf an bob gesendeten Nachrichten
        fn sent(&mut self) -> Vec<SignalingMessage> {
            let mut sent = Vec::new();
            while let Ok(value) = self.outbox.try_recv() {
                if let Some(value) = value {
                    sent.push(SignalingMessage::decode(&value).unwrap());
                }
            }
            sent
        }

        fn sent_types(&mut self) -> Vec<MessageType> {
            self.sent().into_iter().map(|m| m.msg_type).collect()
        }

        fn deliver(&mut self, message: SignalingMessage) {
            let value = message.stamped("bob").encode().unwrap();
            self.orch.handle_relay_value(Some(value));
        }

        fn complete(&mut self, kind: MediaEventKind) {
            let call_id = self.orch.session().unwrap().id;
            self.orch.handle_media_event(MediaEvent::new(call_id, kind));
        }

        fn state(&self) -> NegotiationState {
            self.orch.negotiation_state().unwrap()
        }

        fn routes(&mut self) -> Vec<RouteIntent> {
            let mut routes = Vec::new();
            while let Ok(event) = self.control_rx.try_recv() {
                if let ControlEvent::Route(intent) = event {
                    routes.push(intent);
                }
            }
            routes
        }

        fn events(&mut self) -> Vec<CallEvent> {
            let mut events = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                events.push(event);
            }
            events
        }

        /// Verarbeitet Media-Completions, bis keine mehr anstehen
        fn pump(&mut self) {
            while let Ok(event) = self.control_rx.try_recv() {
                if let ControlEvent::Media(event) = event {
                    self.orch.handle_media_event(event);
                }
            }
        }

        /// Ausgehender Anruf bis AwaitingAnswer
        fn call_bob(&mut self, kind: MediaKind) {
            self.orch.place_call("bob", kind).unwrap();
            self.complete(MediaEventKind::DescriptionCreated(Ok(
                SessionDescription::offer(fake_sdp(kind)),
            )));
            self.complete(MediaEventKind::LocalDescriptionApplied(Ok(
                SessionDescription::offer(fake_sdp(kind)),
            )));
        }
    }

    #[test]
    fn test_place_call_sends_request_then_offer() {
        let mut h = harness();

        h.orch.place_call("bob", MediaKind::Video).unwrap();
        assert_eq!(h.state(), NegotiationState::Offering);
        assert_eq!(h.sent_types(), vec![MessageType::StartVideoCall]);
        assert_eq!(h.routes(), vec![RouteIntent::CallStarted]);
        assert!(h.recorder.calls().contains(&MediaCall::CreateOffer));

        let offer = SessionDescription::offer(fake_sdp(MediaKind::Video));
        h.complete(MediaEventKind::DescriptionCreated(Ok(offer.clone())));
        assert_eq!(h.recorder.calls().last(), Some(&MediaCall::SetLocal(SdpType::Offer)));
        // Offer geht erst nach dem lokalen Setzen raus
        assert!(h.sent().is_empty());

        h.complete(MediaEventKind::LocalDescriptionApplied(Ok(offer)));
        let sent = h.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].msg_type, MessageType::Offer);
        assert_eq!(sent[0].sender.as_deref(), Some("alice"));
        assert_eq!(h.state(), NegotiationState::AwaitingAnswer);
    }

    #[test]
    fn test_place_call_rejects_bad_target_and_second_call() {
        let mut h = harness();
        assert!(matches!(
            h.orch.place_call("alice", MediaKind::Audio),
            Err(OrchestratorError::InvalidTarget(_))
        ));
        assert!(matches!(
            h.orch.place_call("  ", MediaKind::Audio),
            Err(OrchestratorError::InvalidTarget(_))
        ));

        h.orch.place_call("bob", MediaKind::Audio).unwrap();
        assert_eq!(
            h.orch.place_call("carol", MediaKind::Audio),
            Err(OrchestratorError::AlreadyInCall)
        );
    }

    #[test]
    fn test_prepare_failure_leaves_no_session() {
        let mut h = harness();
        h.recorder.fail_prepare(true);

        assert!(matches!(
            h.orch.place_call("bob", MediaKind::Audio),
            Err(OrchestratorError::Media(_))
        ));
        assert!(h.orch.session().is_none());
        assert!(h.sent().is_empty());
    }

    #[test]
    fn test_answer_applied_only_while_awaiting() {
        let mut h = harness();
        h.orch.place_call("bob", MediaKind::Audio).unwrap();

        // Zu früh: noch Offering
        h.deliver(SignalingMessage::answer(
            "alice".to_string(),
            fake_sdp(MediaKind::Audio),
        ));
        assert!(!h
            .recorder
            .calls()
            .iter()
            .any(|c| matches!(c, MediaCall::SetRemote(SdpType::Answer))));

        let offer = SessionDescription::offer(fake_sdp(MediaKind::Audio));
        h.complete(MediaEventKind::DescriptionCreated(Ok(offer.clone())));
        h.complete(MediaEventKind::LocalDescriptionApplied(Ok(offer)));
        h.deliver(SignalingMessage::answer(
            "alice".to_string(),
            fake_sdp(MediaKind::Audio),
        ));
        assert_eq!(
            h.recorder.calls().last(),
            Some(&MediaCall::SetRemote(SdpType::Answer))
        );

        // Nach Connected ist ein Answer ein No-Op
        h.complete(MediaEventKind::ConnectivityChanged(PeerConnectivity::Connected));
        h.recorder.clear();
        h.deliver(SignalingMessage::answer(
            "alice".to_string(),
            fake_sdp(MediaKind::Audio),
        ));
        assert!(h.recorder.calls().is_empty());
        assert_eq!(h.state(), NegotiationState::Connected);
    }

    #[test]
    fn test_answer_from_other_peer_ignored() {
        let mut h = harness();
        h.call_bob(MediaKind::Audio);
        h.recorder.clear();

        let value = SignalingMessage::answer("alice".to_string(), fake_sdp(MediaKind::Audio))
            .stamped("mallory")
            .encode()
            .unwrap();
        h.orch.handle_relay_value(Some(value));
        assert!(h.recorder.calls().is_empty());
    }

    #[test]
    fn test_malformed_candidate_keeps_state() {
        let mut h = harness();
        h.call_bob(MediaKind::Audio);

        let mut message = SignalingMessage::end_call("alice".to_string());
        message.msg_type = MessageType::IceCandidate;
        message.payload = "{broken".to_string();
        h.recorder.clear();
        h.deliver(message);

        assert_eq!(h.state(), NegotiationState::AwaitingAnswer);
        assert!(h.recorder.calls().is_empty());

        let candidate = IceCandidate {
            sdp_mid: Some("0".to_string()),
            sdp_m_line_index: Some(0),
            candidate: "candidate:1 1 UDP 2122252543 10.0.0.2 50000 typ host".to_string(),
        };
        h.deliver(SignalingMessage::ice_candidate("alice".to_string(), &candidate).unwrap());
        assert_eq!(
            h.recorder.calls(),
            vec![MediaCall::AddCandidate(candidate.candidate)]
        );
        assert_eq!(h.state(), NegotiationState::AwaitingAnswer);
    }

    #[test]
    fn test_incoming_offer_waits_for_accept() {
        let mut h = harness();
        h.deliver(SignalingMessage::start_call("alice".to_string(), MediaKind::Video));

        let session = h.orch.session().unwrap();
        assert_eq!(session.role, Role::Callee);
        assert_eq!(session.state, NegotiationState::Idle);
        assert_eq!(
            h.events(),
            vec![CallEvent::CallReceived {
                sender: "bob".to_string(),
                kind: MediaKind::Video
            }]
        );
        assert_eq!(h.routes(), vec![RouteIntent::CallStarted]);

        h.deliver(SignalingMessage::offer(
            "alice".to_string(),
            fake_sdp(MediaKind::Video),
        ));
        assert_eq!(h.state(), NegotiationState::Answering);
        h.complete(MediaEventKind::RemoteDescriptionApplied(Ok(SdpType::Offer)));
        assert!(!h.recorder.calls().contains(&MediaCall::CreateAnswer));

        h.orch.accept().unwrap();
        assert!(h.recorder.calls().contains(&MediaCall::CreateAnswer));

        let answer = SessionDescription::answer(fake_sdp(MediaKind::Video));
        h.complete(MediaEventKind::DescriptionCreated(Ok(answer.clone())));
        h.complete(MediaEventKind::LocalDescriptionApplied(Ok(answer)));
        assert_eq!(h.sent_types(), vec![MessageType::Answer]);
        assert_eq!(h.orch.accept(), Err(OrchestratorError::NoIncomingCall));
    }

    #[test]
    fn test_offer_without_request_infers_media() {
        let mut h = harness_with(SignalingConfig {
            auto_accept: true,
            ..SignalingConfig::default()
        });

        h.deliver(SignalingMessage::offer(
            "alice".to_string(),
            fake_sdp(MediaKind::Audio),
        ));
        let session = h.orch.session().unwrap();
        assert_eq!(session.media_kind, MediaKind::Audio);
        assert!(session.accepted);

        h.complete(MediaEventKind::RemoteDescriptionApplied(Ok(SdpType::Offer)));
        assert_eq!(h.recorder.calls().last(), Some(&MediaCall::CreateAnswer));
    }

    #[test]
    fn test_connected_clears_mailbox_and_notifies() {
        let mut h = harness();
        h.relay
            .publish(&mailbox_key("alice"), Some("old".to_string()))
            .unwrap();
        h.call_bob(MediaKind::Audio);
        h.routes();
        h.events();

        h.complete(MediaEventKind::ConnectivityChanged(PeerConnectivity::Connected));
        assert_eq!(h.state(), NegotiationState::Connected);
        assert_eq!(h.relay.value(&mailbox_key("alice")), None);
        assert_eq!(h.relay.value("alice/status").as_deref(), Some("IN_CALL"));
        assert_eq!(
            h.routes(),
            vec![RouteIntent::CallConnected(MediaKind::Audio)]
        );
        assert_eq!(
            h.events(),
            vec![CallEvent::CallConnected {
                remote: "bob".to_string(),
                kind: MediaKind::Audio
            }]
        );

        // Doppeltes Connected wird nicht erneut gemeldet
        h.complete(MediaEventKind::ConnectivityChanged(PeerConnectivity::Connected));
        assert!(h.routes().is_empty());
    }

    #[test]
    fn test_offer_while_connected_dropped() {
        let mut h = harness();
        h.call_bob(MediaKind::Audio);
        h.complete(MediaEventKind::ConnectivityChanged(PeerConnectivity::Connected));
        h.recorder.clear();

        h.deliver(SignalingMessage::offer(
            "alice".to_string(),
            fake_sdp(MediaKind::Video),
        ));
        assert!(h.recorder.calls().is_empty());
        assert_eq!(h.state(), NegotiationState::Connected);
    }

    #[test]
    fn test_remote_end_call_rearms() {
        let mut h = harness();
        h.call_bob(MediaKind::Video);
        h.complete(MediaEventKind::ConnectivityChanged(PeerConnectivity::Connected));
        h.sent();
        h.routes();

        h.deliver(SignalingMessage::end_call("alice".to_string()));
        assert_eq!(h.state(), NegotiationState::Ended);
        assert!(h.recorder.calls().contains(&MediaCall::Release));
        assert_eq!(h.routes(), vec![RouteIntent::CallEnded]);
        assert_eq!(h.relay.value("alice/status").as_deref(), Some("ONLINE"));
        // Kein EndCall zurück
        assert!(h.sent().is_empty());

        h.orch.place_call("bob", MediaKind::Audio).unwrap();
        assert_eq!(h.state(), NegotiationState::Offering);
    }

    #[test]
    fn test_hang_up_sends_end_call() {
        let mut h = harness();
        h.call_bob(MediaKind::Audio);
        h.sent();
        h.events();

        h.orch.hang_up().unwrap();
        assert_eq!(h.sent_types(), vec![MessageType::EndCall]);
        assert_eq!(
            h.events(),
            vec![CallEvent::CallEnded {
                remote: "bob".to_string(),
                reason: EndReason::LocalHangUp
            }]
        );
        assert_eq!(h.orch.hang_up(), Err(OrchestratorError::NoActiveCall));
    }

    #[test]
    fn test_reject_incoming_call() {
        let mut h = harness();
        assert_eq!(h.orch.reject(), Err(OrchestratorError::NoIncomingCall));

        h.deliver(SignalingMessage::start_call("alice".to_string(), MediaKind::Audio));
        h.orch.reject().unwrap();
        assert_eq!(h.sent_types(), vec![MessageType::EndCall]);
        assert_eq!(h.state(), NegotiationState::Ended);
    }

    #[test]
    fn test_create_failure_ends_session() {
        let mut h = harness();
        h.orch.place_call("bob", MediaKind::Audio).unwrap();
        h.sent();

        h.complete(MediaEventKind::DescriptionCreated(Err(
            MediaError::CreateDescription("no codecs".to_string()),
        )));
        assert_eq!(h.state(), NegotiationState::Ended);
        assert_eq!(h.sent_types(), vec![MessageType::EndCall]);
        let events = h.events();
        assert!(events.contains(&CallEvent::CallEnded {
            remote: "bob".to_string(),
            reason: EndReason::NegotiationFailed
        }));
    }

    #[test]
    fn test_remote_description_failure_is_not_fatal() {
        let mut h = harness();
        h.call_bob(MediaKind::Audio);

        h.complete(MediaEventKind::RemoteDescriptionApplied(Err(
            MediaError::InvalidSdp("garbage".to_string()),
        )));
        assert_eq!(h.state(), NegotiationState::AwaitingAnswer);
    }

    #[test]
    fn test_connection_failure_ends_call() {
        let mut h = harness();
        h.call_bob(MediaKind::Audio);
        h.sent();

        h.complete(MediaEventKind::ConnectivityChanged(PeerConnectivity::Failed));
        assert_eq!(h.state(), NegotiationState::Ended);
        assert_eq!(h.sent_types(), vec![MessageType::EndCall]);
    }

    #[test]
    fn test_stale_inputs_dropped() {
        let mut h = harness();

        // Alte Anrufanfrage aus der Mailbox
        let mut request = SignalingMessage::start_call("alice".to_string(), MediaKind::Audio)
            .stamped("bob");
        request.timestamp -= 120_000;
        h.orch.handle_relay_value(Some(request.encode().unwrap()));
        assert!(h.orch.session().is_none());

        // Nachricht an jemand anderen / von uns selbst
        h.deliver(SignalingMessage::start_call("carol".to_string(), MediaKind::Audio));
        let own = SignalingMessage::start_call("alice".to_string(), MediaKind::Audio)
            .stamped("alice")
            .encode()
            .unwrap();
        h.orch.handle_relay_value(Some(own));
        h.orch.handle_relay_value(Some("not json".to_string()));
        assert!(h.orch.session().is_none());

        // Completion eines früheren Anrufs
        h.call_bob(MediaKind::Audio);
        h.recorder.clear();
        h.orch.handle_media_event(MediaEvent::new(
            uuid::Uuid::new_v4(),
            MediaEventKind::ConnectivityChanged(PeerConnectivity::Connected),
        ));
        assert_eq!(h.state(), NegotiationState::AwaitingAnswer);
    }

    #[test]
    fn test_caller_receiving_offer_becomes_callee() {
        let mut h = harness();
        h.orch.place_call("bob", MediaKind::Video).unwrap();

        h.deliver(SignalingMessage::offer(
            "alice".to_string(),
            fake_sdp(MediaKind::Video),
        ));
        let session = h.orch.session().unwrap();
        assert_eq!(session.role, Role::Callee);
        assert_eq!(session.state, NegotiationState::Answering);

        h.complete(MediaEventKind::RemoteDescriptionApplied(Ok(SdpType::Offer)));
        assert_eq!(h.recorder.calls().last(), Some(&MediaCall::CreateAnswer));

        // Unser eigenes Offer wird nicht mehr gesendet
        h.sent();
        h.complete(MediaEventKind::LocalDescriptionApplied(Ok(
            SessionDescription::offer(fake_sdp(MediaKind::Video)),
        )));
        assert!(h.sent().is_empty());
    }

    #[test]
    fn test_offer_before_own_offer_is_created() {
        let mut h = live_harness();
        h.orch.place_call("bob", MediaKind::Video).unwrap();

        // Offer der Gegenseite trifft vor unserem DescriptionCreated ein
        h.deliver(SignalingMessage::offer(
            "alice".to_string(),
            fake_sdp(MediaKind::Video),
        ));
        h.pump();

        assert_eq!(h.state(), NegotiationState::Answering);
        let calls = h.recorder.calls();
        assert!(!calls.contains(&MediaCall::SetLocal(SdpType::Offer)));
        assert!(calls.contains(&MediaCall::CreateAnswer));
        assert!(calls.contains(&MediaCall::SetLocal(SdpType::Answer)));

        let sent = h.sent_types();
        assert!(sent.contains(&MessageType::Answer));
        assert!(!sent.contains(&MessageType::Offer));
        assert!(!sent.contains(&MessageType::EndCall));
    }

    #[test]
    fn test_offer_while_awaiting_answer_rolls_back() {
        let mut h = live_harness();
        h.orch.place_call("bob", MediaKind::Audio).unwrap();
        h.pump();
        assert_eq!(h.state(), NegotiationState::AwaitingAnswer);
        assert!(h.sent_types().contains(&MessageType::Offer));

        h.deliver(SignalingMessage::offer(
            "alice".to_string(),
            fake_sdp(MediaKind::Audio),
        ));
        h.pump();

        assert_eq!(h.state(), NegotiationState::Answering);
        let calls = h.recorder.calls();
        assert!(calls.contains(&MediaCall::Rollback));
        assert_eq!(calls.last(), Some(&MediaCall::SetLocal(SdpType::Answer)));
        assert_eq!(h.sent_types(), vec![MessageType::Answer]);
        assert!(h
            .events()
            .iter()
            .all(|e| !matches!(e, CallEvent::CallEnded { .. })));
    }

    #[test]
    fn test_send_failure_is_reported() {
        let mut h = harness();
        h.relay.set_offline(true);

        h.orch.place_call("bob", MediaKind::Audio).unwrap();
        assert_eq!(h.state(), NegotiationState::Offering);
        assert!(h
            .events()
            .iter()
            .any(|e| matches!(e, CallEvent::Error(_))));
    }

    #[test]
    fn test_mute_and_video_controls() {
        let mut h = harness();
        assert_eq!(h.orch.set_muted(true), Err(OrchestratorError::NoActiveCall));

        h.call_bob(MediaKind::Video);
        h.recorder.clear();
        h.orch.set_muted(true).unwrap();
        h.orch.set_video_enabled(false).unwrap();
        assert_eq!(
            h.recorder.calls(),
            vec![MediaCall::Muted(true), MediaCall::Video(false)]
        );
    }
}
