//! Endpoint - die Control-Schleife
//!
//! Eine Task besitzt Orchestrator und Audio Route Manager. Relay-Werte,
//! Media-Completions, Hardware-Ereignisse, Timer und Intents kommen alle
//! über denselben Kanal und werden nacheinander verarbeitet, damit kein
//! Übergang mit einem anderen konkurriert.

use crate::audio_route::{
    AudioDevice, AudioHardware, AudioRouteManager, AudioRouteState, BluetoothHardware,
    BluetoothLinkState, DeviceEvent,
};
use crate::call_engine::{MediaEngine, NegotiationOrchestrator, NegotiationState, OrchestratorError};
use crate::config::Config;
use crate::control::{
    control_channel, CallEvent, CallIntent, ControlEvent, ControlReceiver, ControlSender,
};
use crate::signaling::{log_off, mailbox_key, MediaKind, SignalingTransport, TransportError, ValueReceiver};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;

/// Kapazität des Event-Kanals
const EVENT_CAPACITY: usize = 100;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EndpointError {
    #[error("Endpoint is shut down")]
    Closed,

    #[error(transparent)]
    Call(#[from] OrchestratorError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

// ============================================================================
// SNAPSHOT
// ============================================================================

/// Zustand des Endpunkts zu einem Zeitpunkt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointSnapshot {
    pub identity: String,
    pub negotiation: Option<NegotiationState>,
    pub remote: Option<String>,
    pub route: AudioRouteState,
    pub bluetooth: BluetoothLinkState,
    /// Laufender Anruf aus Sicht des Audio Route Managers
    pub call_active: Option<MediaKind>,
}

// ============================================================================
// ENDPOINT
// ============================================================================

pub struct Endpoint {
    identity: String,
    transport: Arc<dyn SignalingTransport>,
    orchestrator: NegotiationOrchestrator,
    route: AudioRouteManager,
    control_tx: ControlSender,
    control_rx: ControlReceiver,
}

impl Endpoint {
    /// Baut einen Endpunkt für `identity`
    ///
    /// `media` bekommt den Control-Sender, über den die Media Engine ihre
    /// Completions meldet.
    pub fn new<F>(
        identity: &str,
        config: &Config,
        transport: Arc<dyn SignalingTransport>,
        media: F,
        audio: Box<dyn AudioHardware>,
        bluetooth: Box<dyn BluetoothHardware>,
    ) -> (Self, EndpointHandle)
    where
        F: FnOnce(ControlSender) -> Box<dyn MediaEngine>,
    {
        let (control_tx, control_rx) = control_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let orchestrator = NegotiationOrchestrator::new(
            identity.to_string(),
            config.signaling.clone(),
            Arc::clone(&transport),
            media(control_tx.clone()),
            control_tx.clone(),
            events.clone(),
        );
        let route = AudioRouteManager::new(
            audio,
            bluetooth,
            &config.audio,
            &config.bluetooth,
            control_tx.clone(),
            events.clone(),
        );

        let handle = EndpointHandle {
            control_tx: control_tx.clone(),
            events,
        };

        let endpoint = Self {
            identity: identity.to_string(),
            transport,
            orchestrator,
            route,
            control_tx,
            control_rx,
        };
        (endpoint, handle)
    }

    /// Abonniert die eigene Mailbox und startet die Control-Schleife
    pub fn spawn(self) -> Result<JoinHandle<()>, EndpointError> {
        let mailbox = self.transport.subscribe(&mailbox_key(&self.identity))?;
        tokio::spawn(forward_relay(mailbox, self.control_tx.clone()));
        Ok(tokio::spawn(self.run()))
    }

    async fn run(mut self) {
        tracing::info!("Endpoint {} running", self.identity);

        while let Some(event) = self.control_rx.recv().await {
            if !self.dispatch(event) {
                break;
            }
        }

        self.teardown();
        tracing::info!("Endpoint {} stopped", self.identity);
    }

    /// `false` beendet die Schleife
    fn dispatch(&mut self, event: ControlEvent) -> bool {
        match event {
            ControlEvent::Intent { intent, reply } => {
                let result = self.handle_intent(intent);
                match reply {
                    Some(reply) => {
                        let _ = reply.send(result);
                    }
                    None => {
                        if let Err(e) = result {
                            tracing::warn!("Intent failed: {}", e);
                        }
                    }
                }
            }
            ControlEvent::Relay(value) => self.orchestrator.handle_relay_value(value),
            ControlEvent::Media(event) => self.orchestrator.handle_media_event(event),
            ControlEvent::Device(event) => self.route.handle_device_event(event),
            ControlEvent::Route(intent) => self.route.handle_route_intent(intent),
            ControlEvent::ScoTimeout(token) => self.route.handle_sco_timeout(token),
            ControlEvent::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            ControlEvent::Shutdown => return false,
        }
        true
    }

    fn handle_intent(&mut self, intent: CallIntent) -> Result<(), OrchestratorError> {
        match intent {
            CallIntent::PlaceCall { target, kind } => self.orchestrator.place_call(&target, kind),
            CallIntent::Accept => self.orchestrator.accept(),
            CallIntent::Reject => self.orchestrator.reject(),
            CallIntent::HangUp => self.orchestrator.hang_up(),
            CallIntent::SetMuted(muted) => self.orchestrator.set_muted(muted),
            CallIntent::SetVideoEnabled(enabled) => self.orchestrator.set_video_enabled(enabled),
            CallIntent::SelectAudioDevice(device) => {
                self.route.select_audio_device(device);
                Ok(())
            }
            CallIntent::SetDefaultAudioDevice(device) => {
                self.route.set_default_audio_device(device);
                Ok(())
            }
        }
    }

    fn snapshot(&self) -> EndpointSnapshot {
        let session = self.orchestrator.session();
        EndpointSnapshot {
            identity: self.identity.clone(),
            negotiation: session.map(|s| s.state),
            remote: session.map(|s| s.remote_identity.clone()),
            route: self.route.state().clone(),
            bluetooth: self.route.bluetooth_state(),
            call_active: self.route.active_call(),
        }
    }

    fn teardown(&mut self) {
        self.orchestrator.shutdown();
        self.route.release();
        if let Err(e) = log_off(self.transport.as_ref(), &self.identity) {
            tracing::warn!("Failed to log off: {}", e);
        }
    }
}

/// Leitet Mailbox-Werte in die Control-Schleife
async fn forward_relay(mut mailbox: ValueReceiver, control_tx: ControlSender) {
    while let Some(value) = mailbox.recv().await {
        if control_tx.send(ControlEvent::Relay(value)).is_err() {
            break;
        }
    }
    tracing::debug!("Mailbox subscription closed");
}

// ============================================================================
// HANDLE
// ============================================================================

/// Intent-API für UI und Session-Steuerung
#[derive(Clone)]
pub struct EndpointHandle {
    control_tx: ControlSender,
    events: broadcast::Sender<CallEvent>,
}

impl EndpointHandle {
    /// Gibt einen Event-Receiver zurück
    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }

    pub async fn place_call(&self, target: &str, kind: MediaKind) -> Result<(), EndpointError> {
        self.request(CallIntent::PlaceCall {
            target: target.to_string(),
            kind,
        })
        .await
    }

    pub async fn accept(&self) -> Result<(), EndpointError> {
        self.request(CallIntent::Accept).await
    }

    pub async fn reject(&self) -> Result<(), EndpointError> {
        self.request(CallIntent::Reject).await
    }

    pub async fn hang_up(&self) -> Result<(), EndpointError> {
        self.request(CallIntent::HangUp).await
    }

    pub async fn set_muted(&self, muted: bool) -> Result<(), EndpointError> {
        self.request(CallIntent::SetMuted(muted)).await
    }

    pub async fn set_video_enabled(&self, enabled: bool) -> Result<(), EndpointError> {
        self.request(CallIntent::SetVideoEnabled(enabled)).await
    }

    pub async fn select_audio_device(&self, device: AudioDevice) -> Result<(), EndpointError> {
        self.request(CallIntent::SelectAudioDevice(device)).await
    }

    pub async fn set_default_audio_device(&self, device: AudioDevice) -> Result<(), EndpointError> {
        self.request(CallIntent::SetDefaultAudioDevice(device)).await
    }

    /// Hardware-Callback in die Control-Schleife einreihen
    pub fn device_event(&self, event: DeviceEvent) -> Result<(), EndpointError> {
        self.post(ControlEvent::Device(event))
    }

    pub async fn snapshot(&self) -> Result<EndpointSnapshot, EndpointError> {
        let (tx, rx) = oneshot::channel();
        self.post(ControlEvent::Snapshot(tx))?;
        rx.await.map_err(|_| EndpointError::Closed)
    }

    /// Beendet einen laufenden Anruf und stoppt die Schleife
    pub fn shutdown(&self) {
        let _ = self.control_tx.send(ControlEvent::Shutdown);
    }

    async fn request(&self, intent: CallIntent) -> Result<(), EndpointError> {
        let (tx, rx) = oneshot::channel();
        self.post(ControlEvent::Intent {
            intent,
            reply: Some(tx),
        })?;
        rx.await.map_err(|_| EndpointError::Closed)??;
        Ok(())
    }

    fn post(&self, event: ControlEvent) -> Result<(), EndpointError> {
        self.control_tx
            .send(event)
            .map_err(|_| EndpointError::Closed)
    }
}

// ============================================================================
// TESTS
// ============================================================================
