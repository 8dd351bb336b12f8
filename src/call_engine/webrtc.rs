//! WebRTC Media Engine
//!
//! Implementiert [`MediaEngine`] mit dem `webrtc` Crate. Pro Anruf läuft
//! eine Worker-Task, die die Peer Connection besitzt und Kommandos der
//! Reihe nach abarbeitet. Ergebnisse und Callbacks gehen als
//! [`ControlEvent::Media`] zurück in die Control-Schleife.
//!
//! Capture und Playback sind nicht Teil dieses Adapters: die lokalen
//! Tracks sind `TrackLocalStaticRTP` und werden von außen gespeist.

use super::media::{
    MediaEngine, MediaError, MediaEvent, MediaEventKind, PeerConnectivity, SdpType,
    SessionDescription,
};
use super::session::CallId;
use crate::config::IceServerConfig;
use crate::control::{ControlEvent, ControlSender};
use crate::signaling::{IceCandidate, MediaKind};
use std::sync::Arc;
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine as RtcMediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

/// Opus Sample Rate
const AUDIO_CLOCK_RATE: u32 = 48000;

/// RTP Clock für Video
const VIDEO_CLOCK_RATE: u32 = 90000;

const STREAM_ID: &str = "relaycall";

/// Wandelt die konfigurierten STUN/TURN Server um
pub fn ice_servers_from_config(servers: &[IceServerConfig]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|s| RTCIceServer {
            urls: s.urls.clone(),
            username: s.username.clone(),
            credential: s.credential.clone(),
            ..Default::default()
        })
        .collect()
}

// ============================================================================
// COMMANDS
// ============================================================================

#[derive(Debug)]
enum PeerCommand {
    CreateOffer,
    CreateAnswer,
    SetLocal(SessionDescription),
    SetRemote(SessionDescription),
    AddCandidate(IceCandidate),
    SetAudioMuted(bool),
    SetVideoEnabled(bool),
    Close,
}

struct PeerWorker {
    call_id: CallId,
    commands: mpsc::UnboundedSender<PeerCommand>,
}

// ============================================================================
// MEDIA ENGINE
// ============================================================================

pub struct WebRtcMediaEngine {
    ice_servers: Vec<RTCIceServer>,
    control_tx: ControlSender,
    worker: Option<PeerWorker>,
}

impl WebRtcMediaEngine {
    pub fn new(ice_servers: &[IceServerConfig], control_tx: ControlSender) -> Self {
        Self {
            ice_servers: ice_servers_from_config(ice_servers),
            control_tx,
            worker: None,
        }
    }

    /// Schickt ein Kommando an den Worker des Anrufs
    fn command(&self, call_id: CallId, command: PeerCommand) {
        match &self.worker {
            Some(worker) if worker.call_id == call_id => {
                if worker.commands.send(command).is_err() {
                    tracing::warn!("Peer worker of call {} is gone", call_id);
                }
            }
            _ => tracing::debug!("No media pipeline for call {}, dropping {:?}", call_id, command),
        }
    }

    fn command_current(&self, command: PeerCommand) {
        if let Some(worker) = &self.worker {
            let _ = worker.commands.send(command);
        }
    }
}

impl MediaEngine for WebRtcMediaEngine {
    fn prepare(&mut self, call_id: CallId, kind: MediaKind) -> Result<(), MediaError> {
        self.release();

        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| MediaError::WebRTC(format!("no async runtime: {}", e)))?;

        let (tx, rx) = mpsc::unbounded_channel();
        runtime.spawn(run_peer(
            call_id,
            kind,
            self.ice_servers.clone(),
            self.control_tx.clone(),
            rx,
        ));

        self.worker = Some(PeerWorker {
            call_id,
            commands: tx,
        });
        tracing::debug!("Prepared {:?} pipeline for call {}", kind, call_id);
        Ok(())
    }

    fn create_offer(&mut self, call_id: CallId) {
        self.command(call_id, PeerCommand::CreateOffer);
    }

    fn create_answer(&mut self, call_id: CallId) {
        self.command(call_id, PeerCommand::CreateAnswer);
    }

    fn set_local_description(&mut self, call_id: CallId, description: SessionDescription) {
        self.command(call_id, PeerCommand::SetLocal(description));
    }

    fn set_remote_description(&mut self, call_id: CallId, description: SessionDescription) {
        self.command(call_id, PeerCommand::SetRemote(description));
    }

    fn add_ice_candidate(&mut self, call_id: CallId, candidate: IceCandidate) {
        self.command(call_id, PeerCommand::AddCandidate(candidate));
    }

    fn set_audio_muted(&mut self, muted: bool) {
        self.command_current(PeerCommand::SetAudioMuted(muted));
    }

    fn set_video_enabled(&mut self, enabled: bool) {
        self.command_current(PeerCommand::SetVideoEnabled(enabled));
    }

    fn release(&mut self) {
        if let Some(worker) = self.worker.take() {
            tracing::debug!("Releasing media pipeline of call {}", worker.call_id);
            let _ = worker.commands.send(PeerCommand::Close);
        }
    }
}

impl Drop for WebRtcMediaEngine {
    fn drop(&mut self) {
        self.release();
    }
}

// ============================================================================
// PEER WORKER
// ============================================================================

async fn run_peer(
    call_id: CallId,
    kind: MediaKind,
    ice_servers: Vec<RTCIceServer>,
    control_tx: ControlSender,
    mut commands: mpsc::UnboundedReceiver<PeerCommand>,
) {
    let mut peer = match PeerSession::open(call_id, kind, ice_servers, control_tx.clone()).await {
        Ok(peer) => peer,
        Err(e) => {
            tracing::error!("Failed to create peer connection: {}", e);
            let _ = control_tx.send(ControlEvent::Media(MediaEvent::new(
                call_id,
                MediaEventKind::ConnectivityChanged(PeerConnectivity::Failed),
            )));
            return;
        }
    };

    while let Some(command) = commands.recv().await {
        if matches!(command, PeerCommand::Close) {
            break;
        }
        peer.execute(command).await;
    }

    peer.close().await;
}

struct LocalTrack {
    track: Arc<TrackLocalStaticRTP>,
    sender: Arc<RTCRtpSender>,
}

impl LocalTrack {
    async fn add(
        pc: &RTCPeerConnection,
        mime_type: &str,
        clock_rate: u32,
        channels: u16,
        id: &str,
    ) -> Result<Self, MediaError> {
        let track = Arc::new(TrackLocalStaticRTP::new(
            RTCRtpCodecCapability {
                mime_type: mime_type.to_string(),
                clock_rate,
                channels,
                ..Default::default()
            },
            id.to_string(),
            STREAM_ID.to_string(),
        ));

        let sender = pc
            .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| MediaError::WebRTC(e.to_string()))?;

        Ok(Self { track, sender })
    }

    /// Track an- oder abhängen, ohne neu auszuhandeln
    async fn set_enabled(&self, enabled: bool) {
        let track = enabled.then(|| Arc::clone(&self.track) as Arc<dyn TrackLocal + Send + Sync>);
        if let Err(e) = self.sender.replace_track(track).await {
            tracing::warn!("Failed to replace track: {}", e);
        }
    }
}

struct PeerSession {
    call_id: CallId,
    pc: Arc<RTCPeerConnection>,
    audio: LocalTrack,
    video: Option<LocalTrack>,
    /// Kandidaten vor der Remote Description
    pending_candidates: Vec<RTCIceCandidateInit>,
    control_tx: ControlSender,
}

impl PeerSession {
    async fn open(
        call_id: CallId,
        kind: MediaKind,
        ice_servers: Vec<RTCIceServer>,
        control_tx: ControlSender,
    ) -> Result<Self, MediaError> {
        let mut media_engine = RtcMediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| MediaError::WebRTC(e.to_string()))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| MediaError::WebRTC(e.to_string()))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        let pc = Arc::new(
            api.new_peer_connection(config)
                .await
                .map_err(|e| MediaError::WebRTC(e.to_string()))?,
        );

        let audio = LocalTrack::add(&pc, MIME_TYPE_OPUS, AUDIO_CLOCK_RATE, 1, "audio").await?;
        let video = match kind {
            MediaKind::Video => {
                Some(LocalTrack::add(&pc, MIME_TYPE_VP8, VIDEO_CLOCK_RATE, 0, "video").await?)
            }
            MediaKind::Audio => None,
        };

        let session = Self {
            call_id,
            pc,
            audio,
            video,
            pending_candidates: Vec::new(),
            control_tx,
        };
        session.register_handlers();
        Ok(session)
    }

    fn register_handlers(&self) {
        let call_id = self.call_id;

        let tx = self.control_tx.clone();
        self.pc
            .on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                tracing::info!("Peer connection state: {:?}", state);
                let connectivity = match state {
                    RTCPeerConnectionState::Connecting => PeerConnectivity::Connecting,
                    RTCPeerConnectionState::Connected => PeerConnectivity::Connected,
                    RTCPeerConnectionState::Disconnected => PeerConnectivity::Disconnected,
                    RTCPeerConnectionState::Failed => PeerConnectivity::Failed,
                    RTCPeerConnectionState::Closed => PeerConnectivity::Closed,
                    _ => PeerConnectivity::New,
                };
                post(&tx, call_id, MediaEventKind::ConnectivityChanged(connectivity));
                Box::pin(async {})
            }));

        let tx = self.control_tx.clone();
        self.pc
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                if let Some(candidate) = candidate {
                    match candidate.to_json() {
                        Ok(init) => post(
                            &tx,
                            call_id,
                            MediaEventKind::IceCandidateDiscovered(IceCandidate {
                                sdp_mid: init.sdp_mid,
                                sdp_m_line_index: init.sdp_mline_index,
                                candidate: init.candidate,
                            }),
                        ),
                        Err(e) => tracing::warn!("Cannot serialize local candidate: {}", e),
                    }
                }
                Box::pin(async {})
            }));

        let tx = self.control_tx.clone();
        self.pc.on_track(Box::new(move |track: Arc<TrackRemote>, _, _| {
            let kind = match track.kind() {
                RTPCodecType::Video => MediaKind::Video,
                _ => MediaKind::Audio,
            };
            tracing::info!("Received track: {:?}", track.codec());
            post(&tx, call_id, MediaEventKind::RemoteStreamAdded(kind));
            Box::pin(async {})
        }));
    }

    async fn execute(&mut self, command: PeerCommand) {
        match command {
            PeerCommand::CreateOffer => {
                let result = self
                    .pc
                    .create_offer(None)
                    .await
                    .map(|offer| SessionDescription::offer(offer.sdp))
                    .map_err(|e| MediaError::CreateDescription(e.to_string()));
                self.post(MediaEventKind::DescriptionCreated(result));
            }
            PeerCommand::CreateAnswer => {
                let result = self
                    .pc
                    .create_answer(None)
                    .await
                    .map(|answer| SessionDescription::answer(answer.sdp))
                    .map_err(|e| MediaError::CreateDescription(e.to_string()));
                self.post(MediaEventKind::DescriptionCreated(result));
            }
            PeerCommand::SetLocal(description) => {
                let result = self.set_local(description).await;
                self.post(MediaEventKind::LocalDescriptionApplied(result));
            }
            PeerCommand::SetRemote(description) => {
                let result = self.set_remote(description).await;
                self.post(MediaEventKind::RemoteDescriptionApplied(result));
            }
            PeerCommand::AddCandidate(candidate) => self.add_candidate(candidate).await,
            PeerCommand::SetAudioMuted(muted) => self.audio.set_enabled(!muted).await,
            PeerCommand::SetVideoEnabled(enabled) => match &self.video {
                Some(video) => video.set_enabled(enabled).await,
                None => tracing::debug!("Audio call has no video track"),
            },
            PeerCommand::Close => {}
        }
    }

    async fn set_local(
        &self,
        description: SessionDescription,
    ) -> Result<SessionDescription, MediaError> {
        let rtc = to_rtc(&description)?;
        self.pc
            .set_local_description(rtc)
            .await
            .map_err(|e| MediaError::ApplyDescription(e.to_string()))?;
        Ok(description)
    }

    async fn set_remote(&mut self, description: SessionDescription) -> Result<SdpType, MediaError> {
        let rtc = to_rtc(&description)?;
        if description.sdp_type == SdpType::Offer
            && self.pc.signaling_state() == RTCSignalingState::HaveLocalOffer
        {
            self.rollback().await?;
        }
        self.pc
            .set_remote_description(rtc)
            .await
            .map_err(|e| MediaError::ApplyDescription(e.to_string()))?;

        for candidate in std::mem::take(&mut self.pending_candidates) {
            if let Err(e) = self.pc.add_ice_candidate(candidate).await {
                tracing::warn!("Failed to add buffered candidate: {}", e);
            }
        }
        Ok(description.sdp_type)
    }

    /// Verwirft das eigene, noch unbeantwortete Offer
    async fn rollback(&self) -> Result<(), MediaError> {
        let mut rollback = RTCSessionDescription::default();
        rollback.sdp_type = RTCSdpType::Rollback;
        rollback.sdp = self
            .pc
            .local_description()
            .await
            .map(|d| d.sdp)
            .unwrap_or_default();
        tracing::info!("Rolling back local offer for remote offer");
        self.pc
            .set_local_description(rollback)
            .await
            .map_err(|e| MediaError::ApplyDescription(e.to_string()))
    }

    async fn add_candidate(&mut self, candidate: IceCandidate) {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_m_line_index,
            username_fragment: None,
        };

        if self.pc.remote_description().await.is_none() {
            tracing::debug!("Buffering candidate until remote description is set");
            self.pending_candidates.push(init);
            return;
        }

        if let Err(e) = self.pc.add_ice_candidate(init).await {
            tracing::warn!("Failed to add candidate: {}", e);
        }
    }

    fn post(&self, kind: MediaEventKind) {
        post(&self.control_tx, self.call_id, kind);
    }

    async fn close(self) {
        if let Err(e) = self.pc.close().await {
            tracing::warn!("Failed to close peer connection: {}", e);
        }
        tracing::debug!("Peer connection of call {} closed", self.call_id);
    }
}

fn post(tx: &ControlSender, call_id: CallId, kind: MediaEventKind) {
    let _ = tx.send(ControlEvent::Media(MediaEvent::new(call_id, kind)));
}

fn to_rtc(description: &SessionDescription) -> Result<RTCSessionDescription, MediaError> {
    let sdp = description.sdp.clone();
    match description.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(sdp),
        SdpType::Answer => RTCSessionDescription::answer(sdp),
    }
    .map_err(|e| MediaError::InvalidSdp(e.to_string()))
}

// ============================================================================
// TESTS
// ============================================================================
