//! Skriptbare Fakes für Media Engine, Audio- und Bluetooth-Hardware

use crate::audio_route::{AudioHardware, BluetoothHardware};
use crate::call_engine::{
    CallId, MediaEngine, MediaError, MediaEvent, MediaEventKind, PeerConnectivity, SdpType,
    SessionDescription,
};
use crate::control::{ControlEvent, ControlSender};
use crate::signaling::{IceCandidate, MediaKind};
use parking_lot::Mutex;
use std::sync::Arc;

/// Minimales SDP mit den Medienzeilen der Anrufart
pub fn fake_sdp(kind: MediaKind) -> String {
    let mut sdp = String::from("v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\ns=-\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\n");
    if kind == MediaKind::Video {
        sdp.push_str("m=video 9 UDP/TLS/RTP/SAVPF 96\r\n");
    }
    sdp
}

// ============================================================================
// FAKE MEDIA ENGINE
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaCall {
    Prepare(MediaKind),
    CreateOffer,
    CreateAnswer,
    SetLocal(SdpType),
    SetRemote(SdpType),
    /// Eigenes Offer zugunsten eines Remote Offers verworfen
    Rollback,
    AddCandidate(String),
    Muted(bool),
    Video(bool),
    Release,
}

/// Signaling-Zustand einer Peer Connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum Signaling {
    #[default]
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
}

#[derive(Default)]
struct RecorderState {
    calls: Vec<MediaCall>,
    signaling: Signaling,
    call_id: Option<CallId>,
    kind: Option<MediaKind>,
    fail_prepare: bool,
    fail_create: bool,
    /// Gesetzt: Completions werden sofort gepostet
    control_tx: Option<ControlSender>,
}

/// Blick in die Fake Media Engine
#[derive(Clone, Default)]
pub struct MediaRecorder {
    state: Arc<Mutex<RecorderState>>,
}

impl MediaRecorder {
    pub fn calls(&self) -> Vec<MediaCall> {
        self.state.lock().calls.clone()
    }

    pub fn clear(&self) {
        self.state.lock().calls.clear();
    }

    pub fn call_id(&self) -> Option<CallId> {
        self.state.lock().call_id
    }

    pub fn fail_prepare(&self, fail: bool) {
        self.state.lock().fail_prepare = fail;
    }

    pub fn fail_create(&self, fail: bool) {
        self.state.lock().fail_create = fail;
    }

    /// Meldet die Transportverbindung für den laufenden Anruf
    pub fn connect(&self) {
        self.post(MediaEventKind::ConnectivityChanged(PeerConnectivity::Connected));
    }

    pub fn post(&self, kind: MediaEventKind) {
        let state = self.state.lock();
        if let (Some(tx), Some(call_id)) = (&state.control_tx, state.call_id) {
            let _ = tx.send(ControlEvent::Media(MediaEvent::new(call_id, kind)));
        }
    }
}

pub struct FakeMediaEngine {
    recorder: MediaRecorder,
}

impl FakeMediaEngine {
    /// Completions liefert der Test selbst
    pub fn new() -> (Self, MediaRecorder) {
        let recorder = MediaRecorder::default();
        (
            Self {
                recorder: recorder.clone(),
            },
            recorder,
        )
    }

    /// Completions gehen sofort in den Control-Kanal
    pub fn autocomplete(control_tx: ControlSender) -> (Self, MediaRecorder) {
        let (engine, recorder) = Self::new();
        recorder.state.lock().control_tx = Some(control_tx);
        (engine, recorder)
    }

    fn record(&self, call: MediaCall) {
        self.recorder.state.lock().calls.push(call);
    }

    fn complete(&self, call_id: CallId, kind: MediaEventKind) {
        let state = self.recorder.state.lock();
        if state.call_id != Some(call_id) {
            return;
        }
        if let Some(tx) = &state.control_tx {
            let _ = tx.send(ControlEvent::Media(MediaEvent::new(call_id, kind)));
        }
    }

    fn created(&self, call_id: CallId, sdp_type: SdpType) {
        let (fail, kind, signaling) = {
            let state = self.recorder.state.lock();
            (
                state.fail_create,
                state.kind.unwrap_or(MediaKind::Audio),
                state.signaling,
            )
        };
        let result = if fail {
            Err(MediaError::CreateDescription("scripted failure".to_string()))
        } else if sdp_type == SdpType::Answer && signaling != Signaling::HaveRemoteOffer {
            Err(MediaError::CreateDescription(format!(
                "cannot answer in {:?}",
                signaling
            )))
        } else {
            Ok(SessionDescription {
                sdp_type,
                sdp: fake_sdp(kind),
            })
        };
        self.complete(call_id, MediaEventKind::DescriptionCreated(result));
    }

    /// Übergänge wie bei einer echten Peer Connection
    fn transition(&self, local: bool, sdp_type: SdpType) -> Result<(), MediaError> {
        let mut state = self.recorder.state.lock();
        let next = match (state.signaling, local, sdp_type) {
            (Signaling::Stable, true, SdpType::Offer) => Signaling::HaveLocalOffer,
            (Signaling::HaveRemoteOffer, true, SdpType::Answer) => Signaling::Stable,
            (Signaling::Stable | Signaling::HaveRemoteOffer, false, SdpType::Offer) => {
                Signaling::HaveRemoteOffer
            }
            (Signaling::HaveLocalOffer, false, SdpType::Offer) => {
                state.calls.push(MediaCall::Rollback);
                Signaling::HaveRemoteOffer
            }
            (Signaling::HaveLocalOffer, false, SdpType::Answer) => Signaling::Stable,
            (current, _, _) => {
                return Err(MediaError::ApplyDescription(format!(
                    "invalid transition from {:?} applying {} {:?}",
                    current,
                    if local { "local" } else { "remote" },
                    sdp_type
                )))
            }
        };
        state.signaling = next;
        Ok(())
    }
}

impl MediaEngine for FakeMediaEngine {
    fn prepare(&mut self, call_id: CallId, kind: MediaKind) -> Result<(), MediaError> {
        self.record(MediaCall::Prepare(kind));
        let mut state = self.recorder.state.lock();
        if state.fail_prepare {
            return Err(MediaError::WebRTC("scripted failure".to_string()));
        }
        state.call_id = Some(call_id);
        state.kind = Some(kind);
        state.signaling = Signaling::Stable;
        Ok(())
    }

    fn create_offer(&mut self, call_id: CallId) {
        self.record(MediaCall::CreateOffer);
        self.created(call_id, SdpType::Offer);
    }

    fn create_answer(&mut self, call_id: CallId) {
        self.record(MediaCall::CreateAnswer);
        self.created(call_id, SdpType::Answer);
    }

    fn set_local_description(&mut self, call_id: CallId, description: SessionDescription) {
        self.record(MediaCall::SetLocal(description.sdp_type));
        let result = self
            .transition(true, description.sdp_type)
            .map(|_| description);
        self.complete(call_id, MediaEventKind::LocalDescriptionApplied(result));
    }

    fn set_remote_description(&mut self, call_id: CallId, description: SessionDescription) {
        self.record(MediaCall::SetRemote(description.sdp_type));
        let result = self
            .transition(false, description.sdp_type)
            .map(|_| description.sdp_type);
        self.complete(call_id, MediaEventKind::RemoteDescriptionApplied(result));
    }

    fn add_ice_candidate(&mut self, _call_id: CallId, candidate: IceCandidate) {
        self.record(MediaCall::AddCandidate(candidate.candidate));
    }

    fn set_audio_muted(&mut self, muted: bool) {
        self.record(MediaCall::Muted(muted));
    }

    fn set_video_enabled(&mut self, enabled: bool) {
        self.record(MediaCall::Video(enabled));
    }

    fn release(&mut self) {
        self.record(MediaCall::Release);
        let mut state = self.recorder.state.lock();
        state.call_id = None;
        state.signaling = Signaling::Stable;
    }
}

// ============================================================================
// FAKE AUDIO HARDWARE
// ============================================================================

#[derive(Debug, Default)]
struct AudioState {
    earpiece: bool,
    wired: bool,
    speakerphone_on: bool,
    microphone_mute: bool,
    communication_mode: bool,
    focus: bool,
    speaker_toggles: usize,
}

/// Geteilter Zustand, der Test behält einen Klon
#[derive(Clone, Default)]
pub struct FakeAudioHardware {
    state: Arc<Mutex<AudioState>>,
}

impl FakeAudioHardware {
    /// Telefon mit Hörer
    pub fn phone() -> Self {
        let hw = Self::default();
        hw.state.lock().earpiece = true;
        hw
    }

    /// Ohne Hörer
    pub fn desktop() -> Self {
        Self::default()
    }

    pub fn set_microphone_mute_raw(&self, mute: bool) {
        self.state.lock().microphone_mute = mute;
    }

    pub fn speakerphone_on(&self) -> bool {
        self.state.lock().speakerphone_on
    }

    pub fn microphone_mute(&self) -> bool {
        self.state.lock().microphone_mute
    }

    pub fn communication_mode(&self) -> bool {
        self.state.lock().communication_mode
    }

    pub fn has_focus(&self) -> bool {
        self.state.lock().focus
    }

    pub fn speaker_toggles(&self) -> usize {
        self.state.lock().speaker_toggles
    }
}

impl AudioHardware for FakeAudioHardware {
    fn has_earpiece(&self) -> bool {
        self.state.lock().earpiece
    }

    fn has_wired_headset(&self) -> bool {
        self.state.lock().wired
    }

    fn is_speakerphone_on(&self) -> bool {
        self.state.lock().speakerphone_on
    }

    fn set_speakerphone_on(&mut self, on: bool) {
        let mut state = self.state.lock();
        state.speakerphone_on = on;
        state.speaker_toggles += 1;
    }

    fn is_microphone_mute(&self) -> bool {
        self.state.lock().microphone_mute
    }

    fn set_microphone_mute(&mut self, mute: bool) {
        self.state.lock().microphone_mute = mute;
    }

    fn set_communication_mode(&mut self, enabled: bool) {
        self.state.lock().communication_mode = enabled;
    }

    fn request_audio_focus(&mut self) -> bool {
        self.state.lock().focus = true;
        true
    }

    fn abandon_audio_focus(&mut self) {
        self.state.lock().focus = false;
    }
}

// ============================================================================
// FAKE BLUETOOTH
// ============================================================================

#[derive(Debug, Default)]
struct BluetoothState {
    adapter: bool,
    sco_off_call: bool,
    profile_ok: bool,
    profile_open: bool,
    headsets: Vec<String>,
    audio_connected: bool,
    sco_starts: usize,
    sco_stops: usize,
}

#[derive(Clone, Default)]
pub struct FakeBluetooth {
    state: Arc<Mutex<BluetoothState>>,
}

impl FakeBluetooth {
    /// Kein Adapter
    pub fn absent() -> Self {
        Self::default()
    }

    /// Adapter mit einem gekoppelten Headset
    pub fn with_headset() -> Self {
        let bt = Self::default();
        {
            let mut state = bt.state.lock();
            state.adapter = true;
            state.sco_off_call = true;
            state.profile_ok = true;
            state.headsets = vec!["Headset".to_string()];
        }
        bt
    }

    pub fn set_profile_ok(&self, ok: bool) {
        self.state.lock().profile_ok = ok;
    }

    pub fn set_headsets(&self, headsets: Vec<String>) {
        self.state.lock().headsets = headsets;
    }

    pub fn set_audio_connected(&self, connected: bool) {
        self.state.lock().audio_connected = connected;
    }

    pub fn profile_open(&self) -> bool {
        self.state.lock().profile_open
    }

    pub fn sco_starts(&self) -> usize {
        self.state.lock().sco_starts
    }

    pub fn sco_stops(&self) -> usize {
        self.state.lock().sco_stops
    }
}

impl BluetoothHardware for FakeBluetooth {
    fn has_adapter(&self) -> bool {
        self.state.lock().adapter
    }

    fn is_sco_available_off_call(&self) -> bool {
        self.state.lock().sco_off_call
    }

    fn open_headset_profile(&mut self) -> bool {
        let mut state = self.state.lock();
        state.profile_open = state.profile_ok;
        state.profile_ok
    }

    fn close_headset_profile(&mut self) {
        self.state.lock().profile_open = false;
    }

    fn connected_headsets(&self) -> Vec<String> {
        self.state.lock().headsets.clone()
    }

    fn is_audio_connected(&self, device: &str) -> bool {
        let state = self.state.lock();
        state.audio_connected && state.headsets.iter().any(|h| h == device)
    }

    fn start_sco(&mut self) {
        self.state.lock().sco_starts += 1;
    }

    fn stop_sco(&mut self) {
        self.state.lock().sco_stops += 1;
    }
}
