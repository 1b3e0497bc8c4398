//! Test-Doubles für Transport und Medien

use super::media::{LocalMedia, MediaError, MediaSource};
use super::transport::{
    MediaTransport, SignalingState, TrackKind, TransportError, TransportEventSink,
    TransportFactory,
};
use crate::signaling::{IceCandidate, SdpKind, SessionDescription};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

// ============================================================================
// TRANSPORT
// ============================================================================

#[derive(Debug)]
pub(crate) struct FakeTransportState {
    pub signaling: SignalingState,
    pub local: Option<SessionDescription>,
    pub remote: Option<SessionDescription>,
    pub applied: Vec<IceCandidate>,
    pub closed: bool,
}

/// Sicht eines Tests auf einen erzeugten Fake-Transport
#[derive(Debug, Clone)]
pub(crate) struct FakeTransportHandle(Arc<Mutex<FakeTransportState>>);

impl FakeTransportHandle {
    pub fn applied_names(&self) -> Vec<String> {
        self.0
            .lock()
            .applied
            .iter()
            .map(|c| c.candidate.clone())
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        self.0.lock().closed
    }

    pub fn signaling_state(&self) -> SignalingState {
        self.0.lock().signaling
    }

    pub fn has_remote(&self) -> bool {
        self.0.lock().remote.is_some()
    }
}

struct FakeTransport {
    id: usize,
    state: Arc<Mutex<FakeTransportState>>,
    rejected: Vec<String>,
    events: TransportEventSink,
    emit_candidates: bool,
}

#[async_trait]
impl MediaTransport for FakeTransport {
    fn signaling_state(&self) -> SignalingState {
        self.state.lock().signaling
    }

    async fn has_remote_description(&self) -> bool {
        self.state.lock().remote.is_some()
    }

    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        Ok(SessionDescription::offer(format!("offer-{}", self.id)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        let state = self.state.lock();
        if state.signaling != SignalingState::HaveRemoteOffer {
            return Err(TransportError::WebRTC("no remote offer".to_string()));
        }
        Ok(SessionDescription::answer(format!("answer-{}", self.id)))
    }

    async fn set_local_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportError> {
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(TransportError::Closed);
            }
            state.signaling = match desc.kind {
                SdpKind::Offer => SignalingState::HaveLocalOffer,
                SdpKind::Answer => SignalingState::Stable,
            };
            state.local = Some(desc);
        }

        // ICE Gathering startet mit der Local Description
        if self.emit_candidates {
            self.events
                .local_candidate(IceCandidate::new(format!("local-{}", self.id)));
        }
        Ok(())
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(TransportError::Closed);
        }
        state.signaling = match (desc.kind, state.signaling) {
            (SdpKind::Offer, _) => SignalingState::HaveRemoteOffer,
            (SdpKind::Answer, SignalingState::HaveLocalOffer) => SignalingState::Stable,
            (SdpKind::Answer, other) => {
                return Err(TransportError::WebRTC(format!(
                    "answer in state {:?}",
                    other
                )))
            }
        };
        state.remote = Some(desc);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if state.remote.is_none() {
            return Err(TransportError::InvalidCandidate(
                "remote description not set".to_string(),
            ));
        }
        if self.rejected.contains(&candidate.candidate) {
            return Err(TransportError::InvalidCandidate(candidate.candidate));
        }
        state.applied.push(candidate);
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        state.closed = true;
        state.signaling = SignalingState::Closed;
        Ok(())
    }
}

/// Erzeugt Fake-Transports und merkt sich jeden davon
#[derive(Default)]
pub(crate) struct FakeTransportFactory {
    created: Mutex<Vec<FakeTransportHandle>>,
    rejected: Vec<String>,
    silent: bool,
}

impl FakeTransportFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Candidates mit diesem Inhalt schlagen beim Anwenden fehl
    pub fn rejecting(mut self, candidate: &str) -> Self {
        self.rejected.push(candidate.to_string());
        self
    }

    /// Keine lokalen Candidates erzeugen
    pub fn silent(mut self) -> Self {
        self.silent = true;
        self
    }

    pub fn created(&self) -> usize {
        self.created.lock().len()
    }

    pub fn live(&self) -> usize {
        self.created.lock().iter().filter(|t| !t.is_closed()).count()
    }

    pub fn latest(&self) -> FakeTransportHandle {
        self.created
            .lock()
            .last()
            .cloned()
            .expect("no transport created yet")
    }
}

#[async_trait]
impl TransportFactory for FakeTransportFactory {
    async fn create(
        &self,
        _tracks: &[TrackKind],
        events: TransportEventSink,
    ) -> Result<Box<dyn MediaTransport>, TransportError> {
        let state = Arc::new(Mutex::new(FakeTransportState {
            signaling: SignalingState::Stable,
            local: None,
            remote: None,
            applied: Vec::new(),
            closed: false,
        }));

        let mut created = self.created.lock();
        created.push(FakeTransportHandle(Arc::clone(&state)));

        Ok(Box::new(FakeTransport {
            id: created.len(),
            state,
            rejected: self.rejected.clone(),
            events,
            emit_candidates: !self.silent,
        }))
    }
}

// ============================================================================
// MEDIA
// ============================================================================

/// Medienquelle, die auf Wunsch den Zugriff verweigert
#[derive(Default)]
pub(crate) struct FakeMediaSource {
    deny: bool,
    acquired: AtomicUsize,
    stopped: Arc<AtomicUsize>,
}

impl FakeMediaSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn denying() -> Self {
        Self {
            deny: true,
            ..Self::default()
        }
    }

    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn stopped(&self) -> usize {
        self.stopped.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaSource for FakeMediaSource {
    async fn acquire(&self) -> Result<Box<dyn LocalMedia>, MediaError> {
        if self.deny {
            return Err(MediaError::Denied("permission denied".to_string()));
        }
        self.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeMedia {
            audio: true,
            video: true,
            stopped: Arc::clone(&self.stopped),
        }))
    }
}

struct FakeMedia {
    audio: bool,
    video: bool,
    stopped: Arc<AtomicUsize>,
}

impl LocalMedia for FakeMedia {
    fn tracks(&self) -> Vec<TrackKind> {
        vec![TrackKind::Audio, TrackKind::Video]
    }

    fn is_audio_enabled(&self) -> bool {
        self.audio
    }

    fn set_audio_enabled(&mut self, enabled: bool) {
        self.audio = enabled;
    }

    fn is_video_enabled(&self) -> bool {
        self.video
    }

    fn set_video_enabled(&mut self, enabled: bool) {
        self.video = enabled;
    }

    fn stop(&mut self) {
        self.stopped.fetch_add(1, Ordering::SeqCst);
    }
}
