//! Peer Session
//!
//! Besitzt für genau einen Call den Transport, die lokalen Medien und den
//! Negotiation Buffer. Offer/Answer und ICE Candidates der Gegenseite laufen
//! hier durch; Loopback-Nachrichten (eigene Events, vom Relay an den ganzen
//! Raum verteilt) werden vor jeder Zustandsänderung verworfen.

use super::buffer::{CandidateBuffer, DrainReport};
use super::media::{LocalMedia, MediaError, MediaSource};
use super::transport::{
    MediaTransport, SignalingState, TransportError, TransportEvent, TransportEventSink,
    TransportFactory,
};
use crate::database::CallDirection;
use crate::identity::UserCode;
use crate::signaling::{
    ClientMessage, IceCandidate, RelayChannel, SessionDescription, SignalingError,
};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Media access denied: {0}")]
    MediaAccessDenied(#[from] MediaError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Relay error: {0}")]
    Relay(#[from] SignalingError),

    #[error("No active peer session")]
    NoSession,
}

// ============================================================================
// CALL CONTEXT
// ============================================================================

/// Welche Seite das erste Offer erzeugt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationRole {
    /// Anrufer: erzeugt das Offer sobald angenommen wurde
    Offerer,
    /// Angerufener: wartet auf das Offer
    Answerer,
}

/// Übergabe von der Invitation State Machine an die Peer Session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallContext {
    pub room_id: String,
    pub peer_code: UserCode,
    pub direction: CallDirection,
    pub role: NegotiationRole,
}

// ============================================================================
// PEER SESSION
// ============================================================================

pub struct PeerSession {
    relay: Arc<dyn RelayChannel>,
    transports: Arc<dyn TransportFactory>,
    media_source: Arc<dyn MediaSource>,
    events: mpsc::UnboundedSender<TransportEvent>,

    room_id: Option<String>,
    media: Option<Box<dyn LocalMedia>>,
    transport: Option<Box<dyn MediaTransport>>,
    /// Zählt Transport-Neuaufbauten, Events älterer Generationen werden verworfen
    generation: u64,
    buffer: CandidateBuffer,
    call_started: Option<Instant>,
}

impl PeerSession {
    pub fn new(
        relay: Arc<dyn RelayChannel>,
        transports: Arc<dyn TransportFactory>,
        media_source: Arc<dyn MediaSource>,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Self {
        Self {
            relay,
            transports,
            media_source,
            events,
            room_id: None,
            media: None,
            transport: None,
            generation: 0,
            buffer: CandidateBuffer::new(),
            call_started: None,
        }
    }

    /// Beginnt eine Session für einen angenommenen Call
    ///
    /// Der Offerer baut sofort Transport + Offer auf, der Answerer nur den
    /// Transport und wartet auf das Offer der Gegenseite.
    pub async fn start(&mut self, context: CallContext) -> Result<(), SessionError> {
        let discarded = self.buffer.reset();
        if discarded > 0 {
            tracing::debug!("Discarded {} stale ICE candidates", discarded);
        }

        tracing::info!(
            "Starting peer session in room {} as {:?}",
            context.room_id,
            context.role
        );
        self.room_id = Some(context.room_id);
        self.call_started = None;

        self.ensure_session().await?;

        match context.role {
            NegotiationRole::Offerer => {
                self.start_offer().await?;
            }
            NegotiationRole::Answerer => {
                tracing::info!("Waiting for offer from caller");
            }
        }

        Ok(())
    }

    /// Baut einen frischen Transport auf
    ///
    /// Ein bestehender Transport wird vorher geschlossen. Die lokalen Medien
    /// werden wiederverwendet, falls schon vorhanden; schlägt der Zugriff
    /// fehl, wird kein Transport erzeugt.
    pub async fn ensure_session(&mut self) -> Result<(), SessionError> {
        if let Some(old) = self.transport.take() {
            tracing::info!("Closing existing peer connection for fresh start");
            if let Err(e) = old.close().await {
                tracing::warn!("Failed to close old peer connection: {}", e);
            }
        }

        if self.media.is_none() {
            match self.media_source.acquire().await {
                Ok(media) => self.media = Some(media),
                Err(e) => {
                    tracing::error!("Failed to acquire local media: {}", e);
                    return Err(e.into());
                }
            }
        }

        let tracks = self
            .media
            .as_ref()
            .map(|m| m.tracks())
            .unwrap_or_default();

        self.generation += 1;
        let sink = TransportEventSink::new(self.generation, self.events.clone());
        let transport = self.transports.create(&tracks, sink).await?;
        self.transport = Some(transport);

        Ok(())
    }

    /// Erzeugt und versendet ein Offer, falls der Transport `stable` ist
    ///
    /// Gibt `false` zurück, wenn das Offer übersprungen wurde.
    pub async fn start_offer(&mut self) -> Result<bool, SessionError> {
        let room_id = self.room_id.clone().ok_or(SessionError::NoSession)?;
        let transport = self.transport.as_ref().ok_or(SessionError::NoSession)?;

        let state = transport.signaling_state();
        if state != SignalingState::Stable {
            tracing::warn!("Skipping offer, signaling state is {:?}", state);
            return Ok(false);
        }

        tracing::info!("Creating offer for room {}", room_id);
        let offer = transport.create_offer().await?;
        transport.set_local_description(offer.clone()).await?;

        self.relay.send(ClientMessage::Offer {
            room_id,
            sdp: offer,
        })?;

        self.call_started = Some(Instant::now());
        Ok(true)
    }

    /// Verarbeitet ein Offer der Gegenseite und beantwortet es
    pub async fn handle_remote_offer(
        &mut self,
        from: &str,
        room_id: &str,
        sdp: SessionDescription,
    ) -> Result<(), SessionError> {
        if self.is_loopback(from) {
            tracing::debug!("Ignoring own offer");
            return Ok(());
        }
        if !self.accepts_room(room_id) {
            tracing::warn!("Ignoring offer for unknown room {}", room_id);
            return Ok(());
        }

        tracing::info!("Received offer from {}", from);
        self.ensure_session().await?;

        let transport = self.transport.as_ref().ok_or(SessionError::NoSession)?;

        let state = transport.signaling_state();
        if state != SignalingState::Stable {
            tracing::warn!("Peer connection not stable, current state: {:?}", state);
        }

        transport.set_remote_description(sdp).await?;
        log_drain(self.buffer.drain(transport.as_ref()).await);

        let answer = transport.create_answer().await?;
        transport.set_local_description(answer.clone()).await?;

        self.relay.send(ClientMessage::Answer {
            room_id: room_id.to_string(),
            sdp: answer,
        })?;

        // Neuverhandlungen setzen die Gesprächsdauer nicht zurück
        self.call_started.get_or_insert_with(Instant::now);
        Ok(())
    }

    /// Verarbeitet das Answer der Gegenseite
    ///
    /// Nur im Zustand `have-local-offer` wird es angewendet, sonst verworfen.
    pub async fn handle_remote_answer(
        &mut self,
        from: &str,
        room_id: &str,
        sdp: SessionDescription,
    ) -> Result<(), SessionError> {
        if self.is_loopback(from) {
            tracing::debug!("Ignoring own answer");
            return Ok(());
        }
        if !self.accepts_room(room_id) {
            tracing::warn!("Ignoring answer for unknown room {}", room_id);
            return Ok(());
        }

        let Some(transport) = self.transport.as_ref() else {
            tracing::warn!("Received answer without peer connection");
            return Ok(());
        };

        let state = transport.signaling_state();
        if state != SignalingState::HaveLocalOffer {
            tracing::warn!("Not expecting answer, signaling state is {:?}", state);
            return Ok(());
        }

        tracing::info!("Received answer from {}", from);
        transport.set_remote_description(sdp).await?;
        log_drain(self.buffer.drain(transport.as_ref()).await);

        Ok(())
    }

    /// Verarbeitet einen ICE Candidate der Gegenseite
    ///
    /// Ohne Remote Description wird gepuffert, sonst sofort angewendet.
    pub async fn handle_remote_candidate(
        &mut self,
        from: &str,
        room_id: &str,
        candidate: IceCandidate,
    ) {
        if self.is_loopback(from) {
            return;
        }
        if !self.accepts_room(room_id) {
            tracing::debug!("Ignoring ICE candidate for unknown room {}", room_id);
            return;
        }

        let ready = match self.transport.as_ref() {
            Some(transport) => transport.has_remote_description().await,
            None => false,
        };

        if !ready {
            tracing::debug!("Buffering ICE candidate (remote description not set yet)");
            self.buffer.push(candidate);
            return;
        }

        if let Some(transport) = self.transport.as_ref() {
            if let Err(e) = transport.add_ice_candidate(candidate).await {
                tracing::error!("Error adding ICE candidate: {}", e);
            }
        }
    }

    /// Leitet einen lokal gefundenen Candidate an den Raum weiter
    pub fn on_local_candidate(&self, generation: u64, candidate: IceCandidate) {
        if generation != self.generation || self.transport.is_none() {
            tracing::debug!("Dropping ICE candidate of stale transport {}", generation);
            return;
        }
        let Some(room_id) = self.room_id.clone() else {
            return;
        };

        if let Err(e) = self
            .relay
            .send(ClientMessage::IceCandidate { room_id, candidate })
        {
            tracing::warn!("Failed to send ICE candidate: {}", e);
        }
    }

    /// Beendet die Session: Transport schließen, Medien stoppen, Puffer leeren
    ///
    /// Gibt die Gesprächsdauer zurück, falls die Negotiation begonnen hatte.
    pub async fn end_session(&mut self) -> Option<Duration> {
        if let Some(transport) = self.transport.take() {
            if let Err(e) = transport.close().await {
                tracing::warn!("Failed to close peer connection: {}", e);
            }
        }

        if let Some(mut media) = self.media.take() {
            media.stop();
        }

        let discarded = self.buffer.reset();
        if discarded > 0 {
            tracing::debug!("Discarded {} buffered ICE candidates", discarded);
        }

        // Späte Events des alten Transports ins Leere laufen lassen
        self.generation += 1;
        self.room_id = None;

        self.call_started.take().map(|started| started.elapsed())
    }

    /// Schaltet den Audio-Track um und gibt den neuen Zustand zurück
    pub fn toggle_audio(&mut self) -> Result<bool, SessionError> {
        let media = self.media.as_mut().ok_or(SessionError::NoSession)?;
        let enabled = !media.is_audio_enabled();
        media.set_audio_enabled(enabled);
        Ok(enabled)
    }

    /// Schaltet den Video-Track um (nur lokal, keine Benachrichtigung)
    pub fn toggle_video(&mut self) -> Result<bool, SessionError> {
        let media = self.media.as_mut().ok_or(SessionError::NoSession)?;
        let enabled = !media.is_video_enabled();
        media.set_video_enabled(enabled);
        Ok(enabled)
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn has_transport(&self) -> bool {
        self.transport.is_some()
    }

    pub fn pending_candidates(&self) -> usize {
        self.buffer.len()
    }

    fn is_loopback(&self, from: &str) -> bool {
        self.relay.connection_id().as_deref() == Some(from)
    }

    fn accepts_room(&self, room_id: &str) -> bool {
        self.room_id.as_deref() == Some(room_id)
    }
}

impl std::fmt::Debug for PeerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerSession")
            .field("room_id", &self.room_id)
            .field("generation", &self.generation)
            .field("has_transport", &self.transport.is_some())
            .field("has_media", &self.media.is_some())
            .field("pending_candidates", &self.buffer.len())
            .finish()
    }
}

fn log_drain(report: DrainReport) {
    if report.failed > 0 {
        tracing::warn!(
            "{} of {} buffered ICE candidates were rejected",
            report.failed,
            report.applied + report.failed
        );
    } else if report.applied > 0 {
        tracing::debug!("Applied {} buffered ICE candidates", report.applied);
    }
}

// ============================================================================
// TESTS
// ============================================================================
