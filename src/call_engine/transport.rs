//! Media Transport Abstraktion
//!
//! Die Peer Session spricht ausschließlich über diese Traits mit der
//! darunterliegenden Peer Connection. Produktiv steckt webrtc-rs dahinter
//! ([`super::rtc`]), in Tests eine Fake-Implementierung.

use crate::signaling::{IceCandidate, SessionDescription};
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("WebRTC error: {0}")]
    WebRTC(String),

    #[error("Invalid SDP: {0}")]
    InvalidSdp(String),

    #[error("Invalid ICE candidate: {0}")]
    InvalidCandidate(String),

    #[error("Transport is closed")]
    Closed,
}

// ============================================================================
// STATES
// ============================================================================

/// Negotiation-Zustand der Peer Connection (wie `RTCSignalingState`)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    HaveLocalPranswer,
    HaveRemotePranswer,
    Closed,
}

/// Verbindungszustand der Peer Connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Art eines lokalen Media Tracks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

// ============================================================================
// TRANSPORT EVENTS
// ============================================================================

/// Asynchrone Events einer Peer Connection
///
/// Jedes Event trägt die Generation des Transports, der es erzeugt hat,
/// damit Events eines bereits ersetzten Transports verworfen werden können.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    LocalCandidate {
        generation: u64,
        candidate: IceCandidate,
    },
    ConnectionState {
        generation: u64,
        state: ConnectionState,
    },
}

/// Sender für Transport-Events, gebunden an eine Generation
#[derive(Debug, Clone)]
pub struct TransportEventSink {
    generation: u64,
    tx: mpsc::UnboundedSender<TransportEvent>,
}

impl TransportEventSink {
    pub fn new(generation: u64, tx: mpsc::UnboundedSender<TransportEvent>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Meldet einen lokal gefundenen ICE Candidate
    pub fn local_candidate(&self, candidate: IceCandidate) {
        let _ = self.tx.send(TransportEvent::LocalCandidate {
            generation: self.generation,
            candidate,
        });
    }

    /// Meldet eine Änderung des Verbindungszustands
    pub fn connection_state(&self, state: ConnectionState) {
        let _ = self.tx.send(TransportEvent::ConnectionState {
            generation: self.generation,
            state,
        });
    }
}

// ============================================================================
// TRAITS
// ============================================================================

/// Eine einzelne Peer Connection
#[async_trait]
pub trait MediaTransport: Send + Sync {
    fn signaling_state(&self) -> SignalingState;

    async fn has_remote_description(&self) -> bool;

    async fn create_offer(&self) -> Result<SessionDescription, TransportError>;

    async fn create_answer(&self) -> Result<SessionDescription, TransportError>;

    async fn set_local_description(&self, desc: SessionDescription)
        -> Result<(), TransportError>;

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}

/// Erzeugt Peer Connections mit den lokalen Tracks
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(
        &self,
        tracks: &[TrackKind],
        events: TransportEventSink,
    ) -> Result<Box<dyn MediaTransport>, TransportError>;
}
