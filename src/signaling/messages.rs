//! Message Types für das Relay-Protokoll
//!
//! Alle Events werden als JSON-Objekt mit einem `type`-Feld übertragen,
//! z.B. `{"type":"incoming-call","from":"123456","roomId":"..."}`.
//! Session Descriptions und ICE Candidates verwenden die Browser-Form
//! (`RTCSessionDescriptionInit` / `RTCIceCandidateInit`).

use crate::identity::UserCode;
use serde::{Deserialize, Serialize};

// ============================================================================
// NEGOTIATION PAYLOADS
// ============================================================================

/// Art einer Session Description
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Offer oder Answer, wie sie über das Relay transportiert wird
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE Candidate (Transportpfad-Hinweis)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
    #[serde(default)]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }
}

// ============================================================================
// CLIENT → SERVER MESSAGES
// ============================================================================

/// Alle Nachrichten, die ein Client an das Relay sendet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum ClientMessage {
    /// Code anfordern oder bestätigen (ohne Code vergibt der Server einen neuen)
    Register {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_code: Option<UserCode>,
    },

    /// Einladung an einen anderen User Code
    Call {
        target_code: UserCode,
        caller_name: String,
        room_id: String,
    },

    /// Angerufener nimmt an
    AcceptCall {
        room_id: String,
        caller_connection_id: String,
    },

    /// Angerufener lehnt ab
    RejectCall { caller_connection_id: String },

    /// Anrufer zieht die Einladung zurück
    CancelCall { target_code: UserCode },

    /// SDP Offer an den Raum
    Offer {
        room_id: String,
        sdp: SessionDescription,
    },

    /// SDP Answer an den Raum
    Answer {
        room_id: String,
        sdp: SessionDescription,
    },

    /// ICE Candidate an den Raum
    IceCandidate {
        room_id: String,
        candidate: IceCandidate,
    },

    /// Auflegen
    EndCall { room_id: String },

    /// Mute-Hinweis für die Gegenseite (nicht Teil der Negotiation)
    MuteStatus {
        room_id: String,
        is_audio_enabled: bool,
    },
}

impl ClientMessage {
    /// Event-Name auf dem Draht
    pub fn name(&self) -> &'static str {
        match self {
            Self::Register { .. } => "register",
            Self::Call { .. } => "call",
            Self::AcceptCall { .. } => "accept-call",
            Self::RejectCall { .. } => "reject-call",
            Self::CancelCall { .. } => "cancel-call",
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::IceCandidate { .. } => "ice-candidate",
            Self::EndCall { .. } => "end-call",
            Self::MuteStatus { .. } => "mute-status",
        }
    }
}

// ============================================================================
// SERVER → CLIENT MESSAGES
// ============================================================================

/// Alle möglichen Server-Nachrichten
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum ServerMessage {
    /// Code zugewiesen/bestätigt, inkl. Identität dieser Verbindung
    Registered {
        user_code: UserCode,
        connection_id: String,
    },

    /// Bestätigung an den Anrufer
    CallInitiated { room_id: String },

    /// Einladung beim Angerufenen
    IncomingCall {
        from: UserCode,
        caller_name: String,
        room_id: String,
        caller_connection_id: String,
    },

    /// Angerufener hat angenommen
    CallAccepted { room_id: String },

    /// Angerufener hat abgelehnt
    CallRejected,

    /// Anrufer hat zurückgezogen
    CallCancelled,

    /// Server konnte die Einladung nicht zustellen
    CallError { message: String },

    /// Weitergeleitetes Offer
    Offer {
        room_id: String,
        sdp: SessionDescription,
        from: String,
    },

    /// Weitergeleitetes Answer
    Answer {
        room_id: String,
        sdp: SessionDescription,
        from: String,
    },

    /// Weitergeleiteter ICE Candidate
    IceCandidate {
        room_id: String,
        candidate: IceCandidate,
        from: String,
    },

    /// Gegenseite hat aufgelegt
    CallEnded { socket_id: String },

    /// Gegenseite hat den Raum verlassen / Verbindung verloren
    PeerLeft { socket_id: String },

    /// Mute-Status der Gegenseite
    PeerMuteStatus {
        socket_id: String,
        is_audio_enabled: bool,
    },
}

impl ServerMessage {
    /// Event-Name auf dem Draht
    pub fn name(&self) -> &'static str {
        match self {
            Self::Registered { .. } => "registered",
            Self::CallInitiated { .. } => "call-initiated",
            Self::IncomingCall { .. } => "incoming-call",
            Self::CallAccepted { .. } => "call-accepted",
            Self::CallRejected => "call-rejected",
            Self::CallCancelled => "call-cancelled",
            Self::CallError { .. } => "call-error",
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::IceCandidate { .. } => "ice-candidate",
            Self::CallEnded { .. } => "call-ended",
            Self::PeerLeft { .. } => "peer-left",
            Self::PeerMuteStatus { .. } => "peer-mute-status",
        }
    }
}

// ============================================================================
// INBOUND STREAM
// ============================================================================

/// Was ein Relay Channel an den Client liefert
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    /// (Wieder) verbunden, Registrierung steht noch aus
    Connected,

    /// Verbindung verloren
    Disconnected,

    /// Nachricht vom Server
    Message(ServerMessage),
}

// ============================================================================
// TESTS
// ============================================================================
