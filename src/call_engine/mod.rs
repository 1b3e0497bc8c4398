//! Call Engine Module - Einladungen und WebRTC Negotiation
//!
//! Dieses Modul verwaltet:
//! - Die Invitation State Machine (klingeln, annehmen, ablehnen, Timeout)
//! - Die Peer Session (Offer/Answer, ICE Candidates)
//! - Den Negotiation Buffer für verfrühte Candidates
//! - Mikrofon-Capture und WebRTC Peer Connections

mod buffer;
mod engine;
mod invitation;
mod media;
mod rtc;
mod session;
mod transport;

#[cfg(test)]
pub(crate) mod fakes;

pub use buffer::{CandidateBuffer, DrainReport};
pub use engine::{CallEngine, CallEvent, CallHandle, CallNotice, EngineParts};
pub use invitation::{
    ActiveCall, CallError, CallMachine, CallState, IncomingInvitation, OutgoingCall,
    TimerExpired,
};
pub use media::{
    DeviceMedia, DeviceMediaSource, LocalMedia, MediaError, MediaSource, CHANNELS, SAMPLE_RATE,
};
pub use rtc::{RtcTransport, RtcTransportFactory};
pub use session::{CallContext, NegotiationRole, PeerSession, SessionError};
pub use transport::{
    ConnectionState, MediaTransport, SignalingState, TrackKind, TransportError, TransportEvent,
    TransportEventSink, TransportFactory,
};
