//! Signaling Module - Relay Channel
//!
//! Dieses Modul verwaltet die Kommunikation mit dem Relay:
//! - Typisierte Event-Nachrichten in beide Richtungen
//! - WebSocket-Verbindung mit Reconnect
//! - In-Process Relay für Tests und lokale Demos
//!

mod channel;
mod client;
mod local;
mod messages;

pub use channel::{RelayChannel, SignalingError};
pub use client::{websocket_url, SignalingClient};
pub use local::{LocalConnection, LocalRelay};
pub use messages::*;
