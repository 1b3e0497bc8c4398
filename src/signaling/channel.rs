//! Relay Channel Abstraktion
//!
//! Der Call-Kern spricht nur über dieses Trait mit dem Relay. Die
//! WebSocket-Implementierung ([`super::SignalingClient`]) und das
//! In-Process-Relay ([`super::LocalRelay`]) implementieren es beide.

use super::messages::ClientMessage;
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignalingError {
    #[error("WebSocket connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Not connected to signaling server")]
    NotConnected,

    #[error("Failed to send message: {0}")]
    SendFailed(String),

    #[error("Invalid signaling URL: {0}")]
    InvalidUrl(String),

    #[error("Failed to encode message: {0}")]
    Serialization(String),
}

// ============================================================================
// RELAY CHANNEL
// ============================================================================

/// Ausgehende Seite einer Relay-Verbindung
///
/// Eingehende Events werden separat als Stream von
/// [`RelayEvent`](super::RelayEvent) geliefert.
pub trait RelayChannel: Send + Sync {
    /// Sendet eine Nachricht (non-blocking)
    fn send(&self, message: ClientMessage) -> Result<(), SignalingError>;

    /// Prüft ob die Verbindung steht
    fn is_connected(&self) -> bool;

    /// Identität dieser Verbindung beim Relay (ändert sich bei Reconnect)
    fn connection_id(&self) -> Option<String>;
}
