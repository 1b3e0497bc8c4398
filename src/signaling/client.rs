//! WebSocket Client für das Relay
//!
//! Verwaltet die WebSocket-Verbindung zum Signaling-Server:
//! - Automatische Reconnection mit fester Wartezeit
//! - Event-basierte Kommunikation über einen [`RelayEvent`]-Stream
//! - Merkt sich die Verbindungs-Identität aus `registered`

use super::channel::{RelayChannel, SignalingError};
use super::messages::*;
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;

// ============================================================================
// CLIENT STATE
// ============================================================================

#[derive(Debug, Clone, Default)]
struct ClientState {
    is_connected: bool,
    connection_id: Option<String>,
}

// ============================================================================
// SIGNALING CLIENT
// ============================================================================

/// WebSocket Client für Relay-Kommunikation
pub struct SignalingClient {
    server_url: String,
    state: Arc<RwLock<ClientState>>,
    tx: mpsc::UnboundedSender<String>,
}

impl SignalingClient {
    /// Startet den Verbindungs-Task und gibt Client + Event-Stream zurück
    ///
    /// Die Verbindung wird im Hintergrund aufgebaut; nach jedem Abbruch wird
    /// nach `retry_delay` neu verbunden. Jede neue Verbindung meldet sich mit
    /// [`RelayEvent::Connected`], jeder Abbruch mit [`RelayEvent::Disconnected`].
    pub fn spawn(
        server_url: &str,
        retry_delay: Duration,
    ) -> Result<(Self, mpsc::UnboundedReceiver<RelayEvent>), SignalingError> {
        let ws_url = websocket_url(server_url)?;

        let (tx, rx) = mpsc::unbounded_channel::<String>();
        let (event_tx, event_rx) = mpsc::unbounded_channel::<RelayEvent>();
        let state = Arc::new(RwLock::new(ClientState::default()));

        tokio::spawn(Self::supervise(
            ws_url.clone(),
            rx,
            event_tx,
            Arc::clone(&state),
            retry_delay,
        ));

        Ok((
            Self {
                server_url: ws_url,
                state,
                tx,
            },
            event_rx,
        ))
    }

    /// Verbindungs-Schleife: verbinden, pumpen, bei Abbruch neu verbinden
    async fn supervise(
        ws_url: String,
        mut outbound: mpsc::UnboundedReceiver<String>,
        events: mpsc::UnboundedSender<RelayEvent>,
        state: Arc<RwLock<ClientState>>,
        retry_delay: Duration,
    ) {
        loop {
            tracing::info!("Connecting to signaling server: {}", ws_url);

            match connect_async(ws_url.as_str()).await {
                Ok((ws_stream, _)) => {
                    state.write().is_connected = true;
                    let _ = events.send(RelayEvent::Connected);

                    let (mut write, mut read) = ws_stream.split();

                    loop {
                        tokio::select! {
                            outgoing = outbound.recv() => match outgoing {
                                Some(text) => {
                                    if let Err(e) = write.send(Message::Text(text)).await {
                                        tracing::error!("Failed to send WebSocket message: {}", e);
                                        break;
                                    }
                                }
                                None => {
                                    // Client wurde gedroppt
                                    let _ = write.close().await;
                                    return;
                                }
                            },
                            incoming = read.next() => match incoming {
                                Some(Ok(Message::Text(text))) => {
                                    Self::handle_text(&text, &state, &events);
                                }
                                Some(Ok(Message::Close(_))) | None => {
                                    tracing::info!("WebSocket closed by server");
                                    break;
                                }
                                Some(Err(e)) => {
                                    tracing::error!("WebSocket error: {}", e);
                                    break;
                                }
                                Some(Ok(_)) => {}
                            },
                        }
                    }

                    // Disconnect-Status setzen, Identität ist ab jetzt ungültig
                    {
                        let mut s = state.write();
                        s.is_connected = false;
                        s.connection_id = None;
                    }
                    let _ = events.send(RelayEvent::Disconnected);
                }
                Err(e) => {
                    tracing::warn!("WebSocket connection failed: {}", e);
                }
            }

            if events.is_closed() {
                tracing::debug!("Event receiver dropped, stopping signaling task");
                return;
            }

            tokio::time::sleep(retry_delay).await;
        }
    }

    /// Verarbeitet eine eingehende Text-Nachricht
    fn handle_text(
        text: &str,
        state: &Arc<RwLock<ClientState>>,
        events: &mpsc::UnboundedSender<RelayEvent>,
    ) {
        let msg = match serde_json::from_str::<ServerMessage>(text) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!("Ignoring unparseable server message: {}", e);
                return;
            }
        };

        if let ServerMessage::Registered {
            user_code,
            connection_id,
        } = &msg
        {
            tracing::info!(
                "Registered as {} with connection {}",
                user_code,
                connection_id
            );
            state.write().connection_id = Some(connection_id.clone());
        }

        let _ = events.send(RelayEvent::Message(msg));
    }
}

impl RelayChannel for SignalingClient {
    fn send(&self, message: ClientMessage) -> Result<(), SignalingError> {
        if !self.is_connected() {
            return Err(SignalingError::NotConnected);
        }

        let text = serde_json::to_string(&message)
            .map_err(|e| SignalingError::Serialization(e.to_string()))?;

        self.tx
            .send(text)
            .map_err(|e| SignalingError::SendFailed(e.to_string()))
    }

    fn is_connected(&self) -> bool {
        self.state.read().is_connected
    }

    fn connection_id(&self) -> Option<String> {
        self.state.read().connection_id.clone()
    }
}

impl std::fmt::Debug for SignalingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalingClient")
            .field("server_url", &self.server_url)
            .field("state", &*self.state.read())
            .finish()
    }
}

// ============================================================================
// URL HANDLING
// ============================================================================

/// Wandelt eine http(s)/ws(s) Server-URL in die WebSocket-URL um
///
/// Ohne eigenen Pfad wird `/ws` angehängt.
pub fn websocket_url(server_url: &str) -> Result<String, SignalingError> {
    let mut url =
        Url::parse(server_url).map_err(|e| SignalingError::InvalidUrl(e.to_string()))?;

    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(SignalingError::InvalidUrl(format!(
                "unsupported scheme '{}'",
                other
            )))
        }
    };

    url.set_scheme(scheme)
        .map_err(|_| SignalingError::InvalidUrl(server_url.to_string()))?;

    if url.path().is_empty() || url.path() == "/" {
        url.set_path("/ws");
    }

    Ok(url.to_string())
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_websocket_url_conversion() {
        assert_eq!(
            websocket_url("http://localhost:3001").unwrap(),
            "ws://localhost:3001/ws"
        );
        assert_eq!(
            websocket_url("https://relay.example.com").unwrap(),
            "wss://relay.example.com/ws"
        );
        assert_eq!(
            websocket_url("wss://relay.example.com/signal").unwrap(),
            "wss://relay.example.com/signal"
        );
    }

    #[test]
    fn test_websocket_url_rejects_other_schemes() {
        assert!(matches!(
            websocket_url("ftp://relay.example.com"),
            Err(SignalingError::InvalidUrl(_))
        ));
        assert!(matches!(
            websocket_url("not a url"),
            Err(SignalingError::InvalidUrl(_))
        ));
    }

    #[tokio::test]
    async fn test_send_fails_fast_when_not_connected() {
        // Port 9 (discard) ist lokal praktisch nie offen
        let (client, _events) =
            SignalingClient::spawn("http://127.0.0.1:9", Duration::from_secs(60)).unwrap();

        let result = client.send(ClientMessage::Register { user_code: None });
        assert_eq!(result, Err(SignalingError::NotConnected));
        assert!(client.connection_id().is_none());
    }
}
