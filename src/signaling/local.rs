//! In-Process Relay
//!
//! Minimaler Relay-Server im selben Prozess: Directory (User Code →
//! Verbindung) plus Routing zwischen genau zwei Teilnehmern pro Raum.
//! Wird für Tests und lokale Demos verwendet.
//!
//! Raum-Nachrichten (`offer`, `answer`, `ice-candidate`) gehen wie bei einem
//! naiven Broadcast an alle Mitglieder, auch an den Absender selbst.

use super::channel::{RelayChannel, SignalingError};
use super::messages::*;
use crate::identity::UserCode;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

// ============================================================================
// RELAY STATE
// ============================================================================

/// Offene Einladung (nur solange es klingelt)
#[derive(Debug, Clone)]
struct PendingInvitation {
    caller_connection: String,
    target_code: UserCode,
}

#[derive(Default)]
struct RelayState {
    next_connection: u64,
    connections: HashMap<String, mpsc::UnboundedSender<RelayEvent>>,
    codes: HashMap<UserCode, String>,
    codes_by_connection: HashMap<String, UserCode>,
    rooms: HashMap<String, Vec<String>>,
    /// Offene Einladungen nach Room-ID
    invitations: HashMap<String, PendingInvitation>,
    traffic: Vec<&'static str>,
    drop_next: Vec<&'static str>,
}

impl RelayState {
    fn deliver(&self, connection: &str, msg: ServerMessage) {
        match self.connections.get(connection) {
            Some(tx) => {
                let _ = tx.send(RelayEvent::Message(msg));
            }
            None => tracing::debug!("Dropping {} for unknown connection {}", msg.name(), connection),
        }
    }

    fn others_in_room(&self, room_id: &str, connection: &str) -> Vec<String> {
        self.rooms
            .get(room_id)
            .map(|members| {
                members
                    .iter()
                    .filter(|m| m.as_str() != connection)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    fn broadcast_to_room(&self, room_id: &str, from: &str, msg: ServerMessage) {
        let Some(members) = self.rooms.get(room_id) else {
            tracing::debug!("Dropping {} for unknown room {}", msg.name(), room_id);
            return;
        };

        if !members.iter().any(|m| m == from) {
            tracing::warn!("{} is not a member of room {}", from, room_id);
            return;
        }

        for member in members {
            self.deliver(member, msg.clone());
        }
    }

    /// Entfernt passende Einladungen samt Raum
    fn drop_invitations(&mut self, mut matches: impl FnMut(&PendingInvitation) -> bool) {
        let stale: Vec<String> = self
            .invitations
            .iter()
            .filter(|(_, invitation)| matches(invitation))
            .map(|(room_id, _)| room_id.clone())
            .collect();

        for room_id in stale {
            tracing::debug!("Dropping pending invitation for room {}", room_id);
            self.invitations.remove(&room_id);
            self.rooms.remove(&room_id);
        }
    }

    fn unique_code(&self) -> UserCode {
        loop {
            let code = UserCode::generate();
            if !self.codes.contains_key(&code) {
                return code;
            }
        }
    }

    fn route(&mut self, from: &str, msg: ClientMessage) {
        self.traffic.push(msg.name());

        if let Some(pos) = self.drop_next.iter().position(|name| *name == msg.name()) {
            self.drop_next.remove(pos);
            tracing::debug!("Simulating loss of {} from {}", msg.name(), from);
            return;
        }

        match msg {
            ClientMessage::Register { user_code } => {
                let code = match user_code {
                    Some(code) => code,
                    None => self.unique_code(),
                };

                if let Some(previous) = self.codes_by_connection.remove(from) {
                    self.codes.remove(&previous);
                }
                // Ein neu registrierter Client übernimmt seinen Code (Reconnect)
                if let Some(stale) = self.codes.insert(code.clone(), from.to_string()) {
                    self.codes_by_connection.remove(&stale);
                }
                self.codes_by_connection
                    .insert(from.to_string(), code.clone());

                self.deliver(
                    from,
                    ServerMessage::Registered {
                        user_code: code,
                        connection_id: from.to_string(),
                    },
                );
            }

            ClientMessage::Call {
                target_code,
                caller_name,
                room_id,
            } => {
                let Some(caller_code) = self.codes_by_connection.get(from).cloned() else {
                    self.deliver(
                        from,
                        ServerMessage::CallError {
                            message: "Register before placing a call".to_string(),
                        },
                    );
                    return;
                };

                let Some(target_connection) = self.codes.get(&target_code).cloned() else {
                    self.deliver(
                        from,
                        ServerMessage::CallError {
                            message: format!("User {} is not online", target_code),
                        },
                    );
                    return;
                };

                // Ein Caller klingelt nur bei einem Ziel, ältere Einladungen
                // sind verfallen (Timeout sendet kein cancel-call)
                self.drop_invitations(|invitation| invitation.caller_connection == from);

                self.rooms.insert(room_id.clone(), vec![from.to_string()]);
                self.invitations.insert(
                    room_id.clone(),
                    PendingInvitation {
                        caller_connection: from.to_string(),
                        target_code,
                    },
                );

                self.deliver(
                    from,
                    ServerMessage::CallInitiated {
                        room_id: room_id.clone(),
                    },
                );
                self.deliver(
                    &target_connection,
                    ServerMessage::IncomingCall {
                        from: caller_code,
                        caller_name,
                        room_id,
                        caller_connection_id: from.to_string(),
                    },
                );
            }

            ClientMessage::AcceptCall {
                room_id,
                caller_connection_id,
            } => {
                self.invitations.remove(&room_id);

                match self.rooms.get_mut(&room_id) {
                    Some(members) if members.len() < 2 => members.push(from.to_string()),
                    Some(_) => {
                        tracing::warn!("Room {} is already full", room_id);
                        return;
                    }
                    None => {
                        // Einladung wurde inzwischen zurückgezogen
                        tracing::warn!("Accept for unknown room {}", room_id);
                        self.deliver(
                            from,
                            ServerMessage::CallEnded {
                                socket_id: caller_connection_id,
                            },
                        );
                        return;
                    }
                }

                self.deliver(
                    &caller_connection_id,
                    ServerMessage::CallAccepted { room_id },
                );
            }

            ClientMessage::RejectCall {
                caller_connection_id,
            } => {
                if let Some(code) = self.codes_by_connection.get(from).cloned() {
                    self.drop_invitations(|invitation| {
                        invitation.target_code == code
                            && invitation.caller_connection == caller_connection_id
                    });
                }
                self.deliver(&caller_connection_id, ServerMessage::CallRejected);
            }

            ClientMessage::CancelCall { target_code } => {
                self.drop_invitations(|invitation| {
                    invitation.target_code == target_code && invitation.caller_connection == from
                });

                if let Some(target_connection) = self.codes.get(&target_code) {
                    self.deliver(target_connection, ServerMessage::CallCancelled);
                }
            }

            ClientMessage::Offer { room_id, sdp } => {
                let msg = ServerMessage::Offer {
                    room_id: room_id.clone(),
                    sdp,
                    from: from.to_string(),
                };
                self.broadcast_to_room(&room_id, from, msg);
            }

            ClientMessage::Answer { room_id, sdp } => {
                let msg = ServerMessage::Answer {
                    room_id: room_id.clone(),
                    sdp,
                    from: from.to_string(),
                };
                self.broadcast_to_room(&room_id, from, msg);
            }

            ClientMessage::IceCandidate { room_id, candidate } => {
                let msg = ServerMessage::IceCandidate {
                    room_id: room_id.clone(),
                    candidate,
                    from: from.to_string(),
                };
                self.broadcast_to_room(&room_id, from, msg);
            }

            ClientMessage::EndCall { room_id } => {
                for other in self.others_in_room(&room_id, from) {
                    self.deliver(
                        &other,
                        ServerMessage::CallEnded {
                            socket_id: from.to_string(),
                        },
                    );
                }
                self.rooms.remove(&room_id);
            }

            ClientMessage::MuteStatus {
                room_id,
                is_audio_enabled,
            } => {
                for other in self.others_in_room(&room_id, from) {
                    self.deliver(
                        &other,
                        ServerMessage::PeerMuteStatus {
                            socket_id: from.to_string(),
                            is_audio_enabled,
                        },
                    );
                }
            }
        }
    }

    fn disconnect(&mut self, connection: &str) {
        let Some(tx) = self.connections.remove(connection) else {
            return;
        };
        let _ = tx.send(RelayEvent::Disconnected);

        if let Some(code) = self.codes_by_connection.remove(connection) {
            self.codes.remove(&code);
            self.drop_invitations(|invitation| invitation.target_code == code);
        }
        self.drop_invitations(|invitation| invitation.caller_connection == connection);

        let rooms: Vec<String> = self
            .rooms
            .iter()
            .filter(|(_, members)| members.iter().any(|m| m == connection))
            .map(|(room_id, _)| room_id.clone())
            .collect();

        for room_id in rooms {
            for other in self.others_in_room(&room_id, connection) {
                self.deliver(
                    &other,
                    ServerMessage::PeerLeft {
                        socket_id: connection.to_string(),
                    },
                );
            }
            self.rooms.remove(&room_id);
        }
    }
}

// ============================================================================
// LOCAL RELAY
// ============================================================================

/// In-Process Relay mit Directory
#[derive(Clone, Default)]
pub struct LocalRelay {
    state: Arc<Mutex<RelayState>>,
}

impl LocalRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Öffnet eine neue Verbindung (mit neuer Identität)
    pub fn connect(&self) -> (LocalConnection, mpsc::UnboundedReceiver<RelayEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = {
            let mut state = self.state.lock();
            state.next_connection += 1;
            let id = format!("conn-{}", state.next_connection);
            let _ = tx.send(RelayEvent::Connected);
            state.connections.insert(id.clone(), tx);
            id
        };

        tracing::debug!("Local relay connection {} opened", id);

        (
            LocalConnection {
                id,
                state: Arc::clone(&self.state),
            },
            rx,
        )
    }

    /// Anzahl empfangener Client-Events mit diesem Namen
    pub fn count(&self, event: &str) -> usize {
        self.state
            .lock()
            .traffic
            .iter()
            .filter(|name| **name == event)
            .count()
    }

    /// Verwirft das nächste Client-Event mit diesem Namen (simulierter Verlust)
    pub fn drop_next(&self, event: &'static str) {
        self.state.lock().drop_next.push(event);
    }

    /// Prüft ob ein Code aktuell erreichbar ist
    pub fn is_registered(&self, code: &UserCode) -> bool {
        self.state.lock().codes.contains_key(code)
    }
}

impl std::fmt::Debug for LocalRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("LocalRelay")
            .field("connections", &state.connections.len())
            .field("rooms", &state.rooms.len())
            .finish()
    }
}

// ============================================================================
// LOCAL CONNECTION
// ============================================================================

/// Client-Seite einer Verbindung zum [`LocalRelay`]
pub struct LocalConnection {
    id: String,
    state: Arc<Mutex<RelayState>>,
}

impl LocalConnection {
    /// Trennt die Verbindung (wie ein Verbindungsabbruch)
    pub fn disconnect(&self) {
        tracing::debug!("Local relay connection {} closed", self.id);
        self.state.lock().disconnect(&self.id);
    }
}

impl RelayChannel for LocalConnection {
    fn send(&self, message: ClientMessage) -> Result<(), SignalingError> {
        let mut state = self.state.lock();
        if !state.connections.contains_key(&self.id) {
            return Err(SignalingError::NotConnected);
        }
        state.route(&self.id, message);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.state.lock().connections.contains_key(&self.id)
    }

    fn connection_id(&self) -> Option<String> {
        self.is_connected().then(|| self.id.clone())
    }
}

impl std::fmt::Debug for LocalConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalConnection")
            .field("id", &self.id)
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn code(raw: &str) -> UserCode {
        UserCode::parse(raw).unwrap()
    }

    fn next_message(rx: &mut mpsc::UnboundedReceiver<RelayEvent>) -> ServerMessage {
        loop {
            match rx.try_recv().expect("expected an event") {
                RelayEvent::Message(msg) => return msg,
                _ => continue,
            }
        }
    }

    fn register(
        relay: &LocalRelay,
        raw: Option<&str>,
    ) -> (LocalConnection, mpsc::UnboundedReceiver<RelayEvent>) {
        let (conn, mut rx) = relay.connect();
        conn.send(ClientMessage::Register {
            user_code: raw.map(code),
        })
        .unwrap();
        assert!(matches!(
            next_message(&mut rx),
            ServerMessage::Registered { .. }
        ));
        (conn, rx)
    }

    #[test]
    fn test_register_assigns_fresh_code() {
        let relay = LocalRelay::new();
        let (conn, mut rx) = relay.connect();
        assert_eq!(rx.try_recv().unwrap(), RelayEvent::Connected);

        conn.send(ClientMessage::Register { user_code: None })
            .unwrap();

        match next_message(&mut rx) {
            ServerMessage::Registered {
                user_code,
                connection_id,
            } => {
                assert!(relay.is_registered(&user_code));
                assert_eq!(Some(connection_id), conn.connection_id());
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_call_to_unknown_code_reports_error() {
        let relay = LocalRelay::new();
        let (caller, mut caller_rx) = register(&relay, Some("123456"));

        caller
            .send(ClientMessage::Call {
                target_code: code("999999"),
                caller_name: "123456".to_string(),
                room_id: "room-1".to_string(),
            })
            .unwrap();

        assert!(matches!(
            next_message(&mut caller_rx),
            ServerMessage::CallError { .. }
        ));
    }

    #[test]
    fn test_room_broadcast_includes_sender() {
        let relay = LocalRelay::new();
        let (caller, mut caller_rx) = register(&relay, Some("123456"));
        let (callee, mut callee_rx) = register(&relay, Some("654321"));

        caller
            .send(ClientMessage::Call {
                target_code: code("654321"),
                caller_name: "123456".to_string(),
                room_id: "room-1".to_string(),
            })
            .unwrap();
        assert!(matches!(
            next_message(&mut caller_rx),
            ServerMessage::CallInitiated { .. }
        ));
        assert!(matches!(
            next_message(&mut callee_rx),
            ServerMessage::IncomingCall { .. }
        ));

        callee
            .send(ClientMessage::AcceptCall {
                room_id: "room-1".to_string(),
                caller_connection_id: caller.connection_id().unwrap(),
            })
            .unwrap();
        assert!(matches!(
            next_message(&mut caller_rx),
            ServerMessage::CallAccepted { .. }
        ));

        caller
            .send(ClientMessage::IceCandidate {
                room_id: "room-1".to_string(),
                candidate: IceCandidate::new("candidate:1"),
            })
            .unwrap();

        // Echo an den Absender und Zustellung an die Gegenseite
        assert!(matches!(
            next_message(&mut caller_rx),
            ServerMessage::IceCandidate { .. }
        ));
        assert!(matches!(
            next_message(&mut callee_rx),
            ServerMessage::IceCandidate { .. }
        ));
    }

    #[test]
    fn test_disconnect_notifies_peer() {
        let relay = LocalRelay::new();
        let (caller, mut caller_rx) = register(&relay, Some("123456"));
        let (callee, mut callee_rx) = register(&relay, Some("654321"));

        caller
            .send(ClientMessage::Call {
                target_code: code("654321"),
                caller_name: "123456".to_string(),
                room_id: "room-1".to_string(),
            })
            .unwrap();
        callee
            .send(ClientMessage::AcceptCall {
                room_id: "room-1".to_string(),
                caller_connection_id: caller.connection_id().unwrap(),
            })
            .unwrap();
        let _ = next_message(&mut callee_rx);

        caller.disconnect();

        assert!(!caller.is_connected());
        assert!(!relay.is_registered(&code("123456")));
        assert!(matches!(
            next_message(&mut callee_rx),
            ServerMessage::PeerLeft { .. }
        ));
        assert_eq!(
            caller.send(ClientMessage::Register { user_code: None }),
            Err(SignalingError::NotConnected)
        );

        // Der getrennte Client bekommt noch sein Disconnected
        let mut saw_disconnect = false;
        while let Ok(event) = caller_rx.try_recv() {
            saw_disconnect |= event == RelayEvent::Disconnected;
        }
        assert!(saw_disconnect);
    }

    fn call(caller: &LocalConnection, target: &str, room_id: &str) {
        caller
            .send(ClientMessage::Call {
                target_code: code(target),
                caller_name: "123456".to_string(),
                room_id: room_id.to_string(),
            })
            .unwrap();
    }

    #[test]
    fn test_new_call_drops_stale_invitation() {
        let relay = LocalRelay::new();
        let (caller, mut caller_rx) = register(&relay, Some("123456"));
        let (callee, mut callee_rx) = register(&relay, Some("654321"));

        // Erste Einladung verfällt ohne cancel-call
        call(&caller, "654321", "room-1");
        call(&caller, "654321", "room-2");
        {
            let state = relay.state.lock();
            assert_eq!(state.invitations.len(), 1);
            assert!(state.invitations.contains_key("room-2"));
            assert!(!state.rooms.contains_key("room-1"));
        }
        while caller_rx.try_recv().is_ok() {}
        while callee_rx.try_recv().is_ok() {}

        callee
            .send(ClientMessage::AcceptCall {
                room_id: "room-1".to_string(),
                caller_connection_id: caller.connection_id().unwrap(),
            })
            .unwrap();

        assert!(matches!(
            next_message(&mut callee_rx),
            ServerMessage::CallEnded { .. }
        ));
        assert!(caller_rx.try_recv().is_err());
    }

    #[test]
    fn test_accept_after_cancel_ends_callee() {
        let relay = LocalRelay::new();
        let (caller, _caller_rx) = register(&relay, Some("123456"));
        let (callee, mut callee_rx) = register(&relay, Some("654321"));

        call(&caller, "654321", "room-1");
        caller
            .send(ClientMessage::CancelCall {
                target_code: code("654321"),
            })
            .unwrap();
        assert!(matches!(
            next_message(&mut callee_rx),
            ServerMessage::IncomingCall { .. }
        ));
        assert!(matches!(
            next_message(&mut callee_rx),
            ServerMessage::CallCancelled
        ));
        assert!(relay.state.lock().invitations.is_empty());

        callee
            .send(ClientMessage::AcceptCall {
                room_id: "room-1".to_string(),
                caller_connection_id: caller.connection_id().unwrap(),
            })
            .unwrap();

        match next_message(&mut callee_rx) {
            ServerMessage::CallEnded { socket_id } => {
                assert_eq!(Some(socket_id), caller.connection_id());
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_drop_next_loses_one_event() {
        let relay = LocalRelay::new();
        let (caller, _caller_rx) = register(&relay, Some("123456"));
        let (_callee, mut callee_rx) = register(&relay, Some("654321"));

        relay.drop_next("cancel-call");
        caller
            .send(ClientMessage::CancelCall {
                target_code: code("654321"),
            })
            .unwrap();

        assert!(callee_rx.try_recv().is_err());
        assert_eq!(relay.count("cancel-call"), 1);
    }
}
