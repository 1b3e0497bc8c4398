//! Call Engine
//!
//! Ein einzelner Task besitzt State Machine und Peer Session. Relay-Events,
//! Befehle des Hosts, Timer-Abläufe und Transport-Events werden in einer
//! `select!`-Schleife nacheinander abgearbeitet, dadurch gibt es pro Client
//! genau einen Schreiber für den Call-Zustand.
//!
//! Der Host spricht über ein [`CallHandle`] mit der Engine und abonniert
//! [`CallEvent`]s für die Anzeige.

use super::invitation::{CallError, CallMachine, CallState, IncomingInvitation, TimerExpired};
use super::media::MediaSource;
use super::session::{CallContext, PeerSession, SessionError};
use super::transport::{ConnectionState, TransportEvent, TransportFactory};
use crate::database::{CallLogEntry, CallLogStore, DatabaseError};
use crate::identity::UserCode;
use crate::signaling::{ClientMessage, RelayChannel, RelayEvent, ServerMessage};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};

// ============================================================================
// EVENTS
// ============================================================================

/// Hinweise für den Benutzer (Dialoge, Toasts)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallNotice {
    /// Gegenüber hat abgelehnt
    Rejected,
    /// Keine Antwort innerhalb der Wartezeit
    Timeout,
    /// Anruf regulär beendet
    Ended,
    /// Kamera/Mikrofon nicht verfügbar
    MediaUnavailable(String),
    /// Relay oder Peer Session meldet einen Fehler
    Failed(String),
}

impl fmt::Display for CallNotice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rejected => write!(f, "The call was rejected"),
            Self::Timeout => write!(f, "No answer"),
            Self::Ended => write!(f, "Call ended"),
            Self::MediaUnavailable(reason) => {
                write!(f, "Camera or microphone unavailable: {}", reason)
            }
            Self::Failed(reason) => write!(f, "Call failed: {}", reason),
        }
    }
}

/// Events die von der CallEngine ausgelöst werden
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallEvent {
    RelayConnected,
    RelayDisconnected,
    Registered(UserCode),
    StateChanged(CallState),
    IncomingCall(IncomingInvitation),
    /// Eingehende Einladung ist verschwunden (zurückgezogen oder verpasst)
    IncomingDismissed,
    Notice(CallNotice),
    PeerMuted { is_audio_enabled: bool },
    MediaConnected,
    LogUpdated(CallLogEntry),
}

// ============================================================================
// COMMANDS
// ============================================================================

type Reply<T> = oneshot::Sender<Result<T, CallError>>;

enum Command {
    PlaceCall { target: String, reply: Reply<()> },
    CancelOutgoing { reply: Reply<()> },
    AcceptIncoming { reply: Reply<()> },
    RejectIncoming { reply: Reply<()> },
    HangUp { reply: Reply<()> },
    ToggleAudio { reply: Reply<bool> },
    ToggleVideo { reply: Reply<bool> },
    State { reply: Reply<CallState> },
    UserCode { reply: Reply<Option<UserCode>> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EndReason {
    LocalHangUp,
    RemoteEnded,
    PeerLeft,
    RelayLost,
    Shutdown,
}

// ============================================================================
// CALL ENGINE
// ============================================================================

/// Abhängigkeiten der Engine
pub struct EngineParts {
    pub relay: Arc<dyn RelayChannel>,
    pub inbound: mpsc::UnboundedReceiver<RelayEvent>,
    pub store: Arc<CallLogStore>,
    pub media: Arc<dyn MediaSource>,
    pub transports: Arc<dyn TransportFactory>,
    pub answer_timeout: Duration,
}

pub struct CallEngine {
    machine: CallMachine,
    session: PeerSession,
    relay: Arc<dyn RelayChannel>,
    store: Arc<CallLogStore>,
    events: broadcast::Sender<CallEvent>,
    inbound: mpsc::UnboundedReceiver<RelayEvent>,
    commands: mpsc::Receiver<Command>,
    timers: mpsc::UnboundedReceiver<TimerExpired>,
    transport_events: mpsc::UnboundedReceiver<TransportEvent>,
}

impl CallEngine {
    /// Erstellt die Engine und das zugehörige Handle
    pub fn new(parts: EngineParts) -> (Self, CallHandle) {
        let (event_tx, _) = broadcast::channel(100);
        let (command_tx, command_rx) = mpsc::channel(32);
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();

        let machine = CallMachine::new(
            Arc::clone(&parts.relay),
            Arc::clone(&parts.store),
            event_tx.clone(),
            parts.answer_timeout,
            timer_tx,
        );

        let session = PeerSession::new(
            Arc::clone(&parts.relay),
            parts.transports,
            parts.media,
            transport_tx,
        );

        let handle = CallHandle {
            commands: command_tx,
            events: event_tx.clone(),
            store: Arc::clone(&parts.store),
        };

        let engine = Self {
            machine,
            session,
            relay: parts.relay,
            store: parts.store,
            events: event_tx,
            inbound: parts.inbound,
            commands: command_rx,
            timers: timer_rx,
            transport_events: transport_rx,
        };

        (engine, handle)
    }

    /// Event-Schleife, läuft bis alle Handles gedroppt sind
    pub async fn run(mut self) {
        tracing::info!("Call engine started");
        let mut inbound_open = true;

        loop {
            tokio::select! {
                event = self.inbound.recv(), if inbound_open => match event {
                    Some(event) => self.handle_relay_event(event).await,
                    None => {
                        tracing::info!("Relay event stream closed");
                        inbound_open = false;
                    }
                },
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                Some(expired) = self.timers.recv() => self.machine.on_timer(expired),
                Some(event) = self.transport_events.recv() => self.handle_transport_event(event),
            }
        }

        self.teardown(EndReason::Shutdown).await;
        tracing::info!("Call engine stopped");
    }

    // ========================================================================
    // RELAY EVENTS
    // ========================================================================

    async fn handle_relay_event(&mut self, event: RelayEvent) {
        match event {
            RelayEvent::Connected => {
                let _ = self.events.send(CallEvent::RelayConnected);
                self.register();
            }
            RelayEvent::Disconnected => {
                tracing::warn!("Lost connection to relay");
                let _ = self.events.send(CallEvent::RelayDisconnected);
                self.teardown(EndReason::RelayLost).await;
            }
            RelayEvent::Message(msg) => self.handle_server_message(msg).await,
        }
    }

    /// Meldet sich mit dem zuletzt bekannten Code an (oder fordert einen an)
    fn register(&self) {
        let user_code = match self.machine.own_code() {
            Some(code) => Some(code.clone()),
            None => self.store.load_user_code().unwrap_or_else(|e| {
                tracing::warn!("Failed to load stored user code: {}", e);
                None
            }),
        };

        tracing::info!(
            "Registering with relay ({})",
            user_code
                .as_ref()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "new code".to_string())
        );

        if let Err(e) = self.relay.send(ClientMessage::Register { user_code }) {
            tracing::warn!("Failed to send register: {}", e);
        }
    }

    async fn handle_server_message(&mut self, msg: ServerMessage) {
        tracing::debug!("Relay event: {}", msg.name());

        match msg {
            ServerMessage::Registered { user_code, .. } => {
                if let Err(e) = self.store.save_user_code(&user_code) {
                    tracing::error!("Failed to store user code: {}", e);
                }
                self.machine.set_own_code(user_code.clone());
                let _ = self.events.send(CallEvent::Registered(user_code));
            }

            ServerMessage::CallInitiated { room_id } => self.machine.on_call_initiated(room_id),

            ServerMessage::IncomingCall {
                from,
                caller_name,
                room_id,
                caller_connection_id,
            } => self.machine.on_incoming_invitation(IncomingInvitation {
                caller_code: from,
                caller_name,
                room_id,
                caller_connection_id,
            }),

            ServerMessage::CallAccepted { room_id } => {
                match self.machine.on_invitation_accepted(&room_id) {
                    Some(context) => {
                        // Fehler wurden bereits in begin_session behandelt
                        let _ = self.begin_session(context).await;
                    }
                    None if !self.machine.owns_room(&room_id) => self.release_room(room_id),
                    None => {}
                }
            }

            ServerMessage::CallRejected => self.machine.on_invitation_rejected(),

            ServerMessage::CallCancelled => self.machine.on_remote_cancelled(),

            ServerMessage::CallError { message } => self.machine.on_call_error(message),

            ServerMessage::Offer { room_id, sdp, from } => {
                if self.machine.active_call().is_none() {
                    tracing::debug!("Ignoring offer outside of an active call");
                    return;
                }
                if let Err(e) = self.session.handle_remote_offer(&from, &room_id, sdp).await {
                    self.on_negotiation_error(e).await;
                }
            }

            ServerMessage::Answer { room_id, sdp, from } => {
                if let Err(e) = self.session.handle_remote_answer(&from, &room_id, sdp).await {
                    self.on_negotiation_error(e).await;
                }
            }

            ServerMessage::IceCandidate {
                room_id,
                candidate,
                from,
            } => {
                self.session
                    .handle_remote_candidate(&from, &room_id, candidate)
                    .await;
            }

            ServerMessage::CallEnded { socket_id } => {
                if !self.is_own_connection(&socket_id) {
                    self.teardown(EndReason::RemoteEnded).await;
                }
            }

            ServerMessage::PeerLeft { socket_id } => {
                if !self.is_own_connection(&socket_id) {
                    self.teardown(EndReason::PeerLeft).await;
                }
            }

            ServerMessage::PeerMuteStatus {
                is_audio_enabled, ..
            } => {
                let _ = self.events.send(CallEvent::PeerMuted { is_audio_enabled });
            }
        }
    }

    // ========================================================================
    // COMMANDS
    // ========================================================================

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::PlaceCall { target, reply } => {
                let _ = reply.send(self.machine.place_call(&target));
            }
            Command::CancelOutgoing { reply } => {
                let _ = reply.send(self.machine.cancel_outgoing());
            }
            Command::AcceptIncoming { reply } => {
                let result = match self.machine.accept_incoming() {
                    Ok(context) => self.begin_session(context).await,
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
            Command::RejectIncoming { reply } => {
                let _ = reply.send(self.machine.reject_incoming());
            }
            Command::HangUp { reply } => {
                let result = if self.machine.active_call().is_some() {
                    self.teardown(EndReason::LocalHangUp).await;
                    Ok(())
                } else {
                    Err(CallError::NoActiveCall)
                };
                let _ = reply.send(result);
            }
            Command::ToggleAudio { reply } => {
                let _ = reply.send(self.toggle_audio());
            }
            Command::ToggleVideo { reply } => {
                let result = match self.machine.active_call() {
                    Some(_) => self.session.toggle_video().map_err(CallError::from),
                    None => Err(CallError::NoActiveCall),
                };
                let _ = reply.send(result);
            }
            Command::State { reply } => {
                let _ = reply.send(Ok(self.machine.state().clone()));
            }
            Command::UserCode { reply } => {
                let _ = reply.send(Ok(self.machine.own_code().cloned()));
            }
        }
    }

    /// Mute umschalten und die Gegenseite informieren
    fn toggle_audio(&mut self) -> Result<bool, CallError> {
        let room_id = self
            .machine
            .active_call()
            .map(|call| call.room_id.clone())
            .ok_or(CallError::NoActiveCall)?;

        let is_audio_enabled = self.session.toggle_audio()?;

        if let Err(e) = self.relay.send(ClientMessage::MuteStatus {
            room_id,
            is_audio_enabled,
        }) {
            tracing::warn!("Failed to send mute status: {}", e);
        }

        Ok(is_audio_enabled)
    }

    // ========================================================================
    // TRANSPORT EVENTS
    // ========================================================================

    fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::LocalCandidate {
                generation,
                candidate,
            } => self.session.on_local_candidate(generation, candidate),
            TransportEvent::ConnectionState { generation, state } => {
                if generation != self.session.generation() {
                    return;
                }
                match state {
                    ConnectionState::Connected => {
                        tracing::info!("Media connected");
                        let _ = self.events.send(CallEvent::MediaConnected);
                    }
                    ConnectionState::Failed => {
                        tracing::warn!("Peer connection failed");
                    }
                    other => tracing::debug!("Peer connection state: {:?}", other),
                }
            }
        }
    }

    // ========================================================================
    // SESSION LIFECYCLE
    // ========================================================================

    async fn begin_session(&mut self, context: CallContext) -> Result<(), CallError> {
        match self.session.start(context).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.fail_session(e.clone()).await;
                Err(CallError::Session(e))
            }
        }
    }

    async fn on_negotiation_error(&mut self, error: SessionError) {
        match error {
            SessionError::MediaAccessDenied(_) => self.fail_session(error).await,
            other => tracing::error!("Negotiation error: {}", other),
        }
    }

    /// Lokaler Fehler im aktiven Call: aufräumen ohne Log-Eintrag
    async fn fail_session(&mut self, error: SessionError) {
        tracing::error!("Peer session failed: {}", error);

        if let Some(call) = self.machine.active_call() {
            if let Err(e) = self.relay.send(ClientMessage::EndCall {
                room_id: call.room_id.clone(),
            }) {
                tracing::debug!("Could not notify peer: {}", e);
            }
        }

        self.session.end_session().await;

        let notice = match error {
            SessionError::MediaAccessDenied(e) => CallNotice::MediaUnavailable(e.to_string()),
            other => CallNotice::Failed(other.to_string()),
        };
        self.machine.abort_active(notice);
    }

    /// Gemeinsamer Abbau für Auflegen, Gegenseite weg und Verbindungsverlust
    async fn teardown(&mut self, reason: EndReason) {
        let Some(call) = self.machine.active_call().cloned() else {
            return;
        };

        tracing::info!("Ending call in room {} ({:?})", call.room_id, reason);

        if reason == EndReason::LocalHangUp {
            if let Err(e) = self.relay.send(ClientMessage::EndCall {
                room_id: call.room_id.clone(),
            }) {
                tracing::warn!("Failed to send end-call: {}", e);
            }
        }

        let duration = self.session.end_session().await;
        if let Err(e) = self.machine.finish_active(duration) {
            tracing::warn!("Failed to finish call: {}", e);
        }
    }

    /// Der Callee hat eine hier schon verfallene Einladung angenommen und
    /// wartet sonst ewig auf das Offer
    fn release_room(&self, room_id: String) {
        tracing::info!("Releasing stale room {}", room_id);
        if let Err(e) = self.relay.send(ClientMessage::EndCall { room_id }) {
            tracing::debug!("Could not release room: {}", e);
        }
    }

    fn is_own_connection(&self, socket_id: &str) -> bool {
        self.relay.connection_id().as_deref() == Some(socket_id)
    }
}

impl fmt::Debug for CallEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallEngine")
            .field("machine", &self.machine)
            .field("session", &self.session)
            .finish()
    }
}

// ============================================================================
// CALL HANDLE
// ============================================================================

/// Steuerung der Engine vom Host aus (klonbar)
#[derive(Clone)]
pub struct CallHandle {
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<CallEvent>,
    store: Arc<CallLogStore>,
}

impl CallHandle {
    /// Gibt einen Event-Receiver zurück
    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }

    pub async fn place_call(&self, target: &str) -> Result<(), CallError> {
        let target = target.to_string();
        self.request(|reply| Command::PlaceCall { target, reply })
            .await
    }

    pub async fn cancel_outgoing(&self) -> Result<(), CallError> {
        self.request(|reply| Command::CancelOutgoing { reply }).await
    }

    pub async fn accept_incoming(&self) -> Result<(), CallError> {
        self.request(|reply| Command::AcceptIncoming { reply }).await
    }

    pub async fn reject_incoming(&self) -> Result<(), CallError> {
        self.request(|reply| Command::RejectIncoming { reply }).await
    }

    pub async fn hang_up(&self) -> Result<(), CallError> {
        self.request(|reply| Command::HangUp { reply }).await
    }

    /// Mikrofon umschalten, gibt den neuen Zustand zurück (`true` = an)
    pub async fn toggle_audio(&self) -> Result<bool, CallError> {
        self.request(|reply| Command::ToggleAudio { reply }).await
    }

    /// Kamera umschalten, gibt den neuen Zustand zurück (`true` = an)
    pub async fn toggle_video(&self) -> Result<bool, CallError> {
        self.request(|reply| Command::ToggleVideo { reply }).await
    }

    pub async fn state(&self) -> Result<CallState, CallError> {
        self.request(|reply| Command::State { reply }).await
    }

    pub async fn user_code(&self) -> Result<Option<UserCode>, CallError> {
        self.request(|reply| Command::UserCode { reply }).await
    }

    /// Anrufverlauf, neueste zuerst
    pub fn recent_calls(&self) -> Result<Vec<CallLogEntry>, DatabaseError> {
        self.store.recent()
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, CallError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .await
            .map_err(|_| CallError::EngineStopped)?;
        rx.await.map_err(|_| CallError::EngineStopped)?
    }
}

impl fmt::Debug for CallHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallHandle")
            .field("engine_running", &!self.commands.is_closed())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call_engine::fakes::{FakeMediaSource, FakeTransportFactory};
    use crate::call_engine::transport::SignalingState;
    use crate::database::{CallDirection, CallOutcome};
    use crate::signaling::{LocalConnection, LocalRelay};
    use tokio::sync::broadcast::error::TryRecvError;

    const TIMEOUT: Duration = Duration::from_secs(60);

    struct Client {
        handle: CallHandle,
        store: Arc<CallLogStore>,
        transports: Arc<FakeTransportFactory>,
        media: Arc<FakeMediaSource>,
        connection: Arc<LocalConnection>,
        events: broadcast::Receiver<CallEvent>,
    }

    impl Client {
        async fn state(&self) -> CallState {
            self.handle.state().await.unwrap()
        }

        fn log(&self) -> Vec<CallLogEntry> {
            self.store.recent().unwrap()
        }

        fn drain_events(&mut self) -> Vec<CallEvent> {
            let mut events = Vec::new();
            loop {
                match self.events.try_recv() {
                    Ok(event) => events.push(event),
                    Err(TryRecvError::Lagged(_)) => continue,
                    Err(_) => return events,
                }
            }
        }
    }

    fn code(raw: &str) -> UserCode {
        UserCode::parse(raw).unwrap()
    }

    fn spawn_client(relay: &LocalRelay, own: &str, media: FakeMediaSource) -> Client {
        spawn_client_with_timeout(relay, own, media, TIMEOUT)
    }

    fn spawn_client_with_timeout(
        relay: &LocalRelay,
        own: &str,
        media: FakeMediaSource,
        answer_timeout: Duration,
    ) -> Client {
        let (connection, inbound) = relay.connect();
        let connection = Arc::new(connection);
        let store = Arc::new(CallLogStore::open_in_memory().unwrap());
        store.save_user_code(&code(own)).unwrap();
        let transports = Arc::new(FakeTransportFactory::new());
        let media = Arc::new(media);

        let (engine, handle) = CallEngine::new(EngineParts {
            relay: Arc::clone(&connection) as Arc<dyn RelayChannel>,
            inbound,
            store: Arc::clone(&store),
            media: Arc::clone(&media) as Arc<dyn MediaSource>,
            transports: Arc::clone(&transports) as Arc<dyn TransportFactory>,
            answer_timeout,
        });
        let events = handle.subscribe();
        tokio::spawn(engine.run());

        Client {
            handle,
            store,
            transports,
            media,
            connection,
            events,
        }
    }

    /// Lässt alle Tasks laufen, bis nichts mehr zu tun ist
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    async fn pair() -> (LocalRelay, Client, Client) {
        let relay = LocalRelay::new();
        let alice = spawn_client(&relay, "123456", FakeMediaSource::new());
        let bob = spawn_client(&relay, "654321", FakeMediaSource::new());
        settle().await;
        (relay, alice, bob)
    }

    async fn connect_call(alice: &Client, bob: &Client) {
        alice.handle.place_call("654321").await.unwrap();
        settle().await;
        bob.handle.accept_incoming().await.unwrap();
        settle().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_registers_with_stored_code() {
        let (relay, alice, _bob) = pair().await;

        assert!(relay.is_registered(&code("123456")));
        assert_eq!(alice.handle.user_code().await.unwrap(), Some(code("123456")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_self_call_is_refused() {
        let (relay, alice, _bob) = pair().await;

        assert_eq!(
            alice.handle.place_call("123456").await,
            Err(CallError::SelfCall)
        );
        assert_eq!(relay.count("call"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_answered_call_negotiates_once() {
        let (relay, alice, bob) = pair().await;

        alice.handle.place_call("654321").await.unwrap();
        settle().await;
        assert!(matches!(bob.state().await, CallState::Incoming(_)));

        bob.handle.accept_incoming().await.unwrap();
        settle().await;

        assert!(matches!(alice.state().await, CallState::Active(_)));
        assert!(matches!(bob.state().await, CallState::Active(_)));
        assert_eq!(relay.count("offer"), 1);
        assert_eq!(relay.count("answer"), 1);

        let a = alice.transports.latest();
        let b = bob.transports.latest();
        assert_eq!(a.signaling_state(), SignalingState::Stable);
        assert_eq!(b.signaling_state(), SignalingState::Stable);

        // Jede Seite hat den Candidate der Gegenseite angewendet
        assert_eq!(a.applied_names(), vec!["local-2"]);
        assert_eq!(b.applied_names(), vec!["local-1"]);

        // Der Callee baut beim Offer neu auf, nur ein Transport lebt
        assert_eq!(bob.transports.live(), 1);
        assert_eq!(alice.transports.live(), 1);
        assert!(alice.log().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_call_times_out_on_both_sides() {
        let (relay, alice, bob) = pair().await;

        alice.handle.place_call("654321").await.unwrap();
        settle().await;

        tokio::time::sleep(TIMEOUT + Duration::from_secs(1)).await;

        assert_eq!(alice.state().await, CallState::Idle);
        assert_eq!(bob.state().await, CallState::Idle);

        let a = alice.log();
        assert_eq!(a.len(), 1);
        assert_eq!(a[0].outcome, CallOutcome::Timeout);
        assert_eq!(a[0].direction, CallDirection::Outgoing);
        assert_eq!(a[0].peer_code, code("654321"));

        let b = bob.log();
        assert_eq!(b.len(), 1);
        assert_eq!(b[0].outcome, CallOutcome::NoAnswer);
        assert_eq!(b[0].direction, CallDirection::Incoming);
        assert_eq!(b[0].peer_code, code("123456"));

        assert_eq!(relay.count("cancel-call"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_accept_releases_callee() {
        let relay = LocalRelay::new();
        let alice = spawn_client(&relay, "123456", FakeMediaSource::new());
        let bob = spawn_client_with_timeout(
            &relay,
            "654321",
            FakeMediaSource::new(),
            TIMEOUT + Duration::from_secs(1),
        );
        settle().await;

        alice.handle.place_call("654321").await.unwrap();
        settle().await;
        tokio::time::sleep(TIMEOUT).await;

        // Caller ist schon im Timeout, Callee klingelt noch
        assert_eq!(alice.state().await, CallState::Idle);
        assert!(matches!(bob.state().await, CallState::Incoming(_)));

        bob.handle.accept_incoming().await.unwrap();
        settle().await;

        assert_eq!(alice.state().await, CallState::Idle);
        assert_eq!(alice.transports.created(), 0);
        assert_eq!(relay.count("offer"), 0);
        assert_eq!(relay.count("end-call"), 1);

        assert_eq!(bob.state().await, CallState::Idle);
        assert_eq!(bob.transports.live(), 0);
        assert_eq!(bob.media.acquired(), 1);
        assert_eq!(bob.media.stopped(), 1);

        let a = alice.log();
        assert_eq!(a.len(), 1);
        assert_eq!(a[0].outcome, CallOutcome::Timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn test_caller_cancels_while_ringing() {
        let (_relay, mut alice, bob) = pair().await;

        alice.handle.place_call("654321").await.unwrap();
        settle().await;
        tokio::time::sleep(Duration::from_secs(2)).await;

        alice.handle.cancel_outgoing().await.unwrap();
        settle().await;

        assert_eq!(bob.state().await, CallState::Idle);
        assert!(bob.log().is_empty());

        let a = alice.log();
        assert_eq!(a.len(), 1);
        assert_eq!(a[0].outcome, CallOutcome::Cancelled);

        // Abgebrochene Timer feuern nicht mehr
        tokio::time::sleep(TIMEOUT * 2).await;
        assert!(bob.log().is_empty());
        assert_eq!(alice.log().len(), 1);
        assert!(!alice
            .drain_events()
            .contains(&CallEvent::Notice(CallNotice::Timeout)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_cancel_falls_back_to_callee_timeout() {
        let (relay, alice, bob) = pair().await;
        relay.drop_next("cancel-call");

        alice.handle.place_call("654321").await.unwrap();
        settle().await;
        alice.handle.cancel_outgoing().await.unwrap();
        settle().await;

        assert!(matches!(bob.state().await, CallState::Incoming(_)));

        tokio::time::sleep(TIMEOUT + Duration::from_secs(1)).await;

        assert_eq!(bob.state().await, CallState::Idle);
        assert_eq!(bob.log()[0].outcome, CallOutcome::NoAnswer);
        assert_eq!(alice.log().len(), 1);
        assert_eq!(alice.log()[0].outcome, CallOutcome::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_callee_rejects() {
        let (_relay, mut alice, bob) = pair().await;

        alice.handle.place_call("654321").await.unwrap();
        settle().await;
        bob.handle.reject_incoming().await.unwrap();
        settle().await;

        assert_eq!(alice.state().await, CallState::Idle);
        assert_eq!(alice.log()[0].outcome, CallOutcome::Rejected);
        assert_eq!(bob.log()[0].outcome, CallOutcome::Rejected);
        assert!(alice
            .drain_events()
            .contains(&CallEvent::Notice(CallNotice::Rejected)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hang_up_releases_everything_on_both_sides() {
        let (relay, alice, bob) = pair().await;
        connect_call(&alice, &bob).await;

        tokio::time::sleep(Duration::from_secs(30)).await;
        alice.handle.hang_up().await.unwrap();
        settle().await;

        assert_eq!(alice.state().await, CallState::Idle);
        assert_eq!(bob.state().await, CallState::Idle);
        assert_eq!(relay.count("end-call"), 1);

        for client in [&alice, &bob] {
            assert_eq!(client.transports.live(), 0);
            assert_eq!(client.media.stopped(), 1);

            let log = client.log();
            assert_eq!(log.len(), 1);
            assert_eq!(log[0].outcome, CallOutcome::Completed);
            assert_eq!(log[0].duration_secs, Some(30));
        }
        assert_eq!(alice.log()[0].direction, CallDirection::Outgoing);
        assert_eq!(bob.log()[0].direction, CallDirection::Incoming);

        assert_eq!(alice.handle.hang_up().await, Err(CallError::NoActiveCall));
    }

    #[tokio::test(start_paused = true)]
    async fn test_peer_disconnect_ends_call() {
        let (_relay, alice, bob) = pair().await;
        connect_call(&alice, &bob).await;

        bob.connection.disconnect();
        settle().await;

        assert_eq!(alice.state().await, CallState::Idle);
        assert_eq!(alice.transports.live(), 0);
        assert_eq!(alice.log()[0].outcome, CallOutcome::Completed);

        // Auch die getrennte Seite räumt auf
        assert_eq!(bob.state().await, CallState::Idle);
        assert_eq!(bob.transports.live(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_callee_rejects_second_caller() {
        let (relay, alice, bob) = pair().await;
        let mut carol = spawn_client(&relay, "111111", FakeMediaSource::new());
        settle().await;
        connect_call(&alice, &bob).await;

        carol.handle.place_call("654321").await.unwrap();
        settle().await;

        assert!(matches!(bob.state().await, CallState::Active(_)));
        assert_eq!(carol.state().await, CallState::Idle);
        assert_eq!(carol.log()[0].outcome, CallOutcome::Rejected);
        assert!(!carol.drain_events().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_media_denied_aborts_accept() {
        let relay = LocalRelay::new();
        let alice = spawn_client(&relay, "123456", FakeMediaSource::new());
        let mut bob = spawn_client(&relay, "654321", FakeMediaSource::denying());
        settle().await;

        alice.handle.place_call("654321").await.unwrap();
        settle().await;

        let result = bob.handle.accept_incoming().await;
        assert!(matches!(
            result,
            Err(CallError::Session(SessionError::MediaAccessDenied(_)))
        ));
        settle().await;

        assert_eq!(bob.state().await, CallState::Idle);
        assert_eq!(bob.transports.created(), 0);
        assert!(bob.log().is_empty());
        assert!(bob
            .drain_events()
            .iter()
            .any(|e| matches!(e, CallEvent::Notice(CallNotice::MediaUnavailable(_)))));

        // Die Gegenseite wird nicht hängen gelassen
        assert_eq!(alice.state().await, CallState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mute_is_reported_to_peer() {
        let (_relay, alice, mut bob) = pair().await;
        connect_call(&alice, &bob).await;
        bob.drain_events();

        assert_eq!(alice.handle.toggle_audio().await, Ok(false));
        assert_eq!(alice.handle.toggle_video().await, Ok(false));
        settle().await;

        let events = bob.drain_events();
        assert!(events.contains(&CallEvent::PeerMuted {
            is_audio_enabled: false
        }));
        assert_eq!(events.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_toggles_without_call_fail() {
        let (_relay, alice, _bob) = pair().await;

        assert_eq!(
            alice.handle.toggle_audio().await,
            Err(CallError::NoActiveCall)
        );
        assert_eq!(
            alice.handle.accept_incoming().await,
            Err(CallError::NoIncomingCall)
        );
        assert_eq!(
            alice.handle.cancel_outgoing().await,
            Err(CallError::NotRinging)
        );
    }
}
