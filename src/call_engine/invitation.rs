//! Call Invitation State Machine
//!
//! Verwaltet pro Client genau einen Anruf-Slot:
//! `Idle → Ringing → Active` (ausgehend) bzw. `Idle → Incoming → Active`
//! (eingehend). Jeder Ausgang eines Anrufversuchs schreibt genau einen
//! Eintrag in den Anrufverlauf.

use super::engine::{CallEvent, CallNotice};
use super::session::{CallContext, NegotiationRole, SessionError};
use crate::database::{CallDirection, CallLogEntry, CallLogStore, CallOutcome};
use crate::identity::{CodeError, UserCode};
use crate::signaling::{ClientMessage, RelayChannel};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    #[error("Invalid user code: {0}")]
    InvalidCode(#[from] CodeError),

    #[error("Cannot call your own user code")]
    SelfCall,

    #[error("Not connected to the relay")]
    NotConnected,

    #[error("Not registered with the relay yet")]
    NotRegistered,

    #[error("Already in a call")]
    AlreadyInCall,

    #[error("No outgoing call is ringing")]
    NotRinging,

    #[error("No incoming call to answer")]
    NoIncomingCall,

    #[error("No active call")]
    NoActiveCall,

    #[error("Peer session failed: {0}")]
    Session(#[from] SessionError),

    #[error("Call engine has stopped")]
    EngineStopped,
}

// ============================================================================
// CALL STATE
// ============================================================================

/// Ausgehende Einladung, die noch klingelt
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingCall {
    pub target_code: UserCode,
    pub room_id: String,
}

/// Eingehende Einladung, auf die noch nicht reagiert wurde
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingInvitation {
    pub caller_code: UserCode,
    pub caller_name: String,
    pub room_id: String,
    pub caller_connection_id: String,
}

/// Laufender Anruf
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveCall {
    pub peer_code: UserCode,
    pub room_id: String,
    pub direction: CallDirection,
}

/// Aktueller Status des Anruf-Slots
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum CallState {
    /// Kein Anruf
    #[default]
    Idle,
    /// Ausgehender Anruf klingelt beim Gegenüber
    Ringing(OutgoingCall),
    /// Eingehender Anruf wartet auf Antwort
    Incoming(IncomingInvitation),
    /// Anruf aktiv, Peer Session läuft
    Active(ActiveCall),
}

impl CallState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Ringing(_) => "ringing",
            Self::Incoming(_) => "incoming",
            Self::Active(_) => "active",
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }
}

// ============================================================================
// INVITE TIMER
// ============================================================================

/// Meldung eines abgelaufenen Einladungs-Timers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerExpired {
    pub generation: u64,
}

/// Ein-Schuss-Timer für unbeantwortete Einladungen
///
/// Abbrechen stoppt den Task; zusätzlich wird jede Meldung gegen die
/// aktuell scharfe Generation geprüft, damit eine bereits verschickte
/// Meldung nach dem Abbruch wirkungslos bleibt.
struct InviteTimer {
    timeout: Duration,
    tx: mpsc::UnboundedSender<TimerExpired>,
    generation: u64,
    armed: Option<u64>,
    handle: Option<JoinHandle<()>>,
}

impl InviteTimer {
    fn new(timeout: Duration, tx: mpsc::UnboundedSender<TimerExpired>) -> Self {
        Self {
            timeout,
            tx,
            generation: 0,
            armed: None,
            handle: None,
        }
    }

    fn start(&mut self) {
        self.cancel();
        self.generation += 1;

        let generation = self.generation;
        let timeout = self.timeout;
        let tx = self.tx.clone();

        self.armed = Some(generation);
        self.handle = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = tx.send(TimerExpired { generation });
        }));
    }

    fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
        self.armed = None;
    }

    /// Nimmt eine Ablauf-Meldung entgegen; `true` nur für die scharfe Generation
    fn fire(&mut self, expired: TimerExpired) -> bool {
        if self.armed != Some(expired.generation) {
            return false;
        }
        self.armed = None;
        self.handle = None;
        true
    }
}

impl Drop for InviteTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}

// ============================================================================
// CALL MACHINE
// ============================================================================

pub struct CallMachine {
    state: CallState,
    own_code: Option<UserCode>,
    relay: Arc<dyn RelayChannel>,
    store: Arc<CallLogStore>,
    events: broadcast::Sender<CallEvent>,
    timer: InviteTimer,
}

impl CallMachine {
    pub fn new(
        relay: Arc<dyn RelayChannel>,
        store: Arc<CallLogStore>,
        events: broadcast::Sender<CallEvent>,
        answer_timeout: Duration,
        timers: mpsc::UnboundedSender<TimerExpired>,
    ) -> Self {
        Self {
            state: CallState::Idle,
            own_code: None,
            relay,
            store,
            events,
            timer: InviteTimer::new(answer_timeout, timers),
        }
    }

    pub fn state(&self) -> &CallState {
        &self.state
    }

    pub fn own_code(&self) -> Option<&UserCode> {
        self.own_code.as_ref()
    }

    pub fn set_own_code(&mut self, code: UserCode) {
        self.own_code = Some(code);
    }

    pub fn active_call(&self) -> Option<&ActiveCall> {
        match &self.state {
            CallState::Active(call) => Some(call),
            _ => None,
        }
    }

    /// Gehört der Raum zum aktuellen Einladungs- oder Gesprächszustand?
    pub fn owns_room(&self, room_id: &str) -> bool {
        match &self.state {
            CallState::Idle => false,
            CallState::Ringing(call) => call.room_id == room_id,
            CallState::Incoming(invitation) => invitation.room_id == room_id,
            CallState::Active(call) => call.room_id == room_id,
        }
    }

    // ========================================================================
    // OUTGOING
    // ========================================================================

    /// Lädt einen anderen User Code zu einem Anruf ein
    pub fn place_call(&mut self, target: &str) -> Result<(), CallError> {
        let target_code = UserCode::parse(target)?;

        if self.own_code.as_ref() == Some(&target_code) {
            return Err(CallError::SelfCall);
        }
        if !self.relay.is_connected() {
            return Err(CallError::NotConnected);
        }
        let own_code = self.own_code.clone().ok_or(CallError::NotRegistered)?;
        if !self.state.is_idle() {
            return Err(CallError::AlreadyInCall);
        }

        let room_id = uuid::Uuid::new_v4().to_string();

        self.relay
            .send(ClientMessage::Call {
                target_code: target_code.clone(),
                caller_name: own_code.to_string(),
                room_id: room_id.clone(),
            })
            .map_err(|e| {
                tracing::warn!("Failed to send call invitation: {}", e);
                CallError::NotConnected
            })?;

        tracing::info!("Calling {} in room {}", target_code, room_id);
        self.set_state(CallState::Ringing(OutgoingCall {
            target_code,
            room_id,
        }));
        self.timer.start();

        Ok(())
    }

    /// Übernimmt die vom Relay bestätigte Room-ID
    pub fn on_call_initiated(&mut self, room_id: String) {
        match &mut self.state {
            CallState::Ringing(call) if call.room_id != room_id => {
                tracing::info!("Relay assigned room {} (was {})", room_id, call.room_id);
                call.room_id = room_id;
            }
            CallState::Ringing(_) => {
                tracing::debug!("Relay confirmed room {}", room_id);
            }
            other => {
                tracing::debug!("Ignoring call-initiated while {}", other.name());
            }
        }
    }

    /// Gegenüber hat angenommen
    ///
    /// Gibt den Kontext für die Peer Session zurück, oder `None` wenn die
    /// Annahme veraltet ist (Timeout/Abbruch schon passiert).
    pub fn on_invitation_accepted(&mut self, room_id: &str) -> Option<CallContext> {
        let call = match &self.state {
            CallState::Ringing(call) if call.room_id == room_id => call.clone(),
            CallState::Ringing(call) => {
                tracing::warn!(
                    "Ignoring call-accepted for room {} (ringing in {})",
                    room_id,
                    call.room_id
                );
                return None;
            }
            other => {
                tracing::warn!("Ignoring late call-accepted while {}", other.name());
                return None;
            }
        };

        self.timer.cancel();
        tracing::info!("Call accepted by {}", call.target_code);

        let context = CallContext {
            room_id: call.room_id.clone(),
            peer_code: call.target_code.clone(),
            direction: CallDirection::Outgoing,
            role: NegotiationRole::Offerer,
        };

        self.set_state(CallState::Active(ActiveCall {
            peer_code: call.target_code,
            room_id: call.room_id,
            direction: CallDirection::Outgoing,
        }));

        Some(context)
    }

    /// Gegenüber hat abgelehnt
    pub fn on_invitation_rejected(&mut self) {
        let CallState::Ringing(call) = &self.state else {
            tracing::debug!("Ignoring call-rejected while {}", self.state.name());
            return;
        };
        let target = call.target_code.clone();

        self.timer.cancel();
        tracing::info!("Call rejected by {}", target);
        self.set_state(CallState::Idle);
        self.record(CallDirection::Outgoing, target, CallOutcome::Rejected, None);
        self.notify(CallNotice::Rejected);
    }

    /// Anrufer zieht die Einladung zurück
    pub fn cancel_outgoing(&mut self) -> Result<(), CallError> {
        let CallState::Ringing(call) = &self.state else {
            return Err(CallError::NotRinging);
        };
        let target = call.target_code.clone();

        self.timer.cancel();

        // Geht die Absage verloren, greift der Timer auf der Gegenseite
        if let Err(e) = self.relay.send(ClientMessage::CancelCall {
            target_code: target.clone(),
        }) {
            tracing::warn!("Failed to send cancel-call: {}", e);
        }

        tracing::info!("Cancelled call to {}", target);
        self.set_state(CallState::Idle);
        self.record(CallDirection::Outgoing, target, CallOutcome::Cancelled, None);

        Ok(())
    }

    /// Relay meldet einen Fehler zur laufenden Einladung
    pub fn on_call_error(&mut self, message: String) {
        tracing::warn!("Relay reported call error: {}", message);

        if matches!(self.state, CallState::Ringing(_)) {
            self.timer.cancel();
            self.set_state(CallState::Idle);
        }
        self.notify(CallNotice::Failed(message));
    }

    // ========================================================================
    // INCOMING
    // ========================================================================

    /// Eingehende Einladung
    ///
    /// Ist der Slot belegt, wird automatisch abgelehnt und nichts angezeigt.
    pub fn on_incoming_invitation(&mut self, invitation: IncomingInvitation) {
        if !self.state.is_idle() {
            tracing::info!(
                "Busy ({}), rejecting call from {}",
                self.state.name(),
                invitation.caller_code
            );
            if let Err(e) = self.relay.send(ClientMessage::RejectCall {
                caller_connection_id: invitation.caller_connection_id,
            }) {
                tracing::warn!("Failed to send reject-call: {}", e);
            }
            return;
        }

        tracing::info!(
            "Incoming call from {} in room {}",
            invitation.caller_code,
            invitation.room_id
        );
        self.set_state(CallState::Incoming(invitation.clone()));
        self.timer.start();
        let _ = self.events.send(CallEvent::IncomingCall(invitation));
    }

    /// Nimmt die eingehende Einladung an
    pub fn accept_incoming(&mut self) -> Result<CallContext, CallError> {
        let CallState::Incoming(invitation) = &self.state else {
            return Err(CallError::NoIncomingCall);
        };
        let invitation = invitation.clone();

        self.relay
            .send(ClientMessage::AcceptCall {
                room_id: invitation.room_id.clone(),
                caller_connection_id: invitation.caller_connection_id.clone(),
            })
            .map_err(|e| {
                tracing::warn!("Failed to send accept-call: {}", e);
                CallError::NotConnected
            })?;

        self.timer.cancel();
        tracing::info!("Accepted call from {}", invitation.caller_code);

        let context = CallContext {
            room_id: invitation.room_id.clone(),
            peer_code: invitation.caller_code.clone(),
            direction: CallDirection::Incoming,
            role: NegotiationRole::Answerer,
        };

        self.set_state(CallState::Active(ActiveCall {
            peer_code: invitation.caller_code,
            room_id: invitation.room_id,
            direction: CallDirection::Incoming,
        }));

        Ok(context)
    }

    /// Lehnt die eingehende Einladung ab
    pub fn reject_incoming(&mut self) -> Result<(), CallError> {
        let CallState::Incoming(invitation) = &self.state else {
            return Err(CallError::NoIncomingCall);
        };
        let invitation = invitation.clone();

        self.timer.cancel();

        if let Err(e) = self.relay.send(ClientMessage::RejectCall {
            caller_connection_id: invitation.caller_connection_id,
        }) {
            tracing::warn!("Failed to send reject-call: {}", e);
        }

        tracing::info!("Rejected call from {}", invitation.caller_code);
        self.set_state(CallState::Idle);
        self.record(
            CallDirection::Incoming,
            invitation.caller_code,
            CallOutcome::Rejected,
            None,
        );

        Ok(())
    }

    /// Anrufer hat die Einladung zurückgezogen (kein Log-Eintrag auf dieser Seite)
    pub fn on_remote_cancelled(&mut self) {
        let CallState::Incoming(invitation) = &self.state else {
            tracing::debug!("Ignoring call-cancelled while {}", self.state.name());
            return;
        };

        tracing::info!("Call from {} was cancelled", invitation.caller_code);
        self.timer.cancel();
        self.set_state(CallState::Idle);
        let _ = self.events.send(CallEvent::IncomingDismissed);
    }

    // ========================================================================
    // TIMEOUT
    // ========================================================================

    /// Einladungs-Timer abgelaufen
    pub fn on_timer(&mut self, expired: TimerExpired) {
        if !self.timer.fire(expired) {
            tracing::debug!("Ignoring stale timer {}", expired.generation);
            return;
        }

        match self.state.clone() {
            CallState::Ringing(call) => {
                tracing::info!("No answer from {}, giving up", call.target_code);
                self.set_state(CallState::Idle);
                self.record(
                    CallDirection::Outgoing,
                    call.target_code,
                    CallOutcome::Timeout,
                    None,
                );
                self.notify(CallNotice::Timeout);
            }
            CallState::Incoming(invitation) => {
                tracing::info!("Missed call from {}", invitation.caller_code);
                self.set_state(CallState::Idle);
                self.record(
                    CallDirection::Incoming,
                    invitation.caller_code,
                    CallOutcome::NoAnswer,
                    None,
                );
                let _ = self.events.send(CallEvent::IncomingDismissed);
            }
            other => {
                tracing::debug!("Timer fired while {}, ignoring", other.name());
            }
        }
    }

    // ========================================================================
    // ACTIVE
    // ========================================================================

    /// Beendet den aktiven Anruf regulär und schreibt den Log-Eintrag
    pub fn finish_active(&mut self, duration: Option<Duration>) -> Result<(), CallError> {
        let call = self.active_call().cloned().ok_or(CallError::NoActiveCall)?;

        tracing::info!("Call with {} ended", call.peer_code);
        self.set_state(CallState::Idle);
        self.record(
            call.direction,
            call.peer_code,
            CallOutcome::Completed,
            duration,
        );
        self.notify(CallNotice::Ended);

        Ok(())
    }

    /// Bricht den aktiven Anruf nach einem lokalen Fehler ab (kein Log-Eintrag)
    pub fn abort_active(&mut self, notice: CallNotice) {
        if self.active_call().is_none() {
            return;
        }

        tracing::warn!("Aborting call: {}", notice);
        self.set_state(CallState::Idle);
        self.notify(notice);
    }

    // ========================================================================
    // PRIVATE METHODS
    // ========================================================================

    fn set_state(&mut self, new_state: CallState) {
        tracing::debug!("Call state: {} -> {}", self.state.name(), new_state.name());
        self.state = new_state;
        let _ = self.events.send(CallEvent::StateChanged(self.state.clone()));
    }

    fn notify(&self, notice: CallNotice) {
        let _ = self.events.send(CallEvent::Notice(notice));
    }

    fn record(
        &self,
        direction: CallDirection,
        peer_code: UserCode,
        outcome: CallOutcome,
        duration: Option<Duration>,
    ) {
        let entry = CallLogEntry::new(direction, peer_code, outcome, duration);
        if let Err(e) = self.store.append(&entry) {
            tracing::error!("Failed to write call log entry: {}", e);
        }
        let _ = self.events.send(CallEvent::LogUpdated(entry));
    }
}

impl std::fmt::Debug for CallMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallMachine")
            .field("state", &self.state)
            .field("own_code", &self.own_code)
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
