//! callcore - Signaling-Kern für P2P Audio/Video Calls
//!
//! Ein Client meldet sich unter einem 6-stelligen User Code beim Relay an,
//! lädt andere Codes zu Anrufen ein und handelt danach über das Relay eine
//! direkte WebRTC-Verbindung aus:
//! - WebSocket-Relay als Vermittler (Directory + Raum-Broadcast)
//! - Invitation State Machine mit 60s Timeout auf beiden Seiten
//! - Offer/Answer mit gepufferten ICE Candidates
//! - SQLite für den lokalen Anrufverlauf

pub mod call_engine;
pub mod config;
pub mod database;
pub mod identity;
pub mod signaling;

use call_engine::{CallEngine, CallHandle, DeviceMediaSource, EngineParts, RtcTransportFactory};
use config::ClientConfig;
use database::{CallLogStore, DatabaseError};
use signaling::{RelayChannel, SignalingClient, SignalingError};
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Signaling error: {0}")]
    Signaling(#[from] SignalingError),
}

// ============================================================================
// LOGGING
// ============================================================================

/// Initialisiert tracing (mehrfacher Aufruf ist harmlos)
pub fn init_logging() {
    let mut filter = tracing_subscriber::EnvFilter::from_default_env();
    for directive in ["callcore=debug", "webrtc=warn"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

// ============================================================================
// STARTUP
// ============================================================================

/// Startet den Client: Anrufverlauf öffnen, Relay verbinden, Engine starten
///
/// Gibt das Handle zur Steuerung und den Task der Engine zurück.
pub fn start(config: &ClientConfig) -> Result<(CallHandle, JoinHandle<()>), AppError> {
    tracing::info!("Starting callcore...");

    let store = Arc::new(CallLogStore::open(&config.data_dir)?);
    tracing::info!("Database opened");

    let (client, inbound) = SignalingClient::spawn(&config.signaling_url, config.retry_delay)?;
    let relay: Arc<dyn RelayChannel> = Arc::new(client);

    let (engine, handle) = CallEngine::new(EngineParts {
        relay,
        inbound,
        store,
        media: Arc::new(DeviceMediaSource::new()),
        transports: Arc::new(RtcTransportFactory::new(&config.ice_servers)),
        answer_timeout: config.answer_timeout,
    });

    let task = tokio::spawn(engine.run());

    Ok((handle, task))
}
