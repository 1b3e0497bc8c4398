//! Client-Konfiguration
//!
//! Wird aus Umgebungsvariablen gelesen:
//!
//! | Variable                   | Default                   |
//! |----------------------------|---------------------------|
//! | `SIGNALING_URL`            | `http://localhost:3001`   |
//! | `TURN_URL`                 | (kein TURN Server)        |
//! | `TURN_USERNAME`            | leer                      |
//! | `TURN_CREDENTIAL`          | leer                      |
//! | `CALL_ANSWER_TIMEOUT_SECS` | `60`                      |
//! | `RELAY_RETRY_SECS`         | `3`                       |
//! | `CALLCORE_DATA_DIR`        | Plattform-Datenverzeichnis |

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

// ============================================================================
// CONSTANTS
// ============================================================================

pub const DEFAULT_SIGNALING_URL: &str = "http://localhost:3001";

/// Wartezeit bis eine unbeantwortete Einladung verfällt
pub const DEFAULT_ANSWER_TIMEOUT: Duration = Duration::from_secs(60);

/// Wartezeit zwischen Reconnect-Versuchen zum Relay
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(3);

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {name}: {value}")]
    InvalidValue { name: &'static str, value: String },

    #[error("Could not determine data directory")]
    NoDataDir,
}

// ============================================================================
// ICE SERVERS
// ============================================================================

/// STUN/TURN Server für die Peer Connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    pub username: String,
    pub credential: String,
}

impl IceServerConfig {
    /// STUN Server ohne Zugangsdaten
    pub fn stun(url: &str) -> Self {
        Self {
            urls: vec![url.to_string()],
            username: String::new(),
            credential: String::new(),
        }
    }
}

/// Öffentliche STUN Server (reichen für die meisten Verbindungen)
pub fn default_ice_servers() -> Vec<IceServerConfig> {
    vec![
        IceServerConfig::stun("stun:stun.l.google.com:19302"),
        IceServerConfig::stun("stun:stun1.l.google.com:19302"),
    ]
}

// ============================================================================
// CLIENT CONFIG
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub signaling_url: String,
    pub ice_servers: Vec<IceServerConfig>,
    pub answer_timeout: Duration,
    pub retry_delay: Duration,
    pub data_dir: PathBuf,
}

impl ClientConfig {
    /// Liest die Konfiguration aus der Prozess-Umgebung
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let signaling_url = lookup("SIGNALING_URL")
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_SIGNALING_URL.to_string());

        let mut ice_servers = default_ice_servers();
        if let Some(url) = lookup("TURN_URL").filter(|v| !v.trim().is_empty()) {
            ice_servers.push(IceServerConfig {
                urls: vec![url],
                username: lookup("TURN_USERNAME").unwrap_or_default(),
                credential: lookup("TURN_CREDENTIAL").unwrap_or_default(),
            });
        }

        let answer_timeout = parse_secs(&lookup, "CALL_ANSWER_TIMEOUT_SECS")?
            .unwrap_or(DEFAULT_ANSWER_TIMEOUT);
        let retry_delay =
            parse_secs(&lookup, "RELAY_RETRY_SECS")?.unwrap_or(DEFAULT_RETRY_DELAY);

        let data_dir = match lookup("CALLCORE_DATA_DIR").filter(|v| !v.trim().is_empty()) {
            Some(dir) => PathBuf::from(dir),
            None => default_data_dir()?,
        };

        Ok(Self {
            signaling_url,
            ice_servers,
            answer_timeout,
            retry_delay,
            data_dir,
        })
    }
}

fn parse_secs(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<Option<Duration>, ConfigError> {
    let Some(raw) = lookup(name).filter(|v| !v.trim().is_empty()) else {
        return Ok(None);
    };

    match raw.trim().parse::<u64>() {
        Ok(secs) if secs > 0 => Ok(Some(Duration::from_secs(secs))),
        _ => Err(ConfigError::InvalidValue { name, value: raw }),
    }
}

/// Plattform-Datenverzeichnis (z.B. `~/.local/share/callcore`)
pub fn default_data_dir() -> Result<PathBuf, ConfigError> {
    directories::ProjectDirs::from("com", "callcore", "callcore")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .ok_or(ConfigError::NoDataDir)
}

// ============================================================================
// TESTS
// ============================================================================
