//! Call Log Database
//!
//! SQLite-Datenbank für den lokalen Anrufverlauf.
//! Speichert die letzten 50 Anrufversuche und den zuletzt verwendeten User Code.

use crate::identity::UserCode;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Maximale Anzahl gespeicherter Einträge (älteste werden verdrängt)
pub const MAX_CALL_LOG_ENTRIES: usize = 50;

const DATABASE_FILE: &str = "callcore.db";

const USER_CODE_KEY: &str = "user_code";

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Failed to create database directory: {0}")]
    DirectoryCreation(#[from] std::io::Error),
}

// ============================================================================
// CALL LOG ENTRY
// ============================================================================

/// Richtung eines Anrufs aus lokaler Sicht
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallDirection {
    Outgoing,
    Incoming,
}

impl CallDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Outgoing => "outgoing",
            Self::Incoming => "incoming",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "outgoing" => Some(Self::Outgoing),
            "incoming" => Some(Self::Incoming),
            _ => None,
        }
    }
}

/// Ausgang eines Anrufversuchs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CallOutcome {
    Completed,
    Rejected,
    Cancelled,
    Timeout,
    NoAnswer,
}

impl CallOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Rejected => "rejected",
            Self::Cancelled => "cancelled",
            Self::Timeout => "timeout",
            Self::NoAnswer => "no-answer",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "completed" => Some(Self::Completed),
            "rejected" => Some(Self::Rejected),
            "cancelled" => Some(Self::Cancelled),
            "timeout" => Some(Self::Timeout),
            "no-answer" => Some(Self::NoAnswer),
            _ => None,
        }
    }
}

/// Ein Eintrag im Anrufverlauf, erzeugt beim Endereignis jedes Anrufversuchs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallLogEntry {
    pub id: String,
    pub direction: CallDirection,
    pub peer_code: UserCode,
    pub timestamp: DateTime<Utc>,
    pub duration_secs: Option<u64>,
    pub outcome: CallOutcome,
}

impl CallLogEntry {
    /// Neuer Eintrag mit aktuellem Zeitstempel
    pub fn new(
        direction: CallDirection,
        peer_code: UserCode,
        outcome: CallOutcome,
        duration: Option<Duration>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            direction,
            peer_code,
            timestamp: Utc::now(),
            duration_secs: duration.map(|d| d.as_secs()),
            outcome,
        }
    }
}

// ============================================================================
// DATABASE
// ============================================================================

/// SQLite-Datenbank für Anrufverlauf und Einstellungen (Thread-safe durch Mutex)
pub struct CallLogStore {
    conn: Mutex<Connection>,
}

impl CallLogStore {
    /// Öffnet oder erstellt die Datenbank im angegebenen Verzeichnis
    pub fn open(data_dir: &Path) -> Result<Self, DatabaseError> {
        std::fs::create_dir_all(data_dir)?;

        let db_path = data_dir.join(DATABASE_FILE);
        tracing::info!("Opening database at {:?}", db_path);

        let conn = Connection::open(&db_path)?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;

        Ok(db)
    }

    /// In-Memory Datenbank (Tests, Demos ohne Persistenz)
    pub fn open_in_memory() -> Result<Self, DatabaseError> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;
        Ok(db)
    }

    /// Initialisiert das Datenbank-Schema
    fn init_schema(&self) -> Result<(), DatabaseError> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS call_log (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                direction TEXT NOT NULL,
                peer_code TEXT NOT NULL,
                timestamp_ms INTEGER NOT NULL,
                duration_secs INTEGER,
                outcome TEXT NOT NULL
            )
            "#,
            [],
        )?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )
            "#,
            [],
        )?;

        Ok(())
    }

    /// Hängt einen Eintrag an und verdrängt alles jenseits der letzten 50
    pub fn append(&self, entry: &CallLogEntry) -> Result<(), DatabaseError> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO call_log (id, direction, peer_code, timestamp_ms, duration_secs, outcome)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                entry.id,
                entry.direction.as_str(),
                entry.peer_code.as_str(),
                entry.timestamp.timestamp_millis(),
                entry.duration_secs.map(|d| d as i64),
                entry.outcome.as_str(),
            ],
        )?;

        conn.execute(
            r#"
            DELETE FROM call_log
            WHERE seq NOT IN (
                SELECT seq FROM call_log ORDER BY seq DESC LIMIT ?1
            )
            "#,
            params![MAX_CALL_LOG_ENTRIES as i64],
        )?;

        Ok(())
    }

    /// Holt alle Einträge, neueste zuerst
    pub fn recent(&self) -> Result<Vec<CallLogEntry>, DatabaseError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT id, direction, peer_code, timestamp_ms, duration_secs, outcome
            FROM call_log
            ORDER BY seq DESC
            "#,
        )?;

        let entries = stmt
            .query_map([], Self::row_to_entry)?
            .collect::<rusqlite::Result<Vec<CallLogEntry>>>()?;

        Ok(entries)
    }

    /// Lädt den zuletzt verwendeten User Code
    pub fn load_user_code(&self) -> Result<Option<UserCode>, DatabaseError> {
        let conn = self.conn.lock();
        let raw: Option<String> = conn
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![USER_CODE_KEY],
                |row| row.get(0),
            )
            .optional()?;

        // Ein beschädigter Wert wird wie "kein Code" behandelt
        Ok(raw.and_then(|raw| match UserCode::parse(&raw) {
            Ok(code) => Some(code),
            Err(e) => {
                tracing::warn!("Ignoring stored user code '{}': {}", raw, e);
                None
            }
        }))
    }

    /// Speichert den User Code für die nächste Registrierung
    pub fn save_user_code(&self, code: &UserCode) -> Result<(), DatabaseError> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO settings (key, value) VALUES (?1, ?2)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value
            "#,
            params![USER_CODE_KEY, code.as_str()],
        )?;
        Ok(())
    }

    fn row_to_entry(row: &Row<'_>) -> rusqlite::Result<CallLogEntry> {
        let direction: String = row.get(1)?;
        let peer_code: String = row.get(2)?;
        let timestamp_ms: i64 = row.get(3)?;
        let duration_secs: Option<i64> = row.get(4)?;
        let outcome: String = row.get(5)?;

        Ok(CallLogEntry {
            id: row.get(0)?,
            direction: CallDirection::parse(&direction)
                .ok_or_else(|| invalid_column(1, "direction"))?,
            peer_code: UserCode::parse(&peer_code)
                .map_err(|_| invalid_column(2, "peer_code"))?,
            timestamp: DateTime::from_timestamp_millis(timestamp_ms)
                .ok_or_else(|| invalid_column(3, "timestamp_ms"))?,
            duration_secs: duration_secs.map(|d| d.max(0) as u64),
            outcome: CallOutcome::parse(&outcome).ok_or_else(|| invalid_column(5, "outcome"))?,
        })
    }
}

fn invalid_column(index: usize, name: &str) -> rusqlite::Error {
    rusqlite::Error::InvalidColumnType(index, name.to_string(), Type::Text)
}

impl std::fmt::Debug for CallLogStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallLogStore").finish_non_exhaustive()
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

    #[test]
    fn test_append_and_read_back() {
        let db = CallLogStore::open_in_memory().unwrap();

        let entry = CallLogEntry::new(
            CallDirection::Outgoing,
            code("654321"),
            CallOutcome::Completed,
            Some(Duration::from_secs(42)),
        );
        db.append(&entry).unwrap();

        let entries = db.recent().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, entry.id);
        assert_eq!(entries[0].duration_secs, Some(42));
        assert_eq!(entries[0].outcome, CallOutcome::Completed);
        assert_eq!(entries[0].peer_code, code("654321"));
    }

    #[test]
    fn test_most_recent_first_and_capped() {
        let db = CallLogStore::open_in_memory().unwrap();

        for i in 0..(MAX_CALL_LOG_ENTRIES + 5) {
            let outcome = if i == MAX_CALL_LOG_ENTRIES + 4 {
                CallOutcome::NoAnswer
            } else {
                CallOutcome::Timeout
            };
            db.append(&CallLogEntry::new(
                CallDirection::Incoming,
                code("123456"),
                outcome,
                None,
            ))
            .unwrap();
        }

        let entries = db.recent().unwrap();
        assert_eq!(entries.len(), MAX_CALL_LOG_ENTRIES);
        assert_eq!(entries[0].outcome, CallOutcome::NoAnswer);
    }

    #[test]
    fn test_user_code_roundtrip() {
        let db = CallLogStore::open_in_memory().unwrap();
        assert_eq!(db.load_user_code().unwrap(), None);

        db.save_user_code(&code("111111")).unwrap();
        db.save_user_code(&code("222222")).unwrap();
        assert_eq!(db.load_user_code().unwrap(), Some(code("222222")));
    }

    #[test]
    fn test_outcome_wire_names() {
        assert_eq!(
            serde_json::to_string(&CallOutcome::NoAnswer).unwrap(),
            "\"no-answer\""
        );
        assert_eq!(CallOutcome::parse("no-answer"), Some(CallOutcome::NoAnswer));
    }
}
