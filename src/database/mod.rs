//! Database Module - Lokaler Zustand
//!
//! SQLite-Persistenz für den Anrufverlauf und den zuletzt verwendeten User Code.

mod call_log;

pub use call_log::{
    CallDirection, CallLogEntry, CallLogStore, CallOutcome, DatabaseError, MAX_CALL_LOG_ENTRIES,
};
