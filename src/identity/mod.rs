//! Identity Module - User Codes
//!
//! Dieses Modul verwaltet die Identität eines Clients gegenüber dem Relay:
//! - 6-stelliger numerischer User Code
//! - Validierung von eingegebenen Codes
//! - Generierung neuer Codes (Directory-Seite)
//!

mod user_code;

pub use user_code::{CodeError, UserCode, USER_CODE_LEN};
