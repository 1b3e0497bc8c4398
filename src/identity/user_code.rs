//! User Code
//!
//! Kurze numerische Kennung, unter der ein Client im Directory erreichbar ist.
//! Der Code wird beim ersten Registrieren vergeben und danach lokal gecached,
//! damit er nach einem Reconnect erneut angemeldet werden kann.
//!
//! ## Verwendung
//! ```rust
//! use callcore::identity::UserCode;
//!
//! let code = UserCode::parse(" 123456 ").unwrap();
//! assert_eq!(code.as_str(), "123456");
//! assert!(UserCode::parse("12345").is_err());
//! ```

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Anzahl der Ziffern eines User Codes
pub const USER_CODE_LEN: usize = 6;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodeError {
    #[error("User code must not be empty")]
    Empty,

    #[error("User code must have exactly {USER_CODE_LEN} digits, got {0}")]
    InvalidLength(usize),

    #[error("User code may only contain digits: {0}")]
    InvalidCharacter(String),
}

// ============================================================================
// USER CODE
// ============================================================================

/// Validierter 6-stelliger User Code
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct UserCode(String);

impl UserCode {
    /// Parst und validiert einen Code (führende/folgende Leerzeichen werden ignoriert)
    pub fn parse(raw: &str) -> Result<Self, CodeError> {
        let trimmed = raw.trim();

        if trimmed.is_empty() {
            return Err(CodeError::Empty);
        }

        if !trimmed.chars().all(|c| c.is_ascii_digit()) {
            return Err(CodeError::InvalidCharacter(trimmed.to_string()));
        }

        if trimmed.len() != USER_CODE_LEN {
            return Err(CodeError::InvalidLength(trimmed.len()));
        }

        Ok(Self(trimmed.to_string()))
    }

    /// Generiert einen zufälligen Code (ohne führende Null)
    pub fn generate() -> Self {
        let value: u32 = rand::thread_rng().gen_range(100_000..=999_999);
        Self(value.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for UserCode {
    type Error = CodeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<UserCode> for String {
    fn from(code: UserCode) -> Self {
        code.0
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_valid_code() {
        let code = UserCode::parse("654321").unwrap();
        assert_eq!(code.as_str(), "654321");
        assert_eq!(code.to_string(), "654321");
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert_eq!(UserCode::parse("   "), Err(CodeError::Empty));
        assert_eq!(UserCode::parse("1234567"), Err(CodeError::InvalidLength(7)));
        assert!(matches!(
            UserCode::parse("12a456"),
            Err(CodeError::InvalidCharacter(_))
        ));
    }

    #[test]
    fn test_generated_codes_are_valid() {
        for _ in 0..100 {
            let code = UserCode::generate();
            assert!(UserCode::parse(code.as_str()).is_ok());
        }
    }

    #[test]
    fn test_serde_validates() {
        let code: UserCode = serde_json::from_str("\"123456\"").unwrap();
        assert_eq!(code.as_str(), "123456");
        assert!(serde_json::from_str::<UserCode>("\"12\"").is_err());
    }
}
