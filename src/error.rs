//! Error types with fix suggestions
//!
//! Error code ranges:
//! - GOLE-001-009: Task identity errors
//! - GOLE-010-019: Configuration errors

use thiserror::Error;

pub type Result<T> = std::result::Result<T, TlsError>;

/// Trait for errors that provide fix suggestions
pub trait FixSuggestion {
    fn fix_suggestion(&self) -> Option<&str>;
}

#[derive(Error, Debug)]
pub enum TlsError {
    // ─────────────────────────────────────────────────────────────
    // Task identity errors (GOLE-001 to GOLE-009)
    // ─────────────────────────────────────────────────────────────
    #[error("[GOLE-001] No tokio task is running on this thread")]
    OutsideTask,

    #[error("[GOLE-002] Cannot parse task identity from '{text}': {reason}")]
    IdentityParse { text: String, reason: String },

    // ─────────────────────────────────────────────────────────────
    // Configuration errors (GOLE-010 to GOLE-019)
    // ─────────────────────────────────────────────────────────────
    #[error("[GOLE-010] Config error: {reason}")]
    Config { reason: String },

    #[error("[GOLE-011] Invalid value '{value}' for {key}")]
    InvalidSetting { key: String, value: String },

    #[error("[GOLE-012] IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TlsError {
    pub(crate) fn identity_parse(text: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::IdentityParse {
            text: text.into(),
            reason: reason.into(),
        }
    }
}

impl FixSuggestion for TlsError {
    fn fix_suggestion(&self) -> Option<&str> {
        match self {
            TlsError::OutsideTask => {
                Some("Call from inside a tokio task (gole::spawn or tokio::spawn), not from block_on or a plain thread")
            }
            TlsError::IdentityParse { .. } => {
                Some("The tokio task id rendering changed shape; pin tokio or update the header parser")
            }
            TlsError::Config { .. } => Some("Check the TOML syntax of the config file"),
            TlsError::InvalidSetting { .. } => {
                Some("Intervals are positive milliseconds; policy is 'conservative' or 'strict'")
            }
            TlsError::Io(_) => Some("Check file path and permissions"),
        }
    }
}
