// ================================================================
// File: rumblebot-common/src/error.rs
// ================================================================

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    // User-facing failures. Display text is what ends up in chat, so these
    // read like chat lines rather than log lines.
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    AlreadyActive(String),

    #[error("{0}")]
    AlreadyJoined(String),

    #[error("{0}")]
    WrongStatus(String),

    #[error("{0}")]
    InvalidParams(String),

    #[error("not enough points: need {needed}, have {available}")]
    InsufficientPoints { needed: i64, available: i64 },

    // Dependency / infrastructure failures:
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("State store error: {0}")]
    Store(String),

    #[error("Ledger error: {0}")]
    Ledger(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True for failures caused by what the user typed or by the current
    /// activity state. These become a chat reply; everything else is logged
    /// and reported as a generic failure.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            Error::NotFound(_)
                | Error::AlreadyActive(_)
                | Error::AlreadyJoined(_)
                | Error::WrongStatus(_)
                | Error::InvalidParams(_)
                | Error::InsufficientPoints { .. }
        )
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::InvalidParams(s)
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::InvalidParams(s.to_string())
    }
}

impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Self {
        Error::Internal(e.to_string())
    }
}
