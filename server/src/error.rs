//! Error taxonomy for the realtime messaging path.

use thiserror::Error;

/// A payload that failed validation. Reported to the sender only; the
/// message is neither persisted nor fanned out.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("message content is empty")]
    EmptyContent,
    #[error("message content exceeds {max} characters")]
    ContentTooLong { max: usize },
    #[error("exactly one of receiver_id or group_id must be set")]
    MalformedAddressing,
}

/// Failure inside the persistence port.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("database lock poisoned")]
    LockPoisoned,
    #[error("blocking task failed: {0}")]
    Task(String),
}

/// Why a single inbound message was not admitted.
#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("message was not recorded: {0}")]
    Persistence(#[from] StoreError),
}

impl AdmissionError {
    /// Stable machine-readable code sent back to the client.
    pub fn code(&self) -> &'static str {
        match self {
            AdmissionError::Validation(ValidationError::EmptyContent) => "empty_content",
            AdmissionError::Validation(ValidationError::ContentTooLong { .. }) => {
                "content_too_long"
            }
            AdmissionError::Validation(ValidationError::MalformedAddressing) => {
                "malformed_addressing"
            }
            AdmissionError::Persistence(_) => "persistence_failed",
        }
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, AdmissionError::Validation(_))
    }
}
