//! Typed errors for the reaction engine and its stores.
//!
//! Caller-facing variants report misuse or a lost race and are never
//! retried. [`Error::StorageUnavailable`] is the only retryable variant.

use thiserror::Error;

use crate::model::ReactionKey;

#[derive(Debug, Error)]
pub enum Error {
    /// A reaction type with this name is already registered.
    #[error("reaction type already exists: {name}")]
    DuplicateType { name: String },

    /// No reaction type with this name is registered.
    #[error("unknown reaction type: {name}")]
    UnknownType { name: String },

    /// The reaction type exists but does not accept new reactions.
    #[error("reaction type is inactive: {name}")]
    InactiveType { name: String },

    /// Reaction type names must be non-empty and free of `:`.
    #[error("invalid reaction type name: {0:?}")]
    InvalidTypeName(String),

    /// An active reaction already occupies this key.
    #[error("already reacted: {0}")]
    DuplicateReaction(ReactionKey),

    /// No active reaction exists for this key.
    #[error("reaction not found: {0}")]
    NotFound(ReactionKey),

    /// Transient: busy database, timeout, poisoned lock.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    /// Permanent storage or decoding failure.
    #[error("storage error: {0}")]
    Storage(String),
}

impl Error {
    /// Whether a retry may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::StorageUnavailable(_))
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        match err.sqlite_error_code() {
            Some(rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked) => {
                Error::StorageUnavailable(err.to_string())
            }
            _ => Error::Storage(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Storage(format!("corrupt record: {err}"))
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Error::StorageUnavailable("store operation timed out".to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// True when a rusqlite error is a UNIQUE / PRIMARY KEY violation.
pub(crate) fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    err.sqlite_error_code() == Some(rusqlite::ErrorCode::ConstraintViolation)
}
