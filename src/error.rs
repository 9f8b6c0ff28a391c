//! Error types for the reconciliation engine.
//!
//! Routine absence (a blob or directory that does not exist) is modeled as
//! `Option`, not as an error. Only validation and lock failures are fatal
//! for a pass; everything else is caught and logged at the point of use.

use thiserror::Error;

/// Errors surfaced by the sync engine and the storage client.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The replica pair is malformed. Raised before any I/O happens.
    #[error("invalid replica pair: {0}")]
    Validation(String),

    /// Another sync pass holds a fresh lock marker on a replica.
    #[error("sync already in progress on {replica}: lock marker is {age_secs}s old")]
    LockContention { replica: String, age_secs: u64 },

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The storage API answered with an unexpected status or payload.
    #[error("storage API error: {0}")]
    Api(String),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl SyncError {
    /// True for errors that abort the whole pass rather than a single file.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SyncError::Validation(_) | SyncError::LockContention { .. }
        )
    }
}
