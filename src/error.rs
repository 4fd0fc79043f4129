//! Error types.
//!
//! Plumbing (files, SQLite, configuration) reports `anyhow` errors. The façade reports
//! [`EngineError`] so that callers can branch on the kind of failure without string matching.

use crate::api::RemoteError;
use thiserror::Error;

pub type Error = anyhow::Error;
pub type Result<T> = std::result::Result<T, Error>;

/// The result type returned by the engine's public operations.
pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Failures that a write or read through the engine can surface to its caller.
///
/// Transient network failures never show up here: the façade absorbs them by queueing the write
/// or by serving cached data. Duplicate detection is not an error either, it resolves to
/// `WriteOutcome::Skipped`.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The request can never succeed as written. It was not queued.
    #[error("invalid request: {0}")]
    Validation(String),

    /// The remote entity changed or disappeared since it was edited locally.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The remote API refused the session's credentials.
    #[error("not authorized: {0}")]
    Unauthorized(String),

    /// The entity does not exist locally or remotely.
    #[error("not found: {0}")]
    NotFound(String),

    /// A durable queue entry could not be decoded.
    #[error("corrupted queue entry {id}: {message}")]
    CorruptEntry { id: i64, message: String },

    /// The durable store failed.
    #[error("storage failure: {0:#}")]
    Storage(#[from] anyhow::Error),
}

impl EngineError {
    /// Converts a storage error, recovering an `EngineError` that was wrapped inside it.
    pub(crate) fn from_storage(e: anyhow::Error) -> Self {
        match e.downcast::<EngineError>() {
            Ok(engine) => engine,
            Err(other) => EngineError::Storage(other),
        }
    }
}

impl From<RemoteError> for EngineError {
    fn from(e: RemoteError) -> Self {
        match e {
            RemoteError::Validation(m) | RemoteError::Duplicate(m) => EngineError::Validation(m),
            RemoteError::Conflict(m) => EngineError::Conflict(m),
            RemoteError::NotFound(m) => EngineError::NotFound(m),
            RemoteError::Unauthorized(m) => EngineError::Unauthorized(m),
            transient => EngineError::Storage(anyhow::anyhow!(transient)),
        }
    }
}
