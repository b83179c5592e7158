//! Failure modes of the storage layer.
//!
//! Both storage surfaces — the SQLite message table and the in-process
//! session KV — report through [`StoreError`].  Callers mostly care about
//! two questions: is the failure retryable ([`StoreError::is_transient`]),
//! and did every retry get burned ([`StoreError::RetriesExhausted`]), which
//! is the signal the coordinator surfaces while keeping its in-memory state
//! for a later attempt.

use thiserror::Error;

/// Alias for `Result<T, StoreError>`.
pub type StoreResult<T> = Result<T, StoreError>;

/// What went wrong inside a store operation.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The underlying SQLite call failed.  Busy/locked conditions count as
    /// transient; everything else does not.
    #[error("message store operation failed: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A stored payload would not encode, or came back undecodable.
    #[error("stored payload codec failure: {0}")]
    Json(#[from] serde_json::Error),

    /// No item lives under the requested key.
    #[error("no {entity} stored under id `{id}`")]
    NotFound { entity: &'static str, id: String },

    /// The call itself was unusable: empty identifiers, or a KV key holding
    /// the other value shape than the operation expects.
    #[error("rejected store call: {0}")]
    InvalidArgument(String),

    /// The blocking-pool task running the query died before delivering a
    /// result (cancellation, panic, poisoned connection lock).
    #[error("store worker task aborted: {0}")]
    TaskJoin(String),

    /// A transient failure persisted through every retry attempt.
    #[error("`{operation}` failed after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        operation: &'static str,
        attempts: u32,
        last_error: String,
    },
}

impl From<tokio::task::JoinError> for StoreError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::TaskJoin(err.to_string())
    }
}

impl StoreError {
    /// Whether retrying the operation could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Sqlite(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            Self::TaskJoin(_) => true,
            _ => false,
        }
    }
}
