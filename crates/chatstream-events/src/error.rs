//! Error types for the chatstream-events crate.

use thiserror::Error;

/// Alias for `Result<T, EventError>`.
pub type EventResult<T> = Result<T, EventError>;

/// Errors raised while encoding or decoding events and messages.
#[derive(Debug, Error)]
pub enum EventError {
    /// JSON serialization or deserialization failed (including unknown
    /// `__event_type__` / `part_kind` tags, which the wire contract rejects).
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The payload was structurally valid JSON but violated the event
    /// contract.
    #[error("invalid event payload: {reason}")]
    InvalidPayload { reason: String },
}
