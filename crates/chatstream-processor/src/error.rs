//! Error types for the chatstream-processor crate.

use thiserror::Error;

/// Alias for `Result<T, ProcessorError>`.
pub type ProcessorResult<T> = Result<T, ProcessorError>;

/// Errors raised by event processing and response coordination.
#[derive(Debug, Error)]
pub enum ProcessorError {
    /// The event payload violated the processing contract (e.g. a usage
    /// block that is not an object).
    #[error("invalid event: {reason}")]
    InvalidEvent { reason: String },

    /// Encoding or decoding an event failed.
    #[error("event codec error: {0}")]
    Codec(#[from] chatstream_events::EventError),

    /// The broker rejected a publish.
    #[error("broker error: {0}")]
    Broker(#[from] chatstream_broker::BrokerError),

    /// The durable store failed after retries.
    #[error("store error: {0}")]
    Store(#[from] chatstream_store::StoreError),
}
