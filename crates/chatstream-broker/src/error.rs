//! Error types for the chatstream-broker crate.

use thiserror::Error;

/// Alias for `Result<T, BrokerError>`.
pub type BrokerResult<T> = Result<T, BrokerError>;

/// Errors raised by broker operations.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// The event could not be encoded for the wire.
    #[error("event encoding failed: {0}")]
    Encoding(#[from] chatstream_events::EventError),

    /// A publish attempt failed.
    #[error("publish to channel `{channel}` failed: {reason}")]
    Publish { channel: String, reason: String },

    /// The subscription's channel is gone and no further messages can
    /// arrive.
    #[error("subscription closed for channel `{channel}`")]
    SubscriptionClosed { channel: String },
}
