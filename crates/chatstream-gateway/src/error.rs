//! Error types for the chatstream-gateway crate.

use thiserror::Error;

/// Alias for `Result<T, GatewayError>`.
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Errors raised by the WebSocket gateway.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The referenced connection is not registered.
    #[error("connection not found: {connection_id}")]
    ConnectionNotFound { connection_id: String },

    /// A client frame could not be parsed or was missing required fields.
    #[error("invalid client message: {reason}")]
    InvalidClientMessage { reason: String },

    /// Delivery to a client failed (its channel is gone).
    #[error("client send failed for connection {connection_id}")]
    SendFailed { connection_id: String },

    /// JSON encoding of an outbound frame failed.
    #[error("frame encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    /// The broker rejected a subscription operation.
    #[error("broker error: {0}")]
    Broker(#[from] chatstream_broker::BrokerError),

    /// A session-state store operation failed.
    #[error("store error: {0}")]
    Store(#[from] chatstream_store::StoreError),
}
