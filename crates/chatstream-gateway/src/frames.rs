//! Client-facing WebSocket framing.
//!
//! Every frame in either direction is `{"type", "data", "timestamp"}`.
//! Streaming events travel nested under `type = "event"`; error events are
//! re-framed as first-class `error` frames so clients can route them
//! without unwrapping the event envelope.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use chatstream_events::{Event, EventPayload};

/// WebSocket message types in both directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WsMessageType {
    // client -> server
    /// Initial setup carrying the generation request.
    Initialize,
    /// Stop the active generation for a chat.
    Interrupt,
    /// Keep-alive.
    Ping,

    // server -> client
    /// A streaming event from the pipeline.
    Event,
    /// Reply to `ping`.
    Pong,
    /// Sent once per subscription.
    ConnectionEstablished,
    /// Fault notification.
    Error,
    /// Opaque progress message.
    Status,
}

/// One framed WebSocket message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsMessage {
    #[serde(rename = "type")]
    pub message_type: WsMessageType,
    #[serde(default)]
    pub data: Value,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl WsMessage {
    pub fn new(message_type: WsMessageType, data: Value) -> Self {
        Self {
            message_type,
            data,
            timestamp: Utc::now(),
        }
    }

    /// Encode for the wire.
    pub fn to_json(&self) -> String {
        // A derived struct over Value fields cannot fail to serialize.
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_owned())
    }
}

/// Format a pipeline event for delivery to WebSocket clients.
///
/// Error events become `error` frames carrying
/// `{error, error_type, details, response_id, sequence}`; everything else
/// nests under an `event` frame.
pub fn format_event_for_websocket(event: &Event) -> String {
    if let EventPayload::Error {
        error_type,
        message,
        details,
        ..
    } = &event.payload
    {
        return WsMessage::new(
            WsMessageType::Error,
            json!({
                "error": message,
                "error_type": error_type,
                "details": details.clone().unwrap_or_else(|| json!({})),
                "response_id": event.response_id,
                "sequence": event.sequence,
            }),
        )
        .to_json();
    }

    WsMessage::new(WsMessageType::Event, event.to_websocket()).to_json()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
