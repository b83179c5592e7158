//! The durable message model.
//!
//! A [`Message`] is the stored unit of conversation: one per user request
//! and exactly one per model response (`message_id == response_id`).  Parts
//! are the discriminated union from [`crate::part`]; response messages also
//! carry the model name and token usage.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::part::MessagePart;

/// Whether a message is a user request or a model response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Request,
    Response,
}

/// Lifecycle status of a stored message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    InProgress,
    Complete,
    Error,
    UserStopped,
}

impl MessageStatus {
    /// True for the states a terminal event may leave a message in.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Error | Self::UserStopped)
    }
}

/// A stored conversation message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub message_id: String,
    pub chat_id: String,

    /// The message this one answers; root messages point at their chat.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,

    pub kind: MessageKind,

    #[serde(default)]
    pub parts: Vec<MessagePart>,

    pub status: MessageStatus,

    #[serde(default)]
    pub metadata: Map<String, Value>,

    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,

    /// Model that produced this message (responses only).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub model_name: String,

    /// Token usage counters (responses only).
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub usage: Map<String, Value>,
}

impl Message {
    /// Create a user request message.  A missing parent defaults to the
    /// chat itself, so root messages are addressable through the hierarchy
    /// index.
    pub fn request(
        message_id: impl Into<String>,
        chat_id: impl Into<String>,
        parent_id: Option<String>,
        parts: Vec<MessagePart>,
    ) -> Self {
        let chat_id = chat_id.into();
        let parent_id = Some(parent_id.unwrap_or_else(|| chat_id.clone()));
        Self {
            message_id: message_id.into(),
            chat_id,
            parent_id,
            kind: MessageKind::Request,
            parts,
            status: MessageStatus::Complete,
            metadata: Map::new(),
            timestamp: Utc::now(),
            model_name: String::new(),
            usage: Map::new(),
        }
    }

    /// Create a pending model response placeholder with empty parts.
    pub fn response_placeholder(
        response_id: impl Into<String>,
        chat_id: impl Into<String>,
        parent_id: Option<String>,
        model_name: impl Into<String>,
    ) -> Self {
        let chat_id = chat_id.into();
        let parent_id = Some(parent_id.unwrap_or_else(|| chat_id.clone()));
        Self {
            message_id: response_id.into(),
            chat_id,
            parent_id,
            kind: MessageKind::Response,
            parts: Vec::new(),
            status: MessageStatus::Pending,
            metadata: Map::new(),
            timestamp: Utc::now(),
            model_name: model_name.into(),
            usage: Map::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::part::TextPart;

    #[test]
    fn root_request_parent_defaults_to_chat() {
        let msg = Message::request("m1", "c1", None, vec![]);
        assert_eq!(msg.parent_id.as_deref(), Some("c1"));
        assert_eq!(msg.kind, MessageKind::Request);
        assert_eq!(msg.status, MessageStatus::Complete);
    }

    #[test]
    fn explicit_parent_is_kept() {
        let msg = Message::request("m2", "c1", Some("m1".into()), vec![]);
        assert_eq!(msg.parent_id.as_deref(), Some("m1"));
    }

    #[test]
    fn placeholder_starts_pending_and_empty() {
        let msg = Message::response_placeholder("r1", "c1", Some("q1".into()), "model-a");
        assert_eq!(msg.status, MessageStatus::Pending);
        assert!(msg.parts.is_empty());
        assert_eq!(msg.model_name, "model-a");
        assert_eq!(msg.parent_id.as_deref(), Some("q1"));
    }

    #[test]
    fn message_round_trip() {
        let mut msg = Message::response_placeholder("r2", "c2", None, "model-b");
        msg.parts.push(MessagePart::Text(TextPart::new("Hello")));
        msg.status = MessageStatus::Complete;
        msg.usage
            .insert("input_tokens".into(), serde_json::json!(3));

        let json = serde_json::to_string(&msg).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back.message_id, "r2");
        assert_eq!(back.kind, MessageKind::Response);
        assert_eq!(back.status, MessageStatus::Complete);
        assert_eq!(back.parts.len(), 1);
        assert_eq!(back.usage.get("input_tokens"), Some(&serde_json::json!(3)));
    }

    #[test]
    fn status_serialization_is_snake_case() {
        let json = serde_json::to_string(&MessageStatus::UserStopped).unwrap();
        assert_eq!(json, r#""user_stopped""#);
        assert!(MessageStatus::UserStopped.is_terminal());
        assert!(!MessageStatus::Pending.is_terminal());
    }
}
