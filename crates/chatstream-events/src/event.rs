//! The wire event union.
//!
//! Every event carries a common envelope — `response_id`, processor-assigned
//! `sequence`, `timestamp`, the `emit`/`persist` routing flags, and optional
//! content-block tracking — plus a payload discriminated on the wire by
//! `__event_type__`.  The same encoding is used on broker channels and inside
//! WebSocket `event` frames, so a subscriber in another process can always
//! reconstruct the typed variant.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::EventResult;

// ---------------------------------------------------------------------------
// Payload variants
// ---------------------------------------------------------------------------

/// Tool arguments as carried by a `tool_call` event.
///
/// Streaming SDKs emit either a complete JSON object or raw partial-JSON
/// fragments that only become parseable once concatenated.  Both shapes are
/// preserved on the wire; the aggregation layer merges fragments into a
/// single object at terminal time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolArgs {
    /// A complete (or at least object-shaped) argument map.
    Object(Map<String, Value>),
    /// A raw partial-JSON fragment.
    Fragment(String),
}

impl Default for ToolArgs {
    fn default() -> Self {
        Self::Object(Map::new())
    }
}

impl ToolArgs {
    /// True when no argument data has been observed yet.
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Object(map) => map.is_empty(),
            Self::Fragment(raw) => raw.is_empty(),
        }
    }
}

/// Terminal status reported by a `response_end` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndStatus {
    /// The agent finished normally.
    #[serde(alias = "complete")]
    Completed,
    /// The agent finished with an error.
    Error,
    /// The client interrupted the generation.
    UserStopped,
}

/// The event payload, tagged on the wire by `__event_type__`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "__event_type__", rename_all = "snake_case")]
pub enum EventPayload {
    /// Marks the beginning of a model response.
    ResponseStart {
        request_id: String,
        chat_id: String,
        model_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent_id: Option<String>,
        #[serde(default)]
        task: String,
    },

    /// A streaming text delta.
    Content { content: String },

    /// A chain-of-thought fragment, optionally signed or redacted.
    Reasoning {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
        #[serde(
            default,
            skip_serializing_if = "Option::is_none",
            with = "base64_bytes_opt"
        )]
        redacted_content: Option<Vec<u8>>,
    },

    /// The model invoking a tool.  `tool_args` may be a partial fragment.
    ToolCall {
        tool_name: String,
        tool_id: String,
        #[serde(default)]
        tool_args: ToolArgs,
    },

    /// The result of a tool call.
    ToolReturn {
        tool_name: String,
        tool_id: String,
        result: Value,
    },

    /// A reference to a retrieved document.
    Document {
        document_id: String,
        #[serde(default)]
        title: String,
        #[serde(default)]
        pointer: String,
        #[serde(default)]
        mime_type: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        page_count: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        word_count: Option<u32>,
    },

    /// A passage citation.
    Citation {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        document_id: Option<String>,
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        page: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        section: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        citation_id: Option<String>,
    },

    /// A progress notification.  Streaming-only, never persisted as a part.
    Status {
        status: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },

    /// Out-of-band information merged into message metadata (including token
    /// usage counters under the `usage` key).
    Metadata {
        #[serde(default)]
        metadata: Map<String, Value>,
    },

    /// Terminal event for a response.
    ResponseEnd {
        status: EndStatus,
        #[serde(default)]
        usage: Map<String, Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        chat_id: Option<String>,
    },

    /// A fault notification.  Terminal for its response.
    Error {
        error_type: String,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        chat_id: Option<String>,
    },
}

impl EventPayload {
    /// The wire tag for this payload, as carried in `__event_type__`.
    pub fn wire_tag(&self) -> &'static str {
        match self {
            Self::ResponseStart { .. } => "response_start",
            Self::Content { .. } => "content",
            Self::Reasoning { .. } => "reasoning",
            Self::ToolCall { .. } => "tool_call",
            Self::ToolReturn { .. } => "tool_return",
            Self::Document { .. } => "document",
            Self::Citation { .. } => "citation",
            Self::Status { .. } => "status",
            Self::Metadata { .. } => "metadata",
            Self::ResponseEnd { .. } => "response_end",
            Self::Error { .. } => "error",
        }
    }
}

// ---------------------------------------------------------------------------
// Event envelope
// ---------------------------------------------------------------------------

fn default_true() -> bool {
    true
}

/// A single streaming event: envelope plus tagged payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Identifies the ongoing model response this event belongs to.
    pub response_id: String,

    /// Monotone per-response ordinal, assigned by the event processor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,

    /// When the event was observed (assigned by the processor if unset).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,

    /// Whether the event should fan out to subscribed clients.
    #[serde(default = "default_true")]
    pub emit: bool,

    /// Whether the event should contribute to the stored message.
    #[serde(default = "default_true")]
    pub persist: bool,

    /// Groups fragments of one logical output block.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_block_index: Option<u32>,

    /// Intra-block ordering for fragments sharing a block.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_sequence: Option<u32>,

    #[serde(flatten)]
    pub payload: EventPayload,
}

impl Event {
    /// Create an event with default routing flags and no sequencing assigned.
    pub fn new(response_id: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            response_id: response_id.into(),
            sequence: None,
            timestamp: None,
            emit: true,
            persist: true,
            content_block_index: None,
            block_sequence: None,
            payload,
        }
    }

    /// Attach content-block tracking to the event.
    pub fn with_block(mut self, index: u32, block_sequence: u32) -> Self {
        self.content_block_index = Some(index);
        self.block_sequence = Some(block_sequence);
        self
    }

    /// Set the processor-assigned sequence number.
    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = Some(sequence);
        self
    }

    /// Mark the event as internal: not fanned out and not persisted.
    pub fn internal(mut self) -> Self {
        self.emit = false;
        self.persist = false;
        self
    }

    /// The wire tag of the payload (`content`, `tool_call`, ...).
    pub fn event_type(&self) -> &'static str {
        self.payload.wire_tag()
    }

    /// True for `response_end` and `error` — the terminal variants.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.payload,
            EventPayload::ResponseEnd { .. } | EventPayload::Error { .. }
        )
    }

    /// The JSON value embedded under `data` in WebSocket `event` frames.
    ///
    /// This is the full tagged encoding; clients dispatch on
    /// `__event_type__` the same way broker subscribers do.
    pub fn to_websocket(&self) -> Value {
        // Serialization of a derived struct into a Value cannot fail.
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

// ---------------------------------------------------------------------------
// Wire helpers
// ---------------------------------------------------------------------------

/// Encode an event for a broker channel.
pub fn serialize_event(event: &Event) -> EventResult<String> {
    Ok(serde_json::to_string(event)?)
}

/// Decode an event received from a broker channel.
///
/// Unknown `__event_type__` tags are a hard error — both ends of the broker
/// are versioned together.
pub fn deserialize_event(data: &str) -> EventResult<Event> {
    Ok(serde_json::from_str(data)?)
}

// ---------------------------------------------------------------------------
// Base64 (de)serialization for optional binary fields
// ---------------------------------------------------------------------------

mod base64_bytes_opt {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        bytes: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(b) => serializer.serialize_str(&STANDARD.encode(b)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        let encoded: Option<String> = Option::deserialize(deserializer)?;
        match encoded {
            Some(s) => STANDARD
                .decode(s.as_bytes())
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_event_round_trip() {
        let event = Event::new(
            "r1",
            EventPayload::Content {
                content: "Hel".into(),
            },
        )
        .with_block(0, 0)
        .with_sequence(3);

        let json = serialize_event(&event).unwrap();
        assert!(json.contains(r#""__event_type__":"content""#));

        let back = deserialize_event(&json).unwrap();
        assert_eq!(back.response_id, "r1");
        assert_eq!(back.sequence, Some(3));
        assert_eq!(back.content_block_index, Some(0));
        match back.payload {
            EventPayload::Content { content } => assert_eq!(content, "Hel"),
            other => panic!("expected Content, got {other:?}"),
        }
    }

    #[test]
    fn tool_call_fragment_round_trip() {
        let event = Event::new(
            "r2",
            EventPayload::ToolCall {
                tool_name: "calc".into(),
                tool_id: "t1".into(),
                tool_args: ToolArgs::Fragment(r#"{"expr"#.into()),
            },
        );

        let json = serialize_event(&event).unwrap();
        let back = deserialize_event(&json).unwrap();
        match back.payload {
            EventPayload::ToolCall { tool_args, .. } => {
                assert_eq!(tool_args, ToolArgs::Fragment(r#"{"expr"#.into()));
            }
            other => panic!("expected ToolCall, got {other:?}"),
        }
    }

    #[test]
    fn tool_call_object_args_round_trip() {
        let mut args = Map::new();
        args.insert("expression".into(), Value::String("1+1".into()));
        let event = Event::new(
            "r2",
            EventPayload::ToolCall {
                tool_name: "calc".into(),
                tool_id: "t1".into(),
                tool_args: ToolArgs::Object(args.clone()),
            },
        );

        let back = deserialize_event(&serialize_event(&event).unwrap()).unwrap();
        match back.payload {
            EventPayload::ToolCall { tool_args, .. } => {
                assert_eq!(tool_args, ToolArgs::Object(args));
            }
            other => panic!("expected ToolCall, got {other:?}"),
        }
    }

    #[test]
    fn reasoning_redacted_bytes_are_base64() {
        let event = Event::new(
            "r3",
            EventPayload::Reasoning {
                text: "thinking".into(),
                signature: Some("sig".into()),
                redacted_content: Some(vec![0xde, 0xad, 0xbe, 0xef]),
            },
        );

        let json = serialize_event(&event).unwrap();
        assert!(json.contains("3q2+7w==")); // base64 of deadbeef

        let back = deserialize_event(&json).unwrap();
        match back.payload {
            EventPayload::Reasoning {
                redacted_content, ..
            } => assert_eq!(redacted_content, Some(vec![0xde, 0xad, 0xbe, 0xef])),
            other => panic!("expected Reasoning, got {other:?}"),
        }
    }

    #[test]
    fn response_end_accepts_complete_alias() {
        let json = r#"{"__event_type__":"response_end","response_id":"r4","status":"complete"}"#;
        let event = deserialize_event(json).unwrap();
        match event.payload {
            EventPayload::ResponseEnd { status, .. } => assert_eq!(status, EndStatus::Completed),
            other => panic!("expected ResponseEnd, got {other:?}"),
        }
    }

    #[test]
    fn unknown_event_type_is_rejected() {
        let json = r#"{"__event_type__":"mystery","response_id":"r5"}"#;
        assert!(deserialize_event(json).is_err());
    }

    #[test]
    fn emit_and_persist_default_to_true() {
        let json = r#"{"__event_type__":"status","response_id":"r6","status":"searching"}"#;
        let event = deserialize_event(json).unwrap();
        assert!(event.emit);
        assert!(event.persist);
    }

    #[test]
    fn terminal_detection() {
        let end = Event::new(
            "r",
            EventPayload::ResponseEnd {
                status: EndStatus::Completed,
                usage: Map::new(),
                chat_id: None,
            },
        );
        let err = Event::new(
            "r",
            EventPayload::Error {
                error_type: "AgentError".into(),
                message: "boom".into(),
                details: None,
                chat_id: None,
            },
        );
        let content = Event::new(
            "r",
            EventPayload::Content {
                content: "x".into(),
            },
        );

        assert!(end.is_terminal());
        assert!(err.is_terminal());
        assert!(!content.is_terminal());
    }

    #[test]
    fn to_websocket_carries_tag_and_envelope() {
        let event = Event::new(
            "r7",
            EventPayload::Status {
                status: "retrieving".into(),
                message: Some("searching documents".into()),
            },
        )
        .with_sequence(4);

        let value = event.to_websocket();
        assert_eq!(value["__event_type__"], "status");
        assert_eq!(value["response_id"], "r7");
        assert_eq!(value["sequence"], 4);
    }
}
