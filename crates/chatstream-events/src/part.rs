//! Typed message parts — the stored unit.
//!
//! A [`MessagePart`] is a tagged variant discriminated by `part_kind`.  Every
//! part carries display `content`, a free-form `metadata` map, and a
//! timestamp.  Parts that reference binary or external content synthesize a
//! readable `content` placeholder when none is given, so a message is always
//! renderable as text.
//!
//! The citation variant keeps its raw `text` and display `content` fields
//! synchronized: whichever side is missing is derived from the other at
//! construction and deserialization time, and construction never fails.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Part union
// ---------------------------------------------------------------------------

/// A typed element of a message, tagged on the wire by `part_kind`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "part_kind", rename_all = "snake_case")]
pub enum MessagePart {
    Text(TextPart),
    Reasoning(ReasoningPart),
    ToolCall(ToolCallPart),
    ToolReturn(ToolReturnPart),
    Image(ImagePart),
    Document(DocumentPart),
    Citation(CitationPart),
}

impl MessagePart {
    /// The wire tag of this part.
    pub fn part_kind(&self) -> &'static str {
        match self {
            Self::Text(_) => "text",
            Self::Reasoning(_) => "reasoning",
            Self::ToolCall(_) => "tool_call",
            Self::ToolReturn(_) => "tool_return",
            Self::Image(_) => "image",
            Self::Document(_) => "document",
            Self::Citation(_) => "citation",
        }
    }

    /// The display content of the part, if it has a textual form.
    pub fn content_text(&self) -> Option<&str> {
        match self {
            Self::Text(p) => Some(&p.content),
            Self::Reasoning(p) => Some(&p.content),
            Self::Image(p) => Some(&p.content),
            Self::Document(p) => Some(&p.content),
            Self::Citation(p) => Some(&p.content),
            Self::ToolCall(_) | Self::ToolReturn(_) => None,
        }
    }

    /// Shared access to the part's metadata map.
    pub fn metadata(&self) -> &Map<String, Value> {
        match self {
            Self::Text(p) => &p.metadata,
            Self::Reasoning(p) => &p.metadata,
            Self::ToolCall(p) => &p.metadata,
            Self::ToolReturn(p) => &p.metadata,
            Self::Image(p) => &p.metadata,
            Self::Document(p) => &p.metadata,
            Self::Citation(p) => &p.metadata,
        }
    }

    /// Reconstruct a part from a stored JSON value, tolerating legacy data.
    ///
    /// Unknown or malformed `part_kind` values degrade to a [`TextPart`]
    /// carrying a best-effort description and the decode error in metadata,
    /// so reconstructing an old message never fails.
    pub fn from_stored_value(value: Value) -> MessagePart {
        match serde_json::from_value::<MessagePart>(value.clone()) {
            Ok(part) => part,
            Err(err) => {
                tracing::warn!(%err, "unknown or malformed stored part, degrading to text");
                let content = value
                    .get("content")
                    .and_then(Value::as_str)
                    .filter(|s| !s.trim().is_empty())
                    .map(str::to_owned)
                    .unwrap_or_else(|| "[unreadable message part]".to_owned());

                let mut metadata = Map::new();
                metadata.insert("part_error".into(), Value::String(err.to_string()));
                if let Some(kind) = value.get("part_kind").and_then(Value::as_str) {
                    metadata.insert("original_part_kind".into(), Value::String(kind.into()));
                }

                MessagePart::Text(TextPart {
                    content,
                    metadata,
                    timestamp: Utc::now(),
                })
            }
        }
    }
}

fn generate_part_id() -> String {
    Uuid::now_v7().to_string()
}

// ---------------------------------------------------------------------------
// Simple parts
// ---------------------------------------------------------------------------

/// Plain text content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextPart {
    pub content: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl TextPart {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            metadata: Map::new(),
            timestamp: Utc::now(),
        }
    }
}

/// Model chain-of-thought content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReasoningPart {
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    #[serde(default, with = "base64_bytes", skip_serializing_if = "Vec::is_empty")]
    pub redacted_content: Vec<u8>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

/// A tool invocation recorded in the message.  `content` is optional.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallPart {
    pub tool_name: String,
    #[serde(default = "generate_part_id")]
    pub tool_id: String,
    #[serde(default)]
    pub tool_args: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Value>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

/// The recorded result of a tool call.  `content` is optional.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolReturnPart {
    pub tool_name: String,
    pub tool_id: String,
    pub result: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Value>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Parts with synthesized content
// ---------------------------------------------------------------------------

/// An image reference.  `content` defaults to `"[Image: {file_id}]"`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "RawImagePart")]
pub struct ImagePart {
    pub file_id: String,
    pub user_id: String,
    pub mime_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    pub content: String,
    pub metadata: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Deserialize)]
struct RawImagePart {
    file_id: String,
    #[serde(default)]
    user_id: String,
    #[serde(default)]
    mime_type: String,
    #[serde(default)]
    width: Option<u32>,
    #[serde(default)]
    height: Option<u32>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    metadata: Map<String, Value>,
    #[serde(default = "Utc::now")]
    timestamp: DateTime<Utc>,
}

impl From<RawImagePart> for ImagePart {
    fn from(raw: RawImagePart) -> Self {
        let content = match raw.content.filter(|c| !c.trim().is_empty()) {
            Some(c) => c,
            None => format!("[Image: {}]", raw.file_id),
        };
        Self {
            file_id: raw.file_id,
            user_id: raw.user_id,
            mime_type: raw.mime_type,
            width: raw.width,
            height: raw.height,
            content,
            metadata: raw.metadata,
            timestamp: raw.timestamp,
        }
    }
}

/// A document reference.  `content` defaults to
/// `"[Document: {title or file_id}]"`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "RawDocumentPart")]
pub struct DocumentPart {
    pub file_id: String,
    pub mime_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pointer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub word_count: Option<u32>,
    pub content: String,
    pub metadata: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Deserialize)]
struct RawDocumentPart {
    file_id: String,
    #[serde(default)]
    mime_type: String,
    #[serde(default)]
    pointer: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    page_count: Option<u32>,
    #[serde(default)]
    word_count: Option<u32>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    metadata: Map<String, Value>,
    #[serde(default = "Utc::now")]
    timestamp: DateTime<Utc>,
}

impl From<RawDocumentPart> for DocumentPart {
    fn from(raw: RawDocumentPart) -> Self {
        let content = match raw.content.filter(|c| !c.trim().is_empty()) {
            Some(c) => c,
            None => {
                let name = raw.title.as_deref().unwrap_or(&raw.file_id);
                format!("[Document: {name}]")
            }
        };
        Self {
            file_id: raw.file_id,
            mime_type: raw.mime_type,
            pointer: raw.pointer,
            title: raw.title,
            page_count: raw.page_count,
            word_count: raw.word_count,
            content,
            metadata: raw.metadata,
            timestamp: raw.timestamp,
        }
    }
}

// ---------------------------------------------------------------------------
// Citation part
// ---------------------------------------------------------------------------

/// A passage citation.
///
/// Carries both the raw cited passage (`text`) and its display form
/// (`content`).  The two are synchronized on construction: a missing side is
/// derived from the other, and when both are missing placeholder defaults are
/// inserted so construction never fails.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "RawCitationPart")]
pub struct CitationPart {
    pub document_id: String,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub citation_id: Option<String>,
    pub content: String,
    pub metadata: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Deserialize)]
struct RawCitationPart {
    #[serde(default)]
    document_id: String,
    #[serde(default)]
    text: String,
    #[serde(default)]
    page: Option<u32>,
    #[serde(default)]
    section: Option<String>,
    #[serde(default)]
    citation_id: Option<String>,
    #[serde(default)]
    content: String,
    #[serde(default)]
    metadata: Map<String, Value>,
    #[serde(default = "Utc::now")]
    timestamp: DateTime<Utc>,
}

impl CitationPart {
    /// Build a citation from its raw passage text, formatting `content`.
    pub fn new(
        document_id: impl Into<String>,
        text: impl Into<String>,
        page: Option<u32>,
        section: Option<String>,
        citation_id: Option<String>,
    ) -> Self {
        let document_id = document_id.into();
        let text = text.into();
        let content = Self::format_content(&document_id, page, &text);
        Self {
            document_id,
            text,
            page,
            section,
            citation_id,
            content,
            metadata: Map::new(),
            timestamp: Utc::now(),
        }
    }

    /// The display form: `"[Citation from {doc} (page N)]: {text}"`.
    pub fn format_content(document_id: &str, page: Option<u32>, text: &str) -> String {
        match page {
            Some(p) => format!("[Citation from {document_id} (page {p})]: {text}"),
            None => format!("[Citation from {document_id}]: {text}"),
        }
    }

    /// Recover the raw passage from a formatted `content` string.
    ///
    /// Content in the `"[Citation from ...]: text"` shape yields the portion
    /// after the marker; anything else is taken as the passage itself.
    pub fn extract_text(content: &str) -> String {
        if content.starts_with("[Citation") {
            if let Some(pos) = content.find("]:") {
                return content[pos + 2..].trim_start().to_owned();
            }
        }
        content.to_owned()
    }
}

impl From<RawCitationPart> for CitationPart {
    fn from(raw: RawCitationPart) -> Self {
        let has_text = !raw.text.trim().is_empty();
        let has_content = !raw.content.trim().is_empty();

        let (text, content) = match (has_text, has_content) {
            (true, true) => (raw.text, raw.content),
            (true, false) => {
                let content = Self::format_content(&raw.document_id, raw.page, &raw.text);
                (raw.text, content)
            }
            (false, true) => (Self::extract_text(&raw.content), raw.content),
            (false, false) => {
                tracing::warn!(
                    document_id = %raw.document_id,
                    "citation with neither text nor content, inserting defaults"
                );
                (
                    "No citation content available".to_owned(),
                    "[Citation: No content available]".to_owned(),
                )
            }
        };

        Self {
            document_id: raw.document_id,
            text,
            page: raw.page,
            section: raw.section,
            citation_id: raw.citation_id,
            content,
            metadata: raw.metadata,
            timestamp: raw.timestamp,
        }
    }
}

// ---------------------------------------------------------------------------
// Base64 (de)serialization for binary fields
// ---------------------------------------------------------------------------

mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
