//! Deduplication keys for streaming events.
//!
//! Keys are derived exclusively from structurally stable fields, so the same
//! logical event always maps to the same key — even when it arrives twice
//! with a freshly assigned sequence number.  Object identity is never used.

use std::hash::{DefaultHasher, Hash, Hasher};

use chatstream_events::{Event, EventPayload, ToolArgs};

/// Compute the dedup key for an event.
///
/// Per variant:
/// - `tool_call` / `tool_return` dedupe on tool identity plus block
///   position — the fields scenario-stable across replays.
/// - `content` / `reasoning` fragments dedupe on block position plus a hash
///   of the fragment text; fragments without block tracking fall back to
///   the assigned sequence so legitimately repeated text is kept.
/// - `document` dedupes on the document id, `citation` on block position
///   plus citation id or text hash.
/// - Everything else dedupes on `(tag, sequence)`.
pub fn dedup_key(event: &Event) -> String {
    let tag = event.event_type();
    let block = format_block(event);

    match &event.payload {
        EventPayload::ToolCall {
            tool_id, tool_args, ..
        } => {
            // Fragments of one streamed call share a tool id; the block
            // position and fragment hash keep them distinct from each other.
            let args_hash = match tool_args {
                ToolArgs::Fragment(raw) => hash_str(raw),
                ToolArgs::Object(map) => hash_str(&serde_json::Value::Object(map.clone()).to_string()),
            };
            format!("{tag}:{block}:{tool_id}:{args_hash:x}")
        }
        EventPayload::ToolReturn { tool_id, .. } => format!("{tag}:{tool_id}"),
        EventPayload::Content { content } => match event.content_block_index {
            Some(_) => format!("{tag}:{block}:{:x}", hash_str(content)),
            None => format!(
                "{tag}:seq{}:{:x}",
                event.sequence.unwrap_or(0),
                hash_str(content)
            ),
        },
        EventPayload::Reasoning { text, .. } => match event.content_block_index {
            Some(_) => format!("{tag}:{block}:{:x}", hash_str(text)),
            None => format!(
                "{tag}:seq{}:{:x}",
                event.sequence.unwrap_or(0),
                hash_str(text)
            ),
        },
        EventPayload::Document { document_id, .. } => format!("{tag}:{document_id}"),
        EventPayload::Citation {
            citation_id, text, ..
        } => match citation_id {
            Some(id) => format!("{tag}:{block}:{id}"),
            None => format!("{tag}:{block}:{:x}", hash_str(text)),
        },
        _ => format!("{tag}:seq{}", event.sequence.unwrap_or(0)),
    }
}

fn format_block(event: &Event) -> String {
    format!(
        "b{}.{}",
        event
            .content_block_index
            .map(|i| i.to_string())
            .unwrap_or_else(|| "-".into()),
        event
            .block_sequence
            .map(|i| i.to_string())
            .unwrap_or_else(|| "-".into())
    )
}

fn hash_str(s: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    s.hash(&mut hasher);
    hasher.finish()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
