//! Terminal-time aggregation of fragmented events into compacted parts.
//!
//! During streaming the processor appends one raw part per fragment; the
//! durable message instead carries one part per logical content block.
//! This module is the pure reduction that gets there: events are grouped by
//! `content_block_index`, events of the same variant within a block reduce
//! to a single part, and events without block tracking reduce in a "loose"
//! bucket ordered by sequence.  Everything here is side-effect free and
//! total — a reduction that cannot produce its declared part type degrades
//! to a text part with the problem noted in metadata.

use std::collections::BTreeMap;

use chrono::Utc;
use serde_json::{Map, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use chatstream_events::part::{
    CitationPart, DocumentPart, ReasoningPart, TextPart, ToolCallPart, ToolReturnPart,
};
use chatstream_events::{Event, EventPayload, MessagePart, ToolArgs};

/// Document id inserted when a citation arrives without one.
///
/// Inherited from the system this pipeline replaces, where the literal is
/// baked into stored data; kept for wire-level parity.
/// TODO: migrate stored citations and replace this with "unknown".
pub const FALLBACK_DOCUMENT_ID: &str = "cd4739en";

/// Reduce every buffered event of a response into its final part list.
///
/// Blocks come first in index order, then the loose bucket in sequence
/// order.  Applying the reduction to an already-compacted event list
/// reproduces the same parts.
pub fn aggregate_response(events: &[Event]) -> Vec<MessagePart> {
    let mut blocks: BTreeMap<u32, Vec<&Event>> = BTreeMap::new();
    let mut loose: Vec<&Event> = Vec::new();

    for event in events {
        match event.content_block_index {
            Some(index) => blocks.entry(index).or_default().push(event),
            None => loose.push(event),
        }
    }

    let mut parts = Vec::new();

    for (index, block_events) in &blocks {
        for (variant, group) in group_by_variant(block_events) {
            debug!(
                content_block_index = index,
                variant,
                count = group.len(),
                "reducing block group"
            );
            if let Some(part) = part_from_events(&group) {
                parts.push(part);
            }
        }
    }

    if !loose.is_empty() {
        loose.sort_by_key(|e| e.sequence.unwrap_or(0));
        for (variant, group) in group_by_variant(&loose) {
            debug!(variant, count = group.len(), "reducing loose group");
            if let Some(part) = part_from_events(&group) {
                parts.push(part);
            }
        }
    }

    parts
}

/// Group events by variant, preserving first-seen variant order.
fn group_by_variant<'a>(events: &[&'a Event]) -> Vec<(&'static str, Vec<&'a Event>)> {
    let mut groups: Vec<(&'static str, Vec<&'a Event>)> = Vec::new();
    for event in events {
        let tag = event.event_type();
        match groups.iter_mut().find(|(t, _)| *t == tag) {
            Some((_, group)) => group.push(event),
            None => groups.push((tag, vec![event])),
        }
    }
    groups
}

/// Reduce one same-variant group of events into a single part.
///
/// Returns `None` for variants that never become parts (`status` and the
/// lifecycle events) and for text/reasoning groups that reduce to nothing.
pub fn part_from_events(events: &[&Event]) -> Option<MessagePart> {
    let first = events.first()?;

    match &first.payload {
        EventPayload::Content { .. } => reduce_content(events),
        EventPayload::Reasoning { .. } => reduce_reasoning(events),
        EventPayload::ToolCall { .. } => reduce_tool_call(events),
        EventPayload::Citation { .. } => Some(reduce_citation(events)),
        EventPayload::Document { .. } => Some(reduce_document(first)),
        EventPayload::ToolReturn { .. } => Some(reduce_tool_return(first)),
        // Streaming-only and lifecycle variants produce no part.
        EventPayload::Status { .. }
        | EventPayload::ResponseStart { .. }
        | EventPayload::ResponseEnd { .. }
        | EventPayload::Metadata { .. }
        | EventPayload::Error { .. } => None,
    }
}

// ---------------------------------------------------------------------------
// Variant reductions
// ---------------------------------------------------------------------------

fn order_key(event: &Event) -> (u64, u32) {
    (event.sequence.unwrap_or(0), event.block_sequence.unwrap_or(0))
}

fn sorted<'a>(events: &[&'a Event]) -> Vec<&'a Event> {
    let mut sorted: Vec<&Event> = events.to_vec();
    sorted.sort_by_key(|e| order_key(e));
    sorted
}

fn block_metadata(event: &Event) -> Map<String, Value> {
    let mut metadata = Map::new();
    if let Some(index) = event.content_block_index {
        metadata.insert("content_block_index".into(), Value::from(index));
    }
    metadata
}

fn reduce_content(events: &[&Event]) -> Option<MessagePart> {
    let sorted = sorted(events);
    let combined: String = sorted
        .iter()
        .filter_map(|e| match &e.payload {
            EventPayload::Content { content } => Some(content.as_str()),
            _ => None,
        })
        .collect();

    if combined.trim().is_empty() {
        return None;
    }

    let mut part = TextPart::new(combined);
    part.metadata = block_metadata(sorted[0]);
    Some(MessagePart::Text(part))
}

fn reduce_reasoning(events: &[&Event]) -> Option<MessagePart> {
    let sorted = sorted(events);

    let mut fragments = Vec::new();
    let mut signature = None;
    let mut redacted = Vec::new();
    for event in &sorted {
        if let EventPayload::Reasoning {
            text,
            signature: sig,
            redacted_content,
        } = &event.payload
        {
            if !text.is_empty() {
                fragments.push(text.as_str());
            }
            if sig.as_deref().is_some_and(|s| !s.is_empty()) {
                signature = sig.clone();
            }
            if let Some(bytes) = redacted_content {
                if !bytes.is_empty() {
                    redacted = bytes.clone();
                }
            }
        }
    }

    let combined = fragments.join("\n");
    if combined.trim().is_empty() {
        return None;
    }

    Some(MessagePart::Reasoning(ReasoningPart {
        content: combined,
        signature,
        redacted_content: redacted,
        metadata: block_metadata(sorted[0]),
        timestamp: Utc::now(),
    }))
}

fn reduce_tool_call(events: &[&Event]) -> Option<MessagePart> {
    let sorted = sorted(events);

    // Tool identity comes from the first event that actually carries it.
    let mut tool_name = String::new();
    let mut tool_id = String::new();
    for event in &sorted {
        if let EventPayload::ToolCall {
            tool_name: name,
            tool_id: id,
            ..
        } = &event.payload
        {
            if tool_name.is_empty() && !name.is_empty() {
                tool_name = name.clone();
            }
            if tool_id.is_empty() && !id.is_empty() {
                tool_id = id.clone();
            }
        }
    }

    let mut raw_content = String::new();
    let mut object_fragments: Vec<&Map<String, Value>> = Vec::new();

    for event in &sorted {
        let EventPayload::ToolCall { tool_args, .. } = &event.payload else {
            continue;
        };
        match tool_args {
            ToolArgs::Fragment(raw) => raw_content.push_str(raw),
            ToolArgs::Object(map) => {
                // `{"delta": "token"}` is a streamed fragment in disguise.
                match map.get("delta").and_then(Value::as_str) {
                    Some(delta) if map.len() == 1 => raw_content.push_str(delta),
                    _ if map.is_empty() => {}
                    _ => object_fragments.push(map),
                }
            }
        }
    }

    let tool_args = if !raw_content.is_empty() {
        parse_streamed_args(&raw_content)
    } else if let Some(last) = object_fragments.last() {
        (*last).clone()
    } else {
        Map::new()
    };

    Some(MessagePart::ToolCall(ToolCallPart {
        tool_name,
        tool_id,
        tool_args,
        content: None,
        metadata: block_metadata(sorted[0]),
        timestamp: Utc::now(),
    }))
}

/// Concatenated streaming fragments become one argument object: parseable
/// JSON objects are used as-is, anything else is wrapped under `input`.
fn parse_streamed_args(raw: &str) -> Map<String, Value> {
    if raw.trim_start().starts_with('{') {
        if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(raw) {
            return map;
        }
    }
    let mut map = Map::new();
    map.insert("input".into(), Value::String(raw.to_owned()));
    map
}

fn reduce_citation(events: &[&Event]) -> MessagePart {
    let sorted = sorted(events);

    let mut document_id = None;
    let mut page = None;
    let mut section = None;
    let mut citation_id = None;
    if let EventPayload::Citation {
        document_id: doc,
        page: p,
        section: s,
        citation_id: cid,
        ..
    } = &sorted[0].payload
    {
        document_id = doc.clone().filter(|d| !d.is_empty());
        page = *p;
        section = s.clone();
        citation_id = cid.clone();
    }

    let document_id = document_id.unwrap_or_else(|| {
        warn!(
            fallback = FALLBACK_DOCUMENT_ID,
            "citation missing document_id, applying fallback"
        );
        FALLBACK_DOCUMENT_ID.to_owned()
    });

    let citation_id = citation_id.or_else(|| Some(Uuid::now_v7().to_string()));

    let fragments: Vec<&str> = sorted
        .iter()
        .filter_map(|e| match &e.payload {
            EventPayload::Citation { text, .. } if !text.is_empty() => Some(text.as_str()),
            _ => None,
        })
        .collect();
    let combined = fragments.join(" ");

    let mut part = if combined.is_empty() {
        // Both sides empty: insert the placeholder pair rather than fail.
        CitationPart {
            document_id,
            text: "No citation content available".into(),
            page,
            section,
            citation_id,
            content: "[Citation: No content available]".into(),
            metadata: Map::new(),
            timestamp: Utc::now(),
        }
    } else {
        CitationPart::new(document_id, combined, page, section, citation_id)
    };
    part.metadata = block_metadata(sorted[0]);

    MessagePart::Citation(part)
}

fn reduce_document(event: &Event) -> MessagePart {
    let EventPayload::Document {
        document_id,
        title,
        pointer,
        mime_type,
        page_count,
        word_count,
    } = &event.payload
    else {
        unreachable!("caller dispatched on variant");
    };

    let content = if title.is_empty() {
        format!("[Document: {document_id}]")
    } else {
        format!("[Document: {title}]")
    };

    MessagePart::Document(DocumentPart {
        file_id: document_id.clone(),
        mime_type: mime_type.clone(),
        pointer: Some(pointer.clone()).filter(|p| !p.is_empty()),
        title: Some(title.clone()).filter(|t| !t.is_empty()),
        page_count: *page_count,
        word_count: *word_count,
        content,
        metadata: block_metadata(event),
        timestamp: Utc::now(),
    })
}

fn reduce_tool_return(event: &Event) -> MessagePart {
    let EventPayload::ToolReturn {
        tool_name,
        tool_id,
        result,
    } = &event.payload
    else {
        unreachable!("caller dispatched on variant");
    };

    MessagePart::ToolReturn(ToolReturnPart {
        tool_name: tool_name.clone(),
        tool_id: tool_id.clone(),
        result: result.clone(),
        content: None,
        metadata: block_metadata(event),
        timestamp: Utc::now(),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn content(text: &str, block: u32, block_seq: u32, sequence: u64) -> Event {
        Event::new("r1", EventPayload::Content { content: text.into() })
            .with_block(block, block_seq)
            .with_sequence(sequence)
    }

    #[test]
    fn content_fragments_concatenate_in_order() {
        // Deliberately out of arrival order.
        let events = vec![
            content("lo", 0, 1, 2),
            content("Hel", 0, 0, 1),
        ];
        let parts = aggregate_response(&events);
        assert_eq!(parts.len(), 1);
        match &parts[0] {
            MessagePart::Text(p) => assert_eq!(p.content, "Hello"),
            other => panic!("expected Text, got {other:?}"),
        }
    }

    #[test]
    fn blocks_reduce_independently_and_in_index_order() {
        let events = vec![
            content("second", 1, 0, 3),
            content("first", 0, 0, 1),
        ];
        let parts = aggregate_response(&events);
        assert_eq!(parts.len(), 2);
        match (&parts[0], &parts[1]) {
            (MessagePart::Text(a), MessagePart::Text(b)) => {
                assert_eq!(a.content, "first");
                assert_eq!(b.content, "second");
            }
            other => panic!("expected two Text parts, got {other:?}"),
        }
    }

    #[test]
    fn no_duplicate_parts_per_block_and_variant() {
        let events = vec![
            content("a", 0, 0, 0),
            content("b", 0, 1, 1),
            content("c", 0, 2, 2),
        ];
        let parts = aggregate_response(&events);
        assert_eq!(parts.len(), 1);
    }

    #[test]
    fn streamed_tool_args_parse_to_object() {
        // The S2 shape: identity first, then split JSON fragments.
        let mk = |args: ToolArgs, seq: u64, block_seq: u32| {
            Event::new(
                "r2",
                EventPayload::ToolCall {
                    tool_name: if seq == 0 { "calc".into() } else { String::new() },
                    tool_id: if seq == 0 { "t1".into() } else { String::new() },
                    tool_args: args,
                },
            )
            .with_block(0, block_seq)
            .with_sequence(seq)
        };

        let events = vec![
            mk(ToolArgs::Object(Map::new()), 0, 0),
            mk(ToolArgs::Fragment("{\"expr".into()), 1, 1),
            mk(ToolArgs::Fragment("ession\": \"1".into()), 2, 2),
            mk(ToolArgs::Fragment("+1\"}".into()), 3, 3),
        ];

        let parts = aggregate_response(&events);
        assert_eq!(parts.len(), 1);
        match &parts[0] {
            MessagePart::ToolCall(p) => {
                assert_eq!(p.tool_name, "calc");
                assert_eq!(p.tool_id, "t1");
                assert_eq!(p.tool_args.get("expression"), Some(&json!("1+1")));
            }
            other => panic!("expected ToolCall, got {other:?}"),
        }
    }

    #[test]
    fn unparseable_fragments_wrap_as_input() {
        let events = vec![
            Event::new(
                "r2",
                EventPayload::ToolCall {
                    tool_name: "shell".into(),
                    tool_id: "t2".into(),
                    tool_args: ToolArgs::Fragment("ls -la".into()),
                },
            )
            .with_block(0, 0),
        ];
        let parts = aggregate_response(&events);
        match &parts[0] {
            MessagePart::ToolCall(p) => {
                assert_eq!(p.tool_args.get("input"), Some(&json!("ls -la")));
            }
            other => panic!("expected ToolCall, got {other:?}"),
        }
    }

    #[test]
    fn delta_maps_count_as_fragments() {
        let mk = |delta: &str, seq: u64| {
            let mut map = Map::new();
            map.insert("delta".into(), json!(delta));
            Event::new(
                "r2",
                EventPayload::ToolCall {
                    tool_name: "calc".into(),
                    tool_id: "t3".into(),
                    tool_args: ToolArgs::Object(map),
                },
            )
            .with_block(0, seq as u32)
            .with_sequence(seq)
        };

        let events = vec![mk("{\"n\":", 0), mk("4}", 1)];
        let parts = aggregate_response(&events);
        match &parts[0] {
            MessagePart::ToolCall(p) => assert_eq!(p.tool_args.get("n"), Some(&json!(4))),
            other => panic!("expected ToolCall, got {other:?}"),
        }
    }

    #[test]
    fn complete_object_args_take_the_last() {
        let mk = |value: u64, seq: u64| {
            let mut map = Map::new();
            map.insert("attempt".into(), json!(value));
            Event::new(
                "r2",
                EventPayload::ToolCall {
                    tool_name: "calc".into(),
                    tool_id: "t4".into(),
                    tool_args: ToolArgs::Object(map),
                },
            )
            .with_block(0, seq as u32)
            .with_sequence(seq)
        };

        let events = vec![mk(1, 0), mk(2, 1)];
        let parts = aggregate_response(&events);
        match &parts[0] {
            MessagePart::ToolCall(p) => assert_eq!(p.tool_args.get("attempt"), Some(&json!(2))),
            other => panic!("expected ToolCall, got {other:?}"),
        }
    }

    #[test]
    fn citation_fragments_join_with_spaces_and_stay_consistent() {
        let mk = |text: &str, seq: u64| {
            Event::new(
                "r3",
                EventPayload::Citation {
                    document_id: Some("D1".into()),
                    text: text.into(),
                    page: Some(3),
                    section: None,
                    citation_id: Some("c1".into()),
                },
            )
            .with_block(2, seq as u32)
            .with_sequence(seq)
        };

        let events = vec![mk("first half", 0), mk("second half", 1)];
        let parts = aggregate_response(&events);
        match &parts[0] {
            MessagePart::Citation(p) => {
                assert_eq!(p.text, "first half second half");
                assert_eq!(
                    p.content,
                    "[Citation from D1 (page 3)]: first half second half"
                );
                assert_eq!(p.citation_id.as_deref(), Some("c1"));
                assert!(!p.text.is_empty() && !p.content.is_empty());
            }
            other => panic!("expected Citation, got {other:?}"),
        }
    }

    #[test]
    fn citation_without_document_id_gets_fallback_and_generated_id() {
        let events = vec![
            Event::new(
                "r3",
                EventPayload::Citation {
                    document_id: None,
                    text: "orphan passage".into(),
                    page: None,
                    section: None,
                    citation_id: None,
                },
            )
            .with_block(0, 0),
        ];
        let parts = aggregate_response(&events);
        match &parts[0] {
            MessagePart::Citation(p) => {
                assert_eq!(p.document_id, FALLBACK_DOCUMENT_ID);
                assert!(p.citation_id.as_deref().is_some_and(|id| !id.is_empty()));
            }
            other => panic!("expected Citation, got {other:?}"),
        }
    }

    #[test]
    fn reasoning_joins_with_newlines_and_keeps_last_signature() {
        let mk = |text: &str, sig: Option<&str>, seq: u64| {
            Event::new(
                "r4",
                EventPayload::Reasoning {
                    text: text.into(),
                    signature: sig.map(str::to_owned),
                    redacted_content: None,
                },
            )
            .with_block(0, seq as u32)
            .with_sequence(seq)
        };

        let events = vec![
            mk("step one", Some("s1"), 0),
            mk("step two", None, 1),
            mk("step three", Some("s3"), 2),
        ];
        let parts = aggregate_response(&events);
        match &parts[0] {
            MessagePart::Reasoning(p) => {
                assert_eq!(p.content, "step one\nstep two\nstep three");
                assert_eq!(p.signature.as_deref(), Some("s3"));
            }
            other => panic!("expected Reasoning, got {other:?}"),
        }
    }

    #[test]
    fn document_and_tool_return_take_first_event() {
        let doc = |title: &str, seq: u64| {
            Event::new(
                "r5",
                EventPayload::Document {
                    document_id: "d1".into(),
                    title: title.into(),
                    pointer: "s3://bucket/d1".into(),
                    mime_type: "application/pdf".into(),
                    page_count: Some(10),
                    word_count: None,
                },
            )
            .with_block(0, seq as u32)
            .with_sequence(seq)
        };

        let parts = aggregate_response(&[doc("First", 0), doc("Second", 1)]);
        assert_eq!(parts.len(), 1);
        match &parts[0] {
            MessagePart::Document(p) => {
                assert_eq!(p.title.as_deref(), Some("First"));
                assert_eq!(p.content, "[Document: First]");
            }
            other => panic!("expected Document, got {other:?}"),
        }
    }

    #[test]
    fn status_events_are_dropped() {
        let events = vec![
            Event::new(
                "r6",
                EventPayload::Status {
                    status: "searching".into(),
                    message: None,
                },
            )
            .with_block(0, 0),
        ];
        assert!(aggregate_response(&events).is_empty());
    }

    #[test]
    fn loose_events_reduce_in_sequence_order() {
        let mk = |text: &str, seq: u64| {
            Event::new("r7", EventPayload::Content { content: text.into() }).with_sequence(seq)
        };
        let events = vec![mk("world", 5), mk("hello ", 2)];
        let parts = aggregate_response(&events);
        match &parts[0] {
            MessagePart::Text(p) => assert_eq!(p.content, "hello world"),
            other => panic!("expected Text, got {other:?}"),
        }
    }

    #[test]
    fn empty_content_group_produces_no_part() {
        let events = vec![content("   ", 0, 0, 0)];
        assert!(aggregate_response(&events).is_empty());
    }

    #[test]
    fn aggregation_is_idempotent_on_compacted_events() {
        let original = vec![
            content("Hel", 0, 0, 1),
            content("lo", 0, 1, 2),
        ];
        let first_pass = aggregate_response(&original);

        // Re-express the compacted parts as single events and re-aggregate.
        let compacted: Vec<Event> = first_pass
            .iter()
            .map(|part| match part {
                MessagePart::Text(p) => {
                    Event::new("r1", EventPayload::Content { content: p.content.clone() })
                        .with_block(0, 0)
                        .with_sequence(0)
                }
                other => panic!("unexpected part {other:?}"),
            })
            .collect();
        let second_pass = aggregate_response(&compacted);

        assert_eq!(first_pass.len(), second_pass.len());
        match (&first_pass[0], &second_pass[0]) {
            (MessagePart::Text(a), MessagePart::Text(b)) => assert_eq!(a.content, b.content),
            other => panic!("expected Text parts, got {other:?}"),
        }
    }
}
