//! Structural classification of loosely shaped agent events.
//!
//! The agent SDK produces events as nested maps whose schema is discovered
//! by key presence.  This module pattern-matches over the small, enumerated
//! set of shapes and converts each into the canonical [`Event`] — no
//! reflection, just a hand-written dispatcher, the same approach used for
//! vendor streaming payloads elsewhere in the stack.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use chatstream_events::{EndStatus, Event, EventPayload, ToolArgs};

/// Raw input to the processor: already-typed or map-shaped.
#[derive(Debug, Clone)]
pub enum RawEvent {
    Typed(Event),
    Map(Value),
}

impl From<Event> for RawEvent {
    fn from(event: Event) -> Self {
        Self::Typed(event)
    }
}

/// The result of classifying a map-shaped event.
#[derive(Debug)]
pub enum Classified {
    /// A canonical event to run through the normal pipeline.
    Event(Event),

    /// A `contentBlockStart` binding `(block index → tool identity)`.
    /// Recorded in per-response state; emits nothing itself.
    ToolBinding {
        content_block_index: u32,
        tool_id: String,
        tool_name: String,
    },

    /// An internal signal with nothing to process (e.g. `init_event_loop`).
    Ignored(&'static str),
}

/// Stop reasons that terminate a response normally.
const TERMINAL_STOP_REASONS: &[&str] =
    &["end_turn", "stop_sequence", "max_tokens", "content_filtered"];

/// Classify a map-shaped event for `response_id`.
pub fn classify_map(response_id: &str, map: &Value) -> Classified {
    // Vendor streaming payloads nest under an `event` key.
    if let Some(inner) = map.get("event") {
        if let Some(classified) = classify_vendor_event(response_id, map, inner) {
            return classified;
        }
    }

    if map.get("init_event_loop").is_some() {
        return Classified::Ignored("init_event_loop");
    }

    if let Some(metrics) = map.get("event_loop_metrics") {
        return classify_loop_metrics(response_id, metrics);
    }

    // Any top-level key ending in `Exception` is a fault report.
    if let Some((key, value)) = exception_entry(map) {
        let message = value
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .unwrap_or_else(|| value.to_string());
        return Classified::Event(with_envelope(
            map,
            Event::new(
                response_id,
                EventPayload::Error {
                    error_type: key,
                    message,
                    details: Some(value.clone()),
                    chat_id: None,
                },
            ),
        ));
    }

    classify_plain_map(response_id, map)
}

// ---------------------------------------------------------------------------
// Vendor payloads (`event.*` shapes)
// ---------------------------------------------------------------------------

fn classify_vendor_event(response_id: &str, outer: &Value, inner: &Value) -> Option<Classified> {
    if let Some(delta) = inner.get("contentBlockDelta") {
        let block_index = delta
            .get("contentBlockIndex")
            .and_then(Value::as_u64)
            .map(|i| i as u32);
        let block_sequence = delta
            .get("contentBlockPart")
            .and_then(Value::as_u64)
            .map(|i| i as u32);

        let payload = delta.get("delta")?;

        if let Some(text) = payload.get("text").and_then(Value::as_str) {
            let mut event = with_envelope(
                outer,
                Event::new(
                    response_id,
                    EventPayload::Content {
                        content: text.to_owned(),
                    },
                ),
            );
            event.content_block_index = block_index.or(event.content_block_index);
            event.block_sequence = block_sequence.or(event.block_sequence);
            return Some(Classified::Event(event));
        }

        if let Some(tool_use) = payload.get("toolUse") {
            let input = tool_use
                .get("input")
                .map(|v| match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .unwrap_or_default();
            // Tool identity arrives in the block-start frame; the processor
            // fills it in from the recorded binding.
            let mut event = with_envelope(
                outer,
                Event::new(
                    response_id,
                    EventPayload::ToolCall {
                        tool_name: String::new(),
                        tool_id: String::new(),
                        tool_args: ToolArgs::Fragment(input),
                    },
                ),
            );
            event.content_block_index = block_index.or(event.content_block_index);
            event.block_sequence = block_sequence.or(event.block_sequence);
            return Some(Classified::Event(event));
        }

        if let Some(reasoning) = payload.get("reasoningContent") {
            let text = reasoning
                .get("text")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_owned();
            let signature = reasoning
                .get("signature")
                .and_then(Value::as_str)
                .map(str::to_owned);
            let mut event = with_envelope(
                outer,
                Event::new(
                    response_id,
                    EventPayload::Reasoning {
                        text,
                        signature,
                        redacted_content: None,
                    },
                ),
            );
            event.content_block_index = block_index.or(event.content_block_index);
            event.block_sequence = block_sequence.or(event.block_sequence);
            return Some(Classified::Event(event));
        }

        return None;
    }

    if let Some(start) = inner.get("contentBlockStart") {
        let tool_use = start.get("start")?.get("toolUse")?;
        let content_block_index = start
            .get("contentBlockIndex")
            .and_then(Value::as_u64)
            .map(|i| i as u32)
            .unwrap_or(0);
        return Some(Classified::ToolBinding {
            content_block_index,
            tool_id: tool_use
                .get("toolUseId")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_owned(),
            tool_name: tool_use
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_owned(),
        });
    }

    if inner.get("contentBlockStop").is_some() {
        // Block boundaries carry no content; aggregation derives block
        // membership from the indexes on the fragments themselves.
        return Some(Classified::Ignored("content_block_stop"));
    }

    if let Some(stop) = inner.get("messageStop") {
        let reason = stop
            .get("stopReason")
            .and_then(Value::as_str)
            .unwrap_or_default();
        if TERMINAL_STOP_REASONS.contains(&reason) {
            let mut usage = Map::new();
            usage.insert("stop_reason".into(), Value::String(reason.to_owned()));
            return Some(Classified::Event(with_envelope(
                outer,
                Event::new(
                    response_id,
                    EventPayload::ResponseEnd {
                        status: EndStatus::Completed,
                        usage,
                        chat_id: None,
                    },
                ),
            )));
        }
        return Some(Classified::Ignored("unrecognized stop reason"));
    }

    None
}

/// `event_loop_metrics` frames carry token usage worth keeping; everything
/// else about them is internal.
fn classify_loop_metrics(response_id: &str, metrics: &Value) -> Classified {
    let usage = metrics
        .get("accumulated_usage")
        .or_else(|| metrics.get("usage"))
        .and_then(Value::as_object);

    match usage {
        Some(usage) if !usage.is_empty() => {
            let mut metadata = Map::new();
            metadata.insert("usage".into(), Value::Object(usage.clone()));
            Classified::Event(
                Event::new(response_id, EventPayload::Metadata { metadata }).internal(),
            )
        }
        _ => Classified::Ignored("event_loop_metrics without usage"),
    }
}

fn exception_entry(map: &Value) -> Option<(String, &Value)> {
    map.as_object()?
        .iter()
        .find(|(key, _)| key.ends_with("Exception"))
        .map(|(key, value)| (key.clone(), value))
}

// ---------------------------------------------------------------------------
// Plain dict shapes
// ---------------------------------------------------------------------------

fn classify_plain_map(response_id: &str, map: &Value) -> Classified {
    let get_str = |key: &str| map.get(key).and_then(Value::as_str).map(str::to_owned);

    // response_start: identified by request routing fields.
    if map.get("request_id").is_some() && map.get("chat_id").is_some() {
        return Classified::Event(with_envelope(
            map,
            Event::new(
                response_id,
                EventPayload::ResponseStart {
                    request_id: get_str("request_id").unwrap_or_default(),
                    chat_id: get_str("chat_id").unwrap_or_default(),
                    model_id: get_str("model_id").unwrap_or_default(),
                    parent_id: get_str("parent_id"),
                    task: get_str("task").unwrap_or_default(),
                },
            ),
        ));
    }

    // response_end: a status together with usage counters.
    if map.get("status").is_some() && map.get("usage").is_some() {
        let status = match get_str("status").as_deref() {
            Some("error") => EndStatus::Error,
            Some("user_stopped") => EndStatus::UserStopped,
            _ => EndStatus::Completed,
        };
        let usage = map
            .get("usage")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        return Classified::Event(with_envelope(
            map,
            Event::new(
                response_id,
                EventPayload::ResponseEnd {
                    status,
                    usage,
                    chat_id: get_str("chat_id"),
                },
            ),
        ));
    }

    if map.get("error_type").is_some() || map.get("error").is_some() {
        let error_type = get_str("error_type")
            .or_else(|| get_str("error"))
            .unwrap_or_else(|| "UnknownError".to_owned());
        return Classified::Event(with_envelope(
            map,
            Event::new(
                response_id,
                EventPayload::Error {
                    error_type,
                    message: get_str("message").unwrap_or_else(|| "An error occurred".into()),
                    details: map.get("details").cloned(),
                    chat_id: get_str("chat_id"),
                },
            ),
        ));
    }

    if let Some(tool_name) = get_str("tool_name") {
        if map.get("result").is_some() {
            return Classified::Event(with_envelope(
                map,
                Event::new(
                    response_id,
                    EventPayload::ToolReturn {
                        tool_name,
                        tool_id: get_str("tool_id").unwrap_or_default(),
                        result: map.get("result").cloned().unwrap_or(Value::Null),
                    },
                ),
            ));
        }

        let tool_args = match map.get("tool_args") {
            Some(Value::Object(args)) => ToolArgs::Object(args.clone()),
            Some(Value::String(raw)) => ToolArgs::Fragment(raw.clone()),
            _ => ToolArgs::default(),
        };
        return Classified::Event(with_envelope(
            map,
            Event::new(
                response_id,
                EventPayload::ToolCall {
                    tool_name,
                    tool_id: get_str("tool_id").unwrap_or_default(),
                    tool_args,
                },
            ),
        ));
    }

    if let Some(document_id) = get_str("document_id") {
        if let Some(text) = get_str("text") {
            return Classified::Event(with_envelope(
                map,
                Event::new(
                    response_id,
                    EventPayload::Citation {
                        document_id: Some(document_id),
                        text,
                        page: map.get("page").and_then(Value::as_u64).map(|p| p as u32),
                        section: get_str("section"),
                        citation_id: get_str("citation_id"),
                    },
                ),
            ));
        }
        return Classified::Event(with_envelope(
            map,
            Event::new(
                response_id,
                EventPayload::Document {
                    document_id,
                    title: get_str("title").unwrap_or_default(),
                    pointer: get_str("pointer").unwrap_or_default(),
                    mime_type: get_str("mime_type").unwrap_or_default(),
                    page_count: map
                        .get("page_count")
                        .and_then(Value::as_u64)
                        .map(|c| c as u32),
                    word_count: map
                        .get("word_count")
                        .and_then(Value::as_u64)
                        .map(|c| c as u32),
                },
            ),
        ));
    }

    // Text deltas arrive under `content` or `data`.
    if let Some(content) = get_str("content").or_else(|| get_str("data")) {
        return Classified::Event(with_envelope(
            map,
            Event::new(response_id, EventPayload::Content { content }),
        ));
    }

    if let Some(text) = get_str("text") {
        return Classified::Event(with_envelope(
            map,
            Event::new(
                response_id,
                EventPayload::Reasoning {
                    text,
                    signature: get_str("signature"),
                    redacted_content: None,
                },
            ),
        ));
    }

    if let Some(status) = get_str("status") {
        return Classified::Event(with_envelope(
            map,
            Event::new(
                response_id,
                EventPayload::Status {
                    status,
                    message: get_str("message"),
                },
            ),
        ));
    }

    if map.get("metadata").is_some() || map.get("usage").is_some() {
        let metadata = match (map.get("metadata"), map.get("usage")) {
            (Some(Value::Object(m)), _) => m.clone(),
            (_, Some(usage)) => {
                let mut m = Map::new();
                m.insert("usage".into(), usage.clone());
                m
            }
            _ => Map::new(),
        };
        return Classified::Event(with_envelope(
            map,
            Event::new(response_id, EventPayload::Metadata { metadata }),
        ));
    }

    // Nothing matched: surface as a warning status so the stream stays
    // observable instead of silently swallowing the frame.
    tracing::warn!(response_id, "unknown map event shape");
    Classified::Event(Event::new(
        response_id,
        EventPayload::Status {
            status: "warning".into(),
            message: Some("Received unknown event format".into()),
        },
    ))
}

// ---------------------------------------------------------------------------
// Envelope extraction
// ---------------------------------------------------------------------------

/// Copy envelope fields present on the map onto a freshly built event.
fn with_envelope(map: &Value, mut event: Event) -> Event {
    if let Some(sequence) = map.get("sequence").and_then(Value::as_u64) {
        event.sequence = Some(sequence);
    }
    if let Some(ts) = map.get("timestamp").and_then(Value::as_str) {
        if let Ok(parsed) = ts.parse::<DateTime<Utc>>() {
            event.timestamp = Some(parsed);
        }
    }
    if let Some(emit) = map.get("emit").and_then(Value::as_bool) {
        event.emit = emit;
    }
    if let Some(persist) = map.get("persist").and_then(Value::as_bool) {
        event.persist = persist;
    }
    if let Some(index) = map.get("content_block_index").and_then(Value::as_u64) {
        event.content_block_index = Some(index as u32);
    }
    if let Some(seq) = map.get("block_sequence").and_then(Value::as_u64) {
        event.block_sequence = Some(seq as u32);
    }
    event
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
