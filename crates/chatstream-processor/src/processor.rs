//! The event processor: normalize, sequence, dedupe, reduce, publish.
//!
//! One processor instance serves a whole worker.  Per-response state lives
//! in a lazily populated registry; a `tokio::sync::Mutex` per response
//! serializes sequence assignment, dedup checks, and state mutation.
//! Reducers are synchronous and never perform I/O — the broker publish
//! happens after the lock is released, which is safe because the event's
//! identity (sequence, dedup key) is already fixed by then.
//!
//! Failures inside a reducer never escape: they are converted into a
//! synthesized `error` event that is both recorded in state and published,
//! and processing continues for every other response.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use chatstream_broker::EventPublisher;
use chatstream_events::part::{
    CitationPart, DocumentPart, ReasoningPart, TextPart, ToolCallPart, ToolReturnPart,
};
use chatstream_events::{
    EndStatus, Event, EventPayload, Message, MessageKind, MessagePart, MessageStatus, ToolArgs,
};

use crate::classify::{Classified, RawEvent, classify_map};
use crate::dedup::dedup_key;
use crate::error::{ProcessorError, ProcessorResult};

// ---------------------------------------------------------------------------
// Per-response state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct ToolBinding {
    tool_id: String,
    tool_name: String,
}

/// Accumulated message state for one in-flight response.
#[derive(Debug)]
pub(crate) struct MessageState {
    status: String,
    parts: Vec<MessagePart>,
    metadata: Map<String, Value>,
    usage: Map<String, Value>,
    model_name: String,
    model_id: String,
    timestamp: DateTime<Utc>,
}

impl MessageState {
    fn new() -> Self {
        Self {
            status: "pending".into(),
            parts: Vec::new(),
            metadata: Map::new(),
            usage: Map::new(),
            model_name: String::new(),
            model_id: String::new(),
            timestamp: Utc::now(),
        }
    }

    fn to_message(&self, response_id: &str) -> Message {
        Message {
            message_id: response_id.to_owned(),
            chat_id: String::new(),
            parent_id: None,
            kind: MessageKind::Response,
            parts: self.parts.clone(),
            status: map_status(&self.status),
            metadata: self.metadata.clone(),
            timestamp: self.timestamp,
            model_name: self.model_name.clone(),
            usage: self.usage.clone(),
        }
    }
}

/// Map the free-form runtime status tag onto the stored status enum.
///
/// Progress tags from `status` events (searching, retrieving, ...) mean the
/// response is still running.
fn map_status(status: &str) -> MessageStatus {
    match status {
        "pending" => MessageStatus::Pending,
        "completed" | "complete" => MessageStatus::Complete,
        "error" => MessageStatus::Error,
        "user_stopped" => MessageStatus::UserStopped,
        _ => MessageStatus::InProgress,
    }
}

struct ResponseState {
    next_sequence: u64,
    seen: HashSet<String>,
    message: MessageState,
    tool_bindings: HashMap<u32, ToolBinding>,
}

impl ResponseState {
    fn new() -> Self {
        Self {
            next_sequence: 0,
            seen: HashSet::new(),
            message: MessageState::new(),
            tool_bindings: HashMap::new(),
        }
    }

    fn take_sequence(&mut self) -> u64 {
        let seq = self.next_sequence;
        self.next_sequence += 1;
        seq
    }

    /// Keep the counter strictly ahead of sequences that arrived pre-set,
    /// so later assignments stay monotone.
    fn observe_sequence(&mut self, sequence: u64) {
        if sequence >= self.next_sequence {
            self.next_sequence = sequence + 1;
        }
    }
}

// ---------------------------------------------------------------------------
// EventProcessor
// ---------------------------------------------------------------------------

/// Normalizes, sequences, deduplicates, and routes agent events.
pub struct EventProcessor {
    publisher: EventPublisher,
    states: DashMap<String, Arc<Mutex<ResponseState>>>,
}

impl EventProcessor {
    pub fn new(publisher: EventPublisher) -> Self {
        Self {
            publisher,
            states: DashMap::new(),
        }
    }

    /// Process one raw event.
    ///
    /// Returns the canonical event after normalization, or `None` when the
    /// event was dropped (missing response id, duplicate, internal signal).
    pub async fn process(&self, raw: RawEvent) -> ProcessorResult<Option<Event>> {
        let mut event = match raw {
            RawEvent::Typed(event) => {
                if event.response_id.is_empty() {
                    warn!(
                        event_type = event.event_type(),
                        "event missing response_id, dropping"
                    );
                    return Ok(None);
                }
                event
            }
            RawEvent::Map(value) => {
                let Some(response_id) = value
                    .get("response_id")
                    .and_then(Value::as_str)
                    .filter(|id| !id.is_empty())
                    .map(str::to_owned)
                else {
                    warn!("map event missing response_id, dropping");
                    return Ok(None);
                };

                match classify_map(&response_id, &value) {
                    Classified::Ignored(reason) => {
                        debug!(response_id = %response_id, reason, "internal signal, skipping");
                        return Ok(None);
                    }
                    Classified::ToolBinding {
                        content_block_index,
                        tool_id,
                        tool_name,
                    } => {
                        let state = self.state(&response_id);
                        let mut guard = state.lock().await;
                        debug!(
                            response_id = %response_id,
                            content_block_index,
                            tool_id = %tool_id,
                            tool_name = %tool_name,
                            "tool binding recorded"
                        );
                        guard
                            .tool_bindings
                            .insert(content_block_index, ToolBinding { tool_id, tool_name });
                        return Ok(None);
                    }
                    Classified::Event(event) => event,
                }
            }
        };

        let state = self.state(&event.response_id);
        let mut guard = state.lock().await;

        // Fragment events from vendor deltas carry no tool identity of
        // their own; inherit it from the block-start binding.
        if let EventPayload::ToolCall {
            tool_name, tool_id, ..
        } = &mut event.payload
        {
            if tool_id.is_empty() {
                if let Some(binding) = event
                    .content_block_index
                    .and_then(|index| guard.tool_bindings.get(&index))
                {
                    *tool_id = binding.tool_id.clone();
                    *tool_name = binding.tool_name.clone();
                }
            }
        }

        match event.sequence {
            None => event.sequence = Some(guard.take_sequence()),
            Some(sequence) => guard.observe_sequence(sequence),
        }
        if event.timestamp.is_none() {
            event.timestamp = Some(Utc::now());
        }

        let key = dedup_key(&event);
        if !guard.seen.insert(key.clone()) {
            warn!(
                response_id = %event.response_id,
                event_type = event.event_type(),
                dedup_key = %key,
                "duplicate event detected, skipping"
            );
            return Ok(None);
        }

        let error_event = match reduce(&mut guard.message, &event) {
            Ok(()) => None,
            Err(err) => {
                warn!(
                    response_id = %event.response_id,
                    event_type = event.event_type(),
                    error = %err,
                    "reducer failed, synthesizing error event"
                );
                let sequence = guard.take_sequence();
                let mut details = Map::new();
                details.insert(
                    "event_type".into(),
                    Value::String(event.event_type().into()),
                );
                details.insert(
                    "timestamp".into(),
                    Value::String(Utc::now().to_rfc3339()),
                );
                let error_event = Event::new(
                    event.response_id.clone(),
                    EventPayload::Error {
                        error_type: "internal_error".into(),
                        message: format!("Error processing {}: {err}", event.event_type()),
                        details: Some(Value::Object(details)),
                        chat_id: None,
                    },
                )
                .with_sequence(sequence);

                // The error reducer itself is total.
                let _ = reduce(&mut guard.message, &error_event);
                Some(error_event)
            }
        };

        drop(guard);

        // Publish outside the critical section.  A broker failure is logged
        // and swallowed: local state already reflects the event, so
        // durability is unharmed and delivery stays best-effort.
        if let Some(error_event) = &error_event {
            if let Err(err) = self.publisher.publish_event(error_event).await {
                warn!(response_id = %error_event.response_id, error = %err, "error event publish failed");
            }
        }
        if event.emit {
            if let Err(err) = self.publisher.publish_event(&event).await {
                warn!(
                    response_id = %event.response_id,
                    sequence = event.sequence,
                    error = %err,
                    "event publish failed"
                );
            }
        }

        Ok(Some(event))
    }

    /// Snapshot the accumulated message state for a response.
    ///
    /// `chat_id` is left empty — the coordinator owns that context.
    pub async fn snapshot(&self, response_id: &str) -> Option<Message> {
        let state = self.states.get(response_id)?.clone();
        let guard = state.lock().await;
        Some(guard.message.to_message(response_id))
    }

    /// Free all per-response state.  Called after the terminal event has
    /// been handled and the durable write completed.
    pub async fn cleanup(&self, response_id: &str) {
        if self.states.remove(response_id).is_some() {
            debug!(response_id, "response state cleaned up");
        }
    }

    /// Number of responses with live in-memory state (diagnostics).
    pub fn active_responses(&self) -> usize {
        self.states.len()
    }

    fn state(&self, response_id: &str) -> Arc<Mutex<ResponseState>> {
        self.states
            .entry(response_id.to_owned())
            .or_insert_with(|| Arc::new(Mutex::new(ResponseState::new())))
            .clone()
    }
}

// ---------------------------------------------------------------------------
// Reducers
// ---------------------------------------------------------------------------

/// Apply one event to the per-response message state.
///
/// Reducers are non-suspending and must not perform I/O; they run under the
/// per-response mutex.
fn reduce(state: &mut MessageState, event: &Event) -> ProcessorResult<()> {
    let block_metadata = block_metadata(event);

    match &event.payload {
        EventPayload::ResponseStart { model_id, .. } => {
            state.status = "in_progress".into();
            state.model_name = model_id.clone();
            state.model_id = model_id.clone();
            if let Some(ts) = event.timestamp {
                state.timestamp = ts;
            }
        }

        EventPayload::Content { content } => {
            if content.trim().is_empty() {
                debug!("skipping part creation for empty content fragment");
            } else {
                let mut part = TextPart::new(content.clone());
                part.metadata = block_metadata;
                state.parts.push(MessagePart::Text(part));
            }
        }

        EventPayload::Reasoning {
            text,
            signature,
            redacted_content,
        } => {
            if text.trim().is_empty() {
                debug!("skipping part creation for empty reasoning fragment");
            } else {
                state.parts.push(MessagePart::Reasoning(ReasoningPart {
                    content: text.clone(),
                    signature: signature.clone(),
                    redacted_content: redacted_content.clone().unwrap_or_default(),
                    metadata: block_metadata,
                    timestamp: event.timestamp.unwrap_or_else(Utc::now),
                }));
            }
        }

        EventPayload::ToolCall {
            tool_name,
            tool_id,
            tool_args,
        } => {
            let tool_args = match tool_args {
                ToolArgs::Object(map) => map.clone(),
                ToolArgs::Fragment(raw) => {
                    // Raw fragments are kept verbatim; aggregation merges
                    // and parses them at terminal time.
                    let mut map = Map::new();
                    map.insert("input".into(), Value::String(raw.clone()));
                    map
                }
            };
            state.parts.push(MessagePart::ToolCall(ToolCallPart {
                tool_name: tool_name.clone(),
                tool_id: tool_id.clone(),
                tool_args,
                content: None,
                metadata: block_metadata,
                timestamp: event.timestamp.unwrap_or_else(Utc::now),
            }));
        }

        EventPayload::ToolReturn {
            tool_name,
            tool_id,
            result,
        } => {
            state.parts.push(MessagePart::ToolReturn(ToolReturnPart {
                tool_name: tool_name.clone(),
                tool_id: tool_id.clone(),
                result: result.clone(),
                content: None,
                metadata: block_metadata,
                timestamp: event.timestamp.unwrap_or_else(Utc::now),
            }));
        }

        EventPayload::Document {
            document_id,
            title,
            pointer,
            mime_type,
            page_count,
            word_count,
        } => {
            let content = if title.is_empty() {
                format!("[Document: {document_id}]")
            } else {
                format!("[Document: {title}]")
            };
            state.parts.push(MessagePart::Document(DocumentPart {
                file_id: document_id.clone(),
                mime_type: mime_type.clone(),
                pointer: Some(pointer.clone()).filter(|p| !p.is_empty()),
                title: Some(title.clone()).filter(|t| !t.is_empty()),
                page_count: *page_count,
                word_count: *word_count,
                content,
                metadata: block_metadata,
                timestamp: event.timestamp.unwrap_or_else(Utc::now),
            }));
        }

        EventPayload::Citation {
            document_id,
            text,
            page,
            section,
            citation_id,
        } => {
            let mut part = CitationPart::new(
                document_id.clone().unwrap_or_default(),
                text.clone(),
                *page,
                section.clone(),
                citation_id.clone(),
            );
            part.metadata = block_metadata;
            state.parts.push(MessagePart::Citation(part));
        }

        EventPayload::Metadata { metadata } => {
            for (key, value) in metadata {
                if key == "usage" {
                    let usage = value.as_object().ok_or_else(|| {
                        ProcessorError::InvalidEvent {
                            reason: format!("metadata usage must be an object, got {value}"),
                        }
                    })?;
                    deep_merge(&mut state.usage, usage);
                } else {
                    state.metadata.insert(key.clone(), value.clone());
                }
            }
        }

        EventPayload::Status { status, message } => {
            state.status = status.clone();
            if let Some(message) = message {
                state
                    .metadata
                    .insert("status_message".into(), Value::String(message.clone()));
            }
        }

        EventPayload::ResponseEnd { status, usage, .. } => {
            state.status = match status {
                EndStatus::Completed => "completed".into(),
                EndStatus::Error => "error".into(),
                EndStatus::UserStopped => "user_stopped".into(),
            };
            deep_merge(&mut state.usage, usage);
        }

        EventPayload::Error {
            error_type,
            message,
            details,
            ..
        } => {
            state.status = "error".into();
            state
                .metadata
                .insert("error_type".into(), Value::String(error_type.clone()));
            state
                .metadata
                .insert("error_message".into(), Value::String(message.clone()));
            if let Some(details) = details {
                state
                    .metadata
                    .insert("error_details".into(), details.clone());
            }
        }
    }

    Ok(())
}

fn block_metadata(event: &Event) -> Map<String, Value> {
    let mut metadata = Map::new();
    if let Some(index) = event.content_block_index {
        metadata.insert("content_block_index".into(), Value::from(index));
        if let Some(seq) = event.block_sequence {
            metadata.insert("block_sequence".into(), Value::from(seq));
        }
    }
    metadata
}

/// Merge `incoming` into `target`, recursing into nested objects.
fn deep_merge(target: &mut Map<String, Value>, incoming: &Map<String, Value>) {
    for (key, value) in incoming {
        match (target.get_mut(key), value) {
            (Some(Value::Object(existing)), Value::Object(new)) => deep_merge(existing, new),
            _ => {
                target.insert(key.clone(), value.clone());
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
