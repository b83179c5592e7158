//! Data model for the chatstream pipeline.
//!
//! This crate defines the two vocabularies both halves of the pipeline must
//! agree on:
//!
//! - [`Event`] — the wire unit of streaming: a common envelope (response id,
//!   sequence, block tracking, emit/persist flags) plus a tagged payload
//!   discriminated by `__event_type__`.
//! - [`MessagePart`] / [`Message`] — the stored unit: typed message parts
//!   discriminated by `part_kind`, assembled into one durable message per
//!   response.
//!
//! Everything here is plain data with serde derives; no I/O happens in this
//! crate.

pub mod error;
pub mod event;
pub mod message;
pub mod part;

pub use error::{EventError, EventResult};
pub use event::{EndStatus, Event, EventPayload, ToolArgs, deserialize_event, serialize_event};
pub use message::{Message, MessageKind, MessageStatus};
pub use part::{
    CitationPart, DocumentPart, ImagePart, MessagePart, ReasoningPart, TextPart, ToolCallPart,
    ToolReturnPart,
};
