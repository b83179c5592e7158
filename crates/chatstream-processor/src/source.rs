//! The opaque agent seam.
//!
//! The pipeline never invokes a model directly; it consumes an asynchronous
//! stream of raw events from whatever agent backend the binary wires in.
//! [`EventSource`] is that boundary: given a generation request, produce
//! the stream.  Cancellation is handled by the coordinator, not the source
//! — a source only needs to stop yielding once its stream is dropped.

use std::pin::Pin;

use futures::Stream;

use crate::classify::RawEvent;

/// Everything needed to start one generation.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    /// The chat this generation belongs to.
    pub chat_id: String,
    /// The stored request message being answered.
    pub request_id: String,
    /// Identity of the response; also the id of the stored message.
    pub response_id: String,
    /// Model to invoke.
    pub model_id: String,
    /// Task descriptor for the agent layer.
    pub task: String,
    /// Parent for hierarchy indexing (defaults to the request).
    pub parent_id: Option<String>,
}

/// A boxed stream of raw agent events.
pub type EventStream = Pin<Box<dyn Stream<Item = RawEvent> + Send>>;

/// An agent backend capable of producing event streams.
pub trait EventSource: Send + Sync {
    /// Start a generation and return its event stream.
    fn run(&self, request: &GenerationRequest) -> EventStream;
}
