//! The response-level coordinator — the single writer of the final message.
//!
//! For each generation the coordinator creates the pending placeholder
//! message, forwards every agent event through the processor (which
//! sequences, reduces, and publishes it), buffers the canonical events for
//! terminal-time aggregation, and performs the one durable write per
//! response.  A response that ends without a terminal event still completes:
//! a synthetic `response_end` is published and the message is stored
//! `complete`.  Client interrupts arrive through a cancellation token and
//! leave the message stored as `user_stopped` with everything buffered so
//! far aggregated normally.

use futures::StreamExt;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use chatstream_events::{EndStatus, Event, EventPayload, Message, MessageStatus};
use chatstream_store::MessageRepository;

use crate::classify::RawEvent;
use crate::error::ProcessorResult;
use crate::processor::EventProcessor;
use crate::source::{EventSource, GenerationRequest};

/// Coordinates one worker's responses from first event to durable write.
pub struct ResponseCoordinator {
    processor: std::sync::Arc<EventProcessor>,
    repository: MessageRepository,
}

impl ResponseCoordinator {
    pub fn new(processor: std::sync::Arc<EventProcessor>, repository: MessageRepository) -> Self {
        Self {
            processor,
            repository,
        }
    }

    /// The processor this coordinator forwards events through.
    pub fn processor(&self) -> &std::sync::Arc<EventProcessor> {
        &self.processor
    }

    /// Drive one response to completion and return the stored message.
    ///
    /// Store failures on the final write propagate to the caller; the
    /// processor's in-memory state is left intact in that case so the write
    /// can be retried.
    pub async fn run(
        &self,
        request: GenerationRequest,
        source: &dyn EventSource,
        cancel: CancellationToken,
    ) -> ProcessorResult<Message> {
        let response_id = request.response_id.clone();
        info!(
            response_id = %response_id,
            chat_id = %request.chat_id,
            model_id = %request.model_id,
            "response processing started"
        );

        // Placeholder first: the message exists from the moment the
        // response does.
        let placeholder = Message::response_placeholder(
            &response_id,
            &request.chat_id,
            Some(request.request_id.clone()),
            &request.model_id,
        );
        self.repository.create_message(&placeholder).await?;

        let start = Event::new(
            &response_id,
            EventPayload::ResponseStart {
                request_id: request.request_id.clone(),
                chat_id: request.chat_id.clone(),
                model_id: request.model_id.clone(),
                parent_id: request.parent_id.clone(),
                task: request.task.clone(),
            },
        );

        let mut buffered: Vec<Event> = Vec::new();
        let mut terminal: Option<Event> = None;

        if let Some(event) = self.processor.process(RawEvent::Typed(start)).await? {
            buffered.push(event);
        }

        let mut stream = source.run(&request);
        let mut cancelled = false;

        loop {
            let raw = tokio::select! {
                _ = cancel.cancelled() => {
                    info!(response_id = %response_id, "generation cancelled by client");
                    cancelled = true;
                    break;
                }
                item = stream.next() => match item {
                    Some(raw) => raw,
                    None => break,
                },
            };

            let raw = self.stamp_chat_id(raw, &request.chat_id);
            match self.processor.process(raw).await {
                Ok(Some(event)) => {
                    if event.is_terminal() && terminal.is_none() {
                        terminal = Some(event.clone());
                    }
                    buffered.push(event);
                }
                Ok(None) => {}
                Err(err) => {
                    // The processor contains reducer failures itself; an
                    // error here is unexpected but must not kill the
                    // response.
                    error!(response_id = %response_id, error = %err, "event processing failed");
                }
            }
        }

        // Terminal resolution: cancellation wins, then whatever the stream
        // reported, then the synthetic completion for exhausted sources.
        if cancelled {
            let end = Event::new(
                &response_id,
                EventPayload::ResponseEnd {
                    status: EndStatus::UserStopped,
                    usage: Map::new(),
                    chat_id: Some(request.chat_id.clone()),
                },
            );
            if let Some(event) = self.processor.process(RawEvent::Typed(end)).await? {
                terminal = Some(event.clone());
                buffered.push(event);
            }
        } else if terminal.is_none() {
            warn!(
                response_id = %response_id,
                "source exhausted without terminal event, synthesizing completion"
            );
            let end = Event::new(
                &response_id,
                EventPayload::ResponseEnd {
                    status: EndStatus::Completed,
                    usage: Map::new(),
                    chat_id: Some(request.chat_id.clone()),
                },
            );
            if let Some(event) = self.processor.process(RawEvent::Typed(end)).await? {
                terminal = Some(event.clone());
                buffered.push(event);
            }
        }

        let message = self.finalize(&request, &buffered, terminal.as_ref()).await?;

        // Only after the durable write has succeeded is the in-memory state
        // released.
        self.processor.cleanup(&response_id).await;

        info!(
            response_id = %response_id,
            parts = message.parts.len(),
            status = ?message.status,
            "response processing finished"
        );
        Ok(message)
    }

    // -- Private helpers ----------------------------------------------------

    /// Aggregate the buffered events and write the final message.
    async fn finalize(
        &self,
        request: &GenerationRequest,
        buffered: &[Event],
        terminal: Option<&Event>,
    ) -> ProcessorResult<Message> {
        let parts = crate::aggregate::aggregate_response(buffered);
        debug!(
            response_id = %request.response_id,
            events = buffered.len(),
            parts = parts.len(),
            "aggregation complete"
        );

        let mut message = Message::response_placeholder(
            &request.response_id,
            &request.chat_id,
            Some(request.request_id.clone()),
            &request.model_id,
        );
        message.parts = parts;

        match terminal.map(|e| &e.payload) {
            Some(EventPayload::ResponseEnd { status, usage, .. }) => {
                message.status = match status {
                    EndStatus::Completed => MessageStatus::Complete,
                    EndStatus::Error => MessageStatus::Error,
                    EndStatus::UserStopped => MessageStatus::UserStopped,
                };
                if !usage.is_empty() {
                    message.usage = usage.clone();
                    message
                        .metadata
                        .insert("usage_info".into(), Value::Object(usage.clone()));
                }
            }
            Some(EventPayload::Error {
                error_type,
                message: error_message,
                details,
                ..
            }) => {
                message.status = MessageStatus::Error;
                let mut error_info = Map::new();
                error_info.insert("type".into(), Value::String(error_type.clone()));
                error_info.insert("message".into(), Value::String(error_message.clone()));
                if let Some(details) = details {
                    error_info.insert("details".into(), details.clone());
                }
                message
                    .metadata
                    .insert("error".into(), Value::Object(error_info));
            }
            _ => message.status = MessageStatus::Complete,
        }

        self.repository.save_message(&message).await?;

        // Promote the originating request if it is still pending.
        if !request.request_id.is_empty() {
            match self
                .repository
                .get_message(&request.chat_id, &request.request_id)
                .await
            {
                Ok(Some(req)) if req.status == MessageStatus::Pending => {
                    if let Err(err) = self
                        .repository
                        .update_message_status(
                            &request.chat_id,
                            &request.request_id,
                            MessageStatus::Complete,
                        )
                        .await
                    {
                        warn!(
                            request_id = %request.request_id,
                            error = %err,
                            "failed to promote request status"
                        );
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(
                        request_id = %request.request_id,
                        error = %err,
                        "failed to load request message"
                    );
                }
            }
        }

        Ok(message)
    }

    /// Make sure terminal events carry the chat they belong to.
    fn stamp_chat_id(&self, raw: RawEvent, chat_id: &str) -> RawEvent {
        match raw {
            RawEvent::Typed(mut event) => {
                match &mut event.payload {
                    EventPayload::ResponseEnd { chat_id: slot, .. }
                    | EventPayload::Error { chat_id: slot, .. } => {
                        if slot.is_none() {
                            *slot = Some(chat_id.to_owned());
                        }
                    }
                    _ => {}
                }
                RawEvent::Typed(event)
            }
            other => other,
        }
    }
}
