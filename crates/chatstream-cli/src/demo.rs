//! A scripted event source so the server runs end-to-end out of the box.
//!
//! Stands in for the real agent backend: every generation streams a short
//! echo of the task as content fragments, then terminates normally.  Wire a
//! real [`EventSource`] here to talk to an actual model.

use futures::StreamExt;
use serde_json::{Map, json};

use chatstream_events::{EndStatus, Event, EventPayload};
use chatstream_processor::{EventSource, EventStream, GenerationRequest, RawEvent};

/// Event source that echoes the request back as a streamed response.
#[derive(Debug, Default, Clone)]
pub struct DemoSource;

impl DemoSource {
    pub fn new() -> Self {
        Self
    }
}

impl EventSource for DemoSource {
    fn run(&self, request: &GenerationRequest) -> EventStream {
        let response_id = request.response_id.clone();
        let text = format!("You asked about: {}", request.task);

        // Stream the text in small fragments the way a model would.
        let fragments: Vec<String> = text
            .as_bytes()
            .chunks(8)
            .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
            .collect();

        let mut events: Vec<RawEvent> = Vec::new();
        events.push(RawEvent::Typed(Event::new(
            &response_id,
            EventPayload::Status {
                status: "generating".into(),
                message: Some("demo source streaming".into()),
            },
        )));
        for (i, fragment) in fragments.iter().enumerate() {
            events.push(RawEvent::Typed(
                Event::new(
                    &response_id,
                    EventPayload::Content {
                        content: fragment.clone(),
                    },
                )
                .with_block(0, i as u32),
            ));
        }

        let mut usage = Map::new();
        usage.insert("input_tokens".into(), json!(text.len() as u64 / 4));
        usage.insert("output_tokens".into(), json!(fragments.len() as u64));
        events.push(RawEvent::Typed(Event::new(
            &response_id,
            EventPayload::ResponseEnd {
                status: EndStatus::Completed,
                usage,
                chat_id: None,
            },
        )));

        // A short delay per fragment keeps the stream observably "live".
        Box::pin(
            futures::stream::iter(events).then(|event| async move {
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                event
            }),
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn demo_stream_ends_with_terminal_event() {
        let source = DemoSource::new();
        let request = GenerationRequest {
            chat_id: "c1".into(),
            request_id: "q1".into(),
            response_id: "r1".into(),
            model_id: "demo".into(),
            task: "the weather".into(),
            parent_id: None,
        };

        let events: Vec<RawEvent> = source.run(&request).collect().await;
        assert!(events.len() >= 3);

        let last = events.last().unwrap();
        match last {
            RawEvent::Typed(event) => assert!(event.is_terminal()),
            other => panic!("expected typed event, got {other:?}"),
        }

        // Concatenating the fragments reproduces the echo text.
        let text: String = events
            .iter()
            .filter_map(|raw| match raw {
                RawEvent::Typed(event) => match &event.payload {
                    EventPayload::Content { content } => Some(content.clone()),
                    _ => None,
                },
                _ => None,
            })
            .collect();
        assert_eq!(text, "You asked about: the weather");
    }
}
