//! Gateway integration tests: broker-fed delivery to live clients while the
//! coordinator writes durably.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use chatstream_broker::{EventPublisher, MemoryBroker};
use chatstream_events::{EndStatus, Event, EventPayload, MessagePart, MessageStatus};
use chatstream_gateway::session::{ClientSink, SessionManager};
use chatstream_processor::{
    EventProcessor, EventSource, EventStream, GenerationRequest, RawEvent, ResponseCoordinator,
};
use chatstream_store::{Database, MemoryKvStore, MessageRepository};

struct ScriptedSource {
    events: Vec<RawEvent>,
}

impl EventSource for ScriptedSource {
    fn run(&self, _request: &GenerationRequest) -> EventStream {
        Box::pin(futures::stream::iter(self.events.clone()))
    }
}

struct Harness {
    sessions: Arc<SessionManager>,
    coordinator: ResponseCoordinator,
    repository: MessageRepository,
}

fn harness() -> Harness {
    let broker = Arc::new(MemoryBroker::new());
    let kv = Arc::new(MemoryKvStore::new());
    let sessions = Arc::new(
        SessionManager::new(kv, broker.clone()).with_poll_timeout(Duration::from_millis(20)),
    );
    let processor = Arc::new(EventProcessor::new(EventPublisher::new(broker)));
    let repository = MessageRepository::new(Database::open_in_memory().unwrap());
    let coordinator = ResponseCoordinator::new(processor, repository.clone());
    Harness {
        sessions,
        coordinator,
        repository,
    }
}

fn script(response_id: &str) -> ScriptedSource {
    ScriptedSource {
        events: vec![
            RawEvent::Typed(
                Event::new(
                    response_id,
                    EventPayload::Content {
                        content: "Hel".into(),
                    },
                )
                .with_block(0, 0),
            ),
            RawEvent::Typed(
                Event::new(
                    response_id,
                    EventPayload::Content {
                        content: "lo".into(),
                    },
                )
                .with_block(0, 1),
            ),
            RawEvent::Typed(Event::new(
                response_id,
                EventPayload::ResponseEnd {
                    status: EndStatus::Completed,
                    usage: Map::new(),
                    chat_id: None,
                },
            )),
        ],
    }
}

fn request(response_id: &str, chat_id: &str) -> GenerationRequest {
    GenerationRequest {
        chat_id: chat_id.into(),
        request_id: format!("q-{response_id}"),
        response_id: response_id.into(),
        model_id: "model-a".into(),
        task: "chat".into(),
        parent_id: None,
    }
}

async fn collect_frames(rx: &mut mpsc::UnboundedReceiver<String>) -> Vec<Value> {
    let mut frames = Vec::new();
    while let Ok(Some(frame)) =
        tokio::time::timeout(Duration::from_millis(300), rx.recv()).await
    {
        frames.push(serde_json::from_str(&frame).unwrap());
    }
    frames
}

#[tokio::test]
async fn subscribed_client_sees_the_stream_the_store_persists() {
    let h = harness();

    let (tx, mut rx) = mpsc::unbounded_channel();
    h.sessions
        .subscribe_to_response("R1", ClientSink::new("conn-1", tx))
        .await
        .unwrap();

    // Let the listener reach its first poll before publishing begins.
    tokio::time::sleep(Duration::from_millis(40)).await;

    let message = h
        .coordinator
        .run(request("R1", "C1"), &script("R1"), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(message.status, MessageStatus::Complete);
    match &message.parts[0] {
        MessagePart::Text(part) => assert_eq!(part.content, "Hello"),
        other => panic!("expected Text, got {other:?}"),
    }

    let frames = collect_frames(&mut rx).await;
    let types: Vec<&str> = frames
        .iter()
        .filter_map(|f| f["type"].as_str())
        .collect();
    assert_eq!(types[0], "connection_established");

    let event_tags: Vec<&str> = frames
        .iter()
        .filter(|f| f["type"] == "event")
        .filter_map(|f| f["data"]["__event_type__"].as_str())
        .collect();
    assert!(event_tags.contains(&"response_start"));
    assert_eq!(event_tags.iter().filter(|t| **t == "content").count(), 2);
    assert!(event_tags.contains(&"response_end"));

    // What the client saw is what the store kept.
    let stored = h.repository.get_message("C1", "R1").await.unwrap().unwrap();
    assert_eq!(stored.parts.len(), 1);
}

#[tokio::test]
async fn disconnect_during_response_releases_only_that_connection() {
    let h = harness();

    let (tx_a, _rx_a) = mpsc::unbounded_channel();
    let (tx_b, mut rx_b) = mpsc::unbounded_channel();
    h.sessions.connect("conn-a", tx_a.clone()).await;
    h.sessions.connect("conn-b", tx_b.clone()).await;

    h.sessions
        .subscribe_to_response("R2", ClientSink::new("conn-a", tx_a))
        .await
        .unwrap();
    h.sessions
        .subscribe_to_response("R2", ClientSink::new("conn-b", tx_b))
        .await
        .unwrap();
    assert_eq!(h.sessions.subscriber_count("R2"), 2);

    // A leaves before the response finishes.
    h.sessions.disconnect("conn-a").await;
    assert_eq!(h.sessions.subscriber_count("R2"), 1);
    assert_eq!(h.sessions.connection_count(), 1);

    tokio::time::sleep(Duration::from_millis(40)).await;

    let message = h
        .coordinator
        .run(request("R2", "C2"), &script("R2"), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(message.status, MessageStatus::Complete);

    // B still received the stream; the store is unaffected by A's exit.
    let frames = collect_frames(&mut rx_b).await;
    assert!(
        frames
            .iter()
            .any(|f| f["type"] == "event" && f["data"]["__event_type__"] == "response_end")
    );
    assert!(h.repository.get_message("C2", "R2").await.unwrap().is_some());
}
