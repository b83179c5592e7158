//! WebSocket endpoint: connection lifecycle and inbound protocol dispatch.
//!
//! Clients connect to `/ws` and exchange `{"type", "data", "timestamp"}`
//! frames.  `initialize` starts a generation and implicitly subscribes the
//! connection to its response; `interrupt` cancels the chat's active
//! generation; `ping` keeps the connection alive.  Outbound frames are
//! queued on a per-connection channel drained by a single writer task, so
//! a connection always observes its frames in enqueue order.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use chatstream_events::part::TextPart;
use chatstream_events::{Message as ChatMessage, MessagePart, MessageStatus};
use chatstream_processor::GenerationRequest;

use crate::frames::{WsMessage, WsMessageType};
use crate::session::ClientSink;
use crate::state::AppState;

/// Axum handler that upgrades the HTTP connection to a WebSocket.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

/// Process a single WebSocket connection until it closes.
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let connection_id = Uuid::now_v7().to_string();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    state.sessions.connect(&connection_id, tx.clone()).await;

    let (mut sink, mut stream) = socket.split();

    // One writer task per connection: everything queued on `tx` leaves the
    // socket in order.
    let writer_connection = connection_id.clone();
    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let Err(err) = sink.send(Message::Text(frame.into())).await {
                debug!(connection_id = %writer_connection, error = %err, "socket write failed");
                break;
            }
        }
    });

    while let Some(Ok(message)) = stream.next().await {
        let text = match message {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };

        let frame: WsMessage = match serde_json::from_str(&text) {
            Ok(frame) => frame,
            Err(err) => {
                let _ = state
                    .sessions
                    .send_message(
                        &connection_id,
                        WsMessageType::Error,
                        json!({"error": err.to_string(), "error_type": "invalid_message"}),
                    )
                    .await;
                continue;
            }
        };

        match frame.message_type {
            WsMessageType::Ping => {
                let _ = state
                    .sessions
                    .send_message(&connection_id, WsMessageType::Pong, json!({}))
                    .await;
            }

            WsMessageType::Interrupt => {
                handle_interrupt(&state, &connection_id, &frame.data).await;
            }

            WsMessageType::Initialize => {
                handle_initialize(&state, &connection_id, &tx, &frame.data).await;
            }

            other => {
                warn!(
                    connection_id = %connection_id,
                    message_type = ?other,
                    "unexpected client frame type"
                );
                let _ = state
                    .sessions
                    .send_message(
                        &connection_id,
                        WsMessageType::Error,
                        json!({
                            "error": "unexpected message type",
                            "error_type": "invalid_message",
                        }),
                    )
                    .await;
            }
        }
    }

    state.sessions.disconnect(&connection_id).await;
    writer.abort();
}

/// Cancel the active generation for the chat named in the frame.
async fn handle_interrupt(state: &Arc<AppState>, connection_id: &str, data: &Value) {
    let Some(chat_id) = data.get("chat_id").and_then(Value::as_str) else {
        let _ = state
            .sessions
            .send_message(
                connection_id,
                WsMessageType::Error,
                json!({"error": "interrupt requires chat_id", "error_type": "invalid_message"}),
            )
            .await;
        return;
    };

    let message_id = state.sessions.active_generation(chat_id).await;
    let partial = match &message_id {
        Some(message_id) => state
            .sessions
            .get_accumulated_content(chat_id, message_id)
            .await,
        None => None,
    };

    state.sessions.stop_generation(chat_id).await;

    let mut ack = json!({"status": "generation_stopped", "chat_id": chat_id});
    if let Some(partial) = partial {
        ack["partial_content"] = Value::String(partial);
    }
    let _ = state
        .sessions
        .send_message(connection_id, WsMessageType::Status, ack)
        .await;
}

/// Start a generation for the connection and subscribe it to the response.
async fn handle_initialize(
    state: &Arc<AppState>,
    connection_id: &str,
    tx: &mpsc::UnboundedSender<String>,
    data: &Value,
) {
    let chat_id = data
        .get("chat_id")
        .and_then(Value::as_str)
        .map(str::to_owned)
        .unwrap_or_else(|| Uuid::now_v7().to_string());
    let model_id = data
        .get("model_id")
        .or_else(|| data.get("model"))
        .and_then(Value::as_str)
        .unwrap_or("default")
        .to_owned();
    let task = data
        .get("task")
        .and_then(Value::as_str)
        .unwrap_or("chat")
        .to_owned();
    let content = data
        .get("content")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_owned();

    let request_id = Uuid::now_v7().to_string();
    let response_id = Uuid::now_v7().to_string();

    // Store the user's request first, pending until its response lands.
    let parts = if content.trim().is_empty() {
        Vec::new()
    } else {
        vec![MessagePart::Text(TextPart::new(content))]
    };
    let mut request_message = ChatMessage::request(&request_id, &chat_id, None, parts);
    request_message.status = MessageStatus::Pending;
    if let Err(err) = state.repository.create_message(&request_message).await {
        warn!(chat_id = %chat_id, error = %err, "failed to store request message");
        let _ = state
            .sessions
            .send_message(
                connection_id,
                WsMessageType::Error,
                json!({"error": err.to_string(), "error_type": "store_error"}),
            )
            .await;
        return;
    }

    state.sessions.register_chat(connection_id, &chat_id).await;

    // Bind this connection to the response stream.
    let client_sink = ClientSink::new(connection_id, tx.clone());
    if let Err(err) = state
        .sessions
        .subscribe_to_response(&response_id, client_sink)
        .await
    {
        warn!(response_id = %response_id, error = %err, "failed to subscribe client");
    }

    spawn_content_tracker(state, &chat_id, &response_id).await;

    let cancel = CancellationToken::new();
    state
        .sessions
        .track_generation(&chat_id, &response_id, cancel.clone())
        .await;

    let request = GenerationRequest {
        chat_id: chat_id.clone(),
        request_id,
        response_id: response_id.clone(),
        model_id,
        task,
        parent_id: None,
    };

    info!(
        connection_id = %connection_id,
        chat_id = %chat_id,
        response_id = %response_id,
        "generation starting"
    );

    let run_state = Arc::clone(state);
    let run_connection = connection_id.to_owned();
    tokio::spawn(async move {
        let source = Arc::clone(&run_state.source);
        let result = run_state
            .coordinator
            .run(request.clone(), source.as_ref(), cancel)
            .await;

        run_state.sessions.stop_generation(&request.chat_id).await;
        run_state
            .sessions
            .clear_accumulated_content(&request.chat_id, &request.response_id)
            .await;

        if let Err(err) = result {
            warn!(
                response_id = %request.response_id,
                error = %err,
                "generation failed"
            );
            let _ = run_state
                .sessions
                .send_message(
                    &run_connection,
                    WsMessageType::Error,
                    json!({
                        "error": err.to_string(),
                        "error_type": "generation_error",
                        "response_id": request.response_id,
                    }),
                )
                .await;
        }
    });

    let _ = state
        .sessions
        .send_message(
            connection_id,
            WsMessageType::Status,
            json!({
                "status": "generation_started",
                "chat_id": chat_id,
                "response_id": response_id,
            }),
        )
        .await;
}

/// Subscribe an internal sink that mirrors streamed text into the
/// accumulated-content cache, so an interrupt acknowledgement can report
/// the partial answer.  The tracker unsubscribes itself on the terminal
/// frame.
async fn spawn_content_tracker(state: &Arc<AppState>, chat_id: &str, response_id: &str) {
    let (tracker_tx, mut tracker_rx) = mpsc::unbounded_channel::<String>();
    let tracker_sink = ClientSink::new(format!("tracker:{response_id}"), tracker_tx);
    let tracker_id = tracker_sink.sink_id;

    if let Err(err) = state
        .sessions
        .subscribe_to_response(response_id, tracker_sink)
        .await
    {
        warn!(response_id = %response_id, error = %err, "failed to start content tracker");
        return;
    }

    let tracker_state = Arc::clone(state);
    let chat_id = chat_id.to_owned();
    let response_id = response_id.to_owned();
    tokio::spawn(async move {
        while let Some(frame) = tracker_rx.recv().await {
            let Ok(value) = serde_json::from_str::<Value>(&frame) else {
                continue;
            };
            match value.get("type").and_then(Value::as_str) {
                Some("event") => {
                    let data = &value["data"];
                    match data.get("__event_type__").and_then(Value::as_str) {
                        Some("content") => {
                            if let Some(delta) = data.get("content").and_then(Value::as_str) {
                                tracker_state
                                    .sessions
                                    .track_content(&chat_id, &response_id, delta, true)
                                    .await;
                            }
                        }
                        Some("response_end") => break,
                        _ => {}
                    }
                }
                Some("error") => break,
                _ => {}
            }
        }
        tracker_state
            .sessions
            .unsubscribe_from_response(&response_id, tracker_id)
            .await;
    });
}
