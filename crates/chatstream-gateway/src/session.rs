//! Per-connection and per-response session state.
//!
//! The [`SessionManager`] owns four things: the in-memory transport handles
//! of live WebSocket connections, the TTL'd KV records mirroring them
//! (`ws:conn:*`, `ws:chat:*`, `ws:gen:*`), the subscriber sets binding
//! clients to responses, and the broker listener task opened for each
//! response with at least one subscriber.
//!
//! Delivery semantics: per connection, frames leave in enqueue order (one
//! writer task drains one channel); a failing subscriber is dropped from its
//! set without disturbing peers; the listener task for a response is
//! cancelled and its broker subscription closed once the last subscriber
//! leaves.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use moka::future::Cache;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use chatstream_broker::{PubSub, Subscription, response_channel};
use chatstream_events::{Event, deserialize_event};
use chatstream_store::{KeyValueStore, keys};

use crate::error::{GatewayError, GatewayResult};
use crate::frames::{WsMessage, WsMessageType, format_event_for_websocket};

// ---------------------------------------------------------------------------
// Client sinks
// ---------------------------------------------------------------------------

/// One client's delivery handle for one subscription.
///
/// Frames pushed here are drained by the connection's socket-writer task, so
/// per-connection ordering is the channel's FIFO order.
#[derive(Debug, Clone)]
pub struct ClientSink {
    pub sink_id: Uuid,
    pub connection_id: String,
    tx: mpsc::UnboundedSender<String>,
}

impl ClientSink {
    pub fn new(connection_id: impl Into<String>, tx: mpsc::UnboundedSender<String>) -> Self {
        Self {
            sink_id: Uuid::now_v7(),
            connection_id: connection_id.into(),
            tx,
        }
    }

    fn send(&self, frame: String) -> bool {
        self.tx.send(frame).is_ok()
    }
}

struct Listener {
    token: CancellationToken,
    _handle: JoinHandle<()>,
}

// ---------------------------------------------------------------------------
// SessionManager
// ---------------------------------------------------------------------------

/// WebSocket session and subscription lifecycle manager.
pub struct SessionManager {
    kv: Arc<dyn KeyValueStore>,
    pubsub: Arc<dyn PubSub>,
    connections: DashMap<String, mpsc::UnboundedSender<String>>,
    subscribers: Arc<DashMap<String, Vec<ClientSink>>>,
    listeners: DashMap<String, Listener>,
    generations: DashMap<String, CancellationToken>,
    accumulated: Cache<String, String>,
    poll_timeout: Duration,
}

impl SessionManager {
    pub fn new(kv: Arc<dyn KeyValueStore>, pubsub: Arc<dyn PubSub>) -> Self {
        Self {
            kv,
            pubsub,
            connections: DashMap::new(),
            subscribers: Arc::new(DashMap::new()),
            listeners: DashMap::new(),
            generations: DashMap::new(),
            accumulated: Cache::builder()
                .max_capacity(10_000)
                .time_to_live(keys::GENERATION_TTL)
                .build(),
            poll_timeout: Duration::from_secs(1),
        }
    }

    /// Shorten the broker poll timeout (tests).
    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    // -- Connection lifecycle ------------------------------------------------

    /// Register a new client connection.
    pub async fn connect(&self, connection_id: &str, tx: mpsc::UnboundedSender<String>) {
        self.connections.insert(connection_id.to_owned(), tx);

        let now = Utc::now().to_rfc3339();
        let key = keys::connection_key(connection_id);
        if let Err(err) = self
            .kv
            .hset(
                &key,
                &[
                    ("created_at", now.as_str()),
                    ("last_activity", now.as_str()),
                    ("active_chats", "[]"),
                ],
            )
            .await
        {
            warn!(connection_id, error = %err, "failed to store connection record");
        } else if let Err(err) = self.kv.expire(&key, keys::CONNECTION_TTL).await {
            warn!(connection_id, error = %err, "failed to set connection TTL");
        }

        info!(connection_id, "websocket client connected");
    }

    /// Remove a connection and every resource bound to it.
    pub async fn disconnect(&self, connection_id: &str) {
        self.connections.remove(connection_id);

        // Drop this connection's sinks from every subscriber set.
        let mut emptied = Vec::new();
        for mut entry in self.subscribers.iter_mut() {
            entry.value_mut().retain(|s| s.connection_id != connection_id);
            if entry.value().is_empty() {
                emptied.push(entry.key().clone());
            }
        }
        for response_id in emptied {
            self.subscribers.remove(&response_id);
            self.stop_listener(&response_id);
        }

        // Release the KV records for this connection and its chats.
        let key = keys::connection_key(connection_id);
        match self.kv.hget(&key, "active_chats").await {
            Ok(chats_json) => {
                let chats: Vec<String> = chats_json
                    .as_deref()
                    .and_then(|j| serde_json::from_str(j).ok())
                    .unwrap_or_default();
                for chat_id in chats {
                    let _ = self.kv.delete(&keys::chat_connection_key(&chat_id)).await;
                    let _ = self.kv.delete(&keys::generation_key(&chat_id)).await;
                    if let Some((_, token)) = self.generations.remove(&chat_id) {
                        token.cancel();
                    }
                }
            }
            Err(err) => warn!(connection_id, error = %err, "failed to read active chats"),
        }
        let _ = self.kv.delete(&key).await;

        info!(connection_id, "websocket client disconnected");
    }

    /// Bind a chat to a connection (1h TTL reverse mapping).
    pub async fn register_chat(&self, connection_id: &str, chat_id: &str) {
        let key = keys::connection_key(connection_id);

        let mut chats: Vec<String> = match self.kv.hget(&key, "active_chats").await {
            Ok(Some(json)) => serde_json::from_str(&json).unwrap_or_default(),
            _ => Vec::new(),
        };
        if !chats.iter().any(|c| c == chat_id) {
            chats.push(chat_id.to_owned());
        }

        let chats_json = serde_json::to_string(&chats).unwrap_or_else(|_| "[]".into());
        let now = Utc::now().to_rfc3339();
        if let Err(err) = self
            .kv
            .hset(
                &key,
                &[
                    ("active_chats", chats_json.as_str()),
                    ("last_activity", now.as_str()),
                ],
            )
            .await
        {
            warn!(connection_id, chat_id, error = %err, "failed to update active chats");
        }

        let mapping = keys::chat_connection_key(chat_id);
        if self.kv.set(&mapping, connection_id).await.is_ok() {
            let _ = self.kv.expire(&mapping, keys::CHAT_CONNECTION_TTL).await;
        }

        info!(connection_id, chat_id, "chat registered with connection");
    }

    /// Mark a generation active for a chat and hold its cancellation token.
    pub async fn track_generation(
        &self,
        chat_id: &str,
        message_id: &str,
        cancel: CancellationToken,
    ) {
        self.generations.insert(chat_id.to_owned(), cancel);

        let key = keys::generation_key(chat_id);
        let now = Utc::now().to_rfc3339();
        if let Err(err) = self
            .kv
            .hset(
                &key,
                &[("message_id", message_id), ("started_at", now.as_str())],
            )
            .await
        {
            warn!(chat_id, message_id, error = %err, "failed to track generation");
        } else {
            let _ = self.kv.expire(&key, keys::GENERATION_TTL).await;
        }
    }

    /// The message id of the chat's active generation, if one is tracked.
    pub async fn active_generation(&self, chat_id: &str) -> Option<String> {
        self.kv
            .hget(&keys::generation_key(chat_id), "message_id")
            .await
            .ok()
            .flatten()
    }

    /// Cancel and clear the active generation for a chat.
    pub async fn stop_generation(&self, chat_id: &str) {
        if let Some((_, token)) = self.generations.remove(chat_id) {
            token.cancel();
            info!(chat_id, "generation cancellation requested");
        }
        let _ = self.kv.delete(&keys::generation_key(chat_id)).await;
    }

    /// Refresh a connection's last-activity timestamp.
    pub async fn update_heartbeat(&self, connection_id: &str) {
        let now = Utc::now().to_rfc3339();
        if let Err(err) = self
            .kv
            .hset(
                &keys::connection_key(connection_id),
                &[("last_activity", now.as_str())],
            )
            .await
        {
            warn!(connection_id, error = %err, "failed to update heartbeat");
        }
    }

    // -- Accumulated content -------------------------------------------------

    /// Append (or replace) the accumulated text for an in-flight message.
    pub async fn track_content(&self, chat_id: &str, message_id: &str, content: &str, append: bool) {
        let key = format!("{chat_id}:{message_id}");
        let value = if append {
            match self.accumulated.get(&key).await {
                Some(existing) => format!("{existing}{content}"),
                None => content.to_owned(),
            }
        } else {
            content.to_owned()
        };
        self.accumulated.insert(key, value).await;
    }

    /// The text accumulated so far for a message, if any.
    pub async fn get_accumulated_content(&self, chat_id: &str, message_id: &str) -> Option<String> {
        self.accumulated.get(&format!("{chat_id}:{message_id}")).await
    }

    /// Drop the accumulated text for a message.
    pub async fn clear_accumulated_content(&self, chat_id: &str, message_id: &str) {
        self.accumulated
            .invalidate(&format!("{chat_id}:{message_id}"))
            .await;
    }

    // -- Subscriptions -------------------------------------------------------

    /// Subscribe a client sink to a response's events.
    ///
    /// The first subscriber opens the broker subscription and starts the
    /// listener task; every new subscriber immediately receives a
    /// `connection_established` frame.
    pub async fn subscribe_to_response(
        &self,
        response_id: &str,
        sink: ClientSink,
    ) -> GatewayResult<()> {
        let established =
            WsMessage::new(WsMessageType::ConnectionEstablished, json!({})).to_json();

        let first = {
            let mut entry = self
                .subscribers
                .entry(response_id.to_owned())
                .or_default();
            let first = entry.is_empty();
            entry.push(sink.clone());
            first
        };

        if first {
            let subscription = self.pubsub.subscribe(&response_channel(response_id)).await?;
            self.start_listener(response_id, subscription);
        }

        info!(
            response_id,
            connection_id = %sink.connection_id,
            subscribers = self.subscriber_count(response_id),
            "client subscribed to response"
        );

        sink.send(established);
        Ok(())
    }

    /// Remove one sink from a response's subscriber set.
    ///
    /// The last departure cancels the listener task and closes the broker
    /// subscription.
    pub async fn unsubscribe_from_response(&self, response_id: &str, sink_id: Uuid) {
        let now_empty = match self.subscribers.get_mut(response_id) {
            Some(mut entry) => {
                entry.retain(|s| s.sink_id != sink_id);
                entry.is_empty()
            }
            None => return,
        };

        if now_empty {
            self.subscribers.remove(response_id);
            self.stop_listener(response_id);
        }
    }

    /// Deliver an event to every subscriber of a response.
    ///
    /// Failing sinks are removed; peers are unaffected.
    pub async fn send_event_to_response_clients(&self, response_id: &str, event: &Event) {
        deliver(&self.subscribers, response_id, event);
    }

    /// Send a framed message to one connection and refresh its heartbeat.
    pub async fn send_message(
        &self,
        connection_id: &str,
        message_type: WsMessageType,
        data: Value,
    ) -> GatewayResult<()> {
        let frame = WsMessage::new(message_type, data).to_json();
        let sent = match self.connections.get(connection_id) {
            Some(tx) => tx.send(frame).is_ok(),
            None => {
                return Err(GatewayError::ConnectionNotFound {
                    connection_id: connection_id.to_owned(),
                });
            }
        };

        if !sent {
            return Err(GatewayError::SendFailed {
                connection_id: connection_id.to_owned(),
            });
        }

        self.update_heartbeat(connection_id).await;
        Ok(())
    }

    /// Number of subscribers bound to a response (tests, diagnostics).
    pub fn subscriber_count(&self, response_id: &str) -> usize {
        self.subscribers
            .get(response_id)
            .map(|entry| entry.len())
            .unwrap_or(0)
    }

    /// Number of live listener tasks (tests, diagnostics).
    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Number of registered connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    // -- Private helpers ----------------------------------------------------

    fn start_listener(&self, response_id: &str, subscription: Box<dyn Subscription>) {
        let token = CancellationToken::new();
        let handle = tokio::spawn(run_listener(
            response_id.to_owned(),
            subscription,
            Arc::clone(&self.subscribers),
            token.clone(),
            self.poll_timeout,
        ));
        self.listeners.insert(
            response_id.to_owned(),
            Listener {
                token,
                _handle: handle,
            },
        );
        debug!(response_id, "listener task started");
    }

    fn stop_listener(&self, response_id: &str) {
        if let Some((_, listener)) = self.listeners.remove(response_id) {
            listener.token.cancel();
            debug!(response_id, "listener task cancelled");
        }
    }
}

// ---------------------------------------------------------------------------
// Listener task
// ---------------------------------------------------------------------------

/// Pull frames off one response channel and fan them out to subscribers.
///
/// The short poll timeout keeps the task cancellation-responsive; decode
/// failures and broker hiccups are logged and the loop continues.
async fn run_listener(
    response_id: String,
    mut subscription: Box<dyn Subscription>,
    subscribers: Arc<DashMap<String, Vec<ClientSink>>>,
    token: CancellationToken,
    poll_timeout: Duration,
) {
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            result = subscription.get_message(poll_timeout) => match result {
                Ok(Some(frame)) => match deserialize_event(&frame) {
                    Ok(event) => deliver(&subscribers, &response_id, &event),
                    Err(err) => {
                        warn!(response_id = %response_id, error = %err, "undecodable broker frame")
                    }
                },
                Ok(None) => {}
                Err(err) => {
                    warn!(response_id = %response_id, error = %err, "broker poll failed");
                }
            },
        }
    }

    if let Err(err) = subscription.close().await {
        warn!(response_id = %response_id, error = %err, "failed to close broker subscription");
    }
    debug!(response_id = %response_id, "listener task exited");
}

/// Fan one event out to a response's subscribers, dropping failed sinks.
fn deliver(
    subscribers: &DashMap<String, Vec<ClientSink>>,
    response_id: &str,
    event: &Event,
) {
    let Some(mut entry) = subscribers.get_mut(response_id) else {
        return;
    };

    let frame = format_event_for_websocket(event);
    let before = entry.len();
    entry.retain(|sink| {
        let ok = sink.send(frame.clone());
        if !ok {
            warn!(
                response_id,
                connection_id = %sink.connection_id,
                "dropping failed subscriber"
            );
        }
        ok
    });

    debug!(
        response_id,
        event_type = event.event_type(),
        delivered = entry.len(),
        dropped = before - entry.len(),
        "event delivered to subscribers"
    );
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
