//! Publish-side bridge from the event processor to the broker.
//!
//! [`EventPublisher`] owns the serialization of events and the
//! `response:{response_id}` channel naming.  Publish failures are reported
//! to the caller but the caller's local state is already updated by the time
//! publish runs, so durability is never at the broker's mercy.

use std::sync::Arc;
use std::time::Instant;

use chatstream_events::{Event, serialize_event};

use crate::error::BrokerResult;
use crate::pubsub::PubSub;

/// The broker channel carrying all events for one response.
pub fn response_channel(response_id: &str) -> String {
    format!("response:{response_id}")
}

/// Serializes emittable events and publishes them on per-response channels.
#[derive(Clone)]
pub struct EventPublisher {
    pubsub: Arc<dyn PubSub>,
}

impl EventPublisher {
    pub fn new(pubsub: Arc<dyn PubSub>) -> Self {
        Self { pubsub }
    }

    /// Publish one event on its response channel.
    ///
    /// Events with `emit == false` and events lacking a `response_id` are
    /// skipped (the latter with a warning — they should have been dropped
    /// upstream).  Returns the number of subscribers that observed the
    /// frame.
    pub async fn publish_event(&self, event: &Event) -> BrokerResult<usize> {
        if !event.emit {
            tracing::trace!(
                response_id = %event.response_id,
                event_type = event.event_type(),
                "skipping publish, emit=false"
            );
            return Ok(0);
        }

        if event.response_id.is_empty() {
            tracing::warn!(
                event_type = event.event_type(),
                "event missing response_id, cannot publish"
            );
            return Ok(0);
        }

        let channel = response_channel(&event.response_id);
        let payload = serialize_event(event)?;

        let started = Instant::now();
        let receivers = self.pubsub.publish(&channel, payload).await?;

        tracing::debug!(
            channel = %channel,
            event_type = event.event_type(),
            sequence = event.sequence,
            receivers,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "event published"
        );

        Ok(receivers)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
