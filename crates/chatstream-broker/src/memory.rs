//! In-process broker backed by [`tokio::sync::broadcast`].
//!
//! One broadcast channel per named topic, created lazily on first subscribe
//! and garbage-collected when the last subscription closes.  A subscriber
//! that falls more than the channel capacity behind loses the overwritten
//! frames — consistent with the at-most-once contract.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::error::BrokerResult;
use crate::pubsub::{PubSub, Subscription};

/// Per-channel buffer depth before slow subscribers start losing frames.
const CHANNEL_CAPACITY: usize = 1024;

/// In-memory [`PubSub`] implementation.
///
/// Cheaply cloneable; all clones share the same channel table.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    channels: Arc<DashMap<String, broadcast::Sender<String>>>,
}

impl MemoryBroker {
    /// Create an empty broker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of currently open channels (diagnostics).
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    fn drop_if_orphaned(&self, channel: &str) {
        // Remove the channel once no receivers remain.  `remove_if` holds the
        // shard lock, so a concurrent subscribe either sees the entry before
        // removal or creates a fresh one after.
        self.channels
            .remove_if(channel, |_, sender| sender.receiver_count() == 0);
    }
}

#[async_trait]
impl PubSub for MemoryBroker {
    async fn publish(&self, channel: &str, payload: String) -> BrokerResult<usize> {
        let Some(sender) = self.channels.get(channel).map(|s| s.clone()) else {
            tracing::trace!(channel, "publish to channel with no subscribers, dropping");
            return Ok(0);
        };

        match sender.send(payload) {
            Ok(receivers) => {
                tracing::trace!(channel, receivers, "frame published");
                Ok(receivers)
            }
            Err(_) => {
                // All receivers vanished between lookup and send.
                tracing::trace!(channel, "all subscribers gone, frame dropped");
                Ok(0)
            }
        }
    }

    async fn subscribe(&self, channel: &str) -> BrokerResult<Box<dyn Subscription>> {
        let sender = self
            .channels
            .entry(channel.to_owned())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone();

        tracing::debug!(channel, "subscription opened");

        Ok(Box::new(MemorySubscription {
            broker: self.clone(),
            channel: channel.to_owned(),
            receiver: Some(sender.subscribe()),
        }))
    }
}

struct MemorySubscription {
    broker: MemoryBroker,
    channel: String,
    receiver: Option<broadcast::Receiver<String>>,
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn get_message(&mut self, timeout: Duration) -> BrokerResult<Option<String>> {
        let Some(receiver) = self.receiver.as_mut() else {
            return Ok(None);
        };

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match tokio::time::timeout_at(deadline, receiver.recv()).await {
                Ok(Ok(payload)) => return Ok(Some(payload)),
                Ok(Err(broadcast::error::RecvError::Lagged(missed))) => {
                    // Frames were overwritten while we were slow; skip them
                    // and keep reading.  At-most-once permits the loss.
                    tracing::warn!(
                        channel = %self.channel,
                        missed,
                        "subscriber lagged, frames dropped"
                    );
                }
                Ok(Err(broadcast::error::RecvError::Closed)) => return Ok(None),
                Err(_) => return Ok(None),
            }
        }
    }

    async fn close(&mut self) -> BrokerResult<()> {
        if self.receiver.take().is_some() {
            tracing::debug!(channel = %self.channel, "subscription closed");
            self.broker.drop_if_orphaned(&self.channel);
        }
        Ok(())
    }
}

impl Drop for MemorySubscription {
    fn drop(&mut self) {
        if self.receiver.take().is_some() {
            self.broker.drop_if_orphaned(&self.channel);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_and_receive() {
        let broker = MemoryBroker::new();
        let mut sub = broker.subscribe("response:r1").await.unwrap();

        let receivers = broker
            .publish("response:r1", "hello".into())
            .await
            .unwrap();
        assert_eq!(receivers, 1);

        let frame = sub.get_message(Duration::from_millis(100)).await.unwrap();
        assert_eq!(frame.as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn timeout_returns_none() {
        let broker = MemoryBroker::new();
        let mut sub = broker.subscribe("response:r2").await.unwrap();

        let frame = sub.get_message(Duration::from_millis(20)).await.unwrap();
        assert!(frame.is_none());
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_dropped() {
        let broker = MemoryBroker::new();
        let receivers = broker.publish("response:r3", "lost".into()).await.unwrap();
        assert_eq!(receivers, 0);

        // Subscribing afterwards does not replay.
        let mut sub = broker.subscribe("response:r3").await.unwrap();
        let frame = sub.get_message(Duration::from_millis(20)).await.unwrap();
        assert!(frame.is_none());
    }

    #[tokio::test]
    async fn multiple_subscribers_all_receive() {
        let broker = MemoryBroker::new();
        let mut a = broker.subscribe("response:r4").await.unwrap();
        let mut b = broker.subscribe("response:r4").await.unwrap();

        broker.publish("response:r4", "frame".into()).await.unwrap();

        assert_eq!(
            a.get_message(Duration::from_millis(100))
                .await
                .unwrap()
                .as_deref(),
            Some("frame")
        );
        assert_eq!(
            b.get_message(Duration::from_millis(100))
                .await
                .unwrap()
                .as_deref(),
            Some("frame")
        );
    }

    #[tokio::test]
    async fn channel_is_garbage_collected_on_last_close() {
        let broker = MemoryBroker::new();
        let mut a = broker.subscribe("response:r5").await.unwrap();
        let mut b = broker.subscribe("response:r5").await.unwrap();
        assert_eq!(broker.channel_count(), 1);

        a.close().await.unwrap();
        assert_eq!(broker.channel_count(), 1);

        b.close().await.unwrap();
        assert_eq!(broker.channel_count(), 0);
    }

    #[tokio::test]
    async fn dropped_subscription_also_collects() {
        let broker = MemoryBroker::new();
        {
            let _sub = broker.subscribe("response:r6").await.unwrap();
            assert_eq!(broker.channel_count(), 1);
        }
        assert_eq!(broker.channel_count(), 0);
    }

    #[tokio::test]
    async fn ordering_is_preserved_per_channel() {
        let broker = MemoryBroker::new();
        let mut sub = broker.subscribe("response:r7").await.unwrap();

        for i in 0..10 {
            broker
                .publish("response:r7", format!("frame-{i}"))
                .await
                .unwrap();
        }

        for i in 0..10 {
            let frame = sub.get_message(Duration::from_millis(100)).await.unwrap();
            assert_eq!(frame.as_deref(), Some(format!("frame-{i}").as_str()));
        }
    }

    #[tokio::test]
    async fn get_message_after_close_returns_none() {
        let broker = MemoryBroker::new();
        let mut sub = broker.subscribe("response:r8").await.unwrap();
        sub.close().await.unwrap();

        let frame = sub.get_message(Duration::from_millis(10)).await.unwrap();
        assert!(frame.is_none());
    }
}
