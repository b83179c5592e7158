//! The abstract pub/sub interface.
//!
//! Modeled on the operation set the session manager actually consumes:
//! subscribe to a named channel, poll for the next frame with a short
//! timeout (so listener tasks stay cancellation-responsive), and close.
//! Implementations may be in-process ([`crate::MemoryBroker`]) or backed by
//! an external broker; the pipeline only ever sees these traits.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::BrokerResult;

/// A named-channel publish/subscribe broker.
#[async_trait]
pub trait PubSub: Send + Sync {
    /// Publish a payload to a channel.
    ///
    /// Returns the number of subscribers that will observe the frame.
    /// Publishing to a channel nobody listens on is not an error; the frame
    /// is dropped (at-most-once delivery).
    async fn publish(&self, channel: &str, payload: String) -> BrokerResult<usize>;

    /// Open a subscription to a channel.
    ///
    /// Frames published *before* this call are not replayed.
    async fn subscribe(&self, channel: &str) -> BrokerResult<Box<dyn Subscription>>;
}

/// A live subscription to one channel.
#[async_trait]
pub trait Subscription: Send {
    /// Wait up to `timeout` for the next frame.
    ///
    /// Returns `Ok(None)` when the timeout elapses without a frame — the
    /// caller is expected to loop, checking for cancellation between polls.
    async fn get_message(&mut self, timeout: Duration) -> BrokerResult<Option<String>>;

    /// Unsubscribe and release the channel resources.
    async fn close(&mut self) -> BrokerResult<()>;
}
