//! Cross-process fan-out for chatstream.
//!
//! The single producer of a response's events (the worker running the event
//! processor) and its many WebSocket consumers are decoupled by a pub/sub
//! broker.  This crate defines the abstract [`PubSub`] / [`Subscription`]
//! interface the rest of the pipeline programs against, an in-process
//! [`MemoryBroker`] implementation backed by `tokio::sync::broadcast`, and
//! the [`EventPublisher`] that owns serialization and per-response channel
//! naming.
//!
//! Delivery is at-most-once and best-effort ordered per channel: one
//! response travels one channel with one publisher, and subscribers must
//! tolerate losing in-flight frames on reconnect.

pub mod error;
pub mod memory;
pub mod publisher;
pub mod pubsub;

pub use error::{BrokerError, BrokerResult};
pub use memory::MemoryBroker;
pub use publisher::{EventPublisher, response_channel};
pub use pubsub::{PubSub, Subscription};
