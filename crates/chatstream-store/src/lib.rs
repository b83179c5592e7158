//! Durable storage for chatstream.
//!
//! Two storage surfaces live here:
//!
//! - The **single-table message store**: a SQLite-backed table with the
//!   `(PK, SK)` primary key and the user / global / hierarchy index columns,
//!   accessed through [`MessageRepository`] with retry around transient
//!   failures.
//! - The **ephemeral key-value store** ([`KeyValueStore`]): the TTL'd
//!   records the WebSocket session manager keeps per connection, chat
//!   binding, and active generation.
//!
//! All key formats and TTLs are centralized in [`keys`].

pub mod db;
pub mod error;
pub mod keys;
pub mod kv;
pub mod repository;
pub mod retry;

pub use db::Database;
pub use error::{StoreError, StoreResult};
pub use kv::{KeyValueStore, MemoryKvStore};
pub use repository::MessageRepository;
pub use retry::RetryConfig;
