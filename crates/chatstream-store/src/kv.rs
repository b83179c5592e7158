//! Ephemeral key-value store for session state.
//!
//! The WebSocket session manager keeps small TTL'd records per connection
//! (`ws:conn:*` hashes), per chat binding (`ws:chat:*` strings), and per
//! active generation (`ws:gen:*` hashes).  The [`KeyValueStore`] trait is
//! the operation set those records need; [`MemoryKvStore`] is the
//! in-process implementation with per-entry expiry and lazy purging.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::error::{StoreError, StoreResult};

/// TTL-aware string/hash store.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Set a string value.
    async fn set(&self, key: &str, value: &str) -> StoreResult<()>;

    /// Get a string value.
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Delete a key of any type.  Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> StoreResult<()>;

    /// Set fields on a hash, creating it if needed.
    async fn hset(&self, key: &str, fields: &[(&str, &str)]) -> StoreResult<()>;

    /// Get one field of a hash.
    async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>>;

    /// Set (or refresh) a key's time-to-live.
    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<()>;
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum KvValue {
    Str(String),
    Hash(HashMap<String, String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: KvValue,
    expires_at: Option<DateTime<Utc>>,
}

impl Entry {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// In-process [`KeyValueStore`] with lazy expiry.
///
/// Expired entries are purged on access; no background sweeper is needed for
/// the small per-connection record volume this store holds.
#[derive(Clone, Default)]
pub struct MemoryKvStore {
    entries: Arc<DashMap<String, Entry>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live (non-expired) entries — diagnostics and tests.
    pub fn len(&self) -> usize {
        let now = Utc::now();
        self.entries
            .iter()
            .filter(|e| !e.value().is_expired(now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Return the live entry for `key`, purging it if expired.
    fn live_entry(&self, key: &str) -> Option<Entry> {
        let now = Utc::now();
        {
            let entry = self.entries.get(key)?;
            if !entry.is_expired(now) {
                return Some(entry.clone());
            }
        }
        self.entries.remove_if(key, |_, e| e.is_expired(now));
        None
    }
}

#[async_trait]
impl KeyValueStore for MemoryKvStore {
    async fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        self.entries.insert(
            key.to_owned(),
            Entry {
                value: KvValue::Str(value.to_owned()),
                expires_at: None,
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        match self.live_entry(key) {
            Some(Entry {
                value: KvValue::Str(s),
                ..
            }) => Ok(Some(s)),
            Some(_) => Err(StoreError::InvalidArgument(format!(
                "key `{key}` holds a hash, not a string"
            ))),
            None => Ok(None),
        }
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.entries.remove(key);
        Ok(())
    }

    async fn hset(&self, key: &str, fields: &[(&str, &str)]) -> StoreResult<()> {
        let now = Utc::now();
        let mut entry = self
            .entries
            .entry(key.to_owned())
            .or_insert_with(|| Entry {
                value: KvValue::Hash(HashMap::new()),
                expires_at: None,
            });

        // A freshly expired entry is replaced rather than extended.
        if entry.is_expired(now) {
            *entry = Entry {
                value: KvValue::Hash(HashMap::new()),
                expires_at: None,
            };
        }

        match &mut entry.value {
            KvValue::Hash(map) => {
                for (field, value) in fields {
                    map.insert((*field).to_owned(), (*value).to_owned());
                }
                Ok(())
            }
            KvValue::Str(_) => Err(StoreError::InvalidArgument(format!(
                "key `{key}` holds a string, not a hash"
            ))),
        }
    }

    async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>> {
        match self.live_entry(key) {
            Some(Entry {
                value: KvValue::Hash(map),
                ..
            }) => Ok(map.get(field).cloned()),
            Some(_) => Err(StoreError::InvalidArgument(format!(
                "key `{key}` holds a string, not a hash"
            ))),
            None => Ok(None),
        }
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<()> {
        if let Some(mut entry) = self.entries.get_mut(key) {
            entry.expires_at =
                Some(Utc::now() + chrono::Duration::from_std(ttl).unwrap_or_default());
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
