//! Key formats and TTLs for every record the pipeline stores.
//!
//! The message table uses the single-table `(PK, SK)` layout with three
//! secondary indexes; the session manager's ephemeral records use
//! Redis-style prefixed string keys with TTLs.  Keeping every format string
//! here means no other module ever builds a key by hand.

use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};

// ---------------------------------------------------------------------------
// Entity types
// ---------------------------------------------------------------------------

pub const ENTITY_MESSAGE: &str = "MESSAGE";
pub const ENTITY_CHAT: &str = "CHAT";

/// Sort key for a chat's metadata item.
pub const CHAT_METADATA_SK: &str = "METADATA";

// ---------------------------------------------------------------------------
// Primary table keys
// ---------------------------------------------------------------------------

/// Partition key for all messages of a chat: `MESSAGE#{chat_id}`.
pub fn message_pk(chat_id: &str) -> String {
    format!("{ENTITY_MESSAGE}#{chat_id}")
}

/// Sort key for one message: `MESSAGE#{message_id}`.
pub fn message_sk(message_id: &str) -> String {
    format!("{ENTITY_MESSAGE}#{message_id}")
}

/// Prefix matching every message sort key in a chat partition.
pub const MESSAGE_SK_PREFIX: &str = "MESSAGE#";

/// Partition key for a chat's own items: `CHAT#{chat_id}`.
pub fn chat_pk(chat_id: &str) -> String {
    format!("{ENTITY_CHAT}#{chat_id}")
}

// ---------------------------------------------------------------------------
// Index keys
// ---------------------------------------------------------------------------

/// `UserDataIndex` partition key: `USER#{user_id}`.
pub fn user_pk(user_id: &str) -> String {
    format!("USER#{user_id}")
}

/// `UserDataIndex` sort key: `{EntityType}#{timestamp}#{id}`.
pub fn user_sk(entity_type: &str, timestamp: DateTime<Utc>, id: &str) -> String {
    format!("{entity_type}#{}#{id}", format_ts(timestamp))
}

/// `GlobalResourceIndex` partition key: `RESOURCE_TYPE#{EntityType}`.
pub fn global_pk(entity_type: &str) -> String {
    format!("RESOURCE_TYPE#{entity_type}")
}

/// `GlobalResourceIndex` sort key: `CREATED_AT#{timestamp}#{id}`.
pub fn global_sk(timestamp: DateTime<Utc>, id: &str) -> String {
    format!("CREATED_AT#{}#{id}", format_ts(timestamp))
}

/// `MessageHierarchyIndex` partition key: `PARENT#{parent_id}`.
pub fn parent_pk(parent_id: &str) -> String {
    format!("PARENT#{parent_id}")
}

/// `MessageHierarchyIndex` sort key — creation-ordered within a parent.
pub fn parent_sk(timestamp: DateTime<Utc>, id: &str) -> String {
    format!("CREATED_AT#{}#{id}", format_ts(timestamp))
}

/// Timestamps inside keys are ISO-8601 UTC so lexical order is time order.
pub fn format_ts(timestamp: DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
}

// ---------------------------------------------------------------------------
// Session-manager KV keys
// ---------------------------------------------------------------------------

/// Connection record: `ws:conn:{connection_id}` (hash fields).
pub fn connection_key(connection_id: &str) -> String {
    format!("ws:conn:{connection_id}")
}

/// Chat-to-connection mapping: `ws:chat:{chat_id}:connection`.
pub fn chat_connection_key(chat_id: &str) -> String {
    format!("ws:chat:{chat_id}:connection")
}

/// Active generation marker: `ws:gen:{chat_id}`.
pub fn generation_key(chat_id: &str) -> String {
    format!("ws:gen:{chat_id}")
}

/// Stale connection records expire after 24 hours.
pub const CONNECTION_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Chat-to-connection mappings expire after 1 hour.
pub const CHAT_CONNECTION_TTL: Duration = Duration::from_secs(60 * 60);

/// Active-generation markers expire after 1 hour.
pub const GENERATION_TTL: Duration = Duration::from_secs(60 * 60);

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
