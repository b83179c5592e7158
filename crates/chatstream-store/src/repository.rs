//! Message repository over the single-table store.
//!
//! Messages are stored as their discriminated-union JSON under
//! `(MESSAGE#{chat_id}, MESSAGE#{message_id})` with the global and
//! hierarchy index keys populated on every write.  Reads tolerate legacy
//! payloads: unknown part kinds degrade to text parts instead of failing
//! the whole message.

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, instrument};

use chatstream_events::{Message, MessagePart, MessageStatus};

use crate::db::Database;
use crate::error::{StoreError, StoreResult};
use crate::keys;
use crate::retry::{RetryConfig, with_retry};

/// CRUD operations on stored conversation messages.
#[derive(Clone)]
pub struct MessageRepository {
    db: Database,
    retry: RetryConfig,
}

impl MessageRepository {
    /// Create a repository with the default retry policy.
    pub fn new(db: Database) -> Self {
        Self {
            db,
            retry: RetryConfig::default(),
        }
    }

    /// Override the retry policy (tests use tighter delays).
    pub fn with_retry_config(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Create the initial (typically `pending`) record for a message.
    #[instrument(skip(self, message), fields(message_id = %message.message_id))]
    pub async fn create_message(&self, message: &Message) -> StoreResult<()> {
        self.upsert(message, "create_message").await?;
        debug!(
            chat_id = %message.chat_id,
            message_id = %message.message_id,
            "message created"
        );
        Ok(())
    }

    /// Write the full current state of a message, replacing any prior item.
    #[instrument(skip(self, message), fields(message_id = %message.message_id))]
    pub async fn save_message(&self, message: &Message) -> StoreResult<()> {
        self.upsert(message, "save_message").await?;
        debug!(
            chat_id = %message.chat_id,
            message_id = %message.message_id,
            parts = message.parts.len(),
            status = ?message.status,
            "message saved"
        );
        Ok(())
    }

    /// Fetch a single message, or `None` if absent.
    #[instrument(skip(self))]
    pub async fn get_message(
        &self,
        chat_id: &str,
        message_id: &str,
    ) -> StoreResult<Option<Message>> {
        let pk = keys::message_pk(chat_id);
        let sk = keys::message_sk(message_id);
        let db = self.db.clone();

        let payload: Option<String> = with_retry(&self.retry, "get_message", move || {
            let db = db.clone();
            let pk = pk.clone();
            let sk = sk.clone();
            async move {
                db.execute(move |conn| {
                    let result = conn.query_row(
                        "SELECT payload FROM items WHERE pk = ?1 AND sk = ?2",
                        rusqlite::params![pk, sk],
                        |row| row.get::<_, String>(0),
                    );
                    match result {
                        Ok(p) => Ok(Some(p)),
                        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                        Err(e) => Err(StoreError::Sqlite(e)),
                    }
                })
                .await
            }
        })
        .await?;

        payload.map(|p| decode_message(&p)).transpose()
    }

    /// List a chat's messages in creation order.
    #[instrument(skip(self))]
    pub async fn get_chat_messages(
        &self,
        chat_id: &str,
        limit: Option<u32>,
    ) -> StoreResult<Vec<Message>> {
        let pk = keys::message_pk(chat_id);
        let db = self.db.clone();

        let payloads: Vec<String> = with_retry(&self.retry, "get_chat_messages", move || {
            let db = db.clone();
            let pk = pk.clone();
            async move {
                db.execute(move |conn| {
                    let mut stmt = conn.prepare(
                        "SELECT payload FROM items \
                         WHERE pk = ?1 AND sk LIKE ?2 || '%' \
                         ORDER BY created_at ASC, sk ASC \
                         LIMIT ?3",
                    )?;
                    let rows = stmt
                        .query_map(
                            rusqlite::params![pk, keys::MESSAGE_SK_PREFIX, limit.unwrap_or(u32::MAX)],
                            |row| row.get::<_, String>(0),
                        )?
                        .collect::<Result<Vec<_>, _>>()?;
                    Ok(rows)
                })
                .await
            }
        })
        .await?;

        payloads.iter().map(|p| decode_message(p)).collect()
    }

    /// List the messages whose `parent_id` is the given message, via the
    /// hierarchy index.
    #[instrument(skip(self))]
    pub async fn get_messages_by_parent(&self, parent_id: &str) -> StoreResult<Vec<Message>> {
        let ppk = keys::parent_pk(parent_id);
        let db = self.db.clone();

        let payloads: Vec<String> = with_retry(&self.retry, "get_messages_by_parent", move || {
            let db = db.clone();
            let ppk = ppk.clone();
            async move {
                db.execute(move |conn| {
                    let mut stmt = conn.prepare(
                        "SELECT payload FROM items \
                         WHERE parent_pk = ?1 \
                         ORDER BY parent_sk ASC",
                    )?;
                    let rows = stmt
                        .query_map(rusqlite::params![ppk], |row| row.get::<_, String>(0))?
                        .collect::<Result<Vec<_>, _>>()?;
                    Ok(rows)
                })
                .await
            }
        })
        .await?;

        payloads.iter().map(|p| decode_message(p)).collect()
    }

    /// Update just the status of a stored message.
    #[instrument(skip(self))]
    pub async fn update_message_status(
        &self,
        chat_id: &str,
        message_id: &str,
        status: MessageStatus,
    ) -> StoreResult<()> {
        let mut message =
            self.get_message(chat_id, message_id)
                .await?
                .ok_or_else(|| StoreError::NotFound {
                    entity: "message",
                    id: message_id.to_owned(),
                })?;
        message.status = status;
        self.save_message(&message).await
    }

    // -- Private helpers ----------------------------------------------------

    async fn upsert(&self, message: &Message, operation: &'static str) -> StoreResult<()> {
        if message.message_id.is_empty() || message.chat_id.is_empty() {
            return Err(StoreError::InvalidArgument(
                "message requires both message_id and chat_id".into(),
            ));
        }

        let pk = keys::message_pk(&message.chat_id);
        let sk = keys::message_sk(&message.message_id);
        let created_at = keys::format_ts(message.timestamp);
        let global_pk = keys::global_pk(keys::ENTITY_MESSAGE);
        let global_sk = keys::global_sk(message.timestamp, &message.message_id);

        // The user index is only populated when the message is attributable.
        let user_keys = message
            .metadata
            .get("user_id")
            .and_then(Value::as_str)
            .map(|user_id| {
                (
                    keys::user_pk(user_id),
                    keys::user_sk(keys::ENTITY_MESSAGE, message.timestamp, &message.message_id),
                )
            });

        let parent_keys = message.parent_id.as_deref().map(|parent| {
            (
                keys::parent_pk(parent),
                keys::parent_sk(message.timestamp, &message.message_id),
            )
        });

        let payload = serde_json::to_string(message)?;
        let db = self.db.clone();

        with_retry(&self.retry, operation, move || {
            let db = db.clone();
            let pk = pk.clone();
            let sk = sk.clone();
            let created_at = created_at.clone();
            let global_pk = global_pk.clone();
            let global_sk = global_sk.clone();
            let user_keys = user_keys.clone();
            let parent_keys = parent_keys.clone();
            let payload = payload.clone();
            async move {
                db.execute(move |conn| {
                    let (user_pk, user_sk) = user_keys.unzip();
                    let (parent_pk, parent_sk) = parent_keys.unzip();
                    conn.execute(
                        "INSERT OR REPLACE INTO items \
                         (pk, sk, user_pk, user_sk, global_pk, global_sk, \
                          parent_pk, parent_sk, payload, created_at) \
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                        rusqlite::params![
                            pk, sk, user_pk, user_sk, global_pk, global_sk, parent_pk,
                            parent_sk, payload, created_at
                        ],
                    )?;
                    Ok(())
                })
                .await
            }
        })
        .await
    }
}

/// Decode a stored payload, rebuilding parts with legacy tolerance.
fn decode_message(payload: &str) -> StoreResult<Message> {
    let mut value: Value = serde_json::from_str(payload)?;

    if let Some(parts) = value.get_mut("parts").and_then(Value::as_array_mut) {
        let rebuilt: Vec<MessagePart> = parts
            .drain(..)
            .map(MessagePart::from_stored_value)
            .collect();
        value["parts"] = serde_json::to_value(&rebuilt)?;
    }

    Ok(serde_json::from_value(value)?)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use chatstream_events::part::TextPart;

    use super::*;

    fn repo() -> MessageRepository {
        MessageRepository::new(Database::open_in_memory().unwrap())
    }

    #[tokio::test]
    async fn create_and_get_round_trip() {
        let repo = repo();
        let mut msg = Message::response_placeholder("r1", "c1", Some("q1".into()), "model-a");
        msg.parts.push(MessagePart::Text(TextPart::new("Hello")));
        repo.create_message(&msg).await.unwrap();

        let fetched = repo.get_message("c1", "r1").await.unwrap().unwrap();
        assert_eq!(fetched.message_id, "r1");
        assert_eq!(fetched.parent_id.as_deref(), Some("q1"));
        assert_eq!(fetched.parts.len(), 1);
        assert_eq!(fetched.status, MessageStatus::Pending);
    }

    #[tokio::test]
    async fn get_missing_returns_none() {
        let repo = repo();
        assert!(repo.get_message("c1", "nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn save_replaces_prior_state() {
        let repo = repo();
        let mut msg = Message::response_placeholder("r2", "c1", None, "model-a");
        repo.create_message(&msg).await.unwrap();

        msg.status = MessageStatus::Complete;
        msg.parts.push(MessagePart::Text(TextPart::new("done")));
        repo.save_message(&msg).await.unwrap();

        let fetched = repo.get_message("c1", "r2").await.unwrap().unwrap();
        assert_eq!(fetched.status, MessageStatus::Complete);
        assert_eq!(fetched.parts.len(), 1);

        // Still exactly one stored item for the message.
        let all = repo.get_chat_messages("c1", None).await.unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn chat_messages_come_back_in_creation_order() {
        let repo = repo();
        for (i, id) in ["m1", "m2", "m3"].iter().enumerate() {
            let mut msg = Message::request(*id, "c2", None, vec![]);
            msg.timestamp = Utc::now() + chrono::Duration::milliseconds(i as i64 * 10);
            repo.create_message(&msg).await.unwrap();
        }

        let all = repo.get_chat_messages("c2", None).await.unwrap();
        let ids: Vec<&str> = all.iter().map(|m| m.message_id.as_str()).collect();
        assert_eq!(ids, vec!["m1", "m2", "m3"]);

        let limited = repo.get_chat_messages("c2", Some(2)).await.unwrap();
        assert_eq!(limited.len(), 2);
    }

    #[tokio::test]
    async fn hierarchy_index_finds_children() {
        let repo = repo();
        let request = Message::request("q1", "c3", None, vec![]);
        repo.create_message(&request).await.unwrap();

        let response = Message::response_placeholder("r1", "c3", Some("q1".into()), "m");
        repo.create_message(&response).await.unwrap();

        let children = repo.get_messages_by_parent("q1").await.unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].message_id, "r1");
    }

    #[tokio::test]
    async fn update_status() {
        let repo = repo();
        let msg = Message::response_placeholder("r3", "c4", None, "m");
        repo.create_message(&msg).await.unwrap();

        repo.update_message_status("c4", "r3", MessageStatus::Complete)
            .await
            .unwrap();

        let fetched = repo.get_message("c4", "r3").await.unwrap().unwrap();
        assert_eq!(fetched.status, MessageStatus::Complete);
    }

    #[tokio::test]
    async fn update_status_of_missing_message_fails() {
        let repo = repo();
        let result = repo
            .update_message_status("c4", "ghost", MessageStatus::Complete)
            .await;
        assert!(matches!(result, Err(StoreError::NotFound { .. })));
    }

    #[tokio::test]
    async fn legacy_part_kind_degrades_to_text() {
        let repo = repo();
        // Store a payload with an unknown part kind directly.
        let msg = Message::request("q9", "c5", None, vec![]);
        repo.create_message(&msg).await.unwrap();

        let fetched = repo.get_message("c5", "q9").await.unwrap().unwrap();
        let mut value = serde_json::to_value(&fetched).unwrap();
        value["parts"] = serde_json::json!([
            {"part_kind": "hologram", "content": "old data"}
        ]);

        // Overwrite the stored payload out-of-band.
        let payload = value.to_string();
        let db = Database::open_in_memory().unwrap();
        let repo2 = MessageRepository::new(db.clone());
        db.execute(move |conn| {
            conn.execute(
                "INSERT INTO items (pk, sk, payload, created_at) VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params!["MESSAGE#c5", "MESSAGE#q9", payload, "t"],
            )?;
            Ok(())
        })
        .await
        .unwrap();

        let legacy = repo2.get_message("c5", "q9").await.unwrap().unwrap();
        assert_eq!(legacy.parts.len(), 1);
        match &legacy.parts[0] {
            MessagePart::Text(p) => {
                assert_eq!(p.content, "old data");
                assert!(p.metadata.contains_key("part_error"));
            }
            other => panic!("expected Text fallback, got {other:?}"),
        }
    }
}
