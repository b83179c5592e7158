//! Integration tests: on-disk store round trips and key-layout guarantees.

use chatstream_events::part::TextPart;
use chatstream_events::{Message, MessagePart, MessageStatus};
use chatstream_store::{Database, MessageRepository};

#[tokio::test]
async fn on_disk_store_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("messages.db");

    {
        let db = Database::open(&path).unwrap();
        let repo = MessageRepository::new(db);

        let mut msg = Message::response_placeholder("r1", "c1", Some("q1".into()), "model-a");
        msg.parts.push(MessagePart::Text(TextPart::new("persisted")));
        msg.status = MessageStatus::Complete;
        repo.save_message(&msg).await.unwrap();
    }

    // Reopen the same file: the message must still be there.
    let db = Database::open(&path).unwrap();
    let repo = MessageRepository::new(db);
    let fetched = repo.get_message("c1", "r1").await.unwrap().unwrap();
    assert_eq!(fetched.status, MessageStatus::Complete);
    assert_eq!(fetched.parts.len(), 1);
    match &fetched.parts[0] {
        MessagePart::Text(p) => assert_eq!(p.content, "persisted"),
        other => panic!("expected Text, got {other:?}"),
    }
}

#[tokio::test]
async fn request_and_response_share_a_chat_partition() {
    let db = Database::open_in_memory().unwrap();
    let repo = MessageRepository::new(db);

    let request = Message::request("q1", "c1", None, vec![]);
    repo.create_message(&request).await.unwrap();

    let mut response = Message::response_placeholder("r1", "c1", Some("q1".into()), "model-a");
    response.status = MessageStatus::Complete;
    repo.save_message(&response).await.unwrap();

    let all = repo.get_chat_messages("c1", None).await.unwrap();
    assert_eq!(all.len(), 2);

    // The response hangs off the request in the hierarchy index.
    let children = repo.get_messages_by_parent("q1").await.unwrap();
    assert_eq!(children.len(), 1);
    assert_eq!(children[0].message_id, "r1");

    // The root request hangs off the chat.
    let roots = repo.get_messages_by_parent("c1").await.unwrap();
    assert_eq!(roots.len(), 1);
    assert_eq!(roots[0].message_id, "q1");
}
