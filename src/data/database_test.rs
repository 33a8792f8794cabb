//! Database tests

use super::*;
use chrono::Utc;
use tempfile::TempDir;

/// Helper to create a test database
async fn create_test_db() -> (Database, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("test.db");
    let db = Database::connect(&db_path).await.unwrap();
    (db, temp_dir)
}

fn test_user(username: &str) -> User {
    User {
        id: EntityId::new().0,
        username: username.to_string(),
        avatar: None,
        role: "user".to_string(),
        is_online: false,
        last_seen: None,
        created_at: Utc::now(),
    }
}

fn private_conversation(a: &str, b: &str) -> Conversation {
    let now = Utc::now();
    let id = EntityId::new().0;
    Conversation {
        participants: [a, b]
            .iter()
            .enumerate()
            .map(|(position, user_id)| Participant {
                conversation_id: id.clone(),
                user_id: user_id.to_string(),
                position: position as i64,
                last_seen: now,
                unread_count: 0,
            })
            .collect(),
        id,
        conversation_type: ConversationType::Private,
        pair_key: Some(pair_key(a, b)),
        name: None,
        avatar: None,
        last_message_id: None,
        last_message_at: now,
        is_active: true,
        is_deleted: false,
        deleted_at: None,
        deleted_by: None,
        created_at: now,
        updated_at: now,
    }
}

fn text(conversation: &Conversation, sender: &str, content: &str) -> Message {
    Message::new(
        &conversation.id,
        sender,
        content.to_string(),
        MessageType::Text,
        vec![],
        None,
    )
}

/// Two seeded users and a live private conversation between them
async fn seeded(db: &Database) -> (User, User, Conversation) {
    let alice = test_user("alice");
    let bob = test_user("bob");
    db.upsert_user(&alice).await.unwrap();
    db.upsert_user(&bob).await.unwrap();

    let conversation = private_conversation(&alice.id, &bob.id);
    assert!(db.insert_conversation(&conversation, None).await.unwrap());
    (alice, bob, conversation)
}

fn unread_of(conversation: &Conversation, user_id: &str) -> i64 {
    conversation.participant(user_id).unwrap().unread_count
}

#[tokio::test]
async fn test_database_connection() {
    let (_db, _temp_dir) = create_test_db().await;
    // Connection successful if we get here without panicking
}

#[tokio::test]
async fn test_user_upsert_and_get() {
    let (db, _temp_dir) = create_test_db().await;

    let mut user = test_user("testuser");
    db.upsert_user(&user).await.unwrap();

    user.avatar = Some("https://cdn.example.com/a.png".to_string());
    db.upsert_user(&user).await.unwrap();

    let retrieved = db.get_user(&user.id).await.unwrap().unwrap();
    assert_eq!(retrieved.username, "testuser");
    assert_eq!(retrieved.avatar.as_deref(), Some("https://cdn.example.com/a.png"));

    let batch = db
        .get_users_by_ids(&[user.id.clone(), "missing".to_string()])
        .await
        .unwrap();
    assert_eq!(batch.len(), 1);
}

#[tokio::test]
async fn test_friendships_are_symmetric() {
    let (db, _temp_dir) = create_test_db().await;

    db.insert_friendship("a", "b").await.unwrap();
    assert!(db.are_friends("a", "b").await.unwrap());
    assert!(db.are_friends("b", "a").await.unwrap());
    assert!(!db.are_friends("a", "c").await.unwrap());
}

#[tokio::test]
async fn test_conversation_insert_and_find_by_pair() {
    let (db, _temp_dir) = create_test_db().await;
    let (alice, bob, conversation) = seeded(&db).await;

    let found = db
        .find_private_conversation(&bob.id, &alice.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found.id, conversation.id);
    assert_eq!(found.participant_ids(), vec![alice.id.clone(), bob.id.clone()]);
}

#[tokio::test]
async fn test_second_live_conversation_for_pair_is_rejected() {
    let (db, _temp_dir) = create_test_db().await;
    let (alice, bob, _conversation) = seeded(&db).await;

    let duplicate = private_conversation(&bob.id, &alice.id);
    assert!(!db.insert_conversation(&duplicate, None).await.unwrap());
    assert!(db.get_conversation(&duplicate.id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_deleted_conversation_frees_the_pair() {
    let (db, _temp_dir) = create_test_db().await;
    let (alice, bob, conversation) = seeded(&db).await;

    assert!(db.delete_conversation(&conversation.id, &alice.id).await.unwrap());
    assert!(db.get_conversation(&conversation.id).await.unwrap().is_none());

    let deleted = db
        .get_conversation_including_deleted(&conversation.id)
        .await
        .unwrap()
        .unwrap();
    assert!(deleted.is_deleted);
    assert!(!deleted.is_active);
    assert_eq!(deleted.deleted_by.as_deref(), Some(alice.id.as_str()));

    let fresh = private_conversation(&alice.id, &bob.id);
    assert!(db.insert_conversation(&fresh, None).await.unwrap());
}

#[tokio::test]
async fn test_insert_conversation_with_first_message() {
    let (db, _temp_dir) = create_test_db().await;
    let alice = test_user("alice");
    let bob = test_user("bob");
    db.upsert_user(&alice).await.unwrap();
    db.upsert_user(&bob).await.unwrap();

    let mut conversation = private_conversation(&alice.id, &bob.id);
    let first = text(&conversation, &alice.id, "hello");
    conversation.last_message_id = Some(first.id.clone());
    conversation.last_message_at = first.created_at;
    conversation.participants[1].unread_count = 1;

    assert!(db.insert_conversation(&conversation, Some(&first)).await.unwrap());

    let stored = db.get_conversation(&conversation.id).await.unwrap().unwrap();
    assert_eq!(stored.last_message_id.as_deref(), Some(first.id.as_str()));
    assert_eq!(unread_of(&stored, &bob.id), 1);
    assert_eq!(unread_of(&stored, &alice.id), 0);
    assert_eq!(db.list_messages(&conversation.id, 20, 0).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_append_message_increments_unread_and_reactivates() {
    let (db, _temp_dir) = create_test_db().await;
    let (alice, bob, conversation) = seeded(&db).await;

    let first = text(&conversation, &alice.id, "one");
    let outcome = db.append_message(&first).await.unwrap();
    assert!(!outcome.reactivated);
    assert_eq!(
        outcome.unread,
        vec![UnreadCount {
            user_id: bob.id.clone(),
            unread_count: 1
        }]
    );
    assert_eq!(outcome.participant_ids, vec![alice.id.clone(), bob.id.clone()]);

    assert!(db.archive_conversation(&conversation.id).await.unwrap());
    let second = text(&conversation, &alice.id, "two");
    let outcome = db.append_message(&second).await.unwrap();
    assert!(outcome.reactivated);
    assert_eq!(outcome.unread[0].unread_count, 2);

    let stored = db.get_conversation(&conversation.id).await.unwrap().unwrap();
    assert!(stored.is_active);
    assert_eq!(stored.last_message_id.as_deref(), Some(second.id.as_str()));
}

#[tokio::test]
async fn test_append_message_to_deleted_conversation_fails() {
    let (db, _temp_dir) = create_test_db().await;
    let (alice, _bob, conversation) = seeded(&db).await;

    db.delete_conversation(&conversation.id, &alice.id).await.unwrap();
    let message = text(&conversation, &alice.id, "late");
    let result = db.append_message(&message).await;
    assert!(matches!(result, Err(crate::error::AppError::NotFound)));
    assert!(db.get_message(&message.id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_concurrent_appends_count_every_message() {
    let (db, _temp_dir) = create_test_db().await;
    let (alice, bob, conversation) = seeded(&db).await;
    let db = std::sync::Arc::new(db);

    let mut handles = Vec::new();
    for i in 0..10 {
        let db = db.clone();
        let message = text(&conversation, &alice.id, &format!("m{i}"));
        handles.push(tokio::spawn(async move { db.append_message(&message).await }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let stored = db.get_conversation(&conversation.id).await.unwrap().unwrap();
    assert_eq!(unread_of(&stored, &bob.id), 10);
}

#[tokio::test]
async fn test_list_messages_pages_oldest_first() {
    let (db, _temp_dir) = create_test_db().await;
    let (alice, bob, conversation) = seeded(&db).await;

    for i in 0..5 {
        let sender = if i % 2 == 0 { &alice.id } else { &bob.id };
        db.append_message(&text(&conversation, sender, &format!("m{i}")))
            .await
            .unwrap();
    }

    let page1 = db.list_messages(&conversation.id, 2, 0).await.unwrap();
    let page3 = db.list_messages(&conversation.id, 2, 4).await.unwrap();
    assert_eq!(
        page1.iter().map(|m| m.content.as_str()).collect::<Vec<_>>(),
        vec!["m0", "m1"]
    );
    assert_eq!(page3.len(), 1);
    assert_eq!(page3[0].content, "m4");
}

#[tokio::test]
async fn test_attachments_are_stored_in_order() {
    let (db, _temp_dir) = create_test_db().await;
    let (alice, _bob, conversation) = seeded(&db).await;

    let attachments = vec![
        Attachment {
            attachment_type: AttachmentType::Image,
            url: "https://cdn.example.com/1.png".to_string(),
            filename: "1.png".to_string(),
            size: 10,
            mime_type: Some("image/png".to_string()),
        },
        Attachment {
            attachment_type: AttachmentType::File,
            url: "https://cdn.example.com/2.pdf".to_string(),
            filename: "2.pdf".to_string(),
            size: 20,
            mime_type: None,
        },
    ];
    let message = Message::new(
        &conversation.id,
        &alice.id,
        String::new(),
        MessageType::Image,
        attachments.clone(),
        None,
    );
    db.append_message(&message).await.unwrap();

    let stored = db.get_message(&message.id).await.unwrap().unwrap();
    assert_eq!(stored.message_type, MessageType::Image);
    assert_eq!(stored.attachments, attachments);
}

#[tokio::test]
async fn test_edit_message_keeps_history() {
    let (db, _temp_dir) = create_test_db().await;
    let (alice, _bob, conversation) = seeded(&db).await;

    let message = text(&conversation, &alice.id, "teh");
    db.append_message(&message).await.unwrap();
    db.edit_message(&message.id, "the", Utc::now(), chrono::Duration::minutes(15))
        .await
        .unwrap();

    let stored = db.get_message(&message.id).await.unwrap().unwrap();
    assert_eq!(stored.content, "the");
    assert!(stored.is_edited);
    assert!(stored.edited_at.is_some());
    assert_eq!(stored.edit_history.len(), 1);
    assert_eq!(stored.edit_history[0].content, "teh");
}

#[tokio::test]
async fn test_concurrent_edits_record_every_replaced_version() {
    let (db, _temp_dir) = create_test_db().await;
    let (alice, _bob, conversation) = seeded(&db).await;

    let message = text(&conversation, &alice.id, "v0");
    db.append_message(&message).await.unwrap();

    let window = chrono::Duration::minutes(15);
    let (first, second) = tokio::join!(
        db.edit_message(&message.id, "v1", Utc::now(), window),
        db.edit_message(&message.id, "v2", Utc::now(), window),
    );
    first.unwrap();
    second.unwrap();

    let stored = db.get_message(&message.id).await.unwrap().unwrap();
    let history: Vec<&str> = stored
        .edit_history
        .iter()
        .map(|edit| edit.content.as_str())
        .collect();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0], "v0");
    // The second recorded version is whichever edit committed first
    let expected_final = if history[1] == "v1" { "v2" } else { "v1" };
    assert!(history[1] == "v1" || history[1] == "v2");
    assert_eq!(stored.content, expected_final);
}

#[tokio::test]
async fn test_edit_outside_window_is_rejected_in_store() {
    let (db, _temp_dir) = create_test_db().await;
    let (alice, _bob, conversation) = seeded(&db).await;

    let message = text(&conversation, &alice.id, "original");
    db.append_message(&message).await.unwrap();

    let late = message.created_at + chrono::Duration::minutes(16);
    let result = db
        .edit_message(&message.id, "late", late, chrono::Duration::minutes(15))
        .await;
    assert!(matches!(result, Err(crate::error::AppError::InvalidState(_))));

    let stored = db.get_message(&message.id).await.unwrap().unwrap();
    assert_eq!(stored.content, "original");
    assert!(stored.edit_history.is_empty());
}

#[tokio::test]
async fn test_soft_delete_tombstones_and_repairs_last_message() {
    let (db, _temp_dir) = create_test_db().await;
    let (alice, bob, conversation) = seeded(&db).await;

    let first = text(&conversation, &alice.id, "first");
    let second = text(&conversation, &alice.id, "second");
    db.append_message(&first).await.unwrap();
    db.append_message(&second).await.unwrap();
    db.toggle_reaction(&second.id, &bob.id, "👍").await.unwrap();

    let outcome = db
        .soft_delete_message(&second.id, &alice.id, Utc::now())
        .await
        .unwrap();
    assert!(outcome.last_message_repaired);
    assert_eq!(outcome.unread[0].unread_count, 1);

    assert!(db.get_message(&second.id).await.unwrap().is_none());
    let tombstone = db
        .get_message_including_deleted(&second.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(tombstone.content, TOMBSTONE_CONTENT);
    assert!(tombstone.attachments.is_empty());
    assert_eq!(tombstone.reactions.len(), 1);

    let stored = db.get_conversation(&conversation.id).await.unwrap().unwrap();
    assert_eq!(stored.last_message_id.as_deref(), Some(first.id.as_str()));

    let again = db.soft_delete_message(&second.id, &alice.id, Utc::now()).await;
    assert!(matches!(again, Err(crate::error::AppError::NotFound)));
}

#[tokio::test]
async fn test_soft_delete_of_seen_message_keeps_unread() {
    let (db, _temp_dir) = create_test_db().await;
    let (alice, bob, conversation) = seeded(&db).await;

    let message = text(&conversation, &alice.id, "seen");
    db.append_message(&message).await.unwrap();
    db.reset_unread(&conversation.id, &bob.id, Utc::now())
        .await
        .unwrap();

    let outcome = db
        .soft_delete_message(&message.id, &alice.id, Utc::now())
        .await
        .unwrap();
    assert!(outcome.unread.is_empty());

    let stored = db.get_conversation(&conversation.id).await.unwrap().unwrap();
    assert_eq!(unread_of(&stored, &bob.id), 0);
    assert!(stored.last_message_id.is_none());
}

#[tokio::test]
async fn test_reaction_toggle_semantics() {
    let (db, _temp_dir) = create_test_db().await;
    let (alice, bob, conversation) = seeded(&db).await;

    let message = text(&conversation, &alice.id, "react to me");
    db.append_message(&message).await.unwrap();

    assert_eq!(
        db.toggle_reaction(&message.id, &bob.id, "👍").await.unwrap(),
        ReactionChange::Added
    );
    assert_eq!(
        db.toggle_reaction(&message.id, &bob.id, "❤️").await.unwrap(),
        ReactionChange::Replaced
    );

    let stored = db.get_message(&message.id).await.unwrap().unwrap();
    assert_eq!(stored.reactions.len(), 1);
    assert_eq!(stored.reactions[0].emoji, "❤️");

    assert_eq!(
        db.toggle_reaction(&message.id, &bob.id, "❤️").await.unwrap(),
        ReactionChange::Removed
    );
    let stored = db.get_message(&message.id).await.unwrap().unwrap();
    assert!(stored.reactions.is_empty());
}

#[tokio::test]
async fn test_read_receipts_are_idempotent() {
    let (db, _temp_dir) = create_test_db().await;
    let (alice, bob, conversation) = seeded(&db).await;

    let first = text(&conversation, &alice.id, "a");
    let second = text(&conversation, &alice.id, "b");
    db.append_message(&first).await.unwrap();
    db.append_message(&second).await.unwrap();

    let ids = vec![first.id.clone()];
    assert_eq!(
        db.mark_messages_read(&conversation.id, &bob.id, &ids, Utc::now())
            .await
            .unwrap(),
        1
    );
    assert_eq!(
        db.mark_messages_read(&conversation.id, &bob.id, &ids, Utc::now())
            .await
            .unwrap(),
        0
    );
    assert_eq!(
        db.mark_conversation_read(&conversation.id, &bob.id, Utc::now())
            .await
            .unwrap(),
        1
    );

    let stored = db.get_message(&second.id).await.unwrap().unwrap();
    assert!(stored.is_read_by(&bob.id));
    assert!(!stored.is_read_by(&alice.id));
}

#[tokio::test]
async fn test_list_conversations_and_unread_total() {
    let (db, _temp_dir) = create_test_db().await;
    let (alice, bob, conversation) = seeded(&db).await;
    let carol = test_user("carol");
    db.upsert_user(&carol).await.unwrap();
    let other = private_conversation(&carol.id, &bob.id);
    db.insert_conversation(&other, None).await.unwrap();

    db.append_message(&text(&conversation, &alice.id, "hi bob"))
        .await
        .unwrap();
    db.append_message(&text(&other, &carol.id, "hey bob"))
        .await
        .unwrap();
    db.append_message(&text(&other, &carol.id, "bob?"))
        .await
        .unwrap();

    let active = db
        .list_conversations_for_user(&bob.id, false, 20, 0)
        .await
        .unwrap();
    assert_eq!(active.len(), 2);
    assert_eq!(active[0].id, other.id);
    assert_eq!(db.total_unread_for_user(&bob.id).await.unwrap(), 3);

    db.archive_conversation(&other.id).await.unwrap();
    let archived = db
        .list_conversations_for_user(&bob.id, true, 20, 0)
        .await
        .unwrap();
    assert_eq!(archived.len(), 1);
    assert_eq!(db.total_unread_for_user(&bob.id).await.unwrap(), 1);

    assert!(db.restore_conversation(&other.id).await.unwrap());
    assert!(!db.restore_conversation(&other.id).await.unwrap());
}
