//! E2E tests for the conversation and message REST endpoints

mod common;

use common::TestServer;
use serde_json::{Value, json};

async fn body(response: reqwest::Response) -> Value {
    response.json().await.unwrap()
}

#[tokio::test]
async fn test_requires_authentication() {
    let server = TestServer::new().await;

    let response = server
        .client
        .get(server.url("/api/conversations"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);

    let json = body(response).await;
    assert_eq!(json["success"], false);
    assert_eq!(json["error"]["kind"], "unauthorized");
}

#[tokio::test]
async fn test_create_conversation_is_idempotent() {
    let server = TestServer::new().await;
    let alice = server.create_user("alice").await;
    let bob = server.create_user("bob").await;

    let first = server
        .client
        .post(server.url("/api/conversations"))
        .bearer_auth(&alice.token)
        .json(&json!({ "participantId": bob.id }))
        .send()
        .await
        .unwrap();
    assert_eq!(first.status(), 201);
    let first = body(first).await;
    assert_eq!(first["data"]["type"], "private");
    assert_eq!(first["data"]["participants"].as_array().unwrap().len(), 2);

    // Either side asking again gets the same conversation back
    let second = server
        .client
        .post(server.url("/api/conversations"))
        .bearer_auth(&bob.token)
        .json(&json!({ "participantId": alice.id }))
        .send()
        .await
        .unwrap();
    assert_eq!(second.status(), 200);
    let second = body(second).await;
    assert_eq!(second["data"]["id"], first["data"]["id"]);
}

#[tokio::test]
async fn test_create_conversation_with_first_message() {
    let server = TestServer::new().await;
    let alice = server.create_user("alice").await;
    let bob = server.create_user("bob").await;

    let response = server
        .client
        .post(server.url("/api/conversations"))
        .bearer_auth(&alice.token)
        .json(&json!({ "participantId": bob.id, "firstMessage": "Hi Bob" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 201);
    let created = body(response).await;
    assert_eq!(created["data"]["lastMessage"]["content"], "Hi Bob");
    assert_eq!(created["data"]["unreadCount"], 0);

    let total = body(
        server
            .client
            .get(server.url("/api/conversations/unread-total"))
            .bearer_auth(&bob.token)
            .send()
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(total["data"]["unreadTotal"], 1);
}

#[tokio::test]
async fn test_create_conversation_rejections() {
    let server = TestServer::new().await;
    let alice = server.create_user("alice").await;

    let response = server
        .client
        .post(server.url("/api/conversations"))
        .bearer_auth(&alice.token)
        .json(&json!({ "participantId": alice.id }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 409);

    let response = server
        .client
        .post(server.url("/api/conversations"))
        .bearer_auth(&alice.token)
        .json(&json!({ "participantId": "01UNKNOWNUSER" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn test_friends_only_policy() {
    let server = TestServer::with_messaging(forumchat::config::MessagingConfig {
        require_friendship: true,
        ..Default::default()
    })
    .await;
    let alice = server.create_user("alice").await;
    let bob = server.create_user("bob").await;

    let response = server
        .client
        .post(server.url("/api/conversations"))
        .bearer_auth(&alice.token)
        .json(&json!({ "participantId": bob.id }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 403);

    server
        .state
        .db
        .insert_friendship(&alice.id, &bob.id)
        .await
        .unwrap();
    let response = server
        .client
        .post(server.url("/api/conversations"))
        .bearer_auth(&alice.token)
        .json(&json!({ "participantId": bob.id }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 201);
}

#[tokio::test]
async fn test_send_and_page_messages() {
    let server = TestServer::new().await;
    let alice = server.create_user("alice").await;
    let bob = server.create_user("bob").await;
    let conversation_id = server.create_conversation(&alice, &bob).await;

    for n in 1..=3 {
        server
            .send_message(&alice, &conversation_id, &format!("message {n}"))
            .await;
    }

    let list = body(
        server
            .client
            .get(server.url("/api/conversations"))
            .bearer_auth(&bob.token)
            .send()
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(list["data"][0]["unreadCount"], 3);
    assert_eq!(list["data"][0]["lastMessage"]["content"], "message 3");

    let page = body(
        server
            .client
            .get(server.url(&format!(
                "/api/conversations/{conversation_id}/messages?page=1&limit=2"
            )))
            .bearer_auth(&bob.token)
            .send()
            .await
            .unwrap(),
    )
    .await;
    let messages = page["data"]["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0]["content"], "message 1");
    assert_eq!(messages[1]["content"], "message 2");
    assert_eq!(page["data"]["hasMore"], true);

    // Reading resets the reader's counter
    let total = body(
        server
            .client
            .get(server.url("/api/conversations/unread-total"))
            .bearer_auth(&bob.token)
            .send()
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(total["data"]["unreadTotal"], 0);
}

#[tokio::test]
async fn test_send_validation() {
    let server = TestServer::new().await;
    let alice = server.create_user("alice").await;
    let bob = server.create_user("bob").await;
    let conversation_id = server.create_conversation(&alice, &bob).await;

    let response = server
        .client
        .post(server.url("/api/messages"))
        .bearer_auth(&alice.token)
        .json(&json!({ "conversationId": conversation_id, "content": "   " }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    assert_eq!(body(response).await["error"]["kind"], "validation");

    let response = server
        .client
        .post(server.url("/api/messages"))
        .bearer_auth(&alice.token)
        .json(&json!({ "conversationId": "01MISSING", "content": "hello" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn test_malformed_requests_are_validation_errors() {
    let server = TestServer::new().await;
    let alice = server.create_user("alice").await;
    let bob = server.create_user("bob").await;
    let conversation_id = server.create_conversation(&alice, &bob).await;

    // Missing field
    let response = server
        .client
        .post(server.url("/api/messages"))
        .bearer_auth(&alice.token)
        .json(&json!({ "conversationId": conversation_id }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    let json = body(response).await;
    assert_eq!(json["success"], false);
    assert_eq!(json["error"]["kind"], "validation");

    // Not JSON at all
    let response = server
        .client
        .post(server.url("/api/conversations"))
        .bearer_auth(&alice.token)
        .header("content-type", "application/json")
        .body("{ nope")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    assert_eq!(body(response).await["error"]["kind"], "validation");

    // Query of the wrong type
    let response = server
        .client
        .get(server.url(&format!(
            "/api/conversations/{conversation_id}/messages?limit=lots"
        )))
        .bearer_auth(&alice.token)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    assert_eq!(body(response).await["error"]["kind"], "validation");
}

#[tokio::test]
async fn test_non_participant_is_forbidden() {
    let server = TestServer::new().await;
    let alice = server.create_user("alice").await;
    let bob = server.create_user("bob").await;
    let mallory = server.create_user("mallory").await;
    let conversation_id = server.create_conversation(&alice, &bob).await;

    let response = server
        .client
        .get(server.url(&format!("/api/conversations/{conversation_id}")))
        .bearer_auth(&mallory.token)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 403);

    let response = server
        .client
        .post(server.url("/api/messages"))
        .bearer_auth(&mallory.token)
        .json(&json!({ "conversationId": conversation_id, "content": "let me in" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 403);
}

#[tokio::test]
async fn test_edit_delete_and_react() {
    let server = TestServer::new().await;
    let alice = server.create_user("alice").await;
    let bob = server.create_user("bob").await;
    let conversation_id = server.create_conversation(&alice, &bob).await;
    let message = server.send_message(&alice, &conversation_id, "helo").await;
    let message_id = message["id"].as_str().unwrap();

    // Only the sender edits
    let response = server
        .client
        .put(server.url(&format!("/api/messages/{message_id}")))
        .bearer_auth(&bob.token)
        .json(&json!({ "content": "hijacked" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 403);

    let edited = body(
        server
            .client
            .put(server.url(&format!("/api/messages/{message_id}")))
            .bearer_auth(&alice.token)
            .json(&json!({ "content": "hello" }))
            .send()
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(edited["data"]["content"], "hello");
    assert_eq!(edited["data"]["isEdited"], true);
    assert_eq!(edited["data"]["editHistory"][0]["content"], "helo");

    let reacted = body(
        server
            .client
            .post(server.url(&format!("/api/messages/{message_id}/reactions")))
            .bearer_auth(&bob.token)
            .json(&json!({ "emoji": "👍" }))
            .send()
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(reacted["data"]["change"], "added");
    assert_eq!(reacted["data"]["message"]["reactions"][0]["emoji"], "👍");

    let deleted = body(
        server
            .client
            .delete(server.url(&format!("/api/messages/{message_id}")))
            .bearer_auth(&alice.token)
            .send()
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(deleted["data"]["isDeleted"], true);
    assert_eq!(deleted["data"]["content"], forumchat::data::TOMBSTONE_CONTENT);

    // A deleted message stays deleted
    let response = server
        .client
        .delete(server.url(&format!("/api/messages/{message_id}")))
        .bearer_auth(&alice.token)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn test_archive_restore_delete_lifecycle() {
    let server = TestServer::new().await;
    let alice = server.create_user("alice").await;
    let bob = server.create_user("bob").await;
    let conversation_id = server.create_conversation(&alice, &bob).await;

    let response = server
        .client
        .post(server.url(&format!("/api/conversations/{conversation_id}/restore")))
        .bearer_auth(&alice.token)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    let archived = body(
        server
            .client
            .post(server.url(&format!("/api/conversations/{conversation_id}/archive")))
            .bearer_auth(&alice.token)
            .send()
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(archived["data"]["isActive"], false);

    let list = body(
        server
            .client
            .get(server.url("/api/conversations?archived=true"))
            .bearer_auth(&alice.token)
            .send()
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(list["data"].as_array().unwrap().len(), 1);

    let restored = body(
        server
            .client
            .post(server.url(&format!("/api/conversations/{conversation_id}/restore")))
            .bearer_auth(&bob.token)
            .send()
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(restored["data"]["isActive"], true);

    let response = server
        .client
        .delete(server.url(&format!("/api/conversations/{conversation_id}")))
        .bearer_auth(&alice.token)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let response = server
        .client
        .get(server.url(&format!("/api/conversations/{conversation_id}")))
        .bearer_auth(&alice.token)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);

    // The pair may start over once the old conversation is gone
    let response = server
        .client
        .post(server.url("/api/conversations"))
        .bearer_auth(&alice.token)
        .json(&json!({ "participantId": bob.id }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 201);
    assert_ne!(body(response).await["data"]["id"], conversation_id.as_str());
}

#[tokio::test]
async fn test_mark_read_with_and_without_ids() {
    let server = TestServer::new().await;
    let alice = server.create_user("alice").await;
    let bob = server.create_user("bob").await;
    let conversation_id = server.create_conversation(&alice, &bob).await;
    let first = server.send_message(&alice, &conversation_id, "one").await;
    server.send_message(&alice, &conversation_id, "two").await;

    let marked = body(
        server
            .client
            .post(server.url(&format!("/api/conversations/{conversation_id}/read")))
            .bearer_auth(&bob.token)
            .json(&json!({ "messageIds": [first["id"]] }))
            .send()
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(marked["data"]["markedCount"], 1);
    assert_eq!(marked["data"]["unreadCount"], 0);

    let marked = body(
        server
            .client
            .post(server.url(&format!("/api/conversations/{conversation_id}/read")))
            .bearer_auth(&bob.token)
            .send()
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(marked["data"]["markedCount"], 1);
}

#[tokio::test]
async fn test_presence_endpoint() {
    let server = TestServer::new().await;
    let alice = server.create_user("alice").await;
    let bob = server.create_user("bob").await;

    let url = server.url(&format!("/api/users/{}/presence", bob.id));
    let offline = body(
        server
            .client
            .get(&url)
            .bearer_auth(&alice.token)
            .send()
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(offline["data"]["isOnline"], false);

    let socket = server.connect(&bob).await;
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    let online = body(
        server
            .client
            .get(&url)
            .bearer_auth(&alice.token)
            .send()
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(online["data"]["isOnline"], true);

    drop(socket);
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;

    let gone = body(
        server
            .client
            .get(&url)
            .bearer_auth(&alice.token)
            .send()
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(gone["data"]["isOnline"], false);
    assert!(gone["data"]["lastSeen"].is_string());
}
