//! One authenticated real-time connection
//!
//! Owns the connection's room memberships and runs each client action
//! through the engine. The ack for an action is queued on the
//! connection's own outbound queue before any broadcast is published,
//! so the issuing client always sees its ack first.

use chrono::Utc;
use serde_json::json;
use std::collections::HashSet;
use tokio::sync::{mpsc, oneshot};

use super::ConnectionId;
use super::hub::Topic;
use super::notify::{LifecycleChange, Notification};
use super::protocol::{ClientAction, ClientFrame, ServerFrame};
use crate::AppState;
use crate::auth::Identity;
use crate::error::AppError;
use crate::metrics::WS_ACTIONS_TOTAL;
use crate::service::NewMessage;

pub struct Session {
    state: AppState,
    identity: Identity,
    connection: ConnectionId,
    outbound: mpsc::Sender<String>,
    joined: HashSet<String>,
}

impl Session {
    pub fn new(
        state: AppState,
        identity: Identity,
        connection: ConnectionId,
        outbound: mpsc::Sender<String>,
    ) -> Self {
        Self {
            state,
            identity,
            connection,
            outbound,
            joined: HashSet::new(),
        }
    }

    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    /// Register presence and subscribe to the personal channel
    ///
    /// # Returns
    /// Receiver that resolves if the hub evicts this connection
    pub async fn open(&self) -> oneshot::Receiver<()> {
        let evicted = self.state.hub.register(self.connection).await;
        self.state
            .hub
            .subscribe(
                Topic::User(self.identity.user_id.clone()),
                self.connection,
                self.outbound.clone(),
            )
            .await;
        self.state
            .presence
            .set_online(&self.identity.user_id, self.connection)
            .await;
        tracing::info!(
            user_id = %self.identity.user_id,
            connection = self.connection,
            "Real-time connection opened"
        );
        evicted
    }

    /// Leave every topic and drop presence; no conversation state changes
    ///
    /// When this was the user's last connection the disconnect time is
    /// recorded as their last seen.
    pub async fn close(&self) {
        self.state.hub.unsubscribe_all(self.connection).await;
        let went_offline = self
            .state
            .presence
            .remove_connection(&self.identity.user_id, self.connection)
            .await;
        if went_offline {
            if let Err(error) = self
                .state
                .db
                .record_last_seen(&self.identity.user_id, Utc::now())
                .await
            {
                tracing::warn!(%error, user_id = %self.identity.user_id, "Failed to record last seen");
            }
        }
        tracing::info!(
            user_id = %self.identity.user_id,
            connection = self.connection,
            "Real-time connection closed"
        );
    }

    async fn send_frame(&self, frame: &ServerFrame) {
        match frame.to_text() {
            Ok(text) => {
                if self.outbound.send(text).await.is_err() {
                    tracing::debug!(connection = self.connection, "Outbound queue closed");
                }
            }
            Err(error) => tracing::error!(%error, "Failed to serialize frame"),
        }
    }

    /// Handle one text frame from the client
    ///
    /// Never fails: malformed frames and rejected actions are answered
    /// with an error ack and the connection stays open.
    pub async fn handle_text(&mut self, text: &str) {
        let frame = match ClientFrame::parse(text) {
            Ok(frame) => frame,
            Err(rejected) => {
                tracing::debug!(error = %rejected.error, "Malformed client frame");
                WS_ACTIONS_TOTAL
                    .with_label_values(&["malformed", "error"])
                    .inc();
                self.send_frame(&ServerFrame::ack_err(
                    rejected.id,
                    rejected.temp_id,
                    &rejected.error,
                ))
                .await;
                return;
            }
        };

        let action_name = frame.action.name();
        let wants_ack = frame.action.wants_ack();
        let result = self.execute(frame.action, frame.temp_id.clone()).await;

        match result {
            Ok(notification) => {
                WS_ACTIONS_TOTAL
                    .with_label_values(&[action_name, "ok"])
                    .inc();
                if wants_ack {
                    self.send_frame(&ServerFrame::ack_ok(
                        frame.id,
                        frame.temp_id,
                        notification.data,
                    ))
                    .await;
                }
                self.state.notifier.dispatch(notification.envelopes).await;
            }
            Err(error) => {
                WS_ACTIONS_TOTAL
                    .with_label_values(&[action_name, "error"])
                    .inc();
                tracing::warn!(
                    user_id = %self.identity.user_id,
                    action = action_name,
                    kind = error.kind(),
                    "Real-time action failed"
                );
                if wants_ack {
                    self.send_frame(&ServerFrame::ack_err(frame.id, frame.temp_id, &error))
                        .await;
                }
            }
        }
    }

    async fn execute(
        &mut self,
        action: ClientAction,
        temp_id: Option<String>,
    ) -> Result<Notification, AppError> {
        let state = self.state.clone();
        let user_id = self.identity.user_id.clone();

        match action {
            ClientAction::JoinConversation(target) => {
                let conversation = state
                    .conversations
                    .get(&user_id, &target.conversation_id)
                    .await?;
                state
                    .hub
                    .subscribe(
                        Topic::Conversation(conversation.id.clone()),
                        self.connection,
                        self.outbound.clone(),
                    )
                    .await;
                self.joined.insert(conversation.id.clone());
                tracing::debug!(
                    user_id = %user_id,
                    conversation_id = %conversation.id,
                    "Joined conversation room"
                );

                let view = state.projector.conversation(conversation, &user_id).await?;
                Ok(Notification {
                    data: serde_json::to_value(&view).map_err(|e| AppError::Internal(e.into()))?,
                    envelopes: Vec::new(),
                })
            }
            ClientAction::LeaveConversation(target) => {
                state
                    .hub
                    .unsubscribe(
                        &Topic::Conversation(target.conversation_id.clone()),
                        self.connection,
                    )
                    .await;
                self.joined.remove(&target.conversation_id);
                Ok(Notification {
                    data: json!({ "conversationId": target.conversation_id }),
                    envelopes: Vec::new(),
                })
            }
            ClientAction::SendMessage(data) => {
                let outcome = state
                    .messages
                    .send(
                        &user_id,
                        NewMessage {
                            conversation_id: data.conversation_id,
                            content: data.content,
                            message_type: data.message_type,
                            attachments: data.attachments,
                            reply_to_id: data.reply_to,
                        },
                    )
                    .await?;
                state.notifier.message_sent(&outcome, temp_id).await
            }
            ClientAction::EditMessage(data) => {
                let message = state
                    .messages
                    .edit(&user_id, &data.message_id, &data.content)
                    .await?;
                state.notifier.message_edited(&message, temp_id).await
            }
            ClientAction::DeleteMessage(target) => {
                let deleted = state.messages.delete(&user_id, &target.message_id).await?;
                state.notifier.message_deleted(&deleted, temp_id).await
            }
            ClientAction::MarkRead(data) => {
                let outcome = state
                    .conversations
                    .mark_read(&user_id, &data.conversation_id, data.message_ids.as_deref())
                    .await?;
                state
                    .notifier
                    .conversation_read(&outcome, Some(self.connection), temp_id)
            }
            ClientAction::React(data) => {
                let outcome = state
                    .messages
                    .react(&user_id, &data.message_id, &data.emoji)
                    .await?;
                state
                    .notifier
                    .reaction_changed(&outcome, &user_id, temp_id)
                    .await
            }
            ClientAction::TypingStart(target) => self.typing(&target.conversation_id, true).await,
            ClientAction::TypingStop(target) => self.typing(&target.conversation_id, false).await,
            ClientAction::ArchiveConversation(target) => {
                let conversation = state
                    .conversations
                    .archive(&self.identity, &target.conversation_id)
                    .await?;
                state.notifier.lifecycle(
                    LifecycleChange::Archived,
                    &conversation,
                    &user_id,
                    temp_id,
                )
            }
            ClientAction::RestoreConversation(target) => {
                let conversation = state
                    .conversations
                    .restore(&self.identity, &target.conversation_id)
                    .await?;
                state.notifier.lifecycle(
                    LifecycleChange::Restored,
                    &conversation,
                    &user_id,
                    temp_id,
                )
            }
            ClientAction::DeleteConversation(target) => {
                let conversation = state
                    .conversations
                    .delete(&self.identity, &target.conversation_id)
                    .await?;
                // The room is gone for good
                state
                    .hub
                    .unsubscribe(&Topic::Conversation(conversation.id.clone()), self.connection)
                    .await;
                self.joined.remove(&conversation.id);
                state.notifier.lifecycle(
                    LifecycleChange::Deleted,
                    &conversation,
                    &user_id,
                    temp_id,
                )
            }
            ClientAction::Ping => Ok(Notification {
                data: json!({ "pong": true, "serverTime": Utc::now() }),
                envelopes: Vec::new(),
            }),
        }
    }

    /// Typing indicators; membership is checked against the store only
    /// for rooms this connection has not joined
    async fn typing(&self, conversation_id: &str, started: bool) -> Result<Notification, AppError> {
        if !self.joined.contains(conversation_id) {
            self.state
                .conversations
                .get(&self.identity.user_id, conversation_id)
                .await?;
        }
        self.state.notifier.typing(
            conversation_id,
            &self.identity.user_id,
            started,
            self.connection,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{TestApp, test_app};
    use serde_json::Value;

    async fn next_frame(rx: &mut mpsc::Receiver<String>) -> Value {
        let text = tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv())
            .await
            .expect("frame within timeout")
            .expect("queue open");
        serde_json::from_str(&text).unwrap()
    }

    async fn open_session(app: &TestApp, identity: &Identity) -> (Session, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(64);
        let connection = app.state.hub.next_connection_id();
        let session = Session::new(app.state.clone(), identity.clone(), connection, tx);
        let _ = session.open().await;
        (session, rx)
    }

    #[tokio::test]
    async fn malformed_frame_gets_error_ack_and_session_survives() {
        let app = test_app().await;
        let alice = app.user("alice").await;
        let (mut session, mut rx) = open_session(&app, &alice).await;

        session.handle_text("{not json").await;
        let ack = next_frame(&mut rx).await;
        assert_eq!(ack["type"], "ack");
        assert_eq!(ack["success"], false);
        assert_eq!(ack["error"]["kind"], "validation");

        session.handle_text(r#"{"id":"p","action":"ping"}"#).await;
        let ack = next_frame(&mut rx).await;
        assert_eq!(ack["id"], "p");
        assert_eq!(ack["success"], true);
    }

    #[tokio::test]
    async fn ack_precedes_room_broadcast_on_sender_connection() {
        let app = test_app().await;
        let alice = app.user("alice").await;
        let bob = app.user("bob").await;
        let conversation_id = app.conversation(&alice, &bob).await;

        let (mut alice_session, mut alice_rx) = open_session(&app, &alice).await;
        let (mut bob_session, mut bob_rx) = open_session(&app, &bob).await;
        for (session, rx) in [
            (&mut alice_session, &mut alice_rx),
            (&mut bob_session, &mut bob_rx),
        ] {
            session
                .handle_text(&format!(
                    r#"{{"id":"j","action":"conversation:join","data":{{"conversationId":"{conversation_id}"}}}}"#
                ))
                .await;
            assert_eq!(next_frame(rx).await["success"], true);
        }

        alice_session
            .handle_text(&format!(
                r#"{{"id":"s1","action":"message:send","tempId":"tmp-1","data":{{"conversationId":"{conversation_id}","content":"hello"}}}}"#
            ))
            .await;

        let ack = next_frame(&mut alice_rx).await;
        assert_eq!(ack["type"], "ack");
        assert_eq!(ack["id"], "s1");
        assert_eq!(ack["tempId"], "tmp-1");
        assert_eq!(ack["data"]["content"], "hello");

        let echo = next_frame(&mut alice_rx).await;
        assert_eq!(echo["event"], "message:new");
        assert_eq!(echo["tempId"], "tmp-1");

        let mut bob_events = Vec::new();
        for _ in 0..2 {
            bob_events.push(next_frame(&mut bob_rx).await);
        }
        assert!(bob_events.iter().any(|e| e["event"] == "message:new"));
        let unread = bob_events
            .iter()
            .find(|e| e["event"] == "conversation:unread")
            .unwrap();
        assert_eq!(unread["data"]["unreadCount"], 1);
    }

    #[tokio::test]
    async fn typing_skips_the_typing_connection() {
        let app = test_app().await;
        let alice = app.user("alice").await;
        let bob = app.user("bob").await;
        let conversation_id = app.conversation(&alice, &bob).await;

        let (mut alice_session, mut alice_rx) = open_session(&app, &alice).await;
        let (mut bob_session, mut bob_rx) = open_session(&app, &bob).await;
        let join = format!(
            r#"{{"action":"conversation:join","data":{{"conversationId":"{conversation_id}"}}}}"#
        );
        alice_session.handle_text(&join).await;
        bob_session.handle_text(&join).await;
        next_frame(&mut alice_rx).await;
        next_frame(&mut bob_rx).await;

        alice_session
            .handle_text(&format!(
                r#"{{"action":"typing:start","data":{{"conversationId":"{conversation_id}"}}}}"#
            ))
            .await;

        let typing = next_frame(&mut bob_rx).await;
        assert_eq!(typing["event"], "typing:start");
        assert_eq!(typing["data"]["userId"], alice.user_id.as_str());
        assert!(alice_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn outsider_cannot_join_or_send() {
        let app = test_app().await;
        let alice = app.user("alice").await;
        let bob = app.user("bob").await;
        let mallory = app.user("mallory").await;
        let conversation_id = app.conversation(&alice, &bob).await;

        let (mut session, mut rx) = open_session(&app, &mallory).await;
        session
            .handle_text(&format!(
                r#"{{"id":"1","action":"conversation:join","data":{{"conversationId":"{conversation_id}"}}}}"#
            ))
            .await;
        let ack = next_frame(&mut rx).await;
        assert_eq!(ack["success"], false);
        assert_eq!(ack["error"]["kind"], "forbidden");
        assert!(
            !app.state
                .hub
                .is_subscribed(&Topic::Conversation(conversation_id.clone()), session.connection())
                .await
        );

        session
            .handle_text(&format!(
                r#"{{"id":"2","action":"message:send","data":{{"conversationId":"{conversation_id}","content":"spam"}}}}"#
            ))
            .await;
        assert_eq!(next_frame(&mut rx).await["error"]["kind"], "forbidden");
    }

    #[tokio::test]
    async fn mark_read_syncs_reader_and_notifies_sender() {
        let app = test_app().await;
        let alice = app.user("alice").await;
        let bob = app.user("bob").await;
        let conversation_id = app.conversation(&alice, &bob).await;

        let (_alice_session, mut alice_rx) = open_session(&app, &alice).await;
        let (mut phone, mut phone_rx) = open_session(&app, &bob).await;
        let (_laptop, mut laptop_rx) = open_session(&app, &bob).await;

        phone
            .handle_text(&format!(
                r#"{{"id":"r","action":"message:read","data":{{"conversationId":"{conversation_id}"}}}}"#
            ))
            .await;

        let ack = next_frame(&mut phone_rx).await;
        assert_eq!(ack["type"], "ack");
        assert_eq!(ack["data"]["unreadCount"], 0);
        assert!(phone_rx.try_recv().is_err());

        let echo = next_frame(&mut laptop_rx).await;
        assert_eq!(echo["event"], "conversation:read");

        let receipt = next_frame(&mut alice_rx).await;
        assert_eq!(receipt["event"], "message:read");
        assert_eq!(receipt["data"]["readBy"], bob.user_id.as_str());
        assert_eq!(receipt["data"]["conversationId"], conversation_id.as_str());
        assert!(receipt["data"]["messageIds"].is_null());
    }

    #[tokio::test]
    async fn session_that_falls_behind_is_evicted() {
        let app = test_app().await;
        let alice = app.user("alice").await;
        let bob = app.user("bob").await;
        let conversation_id = app.conversation(&alice, &bob).await;

        let (tx, mut rx) = mpsc::channel(1);
        let connection = app.state.hub.next_connection_id();
        let mut session = Session::new(app.state.clone(), bob.clone(), connection, tx);
        let mut evicted = session.open().await;
        session
            .handle_text(&format!(
                r#"{{"action":"conversation:join","data":{{"conversationId":"{conversation_id}"}}}}"#
            ))
            .await;
        next_frame(&mut rx).await;

        let personal = Topic::User(bob.user_id.clone());
        for payload in ["one", "two"] {
            app.state
                .hub
                .publish(crate::realtime::Envelope::new(personal.clone(), payload.to_string()))
                .await;
        }

        assert!(evicted.try_recv().is_ok());
        assert!(!app.state.hub.is_subscribed(&personal, connection).await);
        assert!(
            !app.state
                .hub
                .is_subscribed(&Topic::Conversation(conversation_id), connection)
                .await
        );
    }

    #[tokio::test]
    async fn close_clears_presence_and_subscriptions() {
        let app = test_app().await;
        let alice = app.user("alice").await;
        let (session, _rx) = open_session(&app, &alice).await;
        assert!(app.state.presence.is_online(&alice.user_id).await);

        session.close().await;
        assert!(!app.state.presence.is_online(&alice.user_id).await);
        let stored = app.state.db.get_user(&alice.user_id).await.unwrap().unwrap();
        assert!(stored.last_seen.is_some());
        assert!(
            !app.state
                .hub
                .is_subscribed(&Topic::User(alice.user_id.clone()), session.connection())
                .await
        );
    }
}
