//! HTTP facade
//!
//! REST endpoints mirroring the real-time actions, plus
//! Prometheus metrics.

mod conversations;
mod dto;
mod messages;
pub mod metrics;
mod presence;

pub use dto::*;
pub use metrics::metrics_router;

use axum::{
    Router,
    routing::{get, post, put},
};

use crate::AppState;

/// Create the messaging API router
///
/// Every handler requires an authenticated caller through `CurrentUser`.
pub fn messaging_router() -> Router<AppState> {
    Router::new()
        .route(
            "/conversations",
            post(conversations::create_conversation).get(conversations::list_conversations),
        )
        .route(
            "/conversations/unread-total",
            get(conversations::unread_total),
        )
        .route(
            "/conversations/:id",
            get(conversations::get_conversation).delete(conversations::delete_conversation),
        )
        .route(
            "/conversations/:id/messages",
            get(conversations::get_messages),
        )
        .route("/conversations/:id/read", post(conversations::mark_read))
        .route(
            "/conversations/:id/archive",
            post(conversations::archive_conversation),
        )
        .route(
            "/conversations/:id/restore",
            post(conversations::restore_conversation),
        )
        .route("/messages", post(messages::send_message))
        .route(
            "/messages/:id",
            put(messages::edit_message).delete(messages::delete_message),
        )
        .route(
            "/messages/:id/reactions",
            post(messages::react_to_message),
        )
        .route("/users/:id/presence", get(presence::get_presence))
}
