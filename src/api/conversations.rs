//! Conversation endpoints

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use axum_extra::extract::WithRejection;

use super::dto::{
    ApiResponse, CreateConversationRequest, ListConversationsParams, MarkReadRequest,
    MessagePageResponse, PageParams, UnreadTotalResponse,
};
use crate::realtime::LifecycleChange;
use crate::{AppState, auth::CurrentUser, error::AppError};

/// POST /api/conversations
///
/// 201 with the new conversation, or 200 with the existing one for the pair.
pub async fn create_conversation(
    State(state): State<AppState>,
    CurrentUser(identity): CurrentUser,
    WithRejection(Json(req), _): WithRejection<Json<CreateConversationRequest>, AppError>,
) -> Result<Response, AppError> {
    let outcome = state
        .conversations
        .create(&identity, &req.participant_id, req.first_message.as_deref())
        .await?;
    let notification = state
        .notifier
        .conversation_created(&outcome, &identity.user_id)
        .await?;
    state.notifier.dispatch(notification.envelopes).await;

    let status = if outcome.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, ApiResponse::ok(notification.data)).into_response())
}

/// GET /api/conversations
pub async fn list_conversations(
    State(state): State<AppState>,
    CurrentUser(identity): CurrentUser,
    WithRejection(Query(params), _): WithRejection<Query<ListConversationsParams>, AppError>,
) -> Result<impl IntoResponse, AppError> {
    let conversations = state
        .conversations
        .list(&identity.user_id, params.archived, params.page, params.limit)
        .await?;
    let views = state
        .projector
        .conversations(conversations, &identity.user_id)
        .await?;

    Ok(ApiResponse::ok(views))
}

/// GET /api/conversations/unread-total
pub async fn unread_total(
    State(state): State<AppState>,
    CurrentUser(identity): CurrentUser,
) -> Result<impl IntoResponse, AppError> {
    let unread_total = state.conversations.unread_total(&identity.user_id).await?;
    Ok(ApiResponse::ok(UnreadTotalResponse { unread_total }))
}

/// GET /api/conversations/:id
pub async fn get_conversation(
    State(state): State<AppState>,
    CurrentUser(identity): CurrentUser,
    WithRejection(Path(id), _): WithRejection<Path<String>, AppError>,
) -> Result<impl IntoResponse, AppError> {
    let conversation = state.conversations.get(&identity.user_id, &id).await?;
    let view = state
        .projector
        .conversation(conversation, &identity.user_id)
        .await?;
    Ok(ApiResponse::ok(view))
}

/// GET /api/conversations/:id/messages
///
/// Oldest first; marks the page read and resets the caller's unread count.
pub async fn get_messages(
    State(state): State<AppState>,
    CurrentUser(identity): CurrentUser,
    WithRejection(Path(id), _): WithRejection<Path<String>, AppError>,
    WithRejection(Query(params), _): WithRejection<Query<PageParams>, AppError>,
) -> Result<impl IntoResponse, AppError> {
    let page = state
        .messages
        .list(&identity.user_id, &id, params.page, params.limit)
        .await?;
    let messages = state
        .projector
        .messages(page.messages, &identity.user_id)
        .await?;

    Ok(ApiResponse::ok(MessagePageResponse {
        messages,
        page: page.page,
        limit: page.limit,
        has_more: page.has_more,
    }))
}

/// POST /api/conversations/:id/read
pub async fn mark_read(
    State(state): State<AppState>,
    CurrentUser(identity): CurrentUser,
    WithRejection(Path(id), _): WithRejection<Path<String>, AppError>,
    body: Option<Json<MarkReadRequest>>,
) -> Result<impl IntoResponse, AppError> {
    let req = body.map(|Json(req)| req).unwrap_or_default();
    let outcome = state
        .conversations
        .mark_read(&identity.user_id, &id, req.message_ids.as_deref())
        .await?;
    let notification = state.notifier.conversation_read(&outcome, None, None)?;
    state.notifier.dispatch(notification.envelopes).await;

    Ok(ApiResponse::ok(notification.data))
}

/// POST /api/conversations/:id/archive
pub async fn archive_conversation(
    State(state): State<AppState>,
    CurrentUser(identity): CurrentUser,
    WithRejection(Path(id), _): WithRejection<Path<String>, AppError>,
) -> Result<impl IntoResponse, AppError> {
    let conversation = state.conversations.archive(&identity, &id).await?;
    let notification = state.notifier.lifecycle(
        LifecycleChange::Archived,
        &conversation,
        &identity.user_id,
        None,
    )?;
    state.notifier.dispatch(notification.envelopes).await;

    Ok(ApiResponse::ok(notification.data))
}

/// POST /api/conversations/:id/restore
pub async fn restore_conversation(
    State(state): State<AppState>,
    CurrentUser(identity): CurrentUser,
    WithRejection(Path(id), _): WithRejection<Path<String>, AppError>,
) -> Result<impl IntoResponse, AppError> {
    let conversation = state.conversations.restore(&identity, &id).await?;
    let notification = state.notifier.lifecycle(
        LifecycleChange::Restored,
        &conversation,
        &identity.user_id,
        None,
    )?;
    state.notifier.dispatch(notification.envelopes).await;

    Ok(ApiResponse::ok(notification.data))
}

/// DELETE /api/conversations/:id
pub async fn delete_conversation(
    State(state): State<AppState>,
    CurrentUser(identity): CurrentUser,
    WithRejection(Path(id), _): WithRejection<Path<String>, AppError>,
) -> Result<impl IntoResponse, AppError> {
    let conversation = state.conversations.delete(&identity, &id).await?;
    let notification = state.notifier.lifecycle(
        LifecycleChange::Deleted,
        &conversation,
        &identity.user_id,
        None,
    )?;
    state.notifier.dispatch(notification.envelopes).await;

    Ok(ApiResponse::ok(notification.data))
}
