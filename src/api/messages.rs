//! Message endpoints

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json},
};
use axum_extra::extract::WithRejection;

use super::dto::{ApiResponse, EditMessageRequest, ReactRequest, SendMessageRequest};
use crate::service::NewMessage;
use crate::{AppState, auth::CurrentUser, error::AppError};

/// POST /api/messages
pub async fn send_message(
    State(state): State<AppState>,
    CurrentUser(identity): CurrentUser,
    WithRejection(Json(req), _): WithRejection<Json<SendMessageRequest>, AppError>,
) -> Result<impl IntoResponse, AppError> {
    let outcome = state
        .messages
        .send(
            &identity.user_id,
            NewMessage {
                conversation_id: req.conversation_id,
                content: req.content,
                message_type: req.message_type,
                attachments: req.attachments,
                reply_to_id: req.reply_to,
            },
        )
        .await?;
    let notification = state.notifier.message_sent(&outcome, None).await?;
    state.notifier.dispatch(notification.envelopes).await;

    Ok((StatusCode::CREATED, ApiResponse::ok(notification.data)))
}

/// PUT /api/messages/:id
pub async fn edit_message(
    State(state): State<AppState>,
    CurrentUser(identity): CurrentUser,
    WithRejection(Path(id), _): WithRejection<Path<String>, AppError>,
    WithRejection(Json(req), _): WithRejection<Json<EditMessageRequest>, AppError>,
) -> Result<impl IntoResponse, AppError> {
    let message = state
        .messages
        .edit(&identity.user_id, &id, &req.content)
        .await?;
    let notification = state.notifier.message_edited(&message, None).await?;
    state.notifier.dispatch(notification.envelopes).await;

    Ok(ApiResponse::ok(notification.data))
}

/// DELETE /api/messages/:id
pub async fn delete_message(
    State(state): State<AppState>,
    CurrentUser(identity): CurrentUser,
    WithRejection(Path(id), _): WithRejection<Path<String>, AppError>,
) -> Result<impl IntoResponse, AppError> {
    let deleted = state.messages.delete(&identity.user_id, &id).await?;
    let notification = state.notifier.message_deleted(&deleted, None).await?;
    state.notifier.dispatch(notification.envelopes).await;

    Ok(ApiResponse::ok(notification.data))
}

/// POST /api/messages/:id/reactions
pub async fn react_to_message(
    State(state): State<AppState>,
    CurrentUser(identity): CurrentUser,
    WithRejection(Path(id), _): WithRejection<Path<String>, AppError>,
    WithRejection(Json(req), _): WithRejection<Json<ReactRequest>, AppError>,
) -> Result<impl IntoResponse, AppError> {
    let outcome = state
        .messages
        .react(&identity.user_id, &id, &req.emoji)
        .await?;
    let notification = state
        .notifier
        .reaction_changed(&outcome, &identity.user_id, None)
        .await?;
    state.notifier.dispatch(notification.envelopes).await;

    Ok(ApiResponse::ok(serde_json::json!({
        "change": outcome.change,
        "message": notification.data,
    })))
}
