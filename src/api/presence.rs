//! Presence query

use axum::{
    extract::{Path, State},
    response::IntoResponse,
};
use axum_extra::extract::WithRejection;

use super::dto::{ApiResponse, PresenceResponse};
use crate::{AppState, auth::CurrentUser, error::AppError};

/// GET /api/users/:id/presence
///
/// Online flag from this process's tracker; last seen falls back to the
/// user directory.
pub async fn get_presence(
    State(state): State<AppState>,
    CurrentUser(_identity): CurrentUser,
    WithRejection(Path(id), _): WithRejection<Path<String>, AppError>,
) -> Result<impl IntoResponse, AppError> {
    let user = state.db.get_user(&id).await?.ok_or(AppError::NotFound)?;
    let snapshot = state.presence.snapshot(&id).await;

    Ok(ApiResponse::ok(PresenceResponse {
        user_id: user.id,
        is_online: snapshot.is_online,
        last_seen: snapshot.last_seen.or(user.last_seen),
    }))
}
