//! Authentication middleware
//!
//! Resolves the bearer credential of a request into an [`Identity`].

use axum::{
    async_trait,
    extract::{FromRef, FromRequestParts, State},
    http::{HeaderMap, Request, request::Parts},
    middleware::Next,
    response::Response,
};
use axum_extra::extract::CookieJar;

use super::Identity;
use super::token::verify_access_token;
use crate::AppState;
use crate::error::AppError;

/// Extract a bearer credential from `Authorization` or the `session` cookie
pub fn extract_token_from_headers(headers: &HeaderMap) -> Option<String> {
    headers
        .get("Authorization")
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(ToOwned::to_owned)
        .or_else(|| {
            let jar = CookieJar::from_headers(headers);
            jar.get("session").map(|cookie| cookie.value().to_owned())
        })
}

/// Authenticate a credential
///
/// The token must verify and name a user known to the user directory.
pub async fn authenticate_token(token: &str, state: &AppState) -> Result<Identity, AppError> {
    let claims = verify_access_token(token, &state.config.auth.token_secret)?;

    if state.db.get_user(&claims.user_id).await?.is_none() {
        tracing::debug!(user_id = %claims.user_id, "Token names an unknown user");
        return Err(AppError::Unauthorized);
    }

    Ok(Identity {
        user_id: claims.user_id,
        role: claims.role,
    })
}

/// Middleware to require authentication
///
/// Adds the resolved [`Identity`] to request extensions.
///
/// # Usage
/// ```ignore
/// let protected_routes = Router::new()
///     .route("/metrics", ...)
///     .layer(middleware::from_fn_with_state(state, require_auth));
/// ```
pub async fn require_auth(
    State(state): State<AppState>,
    mut request: Request<axum::body::Body>,
    next: Next,
) -> Result<Response, AppError> {
    let token = extract_token_from_headers(request.headers()).ok_or(AppError::Unauthorized)?;
    let identity = authenticate_token(&token, &state).await?;
    request.extensions_mut().insert(identity);

    Ok(next.run(request).await)
}

/// Extractor for current authenticated user
///
/// # Usage
/// ```ignore
/// async fn handler(CurrentUser(identity): CurrentUser) -> impl IntoResponse {
///     format!("Hello, {}", identity.user_id)
/// }
/// ```
#[derive(Debug, Clone)]
pub struct CurrentUser(pub Identity);

#[async_trait]
impl<S> FromRequestParts<S> for CurrentUser
where
    AppState: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        if let Some(identity) = parts.extensions.get::<Identity>().cloned() {
            return Ok(CurrentUser(identity));
        }

        let state = AppState::from_ref(state);
        let token = extract_token_from_headers(&parts.headers).ok_or(AppError::Unauthorized)?;
        let identity = authenticate_token(&token, &state).await?;
        parts.extensions.insert(identity.clone());

        Ok(CurrentUser(identity))
    }
}
