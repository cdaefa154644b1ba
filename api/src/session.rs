use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{header, request::Parts, HeaderMap, StatusCode},
};

use crate::AppState;

pub(crate) fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .filter(|token| !token.is_empty())
}

/// The signed-in user, resolved from the `Authorization: Bearer <session>`
/// header against the `sessions` table. Rejects with 401 when the session is
/// missing, unknown or expired.
#[derive(Debug, Clone, PartialEq)]
pub struct CurrentUser(pub String);

#[async_trait]
impl FromRequestParts<AppState> for CurrentUser {
    type Rejection = StatusCode;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let Some(session_token) = bearer_token(&parts.headers) else {
            return Err(StatusCode::UNAUTHORIZED);
        };

        match state.services.store.session_user(session_token).await {
            Ok(Some(user_id)) => Ok(CurrentUser(user_id)),
            Ok(None) => {
                tracing::debug!("rejected unknown or expired session");
                Err(StatusCode::UNAUTHORIZED)
            }
            Err(e) => {
                tracing::error!("failed to resolve session: {:#}", e);
                Err(StatusCode::INTERNAL_SERVER_ERROR)
            }
        }
    }
}
