use crate::api::errors::error_response;
use crate::auth::extract_bearer_token;
use crate::state::AppState;
use crate::storage::UserAccountRecord;
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;

pub struct ResolvedUser {
    pub user: UserAccountRecord,
}

pub fn resolve_user(state: &AppState, headers: &HeaderMap) -> Result<ResolvedUser, Response> {
    let Some(token) = extract_bearer_token(headers) else {
        return Err(error_response(
            StatusCode::UNAUTHORIZED,
            "missing bearer token",
        ));
    };
    let user = state
        .user_store
        .authenticate_token(&token)
        .map_err(|err| error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?;
    match user {
        Some(user) => Ok(ResolvedUser { user }),
        None => Err(error_response(
            StatusCode::UNAUTHORIZED,
            "invalid or expired token",
        )),
    }
}
