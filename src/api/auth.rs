use crate::api::context::resolve_user;
use crate::api::errors::error_response;
use crate::state::AppState;
use crate::user_store::UserStore;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use axum::{routing::get, routing::post, Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/courier/auth/register", post(register))
        .route("/courier/auth/login", post(login))
        .route("/courier/auth/me", get(me))
}

#[derive(Debug, Deserialize)]
struct RegisterRequest {
    username: String,
    password: String,
}

#[derive(Debug, Deserialize)]
struct LoginRequest {
    username: String,
    password: String,
}

async fn register(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<RegisterRequest>,
) -> Result<Json<serde_json::Value>, Response> {
    let username = payload.username.trim();
    let password = payload.password.trim();
    if username.is_empty() || password.is_empty() {
        return Err(error_response(
            StatusCode::BAD_REQUEST,
            "username and password are required",
        ));
    }
    state
        .user_store
        .create_user(username, password, vec!["user".to_string()])
        .map_err(|err| error_response(StatusCode::BAD_REQUEST, err.to_string()))?;
    let session = state
        .user_store
        .login(username, password)
        .map_err(|err| error_response(StatusCode::UNAUTHORIZED, err.to_string()))?;
    Ok(Json(auth_response(session.user, session.token.token)))
}

async fn login(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<LoginRequest>,
) -> Result<Json<serde_json::Value>, Response> {
    let username = payload.username.trim();
    let password = payload.password.trim();
    if username.is_empty() || password.is_empty() {
        return Err(error_response(
            StatusCode::BAD_REQUEST,
            "username and password are required",
        ));
    }
    let session = state
        .user_store
        .login(username, password)
        .map_err(|err| error_response(StatusCode::UNAUTHORIZED, err.to_string()))?;
    Ok(Json(auth_response(session.user, session.token.token)))
}

async fn me(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, Response> {
    let resolved = resolve_user(&state, &headers)?;
    Ok(Json(
        json!({ "data": UserStore::to_profile(&resolved.user) }),
    ))
}

fn auth_response(user: crate::storage::UserAccountRecord, token: String) -> serde_json::Value {
    json!({
        "data": {
            "access_token": token,
            "user": UserStore::to_profile(&user)
        }
    })
}
