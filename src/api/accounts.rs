use crate::api::context::resolve_user;
use crate::api::errors::{error_response, error_response_with_code};
use crate::connectors::LoginContext;
use crate::queue::AccountSelector;
use crate::state::AppState;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use axum::{routing::get, routing::post, Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/courier/accounts", post(create_account).get(list_accounts))
        .route("/courier/accounts/test_login", post(test_login))
}

#[derive(Debug, Deserialize)]
struct CreateAccountRequest {
    site: String,
    account_name: String,
    secrets: Value,
    #[serde(default)]
    meta: Option<Value>,
}

async fn create_account(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<CreateAccountRequest>,
) -> Result<Json<Value>, Response> {
    let resolved = resolve_user(&state, &headers)?;
    let record = state
        .accounts
        .create(
            &resolved.user.user_id,
            &payload.site,
            &payload.account_name,
            &payload.secrets,
            payload.meta,
        )
        .map_err(|err| error_response(StatusCode::BAD_REQUEST, err.to_string()))?;
    Ok(Json(json!({
        "data": {
            "id": record.account_id,
            "site": record.site,
            "account_name": record.account_name,
        }
    })))
}

#[derive(Debug, Deserialize)]
struct ListAccountsQuery {
    #[serde(default)]
    site: Option<String>,
}

async fn list_accounts(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ListAccountsQuery>,
) -> Result<Json<Value>, Response> {
    let resolved = resolve_user(&state, &headers)?;
    let records = state
        .accounts
        .list(&resolved.user.user_id, query.site.as_deref())
        .map_err(|err| error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?;
    let items: Vec<Value> = records
        .iter()
        .map(|record| {
            json!({
                "id": record.account_id,
                "site": record.site,
                "account_name": record.account_name,
            })
        })
        .collect();
    Ok(Json(json!({ "data": items })))
}

#[derive(Debug, Deserialize)]
struct TestLoginRequest {
    account_selector: AccountSelector,
}

/// Probe the stored credentials without touching the session cache, so a
/// bad password surfaces before any command is submitted.
async fn test_login(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<TestLoginRequest>,
) -> Result<Json<Value>, Response> {
    let resolved = resolve_user(&state, &headers)?;
    let account = state
        .accounts
        .resolve(&resolved.user.user_id, &payload.account_selector)
        .map_err(|err| error_response(StatusCode::NOT_FOUND, err.to_string()))?;
    let credentials = state
        .accounts
        .credentials(&account)
        .map_err(|err| error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?;
    let connector = state.connectors.get(&account.site).ok_or_else(|| {
        error_response(
            StatusCode::BAD_REQUEST,
            format!("connector not registered: {}", account.site),
        )
    })?;
    let outcome = connector
        .login(LoginContext {
            http: &state.http,
            account: &account,
            credentials: &credentials,
        })
        .await
        .map_err(|err| error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?;
    if outcome.needs_user_action {
        return Err(error_response_with_code(
            StatusCode::BAD_REQUEST,
            Some("PENDING_USER_ACTION"),
            format!("pending_user_action: {}", outcome.error),
        ));
    }
    if !outcome.ok {
        return Err(error_response_with_code(
            StatusCode::BAD_REQUEST,
            Some("LOGIN_FAILED"),
            format!("login_failed: {}", outcome.error),
        ));
    }
    Ok(Json(json!({ "ok": true })))
}
