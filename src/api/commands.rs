use crate::api::context::resolve_user;
use crate::api::errors::{error_response, error_response_with_code};
use crate::intake::{SubmitOutcome, SubmitRequest};
use crate::queue::AccountSelector;
use crate::state::AppState;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use axum::{routing::post, Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/courier/commands", post(submit_command))
}

#[derive(Debug, Deserialize)]
struct SubmitCommandRequest {
    #[serde(rename = "type")]
    command_type: String,
    idempotency_key: String,
    #[serde(default)]
    payload: Value,
    #[serde(default)]
    account_selector: Option<AccountSelector>,
}

async fn submit_command(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<SubmitCommandRequest>,
) -> Result<Json<Value>, Response> {
    let resolved = resolve_user(&state, &headers)?;
    if payload.idempotency_key.trim().is_empty() {
        return Err(error_response_with_code(
            StatusCode::BAD_REQUEST,
            Some("VALIDATION_ERROR"),
            "idempotency_key is required",
        ));
    }

    let outcome = state
        .intake
        .submit(SubmitRequest {
            user_id: resolved.user.user_id.clone(),
            idempotency_key: payload.idempotency_key,
            command_type: payload.command_type,
            payload: payload.payload,
            account_selector: payload.account_selector,
        })
        .await
        // Internal fault detail stays server-side; the submission boundary
        // only ever reports rejection categories.
        .map_err(|err| {
            tracing::error!("command submission failed: {err}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
        })?;

    match outcome {
        SubmitOutcome::Accepted { job_id } | SubmitOutcome::Duplicate { job_id } => {
            Ok(Json(json!({ "job_id": job_id, "status": "PENDING" })))
        }
        SubmitOutcome::NotLinkedYet => Err(error_response_with_code(
            StatusCode::CONFLICT,
            Some("CONFLICT"),
            "command accepted by a concurrent submission, retry shortly",
        )),
        SubmitOutcome::UnknownType(command_type) => Err(error_response_with_code(
            StatusCode::BAD_REQUEST,
            Some("UNKNOWN_COMMAND_TYPE"),
            format!("unknown command type: {command_type}"),
        )),
        SubmitOutcome::MissingSelector(command_type) => Err(error_response_with_code(
            StatusCode::BAD_REQUEST,
            Some("VALIDATION_ERROR"),
            format!("command type {command_type} requires an account_selector"),
        )),
    }
}
