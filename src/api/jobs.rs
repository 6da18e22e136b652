use crate::api::context::resolve_user;
use crate::api::errors::error_response;
use crate::state::AppState;
use crate::user_store::UserStore;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use axum::{routing::get, Json, Router};
use serde_json::{json, Value};
use std::sync::Arc;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/courier/jobs/{job_id}", get(get_job))
}

/// "Does not exist" and "exists but not owned" are indistinguishable for
/// non-privileged requesters.
async fn get_job(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(job_id): Path<String>,
) -> Result<Json<Value>, Response> {
    let resolved = resolve_user(&state, &headers)?;
    let privileged = UserStore::is_privileged(&resolved.user);
    let job = state
        .jobs
        .query_for(&job_id, &resolved.user.user_id, privileged)
        .map_err(|err| error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?;
    let Some(job) = job else {
        return Err(error_response(StatusCode::NOT_FOUND, "Job not found"));
    };
    Ok(Json(json!({
        "job_id": job.job_id,
        "type": job.job_type,
        "status": job.status.as_str(),
        "error": job.error,
    })))
}
