// API 路由汇总入口，按领域拆分以保持结构清晰。
pub mod accounts;
pub mod auth;
pub mod commands;
mod context;
pub mod errors;
pub mod jobs;

use crate::state::AppState;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use std::sync::Arc;

pub fn build_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(health))
        .merge(auth::router())
        .merge(accounts::router())
        .merge(commands::router())
        .merge(jobs::router())
}

async fn health() -> Json<Value> {
    Json(json!({ "ok": true }))
}
