use axum::{
    extract::{Json, State},
    response::IntoResponse,
};
use serde_json::json;

use crate::AppState;

pub async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

/// 治理层计数与各供应商当前用量
pub async fn stats(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.governance.stats().await)
}
