use axum::{
    extract::{Json, State},
    http::{HeaderMap, StatusCode, header::AUTHORIZATION},
    response::{IntoResponse, Response},
};

use super::model::ChatCompletionRequest;
use crate::{
    AppState,
    error::GovernanceError,
    utils::{PROVIDER_HEADER, header_str},
};

/// 转发对话请求到供应商上游
///
/// 准入与幂等由路由层中间件处理，这里只负责转发。
#[axum::debug_handler]
pub async fn chat_completion(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<ChatCompletionRequest>,
) -> Result<Response, GovernanceError> {
    let provider = state
        .governance
        .registry()
        .resolve(Some(&req.model), header_str(&headers, &PROVIDER_HEADER))
        .map(str::to_string)
        .ok_or_else(|| GovernanceError::UnknownProvider {
            model: req.model.clone(),
        })?;

    let base = state
        .config
        .provider_upstreams
        .get(&provider)
        .ok_or_else(|| GovernanceError::Upstream(format!("no upstream configured for {}", provider)))?;
    let url = format!("{}/chat/completions", base.trim_end_matches('/'));

    let mut upstream = state.http.post(&url).json(&req);
    if let Some(auth) = headers.get(AUTHORIZATION) {
        upstream = upstream.header(AUTHORIZATION, auth.clone());
    }

    let resp = upstream.send().await.map_err(|e| {
        tracing::error!(provider = %provider, "Upstream request failed: {}", e);
        GovernanceError::Upstream(e.to_string())
    })?;

    let status = resp.status();
    let body: serde_json::Value = resp
        .json()
        .await
        .map_err(|e| GovernanceError::Upstream(format!("invalid upstream body: {}", e)))?;

    if !status.is_success() {
        tracing::warn!(provider = %provider, %status, "Upstream returned an error");
    }

    let status = StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    Ok((status, Json(body)).into_response())
}
