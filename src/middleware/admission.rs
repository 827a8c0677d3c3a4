use std::sync::Arc;

use axum::{
    body::{Body, to_bytes},
    extract::State,
    http::Request,
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::{
    error::GovernanceError,
    governance::{GovernanceService, RequestProfile},
    utils::{PROVIDER_HEADER, header_str},
};

/// token 准入中间件
///
/// 估算请求成本后向治理服务申请准入；排队时在此挂起，放行后凭证一直持有到下游返回。
pub async fn admission(
    State(service): State<Arc<GovernanceService>>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let (parts, body) = req.into_parts();
    let limit = service.settings().max_body_bytes;
    let bytes = match to_bytes(body, limit).await {
        Ok(b) => b,
        Err(e) => {
            tracing::debug!("Failed to buffer request body: {}", e);
            return GovernanceError::PayloadTooLarge { limit }.into_response();
        }
    };

    let profile = RequestProfile::from_request(&parts.headers, &bytes);
    let provider_override = header_str(&parts.headers, &PROVIDER_HEADER);

    let permit = match service
        .admit(profile.model.as_deref(), provider_override, profile.estimated_tokens)
        .await
    {
        Ok(permit) => permit,
        Err(e) => {
            tracing::info!(
                model = ?profile.model,
                tokens = profile.estimated_tokens,
                "Request not admitted: {}",
                e
            );
            return e.into_response();
        }
    };

    let req = Request::from_parts(parts, Body::from(bytes));
    let response = next.run(req).await;
    drop(permit);
    response
}
