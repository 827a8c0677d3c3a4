use std::sync::Arc;

use axum::{
    body::{Body, HttpBody as _, to_bytes},
    extract::State,
    http::{Request, header},
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::{
    cache::{CachedResponse, keys},
    error::{GovernanceError, GovernanceRejection},
    governance::{GovernanceService, service::GovernanceMetrics},
    utils::{IDEMPOTENCY_KEY_HEADER, header_str, is_uuid_v4},
};

/// 幂等中间件
///
/// 仅作用于配置的高风险方法：缺少或格式错误的键直接拒绝；命中缓存时重放原响应，
/// 不调用下游；未命中时执行下游并缓存其状态码与响应体。下游错误同样缓存，
/// 治理层自身的拒绝（限流、排队超时等）不缓存。
pub async fn idempotency(
    State(service): State<Arc<GovernanceService>>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let settings = service.settings();
    if !settings.requires_idempotency(req.method()) {
        return next.run(req).await;
    }

    let key = match header_str(req.headers(), &IDEMPOTENCY_KEY_HEADER) {
        Some(key) => key.to_string(),
        None => {
            tracing::debug!(method = %req.method(), path = %req.uri().path(), "Missing idempotency key");
            return GovernanceError::IdempotencyKeyRequired.into_response();
        }
    };
    if !is_uuid_v4(&key) {
        return GovernanceError::InvalidIdempotencyKey.into_response();
    }

    let store_key = keys::idempotency_key(&settings.key_prefix, &key);
    // 同键请求在本进程内排队，保证后到者看到先到者的结果
    let _guard = service.key_locks().acquire(&store_key).await;

    match service.idempotency().get(&store_key).await {
        Ok(Some(cached)) => {
            GovernanceMetrics::incr(&service.metrics().replayed);
            tracing::info!(key = %key, status = cached.status_code, "Replaying cached response");
            return cached.into_response();
        }
        Ok(None) => {}
        Err(e) => {
            tracing::warn!(key = %key, error = %e, "Idempotency lookup failed, treating as miss");
        }
    }

    let response = next.run(req).await;

    // 治理层的拒绝只是重试提示，不占用幂等键
    if response.extensions().get::<GovernanceRejection>().is_some() {
        tracing::debug!(key = %key, status = %response.status(), "Not caching governance rejection");
        return response;
    }

    let (mut parts, body) = response.into_parts();
    let limit = settings.max_body_bytes;

    // 已知超出上限的响应体原样透传，不缓存
    if body.size_hint().lower() > limit as u64 {
        tracing::warn!(key = %key, limit, "Response too large to cache, passing through");
        parts.headers.remove(header::CONTENT_LENGTH);
        return Response::from_parts(parts, body);
    }

    let bytes = match to_bytes(body, limit).await {
        Ok(b) => b,
        Err(e) => {
            tracing::error!(key = %key, limit, "Failed to capture response body: {}", e);
            return GovernanceError::Upstream(format!("response body could not be captured: {}", e))
                .into_response();
        }
    };

    let cached = CachedResponse::new(parts.status, parts.headers.get(header::CONTENT_TYPE), &bytes);
    match service
        .idempotency()
        .set(&store_key, &cached, settings.ttl)
        .await
    {
        Ok(true) => {
            GovernanceMetrics::incr(&service.metrics().cached);
            tracing::debug!(key = %key, status = cached.status_code, "Cached response");
        }
        Ok(false) => {
            // 其他实例已先写入，保留先写者
            tracing::debug!(key = %key, "Response already cached by another writer");
        }
        Err(e) => {
            tracing::warn!(key = %key, error = %e, "Failed to cache response");
        }
    }

    // 重新构建响应体
    parts.headers.remove(header::CONTENT_LENGTH);
    Response::from_parts(parts, Body::from(bytes))
}
