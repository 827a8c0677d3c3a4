use std::time::Duration;

use axum::Json;
use axum::{
    http::{HeaderValue, StatusCode, header::RETRY_AFTER},
    response::{IntoResponse, Response},
};
use serde_json::{Map, json};

use crate::utils::{error_body, error_codes};

/// 触发限流的维度
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitKind {
    Tokens,
    Requests,
    Concurrency,
}

impl LimitKind {
    pub fn code(self) -> &'static str {
        match self {
            LimitKind::Tokens => error_codes::TPM_LIMIT_EXCEEDED,
            LimitKind::Requests => error_codes::RPM_LIMIT_EXCEEDED,
            LimitKind::Concurrency => error_codes::CONCURRENCY_LIMIT_EXCEEDED,
        }
    }
}

/// 面向调用方的治理层错误
#[derive(Debug, thiserror::Error)]
pub enum GovernanceError {
    #[error("Idempotency-Key header is required for this method")]
    IdempotencyKeyRequired,

    #[error("Idempotency-Key must be a UUIDv4")]
    InvalidIdempotencyKey,

    #[error("rate limit exceeded for provider {provider}")]
    RateLimited {
        provider: String,
        kind: LimitKind,
        limit: u64,
        retry_after: Duration,
    },

    #[error("request waited {waited:?} in the {provider} queue without capacity")]
    QueueTimeout { provider: String, waited: Duration },

    #[error("model {model} is not mapped to any provider")]
    UnknownProvider { model: String },

    #[error("request body exceeds {limit} bytes")]
    PayloadTooLarge { limit: usize },

    #[error("upstream request failed: {0}")]
    Upstream(String),
}

/// 标记治理层自身产生的拒绝响应，幂等层不缓存这类响应
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GovernanceRejection;

impl IntoResponse for GovernanceError {
    fn into_response(self) -> Response {
        let message = self.to_string();
        let mut extra = Map::new();

        let (status, code, retry_after) = match &self {
            GovernanceError::IdempotencyKeyRequired => {
                (StatusCode::BAD_REQUEST, error_codes::IDEMPOTENCY_KEY_REQUIRED, None)
            }
            GovernanceError::InvalidIdempotencyKey => {
                (StatusCode::BAD_REQUEST, error_codes::INVALID_IDEMPOTENCY_KEY, None)
            }
            GovernanceError::RateLimited {
                provider,
                kind,
                limit,
                retry_after,
            } => {
                extra.insert("provider".into(), json!(provider));
                extra.insert("limit".into(), json!(limit));
                extra.insert("retryAfter".into(), json!(retry_after.as_secs()));
                (StatusCode::TOO_MANY_REQUESTS, kind.code(), Some(*retry_after))
            }
            GovernanceError::QueueTimeout { provider, waited } => {
                extra.insert("provider".into(), json!(provider));
                extra.insert("waitedMs".into(), json!(waited.as_millis() as u64));
                (StatusCode::TOO_MANY_REQUESTS, error_codes::QUEUE_TIMEOUT, None)
            }
            GovernanceError::UnknownProvider { model } => {
                extra.insert("model".into(), json!(model));
                (StatusCode::FORBIDDEN, error_codes::UNKNOWN_PROVIDER, None)
            }
            GovernanceError::PayloadTooLarge { .. } => {
                (StatusCode::PAYLOAD_TOO_LARGE, error_codes::PAYLOAD_TOO_LARGE, None)
            }
            GovernanceError::Upstream(_) => (StatusCode::BAD_GATEWAY, error_codes::UPSTREAM_ERROR, None),
        };

        // 上游错误属于下游处理结果，照常缓存
        let rejection = !matches!(self, GovernanceError::Upstream(_));

        let mut response = (status, Json(error_body(code, message, extra))).into_response();
        if rejection {
            response.extensions_mut().insert(GovernanceRejection);
        }
        if let Some(retry_after) = retry_after {
            if let Ok(value) = HeaderValue::from_str(&retry_after.as_secs().to_string()) {
                response.headers_mut().insert(RETRY_AFTER, value);
            }
        }
        response
    }
}
